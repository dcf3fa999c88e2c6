//! 软件模拟引擎
//!
//! 不依赖任何音频硬件，行为与真实低延迟引擎一致：
//! - 回调模式：独立引擎线程每个 burst 调用一次桥接回调
//! - 写入模式：调用方写入 lock-free ring buffer，引擎线程按 burst 取走；
//!   取数时不足一个 burst 记一次 underrun
//!
//! `SimulatedControl` 用于注入故障（打开失败、xrun 查询错误、写入结果）
//! 并观察引擎侧的调用次数。

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::{codes, AudioBackend, NativeStream, StreamMode, XrunSource};
use crate::audio::callback::{CallbackAction, DataCallbackBridge};
use crate::audio::config::{default_frames_per_burst, StreamConfig};
use crate::audio::error::BackendError;
use crate::audio::format::StreamFormat;
use crate::audio::ring_buffer::RingBuffer;

/// 引擎线程节拍
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Pacing {
    /// 按采样率实时推进
    #[default]
    Realtime,
    /// 尽快推进（测试用）
    FreeRunning,
}

/// 模拟引擎配置
#[derive(Clone, Debug)]
pub struct SimulatedOptions {
    pub pacing: Pacing,
    /// 覆盖进程级 burst 默认值
    pub frames_per_burst: Option<i32>,
    pub native_sample_rate: Option<u32>,
    pub xrun_count_supported: bool,
    /// 引擎线程尝试提升调度优先级
    pub raise_thread_priority: bool,
}

impl Default for SimulatedOptions {
    fn default() -> Self {
        Self {
            pacing: Pacing::Realtime,
            frames_per_burst: None,
            native_sample_rate: Some(48000),
            xrun_count_supported: true,
            raise_thread_priority: true,
        }
    }
}

impl SimulatedOptions {
    /// 测试用：不按实时节拍、固定 burst、不改线程优先级
    pub fn free_running(frames_per_burst: i32) -> Self {
        Self {
            pacing: Pacing::FreeRunning,
            frames_per_burst: Some(frames_per_burst),
            raise_thread_priority: false,
            ..Default::default()
        }
    }
}

/// 故障注入与观察
#[derive(Default)]
pub struct SimulatedControl {
    open_error: Mutex<Option<BackendError>>,
    write_result: Mutex<Option<Result<i32, BackendError>>>,

    xrun_forced: AtomicBool,
    xrun_forced_value: AtomicI32,
    /// 非 0 时 xrun 查询返回该错误码
    xrun_error_code: AtomicI32,

    control_queries: AtomicU64,
    callback_queries: AtomicU64,
    streams_opened: AtomicU64,
    streams_closed: AtomicU64,
}

impl SimulatedControl {
    /// 下一次打开失败（一次性）
    pub fn fail_next_open(&self, error: BackendError) {
        if let Ok(mut slot) = self.open_error.lock() {
            *slot = Some(error);
        }
    }

    fn take_open_error(&self) -> Option<BackendError> {
        self.open_error.lock().ok().and_then(|mut slot| slot.take())
    }

    /// 之后所有写入都直接返回该结果
    pub fn force_write_result(&self, result: Option<Result<i32, BackendError>>) {
        if let Ok(mut slot) = self.write_result.lock() {
            *slot = result;
        }
    }

    fn forced_write_result(&self) -> Option<Result<i32, BackendError>> {
        self.write_result.lock().ok().and_then(|slot| slot.clone())
    }

    /// 强制 xrun 查询返回该值（None 恢复为引擎真实计数）
    pub fn force_xrun_count(&self, count: Option<i32>) {
        if let Some(n) = count {
            self.xrun_forced_value.store(n, Ordering::Relaxed);
        }
        self.xrun_forced.store(count.is_some(), Ordering::Release);
    }

    /// 强制 xrun 查询失败（0 表示恢复正常）
    pub fn fail_xrun_queries(&self, code: i32) {
        self.xrun_error_code.store(code, Ordering::Release);
    }

    /// 调用方线程发起的 xrun 查询次数
    pub fn control_queries(&self) -> u64 {
        self.control_queries.load(Ordering::Acquire)
    }

    /// 引擎回调内发起的 xrun 查询次数
    pub fn callback_queries(&self) -> u64 {
        self.callback_queries.load(Ordering::Acquire)
    }

    pub fn streams_opened(&self) -> u64 {
        self.streams_opened.load(Ordering::Acquire)
    }

    pub fn streams_closed(&self) -> u64 {
        self.streams_closed.load(Ordering::Acquire)
    }
}

/// 模拟引擎
pub struct SimulatedBackend {
    options: SimulatedOptions,
    control: Arc<SimulatedControl>,
    default_burst: AtomicI32,
}

impl SimulatedBackend {
    pub fn new(options: SimulatedOptions) -> Self {
        Self {
            options,
            control: Arc::new(SimulatedControl::default()),
            default_burst: AtomicI32::new(default_frames_per_burst()),
        }
    }

    pub fn control(&self) -> Arc<SimulatedControl> {
        Arc::clone(&self.control)
    }
}

impl AudioBackend for SimulatedBackend {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn set_default_frames_per_burst(&self, frames: i32) {
        self.default_burst.store(frames, Ordering::Release);
    }

    fn native_sample_rate(&self) -> Option<u32> {
        self.options.native_sample_rate
    }

    fn open_stream(
        &self,
        config: &StreamConfig,
        mode: StreamMode,
    ) -> Result<Box<dyn NativeStream>, BackendError> {
        if let Some(error) = self.control.take_open_error() {
            return Err(error);
        }
        if config.validate().is_err() {
            return Err(BackendError::new(codes::ERROR_INTERNAL, "invalid stream parameters"));
        }

        let burst = self
            .options
            .frames_per_burst
            .unwrap_or_else(|| self.default_burst.load(Ordering::Acquire))
            .max(1);
        let format = config.stream_format();

        let driver = match mode {
            StreamMode::Callback(bridge) => Driver::Callback(Some(bridge)),
            StreamMode::Write => {
                let samples = format.samples_for(config.buffer_capacity_frames as usize);
                let ring = RingBuffer::with_min_capacity(samples);
                ring.lock_memory();
                Driver::Write(Arc::new(ring))
            }
        };

        self.control.streams_opened.fetch_add(1, Ordering::AcqRel);

        Ok(Box::new(SimulatedStream {
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                xruns: AtomicI32::new(0),
                control: Arc::clone(&self.control),
            }),
            driver,
            format,
            burst,
            capacity: config.buffer_capacity_frames,
            options: self.options.clone(),
            engine_thread: None,
        }))
    }
}

/// 引擎线程与控制线程共享的状态
struct Shared {
    running: AtomicBool,
    closed: AtomicBool,
    xruns: AtomicI32,
    control: Arc<SimulatedControl>,
}

impl Shared {
    fn query_xruns(&self, from_callback: bool) -> Result<i32, BackendError> {
        let counter = if from_callback {
            &self.control.callback_queries
        } else {
            &self.control.control_queries
        };
        counter.fetch_add(1, Ordering::AcqRel);

        let code = self.control.xrun_error_code.load(Ordering::Acquire);
        if code != 0 {
            return Err(BackendError::new(code, "xrun query failed"));
        }
        if self.control.xrun_forced.load(Ordering::Acquire) {
            return Ok(self.control.xrun_forced_value.load(Ordering::Relaxed));
        }
        Ok(self.xruns.load(Ordering::Relaxed))
    }
}

/// 回调线程内使用的查询入口
struct CallbackXruns<'a>(&'a Shared);

impl XrunSource for CallbackXruns<'_> {
    fn xrun_count(&self) -> Result<i32, BackendError> {
        self.0.query_xruns(true)
    }
}

enum Driver {
    /// 启动时移入引擎线程
    Callback(Option<DataCallbackBridge>),
    Write(Arc<RingBuffer<i16>>),
}

/// 模拟的原生流
pub struct SimulatedStream {
    shared: Arc<Shared>,
    driver: Driver,
    format: StreamFormat,
    burst: i32,
    capacity: i32,
    options: SimulatedOptions,
    engine_thread: Option<JoinHandle<()>>,
}

impl SimulatedStream {
    fn spawn_engine_thread(&mut self) -> Result<JoinHandle<()>, BackendError> {
        let shared = Arc::clone(&self.shared);
        let format = self.format;
        let burst = self.burst as usize;
        let pacing = self.options.pacing;
        let raise_priority = self.options.raise_thread_priority;
        let period = Duration::from_nanos(format.frames_to_ns(burst as u64));

        let builder = thread::Builder::new().name("audio-engine".to_string());
        let spawned = match &mut self.driver {
            Driver::Callback(slot) => {
                let mut bridge = slot
                    .take()
                    .ok_or_else(|| BackendError::new(codes::ERROR_INVALID_STATE, "callback already consumed"))?;
                builder.spawn(move || {
                    if raise_priority {
                        raise_audio_thread_priority();
                    }
                    render_loop(&shared, &mut bridge, format, burst, pacing, period);
                })
            }
            Driver::Write(ring) => {
                let ring = Arc::clone(ring);
                builder.spawn(move || {
                    if raise_priority {
                        raise_audio_thread_priority();
                    }
                    drain_loop(&shared, &ring, format, burst, pacing, period);
                })
            }
        };

        spawned.map_err(|e| BackendError::new(codes::ERROR_INTERNAL, e.to_string()))
    }

    fn shutdown(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(handle) = self.engine_thread.take() {
            if handle.join().is_err() {
                log::error!("Engine thread panicked");
            }
        }
    }
}

impl XrunSource for SimulatedStream {
    fn xrun_count(&self) -> Result<i32, BackendError> {
        self.shared.query_xruns(false)
    }
}

impl NativeStream for SimulatedStream {
    fn request_start(&mut self) -> Result<(), BackendError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(BackendError::new(codes::ERROR_CLOSED, "stream closed"));
        }
        if self.engine_thread.is_some() {
            return Err(BackendError::new(codes::ERROR_INVALID_STATE, "stream already started"));
        }

        self.shared.running.store(true, Ordering::Release);
        match self.spawn_engine_thread() {
            Ok(handle) => {
                self.engine_thread = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.shared.running.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    fn close(&mut self) -> Result<(), BackendError> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Err(BackendError::new(codes::ERROR_CLOSED, "stream already closed"));
        }
        self.shutdown();
        // 未启动的回调流：桥接随流一起释放
        if let Driver::Callback(slot) = &mut self.driver {
            slot.take();
        }
        self.shared.control.streams_closed.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn is_xrun_count_supported(&self) -> bool {
        self.options.xrun_count_supported
    }

    fn buffer_capacity_in_frames(&self) -> i32 {
        self.capacity
    }

    fn buffer_size_in_frames(&self) -> i32 {
        self.capacity
    }

    fn frames_per_burst(&self) -> i32 {
        self.burst
    }

    fn write(
        &mut self,
        samples: &[i16],
        frame_count: usize,
        timeout: Option<Duration>,
    ) -> Result<i32, BackendError> {
        let ring = match &self.driver {
            Driver::Write(ring) => Arc::clone(ring),
            Driver::Callback(_) => {
                return Err(BackendError::new(codes::ERROR_UNIMPLEMENTED, "write on callback stream"))
            }
        };
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(BackendError::new(codes::ERROR_CLOSED, "stream closed"));
        }
        if let Some(result) = self.shared.control.forced_write_result() {
            return result;
        }

        let spf = self.format.samples_per_frame();
        let needed = (frame_count * spf).min(samples.len() / spf * spf);
        let data = &samples[..needed];
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut sent = 0;

        loop {
            // 只写整帧
            let room = ring.free_space() / spf * spf;
            let chunk = room.min(needed - sent);
            if chunk > 0 {
                sent += ring.push_slice(&data[sent..sent + chunk]);
            }
            if sent == needed {
                break;
            }
            if self.shared.closed.load(Ordering::Acquire) {
                break;
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    break;
                }
            }
            wait_for_space(
                (needed - sent) / spf,
                self.format.sample_rate,
                self.options.pacing,
            );
        }

        Ok((sent / spf) as i32)
    }
}

impl Drop for SimulatedStream {
    fn drop(&mut self) {
        if !self.shared.closed.load(Ordering::Acquire) {
            let _ = self.close();
        }
    }
}

/// 回调模式引擎线程
fn render_loop(
    shared: &Shared,
    bridge: &mut DataCallbackBridge,
    format: StreamFormat,
    burst: usize,
    pacing: Pacing,
    period: Duration,
) {
    // 循环外一次性分配
    let mut buffer = vec![0i16; format.samples_for(burst)];
    let source = CallbackXruns(shared);
    let mut next = Instant::now();

    while shared.running.load(Ordering::Acquire) {
        buffer.fill(0);
        if bridge.on_audio_ready(&source, &mut buffer, burst) == CallbackAction::Stop {
            break;
        }
        pace(pacing, &mut next, period);
    }

    shared.running.store(false, Ordering::Release);
}

/// 写入模式引擎线程
fn drain_loop(
    shared: &Shared,
    ring: &RingBuffer<i16>,
    format: StreamFormat,
    burst: usize,
    pacing: Pacing,
    period: Duration,
) {
    let mut scratch = vec![0i16; format.samples_for(burst)];
    let mut next = Instant::now();

    while shared.running.load(Ordering::Acquire) {
        let got = ring.pop_slice(&mut scratch);
        if got < scratch.len() {
            shared.xruns.fetch_add(1, Ordering::Relaxed);
        }
        pace(pacing, &mut next, period);
    }
}

#[inline]
fn pace(pacing: Pacing, next: &mut Instant, period: Duration) {
    match pacing {
        Pacing::FreeRunning => thread::yield_now(),
        Pacing::Realtime => {
            *next += period;
            let now = Instant::now();
            if *next > now {
                thread::sleep(*next - now);
            } else {
                // 落后时不追赶
                *next = now;
            }
        }
    }
}

/// 写入方等待 ring buffer 腾出空间
///
/// - < 50µs: 仅自旋
/// - 50-500µs: yield + 短自旋
/// - > 500µs: 睡眠预计时间的 70%
fn wait_for_space(frames_missing: usize, sample_rate: u32, pacing: Pacing) {
    if pacing == Pacing::FreeRunning || sample_rate == 0 {
        thread::yield_now();
        return;
    }

    let wait_us = frames_missing as u64 * 1_000_000 / sample_rate as u64;
    if wait_us < 50 {
        for _ in 0..64 {
            std::hint::spin_loop();
        }
    } else if wait_us < 500 {
        thread::yield_now();
        for _ in 0..32 {
            std::hint::spin_loop();
        }
    } else {
        let sleep_us = (wait_us * 7 / 10).clamp(100, 10_000);
        thread::sleep(Duration::from_micros(sleep_us));
    }
}

/// 提升当前线程优先级（nice -16，与 THREAD_PRIORITY_AUDIO 相同）
///
/// 无权限时失败，只记录日志
fn raise_audio_thread_priority() {
    #[cfg(unix)]
    {
        let result = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, -16) };
        if result == -1 {
            log::debug!(
                "Setting audio thread priority failed: {}",
                std::io::Error::last_os_error()
            );
        } else {
            log::debug!("Audio thread priority set to -16");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::callback::ProducerStatus;
    use crate::audio::config::SharingMode;

    fn config() -> StreamConfig {
        StreamConfig::new(48000, 64, 256, SharingMode::Exclusive)
    }

    #[test]
    fn test_open_failure_is_one_shot() {
        let backend = SimulatedBackend::new(SimulatedOptions::free_running(64));
        let control = backend.control();
        control.fail_next_open(BackendError::new(codes::ERROR_INTERNAL, "busy"));

        assert!(backend.open_stream(&config(), StreamMode::Write).is_err());
        assert!(backend.open_stream(&config(), StreamMode::Write).is_ok());
        assert_eq!(control.streams_opened(), 1);
    }

    #[test]
    fn test_callback_stream_renders_bursts() {
        let backend = SimulatedBackend::new(SimulatedOptions::free_running(64));
        let calls = Arc::new(AtomicU64::new(0));
        let calls_cb = Arc::clone(&calls);
        let producer = move |buf: &mut [i16], frames: usize, _: i32| {
            assert_eq!(frames, 64);
            assert_eq!(buf.len(), 128);
            if calls_cb.fetch_add(1, Ordering::Relaxed) + 1 >= 10 {
                ProducerStatus::Stop
            } else {
                ProducerStatus::Continue
            }
        };
        let bridge = DataCallbackBridge::new(Box::new(producer), None, 2);

        let mut stream = backend
            .open_stream(&config(), StreamMode::Callback(bridge))
            .unwrap();
        stream.request_start().unwrap();

        let started = Instant::now();
        while calls.load(Ordering::Relaxed) < 10 && started.elapsed() < Duration::from_secs(5) {
            thread::sleep(Duration::from_millis(1));
        }
        thread::sleep(Duration::from_millis(20));
        stream.close().unwrap();

        assert_eq!(calls.load(Ordering::Relaxed), 10);
        assert_eq!(backend.control().callback_queries(), 10);
    }

    #[test]
    fn test_write_times_out_when_not_started() {
        let backend = SimulatedBackend::new(SimulatedOptions::free_running(64));
        let mut stream = backend.open_stream(&config(), StreamMode::Write).unwrap();

        // 256 帧立体声 = 512 样本，ring 恰好放满
        let samples = vec![1i16; 1024];
        let written = stream
            .write(&samples, 512, Some(Duration::from_millis(20)))
            .unwrap();
        assert_eq!(written, 256);
    }

    #[test]
    fn test_write_rejected_on_callback_stream() {
        let backend = SimulatedBackend::new(SimulatedOptions::free_running(64));
        let producer = |_: &mut [i16], _: usize, _: i32| ProducerStatus::Continue;
        let bridge = DataCallbackBridge::new(Box::new(producer), None, 2);
        let mut stream = backend
            .open_stream(&config(), StreamMode::Callback(bridge))
            .unwrap();

        let err = stream.write(&[0; 4], 2, None).unwrap_err();
        assert_eq!(err.code, codes::ERROR_UNIMPLEMENTED);
    }

    #[test]
    fn test_forced_xrun_values() {
        let backend = SimulatedBackend::new(SimulatedOptions::free_running(64));
        let control = backend.control();
        let stream = backend.open_stream(&config(), StreamMode::Write).unwrap();

        assert_eq!(stream.xrun_count(), Ok(0));
        control.force_xrun_count(Some(-4));
        assert_eq!(stream.xrun_count(), Ok(-4));
        control.fail_xrun_queries(codes::ERROR_TIMEOUT);
        assert_eq!(stream.xrun_count().unwrap_err().code, codes::ERROR_TIMEOUT);
        assert_eq!(control.control_queries(), 3);
    }

    #[test]
    fn test_write_stream_counts_underruns_when_starved() {
        let options = SimulatedOptions {
            frames_per_burst: Some(48),
            raise_thread_priority: false,
            ..Default::default()
        };
        let backend = SimulatedBackend::new(options);
        let mut stream = backend.open_stream(&config(), StreamMode::Write).unwrap();
        stream.request_start().unwrap();

        // 1ms 一个 burst，什么都不写
        thread::sleep(Duration::from_millis(30));
        let xruns = stream.xrun_count().unwrap();
        stream.close().unwrap();
        assert!(xruns > 0, "starved stream should underrun, got {}", xruns);
    }

    #[test]
    fn test_close_twice_is_error() {
        let backend = SimulatedBackend::new(SimulatedOptions::free_running(64));
        let mut stream = backend.open_stream(&config(), StreamMode::Write).unwrap();
        assert!(stream.close().is_ok());
        assert_eq!(stream.close().unwrap_err().code, codes::ERROR_CLOSED);
        assert_eq!(backend.control().streams_closed(), 1);
    }
}
