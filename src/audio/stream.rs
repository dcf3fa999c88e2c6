//! 流生命周期
//!
//! 状态：Closed → Opening → Open → Started → Closed
//!
//! - `StreamSlot`: 进程级单流守卫，打开时原子抢占，关闭/回滚/Drop 时释放
//! - `StreamManager`: 校验配置、向引擎打开原生流、失败时完整回滚
//! - `StreamSession`: 打开成功后返回的独占句柄，之后所有操作都通过它进行
//!
//! 会话方法取 `&mut self`，生命周期转换由所有权保证互斥；
//! 回调线程只接触桥接内部的原子状态，从不触碰会话。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use super::backend::{AudioBackend, NativeStream, StreamMode};
use super::callback::{DataCallbackBridge, ErrorReporter, FrameProducer};
use super::config::{negotiate_performance_mode, PerformanceMode, StreamConfig};
use super::error::{OpenError, QueryError, StreamError, WriteError};
use super::stats::{StatsReport, StreamStats};
use super::xrun::{query_underrun_count, XrunTracker};

/// 进程级单流守卫
pub struct StreamSlot {
    occupied: AtomicBool,
}

static GLOBAL_SLOT: OnceLock<Arc<StreamSlot>> = OnceLock::new();

impl StreamSlot {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            occupied: AtomicBool::new(false),
        })
    }

    /// 整个进程共享的槽位
    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL_SLOT.get_or_init(StreamSlot::new))
    }

    fn try_claim(&self) -> bool {
        self.occupied
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn release(&self) {
        self.occupied.store(false, Ordering::Release);
    }

    pub fn is_occupied(&self) -> bool {
        self.occupied.load(Ordering::Acquire)
    }
}

/// 生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Closed,
    Opening,
    Open,
    Started,
}

/// 驱动方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    Callback,
    Write,
}

/// 写入模式选项
#[derive(Clone, Debug, Default)]
pub struct WriteOptions {
    /// 单次写入的最长等待，None 表示一直等待
    pub timeout: Option<Duration>,
    /// 非 0 时：未显式 start 的流在成功写入这么多次后自动启动
    pub prebuffer_writes: u32,
}

impl WriteOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_prebuffer_writes(mut self, writes: u32) -> Self {
        self.prebuffer_writes = writes;
        self
    }
}

/// 打开后的诊断信息（仅供观察）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamInfo {
    pub xrun_count_supported: bool,
    pub buffer_capacity_frames: i32,
    pub buffer_size_frames: i32,
    pub frames_per_burst: i32,
}

/// 流管理器
pub struct StreamManager {
    backend: Arc<dyn AudioBackend>,
    slot: Arc<StreamSlot>,
}

impl StreamManager {
    /// 使用进程级槽位
    pub fn new(backend: Arc<dyn AudioBackend>) -> Self {
        Self::with_slot(backend, StreamSlot::global())
    }

    pub fn with_slot(backend: Arc<dyn AudioBackend>, slot: Arc<StreamSlot>) -> Self {
        Self { backend, slot }
    }

    pub fn backend(&self) -> &dyn AudioBackend {
        self.backend.as_ref()
    }

    pub fn slot(&self) -> &Arc<StreamSlot> {
        &self.slot
    }

    /// 打开回调模式流
    pub fn open_callback(
        &self,
        config: StreamConfig,
        producer: Box<dyn FrameProducer>,
        reporter: Option<Arc<dyn ErrorReporter>>,
    ) -> Result<StreamSession, OpenError> {
        let bridge = DataCallbackBridge::new(producer, reporter, config.channel_count.count());
        let tracker = bridge.tracker();
        let stats = bridge.stats();
        let stop_flag = bridge.stop_flag();

        let mut session = self.open(config, StreamMode::Callback(bridge), stats, WriteOptions::default())?;
        session.tracker = Some(tracker);
        session.producer_stopped = Some(stop_flag);
        Ok(session)
    }

    /// 打开写入模式流
    pub fn open_write(
        &self,
        config: StreamConfig,
        options: WriteOptions,
    ) -> Result<StreamSession, OpenError> {
        self.open(config, StreamMode::Write, Arc::new(StreamStats::new()), options)
    }

    fn open(
        &self,
        mut config: StreamConfig,
        mode: StreamMode,
        stats: Arc<StreamStats>,
        write_options: WriteOptions,
    ) -> Result<StreamSession, OpenError> {
        if !self.slot.try_claim() {
            log::warn!("Open rejected: a stream is already open");
            return Err(OpenError::AlreadyOpen);
        }

        // 从这里开始任何失败都必须释放槽位
        if let Err(e) = config.validate() {
            self.slot.release();
            log::error!("Open rejected: {}", e);
            return Err(e.into());
        }

        if config.performance_mode == PerformanceMode::LowLatency {
            let negotiated =
                negotiate_performance_mode(config.sample_rate, self.backend.native_sample_rate());
            if negotiated != config.performance_mode {
                log::info!(
                    "Native sample rate differs from {}Hz, low-latency mode not requested",
                    config.sample_rate
                );
                config.performance_mode = negotiated;
            }
        }

        // 引擎的 burst 默认值对之后打开的所有流生效
        self.backend.set_default_frames_per_burst(config.frames_per_burst);

        let session_mode = match mode {
            StreamMode::Callback(_) => SessionMode::Callback,
            StreamMode::Write => SessionMode::Write,
        };
        let mode_name = mode.name();

        let stream = match self.backend.open_stream(&config, mode) {
            Ok(stream) => stream,
            Err(e) => {
                self.slot.release();
                log::error!("{} failed to open {} stream: {}", self.backend.name(), mode_name, e);
                return Err(e.into());
            }
        };

        // 打开后诊断：只记录，不影响结果
        let info = StreamInfo {
            xrun_count_supported: stream.is_xrun_count_supported(),
            buffer_capacity_frames: stream.buffer_capacity_in_frames(),
            buffer_size_frames: stream.buffer_size_in_frames(),
            frames_per_burst: stream.frames_per_burst(),
        };
        if !info.xrun_count_supported {
            log::warn!("Underrun counting not supported by {}", self.backend.name());
        }
        log::info!(
            "Opened {} stream on {}: {}Hz {}ch, capacity {} frames (~{:.1}ms), size {} frames, burst {}",
            mode_name,
            self.backend.name(),
            config.sample_rate,
            config.channel_count.count(),
            info.buffer_capacity_frames,
            config.capacity_ms(),
            info.buffer_size_frames,
            info.frames_per_burst
        );

        Ok(StreamSession {
            stream: Some(stream),
            state: StreamState::Open,
            mode: session_mode,
            config,
            info,
            slot: Arc::clone(&self.slot),
            stats,
            tracker: None,
            producer_stopped: None,
            write_options,
            successful_writes: 0,
            byte_scratch: Vec::new(),
        })
    }
}

/// 打开的流
///
/// 独占原生流句柄；Drop 时尽力关闭并释放槽位
pub struct StreamSession {
    stream: Option<Box<dyn NativeStream>>,
    state: StreamState,
    mode: SessionMode,
    config: StreamConfig,
    info: StreamInfo,
    slot: Arc<StreamSlot>,
    stats: Arc<StreamStats>,
    tracker: Option<Arc<XrunTracker>>,
    producer_stopped: Option<Arc<AtomicBool>>,
    write_options: WriteOptions,
    successful_writes: u32,
    byte_scratch: Vec<i16>,
}

impl StreamSession {
    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn info(&self) -> &StreamInfo {
        &self.info
    }

    pub fn stats(&self) -> &Arc<StreamStats> {
        &self.stats
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, StreamState::Open | StreamState::Started)
    }

    /// 回调模式：生产者是否已返回 Stop
    pub fn is_stopped_by_producer(&self) -> bool {
        self.producer_stopped
            .as_ref()
            .map(|f| f.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// 回调模式：underrun 监控是否仍开启
    pub fn monitoring_enabled(&self) -> bool {
        self.tracker
            .as_ref()
            .map(|t| t.monitoring_enabled())
            .unwrap_or(false)
    }

    fn native(&mut self) -> Result<&mut Box<dyn NativeStream>, StreamError> {
        match self.state {
            StreamState::Open | StreamState::Started => {
                self.stream.as_mut().ok_or(StreamError::NotOpen)
            }
            StreamState::Closed | StreamState::Opening => Err(StreamError::NotOpen),
        }
    }

    /// 请求引擎开始
    pub fn start(&mut self) -> Result<(), StreamError> {
        if self.state == StreamState::Started {
            return Err(StreamError::AlreadyStarted);
        }

        let stream = self.native()?;
        stream.request_start().map_err(StreamError::StartFailed)?;
        self.state = StreamState::Started;
        log::info!("Stream started");
        Ok(())
    }

    /// 阻塞写入交织样本
    ///
    /// `buffer` 至少包含 `frame_count * 声道数` 个样本。返回引擎接受的帧数；
    /// 超时时可能小于 `frame_count`。
    ///
    /// 预缓冲期间不阻塞：缓冲区满时立即启动流，再阻塞写入剩余帧
    pub fn write_frames(&mut self, buffer: &[i16], frame_count: usize) -> Result<usize, WriteError> {
        if self.mode != SessionMode::Write {
            return Err(StreamError::WrongMode("write").into());
        }

        let format = self.config.stream_format();
        let needed = format.samples_for(frame_count);
        if buffer.len() < needed {
            return Err(WriteError::BufferTooSmall {
                samples: buffer.len(),
                frames: frame_count,
                needed,
            });
        }

        let timeout = self.write_options.timeout;
        let prebuffering =
            self.state == StreamState::Open && self.write_options.prebuffer_writes > 0;

        let written = if prebuffering {
            let queued = self.write_raw(&buffer[..needed], frame_count, Some(Duration::ZERO))?;
            if queued < frame_count {
                log::info!("Buffer full after {} prebuffered frames, starting", queued);
                self.start()?;
                let rest = &buffer[format.samples_for(queued)..needed];
                queued + self.write_raw(rest, frame_count - queued, timeout)?
            } else {
                self.successful_writes += 1;
                if self.successful_writes >= self.write_options.prebuffer_writes {
                    log::info!("Prebuffer complete after {} writes", self.successful_writes);
                    self.start()?;
                }
                queued
            }
        } else {
            self.write_raw(&buffer[..needed], frame_count, timeout)?
        };

        if written < frame_count {
            log::warn!("Engine accepted {} of {} frames", written, frame_count);
        }
        self.stats.on_write(frame_count, written);

        Ok(written)
    }

    /// 单次引擎写入，校验返回的帧数
    fn write_raw(
        &mut self,
        samples: &[i16],
        frame_count: usize,
        timeout: Option<Duration>,
    ) -> Result<usize, WriteError> {
        let raw = self
            .native()?
            .write(samples, frame_count, timeout)
            .map_err(WriteError::Engine)?;

        if raw < 0 {
            return Err(WriteError::InvalidFrameCount(raw));
        }
        Ok((raw as usize).min(frame_count))
    }

    /// 写入 little-endian s16 字节流，长度必须是整帧
    pub fn write_bytes_le(&mut self, bytes: &[u8]) -> Result<usize, WriteError> {
        let format = self.config.stream_format();
        let frames = format
            .frames_in_bytes(bytes.len())
            .ok_or(WriteError::PartialFrame {
                len: bytes.len(),
                bytes_per_frame: format.bytes_per_frame(),
            })?;

        let mut scratch = std::mem::take(&mut self.byte_scratch);
        scratch.resize(format.samples_for(frames), 0);
        format.decode_le_bytes(bytes, &mut scratch);

        let result = self.write_frames(&scratch, frames);
        self.byte_scratch = scratch;
        result
    }

    /// 查询 underrun 计数
    ///
    /// 每次调用都是独立的尝试，之前的失败不影响之后的查询
    pub fn underrun_count(&self) -> Result<i32, QueryError> {
        match (&self.state, &self.stream) {
            (StreamState::Open | StreamState::Started, Some(stream)) => {
                query_underrun_count(&**stream)
            }
            _ => Err(StreamError::NotOpen.into()),
        }
    }

    /// 关闭流
    ///
    /// 释放前尽力查询最终 underrun 计数（失败只记录日志），
    /// 然后释放原生流、清空状态并释放槽位
    pub fn close(&mut self) -> Result<StatsReport, StreamError> {
        if !self.is_open() {
            return Err(StreamError::NotOpen);
        }
        let mut stream = self.stream.take().ok_or(StreamError::NotOpen)?;

        match query_underrun_count(&*stream) {
            Ok(count) => {
                log::info!("Final underrun count: {}", count);
                self.stats.set_final_underrun_count(Some(count));
            }
            Err(e) => {
                log::warn!("Final underrun query failed: {}", e);
                self.stats.set_final_underrun_count(None);
            }
        }

        if let Err(e) = stream.close() {
            log::warn!("Engine reported error on close: {}", e);
        }
        drop(stream);

        self.state = StreamState::Closed;
        self.tracker = None;
        self.slot.release();

        let report = self.stats.report(self.config.sample_rate);
        log::info!("Stream closed");
        log::debug!("{}", report);
        Ok(report)
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        if self.is_open() {
            let _ = self.close();
        }
    }
}
