//! 数据回调桥接
//!
//! 回调模式下，引擎在自己的实时线程上每个 buffer 周期调用一次
//! `DataCallbackBridge::on_audio_ready`。每次调用依次：
//! 1. 若监控仍开启，查询 xrun 计数并计算增量（失败则永久关闭监控并上报错误码）
//! 2. 调用生产者填充 buffer
//! 3. 把生产者的状态翻译为 Continue / Stop
//!
//! **绝对禁止：**
//! - 锁
//! - 无界分配
//! - I/O 和同步日志

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::backend::{codes, XrunSource};
use super::stats::StreamStats;
use super::xrun::{XrunPoll, XrunTracker};

/// 交给引擎的指令
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    Continue,
    /// 永久结束该流的回调循环，需重新打开才能继续
    Stop,
}

/// 生产者状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerStatus {
    Continue = 0,
    Stop = 1,
}

/// 生产者违反状态字节约定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidStatus(pub u8);

impl TryFrom<u8> for ProducerStatus {
    type Error = InvalidStatus;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            0 => Ok(Self::Continue),
            1 => Ok(Self::Stop),
            other => Err(InvalidStatus(other)),
        }
    }
}

/// 帧生产者
///
/// 在引擎线程上调用，`buffer` 只在本次调用期间有效，长度恰好为
/// `frame_count * 声道数`。实现必须满足实时约束。
pub trait FrameProducer: Send {
    fn produce(
        &mut self,
        buffer: &mut [i16],
        frame_count: usize,
        underrun_delta: i32,
    ) -> Result<ProducerStatus, InvalidStatus>;
}

impl<F> FrameProducer for F
where
    F: FnMut(&mut [i16], usize, i32) -> ProducerStatus + Send,
{
    #[inline]
    fn produce(
        &mut self,
        buffer: &mut [i16],
        frame_count: usize,
        underrun_delta: i32,
    ) -> Result<ProducerStatus, InvalidStatus> {
        Ok(self(buffer, frame_count, underrun_delta))
    }
}

/// 错误上报通道
///
/// 从引擎线程调用，fire-and-forget：实现不得阻塞
pub trait ErrorReporter: Send + Sync {
    fn report(&self, code: i32);
}

impl<F> ErrorReporter for F
where
    F: Fn(i32) + Send + Sync,
{
    fn report(&self, code: i32) {
        self(code)
    }
}

/// 基于有界 channel 的上报器，满了就丢弃
pub struct ChannelErrorReporter {
    sender: crossbeam_channel::Sender<i32>,
}

impl ChannelErrorReporter {
    /// 返回上报器和接收端
    pub fn bounded(capacity: usize) -> (Self, crossbeam_channel::Receiver<i32>) {
        let (sender, receiver) = crossbeam_channel::bounded(capacity);
        (Self { sender }, receiver)
    }
}

impl ErrorReporter for ChannelErrorReporter {
    fn report(&self, code: i32) {
        let _ = self.sender.try_send(code);
    }
}

/// 回调桥接
///
/// 与原生流共生共灭；`tracker`、`stats`、`stopped` 与会话共享以供观察
pub struct DataCallbackBridge {
    producer: Box<dyn FrameProducer>,
    reporter: Option<Arc<dyn ErrorReporter>>,
    tracker: Arc<XrunTracker>,
    stats: Arc<StreamStats>,
    stopped: Arc<AtomicBool>,
    samples_per_frame: usize,
}

impl DataCallbackBridge {
    pub fn new(
        producer: Box<dyn FrameProducer>,
        reporter: Option<Arc<dyn ErrorReporter>>,
        samples_per_frame: usize,
    ) -> Self {
        Self {
            producer,
            reporter,
            tracker: Arc::new(XrunTracker::new()),
            stats: Arc::new(StreamStats::new()),
            stopped: Arc::new(AtomicBool::new(false)),
            samples_per_frame: samples_per_frame.max(1),
        }
    }

    pub fn tracker(&self) -> Arc<XrunTracker> {
        Arc::clone(&self.tracker)
    }

    pub fn stats(&self) -> Arc<StreamStats> {
        Arc::clone(&self.stats)
    }

    /// 生产者是否已请求停止
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stopped)
    }

    #[inline]
    fn report(&self, code: i32) {
        if let Some(reporter) = &self.reporter {
            reporter.report(code);
        }
    }

    /// 引擎每个 buffer 周期调用一次
    #[inline]
    pub fn on_audio_ready(
        &mut self,
        source: &dyn XrunSource,
        buffer: &mut [i16],
        frame_count: usize,
    ) -> CallbackAction {
        // Stop 之后引擎不应再调用；万一调用也不再触达生产者
        if self.stopped.load(Ordering::Acquire) {
            return CallbackAction::Stop;
        }

        let poll = self.tracker.poll(source);
        if let XrunPoll::Failed(ref e) = poll {
            self.stats.record_monitor_failure();
            self.report(e.code());
        }
        let delta = poll.delta();
        self.stats.record_underruns(delta);

        let frames = frame_count.min(buffer.len() / self.samples_per_frame);
        let samples = frames * self.samples_per_frame;
        let buffer = &mut buffer[..samples];

        let status = self.producer.produce(buffer, frames, delta);
        self.stats.on_callback(frames);

        match status {
            Ok(ProducerStatus::Continue) => CallbackAction::Continue,
            Ok(ProducerStatus::Stop) => {
                self.stopped.store(true, Ordering::Release);
                CallbackAction::Stop
            }
            Err(InvalidStatus(_)) => {
                self.report(codes::ERROR_INVALID_PRODUCER_STATUS);
                self.stopped.store(true, Ordering::Release);
                CallbackAction::Stop
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::error::BackendError;
    use std::sync::atomic::AtomicI32;
    use std::sync::Mutex;

    struct FixedXruns(AtomicI32);

    impl XrunSource for FixedXruns {
        fn xrun_count(&self) -> Result<i32, BackendError> {
            let n = self.0.load(Ordering::Relaxed);
            if n == i32::MIN {
                Err(BackendError::new(codes::ERROR_INVALID_STATE, "closed"))
            } else {
                Ok(n)
            }
        }
    }

    #[test]
    fn test_status_byte_translation() {
        assert_eq!(ProducerStatus::try_from(0), Ok(ProducerStatus::Continue));
        assert_eq!(ProducerStatus::try_from(1), Ok(ProducerStatus::Stop));
        assert_eq!(ProducerStatus::try_from(7), Err(InvalidStatus(7)));
    }

    #[test]
    fn test_producer_fills_buffer_and_sees_delta() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = Arc::clone(&seen);
        let producer = move |buf: &mut [i16], frames: usize, delta: i32| {
            buf.fill(7);
            seen_cb.lock().unwrap().push((buf.len(), frames, delta));
            ProducerStatus::Continue
        };

        let mut bridge = DataCallbackBridge::new(Box::new(producer), None, 2);
        let source = FixedXruns(AtomicI32::new(0));
        let mut buffer = vec![0i16; 16];

        assert_eq!(bridge.on_audio_ready(&source, &mut buffer, 8), CallbackAction::Continue);
        source.0.store(3, Ordering::Relaxed);
        assert_eq!(bridge.on_audio_ready(&source, &mut buffer, 8), CallbackAction::Continue);

        assert!(buffer.iter().all(|&s| s == 7));
        assert_eq!(*seen.lock().unwrap(), vec![(16, 8, 0), (16, 8, 3)]);
        assert_eq!(bridge.stats().underruns_reported(), 3);
        assert_eq!(bridge.stats().frames_rendered(), 16);
    }

    #[test]
    fn test_frame_count_clamped_to_buffer() {
        let producer = |buf: &mut [i16], frames: usize, _: i32| {
            assert_eq!(buf.len(), frames * 2);
            ProducerStatus::Continue
        };
        let mut bridge = DataCallbackBridge::new(Box::new(producer), None, 2);
        let source = FixedXruns(AtomicI32::new(0));
        let mut buffer = vec![0i16; 10];
        bridge.on_audio_ready(&source, &mut buffer, 64);
        assert_eq!(bridge.stats().frames_rendered(), 5);
    }

    #[test]
    fn test_monitor_failure_reports_and_continues() {
        let (reporter, errors) = ChannelErrorReporter::bounded(8);
        let deltas = Arc::new(Mutex::new(Vec::new()));
        let deltas_cb = Arc::clone(&deltas);
        let producer = move |_: &mut [i16], _: usize, delta: i32| {
            deltas_cb.lock().unwrap().push(delta);
            ProducerStatus::Continue
        };

        let mut bridge = DataCallbackBridge::new(Box::new(producer), Some(Arc::new(reporter)), 1);
        let tracker = bridge.tracker();
        let source = FixedXruns(AtomicI32::new(1));
        let mut buffer = vec![0i16; 4];

        assert_eq!(bridge.on_audio_ready(&source, &mut buffer, 4), CallbackAction::Continue);
        source.0.store(i32::MIN, Ordering::Relaxed);
        assert_eq!(bridge.on_audio_ready(&source, &mut buffer, 4), CallbackAction::Continue);
        source.0.store(9, Ordering::Relaxed);
        assert_eq!(bridge.on_audio_ready(&source, &mut buffer, 4), CallbackAction::Continue);

        assert!(!tracker.monitoring_enabled());
        assert_eq!(*deltas.lock().unwrap(), vec![1, 0, 0]);
        assert_eq!(errors.try_recv(), Ok(codes::ERROR_INVALID_STATE));
        assert!(errors.try_recv().is_err());
    }

    #[test]
    fn test_negative_xrun_count_reports_dedicated_code() {
        let (reporter, errors) = ChannelErrorReporter::bounded(8);
        let producer = |_: &mut [i16], _: usize, _: i32| ProducerStatus::Continue;
        let mut bridge = DataCallbackBridge::new(Box::new(producer), Some(Arc::new(reporter)), 1);
        let source = FixedXruns(AtomicI32::new(-1));
        let mut buffer = vec![0i16; 4];

        assert_eq!(bridge.on_audio_ready(&source, &mut buffer, 4), CallbackAction::Continue);
        assert_eq!(errors.try_recv(), Ok(codes::ERROR_INVALID_XRUN_COUNT));
    }

    #[test]
    fn test_stop_is_final() {
        let calls = Arc::new(AtomicI32::new(0));
        let calls_cb = Arc::clone(&calls);
        let producer = move |_: &mut [i16], _: usize, _: i32| {
            if calls_cb.fetch_add(1, Ordering::Relaxed) + 1 == 3 {
                ProducerStatus::Stop
            } else {
                ProducerStatus::Continue
            }
        };

        let mut bridge = DataCallbackBridge::new(Box::new(producer), None, 2);
        let source = FixedXruns(AtomicI32::new(0));
        let mut buffer = vec![0i16; 8];

        assert_eq!(bridge.on_audio_ready(&source, &mut buffer, 4), CallbackAction::Continue);
        assert_eq!(bridge.on_audio_ready(&source, &mut buffer, 4), CallbackAction::Continue);
        assert_eq!(bridge.on_audio_ready(&source, &mut buffer, 4), CallbackAction::Stop);
        assert_eq!(bridge.on_audio_ready(&source, &mut buffer, 4), CallbackAction::Stop);
        assert_eq!(calls.load(Ordering::Relaxed), 3);
        assert!(bridge.stop_flag().load(Ordering::Acquire));
    }

    struct RawByteProducer(u8);

    impl FrameProducer for RawByteProducer {
        fn produce(&mut self, _: &mut [i16], _: usize, _: i32) -> Result<ProducerStatus, InvalidStatus> {
            ProducerStatus::try_from(self.0)
        }
    }

    #[test]
    fn test_invalid_status_stops_and_reports() {
        let reported = Arc::new(AtomicI32::new(0));
        let reported_cb = Arc::clone(&reported);
        let reporter = move |code: i32| reported_cb.store(code, Ordering::Relaxed);

        let mut bridge =
            DataCallbackBridge::new(Box::new(RawByteProducer(42)), Some(Arc::new(reporter)), 2);
        let source = FixedXruns(AtomicI32::new(0));
        let mut buffer = vec![0i16; 8];

        assert_eq!(bridge.on_audio_ready(&source, &mut buffer, 4), CallbackAction::Stop);
        assert_eq!(reported.load(Ordering::Relaxed), codes::ERROR_INVALID_PRODUCER_STATUS);
    }
}
