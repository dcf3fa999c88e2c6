//! Oboe 引擎（Android）
//!
//! 回调模式通过 `AudioOutputCallback` 把 Oboe 的实时回调转给 `DataCallbackBridge`；
//! 写入模式使用 Oboe 的同步流。立体声帧在 Oboe 侧是 `(i16, i16)`，
//! 与桥接层的交织 i16 之间通过预分配的暂存区转换。

use std::marker::PhantomData;
use std::time::Duration;

use oboe::{
    AudioOutputCallback, AudioOutputStreamSafe, AudioOutputStreamSync, AudioStream,
    AudioStreamAsync, AudioStreamBase, AudioStreamBuilder, AudioStreamSafe, AudioStreamSync,
    DataCallbackResult, DefaultStreamValues, Mono, Output, Stereo, Unspecified,
};

use super::{AudioBackend, NativeStream, StreamMode, XrunSource};
use crate::audio::callback::{CallbackAction, DataCallbackBridge};
use crate::audio::config::{ChannelCount, PerformanceMode, SharingMode, StreamConfig};
use crate::audio::error::BackendError;
use crate::audio::format::fill_stereo_frames;

fn engine_error(error: oboe::Error, message: &'static str) -> BackendError {
    BackendError::new(error as i32, message)
}

fn to_oboe_action(action: CallbackAction) -> DataCallbackResult {
    match action {
        CallbackAction::Continue => DataCallbackResult::Continue,
        CallbackAction::Stop => DataCallbackResult::Stop,
    }
}

/// 回调内的 xrun 查询入口
struct OboeXruns<'a>(&'a dyn AudioOutputStreamSafe);

impl XrunSource for OboeXruns<'_> {
    fn xrun_count(&self) -> Result<i32, BackendError> {
        self.0
            .get_xrun_count()
            .map_err(|e| engine_error(e, "xrun query failed"))
    }
}

/// Oboe 回调适配
struct BridgeCallback<C> {
    bridge: DataCallbackBridge,
    /// 立体声交织暂存区
    scratch: Vec<i16>,
    _channels: PhantomData<C>,
}

impl<C> BridgeCallback<C> {
    fn new(bridge: DataCallbackBridge, capacity_samples: usize) -> Self {
        Self {
            bridge,
            scratch: vec![0; capacity_samples],
            _channels: PhantomData,
        }
    }
}

impl AudioOutputCallback for BridgeCallback<Mono> {
    type FrameType = (i16, Mono);

    fn on_audio_ready(
        &mut self,
        stream: &mut dyn AudioOutputStreamSafe,
        frames: &mut [i16],
    ) -> DataCallbackResult {
        let source = OboeXruns(&*stream);
        let count = frames.len();
        to_oboe_action(self.bridge.on_audio_ready(&source, frames, count))
    }
}

impl AudioOutputCallback for BridgeCallback<Stereo> {
    type FrameType = (i16, Stereo);

    fn on_audio_ready(
        &mut self,
        stream: &mut dyn AudioOutputStreamSafe,
        frames: &mut [(i16, i16)],
    ) -> DataCallbackResult {
        let source = OboeXruns(&*stream);
        let count = frames.len().min(self.scratch.len() / 2);
        let scratch = &mut self.scratch[..count * 2];
        scratch.fill(0);

        let action = self.bridge.on_audio_ready(&source, scratch, count);
        // 超出暂存区的帧输出静音
        fill_stereo_frames(scratch, frames);
        to_oboe_action(action)
    }
}

enum Inner {
    MonoCallback(AudioStreamAsync<Output, BridgeCallback<Mono>>),
    StereoCallback(AudioStreamAsync<Output, BridgeCallback<Stereo>>),
    MonoWrite(AudioStreamSync<Output, (i16, Mono)>),
    StereoWrite(AudioStreamSync<Output, (i16, Stereo)>),
}

/// 对四种具体流类型分派同一操作
macro_rules! with_stream {
    ($inner:expr, $s:ident => $body:expr) => {
        match $inner {
            Inner::MonoCallback($s) => $body,
            Inner::StereoCallback($s) => $body,
            Inner::MonoWrite($s) => $body,
            Inner::StereoWrite($s) => $body,
        }
    };
}

/// 已打开的 Oboe 流
pub struct OboeStream {
    inner: Inner,
    frames_per_burst: i32,
    /// 立体声写入时的帧暂存区
    write_frames: Vec<(i16, i16)>,
}

// SAFETY: Oboe 流可在任意线程上操作，只要同一时刻只有一个线程调用；
// 会话通过 &mut 保证了这一点
unsafe impl Send for OboeStream {}

impl XrunSource for OboeStream {
    fn xrun_count(&self) -> Result<i32, BackendError> {
        with_stream!(&self.inner, s => s.get_xrun_count())
            .map_err(|e| engine_error(e, "xrun query failed"))
    }
}

impl NativeStream for OboeStream {
    fn request_start(&mut self) -> Result<(), BackendError> {
        with_stream!(&mut self.inner, s => s.request_start())
            .map_err(|e| engine_error(e, "request start failed"))
    }

    fn close(&mut self) -> Result<(), BackendError> {
        with_stream!(&mut self.inner, s => s.close()).map_err(|e| engine_error(e, "close failed"))
    }

    fn is_xrun_count_supported(&self) -> bool {
        with_stream!(&self.inner, s => s.is_xrun_count_supported())
    }

    fn buffer_capacity_in_frames(&self) -> i32 {
        with_stream!(&self.inner, s => s.get_buffer_capacity_in_frames())
    }

    fn buffer_size_in_frames(&self) -> i32 {
        with_stream!(&self.inner, s => s.get_buffer_size_in_frames())
    }

    fn frames_per_burst(&self) -> i32 {
        self.frames_per_burst
    }

    fn write(
        &mut self,
        samples: &[i16],
        frame_count: usize,
        timeout: Option<Duration>,
    ) -> Result<i32, BackendError> {
        // Oboe 用 i64::MAX 纳秒表示一直等待
        let timeout_ns = timeout
            .map(|t| i64::try_from(t.as_nanos()).unwrap_or(i64::MAX))
            .unwrap_or(i64::MAX);

        match &mut self.inner {
            Inner::MonoWrite(s) => {
                let n = frame_count.min(samples.len());
                s.write(&samples[..n], timeout_ns)
                    .map_err(|e| engine_error(e, "write failed"))
            }
            Inner::StereoWrite(s) => {
                let n = frame_count.min(samples.len() / 2);
                self.write_frames.clear();
                self.write_frames
                    .extend(samples[..n * 2].chunks_exact(2).map(|p| (p[0], p[1])));
                s.write(&self.write_frames, timeout_ns)
                    .map_err(|e| engine_error(e, "write failed"))
            }
            _ => Err(BackendError::new(
                super::codes::ERROR_UNIMPLEMENTED,
                "write on callback stream",
            )),
        }
    }
}

/// Oboe 引擎
#[derive(Default)]
pub struct OboeBackend;

impl OboeBackend {
    pub fn new() -> Self {
        Self
    }

    fn builder(config: &StreamConfig) -> AudioStreamBuilder<Output, Unspecified, i16> {
        let sharing = match config.sharing_mode {
            SharingMode::Exclusive => oboe::SharingMode::Exclusive,
            SharingMode::Shared => oboe::SharingMode::Shared,
        };
        let performance = match config.performance_mode {
            PerformanceMode::LowLatency => oboe::PerformanceMode::LowLatency,
            PerformanceMode::None => oboe::PerformanceMode::None,
        };

        AudioStreamBuilder::default()
            .set_performance_mode(performance)
            .set_sharing_mode(sharing)
            .set_sample_rate(config.sample_rate)
            .set_buffer_capacity_in_frames(config.buffer_capacity_frames)
            .set_format::<i16>()
    }
}

impl AudioBackend for OboeBackend {
    fn name(&self) -> &'static str {
        "oboe"
    }

    fn set_default_frames_per_burst(&self, frames: i32) {
        DefaultStreamValues::set_frames_per_burst(frames);
    }

    fn open_stream(
        &self,
        config: &StreamConfig,
        mode: StreamMode,
    ) -> Result<Box<dyn NativeStream>, BackendError> {
        let builder = Self::builder(config);
        let capacity = config.buffer_capacity_frames.max(0) as usize;

        let inner = match (mode, config.channel_count) {
            (StreamMode::Callback(bridge), ChannelCount::Mono) => builder
                .set_channel_count::<Mono>()
                .set_callback(BridgeCallback::<Mono>::new(bridge, 0))
                .open_stream()
                .map(Inner::MonoCallback),
            (StreamMode::Callback(bridge), ChannelCount::Stereo) => builder
                .set_channel_count::<Stereo>()
                .set_callback(BridgeCallback::<Stereo>::new(bridge, capacity * 2))
                .open_stream()
                .map(Inner::StereoCallback),
            (StreamMode::Write, ChannelCount::Mono) => builder
                .set_channel_count::<Mono>()
                .open_stream()
                .map(Inner::MonoWrite),
            (StreamMode::Write, ChannelCount::Stereo) => builder
                .set_channel_count::<Stereo>()
                .open_stream()
                .map(Inner::StereoWrite),
        }
        .map_err(|e| engine_error(e, "open stream failed"))?;

        let mut inner = inner;
        let frames_per_burst = with_stream!(&mut inner, s => s.get_frames_per_burst());

        Ok(Box::new(OboeStream {
            inner,
            frames_per_burst,
            write_frames: Vec::with_capacity(capacity),
        }))
    }
}
