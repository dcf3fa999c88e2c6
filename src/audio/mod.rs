//! 音频核心模块
//!
//! 包含：
//! - Config: 流参数与进程级 burst 默认值
//! - Stream: 单流生命周期（打开 / 启动 / 写入 / 关闭）
//! - Callback: 实时回调桥接，转发给调用方的生产者
//! - XRun: underrun 计数查询与回调路径增量跟踪
//! - Backend: 引擎抽象（Oboe / 软件模拟）
//! - Ring Buffer: Lock-free 数据传递
//! - Format / Stats: 帧布局、统计

pub mod backend;
pub mod callback;
pub mod config;
pub mod error;
pub mod format;
pub mod ring_buffer;
pub mod stats;
pub mod stream;
pub mod xrun;

pub use backend::{default_backend, AudioBackend, NativeStream, StreamMode, XrunSource};
pub use callback::{
    CallbackAction, ChannelErrorReporter, DataCallbackBridge, ErrorReporter, FrameProducer,
    InvalidStatus, ProducerStatus,
};
pub use config::{
    build_config, default_frames_per_burst, set_default_frames_per_burst, ChannelCount,
    PerformanceMode, SharingMode, StreamConfig,
};
pub use error::{BackendError, ConfigError, OpenError, QueryError, StreamError, WriteError};
pub use format::StreamFormat;
pub use ring_buffer::RingBuffer;
pub use stats::{StatsReport, StreamStats};
pub use stream::{
    SessionMode, StreamInfo, StreamManager, StreamSession, StreamSlot, StreamState, WriteOptions,
};
pub use xrun::{query_underrun_count, XrunPoll, XrunTracker};
