//! 音频引擎抽象
//!
//! 底层音频库是外部协作者，这里只定义桥接核心需要的最小接口：
//! - `AudioBackend`: 打开原生流、设置进程级 burst 默认值
//! - `NativeStream`: 已打开的原生流（启动、关闭、写入、xrun 查询）
//! - `XrunSource`: 回调线程内可用的 xrun 查询入口
//!
//! 平台实现：
//! - **Android**: Oboe
//! - **所有平台**: 软件模拟引擎（测试和演示）

use std::time::Duration;

use super::callback::DataCallbackBridge;
use super::config::StreamConfig;
use super::error::BackendError;

#[cfg(target_os = "android")]
pub mod oboe;
pub mod simulated;

pub use simulated::{SimulatedBackend, SimulatedControl, SimulatedOptions};

/// 引擎错误码（与 Oboe 的 Result 取值一致）
pub mod codes {
    pub const ERROR_INTERNAL: i32 = -896;
    pub const ERROR_INVALID_STATE: i32 = -895;
    pub const ERROR_UNIMPLEMENTED: i32 = -890;
    pub const ERROR_TIMEOUT: i32 = -885;
    pub const ERROR_CLOSED: i32 = -869;
    /// 生产者返回了 0/1 以外的状态字节（桥接层定义）
    pub const ERROR_INVALID_PRODUCER_STATUS: i32 = -1000;
    /// 引擎报告了负数 xrun 计数（桥接层定义）
    pub const ERROR_INVALID_XRUN_COUNT: i32 = -1001;
}

/// 流的驱动方式
pub enum StreamMode {
    /// 引擎线程周期性调用桥接回调拉取数据
    Callback(DataCallbackBridge),
    /// 调用方线程阻塞写入
    Write,
}

impl StreamMode {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Callback(_) => "callback",
            Self::Write => "write",
        }
    }
}

/// xrun 计数来源
///
/// 返回引擎原始值，可能为负；校验由 `xrun::query_underrun_count` 完成
pub trait XrunSource {
    fn xrun_count(&self) -> Result<i32, BackendError>;
}

/// 已打开的原生流
pub trait NativeStream: XrunSource + Send {
    /// 请求引擎开始消费/拉取数据
    fn request_start(&mut self) -> Result<(), BackendError>;

    /// 释放原生流；之后不会再有回调
    fn close(&mut self) -> Result<(), BackendError>;

    fn is_xrun_count_supported(&self) -> bool;

    fn buffer_capacity_in_frames(&self) -> i32;

    fn buffer_size_in_frames(&self) -> i32;

    fn frames_per_burst(&self) -> i32;

    /// 阻塞写入交织样本
    ///
    /// `timeout` 为 None 时一直等待。返回引擎报告的原始写入帧数
    fn write(
        &mut self,
        samples: &[i16],
        frame_count: usize,
        timeout: Option<Duration>,
    ) -> Result<i32, BackendError>;
}

/// 音频引擎
pub trait AudioBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// 进程级 burst 默认值，影响之后打开的所有流
    fn set_default_frames_per_burst(&self, frames: i32);

    /// 设备原生输出采样率（未知时为 None）
    fn native_sample_rate(&self) -> Option<u32> {
        None
    }

    fn open_stream(
        &self,
        config: &StreamConfig,
        mode: StreamMode,
    ) -> Result<Box<dyn NativeStream>, BackendError>;
}

/// 当前平台的默认引擎
#[cfg(target_os = "android")]
pub fn default_backend() -> Box<dyn AudioBackend> {
    Box::new(oboe::OboeBackend::new())
}

/// 当前平台的默认引擎
#[cfg(not(target_os = "android"))]
pub fn default_backend() -> Box<dyn AudioBackend> {
    Box::new(SimulatedBackend::new(SimulatedOptions::default()))
}
