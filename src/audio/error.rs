//! 错误类型
//!
//! 按关注点拆分：配置、打开、生命周期、写入、查询，以及引擎返回的原始错误

use std::borrow::Cow;

use thiserror::Error;

use super::backend::codes;

/// 引擎（底层音频库）返回的错误
///
/// `code` 保留引擎的数值错误码，通过错误上报通道原样交给调用方。
/// 静态消息不分配，可在音频回调内构造
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("engine error {code}: {message}")]
pub struct BackendError {
    pub code: i32,
    pub message: Cow<'static, str>,
}

impl BackendError {
    pub fn new(code: i32, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// 请求参数非法
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("sample rate must be positive, got {0}")]
    InvalidSampleRate(i32),

    #[error("buffer capacity must be positive, got {0} frames")]
    InvalidBufferCapacity(i32),

    #[error("frames per burst must be positive, got {0}")]
    InvalidFramesPerBurst(i32),

    #[error("unsupported channel count {0}")]
    UnsupportedChannelCount(i32),
}

/// 打开流失败
#[derive(Error, Debug)]
pub enum OpenError {
    /// 进程内已有一个流
    #[error("a stream is already open")]
    AlreadyOpen,

    #[error("invalid stream config: {0}")]
    Config(#[from] ConfigError),

    /// 引擎拒绝打开
    #[error("engine refused to open stream: {0}")]
    Engine(#[from] BackendError),
}

/// 生命周期前置条件错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("stream is not open")]
    NotOpen,

    #[error("stream is already started")]
    AlreadyStarted,

    #[error("operation requires a {0} stream")]
    WrongMode(&'static str),

    #[error("failed to start stream: {0}")]
    StartFailed(BackendError),
}

/// 写入失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WriteError {
    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error("engine rejected write: {0}")]
    Engine(BackendError),

    /// 引擎报告了负数写入帧数
    #[error("engine reported impossible frames written: {0}")]
    InvalidFrameCount(i32),

    #[error("buffer holds {samples} samples, {frames} frames need {needed}")]
    BufferTooSmall {
        samples: usize,
        frames: usize,
        needed: usize,
    },

    #[error("byte buffer of {len} bytes is not a whole number of {bytes_per_frame}-byte frames")]
    PartialFrame { len: usize, bytes_per_frame: usize },
}

/// Underrun 计数查询失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error("underrun query failed: {0}")]
    Engine(BackendError),

    /// 引擎报告了负数计数
    #[error("engine reported invalid underrun count: {0}")]
    InvalidCount(i32),
}

impl QueryError {
    /// 错误上报通道使用的数值错误码
    ///
    /// 不会返回 -1，避免与边界调用的失败值混淆
    pub fn code(&self) -> i32 {
        match self {
            Self::Engine(e) => e.code,
            Self::InvalidCount(_) => codes::ERROR_INVALID_XRUN_COUNT,
            Self::Stream(_) => codes::ERROR_INVALID_STATE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_error_codes() {
        assert_eq!(
            QueryError::InvalidCount(-1).code(),
            codes::ERROR_INVALID_XRUN_COUNT
        );
        assert_eq!(
            QueryError::Engine(BackendError::new(codes::ERROR_TIMEOUT, "timeout")).code(),
            codes::ERROR_TIMEOUT
        );
        assert_eq!(
            QueryError::Stream(StreamError::NotOpen).code(),
            codes::ERROR_INVALID_STATE
        );
    }
}
