//! 流参数协商
//!
//! 把调用方请求的采样率、burst、缓冲容量、共享模式转换为具体的流配置请求。
//! 这里只做正数校验；引擎能否接受由打开流时决定。

use std::sync::atomic::{AtomicI32, Ordering};

use super::error::ConfigError;
use super::format::StreamFormat;

/// 引擎未被覆盖时的 burst 大小（帧）
pub const DEFAULT_FRAMES_PER_BURST: i32 = 192;

/// 进程级 burst 默认值
///
/// 对之后打开的*所有*流生效，而不是某一个流
static FRAMES_PER_BURST: AtomicI32 = AtomicI32::new(DEFAULT_FRAMES_PER_BURST);

/// 设置进程级 burst 默认值
///
/// 需要特定 burst 大小时必须在打开流之前调用
pub fn set_default_frames_per_burst(frames: i32) {
    FRAMES_PER_BURST.store(frames, Ordering::Release);
}

/// 读取进程级 burst 默认值
pub fn default_frames_per_burst() -> i32 {
    FRAMES_PER_BURST.load(Ordering::Acquire)
}

/// 共享模式
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SharingMode {
    /// 独占硬件
    #[default]
    Exclusive,
    /// 与其他应用共享
    Shared,
}

/// 流方向（只支持输出）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Output,
}

/// 样本格式（固定 16-bit 整数）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SampleFormat {
    #[default]
    I16,
}

/// 声道数
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ChannelCount {
    Mono,
    #[default]
    Stereo,
}

impl ChannelCount {
    pub fn from_count(count: i32) -> Result<Self, ConfigError> {
        match count {
            1 => Ok(Self::Mono),
            2 => Ok(Self::Stereo),
            n => Err(ConfigError::UnsupportedChannelCount(n)),
        }
    }

    #[inline]
    pub fn count(self) -> usize {
        match self {
            Self::Mono => 1,
            Self::Stereo => 2,
        }
    }
}

/// 性能模式
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum PerformanceMode {
    #[default]
    LowLatency,
    /// 请求采样率与设备原生采样率不符时使用
    None,
}

/// 根据设备原生采样率选择性能模式
///
/// 低延迟路径只在无需重采样时有效；原生采样率未知时仍请求低延迟
pub fn negotiate_performance_mode(requested_rate: i32, native_rate: Option<u32>) -> PerformanceMode {
    match native_rate {
        Some(native) if i64::from(native) != i64::from(requested_rate) => PerformanceMode::None,
        _ => PerformanceMode::LowLatency,
    }
}

/// 输出流配置
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamConfig {
    pub sample_rate: i32,
    pub sharing_mode: SharingMode,
    pub direction: Direction,
    pub format: SampleFormat,
    pub channel_count: ChannelCount,
    pub buffer_capacity_frames: i32,
    pub performance_mode: PerformanceMode,
    /// 打开时设为引擎的 burst 默认值
    pub frames_per_burst: i32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            sharing_mode: SharingMode::default(),
            direction: Direction::default(),
            format: SampleFormat::default(),
            channel_count: ChannelCount::default(),
            buffer_capacity_frames: 960,
            performance_mode: PerformanceMode::default(),
            frames_per_burst: DEFAULT_FRAMES_PER_BURST,
        }
    }
}

impl StreamConfig {
    /// 创建配置（无副作用）
    pub fn new(
        sample_rate: i32,
        frames_per_burst: i32,
        buffer_capacity_frames: i32,
        sharing_mode: SharingMode,
    ) -> Self {
        Self {
            sample_rate,
            frames_per_burst,
            buffer_capacity_frames,
            sharing_mode,
            ..Default::default()
        }
    }

    pub fn with_channels(mut self, channels: ChannelCount) -> Self {
        self.channel_count = channels;
        self
    }

    pub fn with_performance_mode(mut self, mode: PerformanceMode) -> Self {
        self.performance_mode = mode;
        self
    }

    /// 校验正数约束
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_rate <= 0 {
            return Err(ConfigError::InvalidSampleRate(self.sample_rate));
        }
        if self.buffer_capacity_frames <= 0 {
            return Err(ConfigError::InvalidBufferCapacity(self.buffer_capacity_frames));
        }
        if self.frames_per_burst <= 0 {
            return Err(ConfigError::InvalidFramesPerBurst(self.frames_per_burst));
        }
        Ok(())
    }

    /// 帧布局
    pub fn stream_format(&self) -> StreamFormat {
        StreamFormat::new(self.sample_rate.max(0) as u32, self.channel_count)
    }

    /// 缓冲容量对应的时长（毫秒）
    pub fn capacity_ms(&self) -> f32 {
        if self.sample_rate <= 0 {
            return 0.0;
        }
        (self.buffer_capacity_frames as f32 / self.sample_rate as f32) * 1000.0
    }
}

/// 构建流配置
///
/// 副作用：`frames_per_burst` 写入进程级默认值，影响之后打开的所有流
pub fn build_config(
    sample_rate: i32,
    frames_per_burst: i32,
    buffer_capacity_frames: i32,
    sharing_mode: SharingMode,
) -> StreamConfig {
    set_default_frames_per_burst(frames_per_burst);
    StreamConfig::new(sample_rate, frames_per_burst, buffer_capacity_frames, sharing_mode)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_config_sets_process_default() {
        // 本模块唯一修改全局 burst 的测试
        let config = build_config(48000, 96, 960, SharingMode::Shared);
        assert_eq!(config.frames_per_burst, 96);
        assert_eq!(default_frames_per_burst(), 96);
        assert_eq!(config.sharing_mode, SharingMode::Shared);
        assert_eq!(config.format, SampleFormat::I16);
        assert_eq!(config.direction, Direction::Output);
    }

    #[test]
    fn test_validate() {
        assert!(StreamConfig::new(48000, 192, 960, SharingMode::Exclusive).validate().is_ok());
        assert_eq!(
            StreamConfig::new(0, 192, 960, SharingMode::Exclusive).validate(),
            Err(ConfigError::InvalidSampleRate(0))
        );
        assert_eq!(
            StreamConfig::new(48000, 192, -1, SharingMode::Exclusive).validate(),
            Err(ConfigError::InvalidBufferCapacity(-1))
        );
        assert_eq!(
            StreamConfig::new(48000, 0, 960, SharingMode::Exclusive).validate(),
            Err(ConfigError::InvalidFramesPerBurst(0))
        );
    }

    #[test]
    fn test_channel_count() {
        assert_eq!(ChannelCount::from_count(1), Ok(ChannelCount::Mono));
        assert_eq!(ChannelCount::from_count(2).map(ChannelCount::count), Ok(2));
        assert_eq!(
            ChannelCount::from_count(6),
            Err(ConfigError::UnsupportedChannelCount(6))
        );
    }

    #[test]
    fn test_performance_mode_negotiation() {
        assert_eq!(negotiate_performance_mode(48000, Some(48000)), PerformanceMode::LowLatency);
        assert_eq!(negotiate_performance_mode(44100, Some(48000)), PerformanceMode::None);
        assert_eq!(negotiate_performance_mode(44100, None), PerformanceMode::LowLatency);
    }

    #[test]
    fn test_capacity_ms() {
        let config = StreamConfig::new(48000, 192, 960, SharingMode::Exclusive);
        assert!((config.capacity_ms() - 20.0).abs() < 0.01);
    }
}
