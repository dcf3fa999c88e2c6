//! 帧布局和 s16le 字节解码
//!
//! 内部表示：交织 i16，LRLRLR...（单声道即连续样本）
//! 帧数（而非字节数）是缓冲区大小的单位

use super::config::ChannelCount;

/// 16-bit 样本字节数
pub const BYTES_PER_SAMPLE: usize = 2;

/// 流的帧布局
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channels: ChannelCount,
}

impl StreamFormat {
    pub fn new(sample_rate: u32, channels: ChannelCount) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    /// 每帧的样本数（= 声道数）
    #[inline]
    pub fn samples_per_frame(&self) -> usize {
        self.channels.count()
    }

    /// 每帧的字节数
    #[inline]
    pub fn bytes_per_frame(&self) -> usize {
        BYTES_PER_SAMPLE * self.channels.count()
    }

    /// `frames` 帧需要的样本数
    #[inline]
    pub fn samples_for(&self, frames: usize) -> usize {
        frames * self.samples_per_frame()
    }

    /// 字节数对应的完整帧数，不是整帧时返回 None
    pub fn frames_in_bytes(&self, len: usize) -> Option<usize> {
        let bpf = self.bytes_per_frame();
        if len % bpf == 0 {
            Some(len / bpf)
        } else {
            None
        }
    }

    /// 帧数对应的时长（纳秒）
    pub fn frames_to_ns(&self, frames: u64) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        frames * 1_000_000_000 / self.sample_rate as u64
    }

    /// 将 little-endian 16-bit 字节解码为样本
    ///
    /// 返回写入 `output` 的样本数；末尾不足一个样本的字节被忽略
    pub fn decode_le_bytes(&self, bytes: &[u8], output: &mut [i16]) -> usize {
        let mut written = 0;
        for (slot, chunk) in output.iter_mut().zip(bytes.chunks_exact(BYTES_PER_SAMPLE)) {
            *slot = i16::from_le_bytes([chunk[0], chunk[1]]);
            written += 1;
        }
        written
    }
}

/// 交织立体声样本转为 `(L, R)` 帧
///
/// 样本不足的尾部帧填静音
pub fn fill_stereo_frames(samples: &[i16], frames: &mut [(i16, i16)]) {
    let mut pairs = samples.chunks_exact(2);
    for frame in frames.iter_mut() {
        *frame = match pairs.next() {
            Some(pair) => (pair[0], pair[1]),
            None => (0, 0),
        };
    }
}
