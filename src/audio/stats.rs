//! 流统计
//!
//! 在引擎回调和写入路径中收集，全部为 Relaxed 原子操作，适合实时线程

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

/// 流统计收集器
pub struct StreamStats {
    callback_count: AtomicU64,
    frames_rendered: AtomicU64,
    frames_written: AtomicU64,
    write_calls: AtomicU64,
    short_writes: AtomicU64,

    /// 报告给生产者的 underrun 增量之和
    underruns_reported: AtomicU64,
    monitor_failed: AtomicBool,

    /// 关闭前最后一次查询的结果（-1 表示未查询或失败）
    final_underrun_count: AtomicI64,
}

impl StreamStats {
    pub fn new() -> Self {
        Self {
            callback_count: AtomicU64::new(0),
            frames_rendered: AtomicU64::new(0),
            frames_written: AtomicU64::new(0),
            write_calls: AtomicU64::new(0),
            short_writes: AtomicU64::new(0),
            underruns_reported: AtomicU64::new(0),
            monitor_failed: AtomicBool::new(false),
            final_underrun_count: AtomicI64::new(-1),
        }
    }

    /// 在引擎回调内调用
    #[inline]
    pub fn on_callback(&self, frames: usize) {
        self.callback_count.fetch_add(1, Ordering::Relaxed);
        self.frames_rendered.fetch_add(frames as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_underruns(&self, delta: i32) {
        if delta > 0 {
            self.underruns_reported.fetch_add(delta as u64, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_monitor_failure(&self) {
        self.monitor_failed.store(true, Ordering::Relaxed);
    }

    pub fn on_write(&self, requested: usize, written: usize) {
        self.write_calls.fetch_add(1, Ordering::Relaxed);
        self.frames_written.fetch_add(written as u64, Ordering::Relaxed);
        if written < requested {
            self.short_writes.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn set_final_underrun_count(&self, count: Option<i32>) {
        let value = count.map(i64::from).unwrap_or(-1);
        self.final_underrun_count.store(value, Ordering::Relaxed);
    }

    #[inline]
    pub fn callback_count(&self) -> u64 {
        self.callback_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn frames_written(&self) -> u64 {
        self.frames_written.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn underruns_reported(&self) -> u64 {
        self.underruns_reported.load(Ordering::Relaxed)
    }

    /// 生成报告
    pub fn report(&self, sample_rate: i32) -> StatsReport {
        let final_count = self.final_underrun_count.load(Ordering::Relaxed);
        StatsReport {
            sample_rate,
            callback_count: self.callback_count(),
            frames_rendered: self.frames_rendered(),
            frames_written: self.frames_written(),
            write_calls: self.write_calls.load(Ordering::Relaxed),
            short_writes: self.short_writes.load(Ordering::Relaxed),
            underruns_reported: self.underruns_reported(),
            monitor_failed: self.monitor_failed.load(Ordering::Relaxed),
            final_underrun_count: if final_count >= 0 {
                Some(final_count)
            } else {
                None
            },
        }
    }
}

impl Default for StreamStats {
    fn default() -> Self {
        Self::new()
    }
}

/// 统计报告
#[derive(Debug, Clone)]
pub struct StatsReport {
    pub sample_rate: i32,
    pub callback_count: u64,
    pub frames_rendered: u64,
    pub frames_written: u64,
    pub write_calls: u64,
    pub short_writes: u64,
    pub underruns_reported: u64,
    pub monitor_failed: bool,
    pub final_underrun_count: Option<i64>,
}

impl StatsReport {
    /// 已交给引擎的音频时长（秒）
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate <= 0 {
            return 0.0;
        }
        (self.frames_rendered + self.frames_written) as f64 / self.sample_rate as f64
    }
}

impl std::fmt::Display for StatsReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Stream Statistics")?;
        writeln!(f, "=================")?;
        if self.callback_count > 0 {
            writeln!(f, "Callbacks: {}", self.callback_count)?;
            writeln!(f, "Frames rendered: {}", self.frames_rendered)?;
        }
        if self.write_calls > 0 {
            writeln!(f, "Write calls: {}", self.write_calls)?;
            writeln!(f, "Frames written: {}", self.frames_written)?;
            writeln!(f, "Short writes: {}", self.short_writes)?;
        }
        writeln!(f, "Audio delivered: {:.2} s", self.duration_secs())?;
        writeln!(f)?;

        writeln!(f, "Underruns reported: {}", self.underruns_reported)?;
        if self.monitor_failed {
            writeln!(f, "  (monitoring disabled after query failure)")?;
        }
        match self.final_underrun_count {
            Some(n) => writeln!(f, "Final underrun count: {}", n)?,
            None => writeln!(f, "Final underrun count: unavailable")?,
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = StreamStats::new();
        stats.on_callback(192);
        stats.on_callback(192);
        stats.record_underruns(2);
        stats.record_underruns(0);
        stats.on_write(512, 512);
        stats.on_write(512, 100);

        let report = stats.report(48000);
        assert_eq!(report.callback_count, 2);
        assert_eq!(report.frames_rendered, 384);
        assert_eq!(report.frames_written, 612);
        assert_eq!(report.short_writes, 1);
        assert_eq!(report.underruns_reported, 2);
        assert_eq!(report.final_underrun_count, None);
    }

    #[test]
    fn test_final_count() {
        let stats = StreamStats::new();
        stats.set_final_underrun_count(Some(3));
        assert_eq!(stats.report(48000).final_underrun_count, Some(3));
        stats.set_final_underrun_count(None);
        assert_eq!(stats.report(48000).final_underrun_count, None);
    }

    #[test]
    fn test_report_display() {
        let stats = StreamStats::new();
        stats.on_callback(480);
        stats.record_monitor_failure();
        let text = stats.report(48000).to_string();
        assert!(text.contains("Callbacks: 1"));
        assert!(text.contains("monitoring disabled"));
        assert!(text.contains("Final underrun count: unavailable"));
    }
}
