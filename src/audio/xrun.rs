//! Underrun / XRun 监控
//!
//! 两条路径：
//! - 调用方线程的一次性查询 `query_underrun_count`：每次独立，不会因之前失败而停止
//! - 回调路径的 `XrunTracker`：一旦查询失败就在该流的剩余生命周期内永久关闭监控

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use super::backend::XrunSource;
use super::error::QueryError;

/// 查询并校验 underrun 计数
///
/// 引擎返回非 OK 或负数都视为失败，不自动重试
pub fn query_underrun_count<S: XrunSource + ?Sized>(source: &S) -> Result<i32, QueryError> {
    match source.xrun_count() {
        Ok(count) if count < 0 => Err(QueryError::InvalidCount(count)),
        Ok(count) => Ok(count),
        Err(e) => Err(QueryError::Engine(e)),
    }
}

/// 回调路径一次查询的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XrunPoll {
    /// 监控已关闭，本次未查询
    Disabled,
    /// 查询成功，附带相对上次的增量（可能为 0）
    Delta(i32),
    /// 本次查询失败，监控已被关闭
    Failed(QueryError),
}

impl XrunPoll {
    /// 交给生产者的 underrun 增量
    #[inline]
    pub fn delta(&self) -> i32 {
        match self {
            Self::Delta(d) => *d,
            _ => 0,
        }
    }
}

/// 回调路径的 underrun 状态
///
/// 只在引擎线程内修改；调用方线程通过原子读观察
pub struct XrunTracker {
    last_known_count: AtomicI32,
    monitoring_enabled: AtomicBool,
}

impl XrunTracker {
    pub fn new() -> Self {
        Self::with_monitoring(true)
    }

    /// 引擎不支持 xrun 计数时以关闭状态创建
    pub fn with_monitoring(enabled: bool) -> Self {
        Self {
            last_known_count: AtomicI32::new(0),
            monitoring_enabled: AtomicBool::new(enabled),
        }
    }

    /// 每次回调调用一次
    ///
    /// 计数增加时报告增量并更新；计数回退（引擎重置）时只更新，不报告
    #[inline]
    pub fn poll<S: XrunSource + ?Sized>(&self, source: &S) -> XrunPoll {
        if !self.monitoring_enabled.load(Ordering::Relaxed) {
            return XrunPoll::Disabled;
        }

        match query_underrun_count(source) {
            Ok(count) => {
                let last = self.last_known_count.swap(count, Ordering::Relaxed);
                XrunPoll::Delta(count.saturating_sub(last).max(0))
            }
            Err(e) => {
                self.monitoring_enabled.store(false, Ordering::Relaxed);
                XrunPoll::Failed(e)
            }
        }
    }

    #[inline]
    pub fn last_known_count(&self) -> i32 {
        self.last_known_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn monitoring_enabled(&self) -> bool {
        self.monitoring_enabled.load(Ordering::Relaxed)
    }
}

impl Default for XrunTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::error::BackendError;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    /// 按顺序返回预设结果
    struct Scripted(RefCell<VecDeque<Result<i32, BackendError>>>);

    impl Scripted {
        fn new(replies: Vec<Result<i32, BackendError>>) -> Self {
            Self(RefCell::new(replies.into()))
        }
    }

    impl XrunSource for Scripted {
        fn xrun_count(&self) -> Result<i32, BackendError> {
            self.0.borrow_mut().pop_front().unwrap_or(Ok(0))
        }
    }

    #[test]
    fn test_query_rejects_negative() {
        let source = Scripted::new(vec![Ok(-2)]);
        assert_eq!(query_underrun_count(&source), Err(QueryError::InvalidCount(-2)));
    }

    #[test]
    fn test_query_is_independent_of_previous_failures() {
        let source = Scripted::new(vec![Err(BackendError::new(-889, "timeout")), Ok(3)]);
        assert!(query_underrun_count(&source).is_err());
        assert_eq!(query_underrun_count(&source), Ok(3));
    }

    #[test]
    fn test_tracker_reports_increase_as_delta() {
        let tracker = XrunTracker::new();
        let source = Scripted::new(vec![Ok(0), Ok(2), Ok(2), Ok(5)]);

        let deltas: Vec<i32> = (0..4).map(|_| tracker.poll(&source).delta()).collect();
        assert_eq!(deltas, vec![0, 2, 0, 3]);
        assert_eq!(tracker.last_known_count(), 5);
    }

    #[test]
    fn test_tracker_counter_reset_reports_zero() {
        let tracker = XrunTracker::new();
        let source = Scripted::new(vec![Ok(4), Ok(1), Ok(2)]);

        assert_eq!(tracker.poll(&source).delta(), 4);
        assert_eq!(tracker.poll(&source).delta(), 0);
        assert_eq!(tracker.last_known_count(), 1);
        assert_eq!(tracker.poll(&source).delta(), 1);
    }

    #[test]
    fn test_tracker_disables_permanently_after_failure() {
        let tracker = XrunTracker::new();
        let source = Scripted::new(vec![
            Ok(1),
            Err(BackendError::new(-899, "invalid state")),
            Ok(10),
            Ok(20),
        ]);

        assert_eq!(tracker.poll(&source), XrunPoll::Delta(1));
        match tracker.poll(&source) {
            XrunPoll::Failed(e) => assert_eq!(e.code(), -899),
            other => panic!("expected failure, got {:?}", other),
        }
        assert!(!tracker.monitoring_enabled());

        // 之后即使引擎恢复也不再查询
        for _ in 0..2 {
            assert_eq!(tracker.poll(&source), XrunPoll::Disabled);
        }
        assert_eq!(source.0.borrow().len(), 2);
    }

    #[test]
    fn test_tracker_negative_count_disables() {
        let tracker = XrunTracker::new();
        let source = Scripted::new(vec![Ok(-1), Ok(7)]);
        assert!(matches!(tracker.poll(&source), XrunPoll::Failed(QueryError::InvalidCount(-1))));
        assert_eq!(tracker.poll(&source).delta(), 0);
    }
}
