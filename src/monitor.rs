//! Progress reporting and cooperative cancellation.
//!
//! Long operations (pack write, pack receive, revision walk) poll a
//! [`ProgressMonitor`] at well-defined points: per object written, per chunk
//! received, per commit expanded. The monitor doubles as the cancellation
//! token; observing a cancelled monitor between chunks makes the operation
//! fail with its own `Cancelled` variant and clean up partial output.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Receiver for task progress; also carries the cancellation flag.
///
/// Implementations must be cheap: `update` is called on hot paths.
pub trait ProgressMonitor {
    /// Announces a task with an expected work-unit total, or `None` when
    /// the total is unknown.
    fn begin_task(&mut self, title: &str, total: Option<u64>);

    /// Reports `completed` additional work units.
    fn update(&mut self, completed: u64);

    /// Ends the current task.
    fn end_task(&mut self);

    /// Free-form progress text relayed from a peer (sideband channel 2).
    fn text(&mut self, _line: &str) {}

    /// True once the operation should stop at the next safe point.
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Monitor that discards progress and never cancels.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullMonitor;

impl ProgressMonitor for NullMonitor {
    fn begin_task(&mut self, _title: &str, _total: Option<u64>) {}
    fn update(&mut self, _completed: u64) {}
    fn end_task(&mut self) {}
}

/// Shared cancellation flag, usable from another thread.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag {
    flag: Arc<AtomicBool>,
}

impl CancelFlag {
    /// Fresh, un-cancelled flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation; observers stop at their next poll.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// Current state.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Monitor wrapper that adds a [`CancelFlag`] to any inner monitor.
pub struct CancellableMonitor<M> {
    inner: M,
    flag: CancelFlag,
}

impl<M: ProgressMonitor> CancellableMonitor<M> {
    /// Wraps `inner`; `flag` may be shared with other threads.
    pub fn new(inner: M, flag: CancelFlag) -> Self {
        Self { inner, flag }
    }
}

impl<M: ProgressMonitor> ProgressMonitor for CancellableMonitor<M> {
    fn begin_task(&mut self, title: &str, total: Option<u64>) {
        self.inner.begin_task(title, total);
    }

    fn update(&mut self, completed: u64) {
        self.inner.update(completed);
    }

    fn end_task(&mut self) {
        self.inner.end_task();
    }

    fn text(&mut self, line: &str) {
        self.inner.text(line);
    }

    fn is_cancelled(&self) -> bool {
        self.flag.is_cancelled() || self.inner.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_flag_propagates() {
        let flag = CancelFlag::new();
        let mut monitor = CancellableMonitor::new(NullMonitor, flag.clone());
        assert!(!monitor.is_cancelled());
        flag.cancel();
        assert!(monitor.is_cancelled());
        monitor.begin_task("t", Some(1));
        monitor.update(1);
        monitor.end_task();
    }
}
