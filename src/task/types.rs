//! Task types
//!
//! Stop signalling and statistics for the poll loop.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared stop flag, checked between every sleep slice of the poll loop
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    /// Create a handle in the running state
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the task to stop at the next loop boundary
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Counters collected by a running task
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskStats {
    /// Non-empty batches returned by `poll`
    pub polls: usize,
    /// Records returned across all batches
    pub records: usize,
    /// Cycles aborted by a transient SQL failure
    pub transient_failures: usize,
    /// Runs deferred by a pre-processing gate
    pub deferred_runs: usize,
    /// Exhausted cursors whose post-processing succeeded
    pub completed_runs: usize,
    /// Exhausted cursors whose post-processing skipped the commit
    pub incomplete_runs: usize,
}

impl TaskStats {
    /// Create new stats
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a returned batch
    pub fn add_batch(&mut self, records: usize) {
        self.polls += 1;
        self.records += records;
    }

    /// Record a post-processing outcome
    pub fn add_run(&mut self, completed: bool) {
        if completed {
            self.completed_runs += 1;
        } else {
            self.incomplete_runs += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_handle_is_shared() {
        let handle = StopHandle::new();
        let clone = handle.clone();
        assert!(!handle.is_stopped());
        clone.stop();
        assert!(handle.is_stopped());
    }

    #[test]
    fn test_stats_counters() {
        let mut stats = TaskStats::new();
        stats.add_batch(3);
        stats.add_batch(2);
        stats.add_run(true);
        stats.add_run(false);

        assert_eq!(stats.polls, 2);
        assert_eq!(stats.records, 5);
        assert_eq!(stats.completed_runs, 1);
        assert_eq!(stats.incomplete_runs, 1);
    }
}
