//! Fault injection hooks for error-path testing.
//!
//! Production code consults an injector at its I/O boundaries (run writer
//! appends/commits, metadata-log commits). Tests arm a bounded number of
//! failures; with nothing armed the checks are a single relaxed atomic load.

use std::sync::atomic::{AtomicU32, Ordering};

/// Armable failure counters shared between tests and I/O paths.
#[derive(Debug, Default)]
pub struct FaultInjector {
    run_writes: AtomicU32,
    log_commits: AtomicU32,
}

impl FaultInjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms the next `n` run-writer appends/commits to fail.
    pub fn fail_run_writes(&self, n: u32) {
        self.run_writes.store(n, Ordering::SeqCst);
    }

    /// Arms the next `n` metadata-log commits to fail.
    pub fn fail_log_commits(&self, n: u32) {
        self.log_commits.store(n, Ordering::SeqCst);
    }

    /// Consumes one armed run-write failure, if any.
    pub fn take_run_write(&self) -> bool {
        Self::take(&self.run_writes)
    }

    /// Consumes one armed log-commit failure, if any.
    pub fn take_log_commit(&self) -> bool {
        Self::take(&self.log_commits)
    }

    fn take(counter: &AtomicU32) -> bool {
        if counter.load(Ordering::Relaxed) == 0 {
            return false;
        }
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}
