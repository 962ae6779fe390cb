//! Background task payloads and their worker-side execution.
//!
//! A task is built by the coordinator under the scheduler lock, shipped to
//! a worker over its pipe, executed there (the only I/O-heavy part), and
//! returned through the completion queue for the coordinator to apply
//! metadata and in-memory changes.
//!
//! A task never touches shared LSM state: it carries deep copies of the
//! comparison/key definitions (immune to concurrent schema alter), `Arc`'d
//! sealed memtables or slices, a read-view snapshot, and a policy snapshot,
//! all taken at construction. The worker builds its write iterator from
//! those copies alone.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use crate::memtable::Memtable;
use crate::run::{RunEnv, RunInfo, Slice, writer::RunWriter};
use crate::stmt::KeyDef;
use crate::write_iterator::{DeferredDeleteHandler, WriteIterator};

use super::SchedulerError;
use super::pool::PoolKind;

/// A worker yields (and checks cancellation) every this many statements.
pub const YIELD_LOOPS: u64 = 32;

/// What `execute` produced.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutput {
    /// Not executed (or failed before commit).
    NotRun,
    /// The merge produced no statements; no run file exists.
    Empty,
    /// A committed run with these footer statistics.
    Run(RunInfo),
}

/// Task-class payload.
pub enum TaskKind {
    Dump {
        /// Sealed memtables being dumped, newest first.
        mems: Vec<Arc<Memtable>>,
        /// Largest statement LSN across `mems`; the run's dump LSN.
        dump_lsn: u64,
    },
    Compact {
        range_id: u64,
        /// Compacted slices, newest first; `first`/`last` mark the span
        /// inside the range's slice list.
        slices: Vec<Arc<Slice>>,
        first_slice_id: u64,
        last_slice_id: u64,
        /// Max dump LSN across source runs; the output run's dump LSN.
        dump_lsn: u64,
    },
}

/// A unit of background work, either a dump or a compaction.
pub struct Task {
    pub lsm_id: u64,
    /// Name copy so workers and logs never need the scheduler lock.
    pub lsm_name: String,
    pub space_id: u32,
    pub is_primary: bool,

    /// Deep-copied definitions, valid for the task's whole lifetime.
    pub cmp_def: KeyDef,
    pub key_def: KeyDef,

    /// Policy snapshot.
    pub bloom_fpr: f64,
    pub page_size: usize,

    /// Merge parameters snapshotted at construction.
    pub is_last_level: bool,
    pub read_views: Vec<u64>,
    /// Deferred-delete route (primary-index compaction only).
    pub handler: Option<Box<dyn DeferredDeleteHandler>>,

    /// The prepared (logged) run id this task writes.
    pub run_id: u64,
    pub kind: TaskKind,

    /// Cooperative cancellation token.
    pub cancel: Arc<AtomicBool>,

    pub output: TaskOutput,
    pub error: Option<SchedulerError>,

    /// Where to return the worker after completion.
    pub pool: PoolKind,
    pub worker: usize,
}

impl Task {
    /// Runs the I/O-heavy part on a worker thread: merges the sources into
    /// a run writer, then flushes the deferred-delete route. Success and
    /// failure are both recorded on the task itself.
    pub fn execute(&mut self, env: &RunEnv) {
        match self.execute_inner(env) {
            Ok(output) => self.output = output,
            Err(e) => {
                debug!(lsm = %self.lsm_name, run_id = self.run_id, error = %e, "task failed");
                self.error = Some(e);
            }
        }
    }

    fn execute_inner(&mut self, env: &RunEnv) -> Result<TaskOutput, SchedulerError> {
        let mut wi = WriteIterator::new(
            self.cmp_def.clone(),
            self.is_primary,
            self.is_last_level,
            self.read_views.clone(),
        );
        if let Some(handler) = self.handler.take() {
            wi.set_deferred_handler(handler);
        }
        match &self.kind {
            TaskKind::Dump { mems, .. } => {
                for mem in mems {
                    wi.add_mem(mem);
                }
            }
            TaskKind::Compact { slices, .. } => {
                for slice in slices {
                    wi.add_slice(slice);
                }
            }
        }
        wi.start()?;

        let mut writer = RunWriter::create(env, self.run_id, self.bloom_fpr, self.page_size)?;
        let mut appended = 0u64;
        loop {
            if self.is_cancelled() {
                writer.abort();
                wi.close();
                return Err(SchedulerError::Cancelled);
            }
            let next = match wi.next() {
                Ok(next) => next,
                Err(e) => {
                    writer.abort();
                    wi.close();
                    return Err(e.into());
                }
            };
            let Some((key, stmt)) = next else { break };
            if let Err(e) = writer.append(&key, stmt) {
                writer.abort();
                wi.close();
                return Err(e.into());
            }
            appended += 1;
            if appended % YIELD_LOOPS == 0 {
                if self.is_cancelled() {
                    writer.abort();
                    wi.close();
                    return Err(SchedulerError::Cancelled);
                }
                std::thread::yield_now();
            }
        }

        // The handler flushes its tail batch and sleeps until every
        // in-flight batch is acknowledged; a failed batch cancels us.
        if let Some(mut handler) = wi.close()
            && let Err(e) = handler.finish()
        {
            writer.abort();
            return Err(SchedulerError::DeferredDelete(e.to_string()));
        }

        if appended == 0 {
            writer.abort();
            debug!(lsm = %self.lsm_name, run_id = self.run_id, "task produced no statements");
            return Ok(TaskOutput::Empty);
        }
        let info = writer.commit()?;
        debug!(
            lsm = %self.lsm_name,
            run_id = self.run_id,
            stmts = info.stmt_count,
            "task wrote run"
        );
        Ok(TaskOutput::Run(info))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// True when `execute` recorded a failure.
    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }

    /// Short class name for logs.
    pub fn class(&self) -> &'static str {
        match self.kind {
            TaskKind::Dump { .. } => "dump",
            TaskKind::Compact { .. } => "compaction",
        }
    }
}
