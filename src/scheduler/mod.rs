//! # Background maintenance scheduler
//!
//! Orchestrates memory-to-disk dumps and on-disk compactions across every
//! registered LSM tree. One *coordinator* thread owns all tree state and
//! the two priority heaps; fixed pools of worker threads perform the
//! I/O-heavy task bodies and hand the tasks back for completion.
//!
//! ## One coordinator iteration
//!
//! 1. Route queued deferred-delete batches into the host sink.
//! 2. Drain the completion queue, applying metadata-log and in-memory
//!    changes (or aborting failed / dropped-tree tasks).
//! 3. A successful completion resets the failure throttle and loops.
//! 4. Otherwise try to schedule: a dump while a round is in progress,
//!    else the highest-priority compaction.
//! 5. A produced task ships to an idle worker over its pipe.
//! 6. With nothing to do, wait on the scheduler condition.
//! 7. After a failure, double the throttle timeout (clamped to 1–60 s),
//!    sleep it off, and signal the dump condition so a pending checkpoint
//!    fails fast instead of stalling.
//!
//! ## Dump rounds and checkpoints
//!
//! `generation` is the target epoch, `dump_generation` the round being
//! dumped. A round ends when no dump task is outstanding and every tree's
//! oldest memtable generation has moved past `dump_generation`; the round
//! duration is reported through the user's dump-completion callback.
//! `begin_checkpoint` bumps the generation and defers any later
//! `trigger_dump` until `end_checkpoint`, keeping WAL-rotated data out of
//! the snapshot.

#[cfg(test)]
mod tests;

pub mod deferred;
pub mod heap;
pub mod pool;
pub mod task;

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::lsm::{LsmConfig, LsmTree};
use crate::metalog::{MetaLog, MetaLogError, MetaRecord};
use crate::run::{Run, RunEnv, RunError, Slice};
use crate::stmt::{Statement, Tuple};
use crate::write_iterator::{WriteIterator, WriteIteratorError};

use deferred::{DeferredDeleteBatch, DeferredRouteHandler, DeferredShared};
use heap::{CompactKey, DumpKey, PosHeap};
use pool::{PoolKind, WorkerPool};
use task::{Task, TaskKind, TaskOutput};

pub use deferred::{
    DEFERRED_DELETE_BATCH_MAX, DEFERRED_DELETE_MAX_IN_FLIGHT, DeferredDeleteSink,
    NoopDeferredDeleteSink,
};
pub use task::YIELD_LOOPS;

/// Throttle bounds for consecutive background failures.
pub const THROTTLE_MIN: Duration = Duration::from_secs(1);
pub const THROTTLE_MAX: Duration = Duration::from_secs(60);

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors surfaced by the scheduler and its tasks.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Metadata-log failure (commit is the atomic linearisation point).
    #[error("Metadata log error: {0}")]
    MetaLog(#[from] MetaLogError),

    /// Run writer or run file failure.
    #[error("Run error: {0}")]
    Run(#[from] RunError),

    /// The merge stream failed.
    #[error("Write iterator error: {0}")]
    WriteIterator(#[from] WriteIteratorError),

    /// The deferred-delete DML failed or hit a secondary-index violation.
    #[error("Deferred delete error: {0}")]
    DeferredDelete(String),

    /// The task was cancelled.
    #[error("Task cancelled")]
    Cancelled,

    /// The scheduler is throttled after repeated failures.
    #[error("Scheduler throttled: {0}")]
    Throttled(String),

    /// No LSM tree registered under this id.
    #[error("Unknown LSM tree {0}")]
    UnknownLsm(u64),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Internal invariant violation.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Configuration and observability
// ------------------------------------------------------------------------------------------------

/// Scheduler-wide configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Total background write threads, split `max(1, n/4)` for dumps and
    /// the rest for compactions. Must exceed 1.
    pub write_threads: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { write_threads: 4 }
    }
}

/// Point-in-time scheduler counters returned by [`Scheduler::stats`].
#[derive(Debug, Clone)]
pub struct SchedulerStats {
    pub generation: u64,
    pub dump_generation: u64,
    pub dump_task_count: usize,
    pub compact_task_count: usize,
    pub is_throttled: bool,
    pub throttle_timeout: Duration,
    pub checkpoint_in_progress: bool,
    pub last_error: Option<String>,
    pub tree_count: usize,
}

/// Per-range observability snapshot.
#[derive(Debug, Clone)]
pub struct RangeInfo {
    pub interval: String,
    pub slice_count: usize,
    pub compact_priority: usize,
    pub version: u64,
    pub run_ids: Vec<u64>,
}

/// Per-tree observability snapshot returned by [`Scheduler::lsm_info`].
#[derive(Debug, Clone)]
pub struct LsmInfo {
    pub name: String,
    pub generation: u64,
    pub active_stmts: usize,
    pub sealed_count: usize,
    pub run_count: usize,
    pub dump_lsn: u64,
    pub is_dumping: bool,
    pub pin_count: u32,
    pub ranges: Vec<RangeInfo>,
}

/// Round-completion callback: `(min_generation - 1, round_duration)`.
pub type DumpCompleteCb = dyn Fn(u64, Duration) + Send + Sync;

/// Supplies the LSNs of currently-open read views.
pub type ReadViewFn = dyn Fn() -> Vec<u64> + Send + Sync;

// ------------------------------------------------------------------------------------------------
// Shared state
// ------------------------------------------------------------------------------------------------

struct SchedulerState {
    trees: HashMap<u64, LsmTree>,
    dump_heap: PosHeap<DumpKey>,
    compact_heap: PosHeap<CompactKey>,

    /// Finished tasks pushed by workers; drained by the coordinator. Lives
    /// under the state mutex so a condvar wakeup cannot be lost.
    completed: VecDeque<Box<Task>>,
    /// Deferred-delete batches awaiting the host sink.
    deferred: VecDeque<DeferredDeleteBatch>,

    generation: u64,
    dump_generation: u64,
    dump_start: Instant,
    dump_task_count: usize,
    compact_task_count: usize,

    checkpoint_in_progress: bool,
    checkpoint_generation: u64,
    dump_pending: bool,

    is_throttled: bool,
    throttle: Duration,
    last_error: Option<String>,
}

struct Shared {
    state: Mutex<SchedulerState>,
    sched_cond: Condvar,
    dump_cond: Condvar,

    dump_pool: Mutex<WorkerPool>,
    compact_pool: Mutex<WorkerPool>,

    env: Arc<RunEnv>,
    metalog: Arc<MetaLog>,
    dump_complete_cb: Box<DumpCompleteCb>,
    read_views: Box<ReadViewFn>,
    sink: Arc<dyn DeferredDeleteSink>,
    deferred_submit: deferred::DeferredSubmitFn,
    shutdown: AtomicBool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// The scheduler handle exposed to the rest of the engine.
pub struct Scheduler {
    shared: Arc<Shared>,
    coordinator: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Scheduler {
    /// Creates the scheduler. The coordinator does not run until
    /// [`Scheduler::start`].
    ///
    /// Construction replays the metadata log and sweeps the run directory:
    /// files no committed state accounts for (torn temporaries, forgotten
    /// runs, post-checkpoint dropped runs whose removal was lost in a
    /// crash) are deleted here.
    pub fn new(
        config: SchedulerConfig,
        env: RunEnv,
        metalog: MetaLog,
        dump_complete_cb: impl Fn(u64, Duration) + Send + Sync + 'static,
        read_views: impl Fn() -> Vec<u64> + Send + Sync + 'static,
        sink: Arc<dyn DeferredDeleteSink>,
    ) -> Result<Self, SchedulerError> {
        if config.write_threads <= 1 {
            return Err(SchedulerError::Config(format!(
                "write_threads must exceed 1, got {}",
                config.write_threads
            )));
        }
        let dump_threads = (config.write_threads / 4).max(1);
        let compact_threads = config.write_threads - dump_threads;

        let swept = env.sweep_orphans(&metalog.replay()?)?;
        if swept > 0 {
            info!(swept, "recovery removed orphan run files");
        }
        let env = Arc::new(env);

        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let completion = |weak: Weak<Shared>| -> pool::CompleteFn {
                Arc::new(move |task: Box<Task>| {
                    if let Some(shared) = weak.upgrade() {
                        shared.lock().completed.push_back(task);
                        shared.sched_cond.notify_all();
                    }
                })
            };
            let submit_weak = weak.clone();
            let deferred_submit: deferred::DeferredSubmitFn =
                Arc::new(move |batch: DeferredDeleteBatch| {
                    if let Some(shared) = submit_weak.upgrade() {
                        shared.lock().deferred.push_back(batch);
                        shared.sched_cond.notify_all();
                    }
                });

            Shared {
                state: Mutex::new(SchedulerState {
                    trees: HashMap::new(),
                    dump_heap: PosHeap::new(),
                    compact_heap: PosHeap::new(),
                    completed: VecDeque::new(),
                    deferred: VecDeque::new(),
                    generation: 0,
                    dump_generation: 0,
                    dump_start: Instant::now(),
                    dump_task_count: 0,
                    compact_task_count: 0,
                    checkpoint_in_progress: false,
                    checkpoint_generation: 0,
                    dump_pending: false,
                    is_throttled: false,
                    throttle: Duration::ZERO,
                    last_error: None,
                }),
                sched_cond: Condvar::new(),
                dump_cond: Condvar::new(),
                dump_pool: Mutex::new(WorkerPool::new(
                    PoolKind::Dump,
                    dump_threads,
                    Arc::clone(&env),
                    completion(weak.clone()),
                )),
                compact_pool: Mutex::new(WorkerPool::new(
                    PoolKind::Compact,
                    compact_threads,
                    Arc::clone(&env),
                    completion(weak.clone()),
                )),
                env,
                metalog: Arc::new(metalog),
                dump_complete_cb: Box::new(dump_complete_cb),
                read_views: Box::new(read_views),
                sink,
                deferred_submit,
                shutdown: AtomicBool::new(false),
            }
        });

        info!(
            write_threads = config.write_threads,
            dump_threads, compact_threads, "scheduler created"
        );
        Ok(Self {
            shared,
            coordinator: Mutex::new(None),
        })
    }

    /// Starts the coordinator thread. Idempotent.
    pub fn start(&self) {
        let mut slot = self.coordinator.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("strata-scheduler".into())
            .spawn(move || coordinator_loop(&shared))
            .expect("spawn coordinator thread");
        *slot = Some(handle);
        info!("scheduler started");
    }

    /// Stops the coordinator and worker threads. Uncommitted prepared runs
    /// are swept as orphans on the next recovery.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.sched_cond.notify_all();
        self.shared.dump_cond.notify_all();
        if let Some(handle) = self
            .coordinator
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            && handle.join().is_err()
        {
            warn!("coordinator thread panicked");
        }
        self.shared
            .dump_pool
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .shutdown();
        self.shared
            .compact_pool
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .shutdown();
        info!("scheduler stopped");
    }

    // --------------------------------------------------------------------
    // Registration and DML entry
    // --------------------------------------------------------------------

    /// Registers an LSM tree and returns its id.
    pub fn add_lsm(&self, config: LsmConfig) -> u64 {
        let id = self.shared.metalog.next_id();
        let range_id = self.shared.metalog.next_id();
        let mut state = self.shared.lock();
        let tree = LsmTree::new(id, range_id, state.generation, config);
        let dump_key = dump_key_of(&tree);
        let compact_key = CompactKey::new(tree.compact_priority());
        state.trees.insert(id, tree);
        state.dump_heap.insert(id, dump_key);
        state.compact_heap.insert(id, compact_key);
        self.shared.sched_cond.notify_all();
        id
    }

    /// Drops an LSM tree: it loses its heap positions immediately and any
    /// in-flight task for it aborts silently on completion.
    pub fn remove_lsm(&self, lsm_id: u64) {
        let mut state = self.shared.lock();
        let Some(tree) = state.trees.get_mut(&lsm_id) else {
            return;
        };
        tree.is_dropped = true;
        let busy = tree.is_dumping || tree.ranges.iter().any(|r| r.is_compacting);
        info!(lsm = %tree.name, busy, "LSM tree dropped");
        state.dump_heap.remove(lsm_id);
        state.compact_heap.remove(lsm_id);
        if !busy {
            state.trees.remove(&lsm_id);
        }
        complete_dump_round(&self.shared, &mut state);
        self.shared.sched_cond.notify_all();
    }

    /// Applies one statement to a tree's active memtable (the transactional
    /// engine's write path into this crate).
    pub fn apply(&self, lsm_id: u64, stmt: Statement) -> Result<(), SchedulerError> {
        let mut state = self.shared.lock();
        let generation = state.generation;
        let tree = state
            .trees
            .get_mut(&lsm_id)
            .ok_or(SchedulerError::UnknownLsm(lsm_id))?;
        if tree.active.generation() < generation {
            // A dump round started since the last write; new statements
            // must land in a current-generation memtable.
            tree.rotate_mem(generation);
        }
        let key = tree.cmp_def.extract(&stmt.tuple);
        tree.active.insert(key, stmt);
        Ok(())
    }

    // --------------------------------------------------------------------
    // Dump and compaction triggers
    // --------------------------------------------------------------------

    /// Requests a dump round to release memory. Idempotent while a round is
    /// in progress; deferred while a checkpoint is in progress.
    pub fn trigger_dump(&self) {
        let mut state = self.shared.lock();
        if state.checkpoint_in_progress {
            state.dump_pending = true;
            debug!("dump deferred until end of checkpoint");
            return;
        }
        if state.generation == state.dump_generation {
            state.generation += 1;
            state.dump_start = Instant::now();
            info!(generation = state.generation, "dump round triggered");
            self.shared.sched_cond.notify_all();
        }
    }

    /// Requests a dump round and waits for it to complete.
    pub fn dump(&self) -> Result<(), SchedulerError> {
        self.trigger_dump();
        let mut state = self.shared.lock();
        let target = state.generation;
        while state.dump_generation < target {
            if state.is_throttled {
                return Err(SchedulerError::Throttled(
                    state.last_error.clone().unwrap_or_default(),
                ));
            }
            if self.shared.shutdown.load(Ordering::SeqCst) {
                return Err(SchedulerError::Cancelled);
            }
            state = self
                .shared
                .dump_cond
                .wait_timeout(state, Duration::from_millis(100))
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
        Ok(())
    }

    /// Forces compaction of every range of the tree.
    pub fn force_compaction(&self, lsm_id: u64) -> Result<(), SchedulerError> {
        let mut state = self.shared.lock();
        let tree = state
            .trees
            .get_mut(&lsm_id)
            .ok_or(SchedulerError::UnknownLsm(lsm_id))?;
        tree.force_compaction();
        let key = CompactKey::new(tree.compact_priority());
        state.compact_heap.update(lsm_id, key);
        self.shared.sched_cond.notify_all();
        Ok(())
    }

    // --------------------------------------------------------------------
    // Checkpoints
    // --------------------------------------------------------------------

    /// Starts a checkpoint: fails fast while throttled, otherwise bumps the
    /// generation so the triggered dump round captures all current memory.
    pub fn begin_checkpoint(&self) -> Result<u64, SchedulerError> {
        let mut state = self.shared.lock();
        if state.is_throttled {
            return Err(SchedulerError::Throttled(
                state.last_error.clone().unwrap_or_default(),
            ));
        }
        state.generation += 1;
        state.checkpoint_in_progress = true;
        state.checkpoint_generation = state.generation;
        state.dump_start = Instant::now();
        info!(generation = state.generation, "checkpoint started");
        self.shared.sched_cond.notify_all();
        Ok(state.checkpoint_generation)
    }

    /// Waits for the checkpoint-triggered dump round; errors while
    /// throttled so the checkpoint fails fast with the last scheduler error.
    pub fn wait_checkpoint(&self) -> Result<(), SchedulerError> {
        let mut state = self.shared.lock();
        let target = state.checkpoint_generation;
        while state.dump_generation < target {
            if state.is_throttled {
                return Err(SchedulerError::Throttled(
                    state.last_error.clone().unwrap_or_default(),
                ));
            }
            if self.shared.shutdown.load(Ordering::SeqCst) {
                return Err(SchedulerError::Cancelled);
            }
            state = self
                .shared
                .dump_cond
                .wait_timeout(state, Duration::from_millis(100))
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
        Ok(())
    }

    /// Ends the checkpoint, recording its signature and firing any dump
    /// request deferred while it was in progress.
    pub fn end_checkpoint(&self) {
        let pending = {
            let mut state = self.shared.lock();
            if !state.checkpoint_in_progress {
                return;
            }
            state.checkpoint_in_progress = false;
            let signature = state.trees.values().map(|t| t.dump_lsn).max().unwrap_or(0);
            self.shared.metalog.set_checkpoint_signature(signature);
            info!(signature, "checkpoint ended");
            std::mem::take(&mut state.dump_pending)
        };
        if pending {
            self.trigger_dump();
        }
    }

    // --------------------------------------------------------------------
    // Observability
    // --------------------------------------------------------------------

    /// Point-in-time scheduler counters.
    pub fn stats(&self) -> SchedulerStats {
        let state = self.shared.lock();
        SchedulerStats {
            generation: state.generation,
            dump_generation: state.dump_generation,
            dump_task_count: state.dump_task_count,
            compact_task_count: state.compact_task_count,
            is_throttled: state.is_throttled,
            throttle_timeout: state.throttle,
            checkpoint_in_progress: state.checkpoint_in_progress,
            last_error: state.last_error.clone(),
            tree_count: state.trees.len(),
        }
    }

    /// Snapshot of one tree's structure, if registered.
    pub fn lsm_info(&self, lsm_id: u64) -> Option<LsmInfo> {
        let state = self.shared.lock();
        let tree = state.trees.get(&lsm_id)?;
        Some(LsmInfo {
            name: tree.name.clone(),
            generation: tree.generation(),
            active_stmts: tree.active.len(),
            sealed_count: tree.sealed.len(),
            run_count: tree.runs.len(),
            dump_lsn: tree.dump_lsn,
            is_dumping: tree.is_dumping,
            pin_count: tree.pin_count,
            ranges: tree
                .ranges
                .iter()
                .map(|r| RangeInfo {
                    interval: r.interval_string(),
                    slice_count: r.slices.len(),
                    compact_priority: r.compact_priority,
                    version: r.version,
                    run_ids: r.slices.iter().map(|s| s.run.id).collect(),
                })
                .collect(),
        })
    }

    /// The metadata log (recovery and test surface).
    pub fn metalog(&self) -> &MetaLog {
        &self.shared.metalog
    }

    /// The run environment (fault injection and test surface).
    pub fn env(&self) -> &RunEnv {
        &self.shared.env
    }

    /// Merges every layer of a tree into the currently-visible rows, newest
    /// version per key with deletes applied. Test and inspection surface.
    pub fn visible_rows(&self, lsm_id: u64) -> Result<Vec<(u64, Tuple)>, SchedulerError> {
        let state = self.shared.lock();
        let tree = state
            .trees
            .get(&lsm_id)
            .ok_or(SchedulerError::UnknownLsm(lsm_id))?;
        let mut wi = WriteIterator::new((*tree.cmp_def).clone(), tree.is_primary, true, Vec::new());
        let active = Arc::new({
            let mut copy = crate::memtable::Memtable::new(tree.active.generation());
            for (key, stmt) in tree.active.iter() {
                copy.insert(key.clone(), stmt.clone());
            }
            copy
        });
        wi.add_mem(&active);
        for mem in tree.sealed.iter().rev() {
            wi.add_mem(mem);
        }
        for range in &tree.ranges {
            for slice in &range.slices {
                wi.add_slice(slice);
            }
        }
        wi.start()?;
        let mut rows = Vec::new();
        while let Some((_, stmt)) = wi.next()? {
            if !stmt.is_delete() {
                rows.push((stmt.lsn, stmt.tuple));
            }
        }
        wi.close();
        Ok(rows)
    }

    /// Waits until no background work is runnable or in flight.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock();
        loop {
            let compact_wanted = state
                .compact_heap
                .top()
                .map(|(key, _)| key.priority() > 1)
                .unwrap_or(false);
            let busy = !state.completed.is_empty()
                || !state.deferred.is_empty()
                || state.dump_task_count > 0
                || state.compact_task_count > 0
                || state.dump_generation < state.generation
                || compact_wanted;
            if !busy {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .shared
                .sched_cond
                .wait_timeout(state, (deadline - now).min(Duration::from_millis(50)))
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ------------------------------------------------------------------------------------------------
// Coordinator loop
// ------------------------------------------------------------------------------------------------

enum Scheduled {
    /// A task shipped to a worker.
    Shipped,
    /// State changed without producing a task; rescan immediately.
    Retry,
    /// Nothing to do until a notification.
    Idle,
}

enum Completion {
    Ok,
    Failed,
    /// The owning tree was dropped; silent abort.
    Dropped,
}

fn coordinator_loop(shared: &Arc<Shared>) {
    debug!("coordinator running");
    let mut guard = shared.lock();
    loop {
        if shared.shutdown.load(Ordering::SeqCst) {
            break;
        }

        // Deferred-delete batches first: a blocked worker may be waiting on
        // the acknowledgement. The sink runs outside the state lock.
        if let Some(batch) = guard.deferred.pop_front() {
            drop(guard);
            route_deferred_batch(shared, batch);
            guard = shared.lock();
            continue;
        }

        let mut completed_ok = false;
        let mut failed = false;
        while let Some(task) = guard.completed.pop_front() {
            match handle_completion(shared, &mut guard, *task) {
                Completion::Ok => completed_ok = true,
                Completion::Failed => failed = true,
                Completion::Dropped => {}
            }
        }
        if completed_ok {
            // Completion can yield; new completions may already be queued.
            guard.throttle = Duration::ZERO;
            shared.sched_cond.notify_all();
            continue;
        }
        if failed {
            guard = throttle(shared, guard);
            continue;
        }

        match schedule(shared, &mut guard) {
            Ok(Scheduled::Shipped) | Ok(Scheduled::Retry) => continue,
            Ok(Scheduled::Idle) => {
                shared.sched_cond.notify_all();
                guard = shared
                    .sched_cond
                    .wait_timeout(guard, Duration::from_millis(250))
                    .unwrap_or_else(|e| e.into_inner())
                    .0;
            }
            Err(e) => {
                error!(error = %e, "scheduling failed");
                guard.last_error = Some(e.to_string());
                guard = throttle(shared, guard);
            }
        }
    }
    debug!("coordinator exiting");
}

/// Step 7: double the timeout (clamped), sleep it off, signal waiters.
fn throttle<'a>(
    shared: &'a Shared,
    mut guard: MutexGuard<'a, SchedulerState>,
) -> MutexGuard<'a, SchedulerState> {
    let next = if guard.throttle.is_zero() {
        THROTTLE_MIN
    } else {
        (guard.throttle * 2).min(THROTTLE_MAX)
    };
    guard.throttle = next;
    guard.is_throttled = true;
    warn!(
        timeout_secs = next.as_secs(),
        error = guard.last_error.as_deref().unwrap_or(""),
        "scheduler throttled"
    );
    // A pending checkpoint must fail fast rather than stall.
    shared.dump_cond.notify_all();

    let deadline = Instant::now() + next;
    while !shared.shutdown.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        guard = shared
            .sched_cond
            .wait_timeout(guard, deadline - now)
            .unwrap_or_else(|e| e.into_inner())
            .0;
    }
    guard.is_throttled = false;
    shared.dump_cond.notify_all();
    guard
}

/// Routes one batch into the host sink and acknowledges it.
fn route_deferred_batch(shared: &Shared, batch: DeferredDeleteBatch) {
    let rows: Vec<(u64, Tuple)> = batch
        .pairs
        .iter()
        .map(|(old, new)| (new.lsn, batch.key_def.surrogate_delete(old, new.lsn).tuple))
        .collect();
    match shared.sink.apply(batch.space_id, &rows) {
        Ok(()) => batch.shared.ack(None),
        Err(e) => {
            error!(space_id = batch.space_id, error = %e, "deferred delete DML failed");
            // The diagnostic rides home on the batch; the owning task's
            // fiber is cancelled so the worker wakes and fails the task.
            batch.cancel.store(true, Ordering::SeqCst);
            batch.shared.ack(Some(e.to_string()));
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Completion handling
// ------------------------------------------------------------------------------------------------

fn handle_completion(shared: &Shared, state: &mut SchedulerState, mut task: Task) -> Completion {
    let dropped = state
        .trees
        .get(&task.lsm_id)
        .map(|t| t.is_dropped)
        .unwrap_or(true);

    let outcome = if dropped || task.is_failed() {
        abort_task(shared, state, &mut task, dropped);
        if dropped { Completion::Dropped } else { Completion::Failed }
    } else {
        let result = match &task.kind {
            TaskKind::Dump { .. } => complete_dump(shared, state, &mut task),
            TaskKind::Compact { .. } => complete_compact(shared, state, &mut task),
        };
        match result {
            Ok(()) => Completion::Ok,
            Err(e) => {
                task.error = Some(e);
                abort_task(shared, state, &mut task, false);
                Completion::Failed
            }
        }
    };

    match task.pool {
        PoolKind::Dump => shared
            .dump_pool
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .put(task.worker),
        PoolKind::Compact => shared
            .compact_pool
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .put(task.worker),
    }
    reap_dropped(state, task.lsm_id);
    outcome
}

/// Removes a dropped tree once no task references it.
fn reap_dropped(state: &mut SchedulerState, lsm_id: u64) {
    if let Some(tree) = state.trees.get(&lsm_id)
        && tree.is_dropped
        && !tree.is_dumping
        && !tree.ranges.iter().any(|r| r.is_compacting)
    {
        state.trees.remove(&lsm_id);
    }
}

/// Dump completion: make the new run visible, free dumped memtables,
/// advance the round.
fn complete_dump(
    shared: &Shared,
    state: &mut SchedulerState,
    task: &mut Task,
) -> Result<(), SchedulerError> {
    let TaskKind::Dump { dump_lsn, mems } = &task.kind else {
        return Err(SchedulerError::Internal("dump completion on non-dump".into()));
    };
    let dump_lsn = *dump_lsn;
    let mem_count = mems.len();
    let dump_generation = state.dump_generation;

    match std::mem::replace(&mut task.output, TaskOutput::NotRun) {
        TaskOutput::Run(info) => {
            let run = Arc::new(Run::open(&shared.env, task.run_id, dump_lsn)?);
            let min_key = run.info.min_key.clone().ok_or_else(|| {
                SchedulerError::Internal("committed run without key bounds".into())
            })?;
            let max_key = run.info.max_key.clone().ok_or_else(|| {
                SchedulerError::Internal("committed run without key bounds".into())
            })?;
            debug_assert_eq!(info.stmt_count, run.info.stmt_count);

            let tree = state
                .trees
                .get(&task.lsm_id)
                .ok_or(SchedulerError::UnknownLsm(task.lsm_id))?;
            let targets: Vec<(usize, u64, Option<crate::stmt::Key>, Option<crate::stmt::Key>)> =
                tree.intersecting_ranges(&min_key, &max_key)
                    .into_iter()
                    .map(|i| {
                        let r = &tree.ranges[i];
                        (i, r.id, r.begin.clone(), r.end.clone())
                    })
                    .collect();

            let slice_ids: Vec<u64> = targets
                .iter()
                .map(|_| shared.metalog.next_id())
                .collect();

            let mut tx = shared.metalog.begin();
            tx.write(MetaRecord::CreateRun {
                lsm_id: task.lsm_id,
                run_id: task.run_id,
                dump_lsn,
            });
            for ((_, _, begin, end), slice_id) in targets.iter().zip(&slice_ids) {
                tx.write(MetaRecord::InsertSlice {
                    lsm_id: task.lsm_id,
                    run_id: task.run_id,
                    slice_id: *slice_id,
                    begin: begin.clone(),
                    end: end.clone(),
                });
            }
            tx.write(MetaRecord::DumpLsm {
                lsm_id: task.lsm_id,
                dump_lsn,
            });
            // The commit is the linearisation point: on failure the
            // in-memory state below stays untouched.
            tx.commit()?;

            let tree = state
                .trees
                .get_mut(&task.lsm_id)
                .ok_or(SchedulerError::UnknownLsm(task.lsm_id))?;
            tree.add_run(Arc::clone(&run));
            // No suspension from here to the end of the insertion: readers
            // observe either none or all of the new slices.
            for ((idx, _, begin, end), slice_id) in targets.iter().zip(&slice_ids) {
                let slice = Slice::new(*slice_id, Arc::clone(&run), begin.clone(), end.clone());
                let range = &mut tree.ranges[*idx];
                range.slices.push_front(slice);
                range.version += 1;
            }
            let opts = tree.opts.clone();
            for (idx, ..) in &targets {
                tree.ranges[*idx].update_compact_priority(&opts);
            }
            info!(
                lsm = %tree.name,
                run_id = task.run_id,
                stmts = run.info.stmt_count,
                mems = mem_count,
                slices = slice_ids.len(),
                "dump completed"
            );
        }
        TaskOutput::Empty => {
            let mut tx = shared.metalog.begin();
            tx.write(MetaRecord::DumpLsm {
                lsm_id: task.lsm_id,
                dump_lsn,
            });
            tx.commit()?;
            // The prepared run never materialised; forget it best-effort.
            let mut tx = shared.metalog.begin();
            tx.write(MetaRecord::ForgetRun {
                run_id: task.run_id,
            });
            tx.try_commit();
            debug!(lsm = %task.lsm_name, run_id = task.run_id, "empty dump discarded");
        }
        TaskOutput::NotRun => {
            return Err(SchedulerError::Internal("completed task never ran".into()));
        }
    }

    // Common tail: runs for the empty and non-empty cases alike.
    let tree = state
        .trees
        .get_mut(&task.lsm_id)
        .ok_or(SchedulerError::UnknownLsm(task.lsm_id))?;
    let freed = tree.delete_mems_up_to(dump_generation);
    tree.dump_lsn = tree.dump_lsn.max(dump_lsn);
    tree.is_dumping = false;
    debug!(lsm = %tree.name, freed, "dumped memtables deleted");

    let space_id = tree.space_id;
    let was_secondary = !tree.is_primary;
    refresh_tree_keys(state, task.lsm_id);
    if was_secondary {
        unpin_primary(state, space_id);
    }
    state.dump_task_count -= 1;
    complete_dump_round(shared, state);
    Ok(())
}

/// Compaction completion: atomically swap source slices for the output
/// slice, drop unused runs, and reinsert the range for selection.
fn complete_compact(
    shared: &Shared,
    state: &mut SchedulerState,
    task: &mut Task,
) -> Result<(), SchedulerError> {
    let TaskKind::Compact {
        range_id,
        slices,
        first_slice_id,
        last_slice_id,
        dump_lsn,
    } = &task.kind
    else {
        return Err(SchedulerError::Internal(
            "compaction completion on non-compaction".into(),
        ));
    };
    let (range_id, first_id, last_id, dump_lsn) =
        (*range_id, *first_slice_id, *last_slice_id, *dump_lsn);

    let tree = state
        .trees
        .get(&task.lsm_id)
        .ok_or(SchedulerError::UnknownLsm(task.lsm_id))?;
    let range_idx = tree
        .ranges
        .iter()
        .position(|r| r.id == range_id)
        .ok_or_else(|| SchedulerError::Internal("compacted range vanished".into()))?;
    let (range_begin, range_end) = {
        let r = &tree.ranges[range_idx];
        (r.begin.clone(), r.end.clone())
    };

    // A source run becomes unused once every slice ever cut from it has
    // been compacted away (it may span several ranges).
    let mut unused_runs: Vec<Arc<Run>> = Vec::new();
    for slice in slices {
        if slice.run.note_compacted_slice() == slice.run.slice_count() {
            unused_runs.push(Arc::clone(&slice.run));
        }
    }

    let gc_lsn = shared.metalog.signature();
    let output = std::mem::replace(&mut task.output, TaskOutput::NotRun);
    // Open the output run before the commit: past the commit nothing is
    // allowed to fail, the log already linearised the swap.
    let new_run = match &output {
        TaskOutput::Run(_) => match Run::open(&shared.env, task.run_id, dump_lsn) {
            Ok(run) => Some(Arc::new(run)),
            Err(e) => {
                for slice in slices {
                    slice.run.unnote_compacted_slice();
                }
                task.output = output;
                return Err(e.into());
            }
        },
        _ => None,
    };
    let new_slice_id = new_run.as_ref().map(|_| shared.metalog.next_id());

    let mut tx = shared.metalog.begin();
    for slice in slices {
        tx.write(MetaRecord::DeleteSlice { slice_id: slice.id });
    }
    for run in &unused_runs {
        tx.write(MetaRecord::DropRun {
            run_id: run.id,
            gc_lsn,
        });
    }
    if let Some(slice_id) = new_slice_id {
        tx.write(MetaRecord::CreateRun {
            lsm_id: task.lsm_id,
            run_id: task.run_id,
            dump_lsn,
        });
        tx.write(MetaRecord::InsertSlice {
            lsm_id: task.lsm_id,
            run_id: task.run_id,
            slice_id,
            begin: range_begin.clone(),
            end: range_end.clone(),
        });
    }
    if let Err(e) = tx.commit() {
        // Roll the walk counters back; in-memory state is untouched.
        for slice in slices {
            slice.run.unnote_compacted_slice();
        }
        task.output = output;
        return Err(e.into());
    }

    let new_slice = if let Some(run) = new_run {
        let tree = state
            .trees
            .get_mut(&task.lsm_id)
            .ok_or(SchedulerError::UnknownLsm(task.lsm_id))?;
        tree.add_run(Arc::clone(&run));
        Some(Slice::new(
            new_slice_id.unwrap_or_default(),
            run,
            range_begin.clone(),
            range_end.clone(),
        ))
    } else {
        None
    };

    let tree = state
        .trees
        .get_mut(&task.lsm_id)
        .ok_or(SchedulerError::UnknownLsm(task.lsm_id))?;
    let had_output = new_slice.is_some();
    let removed = tree.replace_slices(range_idx, first_id, last_id, new_slice);

    for run in &unused_runs {
        tree.remove_run(run.id);
        if run.dump_lsn > gc_lsn {
            // Dumped after the last checkpoint: no snapshot needs the
            // files, remove them now and forget the run best-effort.
            if let Err(e) = shared.env.remove_run_files(run.id) {
                warn!(run_id = run.id, error = %e, "failed to remove unused run files");
            }
            let mut tx = shared.metalog.begin();
            tx.write(MetaRecord::ForgetRun { run_id: run.id });
            tx.try_commit();
        }
    }

    let opts = tree.opts.clone();
    let range_str = {
        let range = &mut tree.ranges[range_idx];
        range.is_compacting = false;
        range.update_compact_priority(&opts);
        range.interval_string()
    };
    info!(
        lsm = %tree.name,
        range = %range_str,
        removed = removed.len(),
        dropped_runs = unused_runs.len(),
        new_slice = had_output,
        "compaction completed"
    );
    refresh_tree_keys(state, task.lsm_id);
    state.compact_task_count -= 1;

    // Let readers pinning the compacted slices drain before destruction.
    for slice in &removed {
        slice.wait_pinned();
    }
    drop(removed);
    Ok(())
}

/// Abort path: discard the prepared run, return LSM state to pre-task, log
/// the failure unless the tree was dropped.
fn abort_task(shared: &Shared, state: &mut SchedulerState, task: &mut Task, dropped: bool) {
    // An unrun handler (and with it the write-iterator sources) is simply
    // dropped with the task.
    task.handler = None;

    // Discard the prepared run: remove any files, best-effort forget.
    if let Err(e) = shared.env.remove_run_files(task.run_id) {
        warn!(run_id = task.run_id, error = %e, "failed to remove aborted run files");
    }
    let mut tx = shared.metalog.begin();
    tx.write(MetaRecord::ForgetRun {
        run_id: task.run_id,
    });
    tx.try_commit();

    match &task.kind {
        TaskKind::Dump { .. } => {
            let mut space_id = None;
            let mut refresh = false;
            if let Some(tree) = state.trees.get_mut(&task.lsm_id) {
                tree.is_dumping = false;
                if !tree.is_primary {
                    space_id = Some(tree.space_id);
                }
                refresh = !tree.is_dropped;
            }
            if refresh {
                refresh_tree_keys(state, task.lsm_id);
            }
            if let Some(space_id) = space_id {
                unpin_primary(state, space_id);
            }
            state.dump_task_count -= 1;
            // Even a dropped tree must not stall the generation.
            complete_dump_round(shared, state);
        }
        TaskKind::Compact { range_id, .. } => {
            let mut refresh = false;
            if let Some(tree) = state.trees.get_mut(&task.lsm_id) {
                if let Some(range) = tree.ranges.iter_mut().find(|r| r.id == *range_id) {
                    range.is_compacting = false;
                }
                refresh = !tree.is_dropped;
            }
            if refresh {
                refresh_tree_keys(state, task.lsm_id);
            }
            state.compact_task_count -= 1;
        }
    }

    if dropped {
        debug!(lsm = %task.lsm_name, class = task.class(), "task aborted for dropped tree");
        return;
    }
    let diag = task
        .error
        .as_ref()
        .map(|e| e.to_string())
        .unwrap_or_else(|| "completion failed".into());
    let range = match &task.kind {
        TaskKind::Compact { range_id, .. } => state
            .trees
            .get(&task.lsm_id)
            .and_then(|t| t.ranges.iter().find(|r| r.id == *range_id))
            .map(|r| r.interval_string())
            .unwrap_or_default(),
        TaskKind::Dump { .. } => String::new(),
    };
    error!(
        lsm = %task.lsm_name,
        range = %range,
        class = task.class(),
        error = %diag,
        "background task failed"
    );
    state.last_error = Some(diag);
}

/// Ends the dump round once nothing is outstanding and every tree moved
/// past the current dump generation.
fn complete_dump_round(shared: &Shared, state: &mut SchedulerState) {
    if state.dump_task_count > 0 {
        return;
    }
    let min_generation = state
        .trees
        .values()
        .filter(|t| !t.is_dropped)
        .map(|t| t.generation())
        .min()
        .unwrap_or(state.generation);
    if min_generation <= state.dump_generation {
        return;
    }
    state.dump_generation = min_generation.min(state.generation);
    let duration = state.dump_start.elapsed();
    info!(
        dump_generation = state.dump_generation,
        duration_ms = duration.as_millis() as u64,
        "dump round completed"
    );
    (shared.dump_complete_cb)(state.dump_generation - 1, duration);
    shared.dump_cond.notify_all();
    shared.sched_cond.notify_all();
}

// ------------------------------------------------------------------------------------------------
// Task scheduling
// ------------------------------------------------------------------------------------------------

/// Step 4: prefer a dump while a round is in progress, else compact.
fn schedule(shared: &Arc<Shared>, state: &mut SchedulerState) -> Result<Scheduled, SchedulerError> {
    if state.dump_generation < state.generation {
        match schedule_dump(shared, state)? {
            Some(outcome) => return Ok(outcome),
            None => {}
        }
    }
    schedule_compact(shared, state)
}

/// 4.G.1 — dump task construction. `None` means "no dump candidate, try
/// compaction".
fn schedule_dump(
    shared: &Arc<Shared>,
    state: &mut SchedulerState,
) -> Result<Option<Scheduled>, SchedulerError> {
    let Some((_, lsm_id)) = state.dump_heap.top() else {
        // Nothing registered; the round may be trivially complete.
        complete_dump_round(shared, state);
        return Ok(None);
    };
    let dump_generation = state.dump_generation;
    let generation = state.generation;
    {
        let tree = &state.trees[&lsm_id];
        if tree.generation() != dump_generation || tree.is_dumping || tree.pin_count > 0 {
            // The best candidate is not eligible: every remaining tree is
            // either busy or already past this round.
            complete_dump_round(shared, state);
            return Ok(None);
        }
    }

    let Some(worker) = shared
        .dump_pool
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .get()
    else {
        return Ok(None);
    };

    // Rotate the active memtable into the round, then gather what to dump.
    let tree = state.trees.get_mut(&lsm_id).expect("tree present");
    if tree.active.generation() <= dump_generation {
        tree.rotate_mem(generation);
    }
    let mut mems = Vec::new();
    for mem in tree.sealed.iter().rev() {
        if mem.generation() > dump_generation {
            continue;
        }
        mem.wait_writers();
        if !mem.is_empty() {
            mems.push(Arc::clone(mem));
        }
    }
    // Empty memtables are destroyed right here, no worker needed.
    tree.sealed
        .retain(|m| m.generation() > dump_generation || !m.is_empty());

    if mems.is_empty() {
        shared
            .dump_pool
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .put(worker);
        refresh_tree_keys(state, lsm_id);
        complete_dump_round(shared, state);
        return Ok(Some(Scheduled::Retry));
    }

    let dump_lsn = mems.iter().map(|m| m.max_lsn()).max().unwrap_or(0);
    let run_id = shared.metalog.next_id();
    let mut tx = shared.metalog.begin();
    tx.write(MetaRecord::PrepareRun { lsm_id, run_id });
    if let Err(e) = tx.commit() {
        shared
            .dump_pool
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .put(worker);
        state.last_error = Some(e.to_string());
        return Err(e.into());
    }

    let tree = state.trees.get_mut(&lsm_id).expect("tree present");
    let is_last_level = tree.slice_count() == 0;
    tree.is_dumping = true;

    let task = Box::new(Task {
        lsm_id,
        lsm_name: tree.name.clone(),
        space_id: tree.space_id,
        is_primary: tree.is_primary,
        cmp_def: (*tree.cmp_def).clone(),
        key_def: (*tree.key_def).clone(),
        bloom_fpr: tree.opts.bloom_fpr,
        page_size: tree.opts.page_size,
        is_last_level,
        read_views: (shared.read_views)(),
        // Dumps never route deferred deletes; those arise on compaction.
        handler: None,
        run_id,
        kind: TaskKind::Dump { mems, dump_lsn },
        cancel: Arc::new(AtomicBool::new(false)),
        output: TaskOutput::NotRun,
        error: None,
        pool: PoolKind::Dump,
        worker,
    });

    let space_id = task.space_id;
    let is_secondary = !task.is_primary;
    state.dump_task_count += 1;
    refresh_tree_keys(state, lsm_id);
    if is_secondary {
        // The primary of this space must dump after all its secondaries.
        pin_primary(state, space_id);
    }
    info!(lsm = %task.lsm_name, run_id, dump_lsn, "dump task scheduled");
    shared
        .dump_pool
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .send(worker, task);
    Ok(Some(Scheduled::Shipped))
}

/// 4.G.2 — compaction task construction.
fn schedule_compact(
    shared: &Arc<Shared>,
    state: &mut SchedulerState,
) -> Result<Scheduled, SchedulerError> {
    let Some((key, lsm_id)) = state.compact_heap.top() else {
        return Ok(Scheduled::Idle);
    };
    if key.priority() <= 1 {
        return Ok(Scheduled::Idle);
    }
    if !state.trees.contains_key(&lsm_id) {
        state.compact_heap.remove(lsm_id);
        return Ok(Scheduled::Retry);
    }

    let Some(range_idx) = state.trees[&lsm_id].best_compact_range() else {
        refresh_tree_keys(state, lsm_id);
        return Ok(Scheduled::Retry);
    };

    // Structural maintenance runs before any task: a split or coalesce
    // only updates heaps this iteration.
    {
        let metalog = Arc::clone(&shared.metalog);
        let tree = state.trees.get_mut(&lsm_id).expect("tree present");
        if tree.try_split_range(range_idx, &metalog)?
            || tree.try_coalesce_range(range_idx, &metalog)?
        {
            refresh_tree_keys(state, lsm_id);
            return Ok(Scheduled::Retry);
        }
    }

    let priority = state.trees[&lsm_id].ranges[range_idx].compact_priority;
    if priority <= 1 {
        refresh_tree_keys(state, lsm_id);
        return Ok(Scheduled::Retry);
    }

    let Some(worker) = shared
        .compact_pool
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .get()
    else {
        return Ok(Scheduled::Idle);
    };

    let run_id = shared.metalog.next_id();
    let mut tx = shared.metalog.begin();
    tx.write(MetaRecord::PrepareRun { lsm_id, run_id });
    if let Err(e) = tx.commit() {
        shared
            .compact_pool
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .put(worker);
        state.last_error = Some(e.to_string());
        return Err(e.into());
    }

    let tree = state.trees.get_mut(&lsm_id).expect("tree present");
    let range = &mut tree.ranges[range_idx];
    let total = range.slices.len();
    let n = priority.min(total);
    // The head span of the newest-first list: priority counts how many of
    // the newest slices merge into one level. A concurrent dump prepends
    // ahead of `first_slice_id`; completion re-inserts at that position.
    let selection: Vec<Arc<Slice>> = range.slices.iter().take(n).cloned().collect();
    let first_slice_id = selection.first().expect("non-empty selection").id;
    let last_slice_id = selection.last().expect("non-empty selection").id;
    let dump_lsn = selection.iter().map(|s| s.run.dump_lsn).max().unwrap_or(0);
    // Reaching the oldest slice makes the output the last level for this
    // range's keys: surviving deletes shadow nothing anywhere else.
    let is_last_level = n == total;
    range.is_compacting = true;
    let range_str = range.interval_string();

    let cancel = Arc::new(AtomicBool::new(false));
    let mut task = Box::new(Task {
        lsm_id,
        lsm_name: tree.name.clone(),
        space_id: tree.space_id,
        is_primary: tree.is_primary,
        cmp_def: (*tree.cmp_def).clone(),
        key_def: (*tree.key_def).clone(),
        bloom_fpr: tree.opts.bloom_fpr,
        page_size: tree.opts.page_size,
        is_last_level,
        read_views: (shared.read_views)(),
        handler: None,
        run_id,
        kind: TaskKind::Compact {
            range_id: tree.ranges[range_idx].id,
            slices: selection,
            first_slice_id,
            last_slice_id,
            dump_lsn,
        },
        cancel,
        output: TaskOutput::NotRun,
        error: None,
        pool: PoolKind::Compact,
        worker,
    });
    if task.is_primary {
        // Shadowed rows must propagate to the space's secondary indexes.
        task.handler = Some(Box::new(DeferredRouteHandler::new(
            task.space_id,
            task.key_def.clone(),
            Arc::new(DeferredShared::new()),
            Arc::clone(&task.cancel),
            Arc::clone(&shared.deferred_submit),
        )));
    }

    state.compact_task_count += 1;
    refresh_tree_keys(state, lsm_id);
    info!(
        lsm = %task.lsm_name,
        range = %range_str,
        slices = n,
        run_id,
        "compaction task scheduled"
    );
    shared
        .compact_pool
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .send(worker, task);
    Ok(Scheduled::Shipped)
}

// ------------------------------------------------------------------------------------------------
// Heap maintenance
// ------------------------------------------------------------------------------------------------

fn dump_key_of(tree: &LsmTree) -> DumpKey {
    DumpKey {
        is_dumping: tree.is_dumping,
        pin_count: tree.pin_count,
        generation: tree.generation(),
        is_primary: tree.is_primary,
    }
}

/// Recomputes both heap keys of a tree after its state changed.
fn refresh_tree_keys(state: &mut SchedulerState, lsm_id: u64) {
    let Some(tree) = state.trees.get(&lsm_id) else {
        return;
    };
    if tree.is_dropped {
        return;
    }
    let dump_key = dump_key_of(tree);
    let compact_key = CompactKey::new(tree.compact_priority());
    state.dump_heap.update(lsm_id, dump_key);
    state.compact_heap.update(lsm_id, compact_key);
}

fn pin_primary(state: &mut SchedulerState, space_id: u32) {
    let primary_id = state
        .trees
        .values()
        .find(|t| t.space_id == space_id && t.is_primary && !t.is_dropped)
        .map(|t| t.id);
    if let Some(id) = primary_id {
        state.trees.get_mut(&id).expect("tree present").pin_count += 1;
        refresh_tree_keys(state, id);
    }
}

fn unpin_primary(state: &mut SchedulerState, space_id: u32) {
    let primary_id = state
        .trees
        .values()
        .find(|t| t.space_id == space_id && t.is_primary && !t.is_dropped)
        .map(|t| t.id);
    if let Some(id) = primary_id {
        let tree = state.trees.get_mut(&id).expect("tree present");
        debug_assert!(tree.pin_count > 0);
        tree.pin_count = tree.pin_count.saturating_sub(1);
        refresh_tree_keys(state, id);
    }
}
