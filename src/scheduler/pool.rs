//! Worker pools for background tasks.
//!
//! Two fixed-size pools — **dump** and **compact** — keep task classes on
//! disjoint threads so a long compaction can never starve an urgent dump.
//! A pool starts its threads lazily on first demand. Each worker owns one
//! in-bound `crossbeam` pipe; completed tasks return through the
//! coordinator's completion queue, pushed by a callback the pool is
//! constructed with.
//!
//! One task executes per worker at a time. On shutdown the pool cancels
//! each worker's running task through its token, sends the shutdown
//! message, and joins the thread before dropping the pipes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam::channel::{Sender, unbounded};
use tracing::{debug, warn};

use crate::run::RunEnv;

use super::task::Task;

/// Task class a pool serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    Dump,
    Compact,
}

impl PoolKind {
    fn thread_name(self, index: usize) -> String {
        match self {
            PoolKind::Dump => format!("strata-dump-{index}"),
            PoolKind::Compact => format!("strata-compact-{index}"),
        }
    }
}

/// Callback delivering a finished task back to the coordinator.
pub type CompleteFn = Arc<dyn Fn(Box<Task>) + Send + Sync>;

enum WorkerMsg {
    Run(Box<Task>),
    Shutdown,
}

struct Worker {
    pipe: Sender<WorkerMsg>,
    handle: Option<JoinHandle<()>>,
    /// Cancellation token of the task currently executing, if any.
    running: Arc<Mutex<Option<Arc<AtomicBool>>>>,
}

/// A fixed-size, lazily-started pool of task workers.
pub struct WorkerPool {
    kind: PoolKind,
    size: usize,
    env: Arc<RunEnv>,
    complete: CompleteFn,
    workers: Vec<Worker>,
    idle: Vec<usize>,
}

impl WorkerPool {
    pub fn new(kind: PoolKind, size: usize, env: Arc<RunEnv>, complete: CompleteFn) -> Self {
        debug_assert!(size >= 1);
        Self {
            kind,
            size,
            env,
            complete,
            workers: Vec::new(),
            idle: Vec::new(),
        }
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns an idle worker, starting a new thread while below capacity.
    /// `None` when every worker is busy.
    pub fn get(&mut self) -> Option<usize> {
        if let Some(index) = self.idle.pop() {
            return Some(index);
        }
        if self.workers.len() < self.size {
            let index = self.workers.len();
            self.workers.push(self.spawn(index));
            return Some(index);
        }
        None
    }

    /// Returns a worker to the idle list.
    pub fn put(&mut self, index: usize) {
        debug_assert!(!self.idle.contains(&index));
        self.idle.push(index);
    }

    /// Ships a task to the given worker's pipe.
    pub fn send(&self, index: usize, task: Box<Task>) {
        if self.workers[index].pipe.send(WorkerMsg::Run(task)).is_err() {
            warn!(pool = ?self.kind, index, "worker pipe closed, task lost");
        }
    }

    fn spawn(&self, index: usize) -> Worker {
        let (tx, rx) = unbounded::<WorkerMsg>();
        let running: Arc<Mutex<Option<Arc<AtomicBool>>>> = Arc::new(Mutex::new(None));
        let running_slot = Arc::clone(&running);
        let env = Arc::clone(&self.env);
        let complete = Arc::clone(&self.complete);
        let kind = self.kind;

        let handle = std::thread::Builder::new()
            .name(kind.thread_name(index))
            .spawn(move || {
                debug!(pool = ?kind, index, "worker started");
                while let Ok(msg) = rx.recv() {
                    match msg {
                        WorkerMsg::Run(mut task) => {
                            *running_slot.lock().unwrap_or_else(|e| e.into_inner()) =
                                Some(Arc::clone(&task.cancel));
                            task.execute(&env);
                            *running_slot.lock().unwrap_or_else(|e| e.into_inner()) = None;
                            complete(task);
                        }
                        WorkerMsg::Shutdown => break,
                    }
                }
                debug!(pool = ?kind, index, "worker stopped");
            })
            .expect("spawn worker thread");

        Worker {
            pipe: tx,
            handle: Some(handle),
            running,
        }
    }

    /// Cancels running tasks, joins every thread, and drops the pipes.
    pub fn shutdown(&mut self) {
        for worker in &self.workers {
            if let Some(cancel) = worker
                .running
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .as_ref()
            {
                cancel.store(true, Ordering::SeqCst);
            }
            let _ = worker.pipe.send(WorkerMsg::Shutdown);
        }
        for worker in &mut self.workers {
            if let Some(handle) = worker.handle.take()
                && handle.join().is_err()
            {
                warn!(pool = ?self.kind, "worker thread panicked");
            }
        }
        self.workers.clear();
        self.idle.clear();
    }
}
