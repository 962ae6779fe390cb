//! Deferred-delete routing from secondary-index compaction back to the
//! transactional thread.
//!
//! When a primary-index compaction discards an overwritten `Replace`, the
//! secondary indexes of the space still hold the stale row under their own
//! key order. The write iterator reports each `(old, new)` pair to the
//! task's [`DeferredRouteHandler`]; pairs accumulate into bounded batches
//! that ship to the coordinator, which builds a surrogate delete from the
//! old statement (primary-index tuple format) and hands the whole batch to
//! the host's [`DeferredDeleteSink`] as one transaction. The sink's replace
//! trigger propagates the delete to every secondary index with WAL
//! durability.
//!
//! ## Backpressure and failure
//!
//! A worker blocks in `process` while [`DEFERRED_DELETE_MAX_IN_FLIGHT`]
//! batches are unacknowledged, and `finish` sleeps until the route drains.
//! If the coordinator's DML fails, the batch carries the diagnostic back:
//! the owning task is cancelled through its token and the waiting worker
//! wakes with the error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tracing::debug;

use crate::stmt::{KeyDef, Statement, Tuple};
use crate::write_iterator::DeferredDeleteHandler;

/// Maximum `(old, new)` pairs per batch.
pub const DEFERRED_DELETE_BATCH_MAX: usize = 100;

/// Maximum unacknowledged batches per task before the worker blocks.
pub const DEFERRED_DELETE_MAX_IN_FLIGHT: usize = 10;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

// ------------------------------------------------------------------------------------------------
// Host seam
// ------------------------------------------------------------------------------------------------

/// The host DML engine's entry point for deferred deletes.
///
/// `deletes` holds `(lsn, surrogate_delete_tuple)` rows; the implementation
/// must apply them under one transaction into its deferred-delete system
/// space (or route them straight to each secondary index's tree when no
/// such space exists).
pub trait DeferredDeleteSink: Send + Sync {
    fn apply(&self, space_id: u32, deletes: &[(u64, Tuple)]) -> Result<(), BoxError>;
}

/// Sink for spaces with no secondary indexes: drops every batch.
pub struct NoopDeferredDeleteSink;

impl DeferredDeleteSink for NoopDeferredDeleteSink {
    fn apply(&self, _space_id: u32, _deletes: &[(u64, Tuple)]) -> Result<(), BoxError> {
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Shared route state
// ------------------------------------------------------------------------------------------------

struct RouteState {
    in_flight: usize,
    failed: Option<String>,
}

/// In-flight accounting shared by the worker-side handler and the
/// coordinator's acknowledgement.
pub struct DeferredShared {
    state: Mutex<RouteState>,
    drained: Condvar,
}

impl Default for DeferredShared {
    fn default() -> Self {
        Self::new()
    }
}

impl DeferredShared {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RouteState {
                in_flight: 0,
                failed: None,
            }),
            drained: Condvar::new(),
        }
    }

    /// Reserves an in-flight slot, blocking while the cap is reached.
    /// Wakes early on cancellation or a reported failure.
    fn acquire(&self, cancel: &AtomicBool) -> Result<(), String> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(diag) = &state.failed {
                return Err(diag.clone());
            }
            if cancel.load(Ordering::Relaxed) {
                return Err("cancelled".into());
            }
            if state.in_flight < DEFERRED_DELETE_MAX_IN_FLIGHT {
                state.in_flight += 1;
                return Ok(());
            }
            let (guard, _) = self
                .drained
                .wait_timeout(state, Duration::from_millis(10))
                .unwrap_or_else(|e| e.into_inner());
            state = guard;
        }
    }

    /// Coordinator-side acknowledgement of one processed batch.
    pub fn ack(&self, failure: Option<String>) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        debug_assert!(state.in_flight > 0);
        state.in_flight = state.in_flight.saturating_sub(1);
        if let Some(diag) = failure
            && state.failed.is_none()
        {
            state.failed = Some(diag);
        }
        self.drained.notify_all();
    }

    /// Blocks until every in-flight batch returned; wakes early on
    /// cancellation or failure.
    fn wait_drained(&self, cancel: &AtomicBool) -> Result<(), String> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(diag) = &state.failed {
                return Err(diag.clone());
            }
            if state.in_flight == 0 {
                return Ok(());
            }
            if cancel.load(Ordering::Relaxed) {
                return Err("cancelled".into());
            }
            let (guard, _) = self
                .drained
                .wait_timeout(state, Duration::from_millis(10))
                .unwrap_or_else(|e| e.into_inner());
            state = guard;
        }
    }

    /// Unacknowledged batch count (test observability).
    pub fn in_flight(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .in_flight
    }
}

// ------------------------------------------------------------------------------------------------
// Batch
// ------------------------------------------------------------------------------------------------

/// One shipment of overwrite pairs from a worker to the coordinator.
pub struct DeferredDeleteBatch {
    pub space_id: u32,
    /// The primary index's key definition; the coordinator uses it to build
    /// surrogate deletes without touching tree state.
    pub key_def: KeyDef,
    /// `(old, new)` pairs in emission order.
    pub pairs: Vec<(Statement, Statement)>,
    /// Acknowledgement target.
    pub shared: Arc<DeferredShared>,
    /// The owning task's token; a failed batch cancels the task.
    pub cancel: Arc<AtomicBool>,
}

/// Where the handler ships full batches (the coordinator's queue).
pub type DeferredSubmitFn = Arc<dyn Fn(DeferredDeleteBatch) + Send + Sync>;

// ------------------------------------------------------------------------------------------------
// Worker-side handler
// ------------------------------------------------------------------------------------------------

/// Accumulates overwrite pairs on the worker and ships bounded batches.
pub struct DeferredRouteHandler {
    space_id: u32,
    key_def: KeyDef,
    pairs: Vec<(Statement, Statement)>,
    shared: Arc<DeferredShared>,
    cancel: Arc<AtomicBool>,
    submit: DeferredSubmitFn,
}

impl DeferredRouteHandler {
    pub fn new(
        space_id: u32,
        key_def: KeyDef,
        shared: Arc<DeferredShared>,
        cancel: Arc<AtomicBool>,
        submit: DeferredSubmitFn,
    ) -> Self {
        Self {
            space_id,
            key_def,
            pairs: Vec::new(),
            shared,
            cancel,
            submit,
        }
    }

    fn flush(&mut self) -> Result<(), String> {
        if self.pairs.is_empty() {
            return Ok(());
        }
        self.shared.acquire(&self.cancel)?;
        let batch = DeferredDeleteBatch {
            space_id: self.space_id,
            key_def: self.key_def.clone(),
            pairs: std::mem::take(&mut self.pairs),
            shared: Arc::clone(&self.shared),
            cancel: Arc::clone(&self.cancel),
        };
        debug!(
            space_id = self.space_id,
            pairs = batch.pairs.len(),
            "deferred-delete batch shipped"
        );
        (self.submit)(batch);
        Ok(())
    }
}

impl DeferredDeleteHandler for DeferredRouteHandler {
    fn process(&mut self, old: &Statement, new: &Statement) -> Result<(), BoxError> {
        self.pairs.push((old.clone(), new.clone()));
        if self.pairs.len() >= DEFERRED_DELETE_BATCH_MAX {
            self.flush().map_err(BoxError::from)?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), BoxError> {
        self.flush().map_err(BoxError::from)?;
        self.shared
            .wait_drained(&self.cancel)
            .map_err(BoxError::from)
    }
}
