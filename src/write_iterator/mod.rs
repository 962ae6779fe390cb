//! # Write Iterator
//!
//! The sorted, read-view-respecting merge that feeds every run writer. A
//! dump merges sealed memtables; a compaction merges range slices. Sources
//! are combined heap-wise into one `(key ASC, LSN DESC)` stream, then each
//! key's version history is filtered against the active read views:
//!
//! - versions newer than the newest read view are emitted as-is;
//! - each read view keeps the newest version it can see;
//! - everything else is shadowed and dropped;
//! - with no read views only the newest version survives;
//! - on the last level a surviving delete is dropped entirely — there is
//!   nothing older left to shadow.
//!
//! ## Deferred deletes
//!
//! When a primary-index compaction discards an overwritten `Replace`, the
//! secondary indexes still hold the stale row under their own key order. If
//! a [`DeferredDeleteHandler`] is installed, the iterator reports each
//! `(old, new)` overwrite pair so the scheduler can propagate the delete.

#[cfg(test)]
mod tests;

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use thiserror::Error;

use crate::memtable::Memtable;
use crate::run::{RunError, Slice, SliceIter};
use crate::stmt::{Key, KeyDef, Statement};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors surfaced while merging.
#[derive(Debug, Error)]
pub enum WriteIteratorError {
    /// A slice source failed to decode its run.
    #[error("Run error: {0}")]
    Run(#[from] RunError),

    /// The deferred-delete handler rejected a pair.
    #[error("Deferred delete error: {0}")]
    Deferred(String),
}

// ------------------------------------------------------------------------------------------------
// Deferred-delete handler
// ------------------------------------------------------------------------------------------------

/// Receives `(old, new)` overwrite pairs from primary-index compaction.
///
/// `old` is the discarded `Replace`; `new` is the closest newer statement
/// that shadowed it. Implementations run on the worker thread.
pub trait DeferredDeleteHandler: Send {
    /// Accepts one overwrite pair. May block for backpressure.
    fn process(
        &mut self,
        old: &Statement,
        new: &Statement,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Flushes buffered pairs and waits until every in-flight batch has
    /// been acknowledged. Called once after the last `process`.
    fn finish(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Merge sources
// ------------------------------------------------------------------------------------------------

enum Source {
    /// Snapshot of a sealed memtable, already in merge order.
    Mem(std::vec::IntoIter<(Key, Statement)>),
    /// Streaming slice reader.
    Slice(SliceIter),
}

impl Source {
    fn next(&mut self) -> Option<Result<(Key, Statement), RunError>> {
        match self {
            Source::Mem(iter) => iter.next().map(Ok),
            Source::Slice(iter) => iter.next(),
        }
    }
}

struct HeapEntry {
    key: Key,
    stmt: Statement,
    /// Source index; lower indices are newer sources and win LSN ties.
    src: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.stmt.lsn == other.stmt.lsn && self.src == other.src
    }
}

impl Eq for HeapEntry {}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: reverse so the smallest key with the
        // highest LSN pops first.
        self.key
            .cmp(&other.key)
            .then_with(|| other.stmt.lsn.cmp(&self.stmt.lsn))
            .then_with(|| self.src.cmp(&other.src))
            .reverse()
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// ------------------------------------------------------------------------------------------------
// Write iterator
// ------------------------------------------------------------------------------------------------

/// Lazy, sorted merge of memtables and slices with LSM garbage rules.
pub struct WriteIterator {
    cmp_def: KeyDef,
    is_primary: bool,
    is_last_level: bool,
    /// Open read-view LSNs, ascending.
    read_views: Vec<u64>,
    handler: Option<Box<dyn DeferredDeleteHandler>>,

    sources: Vec<Source>,
    heap: BinaryHeap<HeapEntry>,
    started: bool,
    /// Filtered output for the key currently being drained, newest first.
    pending: std::vec::IntoIter<(Key, Statement)>,
}

impl WriteIterator {
    /// Creates an empty iterator; add sources before [`Self::start`].
    pub fn new(
        cmp_def: KeyDef,
        is_primary: bool,
        is_last_level: bool,
        mut read_views: Vec<u64>,
    ) -> Self {
        read_views.sort_unstable();
        read_views.dedup();
        Self {
            cmp_def,
            is_primary,
            is_last_level,
            read_views,
            handler: None,
            sources: Vec::new(),
            heap: BinaryHeap::new(),
            started: false,
            pending: Vec::new().into_iter(),
        }
    }

    /// Installs the deferred-delete handler (primary-index compaction only).
    pub fn set_deferred_handler(&mut self, handler: Box<dyn DeferredDeleteHandler>) {
        debug_assert!(self.is_primary);
        self.handler = Some(handler);
    }

    /// Adds a sealed memtable source. Sources must be added newest-first.
    pub fn add_mem(&mut self, mem: &Arc<Memtable>) {
        let snapshot: Vec<(Key, Statement)> = mem
            .iter()
            .map(|(key, stmt)| (key.clone(), stmt.clone()))
            .collect();
        self.sources.push(Source::Mem(snapshot.into_iter()));
    }

    /// Adds a slice source. Sources must be added newest-first.
    pub fn add_slice(&mut self, slice: &Arc<Slice>) {
        self.sources.push(Source::Slice(slice.iter(&self.cmp_def)));
    }

    /// Primes the merge heap. Call once, after all sources are added.
    pub fn start(&mut self) -> Result<(), WriteIteratorError> {
        debug_assert!(!self.started);
        for idx in 0..self.sources.len() {
            self.advance_source(idx)?;
        }
        self.started = true;
        Ok(())
    }

    fn advance_source(&mut self, idx: usize) -> Result<(), WriteIteratorError> {
        if let Some(item) = self.sources[idx].next() {
            let (key, stmt) = item?;
            self.heap.push(HeapEntry {
                key,
                stmt,
                src: idx,
            });
        }
        Ok(())
    }

    /// Returns the next surviving statement, or `None` at the end.
    pub fn next(&mut self) -> Result<Option<(Key, Statement)>, WriteIteratorError> {
        debug_assert!(self.started, "next() before start()");
        loop {
            if let Some(out) = self.pending.next() {
                return Ok(Some(out));
            }

            let Some(first) = self.heap.pop() else {
                return Ok(None);
            };
            let key = first.key.clone();
            let mut versions = vec![first.stmt.clone()];
            self.advance_source(first.src)?;

            // Drain every version of this key, LSN-descending; duplicate
            // LSNs across sources collapse to the newest source's copy.
            while let Some(top) = self.heap.peek() {
                if top.key != key {
                    break;
                }
                let entry = self.heap.pop().expect("peeked entry");
                if versions.last().map(|s: &Statement| s.lsn) != Some(entry.stmt.lsn) {
                    versions.push(entry.stmt.clone());
                }
                self.advance_source(entry.src)?;
            }

            let kept = self.filter_versions(&versions)?;
            self.pending = kept
                .into_iter()
                .map(|stmt| (key.clone(), stmt))
                .collect::<Vec<_>>()
                .into_iter();
        }
    }

    /// Applies read-view and last-level rules to one key's history
    /// (`versions` is LSN-descending). Reports overwrite pairs for every
    /// dropped `Replace` when a handler is installed.
    fn filter_versions(
        &mut self,
        versions: &[Statement],
    ) -> Result<Vec<Statement>, WriteIteratorError> {
        let mut keep = vec![false; versions.len()];

        if let Some(&newest_rv) = self.read_views.last() {
            // Everything newer than the newest read view is emitted as-is.
            for (i, v) in versions.iter().enumerate() {
                if v.lsn > newest_rv {
                    keep[i] = true;
                }
            }
            // Each read view sees the newest version at or below it.
            for &rv in self.read_views.iter().rev() {
                if let Some(i) = versions.iter().position(|v| v.lsn <= rv) {
                    keep[i] = true;
                }
            }
        } else if !versions.is_empty() {
            // No open read views: only the newest version matters.
            keep[0] = true;
        }

        // Report overwrites for dropped Replace statements before the
        // last-level rule can also drop the shadowing delete.
        if self.is_primary
            && let Some(handler) = self.handler.as_mut()
        {
            for (i, v) in versions.iter().enumerate() {
                if !keep[i] && !v.is_delete() && i > 0 {
                    let newer = &versions[i - 1];
                    handler
                        .process(v, newer)
                        .map_err(|e| WriteIteratorError::Deferred(e.to_string()))?;
                }
            }
        }

        // On the last level a surviving tail delete shadows nothing and can
        // be dropped — but only when it sits below every open read view,
        // otherwise a snapshot still needs to observe the deletion.
        if self.is_last_level
            && let Some(oldest_kept) = keep.iter().rposition(|&k| k)
            && versions[oldest_kept].is_delete()
            && self
                .read_views
                .first()
                .is_none_or(|&oldest_rv| versions[oldest_kept].lsn <= oldest_rv)
        {
            keep[oldest_kept] = false;
        }

        Ok(versions
            .iter()
            .zip(keep.iter())
            .filter(|&(_, &k)| k)
            .map(|(v, _)| v.clone())
            .collect())
    }

    /// Tears the iterator down, releasing sources and returning the handler
    /// so the caller can flush it.
    pub fn close(mut self) -> Option<Box<dyn DeferredDeleteHandler>> {
        self.sources.clear();
        self.heap.clear();
        self.handler.take()
    }
}
