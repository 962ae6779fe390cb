//! # Memtable
//!
//! The in-memory statement buffer of one LSM tree. A memtable is born with
//! the tree's current *generation* — the dump-round epoch it belongs to —
//! and keeps multiple versions per key ordered by descending LSN.
//!
//! ## Lifecycle
//!
//! Active → Sealed (on rotation) → Destroyed (after the dump covering its
//! generation completes). Only the active memtable accepts writes; sealing
//! wraps it in an `Arc` and from then on it is immutable. The coordinator
//! destroys sealed memtables only after the run covering their generation is
//! logged and its slices inserted.
//!
//! ## Writer pins
//!
//! The transactional engine pins a memtable while a multi-statement write is
//! in flight. A dump waits for writer pins to clear before feeding the
//! memtable to a write iterator, so workers always see a quiescent image.
//! Pins are released without needing any scheduler lock.


use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::{Condvar, Mutex};

use crate::stmt::{Key, Statement};

/// Sorted multi-version buffer of statements for one generation.
pub struct Memtable {
    /// Dump-round epoch this memtable belongs to.
    generation: u64,

    /// Statements keyed by `(key ASC, LSN DESC)`.
    entries: BTreeMap<(Key, Reverse<u64>), Statement>,

    /// Payload bytes across all statements.
    size_bytes: usize,

    /// Smallest / largest LSN inserted (0 when empty).
    min_lsn: u64,
    max_lsn: u64,

    /// Writer pin count; guarded separately so pinning never touches the
    /// scheduler state.
    pins: Mutex<u32>,
    pins_cleared: Condvar,
}

impl Memtable {
    /// Creates an empty memtable for the given generation.
    pub fn new(generation: u64) -> Self {
        Self {
            generation,
            entries: BTreeMap::new(),
            size_bytes: 0,
            min_lsn: 0,
            max_lsn: 0,
            pins: Mutex::new(0),
            pins_cleared: Condvar::new(),
        }
    }

    /// The dump-round epoch assigned at creation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Inserts a statement under its extracted key.
    ///
    /// A statement with the same `(key, lsn)` replaces the previous one —
    /// the transactional engine may re-apply a prepared statement.
    pub fn insert(&mut self, key: Key, stmt: Statement) {
        if self.entries.is_empty() || stmt.lsn < self.min_lsn {
            self.min_lsn = stmt.lsn;
        }
        if stmt.lsn > self.max_lsn {
            self.max_lsn = stmt.lsn;
        }
        self.size_bytes += stmt.size();
        if let Some(old) = self.entries.insert((key, Reverse(stmt.lsn)), stmt) {
            self.size_bytes -= old.size();
        }
    }

    /// Number of statements held.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no statements were inserted.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Payload bytes across all statements.
    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    /// Largest LSN inserted (0 when empty).
    pub fn max_lsn(&self) -> u64 {
        self.max_lsn
    }

    /// Smallest LSN inserted (0 when empty).
    pub fn min_lsn(&self) -> u64 {
        self.min_lsn
    }

    /// Iterates statements in `(key ASC, LSN DESC)` order.
    pub fn iter(&self) -> impl Iterator<Item = (&Key, &Statement)> {
        self.entries.iter().map(|((key, _), stmt)| (key, stmt))
    }

    // --------------------------------------------------------------------
    // Writer pins
    // --------------------------------------------------------------------

    /// Takes a writer pin. The memtable will not be dumped while pinned.
    pub fn pin_writer(&self) {
        let mut pins = self.pins.lock().unwrap_or_else(|e| e.into_inner());
        *pins += 1;
    }

    /// Releases a writer pin, waking any dump waiting on quiescence.
    pub fn unpin_writer(&self) {
        let mut pins = self.pins.lock().unwrap_or_else(|e| e.into_inner());
        debug_assert!(*pins > 0, "unpin without matching pin");
        *pins = pins.saturating_sub(1);
        if *pins == 0 {
            self.pins_cleared.notify_all();
        }
    }

    /// Blocks until all writer pins are released.
    pub fn wait_writers(&self) {
        let mut pins = self.pins.lock().unwrap_or_else(|e| e.into_inner());
        while *pins > 0 {
            pins = self
                .pins_cleared
                .wait(pins)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Current writer pin count.
    pub fn writer_pins(&self) -> u32 {
        *self.pins.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for Memtable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memtable")
            .field("generation", &self.generation)
            .field("len", &self.entries.len())
            .field("size_bytes", &self.size_bytes)
            .field("max_lsn", &self.max_lsn)
            .finish()
    }
}
