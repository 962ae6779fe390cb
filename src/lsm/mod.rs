//! # LSM tree state
//!
//! The per-index logical tree the scheduler maintains: one active memtable,
//! zero or more sealed memtables awaiting dump, and an ordered set of
//! ranges partitioning the key space, each owning a newest-first list of
//! run slices.
//!
//! All mutation happens on the coordinator thread under the scheduler
//! state lock. Workers only ever see `Arc`'d sealed memtables, slices, and
//! task-copied key definitions, so nothing here needs interior locking.
//!
//! ## Invariants
//!
//! - The union of `ranges` covers the key space with no gaps or overlaps.
//! - `is_dumping` is true iff exactly one dump task for this tree is
//!   outstanding; a dropped tree holds no heap positions and gets no tasks.
//! - Compaction completion replaces source slices with the output slice at
//!   the positional insertion point, so slices a concurrent dump prepended
//!   survive in place.


use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tracing::{debug, info};

use crate::memtable::Memtable;
use crate::metalog::{MetaLog, MetaLogError, MetaRecord};
use crate::run::{Run, Slice};
use crate::stmt::{Key, KeyDef};

// ------------------------------------------------------------------------------------------------
// Options / configuration
// ------------------------------------------------------------------------------------------------

/// Per-tree policy knobs, snapshotted into every task.
#[derive(Debug, Clone)]
pub struct LsmOpts {
    /// Bloom filter false-positive rate for new runs.
    pub bloom_fpr: f64,

    /// Target data-block size for new runs, in bytes.
    pub page_size: usize,

    /// How many runs a level may hold before the range wants compaction.
    pub run_count_per_level: usize,

    /// Target on-disk size of one range; larger ranges split, and adjacent
    /// ranges below a quarter of it coalesce.
    pub range_size: u64,
}

impl Default for LsmOpts {
    fn default() -> Self {
        Self {
            bloom_fpr: 0.05,
            page_size: 8 * 1024,
            run_count_per_level: 2,
            range_size: 1024 * 1024 * 1024,
        }
    }
}

/// Everything needed to register an index with the scheduler.
#[derive(Debug, Clone)]
pub struct LsmConfig {
    /// Human-readable name used in logs (e.g. `"512/0"` or `"users.pk"`).
    pub name: String,
    /// Owning space id.
    pub space_id: u32,
    /// Index ordinal within the space; 0 is the primary.
    pub index_id: u32,
    /// True for the primary index of its space.
    pub is_primary: bool,
    /// The index's own key parts.
    pub key_def: KeyDef,
    /// The primary's key parts; extends `key_def` into the comparison
    /// definition of a secondary index. Ignored for primaries.
    pub primary_key_def: Option<KeyDef>,
    /// Policy knobs.
    pub opts: LsmOpts,
}

// ------------------------------------------------------------------------------------------------
// Range
// ------------------------------------------------------------------------------------------------

/// A half-open key interval owning the slices that overlap it.
pub struct RangeState {
    /// Id from the metadata-log sequence.
    pub id: u64,
    /// Interval bounds; `None` is unbounded.
    pub begin: Option<Key>,
    pub end: Option<Key>,

    /// Overlapping slices, newest first. Dumps prepend; compactions replace
    /// a suffix.
    pub slices: VecDeque<Arc<Slice>>,

    /// How many of the newest slices a compaction should merge; 1 means
    /// nothing to do.
    pub compact_priority: usize,

    /// Forces priority to the full slice count (user-requested compaction).
    pub needs_compaction: bool,

    /// Bumped on every structural edit.
    pub version: u64,

    /// True while a compaction task owns this range; keeps it out of
    /// selection.
    pub is_compacting: bool,
}

impl RangeState {
    /// Creates an empty range over `[begin, end)`.
    pub fn new(id: u64, begin: Option<Key>, end: Option<Key>) -> Self {
        Self {
            id,
            begin,
            end,
            slices: VecDeque::new(),
            compact_priority: 1,
            needs_compaction: false,
            version: 0,
            is_compacting: false,
        }
    }

    /// Total on-disk bytes attributed to this range's slices.
    pub fn total_size(&self) -> u64 {
        self.slices.iter().map(|s| s.size()).sum()
    }

    /// Recomputes `compact_priority` from the slice list.
    ///
    /// Walking newest to oldest, a slice joins the current level while it is
    /// at most twice the bytes accumulated there; a noticeably larger slice
    /// starts the next level. Once any level holds more than
    /// `run_count_per_level` slices, the whole newest-first prefix through
    /// that level becomes the merge candidate and its length the priority.
    pub fn update_compact_priority(&mut self, opts: &LsmOpts) {
        if self.needs_compaction {
            self.compact_priority = self.slices.len();
            return;
        }
        let mut priority = 1usize;
        let mut total_count = 0usize;
        let mut level_count = 0usize;
        let mut level_size = 0u64;
        for slice in &self.slices {
            let size = slice.size();
            total_count += 1;
            if level_count == 0 || size <= level_size.saturating_mul(2) {
                level_count += 1;
                level_size += size;
            } else {
                level_count = 1;
                level_size = size;
            }
            if level_count > opts.run_count_per_level {
                priority = total_count;
            }
        }
        self.compact_priority = priority.min(self.slices.len().max(1));
    }

    /// Interval rendering for log lines, e.g. `[-inf..{"k"})`.
    pub fn interval_string(&self) -> String {
        fn bound(key: &Option<Key>, unbounded: &str) -> String {
            match key {
                None => unbounded.to_string(),
                Some(k) => format!(
                    "{{{}}}",
                    k.0.iter()
                        .map(|f| String::from_utf8_lossy(f).into_owned())
                        .collect::<Vec<_>>()
                        .join(",")
                ),
            }
        }
        format!(
            "[{}..{})",
            bound(&self.begin, "-inf"),
            bound(&self.end, "+inf")
        )
    }
}

impl std::fmt::Debug for RangeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangeState")
            .field("id", &self.id)
            .field("interval", &self.interval_string())
            .field("slices", &self.slices.len())
            .field("compact_priority", &self.compact_priority)
            .finish()
    }
}

// ------------------------------------------------------------------------------------------------
// LSM tree
// ------------------------------------------------------------------------------------------------

/// The logical LSM tree of one index.
pub struct LsmTree {
    /// Id from the metadata-log sequence.
    pub id: u64,
    pub name: String,
    pub space_id: u32,
    pub index_id: u32,
    pub is_primary: bool,

    /// The index's own key parts.
    pub key_def: Arc<KeyDef>,
    /// Comparison definition (key parts extended by the primary's).
    pub cmp_def: Arc<KeyDef>,

    pub opts: LsmOpts,

    /// Write buffer accepting new statements.
    pub active: Memtable,
    /// Sealed memtables awaiting dump, oldest first.
    pub sealed: VecDeque<Arc<Memtable>>,

    /// Key-ordered ranges partitioning the key space.
    pub ranges: Vec<RangeState>,
    /// Committed runs by id.
    pub runs: HashMap<u64, Arc<Run>>,

    /// Largest LSN known durable in runs (`DumpLsm` value).
    pub dump_lsn: u64,

    pub is_dropped: bool,
    /// True iff exactly one dump task is outstanding.
    pub is_dumping: bool,
    /// Non-cancellable reservations; a pinned tree is not dump-selected.
    pub pin_count: u32,
}

impl LsmTree {
    /// Creates an empty tree with one unbounded range.
    pub fn new(id: u64, range_id: u64, generation: u64, config: LsmConfig) -> Self {
        let cmp_def = match (&config.primary_key_def, config.is_primary) {
            (Some(primary), false) => config.key_def.merge(primary),
            _ => config.key_def.clone(),
        };
        info!(lsm = %config.name, id, "created LSM tree");
        Self {
            id,
            name: config.name,
            space_id: config.space_id,
            index_id: config.index_id,
            is_primary: config.is_primary,
            key_def: Arc::new(config.key_def),
            cmp_def: Arc::new(cmp_def),
            opts: config.opts,
            active: Memtable::new(generation),
            sealed: VecDeque::new(),
            ranges: vec![RangeState::new(range_id, None, None)],
            runs: HashMap::new(),
            dump_lsn: 0,
            is_dropped: false,
            is_dumping: false,
            pin_count: 0,
        }
    }

    /// The oldest memtable generation — the dump round this tree still owes.
    pub fn generation(&self) -> u64 {
        self.sealed
            .front()
            .map(|m| m.generation())
            .unwrap_or_else(|| self.active.generation())
    }

    /// Seals the active memtable and installs a fresh one at
    /// `new_generation`.
    pub fn rotate_mem(&mut self, new_generation: u64) {
        let old = std::mem::replace(&mut self.active, Memtable::new(new_generation));
        debug!(
            lsm = %self.name,
            generation = old.generation(),
            stmts = old.len(),
            "sealed memtable"
        );
        self.sealed.push_back(Arc::new(old));
    }

    /// Total slices across all ranges.
    pub fn slice_count(&self) -> usize {
        self.ranges.iter().map(|r| r.slices.len()).sum()
    }

    /// Maximum compaction priority over ranges available for selection.
    ///
    /// At most one compaction task runs per tree: while any range is
    /// being compacted the tree reports priority 1 and stays unselected.
    pub fn compact_priority(&self) -> usize {
        if self.ranges.iter().any(|r| r.is_compacting) {
            return 1;
        }
        self.ranges
            .iter()
            .map(|r| r.compact_priority)
            .max()
            .unwrap_or(1)
    }

    /// Index of the best range to compact next, if any.
    pub fn best_compact_range(&self) -> Option<usize> {
        self.ranges
            .iter()
            .enumerate()
            .filter(|(_, r)| !r.is_compacting)
            .max_by_key(|(_, r)| r.compact_priority)
            .map(|(i, _)| i)
    }

    /// Marks every range as user-requested for compaction.
    pub fn force_compaction(&mut self) {
        for range in &mut self.ranges {
            range.needs_compaction = true;
            range.update_compact_priority(&self.opts);
        }
        info!(lsm = %self.name, "compaction forced");
    }

    /// Indices of ranges whose interval intersects `[min_key, max_key]`.
    pub fn intersecting_ranges(&self, min_key: &Key, max_key: &Key) -> Vec<usize> {
        self.ranges
            .iter()
            .enumerate()
            .filter(|(_, r)| {
                let after_begin = r.begin.as_ref().is_none_or(|b| max_key >= b);
                let before_end = r.end.as_ref().is_none_or(|e| min_key < e);
                after_begin && before_end
            })
            .map(|(i, _)| i)
            .collect()
    }

    /// Attaches a committed run.
    pub fn add_run(&mut self, run: Arc<Run>) {
        self.runs.insert(run.id, run);
    }

    /// Drops the run handle (its files are the caller's concern).
    pub fn remove_run(&mut self, run_id: u64) -> Option<Arc<Run>> {
        self.runs.remove(&run_id)
    }

    /// Destroys sealed memtables at or below `generation`.
    pub fn delete_mems_up_to(&mut self, generation: u64) -> usize {
        let before = self.sealed.len();
        self.sealed.retain(|m| m.generation() > generation);
        before - self.sealed.len()
    }

    // --------------------------------------------------------------------
    // Compaction completion: positional slice replacement
    // --------------------------------------------------------------------

    /// Replaces the compacted slice span `[first_id ..= last_id]` of a range
    /// with `new_slice` (if any), inserting at the position `first_id`
    /// currently occupies so slices a concurrent dump prepended stay ahead.
    ///
    /// The whole edit is one in-memory splice with no suspension point.
    pub fn replace_slices(
        &mut self,
        range_idx: usize,
        first_id: u64,
        last_id: u64,
        new_slice: Option<Arc<Slice>>,
    ) -> Vec<Arc<Slice>> {
        let range = &mut self.ranges[range_idx];
        let first_pos = range
            .slices
            .iter()
            .position(|s| s.id == first_id)
            .expect("first compacted slice still in range");
        let last_pos = range
            .slices
            .iter()
            .position(|s| s.id == last_id)
            .expect("last compacted slice still in range");
        debug_assert!(first_pos <= last_pos);

        let removed: Vec<Arc<Slice>> = range
            .slices
            .drain(first_pos..=last_pos)
            .collect();
        if let Some(slice) = new_slice {
            range.slices.insert(first_pos, slice);
        }
        range.version += 1;
        range.needs_compaction = false;
        removed
    }

    // --------------------------------------------------------------------
    // Range split / coalesce
    // --------------------------------------------------------------------

    /// Splits the range when it outgrew `range_size` and a boundary key
    /// exists strictly inside it. Slices are re-cut per half (same runs,
    /// clamped intervals) and the change is metadata-logged atomically.
    ///
    /// Returns `true` when a split happened.
    pub fn try_split_range(
        &mut self,
        range_idx: usize,
        log: &MetaLog,
    ) -> Result<bool, MetaLogError> {
        let range = &self.ranges[range_idx];
        if range.is_compacting || range.total_size() <= self.opts.range_size {
            return Ok(false);
        }
        let Some(split_key) = self.split_key(range_idx) else {
            return Ok(false);
        };

        let range = &self.ranges[range_idx];
        let left_id = log.next_id();
        let right_id = log.next_id();

        // Build both halves' slice lists (order preserved) and the log
        // group before mutating anything.
        let mut tx = log.begin();
        let mut left_slices = VecDeque::new();
        let mut right_slices = VecDeque::new();
        for slice in &range.slices {
            tx.write(MetaRecord::DeleteSlice { slice_id: slice.id });
            for (half, begin, end) in [
                (
                    &mut left_slices,
                    slice.begin.clone(),
                    clamp_max(slice.end.clone(), &split_key),
                ),
                (
                    &mut right_slices,
                    clamp_min(slice.begin.clone(), &split_key),
                    slice.end.clone(),
                ),
            ] {
                let id = log.next_id();
                tx.write(MetaRecord::InsertSlice {
                    lsm_id: self.id,
                    run_id: slice.run.id,
                    slice_id: id,
                    begin: begin.clone(),
                    end: end.clone(),
                });
                half.push_back(Slice::new(id, Arc::clone(&slice.run), begin, end));
            }
        }
        tx.commit()?;

        let old = std::mem::replace(
            &mut self.ranges[range_idx],
            RangeState::new(left_id, None, None),
        );
        let mut left = RangeState::new(left_id, old.begin.clone(), Some(split_key.clone()));
        left.slices = left_slices;
        left.update_compact_priority(&self.opts);
        let mut right = RangeState::new(right_id, Some(split_key.clone()), old.end.clone());
        right.slices = right_slices;
        right.update_compact_priority(&self.opts);

        info!(
            lsm = %self.name,
            range = %old.interval_string(),
            split_at = %left.interval_string(),
            "range split"
        );
        self.ranges[range_idx] = left;
        self.ranges.insert(range_idx + 1, right);
        Ok(true)
    }

    /// Median boundary key of the range's slices, strictly inside the range.
    fn split_key(&self, range_idx: usize) -> Option<Key> {
        let range = &self.ranges[range_idx];
        let mut candidates: Vec<Key> = Vec::new();
        for slice in &range.slices {
            for key in [&slice.run.info.min_key, &slice.run.info.max_key] {
                if let Some(key) = key
                    && range.begin.as_ref().is_none_or(|b| key > b)
                    && range.end.as_ref().is_none_or(|e| key < e)
                {
                    candidates.push(key.clone());
                }
            }
        }
        candidates.sort();
        candidates.dedup();
        if candidates.is_empty() {
            return None;
        }
        Some(candidates[candidates.len() / 2].clone())
    }

    /// Coalesces the range with right-hand neighbours while the combined
    /// size stays under a quarter of `range_size`. The merged range keeps
    /// the union interval; slices are re-cut over it and metadata-logged.
    ///
    /// Returns `true` when a coalesce happened.
    pub fn try_coalesce_range(
        &mut self,
        range_idx: usize,
        log: &MetaLog,
    ) -> Result<bool, MetaLogError> {
        let limit = self.opts.range_size / 4;
        let mut end_idx = range_idx;
        let mut total = self.ranges[range_idx].total_size();
        while end_idx + 1 < self.ranges.len() {
            let next = &self.ranges[end_idx + 1];
            if next.is_compacting || total + next.total_size() > limit {
                break;
            }
            total += next.total_size();
            end_idx += 1;
        }
        if end_idx == range_idx || self.ranges[range_idx].is_compacting {
            return Ok(false);
        }

        let merged_id = log.next_id();
        let begin = self.ranges[range_idx].begin.clone();
        let end = self.ranges[end_idx].end.clone();

        let mut tx = log.begin();
        let mut merged_slices: VecDeque<Arc<Slice>> = VecDeque::new();
        for range in &self.ranges[range_idx..=end_idx] {
            for slice in &range.slices {
                tx.write(MetaRecord::DeleteSlice { slice_id: slice.id });
                let id = log.next_id();
                tx.write(MetaRecord::InsertSlice {
                    lsm_id: self.id,
                    run_id: slice.run.id,
                    slice_id: id,
                    begin: slice.begin.clone(),
                    end: slice.end.clone(),
                });
                merged_slices.push_back(Slice::new(
                    id,
                    Arc::clone(&slice.run),
                    slice.begin.clone(),
                    slice.end.clone(),
                ));
            }
        }
        tx.commit()?;

        let mut merged = RangeState::new(merged_id, begin, end);
        merged.slices = merged_slices;
        merged.update_compact_priority(&self.opts);
        info!(
            lsm = %self.name,
            merged = %merged.interval_string(),
            count = end_idx - range_idx + 1,
            "ranges coalesced"
        );
        let _removed: Vec<RangeState> = self.ranges.splice(range_idx..=end_idx, [merged]).collect();
        Ok(true)
    }
}

fn clamp_max(end: Option<Key>, split: &Key) -> Option<Key> {
    match end {
        Some(e) if e <= *split => Some(e),
        _ => Some(split.clone()),
    }
}

fn clamp_min(begin: Option<Key>, split: &Key) -> Option<Key> {
    match begin {
        Some(b) if b >= *split => Some(b),
        _ => Some(split.clone()),
    }
}

impl std::fmt::Debug for LsmTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LsmTree")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("generation", &self.generation())
            .field("sealed", &self.sealed.len())
            .field("ranges", &self.ranges.len())
            .field("runs", &self.runs.len())
            .field("is_dumping", &self.is_dumping)
            .finish()
    }
}
