//! # Runs and Slices
//!
//! A **run** is an immutable, sorted on-disk file of statements produced by
//! a dump or a compaction. Runs never participate in reads directly — a
//! **slice** names a contiguous sub-interval of a run inside one range, and
//! slices are the only read path. A run is deletable once no slice
//! references it and no checkpoint retains it.
//!
//! ## On-disk layout
//!
//! ```text
//! [HEADER_BYTES][HEADER_CRC32_LE]
//! [BLK_LEN_LE][statements][BLK_CRC32_LE]      ← repeated, ~page_size each
//! ...
//! [BLK_LEN_LE][bloom bytes][BLK_CRC32_LE]
//! [BLK_LEN_LE][run info][BLK_CRC32_LE]
//! [BLOOM_OFF_LE][INFO_OFF_LE][TRAILER_CRC32_LE]
//! ```
//!
//! Statements are written in `(key ASC, LSN DESC)` order, the order every
//! write iterator produces. Committed files are opened read-only through a
//! shared memory map and decoded block-at-a-time, so iteration keeps a
//! single data block resident per reader.

#[cfg(test)]
pub(crate) mod tests;

pub mod writer;

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use bloomfilter::Bloom;
use memmap2::Mmap;
use thiserror::Error;
use tracing::{debug, warn};

use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::fault::FaultInjector;
use crate::metalog::{MetaTopology, RunState};
use crate::stmt::{Key, KeyDef, Statement, key_in_interval};

pub(crate) const RUN_MAGIC: &[u8; 4] = b"SRUN";
pub(crate) const RUN_VERSION: u32 = 1;
pub(crate) const RUN_HEADER_SIZE: usize = 12;
pub(crate) const RUN_TRAILER_SIZE: usize = 20;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by run file operations.
#[derive(Debug, Error)]
pub enum RunError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// A block or trailer failed its checksum.
    #[error("Checksum mismatch in run file")]
    ChecksumMismatch,

    /// The file header failed validation.
    #[error("Invalid run header: {0}")]
    InvalidHeader(String),

    /// A write was failed by an armed test fault.
    #[error("Injected run write failure")]
    Injected,

    /// Internal invariant violation.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Run environment
// ------------------------------------------------------------------------------------------------

/// Directory and fault hooks shared by all run I/O.
#[derive(Debug)]
pub struct RunEnv {
    dir: PathBuf,
    /// Test-only failure hooks consulted at I/O boundaries.
    pub faults: Arc<FaultInjector>,
}

impl RunEnv {
    /// Creates the environment, making the run directory if needed.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, RunError> {
        std::fs::create_dir_all(dir.as_ref())?;
        Ok(Self {
            dir: dir.as_ref().to_path_buf(),
            faults: Arc::new(FaultInjector::new()),
        })
    }

    /// Directory holding run files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Final path of a committed run file.
    pub fn run_path(&self, run_id: u64) -> PathBuf {
        self.dir.join(format!("{run_id:010}.run"))
    }

    /// Temporary path used while a run is being written.
    pub fn tmp_path(&self, run_id: u64) -> PathBuf {
        self.dir.join(format!("{run_id:010}.run.tmp"))
    }

    /// Removes a run's files (final and temporary), ignoring absence.
    pub fn remove_run_files(&self, run_id: u64) -> Result<(), RunError> {
        for path in [self.run_path(run_id), self.tmp_path(run_id)] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Deletes run files the replayed topology does not account for:
    /// prepared runs whose commit never happened, files of forgotten runs
    /// whose removal was lost with a best-effort log write, and dropped
    /// runs created after the last checkpoint (a crash between their
    /// `DropRun` commit and the follow-up file removal leaves the file
    /// behind). A dropped run dumped at or below the checkpoint signature
    /// is still needed for snapshot recovery and stays.
    pub fn sweep_orphans(&self, topology: &MetaTopology) -> Result<usize, RunError> {
        let mut removed = 0usize;
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
                continue;
            };
            let id = name
                .strip_suffix(".run.tmp")
                .or_else(|| name.strip_suffix(".run"))
                .and_then(|s| s.parse::<u64>().ok());
            let Some(id) = id else { continue };

            let keep = name.ends_with(".run")
                && match topology.runs.get(&id) {
                    Some(run) => match run.state {
                        RunState::Committed => true,
                        RunState::Dropped => run.dump_lsn <= run.gc_lsn,
                        RunState::Prepared | RunState::Forgotten => false,
                    },
                    None => false,
                };
            if !keep {
                warn!(run_id = id, path = %path.display(), "removing orphan run file");
                std::fs::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

// ------------------------------------------------------------------------------------------------
// Run info
// ------------------------------------------------------------------------------------------------

/// Statistics and key bounds recorded in a committed run's footer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunInfo {
    /// Number of statements written.
    pub stmt_count: u64,
    /// Smallest / largest LSN across statements.
    pub min_lsn: u64,
    pub max_lsn: u64,
    /// Smallest / largest extracted key (`None` for an empty run).
    pub min_key: Option<Key>,
    pub max_key: Option<Key>,
}

impl Encode for RunInfo {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.stmt_count.encode_to(buf)?;
        self.min_lsn.encode_to(buf)?;
        self.max_lsn.encode_to(buf)?;
        self.min_key.encode_to(buf)?;
        self.max_key.encode_to(buf)
    }
}

impl Decode for RunInfo {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (stmt_count, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (min_lsn, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (max_lsn, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (min_key, n) = Option::<Key>::decode_from(&buf[offset..])?;
        offset += n;
        let (max_key, n) = Option::<Key>::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                stmt_count,
                min_lsn,
                max_lsn,
                min_key,
                max_key,
            },
            offset,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// Run
// ------------------------------------------------------------------------------------------------

/// An immutable, committed on-disk run.
///
/// Slice reference counters are mutated only by the coordinator thread; they
/// are atomics solely so `Run` can be shared with workers via `Arc`.
pub struct Run {
    /// Id from the metadata-log sequence.
    pub id: u64,
    /// Largest statement LSN at dump time; recorded in `CreateRun`.
    pub dump_lsn: u64,
    /// Footer statistics.
    pub info: RunInfo,
    /// File size in bytes.
    pub size: u64,

    mmap: Mmap,
    data_end: usize,
    bloom: Option<Bloom<Vec<u8>>>,

    /// Number of live slices referencing this run.
    slice_count: AtomicUsize,
    /// Slices consumed so far by an in-flight compaction walk.
    compacted_slice_count: AtomicUsize,
}

impl Run {
    /// Opens a committed run file.
    pub fn open(env: &RunEnv, id: u64, dump_lsn: u64) -> Result<Self, RunError> {
        let path = env.run_path(id);
        let file = File::open(&path)?;
        let size = file.metadata()?.len();
        // Safety: run files are immutable once committed and never written
        // through while mapped.
        let mmap = unsafe { Mmap::map(&file)? };

        if mmap.len() < RUN_HEADER_SIZE + RUN_TRAILER_SIZE {
            return Err(RunError::InvalidHeader("file too short".into()));
        }
        if &mmap[..4] != RUN_MAGIC {
            return Err(RunError::InvalidHeader("bad magic".into()));
        }
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&mmap[..8]);
        if hasher.finalize() != read_u32(&mmap, 8) {
            return Err(RunError::InvalidHeader("header checksum mismatch".into()));
        }

        let trailer_at = mmap.len() - RUN_TRAILER_SIZE;
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&mmap[trailer_at..trailer_at + 16]);
        if hasher.finalize() != read_u32(&mmap, trailer_at + 16) {
            return Err(RunError::ChecksumMismatch);
        }
        let bloom_off = read_u64(&mmap, trailer_at) as usize;
        let info_off = read_u64(&mmap, trailer_at + 8) as usize;

        let bloom_bytes = read_block(&mmap, bloom_off)?;
        let bloom = if bloom_bytes.is_empty() {
            None
        } else {
            match Bloom::from_slice(bloom_bytes) {
                Ok(b) => Some(b),
                Err(e) => {
                    warn!(run_id = id, error = %e, "run bloom filter unreadable, ignoring");
                    None
                }
            }
        };

        let info_bytes = read_block(&mmap, info_off)?;
        let (info, _) = encoding::decode_from_slice::<RunInfo>(info_bytes)?;

        debug!(run_id = id, stmt_count = info.stmt_count, size, "opened run");
        Ok(Self {
            id,
            dump_lsn,
            info,
            size,
            mmap,
            data_end: bloom_off,
            bloom,
            slice_count: AtomicUsize::new(0),
            compacted_slice_count: AtomicUsize::new(0),
        })
    }

    /// True when the bloom filter cannot rule the key out (or no filter).
    pub fn may_contain(&self, key: &Key) -> bool {
        match (&self.bloom, encoding::encode_to_vec(key)) {
            (Some(bloom), Ok(bytes)) => bloom.check(&bytes),
            _ => true,
        }
    }

    /// Live slice references.
    pub fn slice_count(&self) -> usize {
        self.slice_count.load(Ordering::Relaxed)
    }

    pub(crate) fn ref_slice(&self) {
        self.slice_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn unref_slice(&self) {
        self.slice_count.fetch_sub(1, Ordering::Relaxed);
    }

    /// Counts one slice consumed by a compaction walk; returns the total so
    /// far. The run becomes unused when this reaches `slice_count`.
    pub(crate) fn note_compacted_slice(&self) -> usize {
        self.compacted_slice_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Rolls one walk step back (failed metadata-log commit).
    pub(crate) fn unnote_compacted_slice(&self) {
        self.compacted_slice_count.fetch_sub(1, Ordering::Relaxed);
    }

    /// Iterates every statement in file order, decoding block-at-a-time.
    pub fn iter(self: &Arc<Self>, cmp_def: &KeyDef) -> RunIter {
        RunIter {
            run: Arc::clone(self),
            cmp_def: cmp_def.clone(),
            cursor: RUN_HEADER_SIZE,
            block: Vec::new(),
            block_pos: 0,
            failed: false,
        }
    }
}

impl std::fmt::Debug for Run {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Run")
            .field("id", &self.id)
            .field("dump_lsn", &self.dump_lsn)
            .field("stmt_count", &self.info.stmt_count)
            .field("slice_count", &self.slice_count())
            .finish()
    }
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(b)
}

/// Reads one `[len][payload][crc]` block starting at `at`.
fn read_block(buf: &[u8], at: usize) -> Result<&[u8], RunError> {
    if at + 4 > buf.len() {
        return Err(RunError::ChecksumMismatch);
    }
    let len = read_u32(buf, at) as usize;
    let end = at + 4 + len + 4;
    if end > buf.len() {
        return Err(RunError::ChecksumMismatch);
    }
    let payload = &buf[at + 4..at + 4 + len];
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(payload);
    if hasher.finalize() != read_u32(buf, at + 4 + len) {
        return Err(RunError::ChecksumMismatch);
    }
    Ok(payload)
}

// ------------------------------------------------------------------------------------------------
// Run iteration
// ------------------------------------------------------------------------------------------------

/// Streaming iterator over every statement of a run.
pub struct RunIter {
    run: Arc<Run>,
    cmp_def: KeyDef,
    cursor: usize,
    block: Vec<(Key, Statement)>,
    block_pos: usize,
    failed: bool,
}

impl RunIter {
    fn load_next_block(&mut self) -> Result<bool, RunError> {
        if self.cursor >= self.run.data_end {
            return Ok(false);
        }
        let payload = read_block(&self.run.mmap, self.cursor)?;
        let frame = 4 + payload.len() + 4;
        let (stmts, _) = encoding::decode_seq::<Statement>(payload)?;
        self.block = stmts
            .into_iter()
            .map(|s| (self.cmp_def.extract(&s.tuple), s))
            .collect();
        self.block_pos = 0;
        self.cursor += frame;
        Ok(true)
    }
}

impl Iterator for RunIter {
    type Item = Result<(Key, Statement), RunError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if self.block_pos < self.block.len() {
                let item = self.block[self.block_pos].clone();
                self.block_pos += 1;
                return Some(Ok(item));
            }
            match self.load_next_block() {
                Ok(true) => continue,
                Ok(false) => return None,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Slice
// ------------------------------------------------------------------------------------------------

/// A reference to the sub-interval `[begin, end)` of a run within one range.
pub struct Slice {
    /// Id from the metadata-log sequence.
    pub id: u64,
    /// The referenced run.
    pub run: Arc<Run>,
    /// Clamp interval; `None` means unbounded on that side.
    pub begin: Option<Key>,
    pub end: Option<Key>,

    /// Reader pin count; destruction waits for pinned readers to drain.
    pins: Mutex<u32>,
    pins_cleared: Condvar,
}

impl Slice {
    /// Creates a slice over `[begin, end)` of `run`, taking a run reference.
    pub fn new(id: u64, run: Arc<Run>, begin: Option<Key>, end: Option<Key>) -> Arc<Self> {
        run.ref_slice();
        Arc::new(Self {
            id,
            run,
            begin,
            end,
            pins: Mutex::new(0),
            pins_cleared: Condvar::new(),
        })
    }

    /// Rough statement count attributed to this slice.
    pub fn stmt_count(&self) -> u64 {
        // A slice usually spans the whole run interval that intersects its
        // range, so the run count is the best cheap estimate.
        self.run.info.stmt_count.max(1)
    }

    /// Approximate on-disk bytes attributed to this slice.
    pub fn size(&self) -> u64 {
        self.run.size.max(1)
    }

    /// Iterates the slice's statements in `(key ASC, LSN DESC)` order.
    pub fn iter(self: &Arc<Self>, cmp_def: &KeyDef) -> SliceIter {
        SliceIter {
            inner: self.run.iter(cmp_def),
            begin: self.begin.clone(),
            end: self.end.clone(),
        }
    }

    // --------------------------------------------------------------------
    // Reader pins
    // --------------------------------------------------------------------

    /// Takes a reader pin; the slice will not be destroyed while pinned.
    pub fn pin(&self) {
        let mut pins = self.pins.lock().unwrap_or_else(|e| e.into_inner());
        *pins += 1;
    }

    /// Releases a reader pin.
    pub fn unpin(&self) {
        let mut pins = self.pins.lock().unwrap_or_else(|e| e.into_inner());
        debug_assert!(*pins > 0, "unpin without matching pin");
        *pins = pins.saturating_sub(1);
        if *pins == 0 {
            self.pins_cleared.notify_all();
        }
    }

    /// Blocks until all reader pins are released.
    pub fn wait_pinned(&self) {
        let mut pins = self.pins.lock().unwrap_or_else(|e| e.into_inner());
        while *pins > 0 {
            pins = self
                .pins_cleared
                .wait(pins)
                .unwrap_or_else(|e| e.into_inner());
        }
    }
}

impl Drop for Slice {
    fn drop(&mut self) {
        self.run.unref_slice();
    }
}

impl std::fmt::Debug for Slice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slice")
            .field("id", &self.id)
            .field("run_id", &self.run.id)
            .field("begin", &self.begin)
            .field("end", &self.end)
            .finish()
    }
}

/// Streaming iterator over the statements of one slice.
pub struct SliceIter {
    inner: RunIter,
    begin: Option<Key>,
    end: Option<Key>,
}

impl Iterator for SliceIter {
    type Item = Result<(Key, Statement), RunError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.inner.next()? {
                Ok((key, stmt)) => {
                    if key_in_interval(&key, self.begin.as_ref(), self.end.as_ref()) {
                        return Some(Ok((key, stmt)));
                    }
                    // Keys past `end` cannot reappear in a sorted run.
                    if let Some(end) = &self.end
                        && key >= *end
                    {
                        return None;
                    }
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
