//! # Metadata Log
//!
//! Append-only, transactional record of the engine's on-disk structure:
//! which runs exist, which slices reference them, and up to what LSN each
//! LSM tree has been dumped. The log is the linearisation point for all
//! structural changes — a run or slice becomes real the moment the group
//! containing its record commits, and is absent on replay otherwise.
//!
//! ## On-disk layout
//!
//! ```text
//! [HEADER_BYTES][HEADER_CRC32_LE]
//! [GROUP_LEN_LE][GROUP_BYTES][GROUP_CRC32_LE]
//! [GROUP_LEN_LE][GROUP_BYTES][GROUP_CRC32_LE]
//! ...
//! ```
//!
//! A group is the encoded record list of one transaction. It is framed and
//! checksummed as a unit, so a torn write corrupts the whole group and
//! replay stops there — either every record of a transaction is visible
//! after a crash, or none is.
//!
//! ## Contract
//!
//! - [`MetaLog::next_id`] yields fresh ids from one monotone sequence shared
//!   by LSM trees, ranges, runs, and slices.
//! - [`MetaTx::commit`] groups records atomically (fsync'ed).
//! - [`MetaTx::try_commit`] is best-effort: no fsync, every failure maps to
//!   `false`. Used for follow-up records whose loss recovery tolerates.
//! - [`MetaLog::replay`] rebuilds a [`MetaTopology`] from the file; records
//!   past the first corrupt frame are ignored.


use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::fault::FaultInjector;
use crate::stmt::Key;

const LOG_FILENAME: &str = "meta.log";
const LOG_MAGIC: &[u8; 4] = b"SMET";
const LOG_VERSION: u32 = 1;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by metadata-log operations.
#[derive(Debug, Error)]
pub enum MetaLogError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// The file header failed validation.
    #[error("Invalid log header: {0}")]
    InvalidHeader(String),

    /// A commit was failed by an armed test fault.
    #[error("Injected commit failure")]
    Injected,

    /// Internal invariant violation or poisoned lock.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Records
// ------------------------------------------------------------------------------------------------

/// A single structural change recorded in the log.
#[derive(Debug, Clone, PartialEq)]
pub enum MetaRecord {
    /// A run id was reserved and its file is being written.
    PrepareRun { lsm_id: u64, run_id: u64 },

    /// The run file exists and is durable.
    CreateRun {
        lsm_id: u64,
        run_id: u64,
        dump_lsn: u64,
    },

    /// The run is no longer referenced by any slice. Its files are retained
    /// while a checkpoint may still need them (`gc_lsn` records the
    /// checkpoint signature at drop time).
    DropRun { run_id: u64, gc_lsn: u64 },

    /// The run's files were removed; recovery can forget it entirely.
    ForgetRun { run_id: u64 },

    /// A slice over `[begin, end)` of a run joined an LSM tree.
    InsertSlice {
        lsm_id: u64,
        run_id: u64,
        slice_id: u64,
        begin: Option<Key>,
        end: Option<Key>,
    },

    /// A slice left its LSM tree.
    DeleteSlice { slice_id: u64 },

    /// The LSM tree has dumped all in-memory data up to `dump_lsn`.
    DumpLsm { lsm_id: u64, dump_lsn: u64 },
}

impl Encode for MetaRecord {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            MetaRecord::PrepareRun { lsm_id, run_id } => {
                0u32.encode_to(buf)?;
                lsm_id.encode_to(buf)?;
                run_id.encode_to(buf)?;
            }
            MetaRecord::CreateRun {
                lsm_id,
                run_id,
                dump_lsn,
            } => {
                1u32.encode_to(buf)?;
                lsm_id.encode_to(buf)?;
                run_id.encode_to(buf)?;
                dump_lsn.encode_to(buf)?;
            }
            MetaRecord::DropRun { run_id, gc_lsn } => {
                2u32.encode_to(buf)?;
                run_id.encode_to(buf)?;
                gc_lsn.encode_to(buf)?;
            }
            MetaRecord::ForgetRun { run_id } => {
                3u32.encode_to(buf)?;
                run_id.encode_to(buf)?;
            }
            MetaRecord::InsertSlice {
                lsm_id,
                run_id,
                slice_id,
                begin,
                end,
            } => {
                4u32.encode_to(buf)?;
                lsm_id.encode_to(buf)?;
                run_id.encode_to(buf)?;
                slice_id.encode_to(buf)?;
                begin.encode_to(buf)?;
                end.encode_to(buf)?;
            }
            MetaRecord::DeleteSlice { slice_id } => {
                5u32.encode_to(buf)?;
                slice_id.encode_to(buf)?;
            }
            MetaRecord::DumpLsm { lsm_id, dump_lsn } => {
                6u32.encode_to(buf)?;
                lsm_id.encode_to(buf)?;
                dump_lsn.encode_to(buf)?;
            }
        }
        Ok(())
    }
}

impl Decode for MetaRecord {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (tag, mut offset) = u32::decode_from(buf)?;
        macro_rules! field {
            ($ty:ty) => {{
                let (v, n) = <$ty>::decode_from(&buf[offset..])?;
                offset += n;
                v
            }};
        }
        let record = match tag {
            0 => MetaRecord::PrepareRun {
                lsm_id: field!(u64),
                run_id: field!(u64),
            },
            1 => MetaRecord::CreateRun {
                lsm_id: field!(u64),
                run_id: field!(u64),
                dump_lsn: field!(u64),
            },
            2 => MetaRecord::DropRun {
                run_id: field!(u64),
                gc_lsn: field!(u64),
            },
            3 => MetaRecord::ForgetRun {
                run_id: field!(u64),
            },
            4 => MetaRecord::InsertSlice {
                lsm_id: field!(u64),
                run_id: field!(u64),
                slice_id: field!(u64),
                begin: field!(Option<Key>),
                end: field!(Option<Key>),
            },
            5 => MetaRecord::DeleteSlice {
                slice_id: field!(u64),
            },
            6 => MetaRecord::DumpLsm {
                lsm_id: field!(u64),
                dump_lsn: field!(u64),
            },
            _ => {
                return Err(EncodingError::InvalidTag {
                    tag,
                    type_name: "MetaRecord",
                });
            }
        };
        Ok((record, offset))
    }
}

// ------------------------------------------------------------------------------------------------
// Replayed topology
// ------------------------------------------------------------------------------------------------

/// Lifecycle state of a run as recorded in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Reserved, file not yet durable. An orphan file is deleted on recovery.
    Prepared,
    /// File durable and potentially referenced by slices.
    Committed,
    /// Unreferenced; files retained for checkpoint recovery.
    Dropped,
    /// Files removed; nothing to recover.
    Forgotten,
}

/// A run as seen by replay.
#[derive(Debug, Clone, PartialEq)]
pub struct RunMeta {
    pub lsm_id: u64,
    pub state: RunState,
    pub dump_lsn: u64,
    pub gc_lsn: u64,
}

/// A live slice as seen by replay.
#[derive(Debug, Clone, PartialEq)]
pub struct SliceMeta {
    pub lsm_id: u64,
    pub run_id: u64,
    pub begin: Option<Key>,
    pub end: Option<Key>,
}

/// In-memory image of the log: the structural state replay reconstructs.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct MetaTopology {
    /// All runs ever mentioned, by id.
    pub runs: HashMap<u64, RunMeta>,
    /// Live slices, by id.
    pub slices: HashMap<u64, SliceMeta>,
    /// Last `DumpLsm` value per LSM tree.
    pub dump_lsn: HashMap<u64, u64>,
    /// Highest id observed in any record.
    pub max_id: u64,
}

impl MetaTopology {
    fn apply(&mut self, record: &MetaRecord) {
        match record {
            MetaRecord::PrepareRun { lsm_id, run_id } => {
                self.note_id(*run_id);
                self.runs.insert(
                    *run_id,
                    RunMeta {
                        lsm_id: *lsm_id,
                        state: RunState::Prepared,
                        dump_lsn: 0,
                        gc_lsn: 0,
                    },
                );
            }
            MetaRecord::CreateRun {
                lsm_id,
                run_id,
                dump_lsn,
            } => {
                self.note_id(*run_id);
                self.runs.insert(
                    *run_id,
                    RunMeta {
                        lsm_id: *lsm_id,
                        state: RunState::Committed,
                        dump_lsn: *dump_lsn,
                        gc_lsn: 0,
                    },
                );
            }
            MetaRecord::DropRun { run_id, gc_lsn } => {
                if let Some(run) = self.runs.get_mut(run_id) {
                    run.state = RunState::Dropped;
                    run.gc_lsn = *gc_lsn;
                }
            }
            MetaRecord::ForgetRun { run_id } => {
                if let Some(run) = self.runs.get_mut(run_id) {
                    run.state = RunState::Forgotten;
                }
            }
            MetaRecord::InsertSlice {
                lsm_id,
                run_id,
                slice_id,
                begin,
                end,
            } => {
                self.note_id(*slice_id);
                self.slices.insert(
                    *slice_id,
                    SliceMeta {
                        lsm_id: *lsm_id,
                        run_id: *run_id,
                        begin: begin.clone(),
                        end: end.clone(),
                    },
                );
            }
            MetaRecord::DeleteSlice { slice_id } => {
                self.slices.remove(slice_id);
            }
            MetaRecord::DumpLsm { lsm_id, dump_lsn } => {
                self.note_id(*lsm_id);
                let entry = self.dump_lsn.entry(*lsm_id).or_insert(0);
                if *dump_lsn > *entry {
                    *entry = *dump_lsn;
                }
            }
        }
    }

    fn note_id(&mut self, id: u64) {
        if id > self.max_id {
            self.max_id = id;
        }
    }

    /// Ids of live slices belonging to `lsm_id`, in insertion order of ids.
    pub fn live_slices(&self, lsm_id: u64) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .slices
            .iter()
            .filter(|(_, s)| s.lsm_id == lsm_id)
            .map(|(&id, _)| id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Ids of committed runs still referenced by at least one slice.
    pub fn referenced_runs(&self, lsm_id: u64) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .slices
            .values()
            .filter(|s| s.lsm_id == lsm_id)
            .map(|s| s.run_id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

// ------------------------------------------------------------------------------------------------
// MetaLog core
// ------------------------------------------------------------------------------------------------

struct LogFile {
    file: File,
}

/// The metadata log handle.
///
/// All mutation goes through [`MetaLog::begin`]; the returned [`MetaTx`]
/// buffers records and writes them as one framed group on commit. Dropping
/// an uncommitted transaction discards it without touching the file.
pub struct MetaLog {
    path: PathBuf,
    inner: Mutex<LogFile>,
    next_id: AtomicU64,
    /// Signature of the last completed checkpoint: the LSN below which
    /// on-disk state may still be needed for snapshot recovery.
    checkpoint_signature: AtomicU64,
    faults: std::sync::Arc<FaultInjector>,
}

impl MetaLog {
    /// Opens (or creates) the log in `dir`, replaying any existing records
    /// to seed the id sequence.
    pub fn open(
        dir: impl AsRef<Path>,
        faults: std::sync::Arc<FaultInjector>,
    ) -> Result<Self, MetaLogError> {
        std::fs::create_dir_all(dir.as_ref())?;
        let path = dir.as_ref().join(LOG_FILENAME);
        let fresh = !path.exists();

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        if fresh {
            let mut header = Vec::new();
            header.extend_from_slice(LOG_MAGIC);
            LOG_VERSION
                .encode_to(&mut header)
                .map_err(MetaLogError::Encoding)?;
            let mut hasher = Crc32::new();
            hasher.update(&header);
            let crc = hasher.finalize();
            file.write_all(&header)?;
            file.write_all(&crc.to_le_bytes())?;
            file.sync_data()?;
            info!(path = %path.display(), "created metadata log");
        }

        let topology = Self::replay_path(&path)?;
        let log = Self {
            path,
            inner: Mutex::new(LogFile { file }),
            next_id: AtomicU64::new(topology.max_id + 1),
            checkpoint_signature: AtomicU64::new(0),
            faults,
        };
        Ok(log)
    }

    /// Yields a fresh id from the shared monotone sequence.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// The signature of the last completed checkpoint (0 when none).
    pub fn signature(&self) -> u64 {
        self.checkpoint_signature.load(Ordering::SeqCst)
    }

    /// Records that a checkpoint covering everything up to `lsn` completed.
    pub fn set_checkpoint_signature(&self, lsn: u64) {
        self.checkpoint_signature.fetch_max(lsn, Ordering::SeqCst);
    }

    /// Starts a transaction. Records written to the returned guard become
    /// visible atomically on [`MetaTx::commit`].
    pub fn begin(&self) -> MetaTx<'_> {
        MetaTx {
            log: self,
            records: Vec::new(),
        }
    }

    /// Replays the log file into a [`MetaTopology`].
    pub fn replay(&self) -> Result<MetaTopology, MetaLogError> {
        Self::replay_path(&self.path)
    }

    fn replay_path(path: &Path) -> Result<MetaTopology, MetaLogError> {
        let mut file = File::open(path)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;

        let header_len = LOG_MAGIC.len() + 4;
        if buf.len() < header_len + 4 {
            return Err(MetaLogError::InvalidHeader("file too short".into()));
        }
        if &buf[..4] != LOG_MAGIC {
            return Err(MetaLogError::InvalidHeader("bad magic".into()));
        }
        let mut hasher = Crc32::new();
        hasher.update(&buf[..header_len]);
        let stored = u32::from_le_bytes([
            buf[header_len],
            buf[header_len + 1],
            buf[header_len + 2],
            buf[header_len + 3],
        ]);
        if hasher.finalize() != stored {
            return Err(MetaLogError::InvalidHeader("header checksum mismatch".into()));
        }

        let mut topology = MetaTopology::default();
        let mut cursor = header_len + 4;
        let mut groups = 0u64;
        while cursor < buf.len() {
            if buf.len() - cursor < 4 {
                warn!("metadata log ends in a truncated frame, ignoring tail");
                break;
            }
            let len = u32::from_le_bytes([
                buf[cursor],
                buf[cursor + 1],
                buf[cursor + 2],
                buf[cursor + 3],
            ]) as usize;
            let frame_end = cursor + 4 + len + 4;
            if frame_end > buf.len() {
                warn!("metadata log ends in a truncated group, ignoring tail");
                break;
            }
            let payload = &buf[cursor + 4..cursor + 4 + len];
            let stored = u32::from_le_bytes([
                buf[frame_end - 4],
                buf[frame_end - 3],
                buf[frame_end - 2],
                buf[frame_end - 1],
            ]);
            let mut hasher = Crc32::new();
            hasher.update(payload);
            if hasher.finalize() != stored {
                warn!("metadata log group checksum mismatch, ignoring tail");
                break;
            }
            let (records, _) = encoding::decode_seq::<MetaRecord>(payload)?;
            for record in &records {
                topology.apply(record);
            }
            groups += 1;
            cursor = frame_end;
        }
        debug!(groups, max_id = topology.max_id, "metadata log replayed");
        Ok(topology)
    }

    fn append_group(&self, records: &[MetaRecord], durable: bool) -> Result<(), MetaLogError> {
        if self.faults.take_log_commit() {
            return Err(MetaLogError::Injected);
        }

        let mut payload = Vec::new();
        encoding::encode_seq(records, &mut payload)?;
        let mut hasher = Crc32::new();
        hasher.update(&payload);
        let crc = hasher.finalize();

        let mut frame = Vec::with_capacity(payload.len() + 8);
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&payload);
        frame.extend_from_slice(&crc.to_le_bytes());

        let mut inner = self
            .inner
            .lock()
            .map_err(|_| MetaLogError::Internal("log mutex poisoned".into()))?;
        inner.file.write_all(&frame)?;
        if durable {
            inner.file.sync_data()?;
        } else {
            inner.file.flush()?;
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// MetaTx — transaction guard
// ------------------------------------------------------------------------------------------------

/// A buffered group of records. Nothing reaches the file until `commit`
/// (or `try_commit`); dropping the guard rolls the group back.
pub struct MetaTx<'a> {
    log: &'a MetaLog,
    records: Vec<MetaRecord>,
}

impl MetaTx<'_> {
    /// Buffers one record into the group.
    pub fn write(&mut self, record: MetaRecord) {
        self.records.push(record);
    }

    /// Number of records buffered so far.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when no records were written.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Atomically commits the group (single framed write + fsync).
    pub fn commit(self) -> Result<(), MetaLogError> {
        if self.records.is_empty() {
            return Ok(());
        }
        self.log.append_group(&self.records, true)
    }

    /// Best-effort commit: appends without fsync, mapping every failure to
    /// `false`. Loss is tolerable; recovery re-discovers the orphan state.
    pub fn try_commit(self) -> bool {
        if self.records.is_empty() {
            return true;
        }
        match self.log.append_group(&self.records, false) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "best-effort metadata-log commit lost");
                false
            }
        }
    }
}
