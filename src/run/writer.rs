//! Run writer — streams sorted statements into a new immutable run file.
//!
//! The writer receives statements in `(key ASC, LSN DESC)` order from a
//! write iterator, packs them into checksummed blocks of roughly
//! `page_size` bytes, and on [`RunWriter::commit`] appends the bloom filter
//! and footer, fsyncs, and atomically renames `<id>.run.tmp` → `<id>.run`.
//! A crash or [`RunWriter::abort`] leaves no committed file behind.

use std::fs::{File, OpenOptions, rename};
use std::io::{BufWriter, Write};

use bloomfilter::Bloom;
use tracing::{debug, warn};

use crate::encoding;
use crate::stmt::{Key, Statement};

use super::{RUN_MAGIC, RUN_VERSION, RunEnv, RunError, RunInfo};

/// Streams a sorted statement sequence into a run file.
pub struct RunWriter<'a> {
    env: &'a RunEnv,
    run_id: u64,
    bloom_fpr: f64,
    page_size: usize,

    file: BufWriter<File>,
    /// Bytes handed to the file so far; block offsets derive from it.
    written: u64,
    /// Encoded statements of the block being accumulated.
    block: Vec<Statement>,
    block_bytes: usize,
    /// Encoded keys for the bloom filter, collected until commit (the
    /// final statement count sizes the filter).
    key_bytes: Vec<Vec<u8>>,
    info: RunInfo,
}

impl<'a> RunWriter<'a> {
    /// Creates the temporary file and writes the header.
    pub fn create(
        env: &'a RunEnv,
        run_id: u64,
        bloom_fpr: f64,
        page_size: usize,
    ) -> Result<Self, RunError> {
        let tmp = env.tmp_path(run_id);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        let mut file = BufWriter::new(file);

        let mut header = Vec::with_capacity(8);
        header.extend_from_slice(RUN_MAGIC);
        header.extend_from_slice(&RUN_VERSION.to_le_bytes());
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&header);
        let crc = hasher.finalize();
        file.write_all(&header)?;
        file.write_all(&crc.to_le_bytes())?;

        Ok(Self {
            env,
            run_id,
            bloom_fpr,
            page_size: page_size.max(64),
            file,
            written: super::RUN_HEADER_SIZE as u64,
            block: Vec::new(),
            block_bytes: 0,
            key_bytes: Vec::new(),
            info: RunInfo::default(),
        })
    }

    /// Appends one statement. Input must arrive in `(key ASC, LSN DESC)`
    /// order; the writer records bounds but does not re-sort.
    pub fn append(&mut self, key: &Key, stmt: Statement) -> Result<(), RunError> {
        if self.env.faults.take_run_write() {
            return Err(RunError::Injected);
        }

        if self.info.stmt_count == 0 {
            self.info.min_lsn = stmt.lsn;
            self.info.max_lsn = stmt.lsn;
            self.info.min_key = Some(key.clone());
        } else {
            self.info.min_lsn = self.info.min_lsn.min(stmt.lsn);
            self.info.max_lsn = self.info.max_lsn.max(stmt.lsn);
        }
        self.info.max_key = Some(key.clone());
        self.info.stmt_count += 1;

        self.key_bytes.push(encoding::encode_to_vec(key)?);
        self.block_bytes += stmt.size();
        self.block.push(stmt);

        if self.block_bytes >= self.page_size {
            self.flush_block()?;
        }
        Ok(())
    }

    /// Statements appended so far.
    pub fn stmt_count(&self) -> u64 {
        self.info.stmt_count
    }

    /// Finishes the file: flushes the tail block, writes bloom and footer,
    /// fsyncs, and renames into place. Returns the footer statistics.
    pub fn commit(mut self) -> Result<RunInfo, RunError> {
        if self.env.faults.take_run_write() {
            self.discard();
            return Err(RunError::Injected);
        }

        if let Err(e) = self.commit_inner() {
            self.discard();
            return Err(e);
        }

        let tmp = self.env.tmp_path(self.run_id);
        let path = self.env.run_path(self.run_id);
        rename(&tmp, &path)?;
        debug!(
            run_id = self.run_id,
            stmt_count = self.info.stmt_count,
            "run committed"
        );
        Ok(self.info.clone())
    }

    fn commit_inner(&mut self) -> Result<(), RunError> {
        self.flush_block()?;

        // Bloom filter over every appended key; empty block for an empty run.
        let bloom_bytes = if self.key_bytes.is_empty() {
            Vec::new()
        } else {
            let mut bloom =
                Bloom::<Vec<u8>>::new_for_fp_rate(self.key_bytes.len(), self.bloom_fpr)
                    .map_err(|e| RunError::Internal(e.to_string()))?;
            for key in &self.key_bytes {
                bloom.set(key);
            }
            bloom.as_slice().to_vec()
        };
        let bloom_off = self.write_block(&bloom_bytes)?;

        let info_bytes = encoding::encode_to_vec(&self.info)?;
        let info_off = self.write_block(&info_bytes)?;

        let mut trailer = Vec::with_capacity(16);
        trailer.extend_from_slice(&bloom_off.to_le_bytes());
        trailer.extend_from_slice(&info_off.to_le_bytes());
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&trailer);
        let crc = hasher.finalize();
        self.file.write_all(&trailer)?;
        self.file.write_all(&crc.to_le_bytes())?;

        self.file.flush()?;
        self.file.get_ref().sync_all()?;
        Ok(())
    }

    /// Abandons the run, removing the temporary file.
    pub fn abort(mut self) {
        self.discard();
        debug!(run_id = self.run_id, "run aborted");
    }

    fn discard(&mut self) {
        let _ = self.file.flush();
        let tmp = self.env.tmp_path(self.run_id);
        if let Err(e) = std::fs::remove_file(&tmp)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(run_id = self.run_id, error = %e, "failed to remove aborted run file");
        }
    }

    fn flush_block(&mut self) -> Result<(), RunError> {
        if self.block.is_empty() {
            return Ok(());
        }
        let mut payload = Vec::with_capacity(self.block_bytes + 16);
        encoding::encode_seq(&self.block, &mut payload)?;
        self.write_block(&payload)?;
        self.block.clear();
        self.block_bytes = 0;
        Ok(())
    }

    /// Writes one `[len][payload][crc]` block, returning its file offset.
    fn write_block(&mut self, payload: &[u8]) -> Result<u64, RunError> {
        // BufWriter has no stable stream position across flushes; track the
        // offset from what has been handed to `write_all` so far.
        let offset = self.written;
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(payload);
        let crc = hasher.finalize();
        self.file.write_all(&(payload.len() as u32).to_le_bytes())?;
        self.file.write_all(payload)?;
        self.file.write_all(&crc.to_le_bytes())?;
        self.written += 4 + payload.len() as u64 + 4;
        Ok(offset)
    }
}
