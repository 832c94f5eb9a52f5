//! Striped Append Log Module
//!
//! The stripe log is an append-only, erasure-coded copy of the packed
//! block stream. It spreads each group of `k` data blocks plus `m` parity
//! blocks across `k + m` **lane files**; the i-th 32 KiB block of every
//! lane together forms **stripe i**.
//!
//! # On-disk layout
//!
//! ```text
//! lanes/
//!   data_0 … data_{k-1}      data lanes, 32 KiB blocks
//!   parity_0 … parity_{m-1}  parity lanes, 32 KiB blocks
//! ```
//!
//! # Write protocol
//!
//! Blocks arrive one at a time. When `k` data blocks have accumulated,
//! parity is encoded and the whole stripe is issued to the lane writers at
//! offset `stripe × 32 KiB` (lanes only ever append, so this is the
//! current end of every lane). Each lane buffers up to 1 MiB.
//!
//! Durability is group-committed: after `group_n` stripes or
//! `group_micros` microseconds, all lanes are flushed and barriered
//! (`fdatasync` in fast mode, `fsync` in durable mode), then the
//! `on_commit` callback observes the new committed-stripe count so the
//! manifest can record it.
//!
//! # Recovery
//!
//! On open, every lane is truncated to `min_i ⌊len_i / 32 KiB⌋` stripes,
//! and further down to the manifest's committed count if that is smaller.
//! This restores the alignment invariant: all lanes end at the same
//! stripe boundary.
//!
//! # Read protocol
//!
//! Reading stripe `s` fetches the k data blocks and CRC-verifies each.
//! Damaged or missing blocks are rebuilt from the parity lanes; more than
//! `m` unreadable lanes (or no parity configured) fails the stripe.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufWriter, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    time::Instant,
};

use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::block::{self, BLOCK_SIZE};
use crate::parity::{ParityCoder, ParityError, ParityKind};

/// Per-lane write buffer size.
const LANE_BUF_BYTES: usize = 1024 * 1024;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by stripe log operations.
#[derive(Debug, Error)]
pub enum StripeError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Parity coder failure.
    #[error("parity error: {0}")]
    Parity(#[from] ParityError),

    /// More than `m` lanes of a stripe were unreadable.
    #[error("stripe {stripe} unrecoverable: {unreadable} lanes unreadable, parity covers {max}")]
    Unrecoverable {
        /// Stripe index that could not be served.
        stripe: u64,
        /// Number of unreadable lanes.
        unreadable: usize,
        /// Maximum erasures the configured parity repairs.
        max: usize,
    },

    /// A block of the wrong size was handed to the writer.
    #[error("block must be exactly {BLOCK_SIZE} bytes, got {0}")]
    BadBlockSize(usize),

    /// Stripe index beyond the committed range.
    #[error("stripe {requested} out of range (committed: {committed})")]
    OutOfRange {
        /// Requested stripe index.
        requested: u64,
        /// Stripes currently committed.
        committed: u64,
    },
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Stripe log tuning knobs, supplied by the engine.
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Data lanes per stripe.
    pub k: usize,

    /// Parity lanes per stripe.
    pub m: usize,

    /// Parity scheme.
    pub kind: ParityKind,

    /// Commit after this many stripes.
    pub group_n: u64,

    /// Commit after this many microseconds since the last commit.
    pub group_micros: u64,

    /// `true` → fdatasync-class barrier; `false` → full fsync.
    pub fast_mode: bool,
}

/// What recovery did to the lane files on open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Stripes durable after truncation.
    pub committed: u64,

    /// Bytes discarded across all lanes to restore alignment.
    pub trimmed_bytes: u64,
}

// ------------------------------------------------------------------------------------------------
// Lane naming
// ------------------------------------------------------------------------------------------------

fn lane_path(dir: &Path, idx: usize, k: usize) -> PathBuf {
    if idx < k {
        dir.join(format!("data_{idx}"))
    } else {
        dir.join(format!("parity_{}", idx - k))
    }
}

// ------------------------------------------------------------------------------------------------
// Stripe writer
// ------------------------------------------------------------------------------------------------

/// Owns the `k + m` lane files and drives the group-committed append path.
pub struct StripeWriter {
    lanes: Vec<BufWriter<File>>,
    coder: ParityCoder,
    config: StripeConfig,
    dir: PathBuf,

    /// Data blocks accumulated for the stripe in progress.
    pending: Vec<Vec<u8>>,

    /// Index of the next stripe to be written.
    next_stripe: u64,

    /// Stripes made durable so far.
    committed: u64,

    stripes_since_commit: u64,
    last_commit: Instant,

    /// Observes every successful commit with the new committed count.
    on_commit: Option<Box<dyn FnMut(u64) + Send + Sync>>,
}

impl std::fmt::Debug for StripeWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeWriter")
            .field("dir", &self.dir)
            .field("next_stripe", &self.next_stripe)
            .field("committed", &self.committed)
            .finish_non_exhaustive()
    }
}

impl StripeWriter {
    /// Opens (or creates) the lane files under `dir`, recovering alignment
    /// first.
    ///
    /// `manifest_committed` is the stripe count the manifest vouches for;
    /// lanes are never trusted beyond it.
    pub fn open(
        dir: impl AsRef<Path>,
        config: StripeConfig,
        manifest_committed: u64,
    ) -> Result<(Self, RecoveryReport), StripeError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let report = recover_lanes(&dir, config.k, config.m, manifest_committed)?;

        let coder = ParityCoder::new(config.kind, config.k, config.m)?;
        let mut lanes = Vec::with_capacity(config.k + config.m);
        for idx in 0..config.k + config.m {
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .append(true)
                .open(lane_path(&dir, idx, config.k))?;
            lanes.push(BufWriter::with_capacity(LANE_BUF_BYTES, file));
        }

        info!(
            dir = %dir.display(),
            k = config.k,
            m = config.m,
            committed = report.committed,
            trimmed = report.trimmed_bytes,
            "stripe log opened"
        );

        Ok((
            Self {
                lanes,
                coder,
                dir,
                pending: Vec::with_capacity(config.k),
                next_stripe: report.committed,
                committed: report.committed,
                stripes_since_commit: 0,
                last_commit: Instant::now(),
                on_commit: None,
                config,
            },
            report,
        ))
    }

    /// Registers the commit observer (the engine wires this to the
    /// manifest's `StripeCommit` event).
    pub fn set_on_commit(&mut self, cb: Box<dyn FnMut(u64) + Send + Sync>) {
        self.on_commit = Some(cb);
    }

    /// Stripes durable so far.
    pub fn committed_stripes(&self) -> u64 {
        self.committed
    }

    /// Appends one sealed 32 KiB block to the stripe in progress.
    ///
    /// Completing the k-th slot writes the whole stripe (data + parity)
    /// and may trigger a group commit.
    pub fn append_block(&mut self, blk: Vec<u8>) -> Result<(), StripeError> {
        if blk.len() != BLOCK_SIZE {
            return Err(StripeError::BadBlockSize(blk.len()));
        }
        self.pending.push(blk);
        if self.pending.len() == self.config.k {
            self.write_stripe()?;
            self.maybe_commit()?;
        }
        Ok(())
    }

    /// Pads a partial stripe with empty blocks, writes it, and commits
    /// unconditionally.
    pub fn flush(&mut self) -> Result<(), StripeError> {
        if !self.pending.is_empty() {
            while self.pending.len() < self.config.k {
                self.pending.push(block::empty_block());
            }
            self.write_stripe()?;
        }
        if self.committed < self.next_stripe || self.stripes_since_commit > 0 {
            self.commit()?;
        }
        Ok(())
    }

    /// Flushes and drops the lane handles.
    pub fn close(mut self) -> Result<(), StripeError> {
        self.flush()
    }

    fn write_stripe(&mut self) -> Result<(), StripeError> {
        let data: Vec<&[u8]> = self.pending.iter().map(Vec::as_slice).collect();
        let parity = self.coder.encode(&data)?;

        for (lane, blk) in self.lanes[..self.config.k].iter_mut().zip(&self.pending) {
            lane.write_all(blk)?;
        }
        for (lane, blk) in self.lanes[self.config.k..].iter_mut().zip(&parity) {
            lane.write_all(blk)?;
        }

        trace!(stripe = self.next_stripe, "stripe written");
        self.pending.clear();
        self.next_stripe += 1;
        self.stripes_since_commit += 1;
        Ok(())
    }

    fn maybe_commit(&mut self) -> Result<(), StripeError> {
        let elapsed = self.last_commit.elapsed().as_micros() as u64;
        if self.stripes_since_commit >= self.config.group_n || elapsed >= self.config.group_micros {
            self.commit()?;
        }
        Ok(())
    }

    /// Flushes every lane buffer, issues the durability barrier, and
    /// reports the new committed count.
    pub fn commit(&mut self) -> Result<(), StripeError> {
        for lane in &mut self.lanes {
            lane.flush()?;
            let file = lane.get_ref();
            if self.config.fast_mode {
                file.sync_data()?;
            } else {
                file.sync_all()?;
            }
        }

        self.committed = self.next_stripe;
        self.stripes_since_commit = 0;
        self.last_commit = Instant::now();

        debug!(committed = self.committed, "stripe group commit");
        if let Some(cb) = self.on_commit.as_mut() {
            cb(self.committed);
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Recovery
// ------------------------------------------------------------------------------------------------

/// Truncates every lane to the last common durable stripe.
///
/// Returns the resulting committed count and how many bytes were
/// discarded (zero on a clean open).
pub fn recover_lanes(
    dir: &Path,
    k: usize,
    m: usize,
    manifest_committed: u64,
) -> Result<RecoveryReport, StripeError> {
    let mut min_stripes = u64::MAX;
    let mut lengths = Vec::with_capacity(k + m);

    for idx in 0..k + m {
        let path = lane_path(dir, idx, k);
        let len = match fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        lengths.push((path, len));
        min_stripes = min_stripes.min(len / BLOCK_SIZE as u64);
    }

    // Lanes that never existed hold zero stripes.
    if min_stripes == u64::MAX {
        min_stripes = 0;
    }

    // Never trust lane bytes the manifest has not committed.
    let target = min_stripes.min(manifest_committed);
    let target_bytes = target * BLOCK_SIZE as u64;

    let mut trimmed = 0u64;
    for (path, len) in &lengths {
        if *len > target_bytes {
            trimmed += len - target_bytes;
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(target_bytes)?;
            file.sync_all()?;
        }
    }

    if trimmed > 0 {
        warn!(
            dir = %dir.display(),
            committed = target,
            trimmed_bytes = trimmed,
            "stripe lanes truncated to last durable stripe"
        );
    }

    Ok(RecoveryReport {
        committed: target,
        trimmed_bytes: trimmed,
    })
}

// ------------------------------------------------------------------------------------------------
// Stripe reader
// ------------------------------------------------------------------------------------------------

/// Read-only view of the lane files with parity repair.
pub struct StripeReader {
    paths: Vec<PathBuf>,
    coder: ParityCoder,
    k: usize,
    m: usize,
    committed: u64,
}

impl StripeReader {
    /// Opens a reader over `committed` stripes of the lanes under `dir`.
    pub fn open(
        dir: impl AsRef<Path>,
        k: usize,
        m: usize,
        kind: ParityKind,
        committed: u64,
    ) -> Result<Self, StripeError> {
        let dir = dir.as_ref();
        let coder = ParityCoder::new(kind, k, m)?;
        let paths = (0..k + m).map(|idx| lane_path(dir, idx, k)).collect();
        Ok(Self {
            paths,
            coder,
            k,
            m,
            committed,
        })
    }

    /// Stripes this reader will serve.
    pub fn committed_stripes(&self) -> u64 {
        self.committed
    }

    /// Reads the `k` data blocks of stripe `idx`, reconstructing damaged
    /// lanes from parity when necessary.
    pub fn read_stripe(&self, idx: u64) -> Result<Vec<Vec<u8>>, StripeError> {
        if idx >= self.committed {
            return Err(StripeError::OutOfRange {
                requested: idx,
                committed: self.committed,
            });
        }

        let offset = idx * BLOCK_SIZE as u64;

        // First pass: data lanes only, CRC-classified.
        let mut shards: Vec<Option<Vec<u8>>> = Vec::with_capacity(self.k + self.m);
        let mut bad_data = 0usize;
        for lane in 0..self.k {
            let blk = self.read_lane_block(lane, offset);
            if let Some(b) = &blk
                && block::verify(b)
            {
                shards.push(blk);
            } else {
                shards.push(None);
                bad_data += 1;
            }
        }

        if bad_data == 0 {
            return Ok(shards.into_iter().map(|s| s.expect("verified above")).collect());
        }

        // Second pass: bring in parity and reconstruct.
        let mut bad_total = bad_data;
        for lane in self.k..self.k + self.m {
            let blk = self.read_lane_block(lane, offset);
            if blk.is_some() {
                shards.push(blk);
            } else {
                shards.push(None);
                bad_total += 1;
            }
        }

        if bad_total > self.m {
            return Err(StripeError::Unrecoverable {
                stripe: idx,
                unreadable: bad_total,
                max: self.m,
            });
        }

        warn!(
            stripe = idx,
            damaged = bad_data,
            "reconstructing stripe from parity"
        );
        self.coder
            .reconstruct(&mut shards)
            .map_err(|e| match e {
                ParityError::TooManyErasures { lost, max } => StripeError::Unrecoverable {
                    stripe: idx,
                    unreadable: lost,
                    max,
                },
                other => StripeError::Parity(other),
            })?;

        let data: Vec<Vec<u8>> = shards
            .into_iter()
            .take(self.k)
            .map(|s| s.expect("reconstructed above"))
            .collect();

        // Parity lanes carry no checksum of their own; a silently damaged
        // parity lane shows up as a rebuilt data block that fails its CRC.
        if data.iter().any(|blk| !block::verify(blk)) {
            return Err(StripeError::Unrecoverable {
                stripe: idx,
                unreadable: bad_total,
                max: self.m,
            });
        }

        Ok(data)
    }

    /// Reads one 32 KiB block, returning `None` on any I/O shortfall (the
    /// caller treats it as an erasure).
    fn read_lane_block(&self, lane: usize, offset: u64) -> Option<Vec<u8>> {
        let mut file = File::open(&self.paths[lane]).ok()?;
        file.seek(SeekFrom::Start(offset)).ok()?;
        let mut buf = vec![0u8; BLOCK_SIZE];
        file.read_exact(&mut buf).ok()?;
        Some(buf)
    }
}
