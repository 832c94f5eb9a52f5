//! Storage Engine Facade
//!
//! The engine wires every component into the public key/value API:
//! `open`, `put`, `get`, `delete`, `cas`, `range`, `flush`, `close`.
//!
//! ## Write path
//!
//! ```text
//! put(key, value)
//!   ├─ seq := memtable.next_seq()
//!   ├─ WAL append (group commit; durable mode blocks until fsynced)
//!   ├─ memtable apply (newest-wins per key)
//!   ├─ block packer append ──(block full)──► stripe writer ──► lanes
//!   └─ shard over threshold? seal → L0 SSTable → manifest SstSeal
//! ```
//!
//! ## Read path
//!
//! Newest-first layering: active memtable, then L0 tables newest-first,
//! then each deeper level (non-overlapping, so at most one candidate
//! table per level). The first hit decides — a tombstone means "not
//! found". An optional last-resort source scans committed stripes
//! backwards, leaning on parity to repair damaged blocks; it is disabled
//! unless [`EngineConfig::use_stripe_for_read`] is set.
//!
//! ## Concurrency
//!
//! One logical writer, parallel readers: mutations take the engine write
//! lock, reads take the read lock (plus per-shard memtable read locks).
//! Compaction runs on its own thread against `Arc`-shared level lists and
//! only takes the level write lock for the final swap.
//!
//! ## Recovery (`open`)
//!
//! 1. Replay the manifest → live tables, committed stripes, checkpoint.
//! 2. Recover stripe lanes to the committed count (logging a `Truncate`
//!    event if damaged tail bytes were discarded).
//! 3. Replay the WAL, applying records above the checkpointed seq.
//! 4. Open SSTable readers from the live list.
//! 5. Seed the seq counter from `max(checkpoint, WAL tail) + 1`.

// ------------------------------------------------------------------------------------------------
// Sub-modules & unit tests
// ------------------------------------------------------------------------------------------------

pub mod utils;

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    fs,
    io,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, RwLock, RwLockWriteGuard,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::block::{
    self, BLOCK_PAYLOAD_MAX, BlockError, BlockPacker, HDR_SIZE, MAX_KEY_LEN, Record, key_fp64,
    mini_key,
};
use crate::compaction::{self, CompactionConfig, CompactionError, CompactorHandle};
use crate::manifest::{Manifest, ManifestError, ManifestEvent, ManifestSstEntry};
use crate::memtable::{Memtable, MemtableError};
use crate::parity::ParityKind;
use crate::sstable::{SstError, SstReader, SstWriter};
use crate::stripe::{StripeConfig, StripeError, StripeReader, StripeWriter};
use crate::wal::{Wal, WalConfig, WalError};
use utils::{
    MergeIterator, OwnedTableIter, SharedLevels, TableHandle, next_sst_nanos, sst_abs_path,
    sst_created_nanos, sst_rel_path,
};

/// Lane files live here, one directory per store.
pub const LANES_DIR: &str = "lanes";

/// WAL segments live here.
pub const WAL_DIR: &str = "wal";

/// SSTables live under `sst/L<level>/`.
pub const SSTABLE_DIR: &str = "sst";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors that can occur during engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Underlying filesystem I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Error originating from the WAL.
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    /// Error originating from the stripe log.
    #[error("stripe error: {0}")]
    Stripe(#[from] StripeError),

    /// Error originating from an SSTable.
    #[error("SSTable error: {0}")]
    Sst(#[from] SstError),

    /// Error originating from the manifest.
    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),

    /// Error originating from the memtable.
    #[error("memtable error: {0}")]
    Memtable(#[from] MemtableError),

    /// Error originating from the block codec.
    #[error("block error: {0}")]
    Block(#[from] BlockError),

    /// Error originating from compaction.
    #[error("compaction error: {0}")]
    Compaction(#[from] CompactionError),

    /// Rejected before any side effect: oversized key/value, bad config.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Internal invariant violation (poisoned lock, unexpected state).
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Configuration for an [`Engine`] instance. Passed to [`Engine::open`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Data lanes per stripe.
    pub k: usize,

    /// Parity lanes per stripe.
    pub m: usize,

    /// Parity scheme; `None` derives it from `m` (0 → none, 1 → XOR,
    /// 2 → dual-XOR, ≥3 → Reed–Solomon).
    pub parity_kind: Option<ParityKind>,

    /// Per-shard memtable sealing threshold in bytes.
    pub flush_threshold_bytes: usize,

    /// Memtable shard count (rounded up to a power of two).
    pub memtable_shards: usize,

    /// WAL group commit: flush after this many frames.
    pub wal_group_n: usize,

    /// WAL group commit: flush after this many microseconds.
    pub wal_group_micros: u64,

    /// `true` → WAL appends return on enqueue and the barrier is
    /// fdatasync-class; a crash can lose a bounded suffix.
    pub wal_fast_mode: bool,

    /// WAL segment rotation bound.
    pub wal_segment_max_bytes: u64,

    /// Stripe group commit: commit after this many stripes.
    pub stripe_group_n: u64,

    /// Stripe group commit: commit after this many microseconds.
    pub stripe_group_micros: u64,

    /// `true` → fdatasync-class barrier on lane files.
    pub stripe_fast_mode: bool,

    /// `cas` waits for WAL durability before reporting success.
    pub durable_cas: bool,

    /// Enable the stripe-fallback read source.
    pub use_stripe_for_read: bool,

    /// Bloom filter target false-positive rate.
    pub bloom_fp_rate: f64,

    /// Compaction triggers per level; the last index is the bottom level.
    pub max_per_level: Vec<usize>,

    /// Target output file size at level 1; deeper levels scale ×10 each.
    pub target_file_bytes: u64,

    /// GC window for tombstones at the bottom level.
    pub tombstone_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            k: 4,
            m: 2,
            parity_kind: None,
            flush_threshold_bytes: 4 * 1024 * 1024,
            memtable_shards: 16,
            wal_group_n: 32,
            wal_group_micros: 500,
            wal_fast_mode: false,
            wal_segment_max_bytes: 64 * 1024 * 1024,
            stripe_group_n: 8,
            stripe_group_micros: 1000,
            stripe_fast_mode: false,
            durable_cas: true,
            use_stripe_for_read: false,
            bloom_fp_rate: 0.01,
            max_per_level: vec![4, 10, 100, 1000],
            target_file_bytes: 8 * 1024 * 1024,
            tombstone_ttl: Duration::from_secs(0),
        }
    }
}

impl EngineConfig {
    fn resolved_parity_kind(&self) -> ParityKind {
        self.parity_kind.unwrap_or(ParityKind::for_m(self.m))
    }

    fn validate(&self) -> Result<(), EngineError> {
        if self.k == 0 {
            return Err(EngineError::InvalidArgument("k must be at least 1".into()));
        }
        if self.k + self.m > 255 {
            return Err(EngineError::InvalidArgument(format!(
                "k + m must not exceed 255, got {}",
                self.k + self.m
            )));
        }
        if self.max_per_level.len() < 2 {
            return Err(EngineError::InvalidArgument(
                "max_per_level needs at least two levels".into(),
            ));
        }
        let kind = self.resolved_parity_kind();
        let kind_ok = match kind {
            ParityKind::None => self.m == 0,
            ParityKind::Xor => self.m == 1,
            ParityKind::DualXor => self.m == 2,
            ParityKind::Rs => self.m >= 1,
        };
        if !kind_ok {
            return Err(EngineError::InvalidArgument(format!(
                "parity kind {kind:?} does not match m = {}",
                self.m
            )));
        }
        Ok(())
    }
}

/// Snapshot of engine statistics returned by [`Engine::stats`].
#[derive(Debug, Clone)]
pub struct EngineStats {
    /// Approximate bytes buffered in the memtable.
    pub memtable_bytes: usize,

    /// Table counts per level.
    pub tables_per_level: Vec<usize>,

    /// Stripes durable in the lane files.
    pub committed_stripes: u64,

    /// Highest issued sequence number.
    pub last_seq: u64,
}

// ------------------------------------------------------------------------------------------------
// Engine
// ------------------------------------------------------------------------------------------------

struct EngineInner {
    config: EngineConfig,
    base_dir: PathBuf,

    /// Active write buffer.
    memtable: Memtable,

    /// Durability log; every mutation lands here first.
    wal: Wal,

    /// Packs the record stream into 32 KiB blocks for the stripe log.
    packer: BlockPacker,

    /// Erasure-coded append log of packed blocks.
    stripes: StripeWriter,
}

/// The storage engine handle.
///
/// Reads (`get`, `range`, `stats`) take a shared lock and may run from
/// any number of threads; mutations serialize on the exclusive lock.
pub struct Engine {
    inner: Arc<RwLock<EngineInner>>,

    /// Live tables per level, shared with the compactor thread.
    levels: SharedLevels,

    manifest: Arc<Mutex<Manifest>>,
    compactor: Mutex<CompactorHandle>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}

impl Engine {
    /// Opens (or creates) a store rooted at `base_dir`.
    pub fn open(base_dir: impl AsRef<Path>, config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let base_dir = base_dir.as_ref().to_path_buf();

        // 0. Directory skeleton.
        fs::create_dir_all(&base_dir)?;
        for level in 0..config.max_per_level.len() {
            fs::create_dir_all(base_dir.join(format!("{SSTABLE_DIR}/L{level}")))?;
        }

        // 1. Manifest is the authority: replay it first.
        let mut manifest = Manifest::open(&base_dir)?;
        let state = manifest.state().clone();

        // 2. Recover stripe lanes to the committed count.
        let stripe_config = StripeConfig {
            k: config.k,
            m: config.m,
            kind: config.resolved_parity_kind(),
            group_n: config.stripe_group_n,
            group_micros: config.stripe_group_micros,
            fast_mode: config.stripe_fast_mode,
        };
        let (mut stripes, report) = StripeWriter::open(
            base_dir.join(LANES_DIR),
            stripe_config,
            state.committed_stripes,
        )?;
        if report.trimmed_bytes > 0 {
            manifest.append(ManifestEvent::Truncate {
                reason: format!("{} uncommitted lane bytes", report.trimmed_bytes),
                stripe: report.committed,
            })?;
        }

        // 3. Replay the WAL above the checkpoint into a fresh memtable.
        let memtable = Memtable::new(config.flush_threshold_bytes, config.memtable_shards);
        let (wal, replay) = Wal::open(
            base_dir.join(WAL_DIR),
            WalConfig {
                group_n: config.wal_group_n,
                group_micros: config.wal_group_micros,
                fast_mode: config.wal_fast_mode,
                segment_max_bytes: config.wal_segment_max_bytes,
            },
        )?;
        let mut replayed = 0usize;
        for record in replay.records {
            if record.seq > state.last_checkpoint_seq {
                memtable.apply(record)?;
                replayed += 1;
            }
        }
        memtable.set_next_seq(state.last_checkpoint_seq.max(replay.max_seq) + 1);

        // 4. Open readers for every live table.
        let mut levels: Vec<Vec<Arc<TableHandle>>> =
            vec![Vec::new(); config.max_per_level.len()];
        for entry in state.live_tables() {
            let level = entry.level as usize;
            if level >= levels.len() {
                return Err(EngineError::Internal(format!(
                    "manifest references level {level} beyond configuration"
                )));
            }
            let abs = sst_abs_path(&base_dir, &entry.file);
            if !abs.exists() {
                // A crash between deleting a compacted input and logging
                // its SstDelete leaves a stale live entry; the outputs
                // carrying the same data were sealed first.
                warn!(file = %entry.file, "live table missing on disk; dropping");
                manifest.append(ManifestEvent::SstDelete {
                    file: entry.file.clone(),
                })?;
                continue;
            }
            let reader = SstReader::open(&abs)?;
            levels[level].push(Arc::new(TableHandle {
                file: entry.file.clone(),
                level: entry.level,
                created_nanos: sst_created_nanos(&entry.file),
                reader,
            }));
        }
        for (level, tables) in levels.iter_mut().enumerate() {
            if level == 0 {
                tables.sort_by(|a, b| b.created_nanos.cmp(&a.created_nanos));
            } else {
                tables.sort_by(|a, b| a.reader.min_key().cmp(b.reader.min_key()));
            }
        }

        info!(
            base_dir = %base_dir.display(),
            replayed_wal_records = replayed,
            committed_stripes = report.committed,
            next_seq = memtable.last_seq() + 1,
            "engine opened"
        );

        // 5. Wire stripe commits into the manifest and start the compactor.
        let manifest = Arc::new(Mutex::new(manifest));
        {
            let manifest = Arc::clone(&manifest);
            stripes.set_on_commit(Box::new(move |stripe| {
                if let Ok(mut m) = manifest.lock()
                    && let Err(e) = m.append(ManifestEvent::StripeCommit { stripe })
                {
                    warn!(error = %e, "failed to record stripe commit");
                }
            }));
        }

        let levels: SharedLevels = Arc::new(RwLock::new(levels));
        let compactor = compaction::spawn(
            base_dir.clone(),
            Arc::clone(&levels),
            Arc::clone(&manifest),
            CompactionConfig {
                max_per_level: config.max_per_level.clone(),
                target_file_bytes: config.target_file_bytes,
                tombstone_ttl: config.tombstone_ttl,
                bloom_fp_rate: config.bloom_fp_rate,
            },
        );
        compactor.trigger();

        Ok(Self {
            inner: Arc::new(RwLock::new(EngineInner {
                config,
                base_dir,
                memtable,
                wal,
                packer: BlockPacker::new(),
                stripes,
            })),
            levels,
            manifest,
            compactor: Mutex::new(compactor),
            closed: AtomicBool::new(false),
        })
    }

    // --------------------------------------------------------------------------------------------
    // Mutations
    // --------------------------------------------------------------------------------------------

    /// Inserts or updates a key. Returns the assigned sequence number.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<u64, EngineError> {
        validate_record(key, value)?;
        let mut inner = self.write_inner()?;
        let durable = !inner.config.wal_fast_mode;
        self.apply_mutation(&mut inner, key, Some(value), durable)
    }

    /// Deletes a key by writing a tombstone. Returns the assigned
    /// sequence number.
    pub fn delete(&self, key: &[u8]) -> Result<u64, EngineError> {
        validate_record(key, b"")?;
        let mut inner = self.write_inner()?;
        let durable = !inner.config.wal_fast_mode;
        self.apply_mutation(&mut inner, key, None, durable)
    }

    /// Compare-and-swap on a key's latest sequence number.
    ///
    /// `expected_seq` of 0 means "expect the key to be absent (or never
    /// written)". On match the new value (or tombstone for `None`) is
    /// written at a fresh seq and `true` is returned; otherwise `false`
    /// — a mismatch is an outcome, not an error.
    pub fn cas(
        &self,
        key: &[u8],
        expected_seq: u64,
        new_value: Option<&[u8]>,
    ) -> Result<bool, EngineError> {
        validate_record(key, new_value.unwrap_or(b""))?;
        let mut inner = self.write_inner()?;

        let current_seq = self.lookup(&inner, key)?.map_or(0, |r| r.seq);
        if current_seq != expected_seq {
            trace!(current_seq, expected_seq, "cas mismatch");
            return Ok(false);
        }

        let durable = inner.config.durable_cas;
        self.apply_mutation(&mut inner, key, new_value, durable)?;
        Ok(true)
    }

    /// The shared mutation pipeline: WAL → memtable → block packer →
    /// threshold seal.
    fn apply_mutation(
        &self,
        inner: &mut RwLockWriteGuard<'_, EngineInner>,
        key: &[u8],
        value: Option<&[u8]>,
        durable: bool,
    ) -> Result<u64, EngineError> {
        let seq = inner.memtable.next_seq();
        let flags = if value.is_none() { block::FLAG_TOMBSTONE } else { 0 };
        let value = value.unwrap_or(b"");
        let fp = key_fp64(key);
        let mini = mini_key(key);

        let mut payload = Vec::with_capacity(HDR_SIZE + key.len() + value.len());
        block::encode_record_into(&mut payload, key, value, seq, flags, fp, mini);

        // 1. Durability first.
        inner.wal.append(seq, &payload, durable)?;
        if inner.wal.segment_full()? {
            inner.wal.seal_segment()?;
        }

        // 2. Visibility.
        let full_shard = inner.memtable.apply(Record {
            key: key.to_vec(),
            value: value.to_vec(),
            seq,
            flags,
        })?;

        // 3. Redundant packed stream.
        if !inner.packer.append(key, value, seq, flags, fp, mini) {
            let blk = inner.packer.seal();
            inner.stripes.append_block(blk)?;
            if !inner.packer.append(key, value, seq, flags, fp, mini) {
                return Err(EngineError::Internal(
                    "record rejected by an empty block".into(),
                ));
            }
        }

        // 4. Seal-and-swap when the shard outgrew its budget.
        if let Some(shard) = full_shard {
            let records = inner.memtable.seal_shard(shard)?;
            self.write_l0(inner, records)?;
            self.trigger_compaction();
        }

        trace!(seq, "mutation applied");
        Ok(seq)
    }

    // --------------------------------------------------------------------------------------------
    // Reads
    // --------------------------------------------------------------------------------------------

    /// Looks up the latest value for a key.
    ///
    /// Returns `None` for absent *and* deleted keys — the API does not
    /// distinguish them.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        let inner = self.read_inner()?;
        Ok(self.lookup(&inner, key)?.and_then(|record| {
            if record.is_tombstone() {
                None
            } else {
                Some(record.value)
            }
        }))
    }

    /// Latest record for a key across all sources, tombstones included.
    fn lookup(&self, inner: &EngineInner, key: &[u8]) -> Result<Option<Record>, EngineError> {
        // 1. Memtable.
        if let Some(entry) = inner.memtable.get(key)? {
            return Ok(Some(Record {
                key: key.to_vec(),
                value: entry.value,
                seq: entry.seq,
                flags: entry.flags,
            }));
        }

        // 2. SSTables, newest layer first.
        {
            let levels = self.read_levels()?;
            for (level, tables) in levels.iter().enumerate() {
                if level == 0 {
                    // L0 overlaps; newest-first order decides.
                    for table in tables {
                        if table.reader.covers(key)
                            && let Some(record) = table.reader.get(key)?
                        {
                            return Ok(Some(record));
                        }
                    }
                } else {
                    // Non-overlapping: at most one candidate table.
                    for table in tables {
                        if table.reader.covers(key) {
                            if let Some(record) = table.reader.get(key)? {
                                return Ok(Some(record));
                            }
                            break;
                        }
                    }
                }
            }
        }

        // 3. Optional last resort: the stripe log.
        if inner.config.use_stripe_for_read {
            return self.stripe_fallback_lookup(inner, key);
        }
        Ok(None)
    }

    /// Scans committed stripes newest-first for the key's latest record.
    ///
    /// Within one stripe the highest seq wins; across stripes the newest
    /// stripe containing the key wins (sequence numbers grow with stripe
    /// index).
    fn stripe_fallback_lookup(
        &self,
        inner: &EngineInner,
        key: &[u8],
    ) -> Result<Option<Record>, EngineError> {
        let committed = inner.stripes.committed_stripes();
        if committed == 0 {
            return Ok(None);
        }
        debug!(committed, "stripe fallback read");

        let reader = StripeReader::open(
            inner.base_dir.join(LANES_DIR),
            inner.config.k,
            inner.config.m,
            inner.config.resolved_parity_kind(),
            committed,
        )?;
        let fp = key_fp64(key);

        for stripe in (0..committed).rev() {
            let blocks = reader.read_stripe(stripe)?;
            let mut best: Option<Record> = None;
            for blk in &blocks {
                for view in block::unpack(blk)? {
                    let view = view?;
                    if view.header.key_fp64 != fp || view.key != key {
                        continue;
                    }
                    if best.as_ref().is_none_or(|b| view.header.seq > b.seq) {
                        best = Some(view.to_record());
                    }
                }
            }
            if best.is_some() {
                return Ok(best);
            }
        }
        Ok(None)
    }

    /// Ordered scan over `[start, end)`, newest surviving record per key,
    /// tombstones elided.
    ///
    /// Yields up to `limit` `(key, value, seq, flags)` tuples.
    pub fn range(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        limit: Option<u64>,
    ) -> Result<impl Iterator<Item = (Vec<u8>, Vec<u8>, u64, u8)> + use<>, EngineError> {
        let inner = self.read_inner()?;

        let mut sources: Vec<Box<dyn Iterator<Item = Result<Record, EngineError>> + Send>> =
            Vec::new();
        sources.push(Box::new(
            inner
                .memtable
                .range_snapshot(start, end)?
                .into_iter()
                .map(Ok),
        ));

        {
            let levels = self.read_levels()?;
            for tables in levels.iter() {
                for table in tables {
                    if !table.reader.overlaps(start, end) {
                        continue;
                    }
                    let iter = match start {
                        Some(s) => OwnedTableIter::from_key(Arc::clone(table), s),
                        None => OwnedTableIter::new(Arc::clone(table)),
                    };
                    sources.push(Box::new(iter.map(|r| r.map_err(EngineError::from))));
                }
            }
        }
        drop(inner);

        let end = end.map(<[u8]>::to_vec);
        let limit = limit.unwrap_or(u64::MAX);
        let mut out = Vec::new();
        for item in MergeIterator::new(sources) {
            let (_, record) = item?;
            if let Some(end) = &end
                && record.key.as_slice() >= end.as_slice()
            {
                break;
            }
            if record.is_tombstone() {
                continue;
            }
            out.push((record.key, record.value, record.seq, record.flags));
            if out.len() as u64 >= limit {
                break;
            }
        }
        Ok(out.into_iter())
    }

    /// Current engine statistics.
    pub fn stats(&self) -> Result<EngineStats, EngineError> {
        let inner = self.read_inner()?;
        let levels = self.read_levels()?;
        Ok(EngineStats {
            memtable_bytes: inner.memtable.approximate_bytes(),
            tables_per_level: levels.iter().map(Vec::len).collect(),
            committed_stripes: inner.stripes.committed_stripes(),
            last_seq: inner.memtable.last_seq(),
        })
    }

    // --------------------------------------------------------------------------------------------
    // Lifecycle
    // --------------------------------------------------------------------------------------------

    /// Makes everything buffered durable and records a checkpoint.
    ///
    /// Seals the memtable to L0, flushes the packer and stripe writer,
    /// rotates the WAL, appends a fsynced `Checkpoint`, prunes WAL
    /// segments the checkpoint covers, and nudges the compactor.
    pub fn flush(&self) -> Result<(), EngineError> {
        let mut inner = self.write_inner()?;
        self.flush_locked(&mut inner, "flush")
    }

    fn flush_locked(
        &self,
        inner: &mut RwLockWriteGuard<'_, EngineInner>,
        checkpoint_name: &str,
    ) -> Result<(), EngineError> {
        // 1. Memtable → L0, so the checkpoint below may prune the WAL.
        let records = inner.memtable.seal_all()?;
        self.write_l0(inner, records)?;

        // 2. Packed stream → lanes, then a stripe barrier.
        if !inner.packer.is_empty() {
            let blk = inner.packer.seal();
            inner.stripes.append_block(blk)?;
        }
        inner.stripes.flush()?;

        // 3. WAL barrier + rotation.
        inner.wal.sync()?;
        inner.wal.seal_segment()?;

        // 4. The durable boundary.
        let last_seq = inner.memtable.last_seq();
        let stripe = inner.stripes.committed_stripes();
        self.lock_manifest()?.append(ManifestEvent::Checkpoint {
            name: checkpoint_name.to_string(),
            stripe,
            last_seq,
        })?;

        // 5. Everything at or below the checkpoint is in SSTs now.
        inner.wal.prune_obsolete(last_seq)?;

        self.trigger_compaction();
        debug!(last_seq, stripe, "flush complete");
        Ok(())
    }

    /// Flushes, stops the compactor and WAL flusher, and fsyncs the
    /// store directories.
    pub fn close(&self) -> Result<(), EngineError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        {
            let mut inner = self.write_inner()?;
            self.flush_locked(&mut inner, "close")?;
        }

        if let Ok(mut compactor) = self.compactor.lock() {
            compactor.shutdown();
        }

        let inner = self.read_inner()?;
        inner.wal.shutdown()?;

        for dir in [
            inner.base_dir.join(WAL_DIR),
            inner.base_dir.join(LANES_DIR),
            inner.base_dir.join(SSTABLE_DIR),
            inner.base_dir.clone(),
        ] {
            if let Ok(handle) = fs::File::open(&dir) {
                handle.sync_all()?;
            }
        }

        info!("engine closed");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Internals
    // --------------------------------------------------------------------------------------------

    /// Writes sorted records to a fresh L0 table and registers it.
    fn write_l0(
        &self,
        inner: &mut RwLockWriteGuard<'_, EngineInner>,
        records: Vec<Record>,
    ) -> Result<(), EngineError> {
        if records.is_empty() {
            return Ok(());
        }

        let rel = sst_rel_path(0, next_sst_nanos());
        let abs = sst_abs_path(&inner.base_dir, &rel);
        let mut writer = SstWriter::create(&abs, records.len(), inner.config.bloom_fp_rate)?;
        for record in &records {
            writer.add(record)?;
        }
        let meta = writer.finish()?;

        self.lock_manifest()?.append(ManifestEvent::SstSeal {
            entry: ManifestSstEntry {
                level: 0,
                file: rel.clone(),
                entries: meta.entries,
                first_key: meta.first_key.clone(),
                last_key: meta.last_key.clone(),
            },
        })?;

        let handle = Arc::new(TableHandle {
            created_nanos: sst_created_nanos(&rel),
            level: 0,
            reader: SstReader::open(&abs)?,
            file: rel,
        });
        self.write_levels()?[0].insert(0, handle);
        Ok(())
    }

    fn trigger_compaction(&self) {
        if let Ok(compactor) = self.compactor.lock() {
            compactor.trigger();
        }
    }

    fn read_inner(&self) -> Result<std::sync::RwLockReadGuard<'_, EngineInner>, EngineError> {
        self.inner
            .read()
            .map_err(|_| EngineError::Internal("engine lock poisoned".into()))
    }

    fn write_inner(&self) -> Result<RwLockWriteGuard<'_, EngineInner>, EngineError> {
        self.inner
            .write()
            .map_err(|_| EngineError::Internal("engine lock poisoned".into()))
    }

    fn read_levels(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, utils::Levels>, EngineError> {
        self.levels
            .read()
            .map_err(|_| EngineError::Internal("levels lock poisoned".into()))
    }

    fn write_levels(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, utils::Levels>, EngineError> {
        self.levels
            .write()
            .map_err(|_| EngineError::Internal("levels lock poisoned".into()))
    }

    fn lock_manifest(&self) -> Result<std::sync::MutexGuard<'_, Manifest>, EngineError> {
        self.manifest
            .lock()
            .map_err(|_| EngineError::Internal("manifest lock poisoned".into()))
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst)
            && let Err(e) = self.close()
        {
            warn!(error = %e, "engine close failed on drop");
        }
    }
}

/// Rejects records the on-disk format cannot represent, before any side
/// effect.
fn validate_record(key: &[u8], value: &[u8]) -> Result<(), EngineError> {
    if key.len() > MAX_KEY_LEN {
        return Err(EngineError::InvalidArgument(format!(
            "key length {} exceeds {MAX_KEY_LEN}",
            key.len()
        )));
    }
    if HDR_SIZE + key.len() + value.len() > BLOCK_PAYLOAD_MAX {
        return Err(EngineError::InvalidArgument(format!(
            "record of {} bytes does not fit a block",
            HDR_SIZE + key.len() + value.len()
        )));
    }
    Ok(())
}
