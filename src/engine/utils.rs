//! Shared read-path plumbing: live-table handles, the k-way merge
//! iterator, and SSTable file naming.
//!
//! The merge iterator implements the crate's visibility rule in one
//! place: keys ascend, and for each key only the greatest-seq record
//! survives. Both the engine's `range` and the compactor's merge ride on
//! it.

use std::{
    cmp::Ordering,
    collections::BinaryHeap,
    path::{Path, PathBuf},
    sync::{
        Arc, RwLock,
        atomic::{AtomicU64, Ordering as AtomicOrdering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use crate::block::Record;
use crate::sstable::{SstError, SstReader};

// ------------------------------------------------------------------------------------------------
// Table handles & levels
// ------------------------------------------------------------------------------------------------

/// One live SSTable: its reader plus the identity the manifest tracks.
#[derive(Debug)]
pub struct TableHandle {
    /// Path relative to the store root (`sst/L0/sst_<nanos>.sst`).
    pub file: String,

    /// Level the table lives on.
    pub level: u16,

    /// Creation stamp parsed from the file name; orders L0 newest-first
    /// and ages tombstones for GC.
    pub created_nanos: u64,

    /// The open reader.
    pub reader: SstReader,
}

/// Live tables per level. Level 0 is kept newest-first; levels ≥ 1 are
/// sorted by first key and non-overlapping.
pub type Levels = Vec<Vec<Arc<TableHandle>>>;

/// The level lists shared between the engine and the compactor thread.
pub type SharedLevels = Arc<RwLock<Levels>>;

// ------------------------------------------------------------------------------------------------
// SSTable file naming
// ------------------------------------------------------------------------------------------------

static LAST_NANOS: AtomicU64 = AtomicU64::new(0);

/// A strictly monotonic nanosecond stamp for SSTable file names.
///
/// Wall-clock nanos, bumped past the previous stamp when the clock reads
/// equal (two flushes inside one tick) or backwards.
pub fn next_sst_nanos() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let mut prev = LAST_NANOS.load(AtomicOrdering::Relaxed);
    loop {
        let next = now.max(prev + 1);
        match LAST_NANOS.compare_exchange_weak(
            prev,
            next,
            AtomicOrdering::SeqCst,
            AtomicOrdering::Relaxed,
        ) {
            Ok(_) => return next,
            Err(actual) => prev = actual,
        }
    }
}

/// Store-relative path for a new table at `level`.
pub fn sst_rel_path(level: u16, nanos: u64) -> String {
    format!("sst/L{level}/sst_{nanos}.sst")
}

/// Absolute path for a store-relative table path.
pub fn sst_abs_path(base_dir: &Path, rel: &str) -> PathBuf {
    base_dir.join(rel)
}

/// Creation stamp embedded in a table path, 0 if unparseable.
pub fn sst_created_nanos(rel: &str) -> u64 {
    Path::new(rel)
        .file_stem()
        .and_then(|s| s.to_str())
        .and_then(|s| s.strip_prefix("sst_"))
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

// ------------------------------------------------------------------------------------------------
// K-way merge iterator
// ------------------------------------------------------------------------------------------------

struct HeapEntry {
    record: Record,
    src: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.record.key == other.record.key && self.record.seq == other.record.seq
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    /// BinaryHeap is a max-heap; invert key order so the heap top is the
    /// smallest key, and within a key the greatest seq.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .record
            .key
            .cmp(&self.record.key)
            .then(self.record.seq.cmp(&other.record.seq))
            .then(other.src.cmp(&self.src))
    }
}

/// Merges sorted record sources by `(key asc, seq desc)` and yields the
/// newest record per key together with its source index.
///
/// Older versions of a key are consumed and dropped. A source error is
/// yielded once and ends the iteration.
pub struct MergeIterator<E> {
    sources: Vec<Box<dyn Iterator<Item = Result<Record, E>> + Send>>,
    heap: BinaryHeap<HeapEntry>,
    primed: bool,
    failed: bool,
}

impl<E> MergeIterator<E> {
    /// Builds a merge over `sources`; each must be sorted by key with at
    /// most one record per key.
    pub fn new(sources: Vec<Box<dyn Iterator<Item = Result<Record, E>> + Send>>) -> Self {
        Self {
            sources,
            heap: BinaryHeap::new(),
            primed: false,
            failed: false,
        }
    }

    fn advance(&mut self, src: usize) -> Result<(), E> {
        if let Some(item) = self.sources[src].next() {
            let record = item?;
            self.heap.push(HeapEntry { record, src });
        }
        Ok(())
    }

    fn prime(&mut self) -> Result<(), E> {
        for src in 0..self.sources.len() {
            self.advance(src)?;
        }
        Ok(())
    }
}

impl<E> Iterator for MergeIterator<E> {
    type Item = Result<(usize, Record), E>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if !self.primed {
            self.primed = true;
            if let Err(e) = self.prime() {
                self.failed = true;
                return Some(Err(e));
            }
        }

        let winner = self.heap.pop()?;
        if let Err(e) = self.advance(winner.src) {
            self.failed = true;
            return Some(Err(e));
        }

        // Consume stale versions of the same key from other sources.
        while let Some(top) = self.heap.peek() {
            if top.record.key != winner.record.key {
                break;
            }
            let stale = self.heap.pop().expect("peeked entry exists");
            if let Err(e) = self.advance(stale.src) {
                self.failed = true;
                return Some(Err(e));
            }
        }

        Some(Ok((winner.src, winner.record)))
    }
}

// ------------------------------------------------------------------------------------------------
// Owning table iterator
// ------------------------------------------------------------------------------------------------

/// A table iterator that owns its `Arc<TableHandle>`, so the engine's
/// range path and the compactor can iterate without borrowing the level
/// lists.
///
/// One block is decoded at a time; a block that fails verification is
/// surfaced once and ends the iteration.
pub struct OwnedTableIter {
    table: Arc<TableHandle>,
    next_block: usize,
    current: std::vec::IntoIter<Record>,

    /// Skip records below this bound.
    start: Option<Vec<u8>>,

    failed: bool,
}

impl OwnedTableIter {
    /// Iterates the whole table in key order.
    pub fn new(table: Arc<TableHandle>) -> Self {
        Self {
            table,
            next_block: 0,
            current: Vec::new().into_iter(),
            start: None,
            failed: false,
        }
    }

    /// Iterates records with `key ≥ start`, seeking via the outer index.
    pub fn from_key(table: Arc<TableHandle>, start: &[u8]) -> Self {
        let first_block = if table.reader.block_count() == 0 {
            0
        } else {
            table.reader.find_block(start)
        };
        Self {
            table,
            next_block: first_block,
            current: Vec::new().into_iter(),
            start: Some(start.to_vec()),
            failed: false,
        }
    }
}

impl Iterator for OwnedTableIter {
    type Item = Result<Record, SstError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(record) = self.current.next() {
                return Some(Ok(record));
            }
            let reader = &self.table.reader;
            if self.next_block >= reader.block_count() {
                return None;
            }
            let views = match reader.block_views(self.next_block) {
                Ok(v) => v,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            };
            let mut records = Vec::new();
            for view in views {
                match view {
                    Ok(v) => {
                        if let Some(start) = &self.start
                            && v.key < start.as_slice()
                        {
                            continue;
                        }
                        records.push(v.to_record());
                    }
                    Err(e) => {
                        self.failed = true;
                        return Some(Err(e.into()));
                    }
                }
            }
            self.next_block += 1;
            self.current = records.into_iter();
        }
    }
}
