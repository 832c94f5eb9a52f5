//! Memtable Module
//!
//! The mutable, in-memory write buffer of the storage engine: a sharded
//! ordered map from key to the latest record version.
//!
//! ## Design Invariants
//!
//! - Exactly one record per key: [`should_replace`] resolves conflicts by
//!   `(seq, tombstone-wins-on-tie)` before a record lands in a shard.
//! - The `next_seq` counter is the sole source of sequence numbers and is
//!   strictly monotonic for the engine's lifetime.
//! - Shard selection hashes the key, so a single shard's map is *not*
//!   globally contiguous; range reads merge all shards.
//!
//! ## Seal-and-swap
//!
//! When a shard's byte counter crosses the configured threshold (or the
//! engine flushes explicitly), the shard's map is swapped for a fresh
//! empty one and the sealed map is handed to the flush pipeline sorted by
//! key. The sealed data stays readable nowhere — the engine must write it
//! to an L0 SSTable and register it in the manifest before discarding it;
//! until then the WAL still covers every record.
//!
//! ## Concurrency
//!
//! Readers take per-shard read locks and never block each other. The
//! engine serializes writers (single-writer design); the per-shard write
//! locks make the memtable safe even if a host embeds it differently.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    collections::BTreeMap,
    ops::Bound,
    sync::{
        RwLock,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use thiserror::Error;
use tracing::{debug, trace};

use crate::block::{FLAG_TOMBSTONE, Record, key_fp64};

/// Default shard count; must be a power of two.
pub const DEFAULT_SHARDS: usize = 16;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by memtable operations.
#[derive(Debug, Error)]
pub enum MemtableError {
    /// Internal invariant violation or poisoned lock.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Entries
// ------------------------------------------------------------------------------------------------

/// The per-key payload a shard stores: everything but the key itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    /// Value bytes; empty for tombstones.
    pub value: Vec<u8>,

    /// Sequence number of this version.
    pub seq: u64,

    /// Record flags; bit 0 is the tombstone marker.
    pub flags: u8,
}

impl StoredEntry {
    /// Whether this entry is a deletion marker.
    pub fn is_tombstone(&self) -> bool {
        self.flags & FLAG_TOMBSTONE != 0
    }
}

/// Conflict resolution between an existing entry and a candidate.
///
/// The candidate wins on a strictly greater seq; on an equal seq it wins
/// exactly when it is a tombstone and the incumbent is not.
pub fn should_replace(old: &StoredEntry, new: &StoredEntry) -> bool {
    if new.seq > old.seq {
        return true;
    }
    new.seq == old.seq && new.is_tombstone() && !old.is_tombstone()
}

// ------------------------------------------------------------------------------------------------
// Shards
// ------------------------------------------------------------------------------------------------

struct Shard {
    map: RwLock<BTreeMap<Vec<u8>, StoredEntry>>,

    /// Approximate bytes held by this shard's map.
    bytes: AtomicUsize,
}

impl Shard {
    fn new() -> Self {
        Self {
            map: RwLock::new(BTreeMap::new()),
            bytes: AtomicUsize::new(0),
        }
    }
}

fn entry_size(key: &[u8], entry: &StoredEntry) -> usize {
    key.len() + entry.value.len() + std::mem::size_of::<StoredEntry>()
}

// ------------------------------------------------------------------------------------------------
// Memtable
// ------------------------------------------------------------------------------------------------

/// Sharded in-memory write buffer.
pub struct Memtable {
    shards: Vec<Shard>,

    /// Next unissued sequence number (so `last_seq = next_seq - 1`).
    next_seq: AtomicU64,

    /// Per-shard sealing threshold in bytes.
    flush_threshold: usize,
}

impl std::fmt::Debug for Memtable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memtable")
            .field("shards", &self.shards.len())
            .field("next_seq", &self.next_seq.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Memtable {
    /// Creates an empty memtable.
    ///
    /// `shard_count` is rounded up to a power of two so shard selection
    /// can mask the key fingerprint.
    pub fn new(flush_threshold: usize, shard_count: usize) -> Self {
        let shards = shard_count.max(1).next_power_of_two();
        debug!(shards, flush_threshold, "memtable created");
        Self {
            shards: (0..shards).map(|_| Shard::new()).collect(),
            next_seq: AtomicU64::new(1),
            flush_threshold,
        }
    }

    /// Number of shards.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Issues the next sequence number.
    pub fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Highest sequence number issued so far (0 before the first write).
    pub fn last_seq(&self) -> u64 {
        self.next_seq.load(Ordering::SeqCst) - 1
    }

    /// Overrides the counter with a recovered value.
    ///
    /// Must only be called during recovery, before any writes.
    pub fn set_next_seq(&self, next: u64) {
        self.next_seq.store(next.max(1), Ordering::SeqCst);
    }

    fn shard_for(&self, key: &[u8]) -> &Shard {
        let idx = (key_fp64(key) as usize) & (self.shards.len() - 1);
        &self.shards[idx]
    }

    /// Applies a record to its shard under [`should_replace`].
    ///
    /// Returns the index of the record's shard when that shard has
    /// crossed the sealing threshold, so the engine can seal it.
    pub fn apply(&self, record: Record) -> Result<Option<usize>, MemtableError> {
        let idx = (key_fp64(&record.key) as usize) & (self.shards.len() - 1);
        let shard = &self.shards[idx];

        let entry = StoredEntry {
            value: record.value,
            seq: record.seq,
            flags: record.flags,
        };
        let new_size = entry_size(&record.key, &entry);

        let mut map = shard
            .map
            .write()
            .map_err(|_| MemtableError::Internal("shard lock poisoned".into()))?;

        match map.get_mut(&record.key) {
            Some(existing) => {
                if should_replace(existing, &entry) {
                    let old_size = entry_size(&record.key, existing);
                    *existing = entry;
                    if new_size >= old_size {
                        shard.bytes.fetch_add(new_size - old_size, Ordering::Relaxed);
                    } else {
                        shard.bytes.fetch_sub(old_size - new_size, Ordering::Relaxed);
                    }
                } else {
                    trace!(seq = entry.seq, "stale record ignored by memtable");
                    return Ok(None);
                }
            }
            None => {
                map.insert(record.key, entry);
                shard.bytes.fetch_add(new_size, Ordering::Relaxed);
            }
        }
        drop(map);

        if shard.bytes.load(Ordering::Relaxed) >= self.flush_threshold {
            Ok(Some(idx))
        } else {
            Ok(None)
        }
    }

    /// Latest version for `key`, tombstones included.
    pub fn get(&self, key: &[u8]) -> Result<Option<StoredEntry>, MemtableError> {
        let map = self
            .shard_for(key)
            .map
            .read()
            .map_err(|_| MemtableError::Internal("shard lock poisoned".into()))?;
        Ok(map.get(key).cloned())
    }

    /// Sorted snapshot of all records in `[start, end)` across every
    /// shard, tombstones included.
    ///
    /// `None` bounds are unbounded on that side.
    pub fn range_snapshot(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<Vec<Record>, MemtableError> {
        let lower = start.map_or(Bound::Unbounded, |s| Bound::Included(s.to_vec()));
        let upper = end.map_or(Bound::Unbounded, |e| Bound::Excluded(e.to_vec()));

        let mut records = Vec::new();
        for shard in &self.shards {
            let map = shard
                .map
                .read()
                .map_err(|_| MemtableError::Internal("shard lock poisoned".into()))?;
            for (key, entry) in map.range((lower.clone(), upper.clone())) {
                records.push(Record {
                    key: key.clone(),
                    value: entry.value.clone(),
                    seq: entry.seq,
                    flags: entry.flags,
                });
            }
        }
        records.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(records)
    }

    /// Seals one shard: swaps in an empty map and returns the sealed
    /// records sorted by key. Empty result means nothing to flush.
    pub fn seal_shard(&self, idx: usize) -> Result<Vec<Record>, MemtableError> {
        let shard = &self.shards[idx];
        let mut map = shard
            .map
            .write()
            .map_err(|_| MemtableError::Internal("shard lock poisoned".into()))?;
        let sealed = std::mem::take(&mut *map);
        shard.bytes.store(0, Ordering::Relaxed);
        drop(map);

        debug!(shard = idx, records = sealed.len(), "memtable shard sealed");
        Ok(sealed
            .into_iter()
            .map(|(key, entry)| Record {
                key,
                value: entry.value,
                seq: entry.seq,
                flags: entry.flags,
            })
            .collect())
    }

    /// Seals every shard and returns one globally sorted record stream.
    pub fn seal_all(&self) -> Result<Vec<Record>, MemtableError> {
        let mut records = Vec::new();
        for idx in 0..self.shards.len() {
            records.extend(self.seal_shard(idx)?);
        }
        records.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(records)
    }

    /// Approximate total bytes buffered across shards.
    pub fn approximate_bytes(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.bytes.load(Ordering::Relaxed))
            .sum()
    }

    /// True when no shard holds any record.
    pub fn is_empty(&self) -> bool {
        self.shards
            .iter()
            .all(|s| s.map.read().map(|m| m.is_empty()).unwrap_or(false))
    }
}
