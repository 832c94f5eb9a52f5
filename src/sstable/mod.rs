//! Sorted String Table (SSTable) Module
//!
//! Immutable, disk-backed sorted tables produced by memtable flushes and
//! compactions. Each table stores globally key-sorted records in fixed
//! 32 KiB blocks, with a fixed-width outer index, a bloom filter for fast
//! negative point lookups, and a checksummed footer.
//!
//! # On-disk layout (`AKSS`, version 1)
//!
//! ```text
//! [data block 0: 32 KiB]          block codec framing (see block module)
//! [data block 1: 32 KiB]
//! ...
//! [outer index]                   40-byte entries: [firstKey32][blockOffset u64]
//! [bloom filter]                  raw bit array, 7 double-hashed probes
//! [footer: 32 bytes]              [magic u32 'AKSS'][version u8 1][pad 3]
//!                                 [indexOff u64][bloomOff u64][entries u32]
//!                                 [crc32c u32]
//! ```
//!
//! `firstKey32` is the first 32 bytes of a block's first key, right
//! zero-padded. The footer CRC32C covers `[0 .. fileSize − 4)` — data,
//! index, bloom, and the footer's own leading 28 bytes.
//!
//! # Concurrency
//!
//! Tables are immutable; the reader memory-maps the file and serves any
//! number of threads without locking.
//!
//! # Guarantees
//!
//! - Records are strictly sorted by key with at most one version per key.
//! - Magic, version, and the full-file checksum are validated on open;
//!   a table that fails validation never serves a read.
//! - Files are created complete: the builder syncs the file and its
//!   parent directory before the table is registered in the manifest.

// ------------------------------------------------------------------------------------------------
// Sub-modules
// ------------------------------------------------------------------------------------------------

pub mod bloom;
pub mod builder;
pub mod iterator;

#[cfg(test)]
mod tests;

pub use bloom::BloomFilter;
pub use builder::{SstMeta, SstWriter};
pub use iterator::SstIter;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{fs::File, io, path::Path};

use memmap2::Mmap;
use thiserror::Error;
use tracing::{debug, trace};

use crate::block::{self, BLOCK_SIZE, BlockError, Record, key_fp64};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Footer magic: `"AKSS"` read as a little-endian u32.
pub const SST_MAGIC: u32 = 0x5353_4B41;

/// Current format version.
pub const SST_VERSION: u8 = 1;

/// Footer size in bytes.
pub const SST_FOOTER_SIZE: usize = 32;

/// Outer index entry size: 32-byte key prefix + u64 block offset.
pub const SST_INDEX_ENTRY_SIZE: usize = 40;

/// Width of the zero-padded key prefix stored per index entry.
pub const SST_KEY_PREFIX_LEN: usize = 32;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by SSTable operations.
#[derive(Debug, Error)]
pub enum SstError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A data block failed validation.
    #[error("block error: {0}")]
    Block(#[from] BlockError),

    /// Footer magic or version is not recognised. Fatal on open.
    #[error("unsupported SSTable format (magic 0x{magic:08X}, version {version})")]
    FormatUnsupported {
        /// Magic value found in the footer.
        magic: u32,
        /// Version byte found in the footer.
        version: u8,
    },

    /// Structural damage outside a data block (footer CRC, offsets, size).
    #[error("corrupted SSTable: {0}")]
    Corrupted(String),

    /// Records handed to the builder were not strictly ascending.
    #[error("unsorted input to SSTable builder: {0}")]
    UnsortedInput(String),
}

// ------------------------------------------------------------------------------------------------
// Footer
// ------------------------------------------------------------------------------------------------

/// Parsed `AKSS` footer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Footer {
    pub(crate) index_off: u64,
    pub(crate) bloom_off: u64,
    pub(crate) entries: u32,
}

impl Footer {
    /// Serializes the footer; `crc` is the full-file checksum computed by
    /// the builder over everything before this field.
    pub(crate) fn encode(&self, crc: u32) -> [u8; SST_FOOTER_SIZE] {
        let mut out = [0u8; SST_FOOTER_SIZE];
        out[0..4].copy_from_slice(&SST_MAGIC.to_le_bytes());
        out[4] = SST_VERSION;
        // bytes 5..8 stay zero (pad)
        out[8..16].copy_from_slice(&self.index_off.to_le_bytes());
        out[16..24].copy_from_slice(&self.bloom_off.to_le_bytes());
        out[24..28].copy_from_slice(&self.entries.to_le_bytes());
        out[28..32].copy_from_slice(&crc.to_le_bytes());
        out
    }

    /// Parses and validates magic and version; the CRC is checked by the
    /// caller against the whole file.
    pub(crate) fn decode(buf: &[u8]) -> Result<(Self, u32), SstError> {
        if buf.len() != SST_FOOTER_SIZE {
            return Err(SstError::Corrupted("short footer".into()));
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().expect("slice is 4 bytes"));
        let version = buf[4];
        if magic != SST_MAGIC || version != SST_VERSION {
            return Err(SstError::FormatUnsupported { magic, version });
        }
        let index_off = u64::from_le_bytes(buf[8..16].try_into().expect("slice is 8 bytes"));
        let bloom_off = u64::from_le_bytes(buf[16..24].try_into().expect("slice is 8 bytes"));
        let entries = u32::from_le_bytes(buf[24..28].try_into().expect("slice is 4 bytes"));
        let crc = u32::from_le_bytes(buf[28..32].try_into().expect("slice is 4 bytes"));
        Ok((
            Self {
                index_off,
                bloom_off,
                entries,
            },
            crc,
        ))
    }
}

/// First [`SST_KEY_PREFIX_LEN`] key bytes, right zero-padded.
pub(crate) fn key_prefix32(key: &[u8]) -> [u8; SST_KEY_PREFIX_LEN] {
    let mut out = [0u8; SST_KEY_PREFIX_LEN];
    let n = key.len().min(SST_KEY_PREFIX_LEN);
    out[..n].copy_from_slice(&key[..n]);
    out
}

// ------------------------------------------------------------------------------------------------
// Reader
// ------------------------------------------------------------------------------------------------

/// A fully memory-mapped, immutable sorted table.
pub struct SstReader {
    mmap: Mmap,
    footer: Footer,
    bloom: BloomFilter,
    num_blocks: usize,
    min_key: Vec<u8>,
    max_key: Vec<u8>,
}

impl std::fmt::Debug for SstReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SstReader")
            .field("entries", &self.footer.entries)
            .field("blocks", &self.num_blocks)
            .finish_non_exhaustive()
    }
}

impl SstReader {
    /// Opens a table: mmap, footer magic/version, full-file CRC, index
    /// geometry, bloom view, and the min/max key from the edge blocks.
    ///
    /// The mmap is read-only and the file is immutable once built, so the
    /// `unsafe` map cannot observe concurrent mutation.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SstError> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };

        let len = mmap.len();
        if len < SST_FOOTER_SIZE {
            return Err(SstError::Corrupted("file smaller than footer".into()));
        }

        let (footer, stored_crc) = Footer::decode(&mmap[len - SST_FOOTER_SIZE..])?;
        let computed = crc32c::crc32c(&mmap[..len - 4]);
        if computed != stored_crc {
            return Err(SstError::Corrupted("file checksum mismatch".into()));
        }

        let index_off = footer.index_off as usize;
        let bloom_off = footer.bloom_off as usize;
        if index_off > bloom_off
            || bloom_off > len - SST_FOOTER_SIZE
            || index_off % BLOCK_SIZE != 0
            || (bloom_off - index_off) % SST_INDEX_ENTRY_SIZE != 0
        {
            return Err(SstError::Corrupted("inconsistent section offsets".into()));
        }

        let num_blocks = index_off / BLOCK_SIZE;
        let index_entries = (bloom_off - index_off) / SST_INDEX_ENTRY_SIZE;
        if index_entries != num_blocks {
            return Err(SstError::Corrupted(
                "index entry count does not match block count".into(),
            ));
        }

        let bloom = BloomFilter::from_bytes(mmap[bloom_off..len - SST_FOOTER_SIZE].to_vec());

        // Min/max key come from the first and last data block.
        let (min_key, max_key) = if num_blocks == 0 {
            (Vec::new(), Vec::new())
        } else {
            let first = block::unpack(&mmap[0..BLOCK_SIZE])?
                .next()
                .transpose()?
                .ok_or_else(|| SstError::Corrupted("first block has no records".into()))?;
            let min_key = first.key.to_vec();

            let last_off = (num_blocks - 1) * BLOCK_SIZE;
            let mut max_key = Vec::new();
            for view in block::unpack(&mmap[last_off..last_off + BLOCK_SIZE])? {
                max_key = view?.key.to_vec();
            }
            (min_key, max_key)
        };

        debug!(
            path = %path.display(),
            entries = footer.entries,
            blocks = num_blocks,
            "SSTable opened"
        );

        Ok(Self {
            mmap,
            footer,
            bloom,
            num_blocks,
            min_key,
            max_key,
        })
    }

    /// Number of records in the table.
    pub fn entries(&self) -> u64 {
        u64::from(self.footer.entries)
    }

    /// Smallest key in the table (empty for an empty table).
    pub fn min_key(&self) -> &[u8] {
        &self.min_key
    }

    /// Largest key in the table.
    pub fn max_key(&self) -> &[u8] {
        &self.max_key
    }

    /// On-disk size in bytes.
    pub fn file_size(&self) -> u64 {
        self.mmap.len() as u64
    }

    /// Whether `key` falls inside this table's key range.
    pub fn covers(&self, key: &[u8]) -> bool {
        self.footer.entries > 0 && key >= self.min_key.as_slice() && key <= self.max_key.as_slice()
    }

    /// Whether this table's key range intersects `[start, end)`.
    ///
    /// `None` bounds are unbounded on that side.
    pub fn overlaps(&self, start: Option<&[u8]>, end: Option<&[u8]>) -> bool {
        if self.footer.entries == 0 {
            return false;
        }
        let above_start = start.is_none_or(|s| self.max_key.as_slice() >= s);
        let below_end = end.is_none_or(|e| self.min_key.as_slice() < e);
        above_start && below_end
    }

    /// Point lookup: bloom, outer index, then one block scan.
    ///
    /// Returns the record with the highest seq for `key` (tombstones
    /// included — interpretation is the engine's job).
    pub fn get(&self, key: &[u8]) -> Result<Option<Record>, SstError> {
        if !self.covers(key) {
            return Ok(None);
        }
        if !self.bloom.may_contain(key) {
            trace!("bloom negative");
            return Ok(None);
        }

        let block_idx = self.find_block(key);
        let records = self.block_views(block_idx)?;

        let fp = key_fp64(key);
        let mut best: Option<Record> = None;
        for view in records {
            let view = view?;
            // Fingerprint prefilter: skip without touching key bytes.
            if view.header.key_fp64 != fp {
                continue;
            }
            if view.key != key {
                continue;
            }
            if best.as_ref().is_none_or(|b| view.header.seq > b.seq) {
                best = Some(view.to_record());
            }
        }
        Ok(best)
    }

    /// Iterates every record in key order.
    pub fn iter(&self) -> SstIter<'_> {
        SstIter::new(self, 0, None)
    }

    /// Iterates records with `key ≥ start` in key order.
    pub fn iter_from(&self, start: &[u8]) -> SstIter<'_> {
        let block = if self.num_blocks == 0 {
            0
        } else {
            self.find_block(start)
        };
        SstIter::new(self, block, Some(start.to_vec()))
    }

    // --------------------------------------------------------------------------------------------
    // Internals
    // --------------------------------------------------------------------------------------------

    /// Index of the last block whose `firstKey32 ≤ key[0..32]`.
    pub(crate) fn find_block(&self, key: &[u8]) -> usize {
        let target = key_prefix32(key);
        let index = &self.mmap[self.footer.index_off as usize..self.footer.bloom_off as usize];

        let mut lo = 0usize;
        let mut hi = self.num_blocks;
        while lo < hi {
            let mid = (lo + hi) / 2;
            let entry = &index[mid * SST_INDEX_ENTRY_SIZE..][..SST_KEY_PREFIX_LEN];
            if entry <= target.as_slice() {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo.saturating_sub(1)
    }

    /// Offset of block `idx`, read from its index entry.
    pub(crate) fn block_offset(&self, idx: usize) -> u64 {
        let base = self.footer.index_off as usize + idx * SST_INDEX_ENTRY_SIZE;
        u64::from_le_bytes(
            self.mmap[base + SST_KEY_PREFIX_LEN..base + SST_INDEX_ENTRY_SIZE]
                .try_into()
                .expect("slice is 8 bytes"),
        )
    }

    pub(crate) fn block_count(&self) -> usize {
        self.num_blocks
    }

    /// Verified record views of block `idx`.
    pub(crate) fn block_views(&self, idx: usize) -> Result<block::BlockRecords<'_>, SstError> {
        let off = self.block_offset(idx) as usize;
        if off + BLOCK_SIZE > self.footer.index_off as usize {
            return Err(SstError::Corrupted("block offset out of range".into()));
        }
        Ok(block::unpack(&self.mmap[off..off + BLOCK_SIZE])?)
    }
}
