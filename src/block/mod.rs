//! Record Header & 32 KiB Block Codec
//!
//! This module owns the byte-level primitives every other component builds
//! on: the fixed 32-byte record header (`AKHdr32`), the SipHash-2-4 key
//! fingerprint, the little-endian miniKey prefix, and the packer/unpacker
//! for the fixed 32 KiB block frame shared by the stripe log and SSTables.
//!
//! # Record encoding
//!
//! Every record is serialized as `AKHdr32 ∥ key ∥ value`:
//!
//! ```text
//! offset  size  field
//!      0     2  kLen      key length (0..65535)
//!      2     4  vLen      value length (u32)
//!      6     8  seq       record sequence number
//!     14     1  flags     bit 0 = tombstone
//!     15     1  pad0      must be 0
//!     16     8  keyFP64   SipHash-2-4(key, fixed seed)
//!     24     8  miniKey   first ≤8 key bytes, LE, zero-padded
//! ```
//!
//! The fixed header size gives O(1) in-block skipping; the fingerprint
//! answers negative lookups without touching key bytes; the miniKey is a
//! cheap first-8-bytes comparison hint.
//!
//! # Block framing
//!
//! ```text
//! [payloadLen u32][payload ≤ 32760 bytes][zero padding][crc32c u32]
//! ```
//!
//! Total is exactly 32768 bytes. The trailing CRC32C (Castagnoli) covers
//! bytes `[0 .. 32764)` — length field, payload, and padding. A block that
//! fails any structural or checksum test is rejected whole; corruption is
//! fatal for the block, never for the process.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::hash::Hasher;

use siphasher::sip::SipHasher24;
use thiserror::Error;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Fixed on-disk block size.
pub const BLOCK_SIZE: usize = 32 * 1024;

/// Maximum payload bytes a block can carry (block minus length field and CRC).
pub const BLOCK_PAYLOAD_MAX: usize = BLOCK_SIZE - 8;

/// Offset of the trailing CRC32C; the checksum covers `[0 .. BLOCK_CRC_OFFSET)`.
pub const BLOCK_CRC_OFFSET: usize = BLOCK_SIZE - 4;

/// Size of the fixed record header.
pub const HDR_SIZE: usize = 32;

/// Maximum key length representable in the header.
pub const MAX_KEY_LEN: usize = u16::MAX as usize;

/// Flags bit 0: the record is a deletion marker.
pub const FLAG_TOMBSTONE: u8 = 0b0000_0001;

/// Configuration-fixed SipHash-2-4 seed for [`key_fp64`].
///
/// Baked into the on-disk format — changing it invalidates every stored
/// fingerprint.
const FP_SEED: (u64, u64) = (0x416B_6B61_7261_4442, 0x6C61_6E65_5F66_7036);

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by record and block codec operations.
#[derive(Debug, Error)]
pub enum BlockError {
    /// Structural or checksum failure on a 32 KiB block.
    #[error("corrupted block: {0}")]
    Corrupted(&'static str),

    /// A record does not fit the block payload budget.
    #[error("record too large for block: {0} bytes")]
    RecordTooLarge(usize),
}

// ------------------------------------------------------------------------------------------------
// Key fingerprint & miniKey
// ------------------------------------------------------------------------------------------------

/// 64-bit SipHash-2-4 fingerprint of `key` under the format's fixed seed.
pub fn key_fp64(key: &[u8]) -> u64 {
    let mut hasher = SipHasher24::new_with_keys(FP_SEED.0, FP_SEED.1);
    hasher.write(key);
    hasher.finish()
}

/// First up-to-8 key bytes packed little-endian, zero-padded.
pub fn mini_key(key: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    let n = key.len().min(8);
    bytes[..n].copy_from_slice(&key[..n]);
    u64::from_le_bytes(bytes)
}

// ------------------------------------------------------------------------------------------------
// AKHdr32
// ------------------------------------------------------------------------------------------------

/// The fixed 32-byte header preceding every record payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AkHdr32 {
    /// Key length (0..65535).
    pub k_len: u16,

    /// Value length.
    pub v_len: u32,

    /// Record sequence number.
    pub seq: u64,

    /// Record flags; bit 0 is the tombstone marker.
    pub flags: u8,

    /// SipHash-2-4 fingerprint of the key.
    pub key_fp64: u64,

    /// First ≤8 key bytes, little-endian packed, zero-padded.
    pub mini_key: u64,
}

impl AkHdr32 {
    /// Whether this record is a deletion marker.
    pub fn is_tombstone(&self) -> bool {
        self.flags & FLAG_TOMBSTONE != 0
    }

    /// Serialize into exactly [`HDR_SIZE`] bytes at the start of `out`.
    ///
    /// # Panics
    /// Debug-asserts that `out` holds at least 32 bytes; callers size
    /// their buffers before encoding.
    pub fn write_to(&self, out: &mut [u8]) {
        debug_assert!(out.len() >= HDR_SIZE);
        out[0..2].copy_from_slice(&self.k_len.to_le_bytes());
        out[2..6].copy_from_slice(&self.v_len.to_le_bytes());
        out[6..14].copy_from_slice(&self.seq.to_le_bytes());
        out[14] = self.flags;
        out[15] = 0;
        out[16..24].copy_from_slice(&self.key_fp64.to_le_bytes());
        out[24..32].copy_from_slice(&self.mini_key.to_le_bytes());
    }

    /// Parse a header from the start of `buf`.
    pub fn read_from(buf: &[u8]) -> Result<Self, BlockError> {
        if buf.len() < HDR_SIZE {
            return Err(BlockError::Corrupted("short record header"));
        }
        if buf[15] != 0 {
            return Err(BlockError::Corrupted("nonzero pad byte in record header"));
        }
        Ok(Self {
            k_len: u16::from_le_bytes([buf[0], buf[1]]),
            v_len: u32::from_le_bytes([buf[2], buf[3], buf[4], buf[5]]),
            seq: u64::from_le_bytes(buf[6..14].try_into().expect("slice is 8 bytes")),
            flags: buf[14],
            key_fp64: u64::from_le_bytes(buf[16..24].try_into().expect("slice is 8 bytes")),
            mini_key: u64::from_le_bytes(buf[24..32].try_into().expect("slice is 8 bytes")),
        })
    }
}

// ------------------------------------------------------------------------------------------------
// Records
// ------------------------------------------------------------------------------------------------

/// An owned record: the unit of storage across memtable, WAL, blocks, and
/// SSTables.
///
/// Two records are equal iff `(seq, key)` match — the value does not
/// participate in identity.
#[derive(Debug, Clone)]
pub struct Record {
    /// Opaque key bytes, compared as unsigned lexicographic.
    pub key: Vec<u8>,

    /// Opaque value bytes; empty for tombstones.
    pub value: Vec<u8>,

    /// Engine-assigned sequence number.
    pub seq: u64,

    /// Record flags; bit 0 is the tombstone marker.
    pub flags: u8,
}

impl Record {
    /// Builds a live record.
    pub fn put(key: Vec<u8>, value: Vec<u8>, seq: u64) -> Self {
        Self {
            key,
            value,
            seq,
            flags: 0,
        }
    }

    /// Builds a deletion marker.
    pub fn tombstone(key: Vec<u8>, seq: u64) -> Self {
        Self {
            key,
            value: Vec::new(),
            seq,
            flags: FLAG_TOMBSTONE,
        }
    }

    /// Whether this record is a deletion marker.
    pub fn is_tombstone(&self) -> bool {
        self.flags & FLAG_TOMBSTONE != 0
    }

    /// Serialized size: `AKHdr32 ∥ key ∥ value`.
    pub fn encoded_len(&self) -> usize {
        HDR_SIZE + self.key.len() + self.value.len()
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq && self.key == other.key
    }
}

impl Eq for Record {}

/// A zero-copy view of one record inside a verified block.
#[derive(Debug, Clone, Copy)]
pub struct RecordView<'a> {
    /// Parsed fixed header.
    pub header: AkHdr32,

    /// Key bytes, borrowed from the block.
    pub key: &'a [u8],

    /// Value bytes, borrowed from the block.
    pub value: &'a [u8],
}

impl<'a> RecordView<'a> {
    /// Whether this record is a deletion marker.
    pub fn is_tombstone(&self) -> bool {
        self.header.is_tombstone()
    }

    /// Copies the view into an owned [`Record`].
    pub fn to_record(&self) -> Record {
        Record {
            key: self.key.to_vec(),
            value: self.value.to_vec(),
            seq: self.header.seq,
            flags: self.header.flags,
        }
    }
}

/// Appends `AKHdr32 ∥ key ∥ value` to `buf`.
///
/// `fp` and `mini` are passed in so writers that already computed them
/// (the engine computes both once per mutation) do not hash twice.
pub fn encode_record_into(
    buf: &mut Vec<u8>,
    key: &[u8],
    value: &[u8],
    seq: u64,
    flags: u8,
    fp: u64,
    mini: u64,
) {
    debug_assert!(key.len() <= MAX_KEY_LEN);
    let hdr = AkHdr32 {
        k_len: key.len() as u16,
        v_len: value.len() as u32,
        seq,
        flags,
        key_fp64: fp,
        mini_key: mini,
    };
    let start = buf.len();
    buf.resize(start + HDR_SIZE, 0);
    hdr.write_to(&mut buf[start..]);
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);
}

/// Parses one `AKHdr32 ∥ key ∥ value` record from the start of `buf`.
///
/// Returns the owned record and the number of bytes consumed.
pub fn decode_record(buf: &[u8]) -> Result<(Record, usize), BlockError> {
    let hdr = AkHdr32::read_from(buf)?;
    let total = HDR_SIZE + hdr.k_len as usize + hdr.v_len as usize;
    if buf.len() < total {
        return Err(BlockError::Corrupted("record truncated"));
    }
    let key = buf[HDR_SIZE..HDR_SIZE + hdr.k_len as usize].to_vec();
    let value = buf[HDR_SIZE + hdr.k_len as usize..total].to_vec();
    Ok((
        Record {
            key,
            value,
            seq: hdr.seq,
            flags: hdr.flags,
        },
        total,
    ))
}

// ------------------------------------------------------------------------------------------------
// Block packer
// ------------------------------------------------------------------------------------------------

/// Packs records into fixed 32 KiB block frames.
///
/// The packer owns its scratch buffer until [`BlockPacker::seal`], at
/// which point ownership of the finished block transfers to the caller
/// (in the write path, the stripe writer) and the packer starts fresh.
#[derive(Debug)]
pub struct BlockPacker {
    buf: Vec<u8>,

    /// Write cursor inside the payload region; starts just past the
    /// length field.
    cursor: usize,

    records: usize,
}

impl BlockPacker {
    /// Creates an empty packer.
    pub fn new() -> Self {
        Self {
            buf: vec![0u8; BLOCK_SIZE],
            cursor: 4,
            records: 0,
        }
    }

    /// Discards any buffered records and starts a new block.
    pub fn begin(&mut self) {
        self.buf.iter_mut().for_each(|b| *b = 0);
        self.cursor = 4;
        self.records = 0;
    }

    /// True when no record has been appended since the last seal/begin.
    pub fn is_empty(&self) -> bool {
        self.records == 0
    }

    /// Current payload length in bytes.
    pub fn payload_len(&self) -> usize {
        self.cursor - 4
    }

    /// Number of records buffered in the current block.
    pub fn record_count(&self) -> usize {
        self.records
    }

    /// Appends one record; returns `false` iff `32 + kLen + vLen` does not
    /// fit in the remaining payload space (the caller then seals and
    /// retries on a fresh block).
    pub fn append(&mut self, key: &[u8], value: &[u8], seq: u64, flags: u8, fp: u64, mini: u64) -> bool {
        let need = HDR_SIZE + key.len() + value.len();
        if self.cursor + need > 4 + BLOCK_PAYLOAD_MAX {
            return false;
        }
        let hdr = AkHdr32 {
            k_len: key.len() as u16,
            v_len: value.len() as u32,
            seq,
            flags,
            key_fp64: fp,
            mini_key: mini,
        };
        hdr.write_to(&mut self.buf[self.cursor..]);
        self.buf[self.cursor + HDR_SIZE..self.cursor + HDR_SIZE + key.len()].copy_from_slice(key);
        self.buf
            [self.cursor + HDR_SIZE + key.len()..self.cursor + need]
            .copy_from_slice(value);
        self.cursor += need;
        self.records += 1;
        true
    }

    /// Stamps the length field and CRC, returning the finished 32 KiB
    /// block. The packer is reset for the next block.
    pub fn seal(&mut self) -> Vec<u8> {
        let payload_len = (self.cursor - 4) as u32;
        self.buf[0..4].copy_from_slice(&payload_len.to_le_bytes());
        // cursor..BLOCK_CRC_OFFSET is already zero (fresh buffers start
        // zeroed and begin() re-zeroes).
        let crc = crc32c::crc32c(&self.buf[..BLOCK_CRC_OFFSET]);
        self.buf[BLOCK_CRC_OFFSET..].copy_from_slice(&crc.to_le_bytes());

        let sealed = std::mem::replace(&mut self.buf, vec![0u8; BLOCK_SIZE]);
        self.cursor = 4;
        self.records = 0;
        sealed
    }
}

impl Default for BlockPacker {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds a sealed block containing zero records.
///
/// Used to pad a partial stripe on flush: the block is structurally valid
/// (`payloadLen = 0`, correct CRC) and unpacks to an empty record set.
pub fn empty_block() -> Vec<u8> {
    BlockPacker::new().seal()
}

// ------------------------------------------------------------------------------------------------
// Block unpacker
// ------------------------------------------------------------------------------------------------

/// Cheap integrity probe: capacity, length field, and CRC only.
///
/// The stripe reader uses this to classify lanes before deciding whether
/// parity reconstruction is needed.
pub fn verify(block: &[u8]) -> bool {
    if block.len() != BLOCK_SIZE {
        return false;
    }
    let payload_len = u32::from_le_bytes([block[0], block[1], block[2], block[3]]) as usize;
    if payload_len > BLOCK_PAYLOAD_MAX {
        return false;
    }
    let stored = u32::from_le_bytes(
        block[BLOCK_CRC_OFFSET..]
            .try_into()
            .expect("slice is 4 bytes"),
    );
    crc32c::crc32c(&block[..BLOCK_CRC_OFFSET]) == stored
}

/// Verifies a block and returns an iterator over its records.
///
/// Rejects wrong capacity, an out-of-range length field, CRC mismatch,
/// and any record whose `32 + kLen + vLen` overflows the payload.
pub fn unpack(block: &[u8]) -> Result<BlockRecords<'_>, BlockError> {
    if block.len() != BLOCK_SIZE {
        return Err(BlockError::Corrupted("block capacity is not 32 KiB"));
    }
    let payload_len = u32::from_le_bytes([block[0], block[1], block[2], block[3]]) as usize;
    if payload_len > BLOCK_PAYLOAD_MAX {
        return Err(BlockError::Corrupted("payload length out of range"));
    }
    let stored = u32::from_le_bytes(
        block[BLOCK_CRC_OFFSET..]
            .try_into()
            .expect("slice is 4 bytes"),
    );
    if crc32c::crc32c(&block[..BLOCK_CRC_OFFSET]) != stored {
        return Err(BlockError::Corrupted("checksum mismatch"));
    }
    Ok(BlockRecords {
        payload: &block[4..4 + payload_len],
        offset: 0,
    })
}

/// Iterator over zero-copy record views inside a verified block.
///
/// Yields `Err` once and then stops if a record frame overflows the
/// payload.
#[derive(Debug)]
pub struct BlockRecords<'a> {
    payload: &'a [u8],
    offset: usize,
}

impl<'a> Iterator for BlockRecords<'a> {
    type Item = Result<RecordView<'a>, BlockError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.payload.len() {
            return None;
        }
        let rest = &self.payload[self.offset..];
        let header = match AkHdr32::read_from(rest) {
            Ok(h) => h,
            Err(e) => {
                self.offset = self.payload.len();
                return Some(Err(e));
            }
        };
        let total = HDR_SIZE + header.k_len as usize + header.v_len as usize;
        if total > rest.len() {
            self.offset = self.payload.len();
            return Some(Err(BlockError::Corrupted("record overflows payload")));
        }
        let key = &rest[HDR_SIZE..HDR_SIZE + header.k_len as usize];
        let value = &rest[HDR_SIZE + header.k_len as usize..total];
        self.offset += total;
        Some(Ok(RecordView { header, key, value }))
    }
}
