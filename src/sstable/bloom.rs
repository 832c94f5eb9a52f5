//! Per-SSTable bloom filter.
//!
//! A plain bit array probed at exactly [`BLOOM_NUM_HASHES`] positions
//! derived from two 64-bit SipHash-2-4 values via double hashing
//! (`h(i) = h1 + i·h2`). The serialized form is the raw bit array — the
//! reader recovers the bit count from the section length, so no header is
//! needed inside the SSTable.
//!
//! A bloom filter can say with certainty that a key is **not** present
//! (no false negatives) but may report presence for an absent key. Sizing
//! follows the optimal-bits formula `m = −n·ln(p) / ln(2)²`, which lands
//! near 10 bits per entry at the default 1% false-positive target.

use std::hash::Hasher;

use siphasher::sip::SipHasher24;

/// Number of probe positions per key. Fixed by the on-disk format.
pub const BLOOM_NUM_HASHES: u32 = 7;

/// Seed pair for the first base hash.
const BLOOM_SEED_H1: (u64, u64) = (0x626C_6F6F_6D5F_6831, 0x414B_5353_0000_0001);

/// Seed pair for the second base hash.
const BLOOM_SEED_H2: (u64, u64) = (0x626C_6F6F_6D5F_6832, 0x414B_5353_0000_0002);

/// Bit-array bloom filter with double-hashed probes.
#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits: Vec<u8>,
    num_bits: u64,
}

impl BloomFilter {
    /// Sizes a filter for `expected_entries` keys at the target
    /// false-positive rate.
    pub fn new(expected_entries: usize, fp_rate: f64) -> Self {
        let n = expected_entries.max(1) as f64;
        let p = fp_rate.clamp(1e-9, 0.5);
        let m = (-n * p.ln() / (std::f64::consts::LN_2 * std::f64::consts::LN_2)).ceil() as u64;
        let num_bits = m.max(64);
        let byte_len = num_bits.div_ceil(8) as usize;
        Self {
            bits: vec![0u8; byte_len],
            num_bits: byte_len as u64 * 8,
        }
    }

    /// Rehydrates a filter from the raw bit array stored in an SSTable.
    pub fn from_bytes(bits: Vec<u8>) -> Self {
        let num_bits = bits.len() as u64 * 8;
        Self { bits, num_bits }
    }

    /// The raw bit array (the serialized form).
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Adds a key to the set.
    pub fn insert(&mut self, key: &[u8]) {
        let (h1, h2) = hash_pair(key);
        for i in 0..u64::from(BLOOM_NUM_HASHES) {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits;
            self.bits[(bit / 8) as usize] |= 1 << (bit % 8);
        }
    }

    /// `false` means the key is definitely absent; `true` means it may be
    /// present.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        if self.num_bits == 0 {
            return true;
        }
        let (h1, h2) = hash_pair(key);
        for i in 0..u64::from(BLOOM_NUM_HASHES) {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits;
            if self.bits[(bit / 8) as usize] & (1 << (bit % 8)) == 0 {
                return false;
            }
        }
        true
    }

    /// Bits in the filter.
    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }
}

fn hash_pair(key: &[u8]) -> (u64, u64) {
    let mut a = SipHasher24::new_with_keys(BLOOM_SEED_H1.0, BLOOM_SEED_H1.1);
    a.write(key);
    let mut b = SipHasher24::new_with_keys(BLOOM_SEED_H2.0, BLOOM_SEED_H2.1);
    b.write(key);
    (a.finish(), b.finish())
}
