//! Erasure Coding Module
//!
//! Computes parity blocks for the stripe log and reconstructs lost lanes.
//! A coder owns `k` data lanes and `m` parity lanes; any `k` surviving
//! lanes out of `k + m` suffice to recover the stripe.
//!
//! ## Variants
//!
//! - **None** (`m = 0`) — no parity, no reconstruction.
//! - **XOR** (`m = 1`) — `P = D0 ⊕ D1 ⊕ … ⊕ Dk−1`; tolerates one lost
//!   lane, data or parity.
//! - **Dual-XOR** (`m = 2`) — the RAID-6 style pair: one plain XOR lane
//!   plus one α-weighted sum over GF(2^8); tolerates any two lost lanes.
//! - **Reed–Solomon** (`m ≥ 1`, `k + m ≤ 255`) — Vandermonde generator
//!   `a(j,i) = α^{(j+1)·i}` over GF(2^8); tolerates up to `m` erasures.
//!
//! ## Arithmetic
//!
//! GF(2^8) uses the primitive polynomial `0x11D`. The `exp`/`log` tables
//! and a full 256×256 multiplication LUT are built once on first use and
//! shared immutably afterwards. Hot loops XOR 64 bits at a time with a
//! byte-wise tail; only non-unit coefficients pay for table lookups.
//!
//! Encoding and verification stream over buffer offsets in constant
//! memory. Reconstruction gathers syndromes from the surviving lanes,
//! solves the e×e system by Gauss-Jordan elimination, then re-encodes any
//! missing parity from the repaired data.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use thiserror::Error;
use tracing::trace;

mod gf256;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by the parity coder.
#[derive(Debug, Error)]
pub enum ParityError {
    /// `k`/`m` combination is not valid for the selected kind.
    #[error("invalid coder geometry: {0}")]
    InvalidGeometry(String),

    /// A lane buffer count or length did not match the coder geometry.
    #[error("lane shape mismatch: {0}")]
    ShapeMismatch(String),

    /// More lanes lost than the parity can repair.
    #[error("{lost} lanes lost, parity repairs at most {max}")]
    TooManyErasures {
        /// Lanes missing from the stripe.
        lost: usize,
        /// Maximum repairable erasures (`m` minus lost parity).
        max: usize,
    },

    /// The recovery system was singular for this erasure pattern.
    #[error("unrecoverable erasure pattern (singular system)")]
    SingularSystem,
}

// ------------------------------------------------------------------------------------------------
// ParityKind
// ------------------------------------------------------------------------------------------------

/// Which parity scheme a stripe set uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParityKind {
    /// No parity lanes; reads cannot repair anything.
    None,
    /// Single XOR parity lane (`m = 1`).
    Xor,
    /// XOR lane plus an α-weighted lane (`m = 2`).
    DualXor,
    /// Reed–Solomon with a Vandermonde generator (`m ≥ 1`).
    Rs,
}

impl ParityKind {
    /// The conventional kind for a given parity lane count.
    pub fn for_m(m: usize) -> Self {
        match m {
            0 => Self::None,
            1 => Self::Xor,
            2 => Self::DualXor,
            _ => Self::Rs,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// ParityCoder
// ------------------------------------------------------------------------------------------------

/// Encodes, verifies, and reconstructs one stripe's parity.
///
/// Coefficient rows are computed once per `(kind, k, m)` at construction
/// and held as immutable shared state.
#[derive(Debug)]
pub struct ParityCoder {
    kind: ParityKind,
    k: usize,
    m: usize,

    /// `rows[j][i]` is the GF(2^8) coefficient of data lane `i` in parity
    /// lane `j`.
    rows: Vec<Vec<u8>>,
}

impl ParityCoder {
    /// Builds a coder, validating the geometry for the chosen kind.
    pub fn new(kind: ParityKind, k: usize, m: usize) -> Result<Self, ParityError> {
        if k == 0 {
            return Err(ParityError::InvalidGeometry("k must be at least 1".into()));
        }
        match kind {
            ParityKind::None => {
                if m != 0 {
                    return Err(ParityError::InvalidGeometry(format!(
                        "kind None requires m = 0, got m = {m}"
                    )));
                }
            }
            ParityKind::Xor => {
                if m != 1 {
                    return Err(ParityError::InvalidGeometry(format!(
                        "kind Xor requires m = 1, got m = {m}"
                    )));
                }
            }
            ParityKind::DualXor => {
                if m != 2 {
                    return Err(ParityError::InvalidGeometry(format!(
                        "kind DualXor requires m = 2, got m = {m}"
                    )));
                }
            }
            ParityKind::Rs => {
                if m == 0 {
                    return Err(ParityError::InvalidGeometry(
                        "kind Rs requires m >= 1".into(),
                    ));
                }
            }
        }
        if k + m > 255 {
            return Err(ParityError::InvalidGeometry(format!(
                "k + m must not exceed 255, got {}",
                k + m
            )));
        }

        let rows = match kind {
            ParityKind::None => Vec::new(),
            ParityKind::Xor => vec![vec![1u8; k]],
            ParityKind::DualXor => {
                let weighted: Vec<u8> = (0..k).map(|i| gf256::exp(i as u32)).collect();
                vec![vec![1u8; k], weighted]
            }
            ParityKind::Rs => (0..m)
                .map(|j| {
                    (0..k)
                        .map(|i| gf256::exp((j as u32 + 1) * i as u32))
                        .collect()
                })
                .collect(),
        };

        Ok(Self { kind, k, m, rows })
    }

    /// Parity scheme in use.
    pub fn kind(&self) -> ParityKind {
        self.kind
    }

    /// Number of data lanes.
    pub fn k(&self) -> usize {
        self.k
    }

    /// Number of parity lanes.
    pub fn m(&self) -> usize {
        self.m
    }

    /// Encodes `m` parity blocks from `k` data blocks.
    ///
    /// All input buffers must share one length; each output buffer has the
    /// same length.
    pub fn encode(&self, data: &[&[u8]]) -> Result<Vec<Vec<u8>>, ParityError> {
        let len = self.check_data_shape(data)?;
        let mut parity = vec![vec![0u8; len]; self.m];
        for (j, out) in parity.iter_mut().enumerate() {
            self.encode_row(j, data, out);
        }
        Ok(parity)
    }

    /// Recomputes parity and compares byte-for-byte against `parity`.
    pub fn verify(&self, data: &[&[u8]], parity: &[&[u8]]) -> Result<bool, ParityError> {
        let len = self.check_data_shape(data)?;
        if parity.len() != self.m {
            return Err(ParityError::ShapeMismatch(format!(
                "expected {} parity lanes, got {}",
                self.m,
                parity.len()
            )));
        }
        if parity.iter().any(|p| p.len() != len) {
            return Err(ParityError::ShapeMismatch(
                "parity lane length differs from data".into(),
            ));
        }

        let mut scratch = vec![0u8; len];
        for j in 0..self.m {
            scratch.iter_mut().for_each(|b| *b = 0);
            self.encode_row(j, data, &mut scratch);
            if scratch != parity[j] {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Rebuilds every `None` slot in `shards` from the survivors.
    ///
    /// `shards` holds `k` data lanes followed by `m` parity lanes. Up to
    /// `m` slots may be missing in total; on success every slot is
    /// `Some` and byte-identical to the originals.
    pub fn reconstruct(&self, shards: &mut [Option<Vec<u8>>]) -> Result<(), ParityError> {
        if shards.len() != self.k + self.m {
            return Err(ParityError::ShapeMismatch(format!(
                "expected {} lanes, got {}",
                self.k + self.m,
                shards.len()
            )));
        }

        let lost_data: Vec<usize> = (0..self.k).filter(|&i| shards[i].is_none()).collect();
        let lost_parity: Vec<usize> = (0..self.m)
            .filter(|&j| shards[self.k + j].is_none())
            .collect();

        if lost_data.is_empty() && lost_parity.is_empty() {
            return Ok(());
        }
        if lost_data.len() + lost_parity.len() > self.m {
            return Err(ParityError::TooManyErasures {
                lost: lost_data.len() + lost_parity.len(),
                max: self.m,
            });
        }

        let len = shards
            .iter()
            .flatten()
            .map(Vec::len)
            .next()
            .ok_or_else(|| ParityError::ShapeMismatch("no surviving lanes".into()))?;
        if shards.iter().flatten().any(|s| s.len() != len) {
            return Err(ParityError::ShapeMismatch(
                "surviving lanes have differing lengths".into(),
            ));
        }

        trace!(
            lost_data = lost_data.len(),
            lost_parity = lost_parity.len(),
            "reconstructing stripe lanes"
        );

        if !lost_data.is_empty() {
            self.solve_data(shards, &lost_data, len)?;
        }

        // With data complete, missing parity is a plain re-encode.
        for j in lost_parity {
            let data_refs: Vec<&[u8]> = (0..self.k)
                .map(|i| shards[i].as_deref().expect("data repaired above"))
                .collect();
            let mut out = vec![0u8; len];
            self.encode_row(j, &data_refs, &mut out);
            shards[self.k + j] = Some(out);
        }

        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Internals
    // --------------------------------------------------------------------------------------------

    fn check_data_shape(&self, data: &[&[u8]]) -> Result<usize, ParityError> {
        if data.len() != self.k {
            return Err(ParityError::ShapeMismatch(format!(
                "expected {} data lanes, got {}",
                self.k,
                data.len()
            )));
        }
        let len = data.first().map_or(0, |d| d.len());
        if data.iter().any(|d| d.len() != len) {
            return Err(ParityError::ShapeMismatch(
                "data lanes have differing lengths".into(),
            ));
        }
        Ok(len)
    }

    /// `out ^= Σ_i rows[j][i] · data[i]`, streaming over offsets.
    fn encode_row(&self, j: usize, data: &[&[u8]], out: &mut [u8]) {
        for (i, lane) in data.iter().enumerate() {
            let c = self.rows[j][i];
            match c {
                0 => {}
                1 => xor_into(out, lane),
                c => mul_xor_into(out, lane, c),
            }
        }
    }

    /// Solves for the erased data lanes using the first `e` surviving
    /// parity rows.
    fn solve_data(
        &self,
        shards: &mut [Option<Vec<u8>>],
        lost_data: &[usize],
        len: usize,
    ) -> Result<(), ParityError> {
        let e = lost_data.len();
        let rows_used: Vec<usize> = (0..self.m)
            .filter(|&j| shards[self.k + j].is_some())
            .take(e)
            .collect();
        debug_assert_eq!(rows_used.len(), e, "erasure budget checked by caller");

        // Syndromes: S_j = P_j ⊕ Σ_{surviving i} a(j,i)·D_i.
        let mut syndromes: Vec<Vec<u8>> = Vec::with_capacity(e);
        for &j in &rows_used {
            let mut s = shards[self.k + j]
                .as_ref()
                .expect("row chosen from survivors")
                .clone();
            for i in 0..self.k {
                if let Some(lane) = shards[i].as_deref() {
                    match self.rows[j][i] {
                        0 => {}
                        1 => xor_into(&mut s, lane),
                        c => mul_xor_into(&mut s, lane, c),
                    }
                }
            }
            syndromes.push(s);
        }

        // e×e system M·x = S with M[r][t] = a(row_r, lost_t).
        let mut matrix: Vec<Vec<u8>> = rows_used
            .iter()
            .map(|&j| lost_data.iter().map(|&i| self.rows[j][i]).collect())
            .collect();
        let inverse = invert_matrix(&mut matrix).ok_or(ParityError::SingularSystem)?;

        // x_t = Σ_r inv[t][r] · S_r, one output lane at a time.
        for (t, &lane_idx) in lost_data.iter().enumerate() {
            let mut out = vec![0u8; len];
            for (r, syndrome) in syndromes.iter().enumerate() {
                match inverse[t][r] {
                    0 => {}
                    1 => xor_into(&mut out, syndrome),
                    c => mul_xor_into(&mut out, syndrome, c),
                }
            }
            shards[lane_idx] = Some(out);
        }

        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Vectorized lane arithmetic
// ------------------------------------------------------------------------------------------------

/// `dst ^= src`, 64 bits at a time with a byte-wise tail.
fn xor_into(dst: &mut [u8], src: &[u8]) {
    debug_assert_eq!(dst.len(), src.len());
    let mut dst_words = dst.chunks_exact_mut(8);
    let mut src_words = src.chunks_exact(8);
    for (d, s) in dst_words.by_ref().zip(src_words.by_ref()) {
        let x = u64::from_le_bytes(d.try_into().expect("chunk is 8 bytes"))
            ^ u64::from_le_bytes(s.try_into().expect("chunk is 8 bytes"));
        d.copy_from_slice(&x.to_le_bytes());
    }
    for (d, s) in dst_words
        .into_remainder()
        .iter_mut()
        .zip(src_words.remainder())
    {
        *d ^= s;
    }
}

/// `dst ^= c · src` over GF(2^8), via the cached multiplication row.
fn mul_xor_into(dst: &mut [u8], src: &[u8], c: u8) {
    debug_assert_eq!(dst.len(), src.len());
    let row = gf256::mul_row(c);
    for (d, &s) in dst.iter_mut().zip(src) {
        *d ^= row[s as usize];
    }
}

/// Gauss-Jordan inversion over GF(2^8). Consumes `matrix`; returns `None`
/// when singular.
fn invert_matrix(matrix: &mut [Vec<u8>]) -> Option<Vec<Vec<u8>>> {
    let n = matrix.len();
    let mut inv: Vec<Vec<u8>> = (0..n)
        .map(|r| (0..n).map(|c| u8::from(r == c)).collect())
        .collect();

    for col in 0..n {
        // Pivot: any row at/below `col` with a nonzero entry.
        let pivot = (col..n).find(|&r| matrix[r][col] != 0)?;
        matrix.swap(col, pivot);
        inv.swap(col, pivot);

        let p = matrix[col][col];
        let p_inv = gf256::inv(p);
        for x in matrix[col].iter_mut().chain(inv[col].iter_mut()) {
            *x = gf256::mul(*x, p_inv);
        }

        for r in 0..n {
            if r == col || matrix[r][col] == 0 {
                continue;
            }
            let factor = matrix[r][col];
            for c in 0..n {
                let m = gf256::mul(factor, matrix[col][c]);
                matrix[r][c] ^= m;
                let i = gf256::mul(factor, inv[col][c]);
                inv[r][c] ^= i;
            }
        }
    }

    Some(inv)
}
