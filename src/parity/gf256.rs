//! GF(2^8) arithmetic with the primitive polynomial `0x11D`.
//!
//! Tables are built once on first use and shared immutably: `exp`/`log`
//! for coefficient generation and inversion, and a full 256×256 product
//! LUT so the per-byte encode/reconstruct loops are a single indexed load.

use std::sync::OnceLock;

/// Primitive polynomial x^8 + x^4 + x^3 + x^2 + 1.
const POLY: u16 = 0x11D;

struct Tables {
    /// `exp[i] = α^i`, doubled to 512 entries so `exp[log a + log b]`
    /// needs no modulo.
    exp: [u8; 512],

    /// `log[a]` for `a != 0`; `log[0]` is unused.
    log: [u8; 256],

    /// `mul[a][b] = a · b`.
    mul: Box<[[u8; 256]; 256]>,
}

fn tables() -> &'static Tables {
    static TABLES: OnceLock<Tables> = OnceLock::new();
    TABLES.get_or_init(|| {
        let mut exp = [0u8; 512];
        let mut log = [0u8; 256];

        let mut x: u16 = 1;
        for i in 0..255 {
            exp[i] = x as u8;
            log[x as usize] = i as u8;
            x <<= 1;
            if x & 0x100 != 0 {
                x ^= POLY;
            }
        }
        for i in 255..512 {
            exp[i] = exp[i - 255];
        }

        let mut mul = Box::new([[0u8; 256]; 256]);
        for a in 1..256usize {
            for b in 1..256usize {
                mul[a][b] = exp[log[a] as usize + log[b] as usize];
            }
        }

        Tables { exp, log, mul }
    })
}

/// `α^i` (exponent taken modulo 255).
pub fn exp(i: u32) -> u8 {
    tables().exp[(i % 255) as usize]
}

/// Product over GF(2^8).
pub fn mul(a: u8, b: u8) -> u8 {
    tables().mul[a as usize][b as usize]
}

/// One row of the product LUT: `row[b] = a · b`.
///
/// The byte-wise encode loop indexes this row directly instead of paying
/// the double lookup per byte.
pub fn mul_row(a: u8) -> &'static [u8; 256] {
    &tables().mul[a as usize]
}

/// Multiplicative inverse; `inv(0)` is undefined and debug-asserted.
pub fn inv(a: u8) -> u8 {
    debug_assert_ne!(a, 0, "zero has no inverse in GF(2^8)");
    let t = tables();
    t.exp[255 - t.log[a as usize] as usize]
}
