//! 64-bit similarity fingerprints (SimHash over word shingles).
//!
//! # Algorithm
//!
//! 1. Lowercase the content and split it into alphanumeric word tokens.
//! 2. Build overlapping word shingles of width [`SHINGLE_WIDTH`] (a text
//!    shorter than that is one shingle). Each distinct shingle is weighted
//!    by how often it occurs.
//! 3. Hash each shingle to 64 bits (first 8 bytes of SHA-256).
//! 4. For every bit position add the shingle weight if the bit is set,
//!    subtract it otherwise.
//! 5. Output bit `i` is 1 when the running sum for position `i` is positive.
//!
//! Near-identical texts share most shingles, so their fingerprints differ
//! in few bits. [`distance`] is the Hamming weight of the XOR.
//!
//! Empty content (or content without a single word token) maps to
//! [`EMPTY_FINGERPRINT`].
//!
//! # Distance kernels
//!
//! Batch distance computation goes through a [`DistanceKernel`]. The
//! [`ScalarKernel`] is the correctness reference; [`WideKernel`] processes
//! four fingerprints per step and relies on the hardware population count.
//! [`best_kernel`] picks the wide kernel only when the CPU reports `popcnt`.

use std::collections::HashMap;

use sha2::{Digest, Sha256};

/// Fingerprint width in bits.
pub const FINGERPRINT_BITS: u32 = 64;

/// Fingerprint of empty content.
pub const EMPTY_FINGERPRINT: u64 = 0;

/// Number of words per shingle.
pub const SHINGLE_WIDTH: usize = 3;

/// Number of 16-bit bands used by the near-duplicate pre-filter.
pub const BAND_COUNT: usize = 4;

/// Compute the fingerprint of a piece of content.
pub fn fingerprint(content: &[u8]) -> u64 {
    let text = String::from_utf8_lossy(content).to_lowercase();
    let tokens: Vec<&str> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();
    if tokens.is_empty() {
        return EMPTY_FINGERPRINT;
    }

    let mut shingles: HashMap<u64, i64> = HashMap::new();
    if tokens.len() < SHINGLE_WIDTH {
        *shingles.entry(shingle_hash(&tokens)).or_insert(0) += 1;
    } else {
        for window in tokens.windows(SHINGLE_WIDTH) {
            *shingles.entry(shingle_hash(window)).or_insert(0) += 1;
        }
    }

    let mut acc = [0i64; FINGERPRINT_BITS as usize];
    for (hash, weight) in &shingles {
        for (bit, slot) in acc.iter_mut().enumerate() {
            if (hash >> bit) & 1 == 1 {
                *slot += weight;
            } else {
                *slot -= weight;
            }
        }
    }

    acc.iter()
        .enumerate()
        .filter(|(_, sum)| **sum > 0)
        .fold(0u64, |fp, (bit, _)| fp | (1u64 << bit))
}

fn shingle_hash(words: &[&str]) -> u64 {
    let mut hasher = Sha256::new();
    for (i, word) in words.iter().enumerate() {
        if i > 0 {
            hasher.update([0x1f]);
        }
        hasher.update(word.as_bytes());
    }
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

/// Hamming distance between two fingerprints, `0..=64`.
#[inline]
pub fn distance(a: u64, b: u64) -> u8 {
    (a ^ b).count_ones() as u8
}

/// Similarity factor `1 − d/64` used by the gravity score.
#[inline]
pub fn similarity(distance: u8) -> f64 {
    1.0 - f64::from(distance) / f64::from(FINGERPRINT_BITS)
}

/// Split a fingerprint into four 16-bit bands.
///
/// Two fingerprints within distance 3 always agree on at least one band
/// (three differing bits cannot touch all four), which makes the bands an
/// exact index for the default variant threshold.
pub fn bands(fp: u64) -> [u16; BAND_COUNT] {
    [
        (fp & 0xFFFF) as u16,
        ((fp >> 16) & 0xFFFF) as u16,
        ((fp >> 32) & 0xFFFF) as u16,
        ((fp >> 48) & 0xFFFF) as u16,
    ]
}

/// Batch Hamming distance computation.
pub trait DistanceKernel: Send + Sync {
    fn name(&self) -> &'static str;

    /// Write `distance(target, c)` for every candidate into `out`
    /// (cleared first), preserving candidate order.
    fn distances(&self, target: u64, candidates: &[u64], out: &mut Vec<u8>);
}

/// Bit-at-a-time reference implementation.
pub struct ScalarKernel;

impl DistanceKernel for ScalarKernel {
    fn name(&self) -> &'static str {
        "scalar"
    }

    fn distances(&self, target: u64, candidates: &[u64], out: &mut Vec<u8>) {
        out.clear();
        out.reserve(candidates.len());
        for &c in candidates {
            let mut x = target ^ c;
            let mut n = 0u8;
            while x != 0 {
                x &= x - 1;
                n += 1;
            }
            out.push(n);
        }
    }
}

/// Four-lane kernel using the hardware population count.
pub struct WideKernel;

impl DistanceKernel for WideKernel {
    fn name(&self) -> &'static str {
        "wide"
    }

    fn distances(&self, target: u64, candidates: &[u64], out: &mut Vec<u8>) {
        out.clear();
        out.reserve(candidates.len());
        let lanes = candidates.chunks_exact(4);
        let rest = lanes.remainder();
        for lane in lanes {
            let x = [target ^ lane[0], target ^ lane[1], target ^ lane[2], target ^ lane[3]];
            out.extend_from_slice(&[
                x[0].count_ones() as u8,
                x[1].count_ones() as u8,
                x[2].count_ones() as u8,
                x[3].count_ones() as u8,
            ]);
        }
        for &c in rest {
            out.push((target ^ c).count_ones() as u8);
        }
    }
}

static SCALAR: ScalarKernel = ScalarKernel;
static WIDE: WideKernel = WideKernel;

/// Pick the fastest kernel this CPU supports.
pub fn best_kernel() -> &'static dyn DistanceKernel {
    #[cfg(target_arch = "x86_64")]
    {
        if std::arch::is_x86_feature_detected!("popcnt") {
            return &WIDE;
        }
    }

    #[cfg(target_arch = "aarch64")]
    {
        return &WIDE;
    }

    &SCALAR
}
