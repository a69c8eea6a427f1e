//! A HyperLogLog sketch over 64-bit hash values.
//!
//! Batch insertion needs a cheap estimate of how many distinct keys a batch
//! contains so it can reserve capacity once instead of rehashing
//! incrementally. The sketch here uses precision 12: 4096 one-byte
//! registers, small enough to stay resident in L1 while a batch streams
//! through. The relative error is about `1.04 / sqrt(4096)`, i.e. ~1.6%,
//! which is far tighter than the 2x granularity of power-of-two table
//! sizing requires.
//!
//! The sketch consumes hash values rather than keys. The register index is
//! taken from the top `PRECISION` bits and the rank from the leading zeros
//! of the remaining bits, so the low bits stay uncorrelated with the
//! table's bucket index (which is taken from the low bits).

use alloc::boxed::Box;
use alloc::vec;

const PRECISION: u32 = 12;
const REGISTERS: usize = 1 << PRECISION;

// Rank of a hash whose remaining 52 bits are all zero.
const MAX_RANK: u8 = (64 - PRECISION + 1) as u8;

#[inline(always)]
fn ln(x: f64) -> f64 {
    libm::log(x)
}

/// A probabilistic sketch estimating the number of distinct hash values
/// observed in a stream.
pub struct CardinalityEstimator {
    registers: Box<[u8]>,
}

impl CardinalityEstimator {
    /// Creates an empty sketch.
    pub fn new() -> Self {
        Self {
            registers: vec![0u8; REGISTERS].into_boxed_slice(),
        }
    }

    /// Folds one hash value into the sketch.
    #[inline]
    pub fn update(&mut self, hash: u64) {
        let index = (hash >> (64 - PRECISION)) as usize;
        let rank = ((hash << PRECISION).leading_zeros() as u8 + 1).min(MAX_RANK);
        if self.registers[index] < rank {
            self.registers[index] = rank;
        }
    }

    /// Estimates the number of distinct hash values observed so far.
    ///
    /// Uses the standard bias-corrected harmonic mean, falling back to
    /// linear counting while the sketch is sparsely populated.
    pub fn estimate(&self) -> f64 {
        let m = REGISTERS as f64;
        let mut sum = 0.0;
        let mut zeros = 0usize;
        for &r in self.registers.iter() {
            sum += 1.0 / (1u64 << r) as f64;
            if r == 0 {
                zeros += 1;
            }
        }

        let alpha = 0.7213 / (1.0 + 1.079 / m);
        let raw = alpha * m * m / sum;

        if raw <= 2.5 * m && zeros > 0 {
            m * ln(m / zeros as f64)
        } else {
            raw
        }
    }

    /// Merges another sketch into this one.
    ///
    /// The result estimates the cardinality of the union of the two
    /// streams.
    pub fn merge(&mut self, other: &Self) {
        for (r, &o) in self.registers.iter_mut().zip(other.registers.iter()) {
            if *r < o {
                *r = o;
            }
        }
    }

    /// Resets the sketch to empty.
    pub fn clear(&mut self) {
        self.registers.fill(0);
    }
}

impl Default for CardinalityEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for CardinalityEstimator {
    fn clone(&self) -> Self {
        Self {
            registers: self.registers.clone(),
        }
    }
}

impl core::fmt::Debug for CardinalityEstimator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CardinalityEstimator")
            .field("estimate", &self.estimate())
            .finish()
    }
}
