//! Workload randomization
//!
//! A `Randomizer` pairs a 32-bit and a 64-bit xoshiro generator, both seeded
//! from the same entropy draw. The 32-bit generator answers cheap ratio
//! questions ("is this request a write?"); the 64-bit generator picks blocks
//! and produces write payloads.
//!
//! Write payloads are random noise. A full fill is only needed when a buffer
//! is (re)allocated; between repeated writes it is enough to disturb a small
//! fraction of the buffer, which `fill_buffer_sparse` does by rewriting one
//! 64-bit word out of every `step`.

use rand::{Rng, RngCore, SeedableRng};
use rand_xoshiro::{Xoshiro128PlusPlus, Xoshiro256PlusPlus};

/// Resolution of ratio draws: ratios are quantized to 1/1024.
const RATIO_PRECISION: u32 = 1024;

/// Word stride used to refresh a buffer between repeated writes (~5%).
pub const REWRITE_REFRESH_STRIDE: usize = 20;

/// Paired 32/64-bit PRNG for request shaping and payload generation.
#[derive(Debug)]
pub struct Randomizer {
    rng32: Xoshiro128PlusPlus,
    rng64: Xoshiro256PlusPlus,
}

impl Randomizer {
    /// Create a randomizer seeded from OS entropy.
    pub fn new() -> Self {
        let seed = rand::thread_rng().next_u64();
        Self::with_seed(seed)
    }

    /// Create a randomizer with a fixed seed (reproducible tests).
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng32: Xoshiro128PlusPlus::seed_from_u64(seed),
            rng64: Xoshiro256PlusPlus::seed_from_u64(seed),
        }
    }

    /// Bernoulli draw against `ratio` in `[0, 1]` at 1/1024 resolution.
    #[inline]
    pub fn hit_ratio(&mut self, ratio: f64) -> bool {
        self.rng32.gen_range(0..RATIO_PRECISION) < (ratio * RATIO_PRECISION as f64) as u32
    }

    /// Uniform block number in `[0, num_blocks)`.
    #[inline]
    pub fn next_block(&mut self, num_blocks: u64) -> u64 {
        if num_blocks == 0 {
            return 0;
        }
        self.rng64.gen_range(0..num_blocks)
    }

    /// Overwrite every 64-bit word of `buf` with random data.
    pub fn fill_buffer(&mut self, buf: &mut [u8]) {
        self.fill_buffer_sparse(buf, 1);
    }

    /// Overwrite 64-bit words of `buf` at stride `step`, starting from a
    /// random word index in `0..step`. Trailing bytes that do not form a
    /// full word are left untouched.
    pub fn fill_buffer_sparse(&mut self, buf: &mut [u8], step: usize) {
        assert!(step > 0, "stride must be non-zero");

        let words = buf.len() / 8;
        let first = if step > 1 {
            self.rng64.gen_range(0..step as u64) as usize
        } else {
            0
        };

        let mut i = first;
        while i < words {
            let word = self.rng64.next_u64().to_ne_bytes();
            buf[i * 8..i * 8 + 8].copy_from_slice(&word);
            i += step;
        }
    }
}

impl Default for Randomizer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_ratio_extremes() {
        let mut rng = Randomizer::with_seed(7);
        for _ in 0..1000 {
            assert!(!rng.hit_ratio(0.0));
            assert!(rng.hit_ratio(1.0));
        }
    }

    #[test]
    fn test_hit_ratio_convergence() {
        let mut rng = Randomizer::with_seed(42);
        let n = 10_000;
        let hits = (0..n).filter(|_| rng.hit_ratio(0.3)).count();
        let fraction = hits as f64 / n as f64;
        assert!(
            (fraction - 0.3).abs() < 0.03,
            "fraction {} outside 0.3 +/- 0.03",
            fraction
        );
    }

    #[test]
    fn test_next_block_bounds() {
        let mut rng = Randomizer::with_seed(1);
        for _ in 0..1000 {
            assert!(rng.next_block(2560) < 2560);
        }
        assert_eq!(rng.next_block(0), 0);
    }

    #[test]
    fn test_fill_buffer_full() {
        let mut rng = Randomizer::with_seed(3);
        let mut buf = vec![0u8; 4096];
        rng.fill_buffer(&mut buf);

        let zero_words = buf
            .chunks_exact(8)
            .filter(|w| w.iter().all(|&b| b == 0))
            .count();
        assert!(zero_words <= 1, "{} zero words after full fill", zero_words);
    }

    #[test]
    fn test_fill_buffer_sparse_stride() {
        let mut rng = Randomizer::with_seed(5);
        let mut buf = vec![0u8; 4096];
        rng.fill_buffer_sparse(&mut buf, 20);

        let touched = buf
            .chunks_exact(8)
            .filter(|w| w.iter().any(|&b| b != 0))
            .count();
        // 512 words at stride 20 -> 25 or 26 words rewritten
        assert!(
            (25..=26).contains(&touched),
            "{} words touched at stride 20",
            touched
        );
    }

    #[test]
    fn test_seeded_reproducibility() {
        let mut a = Randomizer::with_seed(99);
        let mut b = Randomizer::with_seed(99);
        for _ in 0..100 {
            assert_eq!(a.next_block(1000), b.next_block(1000));
            assert_eq!(a.hit_ratio(0.5), b.hit_ratio(0.5));
        }
    }
}
