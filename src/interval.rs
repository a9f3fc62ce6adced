use rand::distributions::Open01;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::mem::size_of;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Upper clamp on an interval, as a multiple of the mean.
/// `P(X > 20 * mean) = e^-20`, so the clamp does not skew the distribution.
const MAX_INTERVAL_FACTOR: usize = 20;

// Odd 64-bit constant; consecutive draws get well separated seeds.
const SEED_STRIDE: u64 = 0x9E37_79B9_7F4A_7C15;

/// Smallest interval ever handed out. A zero threshold would be crossed by
/// every allocation without any of them winning it.
pub const MIN_INTERVAL: usize = size_of::<usize>();

/// Draws byte intervals between samples.
///
/// Sampling is a Poisson process over the stream of allocated bytes, so the
/// gaps are exponentially distributed with rate `1 / mean`.
///
/// Drawing never takes a lock and never allocates: every draw seeds a fresh
/// `SmallRng` from an atomically advanced counter. The generator is called
/// from inside the global allocator, where a contended lock or a lazily
/// initialized thread-local RNG could recurse into the allocator.
#[derive(Debug)]
pub struct IntervalGenerator {
    deterministic: AtomicBool,
    seed: AtomicU64,
}

impl IntervalGenerator {
    pub fn new(deterministic: bool) -> Self {
        Self::with_seed(deterministic, rand::random())
    }

    pub fn with_seed(deterministic: bool, seed: u64) -> Self {
        Self {
            deterministic: AtomicBool::new(deterministic),
            seed: AtomicU64::new(seed),
        }
    }

    pub fn set_deterministic(&self, deterministic: bool) {
        self.deterministic.store(deterministic, Ordering::Release);
    }

    pub fn is_deterministic(&self) -> bool {
        self.deterministic.load(Ordering::Acquire)
    }

    /// Next interval for the given mean, in bytes.
    ///
    /// In deterministic mode this is `mean` itself. Otherwise it is
    /// `-ln(u) * mean` for `u` uniform on `(0, 1)`, clamped to
    /// `[MIN_INTERVAL, mean * 20]`. Both modes floor at [`MIN_INTERVAL`].
    pub fn next_interval(&self, mean: usize) -> usize {
        if self.is_deterministic() {
            return mean.max(MIN_INTERVAL);
        }

        let seed = self.seed.fetch_add(SEED_STRIDE, Ordering::Relaxed);
        let uniform: f64 = SmallRng::seed_from_u64(seed).sample(Open01);
        let value = -uniform.ln() * mean as f64;

        let min_value = MIN_INTERVAL;
        let max_value = mean.saturating_mul(MAX_INTERVAL_FACTOR).max(min_value);
        if value < min_value as f64 {
            min_value
        } else if value > max_value as f64 {
            max_value
        } else {
            value as usize
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_mode_returns_the_mean() {
        let generator = IntervalGenerator::new(true);
        for _ in 0..100 {
            assert_eq!(generator.next_interval(1000), 1000);
        }
    }

    #[test]
    fn deterministic_zero_mean_floors_at_word_size() {
        let generator = IntervalGenerator::new(true);
        assert_eq!(generator.next_interval(0), size_of::<usize>());
        assert_eq!(generator.next_interval(1), size_of::<usize>());
    }

    #[test]
    fn random_intervals_stay_within_clamp() {
        let generator = IntervalGenerator::with_seed(false, 42);
        for _ in 0..10_000 {
            let interval = generator.next_interval(1000);
            assert!(interval >= size_of::<usize>());
            assert!(interval <= 20_000);
        }
    }

    #[test]
    fn random_intervals_average_to_the_mean() {
        let generator = IntervalGenerator::with_seed(false, 7);
        let mean = 4096;
        let draws = 100_000;

        let total: u64 = (0..draws)
            .map(|_| generator.next_interval(mean) as u64)
            .sum();
        let observed = total as f64 / draws as f64;

        let error = (observed - mean as f64).abs() / mean as f64;
        assert!(error < 0.03, "observed mean {observed} too far from {mean}");
    }

    #[test]
    fn random_intervals_vary() {
        let generator = IntervalGenerator::with_seed(false, 1);
        let first = generator.next_interval(1 << 20);
        assert!((0..32).any(|_| generator.next_interval(1 << 20) != first));
    }

    #[test]
    fn tiny_mean_clamps_to_word_size() {
        let generator = IntervalGenerator::with_seed(false, 3);
        for _ in 0..1000 {
            assert_eq!(generator.next_interval(0), size_of::<usize>());
        }
    }

    #[test]
    fn toggling_deterministic_mode() {
        let generator = IntervalGenerator::with_seed(false, 9);
        generator.set_deterministic(true);
        assert!(generator.is_deterministic());
        assert_eq!(generator.next_interval(512), 512);
    }
}
