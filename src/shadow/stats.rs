//! Descriptive statistics and the bootstrap significance test.
//!
//! P&L samples from shadow trades are small, fat-tailed and often skewed by
//! a few large winners, so the comparison never assumes normality. The
//! test is a null-shifted two-sample bootstrap on the difference of means:
//! both samples are re-centred on the pooled mean (so the null hypothesis
//! "no difference" holds exactly), resampled with replacement, and the
//! one-sided p-value is the share of resampled deltas at least as large as
//! the observed one.
//!
//! The RNG is seeded so that the same inputs always give the same p-value.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Default number of bootstrap resamples.
pub const DEFAULT_RESAMPLES: usize = 2000;

/// Default RNG seed.
pub const DEFAULT_SEED: u64 = 0x0CA7_A5EE_D000_0001;

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Percentage (0–100) of strictly positive values.
pub fn win_rate(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let wins = values.iter().filter(|v| **v > 0.0).count();
    wins as f64 / values.len() as f64 * 100.0
}

/// Bootstrap test configuration.
#[derive(Debug, Clone, Copy)]
pub struct Bootstrap {
    pub resamples: usize,
    pub seed: u64,
}

impl Default for Bootstrap {
    fn default() -> Self {
        Self {
            resamples: DEFAULT_RESAMPLES,
            seed: DEFAULT_SEED,
        }
    }
}

impl Bootstrap {
    /// One-sided p-value for H1: mean(`challenger`) > mean(`champion`).
    ///
    /// Returns `None` when either sample has fewer than two observations.
    pub fn p_value(&self, challenger: &[f64], champion: &[f64]) -> Option<f64> {
        if challenger.len() < 2 || champion.len() < 2 || self.resamples == 0 {
            return None;
        }

        let observed = mean(challenger) - mean(champion);
        let pooled = {
            let total: f64 = challenger.iter().chain(champion.iter()).sum();
            total / (challenger.len() + champion.len()) as f64
        };
        let shift_a = pooled - mean(challenger);
        let shift_b = pooled - mean(champion);
        let a: Vec<f64> = challenger.iter().map(|v| v + shift_a).collect();
        let b: Vec<f64> = champion.iter().map(|v| v + shift_b).collect();

        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut extreme = 0usize;
        for _ in 0..self.resamples {
            let delta = resampled_mean(&mut rng, &a) - resampled_mean(&mut rng, &b);
            if delta >= observed - 1e-12 {
                extreme += 1;
            }
        }

        // +1 correction keeps the estimate strictly positive.
        Some((extreme + 1) as f64 / (self.resamples + 1) as f64)
    }
}

fn resampled_mean(rng: &mut StdRng, sample: &[f64]) -> f64 {
    let n = sample.len();
    let sum: f64 = (0..n).map(|_| sample[rng.gen_range(0..n)]).sum();
    sum / n as f64
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
