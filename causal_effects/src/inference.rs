//! This module contains functions for statistical inference: reference
//! distribution tail probabilities and the matched-pair bootstrap.

use getset::CopyGetters;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::Serialize;
use statrs::distribution::{ChiSquared, ContinuousCDF, FisherSnedecor, StudentsT};

/// Two-sided p-value of a t statistic.
pub fn t_test_p_value(statistic: f64, df: f64) -> f64 {
    if !statistic.is_finite() || df <= 0.0 {
        return f64::NAN;
    }
    match StudentsT::new(0.0, 1.0, df) {
        Ok(dist) => 2.0 * (1.0 - dist.cdf(statistic.abs())),
        Err(_) => f64::NAN,
    }
}

/// Upper-tail p-value of an F statistic.
pub fn f_test_p_value(statistic: f64, df_num: f64, df_den: f64) -> f64 {
    if !statistic.is_finite() || df_num <= 0.0 || df_den <= 0.0 {
        return f64::NAN;
    }
    match FisherSnedecor::new(df_num, df_den) {
        Ok(dist) => 1.0 - dist.cdf(statistic.max(0.0)),
        Err(_) => f64::NAN,
    }
}

/// Upper-tail p-value of a chi-squared statistic.
pub fn chi_squared_p_value(statistic: f64, df: f64) -> f64 {
    if !statistic.is_finite() || df <= 0.0 {
        return f64::NAN;
    }
    match ChiSquared::new(df) {
        Ok(dist) => 1.0 - dist.cdf(statistic.max(0.0)),
        Err(_) => f64::NAN,
    }
}

/// Summary of a bootstrap distribution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct BootstrapSummary {
    std_error: f64,
    ci_lower: f64,
    ci_upper: f64,
    p_value: f64,
    reps: usize,
}

/// Calculates the standard error, p-value, and percentile 95% interval from
/// a vector of bootstrap estimates.
pub fn bootstrap_stats(estimates: &[f64]) -> BootstrapSummary {
    if estimates.len() < 2 {
        return BootstrapSummary {
            std_error: f64::NAN,
            ci_lower: f64::NAN,
            ci_upper: f64::NAN,
            p_value: f64::NAN,
            reps: estimates.len(),
        };
    }
    let n = estimates.len() as f64;
    let mean: f64 = estimates.iter().sum::<f64>() / n;
    let std_error =
        (estimates.iter().map(|&val| (val - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt();

    // p = 2 * min(share <= 0, share >= 0)
    let prop_le_zero = estimates.iter().filter(|&&val| val <= 0.0).count() as f64 / n;
    let prop_ge_zero = estimates.iter().filter(|&&val| val >= 0.0).count() as f64 / n;
    let p_value = (2.0 * prop_le_zero.min(prop_ge_zero)).min(1.0);

    let mut sorted = estimates.to_vec();
    sorted.sort_unstable_by(|a, b| a.total_cmp(b));
    let lower_idx = (0.025 * n).floor() as usize;
    let upper_idx = ((0.975 * n).floor() as usize).min(estimates.len() - 1);

    BootstrapSummary {
        std_error,
        ci_lower: sorted[lower_idx],
        ci_upper: sorted[upper_idx],
        p_value,
        reps: estimates.len(),
    }
}

/// Resamples matched-pair outcome differences with replacement.
///
/// Each replicate draws from its own `StdRng` seeded with `seed + replicate`,
/// so the result does not depend on how rayon schedules the work.
pub fn bootstrap_pair_differences(differences: &[f64], reps: usize, seed: u64) -> BootstrapSummary {
    let n = differences.len();
    if n == 0 || reps == 0 {
        return bootstrap_stats(&[]);
    }
    let estimates: Vec<f64> = (0..reps)
        .into_par_iter()
        .map(|rep| {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(rep as u64));
            let total: f64 = (0..n).map(|_| differences[rng.gen_range(0..n)]).sum();
            total / n as f64
        })
        .collect();
    bootstrap_stats(&estimates)
}
