//! Descriptive moments shared by balance, stratification and effect sizes.
//!
//! Functions return `NaN` when a moment is not defined for the input size.

pub fn mean(x: &[f64]) -> f64 {
    if x.is_empty() {
        return f64::NAN;
    }
    x.iter().sum::<f64>() / x.len() as f64
}

/// Sample variance with the `n - 1` denominator.
pub fn variance(x: &[f64]) -> f64 {
    if x.len() < 2 {
        return f64::NAN;
    }
    let m = mean(x);
    x.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (x.len() - 1) as f64
}

pub fn std_dev(x: &[f64]) -> f64 {
    variance(x).sqrt()
}

pub fn weighted_mean(x: &[f64], w: &[f64]) -> f64 {
    let w_sum: f64 = w.iter().sum();
    if w_sum <= 0.0 {
        return f64::NAN;
    }
    x.iter().zip(w).map(|(v, wi)| v * wi).sum::<f64>() / w_sum
}

/// `Σw(x−m)²/Σw · n/(n−1)` over units with positive weight.
///
/// Reduces to [`variance`] when all weights are equal.
pub fn weighted_variance(x: &[f64], w: &[f64]) -> f64 {
    let n = w.iter().filter(|&&wi| wi > 0.0).count();
    if n < 2 {
        return f64::NAN;
    }
    let m = weighted_mean(x, w);
    let w_sum: f64 = w.iter().sum();
    let ss = x
        .iter()
        .zip(w)
        .map(|(v, wi)| wi * (v - m).powi(2))
        .sum::<f64>();
    ss / w_sum * n as f64 / (n - 1) as f64
}

/// Sample covariance with the `n - 1` denominator.
pub fn covariance(x: &[f64], y: &[f64]) -> f64 {
    if x.len() < 2 || x.len() != y.len() {
        return f64::NAN;
    }
    let mx = mean(x);
    let my = mean(y);
    x.iter()
        .zip(y)
        .map(|(a, b)| (a - mx) * (b - my))
        .sum::<f64>()
        / (x.len() - 1) as f64
}
