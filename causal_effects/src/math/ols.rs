use crate::CausalError;
use nalgebra::{DMatrix, DVector};

/// Relative tolerance on singular values below which a direction counts as
/// absent from the column space.
const RANK_TOLERANCE: f64 = 1e-10;

/// Represents the results of a (weighted) least squares regression.
#[derive(Debug, Clone)]
pub struct OlsResult {
    pub coefficients: DVector<f64>,
    pub vcov: DMatrix<f64>,
    pub residuals: DVector<f64>,
    pub fitted: DVector<f64>,
    /// `(X'WX)⁻¹`
    pub xtx_inv: DMatrix<f64>,
    /// Weighted residual sum of squares, `Σ wᵢ eᵢ²`.
    pub rss: f64,
    pub sigma_squared: f64,
    pub df_resid: usize,
    pub r_squared: f64,
}

/// Performs an Ordinary Least Squares (OLS) or Weighted Least Squares (WLS) regression.
///
/// Solves `(X'WX)β = X'Wy` by Cholesky after checking that the weighted
/// design has full column rank. `names` labels the columns of `x` so that a
/// rank failure can say which terms are redundant.
///
/// Weights are treated as analytic weights: the residual degrees of freedom
/// are the number of rows with a positive weight minus the number of columns.
pub fn ols(
    y: &DVector<f64>,
    x: &DMatrix<f64>,
    weights: Option<&DVector<f64>>,
    names: &[String],
) -> Result<OlsResult, CausalError> {
    if y.len() != x.nrows() || names.len() != x.ncols() {
        return Err(CausalError::InvalidInput(format!(
            "design is {}x{} with {} names for {} outcomes",
            x.nrows(),
            x.ncols(),
            names.len(),
            y.len()
        )));
    }
    if let Some(w) = weights {
        if w.len() != y.len() || w.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(CausalError::InvalidInput(
                "weights must be finite, non-negative and one per row".to_string(),
            ));
        }
    }

    let w = weights.cloned().unwrap_or_else(|| DVector::from_element(y.len(), 1.0));
    let w_sqrt = w.map(f64::sqrt);
    let mut x_w = x.clone();
    for j in 0..x.ncols() {
        x_w.column_mut(j).component_mul_assign(&w_sqrt);
    }
    let y_w = y.component_mul(&w_sqrt);

    ensure_full_rank(&x_w, names)?;

    let n_pos = w.iter().filter(|&&v| v > 0.0).count();
    let k = x.ncols();
    if n_pos <= k {
        return Err(CausalError::InvalidInput(format!(
            "{} observations cannot identify {} coefficients with residual variance",
            n_pos, k
        )));
    }
    let df_resid = n_pos - k;

    let xtx = x_w.transpose() * &x_w;
    let xty = x_w.transpose() * &y_w;
    let cholesky = xtx.cholesky().ok_or_else(|| CausalError::SingularDesign {
        terms: Vec::new(),
        detail: "X'WX is not positive definite".to_string(),
    })?;
    let coefficients = cholesky.solve(&xty);
    let xtx_inv = cholesky.inverse();

    let fitted = x * &coefficients;
    let residuals = y - &fitted;
    let rss = residuals
        .iter()
        .zip(w.iter())
        .map(|(e, wi)| wi * e * e)
        .sum::<f64>();
    let sigma_squared = rss / df_resid as f64;
    let vcov = &xtx_inv * sigma_squared;

    let w_sum = w.sum();
    let y_bar = y.iter().zip(w.iter()).map(|(yi, wi)| wi * yi).sum::<f64>() / w_sum;
    let tss = y
        .iter()
        .zip(w.iter())
        .map(|(yi, wi)| wi * (yi - y_bar).powi(2))
        .sum::<f64>();
    let r_squared = if tss > 0.0 { 1.0 - rss / tss } else { 0.0 };

    Ok(OlsResult {
        coefficients,
        vcov,
        residuals,
        fitted,
        xtx_inv,
        rss,
        sigma_squared,
        df_resid,
        r_squared,
    })
}

/// Numerical rank of a matrix from its singular values.
pub fn rank(x: &DMatrix<f64>) -> usize {
    if x.ncols() == 0 || x.nrows() == 0 {
        return 0;
    }
    let singular_values = x.clone().svd(false, false).singular_values;
    let max_sv = singular_values.iter().cloned().fold(0.0_f64, f64::max);
    if max_sv == 0.0 {
        return 0;
    }
    singular_values
        .iter()
        .filter(|&&s| s > max_sv * RANK_TOLERANCE)
        .count()
}

/// Fails with `SingularDesign` when `x` is rank-deficient.
///
/// Columns are added one at a time; every column that does not raise the
/// rank is reported by name.
pub fn ensure_full_rank(x: &DMatrix<f64>, names: &[String]) -> Result<(), CausalError> {
    let k = x.ncols();
    if rank(x) == k {
        return Ok(());
    }
    let mut kept: Vec<usize> = Vec::with_capacity(k);
    let mut redundant = Vec::new();
    for j in 0..k {
        let mut candidate = kept.clone();
        candidate.push(j);
        if rank(&x.select_columns(candidate.iter())) == candidate.len() {
            kept = candidate;
        } else {
            redundant.push(names.get(j).cloned().unwrap_or_else(|| format!("column_{}", j)));
        }
    }
    Err(CausalError::SingularDesign {
        terms: redundant,
        detail: format!("design of {} columns has rank {}", k, kept.len()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("x{}", i)).collect()
    }

    #[test]
    fn test_ols_recovers_exact_line() {
        let x = DMatrix::from_row_slice(5, 2, &[1.0, 0.0, 1.0, 1.0, 1.0, 2.0, 1.0, 3.0, 1.0, 4.0]);
        let y = DVector::from_vec(vec![1.0, 3.1, 4.9, 7.0, 9.0]);
        let fit = ols(&y, &x, None, &names(2)).unwrap();
        assert!((fit.coefficients[1] - 2.0).abs() < 0.05);
        assert_eq!(fit.df_resid, 3);
        assert!(fit.r_squared > 0.99);
    }

    #[test]
    fn test_zero_weights_reduce_df() {
        let x = DMatrix::from_row_slice(5, 2, &[1.0, 0.0, 1.0, 1.0, 1.0, 2.0, 1.0, 3.0, 1.0, 4.0]);
        let y = DVector::from_vec(vec![1.0, 3.0, 5.0, 7.2, 100.0]);
        let w = DVector::from_vec(vec![1.0, 1.0, 1.0, 1.0, 0.0]);
        let fit = ols(&y, &x, Some(&w), &names(2)).unwrap();
        assert_eq!(fit.df_resid, 2);
        assert!((fit.coefficients[1] - 2.06).abs() < 0.1);
    }

    #[test]
    fn test_collinear_column_is_named() {
        let x = DMatrix::from_row_slice(
            4,
            3,
            &[1.0, 1.0, 2.0, 1.0, 2.0, 4.0, 1.0, 3.0, 6.0, 1.0, 4.0, 8.0],
        );
        let y = DVector::from_vec(vec![1.0, 2.0, 3.0, 5.0]);
        let err = ols(&y, &x, None, &names(3)).unwrap_err();
        match err {
            CausalError::SingularDesign { terms, .. } => assert_eq!(terms, vec!["x2".to_string()]),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
