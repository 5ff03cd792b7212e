use crate::math::ols::ensure_full_rank;
use crate::CausalError;
use nalgebra::{DMatrix, DVector};

pub const MAX_ITER: usize = 100;
pub const TOLERANCE: f64 = 1e-8;
const RIDGE: f64 = 1e-6;

/// Represents the results of a Logistic Regression.
#[derive(Debug, Clone)]
pub struct LogitResult {
    pub coefficients: DVector<f64>,
    /// `Xβ` at the final coefficients.
    pub linear_predictor: DVector<f64>,
    pub converged: bool,
    pub iterations: usize,
}

pub fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

/// Performs Logistic Regression using Newton-Raphson optimization.
///
/// The design is rank-checked first so a collinear term set fails with
/// `SingularDesign` instead of a meaningless fit. When the information
/// matrix loses definiteness along the way (near separation) a small ridge
/// is added to keep the step defined; the fit then usually stops at the
/// iteration cap with `converged == false`.
pub fn logit(
    y: &DVector<f64>,
    x: &DMatrix<f64>,
    names: &[String],
    max_iter: usize,
    tol: f64,
) -> Result<LogitResult, CausalError> {
    ensure_full_rank(x, names)?;
    let k = x.ncols();
    let mut beta = DVector::zeros(k);

    for iter in 0..max_iter {
        let xb = x * &beta;
        let probs: DVector<f64> = xb.map(sigmoid);
        let gradient = x.transpose() * (y - &probs);

        // X'WX with W = diag(p(1-p)), via rows scaled by sqrt(w)
        let sqrt_w: DVector<f64> = probs.map(|p| (p * (1.0 - p)).sqrt());
        let mut x_tilde = x.clone();
        for j in 0..k {
            x_tilde.column_mut(j).component_mul_assign(&sqrt_w);
        }
        let information = x_tilde.transpose() * &x_tilde;

        let step = match information.clone().cholesky() {
            Some(chol) => chol.solve(&gradient),
            None => {
                let ridged = information + DMatrix::identity(k, k) * RIDGE;
                ridged
                    .cholesky()
                    .ok_or_else(|| CausalError::SingularDesign {
                        terms: Vec::new(),
                        detail: "logistic information matrix is not positive definite".to_string(),
                    })?
                    .solve(&gradient)
            }
        };
        beta += &step;

        if step.amax() < tol {
            let linear_predictor = x * &beta;
            return Ok(LogitResult {
                coefficients: beta,
                linear_predictor,
                converged: true,
                iterations: iter + 1,
            });
        }
    }

    let linear_predictor = x * &beta;
    Ok(LogitResult {
        coefficients: beta,
        linear_predictor,
        converged: false,
        iterations: max_iter,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logit_converges_on_overlapping_data() {
        let xs = [-2.0, -1.5, -1.0, -0.5, 0.0, 0.5, 1.0, 1.5, 2.0, 2.5];
        let ys = [0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 1.0];
        let mut data = Vec::new();
        for x in xs {
            data.push(1.0);
            data.push(x);
        }
        let x = DMatrix::from_row_slice(10, 2, &data);
        let y = DVector::from_row_slice(&ys);
        let names = vec!["intercept".to_string(), "x".to_string()];
        let fit = logit(&y, &x, &names, MAX_ITER, TOLERANCE).unwrap();
        assert!(fit.converged);
        assert!(fit.coefficients[1] > 0.0);
        // Score equations hold at the MLE: sum(y - p) = 0.
        let residual_sum: f64 = (0..10)
            .map(|i| ys[i] - sigmoid(fit.linear_predictor[i]))
            .sum();
        assert!(residual_sum.abs() < 1e-6);
    }

    #[test]
    fn test_sigmoid_midpoint() {
        assert_eq!(sigmoid(0.0), 0.5);
    }
}
