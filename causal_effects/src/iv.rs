//! Instrumental Variables / Two-Stage Least Squares (2SLS).
//!
//! The treatment indicator is the endogenous regressor. The first stage
//! regresses it on the excluded instruments plus the exogenous covariates;
//! the second stage replaces it with its first-stage fitted value. Three
//! diagnostics are always reported with the point estimate: first-stage
//! instrument strength, a Sargan overidentification test, and a Wu–Hausman
//! endogeneity test against the plain covariate-adjusted OLS estimate.

use crate::effect::{EffectResult, Estimand, ReferenceSd};
use crate::inference::{chi_squared_p_value, f_test_p_value, t_test_p_value};
use crate::math::moments::std_dev;
use crate::math::ols::ols;
use crate::table::CovariateTable;
use crate::terms::TermSet;
use crate::CausalError;
use getset::Getters;
use nalgebra::{DMatrix, DVector};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Conventional weak-instrument threshold on the first-stage F.
pub const WEAK_INSTRUMENT_F: f64 = 10.0;

/// First-stage strength of the excluded instruments.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FirstStage {
    /// Joint F of the excluded instruments.
    pub f_statistic: f64,
    pub df_numerator: usize,
    pub df_denominator: usize,
    pub p_value: f64,
    pub r_squared: f64,
    /// Share of the restricted residual variance the instruments explain.
    pub partial_r_squared: f64,
    pub threshold: f64,
    /// `f_statistic < threshold`.
    pub weak: bool,
}

/// A model diagnostic test. `statistic` is `None` when the test is not
/// computable for the model (e.g. overidentification with one instrument).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticTest {
    pub name: String,
    pub statistic: Option<f64>,
    pub df: usize,
    pub df_denominator: Option<usize>,
    pub p_value: Option<f64>,
    pub note: Option<String>,
}

/// Result of a 2SLS estimation.
#[derive(Debug, Getters, Clone, PartialEq, Serialize)]
#[getset(get = "pub")]
pub struct IvResult {
    /// The 2SLS treatment coefficient, labelled as a local effect.
    effect: EffectResult,
    first_stage: FirstStage,
    /// Sargan test of the overidentifying restrictions.
    overidentification: DiagnosticTest,
    /// Wu–Hausman control-function test.
    endogeneity: DiagnosticTest,
    /// Covariate-adjusted OLS treatment coefficient, for comparison.
    ols_estimate: f64,
    ols_std_error: f64,
    instruments: Vec<String>,
    /// Rows left out because an instrument value was missing.
    excluded_rows: usize,
}

/// Two-Stage Least Squares (2SLS) estimator.
#[derive(Debug, Clone)]
pub struct IvEstimator {
    instruments: Vec<String>,
    covariates: TermSet,
    weak_threshold: f64,
    reference_sd: ReferenceSd,
}

impl IvEstimator {
    pub fn new(instruments: &[String]) -> Self {
        Self {
            instruments: instruments.to_vec(),
            covariates: TermSet::default(),
            weak_threshold: WEAK_INSTRUMENT_F,
            reference_sd: ReferenceSd::default(),
        }
    }

    /// Sets the exogenous covariates used in both stages.
    pub fn covariates(&mut self, terms: &TermSet) -> &mut Self {
        self.covariates = terms.clone();
        self
    }

    pub fn weak_instrument_threshold(&mut self, threshold: f64) -> &mut Self {
        self.weak_threshold = threshold;
        self
    }

    pub fn reference_sd(&mut self, reference_sd: ReferenceSd) -> &mut Self {
        self.reference_sd = reference_sd;
        self
    }

    pub fn estimate(&self, table: &CovariateTable) -> Result<IvResult, CausalError> {
        if self.instruments.is_empty() {
            return Err(CausalError::InvalidInput(
                "IV estimation needs at least one instrument".to_string(),
            ));
        }

        // Complete cases on the instruments.
        let mut instrument_cols = Vec::with_capacity(self.instruments.len());
        for name in &self.instruments {
            instrument_cols.push(table.optional(name)?);
        }
        let rows: Vec<usize> = (0..table.len())
            .filter(|&i| instrument_cols.iter().all(|col| col[i].is_some()))
            .collect();
        let excluded_rows = table.len() - rows.len();
        if excluded_rows > 0 {
            warn!(excluded = excluded_rows, "rows with a missing instrument excluded from IV");
        }
        let sub = table.subset(&rows);
        let n = sub.len();
        let m = self.instruments.len();
        let z: Vec<Vec<f64>> = instrument_cols
            .iter()
            .map(|col| rows.iter().filter_map(|&i| col[i]).collect())
            .collect();

        let d = DVector::from_vec(sub.treatment_values());
        let y = DVector::from_column_slice(sub.outcome());
        let exog = self.covariates.expand(&sub)?;
        let (w_mat, w_names) = exog.to_matrix(n, &[("intercept", vec![1.0; n])]);

        // ---- First stage: D on [W | Z] vs. D on W ----
        let mut z_names = w_names.clone();
        z_names.extend(self.instruments.iter().cloned());
        let z_full = hstack(&w_mat, &z);
        let unrestricted = ols(&d, &z_full, None, &z_names)?;
        let restricted = ols(&d, &w_mat, None, &w_names)?;
        let df_den = unrestricted.df_resid;
        let f_statistic = if unrestricted.rss > 0.0 {
            ((restricted.rss - unrestricted.rss) / m as f64) / (unrestricted.rss / df_den as f64)
        } else {
            f64::INFINITY
        };
        let partial_r_squared = if restricted.rss > 0.0 {
            (restricted.rss - unrestricted.rss) / restricted.rss
        } else {
            0.0
        };
        let weak = f_statistic < self.weak_threshold;
        let first_stage = FirstStage {
            f_statistic,
            df_numerator: m,
            df_denominator: df_den,
            p_value: if f_statistic.is_finite() {
                f_test_p_value(f_statistic, m as f64, df_den as f64)
            } else {
                0.0
            },
            r_squared: unrestricted.r_squared,
            partial_r_squared,
            threshold: self.weak_threshold,
            weak,
        };
        debug!(f_statistic, partial_r_squared, "IV first stage");
        if weak {
            warn!(
                f_statistic,
                threshold = self.weak_threshold,
                "weak instrument: first-stage F below threshold"
            );
        }

        // ---- Second stage: y on [1, D_hat, W_rest] ----
        let d_hat = unrestricted.fitted.clone();
        let x_hat = with_treatment(&w_mat, &d_hat);
        let x_orig = with_treatment(&w_mat, &d);
        let mut x_names = vec!["intercept".to_string(), "treatment".to_string()];
        x_names.extend(w_names.iter().skip(1).cloned());
        let second = ols(&y, &x_hat, None, &x_names)?;
        let beta = second.coefficients.clone();
        // Residuals use the observed treatment, not its fitted value.
        let residuals = &y - &x_orig * &beta;
        let k = x_hat.ncols();
        let df_resid = n - k;
        let rss: f64 = residuals.iter().map(|e| e * e).sum();
        let sigma_squared = rss / df_resid as f64;
        let std_error = (sigma_squared * second.xtx_inv[(1, 1)]).max(0.0).sqrt();

        let reference_sd = match self.reference_sd {
            ReferenceSd::ControlOutcome => {
                let control: Vec<f64> = (0..n)
                    .filter(|&i| !sub.treated()[i])
                    .map(|i| sub.outcome()[i])
                    .collect();
                std_dev(&control)
            }
            ReferenceSd::Residual => sigma_squared.sqrt(),
            ReferenceSd::Fixed(sd) => sd,
        };
        let mut effect = EffectResult::from_coefficient(
            "IV",
            Estimand::Late,
            beta[1],
            std_error,
            df_resid,
            reference_sd,
            n,
        )
        .with_note("two-stage least squares");
        if weak {
            effect = effect.with_note("weak instrument: estimate is low-confidence");
        }

        // ---- Sargan: n R^2 of 2SLS residuals on all exogenous variables ----
        let overidentification = if m > 1 {
            let aux = ols(&residuals, &z_full, None, &z_names)?;
            let statistic = n as f64 * aux.r_squared;
            DiagnosticTest {
                name: "Sargan".to_string(),
                statistic: Some(statistic),
                df: m - 1,
                df_denominator: None,
                p_value: Some(chi_squared_p_value(statistic, (m - 1) as f64)),
                note: None,
            }
        } else {
            DiagnosticTest {
                name: "Sargan".to_string(),
                statistic: None,
                df: 0,
                df_denominator: None,
                p_value: None,
                note: Some("exactly identified: one instrument, no overidentifying restriction".to_string()),
            }
        };

        // ---- Wu–Hausman: add first-stage residual to the OLS equation ----
        let plain = ols(&y, &x_orig, None, &x_names)?;
        let v_hat = &d - &d_hat;
        let mut cf_names = x_names.clone();
        cf_names.push("first_stage_residual".to_string());
        let x_cf = hstack(&x_orig, &[v_hat.iter().cloned().collect()]);
        let cf = ols(&y, &x_cf, None, &cf_names)?;
        let j = x_cf.ncols() - 1;
        let t = cf.coefficients[j] / cf.vcov[(j, j)].sqrt();
        let endogeneity = DiagnosticTest {
            name: "Wu-Hausman".to_string(),
            statistic: Some(t * t),
            df: 1,
            df_denominator: Some(cf.df_resid),
            p_value: Some(t_test_p_value(t, cf.df_resid as f64)),
            note: None,
        };

        info!(
            estimate = beta[1],
            f_statistic,
            units = n,
            "IV estimation complete"
        );
        Ok(IvResult {
            effect,
            first_stage,
            overidentification,
            endogeneity,
            ols_estimate: plain.coefficients[1],
            ols_std_error: plain.vcov[(1, 1)].sqrt(),
            instruments: self.instruments.clone(),
            excluded_rows,
        })
    }
}

/// `[x | extra columns]`.
fn hstack(x: &DMatrix<f64>, extra: &[Vec<f64>]) -> DMatrix<f64> {
    let (n, k) = x.shape();
    let mut out = DMatrix::zeros(n, k + extra.len());
    out.view_mut((0, 0), (n, k)).copy_from(x);
    for (j, col) in extra.iter().enumerate() {
        for i in 0..n {
            out[(i, k + j)] = col[i];
        }
    }
    out
}

/// `[intercept, treatment, remaining W columns]`; `w` starts with the intercept.
fn with_treatment(w: &DMatrix<f64>, treatment: &DVector<f64>) -> DMatrix<f64> {
    let (n, kw) = w.shape();
    let mut out = DMatrix::zeros(n, kw + 1);
    out.column_mut(0).copy_from(&w.column(0));
    out.column_mut(1).copy_from(treatment);
    for j in 1..kw {
        out.column_mut(j + 1).copy_from(&w.column(j));
    }
    out
}
