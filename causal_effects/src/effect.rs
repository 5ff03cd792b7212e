//! Regression-based effect estimation and the shared result record.
use crate::inference::{t_test_p_value, BootstrapSummary};
use crate::math::moments::std_dev;
use crate::math::ols::{ols, OlsResult};
use crate::table::CovariateTable;
use crate::terms::TermSet;
use crate::CausalError;
use getset::Getters;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

/// The population an estimate refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Estimand {
    /// Average treatment effect on the treated.
    #[serde(rename = "ATT")]
    Att,
    /// Average treatment effect.
    #[serde(rename = "ATE")]
    Ate,
    /// Local average treatment effect (compliers).
    #[serde(rename = "LATE")]
    Late,
}

impl fmt::Display for Estimand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Estimand::Att => "ATT",
            Estimand::Ate => "ATE",
            Estimand::Late => "LATE",
        })
    }
}

/// Denominator of the standardized effect size.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceSd {
    /// SD of the outcome among control units of the analysed sample.
    #[default]
    ControlOutcome,
    /// Residual SD of the fitted regression.
    Residual,
    /// A caller-supplied value.
    Fixed(f64),
}

/// Result of one effect estimation call. Immutable once produced.
#[derive(Debug, Getters, Clone, PartialEq, Serialize)]
#[getset(get = "pub")]
pub struct EffectResult {
    method: String,
    estimand: Estimand,
    estimate: f64,
    std_error: f64,
    /// `estimate / std_error`.
    statistic: f64,
    /// Two-sided p-value from Student's t with `df_resid` degrees of freedom.
    p_value: f64,
    /// `estimate / reference_sd`.
    effect_size: f64,
    reference_sd: f64,
    n_obs: usize,
    df_resid: usize,
    notes: Vec<String>,
    bootstrap: Option<BootstrapSummary>,
}

impl EffectResult {
    pub(crate) fn from_coefficient(
        method: &str,
        estimand: Estimand,
        estimate: f64,
        std_error: f64,
        df_resid: usize,
        reference_sd: f64,
        n_obs: usize,
    ) -> Self {
        let statistic = estimate / std_error;
        Self {
            method: method.to_string(),
            estimand,
            estimate,
            std_error,
            statistic,
            p_value: t_test_p_value(statistic, df_resid as f64),
            effect_size: if reference_sd > 0.0 {
                estimate / reference_sd
            } else {
                f64::NAN
            },
            reference_sd,
            n_obs,
            df_resid,
            notes: Vec::new(),
            bootstrap: None,
        }
    }

    pub(crate) fn with_note(mut self, note: &str) -> Self {
        self.notes.push(note.to_string());
        self
    }

    pub(crate) fn with_bootstrap(mut self, summary: BootstrapSummary) -> Self {
        self.bootstrap = Some(summary);
        self
    }
}

/// Fits `outcome ~ 1 + treatment + terms [+ stratum dummies]`, optionally
/// weighted, and reports the treatment coefficient.
#[derive(Debug, Clone)]
pub struct EffectEstimator {
    method: String,
    estimand: Estimand,
    adjustment: TermSet,
    reference_sd: ReferenceSd,
}

impl EffectEstimator {
    pub fn new(method: &str, estimand: Estimand) -> Self {
        Self {
            method: method.to_string(),
            estimand,
            adjustment: TermSet::default(),
            reference_sd: ReferenceSd::default(),
        }
    }

    /// Sets the covariate adjustment set.
    pub fn adjust_for(&mut self, terms: &TermSet) -> &mut Self {
        self.adjustment = terms.clone();
        self
    }

    /// Sets the denominator of the standardized effect size.
    pub fn reference_sd(&mut self, reference_sd: ReferenceSd) -> &mut Self {
        self.reference_sd = reference_sd;
        self
    }

    /// Estimates the effect on `table`.
    ///
    /// `weights` are row weights (uniform when `None`); a zero weight drops
    /// the row. `strata` adds one indicator per stratum label beyond the
    /// first and fails with `SingularDesign` naming any stratum where only
    /// one treatment level has positive weight.
    pub fn estimate(
        &self,
        table: &CovariateTable,
        weights: Option<&[f64]>,
        strata: Option<&[usize]>,
    ) -> Result<EffectResult, CausalError> {
        let n = table.len();
        if weights.is_some_and(|w| w.len() != n) || strata.is_some_and(|s| s.len() != n) {
            return Err(CausalError::InvalidInput(format!(
                "weights or strata are not aligned with the {} analysed units",
                n
            )));
        }
        let w: Vec<f64> = weights.map_or_else(|| vec![1.0; n], <[f64]>::to_vec);
        let treatment = table.treatment_values();

        let mut design = self.adjustment.expand(table)?;
        if let Some(labels) = strata {
            check_strata(labels, table.treated(), &w)?;
            let mut levels: Vec<usize> = labels.to_vec();
            levels.sort_unstable();
            levels.dedup();
            for level in levels.into_iter().skip(1) {
                design.names.push(format!("stratum_{}", level));
                design.columns.push(
                    labels
                        .iter()
                        .map(|&l| if l == level { 1.0 } else { 0.0 })
                        .collect(),
                );
            }
        }

        let (x, names) = design.to_matrix(n, &[("intercept", vec![1.0; n]), ("treatment", treatment)]);
        debug!(method = %self.method, rows = n, columns = names.len(), "fitting effect regression");
        let fit = self.fit(&x, table.outcome(), &w, &names)?;

        let estimate = fit.coefficients[1];
        let std_error = fit.vcov[(1, 1)].sqrt();
        let reference_sd = match self.reference_sd {
            ReferenceSd::ControlOutcome => {
                let control: Vec<f64> = (0..n)
                    .filter(|&i| !table.treated()[i] && w[i] > 0.0)
                    .map(|i| table.outcome()[i])
                    .collect();
                std_dev(&control)
            }
            ReferenceSd::Residual => fit.sigma_squared.sqrt(),
            ReferenceSd::Fixed(sd) => sd,
        };
        let n_obs = w.iter().filter(|&&v| v > 0.0).count();

        let mut result = EffectResult::from_coefficient(
            &self.method,
            self.estimand,
            estimate,
            std_error,
            fit.df_resid,
            reference_sd,
            n_obs,
        );
        if strata.is_some() {
            result = result.with_note("stratum indicators included");
        }
        Ok(result)
    }

    fn fit(
        &self,
        x: &DMatrix<f64>,
        y: &[f64],
        w: &[f64],
        names: &[String],
    ) -> Result<OlsResult, CausalError> {
        let y = DVector::from_column_slice(y);
        let w = DVector::from_column_slice(w);
        ols(&y, x, Some(&w), names)
    }
}

fn check_strata(labels: &[usize], treated: &[bool], w: &[f64]) -> Result<(), CausalError> {
    let mut cells: BTreeMap<usize, (usize, usize)> = BTreeMap::new();
    for ((&label, &t), &wi) in labels.iter().zip(treated).zip(w) {
        if wi <= 0.0 {
            continue;
        }
        let cell = cells.entry(label).or_default();
        if t {
            cell.0 += 1;
        } else {
            cell.1 += 1;
        }
    }
    let bad: Vec<(usize, &str)> = cells
        .iter()
        .filter_map(|(&label, &(n_t, n_c))| match (n_t, n_c) {
            (0, _) => Some((label, "control")),
            (_, 0) => Some((label, "treated")),
            _ => None,
        })
        .collect();
    if bad.is_empty() {
        return Ok(());
    }
    Err(CausalError::SingularDesign {
        terms: bad.iter().map(|(l, _)| format!("stratum_{}", l)).collect(),
        detail: bad
            .iter()
            .map(|(l, group)| format!("stratum {} contains only {} units", l, group))
            .collect::<Vec<_>>()
            .join("; "),
    })
}
