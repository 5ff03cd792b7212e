//! Two-period difference-in-differences.
//!
//! Each unit contributes a pre-period row (baseline outcome) and a
//! post-period row (primary outcome). The ATT is the coefficient on
//! `period × treated_group` in
//! `y = α + β₁·period + β₂·treated_group + δ·(period × treated_group) + ε`.
//! Identification rests on parallel trends, which this estimator assumes
//! and does not test.

use crate::effect::{EffectResult, Estimand};
use crate::math::moments::{mean, std_dev};
use crate::math::ols::ols;
use crate::table::{CovariateTable, UnitId};
use crate::CausalError;
use getset::Getters;
use nalgebra::{DMatrix, DVector};
use polars::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{info, warn};

pub const PARALLEL_TRENDS_NOTE: &str = "parallel trends assumed, not tested";

/// One row per unit per period.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LongPanel {
    pub unit: Vec<UnitId>,
    pub treated_group: Vec<bool>,
    /// 0 = pre, 1 = post.
    pub period: Vec<u8>,
    pub outcome: Vec<f64>,
    /// Units without a baseline measurement.
    pub excluded_units: usize,
}

impl LongPanel {
    /// Stacks the baseline column (pre) and the primary outcome (post).
    pub fn from_table(table: &CovariateTable, baseline: &str) -> Result<Self, CausalError> {
        let pre = table.optional(baseline)?;
        let mut panel = Self {
            unit: Vec::with_capacity(2 * table.len()),
            treated_group: Vec::with_capacity(2 * table.len()),
            period: Vec::with_capacity(2 * table.len()),
            outcome: Vec::with_capacity(2 * table.len()),
            excluded_units: 0,
        };
        for i in 0..table.len() {
            let Some(y_pre) = pre[i] else {
                panel.excluded_units += 1;
                continue;
            };
            for (period, y) in [(0u8, y_pre), (1u8, table.outcome()[i])] {
                panel.unit.push(table.ids()[i].clone());
                panel.treated_group.push(table.treated()[i]);
                panel.period.push(period);
                panel.outcome.push(y);
            }
        }
        Ok(panel)
    }

    pub fn len(&self) -> usize {
        self.outcome.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcome.is_empty()
    }

    /// Exports the panel with columns `id`, `treated`, `period`, `outcome`.
    pub fn to_dataframe(&self) -> Result<DataFrame, CausalError> {
        let id_column = if self.unit.iter().all(|u| matches!(u, UnitId::Int(_))) {
            let ints: Vec<i64> = self
                .unit
                .iter()
                .filter_map(|u| match u {
                    UnitId::Int(v) => Some(*v),
                    UnitId::Text(_) => None,
                })
                .collect();
            Column::from(Series::new("id".into(), ints))
        } else {
            let text: Vec<String> = self.unit.iter().map(|u| u.to_string()).collect();
            Column::from(Series::new("id".into(), text))
        };
        let treated: Vec<i32> = self.treated_group.iter().map(|&t| t as i32).collect();
        let period: Vec<i32> = self.period.iter().map(|&p| p as i32).collect();
        let df = DataFrame::new(vec![
            id_column,
            Column::from(Series::new("treated".into(), treated)),
            Column::from(Series::new("period".into(), period)),
            Column::from(Series::new("outcome".into(), self.outcome.clone())),
        ])?;
        Ok(df)
    }

    fn cell(&self, group: bool, period: u8) -> Vec<f64> {
        (0..self.len())
            .filter(|&i| self.treated_group[i] == group && self.period[i] == period)
            .map(|i| self.outcome[i])
            .collect()
    }
}

/// Mean outcome in each group × period cell.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CellMeans {
    pub treated_pre: f64,
    pub treated_post: f64,
    pub control_pre: f64,
    pub control_post: f64,
}

/// Result of the difference-in-differences estimation.
#[derive(Debug, Getters, Clone, PartialEq, Serialize)]
#[getset(get = "pub")]
pub struct DidResult {
    /// The interaction coefficient, labelled ATT.
    effect: EffectResult,
    cell_means: CellMeans,
    /// Unit-clustered (Liang–Zeger) standard error of the interaction.
    cluster_std_error: f64,
    n_units: usize,
    /// Units left out for a missing baseline outcome.
    excluded_units: usize,
}

/// Difference-in-differences estimator on a baseline / follow-up pair.
#[derive(Debug, Clone)]
pub struct DidEstimator {
    baseline: String,
}

impl DidEstimator {
    pub fn new(baseline: &str) -> Self {
        Self {
            baseline: baseline.to_string(),
        }
    }

    pub fn estimate(&self, table: &CovariateTable) -> Result<DidResult, CausalError> {
        let panel = LongPanel::from_table(table, &self.baseline)?;
        if panel.excluded_units > 0 {
            warn!(
                excluded = panel.excluded_units,
                "units without a baseline outcome excluded from DID"
            );
        }
        let n = panel.len();
        let period: Vec<f64> = panel.period.iter().map(|&p| p as f64).collect();
        let group: Vec<f64> = panel.treated_group.iter().map(|&t| if t { 1.0 } else { 0.0 }).collect();
        let mut x = DMatrix::zeros(n, 4);
        for i in 0..n {
            x[(i, 0)] = 1.0;
            x[(i, 1)] = period[i];
            x[(i, 2)] = group[i];
            x[(i, 3)] = period[i] * group[i];
        }
        let names: Vec<String> = ["intercept", "period", "treated_group", "period:treated_group"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let y = DVector::from_column_slice(&panel.outcome);
        let fit = ols(&y, &x, None, &names)?;

        let clusters: Vec<&UnitId> = panel.unit.iter().collect();
        let cluster_std_error = cluster_robust_se(&x, &fit.residuals, &fit.xtx_inv, &clusters)[3];

        let cell_means = CellMeans {
            treated_pre: mean(&panel.cell(true, 0)),
            treated_post: mean(&panel.cell(true, 1)),
            control_pre: mean(&panel.cell(false, 0)),
            control_post: mean(&panel.cell(false, 1)),
        };
        let reference_sd = std_dev(&panel.cell(false, 1));
        let n_units = n / 2;

        let effect = EffectResult::from_coefficient(
            "DID",
            Estimand::Att,
            fit.coefficients[3],
            fit.vcov[(3, 3)].sqrt(),
            fit.df_resid,
            reference_sd,
            n,
        )
        .with_note(PARALLEL_TRENDS_NOTE);
        info!(estimate = fit.coefficients[3], units = n_units, "DID estimation complete");

        Ok(DidResult {
            effect,
            cell_means,
            cluster_std_error,
            n_units,
            excluded_units: panel.excluded_units,
        })
    }
}

/// Liang–Zeger sandwich SEs with the `G/(G-1) · (N-1)/(N-K)` correction.
fn cluster_robust_se(
    x: &DMatrix<f64>,
    residuals: &DVector<f64>,
    xtx_inv: &DMatrix<f64>,
    cluster_ids: &[&UnitId],
) -> Vec<f64> {
    let (n, p) = x.shape();
    let mut clusters: BTreeMap<&UnitId, Vec<usize>> = BTreeMap::new();
    for (i, id) in cluster_ids.iter().enumerate() {
        clusters.entry(*id).or_default().push(i);
    }
    let g = clusters.len() as f64;

    let mut meat = DMatrix::zeros(p, p);
    for rows in clusters.values() {
        let mut score = DVector::zeros(p);
        for &i in rows {
            score += x.row(i).transpose() * residuals[i];
        }
        meat += &score * score.transpose();
    }

    let (n_f, p_f) = (n as f64, p as f64);
    let correction = if g > 1.0 && n_f > p_f {
        (g / (g - 1.0)) * ((n_f - 1.0) / (n_f - p_f))
    } else {
        1.0
    };
    let vcr = xtx_inv * meat * xtx_inv * correction;
    (0..p).map(|j| vcr[(j, j)].max(0.0).sqrt()).collect()
}
