//! Inverse-probability and marginal mean weights.
use crate::propensity::PropensityScores;
use crate::table::CovariateTable;
use crate::{CausalError, DegenerateUnits};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Row-aligned unit weights. `None` marks a unit whose weight is undefined
/// and which is therefore excluded from the weighted analysis.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitWeights {
    pub method: String,
    pub weights: Vec<Option<f64>>,
    /// Units given an undefined weight, if any.
    pub degenerate: Option<DegenerateUnits>,
}

impl UnitWeights {
    /// Rows with a defined weight, ascending.
    pub fn used_rows(&self) -> Vec<usize> {
        self.weights
            .iter()
            .enumerate()
            .filter_map(|(i, w)| w.map(|_| i))
            .collect()
    }

    /// Defined weights, aligned with [`UnitWeights::used_rows`].
    pub fn used_weights(&self) -> Vec<f64> {
        self.weights.iter().filter_map(|w| *w).collect()
    }

    pub fn excluded_count(&self) -> usize {
        self.degenerate.as_ref().map_or(0, DegenerateUnits::count)
    }

    /// Sum of defined weights for one group.
    pub fn group_sum(&self, treated: &[bool], group: bool) -> f64 {
        self.weights
            .iter()
            .zip(treated)
            .filter(|(_, &t)| t == group)
            .filter_map(|(w, _)| *w)
            .sum()
    }
}

/// IPTW weights for the ATE.
///
/// Treated units get `r / p`, controls `(1 - r) / (1 - p)`, where `r` is
/// the treated share of `table`. A probability of exactly 0 or 1 (or outside
/// the unit interval) is a hard error listing every affected unit.
pub fn iptw_weights(
    table: &CovariateTable,
    scores: &PropensityScores,
) -> Result<UnitWeights, CausalError> {
    if scores.len() != table.len() {
        return Err(CausalError::InvalidInput(format!(
            "{} scores for {} units",
            scores.len(),
            table.len()
        )));
    }
    let bad: Vec<_> = scores
        .probability
        .iter()
        .enumerate()
        .filter(|(_, &p)| !(p > 0.0 && p < 1.0))
        .map(|(i, _)| table.ids()[i].clone())
        .collect();
    if !bad.is_empty() {
        return Err(CausalError::DegenerateWeight(DegenerateUnits {
            method: "IPTW".to_string(),
            units: bad,
            strata: Vec::new(),
        }));
    }

    let rate = table.n_treated() as f64 / table.len() as f64;
    let weights = scores
        .probability
        .iter()
        .zip(table.treated())
        .map(|(&p, &t)| Some(if t { rate / p } else { (1.0 - rate) / (1.0 - p) }))
        .collect();
    info!(units = table.len(), treated_share = rate, "IPTW weights computed");
    Ok(UnitWeights {
        method: "IPTW".to_string(),
        weights,
        degenerate: None,
    })
}

/// Marginal mean weights through propensity-score strata.
///
/// Within stratum `s`, treated units get `n_s / n_treated_s` and controls
/// `n_s / n_control_s`. A stratum lacking one group gives all of its units an
/// undefined weight; they are listed in [`UnitWeights::degenerate`].
pub fn mmws_weights(table: &CovariateTable, labels: &[usize]) -> Result<UnitWeights, CausalError> {
    if labels.len() != table.len() {
        return Err(CausalError::InvalidInput(format!(
            "{} stratum labels for {} units",
            labels.len(),
            table.len()
        )));
    }
    // label -> (size, treated count)
    let mut cells: BTreeMap<usize, (usize, usize)> = BTreeMap::new();
    for (&label, &t) in labels.iter().zip(table.treated()) {
        let cell = cells.entry(label).or_default();
        cell.0 += 1;
        if t {
            cell.1 += 1;
        }
    }

    let mut excluded = Vec::new();
    let mut weights = Vec::with_capacity(table.len());
    for (i, (&label, &t)) in labels.iter().zip(table.treated()).enumerate() {
        let (size, n_t) = cells[&label];
        let n_c = size - n_t;
        if n_t == 0 || n_c == 0 {
            excluded.push(i);
            weights.push(None);
        } else {
            let group = if t { n_t } else { n_c };
            weights.push(Some(size as f64 / group as f64));
        }
    }

    let degenerate = if excluded.is_empty() {
        None
    } else {
        let strata: Vec<usize> = cells
            .iter()
            .filter(|(_, (size, n_t))| *n_t == 0 || *n_t == *size)
            .map(|(&label, _)| label)
            .collect();
        let units = excluded.iter().map(|&i| table.ids()[i].clone()).collect();
        let info = DegenerateUnits {
            method: "MMWS".to_string(),
            units,
            strata,
        };
        warn!(excluded = info.count(), strata = ?info.strata, "strata lacking one group excluded from MMWS");
        Some(info)
    };

    Ok(UnitWeights {
        method: "MMWS".to_string(),
        weights,
        degenerate,
    })
}
