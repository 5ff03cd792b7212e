//! Propensity-score strata over the logit score.
use crate::effect::{EffectEstimator, EffectResult, Estimand, ReferenceSd};
use crate::math::moments::{mean, variance};
use crate::propensity::PropensityScores;
use crate::table::CovariateTable;
use crate::CausalError;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub const DEFAULT_STRATA: usize = 5;

/// How stratum boundaries are placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StratificationMode {
    /// Equal-width bins between the smallest and largest logit. Tail bins
    /// can be empty or nearly so.
    EqualWidth,
    /// Equal-frequency bins at the empirical quantiles. Tied scores always
    /// share a stratum.
    #[default]
    Quantile,
}

/// Moments of one treatment group inside a stratum.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupMoments {
    pub n: usize,
    pub logit_mean: Option<f64>,
    pub logit_variance: Option<f64>,
    pub outcome_mean: Option<f64>,
    pub outcome_variance: Option<f64>,
}

impl GroupMoments {
    fn from_values(logits: &[f64], outcomes: &[f64]) -> Self {
        let finite = |v: f64| v.is_finite().then_some(v);
        Self {
            n: logits.len(),
            logit_mean: finite(mean(logits)),
            logit_variance: finite(variance(logits)),
            outcome_mean: finite(mean(outcomes)),
            outcome_variance: finite(variance(outcomes)),
        }
    }
}

/// Per-stratum diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StratumDiagnostics {
    /// 1-based stratum label.
    pub label: usize,
    /// Logit interval of the stratum.
    pub lower: f64,
    pub upper: f64,
    pub treated: GroupMoments,
    pub control: GroupMoments,
}

impl StratumDiagnostics {
    pub fn size(&self) -> usize {
        self.treated.n + self.control.n
    }

    /// Both treatment groups are present.
    pub fn is_balanced_cell(&self) -> bool {
        self.treated.n > 0 && self.control.n > 0
    }
}

/// Stratum assignment of every unit plus the per-stratum diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Stratification {
    pub mode: StratificationMode,
    /// Stratum label per row of the stratified table.
    pub labels: Vec<usize>,
    /// Diagnostics in label order.
    pub strata: Vec<StratumDiagnostics>,
}

/// Treatment-only effect inside one stratum.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StratumEffect {
    pub label: usize,
    pub n_treated: usize,
    pub n_control: usize,
    /// `None` when the stratum lacks a group or has fewer than three units.
    pub effect: Option<EffectResult>,
}

impl Stratification {
    /// Row indices of one stratum, ascending.
    pub fn rows_in(&self, label: usize) -> Vec<usize> {
        self.labels
            .iter()
            .enumerate()
            .filter_map(|(i, &l)| (l == label).then_some(i))
            .collect()
    }

    /// Per-stratum effect estimates for heterogeneity reporting.
    pub fn stratum_effects(
        &self,
        table: &CovariateTable,
        reference_sd: ReferenceSd,
    ) -> Result<Vec<StratumEffect>, CausalError> {
        self.strata
            .iter()
            .map(|stratum| {
                let effect = if stratum.is_balanced_cell() && stratum.size() >= 3 {
                    let sub = table.subset(&self.rows_in(stratum.label));
                    let mut estimator =
                        EffectEstimator::new(&format!("Stratum {}", stratum.label), Estimand::Ate);
                    estimator.reference_sd(reference_sd);
                    Some(estimator.estimate(&sub, None, None)?)
                } else {
                    None
                };
                Ok(StratumEffect {
                    label: stratum.label,
                    n_treated: stratum.treated.n,
                    n_control: stratum.control.n,
                    effect,
                })
            })
            .collect()
    }
}

/// Partitions units into propensity-score strata.
#[derive(Debug, Clone, Copy)]
pub struct Stratifier {
    n_strata: usize,
    mode: StratificationMode,
}

impl Default for Stratifier {
    fn default() -> Self {
        Self::new(DEFAULT_STRATA, StratificationMode::default())
    }
}

impl Stratifier {
    pub fn new(n_strata: usize, mode: StratificationMode) -> Self {
        Self { n_strata, mode }
    }

    /// Assigns every row of `table` to exactly one stratum.
    pub fn stratify(
        &self,
        table: &CovariateTable,
        scores: &PropensityScores,
    ) -> Result<Stratification, CausalError> {
        if self.n_strata == 0 {
            return Err(CausalError::InvalidInput(
                "number of strata must be at least 1".to_string(),
            ));
        }
        if scores.len() != table.len() || table.is_empty() {
            return Err(CausalError::InvalidInput(format!(
                "{} scores for {} units",
                scores.len(),
                table.len()
            )));
        }
        let logits = &scores.logit;
        let (labels, n_labels) = match self.mode {
            StratificationMode::EqualWidth => (equal_width_labels(logits, self.n_strata), self.n_strata),
            StratificationMode::Quantile => quantile_labels(logits, self.n_strata),
        };
        debug!(mode = ?self.mode, strata = n_labels, "strata assigned");

        let outcome = table.outcome();
        let treated = table.treated();
        let strata: Vec<StratumDiagnostics> = (1..=n_labels)
            .into_par_iter()
            .map(|label| {
                let rows: Vec<usize> = (0..labels.len()).filter(|&i| labels[i] == label).collect();
                let pick = |group: bool| {
                    let group_rows: Vec<usize> =
                        rows.iter().cloned().filter(|&i| treated[i] == group).collect();
                    let z: Vec<f64> = group_rows.iter().map(|&i| logits[i]).collect();
                    let y: Vec<f64> = group_rows.iter().map(|&i| outcome[i]).collect();
                    GroupMoments::from_values(&z, &y)
                };
                let (lower, upper) = match self.mode {
                    StratificationMode::EqualWidth => equal_width_bounds(logits, self.n_strata, label),
                    StratificationMode::Quantile => rows.iter().fold(
                        (f64::INFINITY, f64::NEG_INFINITY),
                        |(lo, hi), &i| (lo.min(logits[i]), hi.max(logits[i])),
                    ),
                };
                StratumDiagnostics {
                    label,
                    lower,
                    upper,
                    treated: pick(true),
                    control: pick(false),
                }
            })
            .collect();

        info!(
            strata = strata.len(),
            empty = strata.iter().filter(|s| s.size() == 0).count(),
            "stratification complete"
        );
        Ok(Stratification {
            mode: self.mode,
            labels,
            strata,
        })
    }
}

fn range(logits: &[f64]) -> (f64, f64) {
    logits
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &z| (lo.min(z), hi.max(z)))
}

fn equal_width_labels(logits: &[f64], n: usize) -> Vec<usize> {
    let (lo, hi) = range(logits);
    let width = (hi - lo) / n as f64;
    logits
        .iter()
        .map(|&z| {
            if width <= 0.0 {
                1
            } else {
                ((((z - lo) / width).floor() as usize).min(n - 1)) + 1
            }
        })
        .collect()
}

fn equal_width_bounds(logits: &[f64], n: usize, label: usize) -> (f64, f64) {
    let (lo, hi) = range(logits);
    let width = (hi - lo) / n as f64;
    (lo + width * (label - 1) as f64, lo + width * label as f64)
}

/// Rank-based labels; a run of tied scores takes the label of its first
/// member. Labels are then renumbered 1..=k without gaps.
fn quantile_labels(logits: &[f64], n: usize) -> (Vec<usize>, usize) {
    let total = logits.len();
    let mut order: Vec<usize> = (0..total).collect();
    order.sort_by(|&a, &b| logits[a].total_cmp(&logits[b]).then(a.cmp(&b)));

    let mut raw = vec![0usize; total];
    let mut prev: Option<(f64, usize)> = None;
    for (rank, &row) in order.iter().enumerate() {
        let label = match prev {
            Some((z, label)) if z == logits[row] => label,
            _ => rank * n / total,
        };
        raw[row] = label;
        prev = Some((logits[row], label));
    }

    let mut used: Vec<usize> = raw.clone();
    used.sort_unstable();
    used.dedup();
    let labels = raw
        .iter()
        .map(|l| used.partition_point(|u| u < l) + 1)
        .collect();
    (labels, used.len())
}
