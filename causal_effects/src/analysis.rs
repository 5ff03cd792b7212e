//! End-to-end analysis: one cleaned table, five effect estimates.
use crate::balance::{BalanceDiagnostics, BalanceTable};
use crate::did::{DidEstimator, DidResult};
use crate::effect::{EffectEstimator, EffectResult, Estimand, ReferenceSd};
use crate::inference::bootstrap_pair_differences;
use crate::iv::{IvEstimator, IvResult, WEAK_INSTRUMENT_F};
use crate::matching::engine::{MatchScale, MatchedSample, MatchingEngine};
use crate::propensity::{PropensityModel, PropensityScores};
use crate::stratify::{StratificationMode, Stratification, Stratifier, StratumEffect, DEFAULT_STRATA};
use crate::support::{CommonSupport, DEFAULT_CALIPER};
use crate::table::{ColumnRoles, CovariateTable};
use crate::terms::{screen_interactions, InteractionCandidate, TermSet, DEFAULT_INTERACTION_TOLERANCE};
use crate::weighting::{iptw_weights, mmws_weights, UnitWeights};
use crate::{AnalysisWarning, CausalError};
use getset::Getters;
use polars::prelude::DataFrame;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Tunable settings of an analysis. Every field has a default, so a JSON
/// file only needs the keys it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Caliper as a fraction of the logit-score SD.
    pub caliper: f64,
    pub n_strata: usize,
    pub stratification: StratificationMode,
    pub match_scale: MatchScale,
    pub weak_instrument_threshold: f64,
    pub reference_sd: ReferenceSd,
    /// Tolerance on `|cov ratio - 1|` for interaction screening.
    pub interaction_tolerance: f64,
    /// Matched-pair bootstrap replicates; 0 disables the bootstrap.
    pub bootstrap_reps: usize,
    pub seed: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            caliper: DEFAULT_CALIPER,
            n_strata: DEFAULT_STRATA,
            stratification: StratificationMode::default(),
            match_scale: MatchScale::default(),
            weak_instrument_threshold: WEAK_INSTRUMENT_F,
            reference_sd: ReferenceSd::default(),
            interaction_tolerance: DEFAULT_INTERACTION_TOLERANCE,
            bootstrap_reps: 0,
            seed: 42,
        }
    }
}

/// Builder for a full treatment-effect analysis.
#[derive(Debug, Clone)]
pub struct CausalAnalysis {
    dataframe: DataFrame,
    roles: ColumnRoles,
    interactions: Vec<(String, String)>,
    config: AnalysisConfig,
}

impl CausalAnalysis {
    /// Creates a new `CausalAnalysis`.
    ///
    /// # Arguments
    ///
    /// * `dataframe` - A cleaned `polars::DataFrame`, one row per unit.
    /// * `roles` - The explicit column-to-role mapping.
    pub fn new(dataframe: DataFrame, roles: ColumnRoles) -> Self {
        Self {
            dataframe,
            roles,
            interactions: Vec::new(),
            config: AnalysisConfig::default(),
        }
    }

    /// Declares pairwise interaction terms for the propensity and outcome models.
    pub fn interactions(&mut self, pairs: &[(&str, &str)]) -> &mut Self {
        self.interactions = pairs
            .iter()
            .map(|(a, b)| (a.to_string(), b.to_string()))
            .collect();
        self
    }

    /// Replaces the whole configuration.
    pub fn config(&mut self, config: AnalysisConfig) -> &mut Self {
        self.config = config;
        self
    }

    /// Sets the caliper. Defaults to 0.2.
    pub fn caliper(&mut self, caliper: f64) -> &mut Self {
        self.config.caliper = caliper;
        self
    }

    /// Sets the number of propensity-score strata. Defaults to 5.
    pub fn strata(&mut self, n_strata: usize) -> &mut Self {
        self.config.n_strata = n_strata;
        self
    }

    pub fn stratification(&mut self, mode: StratificationMode) -> &mut Self {
        self.config.stratification = mode;
        self
    }

    pub fn match_scale(&mut self, scale: MatchScale) -> &mut Self {
        self.config.match_scale = scale;
        self
    }

    /// Sets the number of matched-pair bootstrap replications. Defaults to 0 (off).
    pub fn bootstrap_reps(&mut self, reps: usize) -> &mut Self {
        self.config.bootstrap_reps = reps;
        self
    }

    pub fn seed(&mut self, seed: u64) -> &mut Self {
        self.config.seed = seed;
        self
    }

    pub fn reference_sd(&mut self, reference_sd: ReferenceSd) -> &mut Self {
        self.config.reference_sd = reference_sd;
        self
    }

    pub fn weak_instrument_threshold(&mut self, threshold: f64) -> &mut Self {
        self.config.weak_instrument_threshold = threshold;
        self
    }

    pub fn interaction_tolerance(&mut self, tolerance: f64) -> &mut Self {
        self.config.interaction_tolerance = tolerance;
        self
    }

    /// Runs the full pipeline.
    ///
    /// Table → propensity model → common support → {matching, IPTW,
    /// stratification + MMWS} with balance diagnostics for each, then IV and
    /// DID on the full table when their columns are configured.
    ///
    /// Errors in the shared stages are returned. An error inside one method
    /// is recorded as [`AnalysisWarning::MethodFailed`] and that method is
    /// left out of the results.
    pub fn run(&self) -> Result<AnalysisResults, CausalError> {
        let cfg = &self.config;
        let mut warnings = Vec::new();

        let table = CovariateTable::from_dataframe(&self.dataframe, &self.roles)?;
        if table.dropped_rows() > 0 {
            push_warning(
                &mut warnings,
                AnalysisWarning::RowsDropped {
                    reason: "missing treatment, outcome or covariate".to_string(),
                    count: table.dropped_rows(),
                },
            );
        }

        let terms = TermSet::from_table(&table, &self.interactions);
        terms.validate(&table)?;
        let screening = screen_interactions(&table, &self.roles.covariates, cfg.interaction_tolerance)?;

        // ---- Propensity model and common support ----
        let propensity = PropensityModel::fit(&table, &terms)?;
        if !propensity.converged() {
            push_warning(
                &mut warnings,
                AnalysisWarning::PropensityNotConverged {
                    iterations: propensity.iterations(),
                },
            );
        }
        let scores = propensity.score(&table)?;
        let support = CommonSupport::compute(&scores.logit, table.treated(), cfg.caliper)?;
        let retained_rows = support.retained_rows();

        let balance = BalanceDiagnostics::new(&table, &terms)?;
        let balance_unadjusted = balance.unadjusted(&retained_rows)?;

        let sample = SupportSample {
            table: table.subset(&retained_rows),
            scores: scores.subset(&retained_rows),
            rows: retained_rows,
            terms: &terms,
            balance: &balance,
        };

        let psm = attempt(&mut warnings, "PSM", |w| self.run_psm(&sample, w));
        let iptw = attempt(&mut warnings, "IPTW", |_| self.run_iptw(&sample));
        let mmws = attempt(&mut warnings, "MMWS", |w| self.run_mmws(&sample, w));

        let iv = if self.roles.instruments.is_empty() {
            push_warning(
                &mut warnings,
                AnalysisWarning::MethodSkipped {
                    method: "IV".to_string(),
                    reason: "no instrument column configured".to_string(),
                },
            );
            None
        } else {
            attempt(&mut warnings, "IV", |w| self.run_iv(&table, &terms, w))
        };

        let did = match &self.roles.baseline_outcome {
            None => {
                push_warning(
                    &mut warnings,
                    AnalysisWarning::MethodSkipped {
                        method: "DID".to_string(),
                        reason: "no baseline outcome column configured".to_string(),
                    },
                );
                None
            }
            Some(baseline) => attempt(&mut warnings, "DID", |w| run_did(&table, baseline, w)),
        };

        info!(
            units = table.len(),
            retained = sample.table.len(),
            pairs = psm.as_ref().map_or(0, |p| p.matched.pairs.len()),
            strata = mmws.as_ref().map_or(0, |m| m.stratification.strata.len()),
            warnings = warnings.len(),
            "analysis complete"
        );

        Ok(AnalysisResults {
            config: cfg.clone(),
            n_units: table.len(),
            n_treated: table.n_treated(),
            n_control: table.n_control(),
            dropped_rows: table.dropped_rows(),
            screening,
            propensity,
            support,
            balance_unadjusted,
            psm,
            iptw,
            mmws,
            iv,
            did,
            warnings,
        })
    }

    fn estimator(&self, method: &str, estimand: Estimand, terms: &TermSet) -> EffectEstimator {
        let mut estimator = EffectEstimator::new(method, estimand);
        estimator.adjust_for(terms).reference_sd(self.config.reference_sd);
        estimator
    }

    /// Matched ATT on the common-support sample.
    fn run_psm(
        &self,
        sample: &SupportSample,
        warnings: &mut Vec<AnalysisWarning>,
    ) -> Result<PsmAnalysis, CausalError> {
        let cfg = &self.config;
        let matched = MatchingEngine::new(cfg.match_scale).match_units(&sample.table, &sample.scores)?;
        if matched.unmatched_count() > 0 {
            push_warning(
                warnings,
                AnalysisWarning::UnmatchedTreated {
                    count: matched.unmatched_count(),
                },
            );
        }
        let matched_table = sample.table.subset(&matched.rows);
        let mut effect = self
            .estimator("PSM", Estimand::Att, sample.terms)
            .estimate(&matched_table, None, None)?;
        if cfg.bootstrap_reps > 0 {
            let diffs = matched.pair_differences(&sample.table);
            effect = effect.with_bootstrap(bootstrap_pair_differences(&diffs, cfg.bootstrap_reps, cfg.seed));
        }
        let balance = sample.balance.matched(&sample.to_full(&matched.rows))?;
        Ok(PsmAnalysis {
            effect,
            matched,
            balance,
        })
    }

    fn run_iptw(&self, sample: &SupportSample) -> Result<IptwAnalysis, CausalError> {
        let weights = iptw_weights(&sample.table, &sample.scores)?;
        let used = weights.used_weights();
        let effect = self
            .estimator("IPTW", Estimand::Ate, sample.terms)
            .estimate(&sample.table, Some(&used), None)?;
        let balance = sample
            .balance
            .weighted("IPTW", &sample.to_full(&weights.used_rows()), &used)?;
        Ok(IptwAnalysis {
            effect,
            weights,
            balance,
        })
    }

    fn run_mmws(
        &self,
        sample: &SupportSample,
        warnings: &mut Vec<AnalysisWarning>,
    ) -> Result<MmwsAnalysis, CausalError> {
        let cfg = &self.config;
        let stratification = Stratifier::new(cfg.n_strata, cfg.stratification)
            .stratify(&sample.table, &sample.scores)?;
        let weights = mmws_weights(&sample.table, &stratification.labels)?;
        if let Some(units) = &weights.degenerate {
            push_warning(warnings, AnalysisWarning::DegenerateStrata(units.clone()));
        }
        let rows = weights.used_rows();
        let used = weights.used_weights();
        let mmws_table = sample.table.subset(&rows);
        let labels: Vec<usize> = rows.iter().map(|&r| stratification.labels[r]).collect();
        let effect = self
            .estimator("MMWS", Estimand::Ate, sample.terms)
            .estimate(&mmws_table, Some(&used), Some(&labels))?;
        let balance = sample.balance.weighted("MMWS", &sample.to_full(&rows), &used)?;
        let all_rows: Vec<usize> = (0..sample.table.len()).collect();
        let stratified_balance = sample
            .balance
            .stratified(&sample.to_full(&all_rows), &stratification.labels)?;
        let stratum_balance = sample
            .balance
            .per_stratum(&sample.to_full(&all_rows), &stratification.labels)?;
        let stratum_effects = stratification.stratum_effects(&sample.table, cfg.reference_sd)?;
        Ok(MmwsAnalysis {
            effect,
            stratification,
            weights,
            balance,
            stratified_balance,
            stratum_balance,
            stratum_effects,
        })
    }

    fn run_iv(
        &self,
        table: &CovariateTable,
        terms: &TermSet,
        warnings: &mut Vec<AnalysisWarning>,
    ) -> Result<IvResult, CausalError> {
        let cfg = &self.config;
        let mut estimator = IvEstimator::new(&self.roles.instruments);
        estimator
            .covariates(terms)
            .weak_instrument_threshold(cfg.weak_instrument_threshold)
            .reference_sd(cfg.reference_sd);
        let result = estimator.estimate(table)?;
        if *result.excluded_rows() > 0 {
            push_warning(
                warnings,
                AnalysisWarning::RowsDropped {
                    reason: "missing instrument (IV)".to_string(),
                    count: *result.excluded_rows(),
                },
            );
        }
        if result.first_stage().weak {
            push_warning(
                warnings,
                AnalysisWarning::WeakInstrument {
                    f_statistic: result.first_stage().f_statistic,
                    threshold: cfg.weak_instrument_threshold,
                },
            );
        }
        Ok(result)
    }
}

fn run_did(
    table: &CovariateTable,
    baseline: &str,
    warnings: &mut Vec<AnalysisWarning>,
) -> Result<DidResult, CausalError> {
    let result = DidEstimator::new(baseline).estimate(table)?;
    if *result.excluded_units() > 0 {
        push_warning(
            warnings,
            AnalysisWarning::RowsDropped {
                reason: "missing baseline outcome (DID)".to_string(),
                count: *result.excluded_units(),
            },
        );
    }
    Ok(result)
}

/// Common-support subset shared by PSM, IPTW and MMWS.
struct SupportSample<'a> {
    table: CovariateTable,
    scores: PropensityScores,
    /// Full-table row of each retained row.
    rows: Vec<usize>,
    terms: &'a TermSet,
    balance: &'a BalanceDiagnostics,
}

impl SupportSample<'_> {
    fn to_full(&self, rows: &[usize]) -> Vec<usize> {
        rows.iter().map(|&r| self.rows[r]).collect()
    }
}

fn push_warning(warnings: &mut Vec<AnalysisWarning>, warning: AnalysisWarning) {
    warn!("{}", warning);
    warnings.push(warning);
}

/// Runs one method, turning its error into a `MethodFailed` warning.
/// Warnings the method raised before failing are kept.
fn attempt<T, F>(warnings: &mut Vec<AnalysisWarning>, method: &str, f: F) -> Option<T>
where
    F: FnOnce(&mut Vec<AnalysisWarning>) -> Result<T, CausalError>,
{
    match f(warnings) {
        Ok(value) => Some(value),
        Err(e) => {
            push_warning(
                warnings,
                AnalysisWarning::MethodFailed {
                    method: method.to_string(),
                    error: e.to_string(),
                },
            );
            None
        }
    }
}

/// Matched sample, ATT and post-matching balance.
#[derive(Debug, Getters, Serialize)]
#[getset(get = "pub")]
pub struct PsmAnalysis {
    effect: EffectResult,
    matched: MatchedSample,
    balance: BalanceTable,
}

#[derive(Debug, Getters, Serialize)]
#[getset(get = "pub")]
pub struct IptwAnalysis {
    effect: EffectResult,
    #[serde(skip)]
    weights: UnitWeights,
    balance: BalanceTable,
}

/// Strata, MMWS weights and the stratified diagnostics.
#[derive(Debug, Getters, Serialize)]
#[getset(get = "pub")]
pub struct MmwsAnalysis {
    effect: EffectResult,
    stratification: Stratification,
    #[serde(skip)]
    weights: UnitWeights,
    balance: BalanceTable,
    /// Strata pooled with weights `n_s / N`.
    stratified_balance: BalanceTable,
    stratum_balance: Vec<(usize, BalanceTable)>,
    stratum_effects: Vec<StratumEffect>,
}

/// Holds all the results of a [`CausalAnalysis`] run.
///
/// A method is `None` when it was skipped or failed; the matching
/// [`AnalysisWarning`] says which.
#[derive(Debug, Getters, Serialize)]
#[getset(get = "pub")]
pub struct AnalysisResults {
    config: AnalysisConfig,
    /// Units in the prepared table.
    n_units: usize,
    n_treated: usize,
    n_control: usize,
    /// Rows dropped for missing required values.
    dropped_rows: usize,
    /// Covariance-ratio interaction screening (report only).
    screening: Vec<InteractionCandidate>,
    propensity: PropensityModel,
    support: CommonSupport,
    /// Unadjusted balance over the common-support sample.
    balance_unadjusted: BalanceTable,
    psm: Option<PsmAnalysis>,
    iptw: Option<IptwAnalysis>,
    mmws: Option<MmwsAnalysis>,
    iv: Option<IvResult>,
    did: Option<DidResult>,
    warnings: Vec<AnalysisWarning>,
}

impl AnalysisResults {
    /// The effect records of every method that produced one, in the order
    /// PSM, IPTW, MMWS, IV, DID.
    pub fn effects(&self) -> Vec<&EffectResult> {
        self.psm
            .as_ref()
            .map(|p| &p.effect)
            .into_iter()
            .chain(self.iptw.as_ref().map(|i| &i.effect))
            .chain(self.mmws.as_ref().map(|m| &m.effect))
            .chain(self.iv.as_ref().map(|iv| iv.effect()))
            .chain(self.did.as_ref().map(|did| did.effect()))
            .collect()
    }

    /// Looks up an effect record by method name (case-insensitive).
    pub fn effect(&self, method: &str) -> Option<&EffectResult> {
        self.effects()
            .into_iter()
            .find(|e| e.method().eq_ignore_ascii_case(method))
    }

    /// Balance tables of the propensity-based adjustments that ran, plus the
    /// pooled stratified table when MMWS ran.
    pub fn balance_tables(&self) -> Vec<&BalanceTable> {
        let mut out = Vec::new();
        if let Some(psm) = &self.psm {
            out.push(&psm.balance);
        }
        if let Some(iptw) = &self.iptw {
            out.push(&iptw.balance);
        }
        if let Some(mmws) = &self.mmws {
            out.push(&mmws.balance);
            out.push(&mmws.stratified_balance);
        }
        out
    }
}
