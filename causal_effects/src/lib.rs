//! Treatment effect estimation from observational data.
//!
//! This library estimates the causal effect of a binary treatment on an
//! outcome with five complementary identification strategies applied to the
//! same cleaned unit table:
//!
//! - **PSM**: 1:1 greedy nearest-neighbour matching on the propensity score
//!   inside the common-support band (an ATT).
//! - **IPTW**: inverse-probability-of-treatment weighting (an ATE).
//! - **MMWS**: marginal mean weighting through propensity-score strata (an ATE).
//! - **IV**: two-stage least squares with first-stage, overidentification
//!   and endogeneity diagnostics.
//! - **DID**: a two-period difference-in-differences panel regression.
//!
//! Every method reports through the same [`EffectResult`] record, and the
//! propensity-based methods report covariate balance through [`BalanceTable`].
//!
//! # Example
//!
//! ```ignore
//! use polars::prelude::*;
//! use causal_effects::{CausalAnalysis, ColumnRoles};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let df = df!(
//!         "id" => &[1i64, 2, 3, 4, 5, 6, 7, 8],
//!         "treated" => &[1, 1, 1, 1, 0, 0, 0, 0],
//!         "score" => &[14.0, 12.5, 15.1, 13.0, 11.0, 12.2, 10.4, 11.9],
//!         "age" => &[34.0, 29.0, 41.0, 38.0, 33.0, 30.0, 44.0, 36.0]
//!     )?;
//!
//!     let mut roles = ColumnRoles::new("id", "treated", "score");
//!     roles.covariates = vec!["age".to_string()];
//!
//!     let results = CausalAnalysis::new(df, roles).strata(2).run()?;
//!     results.summary();
//!     Ok(())
//! }
//! ```

use polars::prelude::PolarsError;
use serde::Serialize;
use std::fmt;

pub mod analysis;
pub mod balance;
pub mod did;
pub mod effect;
pub mod inference;
pub mod iv;
pub mod matching;
mod math;
pub mod propensity;
mod report;
pub mod stratify;
pub mod support;
pub mod table;
pub mod terms;
pub mod weighting;

pub use crate::analysis::{
    AnalysisConfig, AnalysisResults, CausalAnalysis, IptwAnalysis, MmwsAnalysis, PsmAnalysis,
};
pub use crate::balance::{BalanceDiagnostics, BalanceRow, BalanceTable};
pub use crate::did::{DidEstimator, DidResult, LongPanel};
pub use crate::effect::{EffectEstimator, EffectResult, Estimand, ReferenceSd};
pub use crate::inference::BootstrapSummary;
pub use crate::iv::{IvEstimator, IvResult};
pub use crate::matching::engine::{MatchScale, MatchedPair, MatchedSample, MatchingEngine};
pub use crate::propensity::{PropensityModel, PropensityScores};
pub use crate::stratify::{StratificationMode, Stratifier, Stratification};
pub use crate::support::CommonSupport;
pub use crate::table::{ColumnRoles, CovariateTable, UnitId};
pub use crate::terms::{screen_interactions, InteractionCandidate, Term, TermSet};
pub use crate::weighting::{iptw_weights, mmws_weights, UnitWeights};

/// Units whose weight could not be defined.
///
/// Carried by [`CausalError::DegenerateWeight`] when the condition is fatal
/// (IPTW) and by [`AnalysisWarning::DegenerateStrata`] when the units are
/// excluded and the call continues (MMWS).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DegenerateUnits {
    /// Weighting scheme that produced the undefined weights.
    pub method: String,
    /// Identifiers of the affected units, in ascending order.
    pub units: Vec<UnitId>,
    /// Stratum labels involved, empty when the scheme is not stratified.
    pub strata: Vec<usize>,
}

impl DegenerateUnits {
    /// Number of affected units.
    pub fn count(&self) -> usize {
        self.units.len()
    }
}

impl fmt::Display for DegenerateUnits {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {} units with undefined weight", self.method, self.count())?;
        if !self.strata.is_empty() {
            write!(f, " (strata {:?})", self.strata)?;
        }
        Ok(())
    }
}

/// Error type for the `causal_effects` library.
#[derive(Debug, thiserror::Error)]
pub enum CausalError {
    /// Wraps a `PolarsError`.
    #[error("Polars error: {0}")]
    Polars(#[from] PolarsError),
    /// A configured column does not exist in the DataFrame.
    #[error("Column not found: {0}")]
    ColumnNotFound(String),
    /// The treatment column is not a usable 0/1 indicator.
    #[error("Invalid treatment column: {0}")]
    InvalidTreatment(String),
    /// A declared covariate or interaction term cannot be built.
    #[error("Invalid term: {0}")]
    InvalidTerm(String),
    /// Two rows share the same unit identifier.
    #[error("Duplicate unit identifier: {0}")]
    DuplicateUnit(String),
    /// Any other invalid argument or data shape.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    /// The design matrix is rank-deficient.
    #[error("Singular design ({detail}); collinear terms: [{}]", .terms.join(", "))]
    SingularDesign { terms: Vec<String>, detail: String },
    /// A propensity score of exactly 0 or 1 makes a weight infinite.
    #[error("Degenerate weights for {0}")]
    DegenerateWeight(DegenerateUnits),
    /// The overlap region is empty after caliper adjustment.
    #[error(
        "Insufficient common support: band [{lower:.4}, {upper:.4}] retains {retained_treated} treated and {retained_control} control units"
    )]
    InsufficientCommonSupport {
        lower: f64,
        upper: f64,
        retained_treated: usize,
        retained_control: usize,
    },
}

/// Non-fatal conditions collected while running an analysis.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnalysisWarning {
    /// First-stage F-statistic below the weak-instrument threshold.
    WeakInstrument { f_statistic: f64, threshold: f64 },
    /// Strata lacking one group; their units were excluded from MMWS.
    DegenerateStrata(DegenerateUnits),
    /// Treated units left without a control when the pool ran out.
    UnmatchedTreated { count: usize },
    /// The propensity model stopped at the iteration cap.
    PropensityNotConverged { iterations: usize },
    /// Rows removed before estimation because a required value was missing.
    RowsDropped { reason: String, count: usize },
    /// A method was not run because its inputs were not configured.
    MethodSkipped { method: String, reason: String },
    /// A method stopped on an error; the other methods still report.
    MethodFailed { method: String, error: String },
}

impl fmt::Display for AnalysisWarning {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AnalysisWarning::WeakInstrument {
                f_statistic,
                threshold,
            } => write!(
                f,
                "weak instrument: first-stage F = {:.3} below {:.1}",
                f_statistic, threshold
            ),
            AnalysisWarning::DegenerateStrata(units) => write!(f, "degenerate strata, {}", units),
            AnalysisWarning::UnmatchedTreated { count } => {
                write!(f, "{} treated units left unmatched", count)
            }
            AnalysisWarning::PropensityNotConverged { iterations } => write!(
                f,
                "propensity model did not converge after {} iterations",
                iterations
            ),
            AnalysisWarning::RowsDropped { reason, count } => {
                write!(f, "{} rows dropped: {}", count, reason)
            }
            AnalysisWarning::MethodSkipped { method, reason } => {
                write!(f, "{} skipped: {}", method, reason)
            }
            AnalysisWarning::MethodFailed { method, error } => {
                write!(f, "{} failed: {}", method, error)
            }
        }
    }
}
