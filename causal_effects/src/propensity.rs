//! Logistic treatment-assignment model.
use crate::math::logit::{logit, sigmoid, MAX_ITER, TOLERANCE};
use crate::table::CovariateTable;
use crate::terms::TermSet;
use crate::CausalError;
use nalgebra::DVector;
use serde::Serialize;
use tracing::{debug, warn};

/// A fitted propensity model: `treatment ~ 1 + terms`.
///
/// The model is a plain value; scoring never mutates it.
#[derive(Debug, Clone, Serialize)]
pub struct PropensityModel {
    terms: TermSet,
    names: Vec<String>,
    coefficients: Vec<f64>,
    converged: bool,
    iterations: usize,
}

/// Probability and logit scores, row-aligned with the scored table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropensityScores {
    pub probability: Vec<f64>,
    pub logit: Vec<f64>,
}

impl PropensityScores {
    /// Builds scores from logits; probabilities are `1/(1+e^(-logit))`.
    pub fn from_logits(logit: Vec<f64>) -> Self {
        let probability = logit.iter().map(|&z| sigmoid(z)).collect();
        Self { probability, logit }
    }

    pub fn len(&self) -> usize {
        self.logit.len()
    }

    pub fn is_empty(&self) -> bool {
        self.logit.is_empty()
    }

    pub fn subset(&self, rows: &[usize]) -> Self {
        Self {
            probability: rows.iter().map(|&i| self.probability[i]).collect(),
            logit: rows.iter().map(|&i| self.logit[i]).collect(),
        }
    }
}

impl PropensityModel {
    /// Fits the model on `table` with the given term list.
    pub fn fit(table: &CovariateTable, terms: &TermSet) -> Result<Self, CausalError> {
        let design = terms.expand(table)?;
        let n = table.len();
        let (x, names) = design.to_matrix(n, &[("intercept", vec![1.0; n])]);
        let y = DVector::from_vec(table.treatment_values());
        debug!(rows = n, columns = names.len(), "fitting propensity model");

        let fit = logit(&y, &x, &names, MAX_ITER, TOLERANCE)?;
        if !fit.converged {
            warn!(
                iterations = fit.iterations,
                "propensity model did not converge"
            );
        }
        Ok(Self {
            terms: terms.clone(),
            names,
            coefficients: fit.coefficients.iter().cloned().collect(),
            converged: fit.converged,
            iterations: fit.iterations,
        })
    }

    /// Scores every row of `table`.
    pub fn score(&self, table: &CovariateTable) -> Result<PropensityScores, CausalError> {
        let design = self.terms.expand(table)?;
        let n = table.len();
        let (x, names) = design.to_matrix(n, &[("intercept", vec![1.0; n])]);
        if names != self.names {
            return Err(CausalError::InvalidInput(format!(
                "scoring design {:?} differs from fitted design {:?}",
                names, self.names
            )));
        }
        let beta = DVector::from_column_slice(&self.coefficients);
        let linear = x * beta;
        Ok(PropensityScores::from_logits(linear.iter().cloned().collect()))
    }

    pub fn terms(&self) -> &TermSet {
        &self.terms
    }

    /// Coefficients paired with their design column names.
    pub fn coefficients(&self) -> Vec<(String, f64)> {
        self.names
            .iter()
            .cloned()
            .zip(self.coefficients.iter().cloned())
            .collect()
    }

    pub fn converged(&self) -> bool {
        self.converged
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }
}
