//! Explicit covariate term lists.
//!
//! Terms are parsed once, validated against a [`CovariateTable`], and then
//! expanded into design columns. Interaction terms are only ever added by the
//! caller; [`screen_interactions`] reports candidates but never changes a
//! term set.

use crate::math::moments::covariance;
use crate::table::CovariateTable;
use crate::CausalError;
use nalgebra::DMatrix;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Default tolerance on `|ratio - 1|` for interaction screening.
pub const DEFAULT_INTERACTION_TOLERANCE: f64 = 0.5;

/// One covariate term of a model.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum Term {
    /// A declared covariate; categorical covariates expand to dummies.
    Main(String),
    /// The product of two numeric covariates.
    Interaction(String, String),
}

impl Term {
    pub fn name(&self) -> String {
        match self {
            Term::Main(name) => name.clone(),
            Term::Interaction(a, b) => format!("{}:{}", a, b),
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl FromStr for Term {
    type Err = CausalError;

    /// Parses `"age"` or `"age:income"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').map(str::trim).collect();
        match parts.as_slice() {
            [name] if !name.is_empty() => Ok(Term::Main(name.to_string())),
            [a, b] if !a.is_empty() && !b.is_empty() => {
                if a == b {
                    Err(CausalError::InvalidTerm(format!(
                        "'{}' interacts a covariate with itself",
                        s
                    )))
                } else {
                    Ok(Term::Interaction(a.to_string(), b.to_string()))
                }
            }
            _ => Err(CausalError::InvalidTerm(format!("cannot parse term '{}'", s))),
        }
    }
}

/// Named design columns produced by [`TermSet::expand`], without intercept.
#[derive(Debug, Clone, Default)]
pub struct DesignColumns {
    pub names: Vec<String>,
    pub columns: Vec<Vec<f64>>,
}

impl DesignColumns {
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Design matrix with the given leading columns followed by the terms.
    pub fn to_matrix(&self, n_rows: usize, leading: &[(&str, Vec<f64>)]) -> (DMatrix<f64>, Vec<String>) {
        let k = leading.len() + self.columns.len();
        let mut names = Vec::with_capacity(k);
        let mut x = DMatrix::zeros(n_rows, k);
        for (j, (name, col)) in leading.iter().enumerate() {
            names.push(name.to_string());
            for i in 0..n_rows {
                x[(i, j)] = col[i];
            }
        }
        for (offset, (name, col)) in self.names.iter().zip(&self.columns).enumerate() {
            let j = leading.len() + offset;
            names.push(name.clone());
            for i in 0..n_rows {
                x[(i, j)] = col[i];
            }
        }
        (x, names)
    }
}

/// An ordered, duplicate-free list of terms.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TermSet {
    terms: Vec<Term>,
}

impl TermSet {
    pub fn new(terms: Vec<Term>) -> Self {
        let mut seen = BTreeSet::new();
        let terms = terms
            .into_iter()
            .filter(|t| seen.insert(t.name()))
            .collect();
        Self { terms }
    }

    /// Parses a list of `"a"` / `"a:b"` strings.
    pub fn parse<S: AsRef<str>>(specs: &[S]) -> Result<Self, CausalError> {
        let terms = specs
            .iter()
            .map(|s| s.as_ref().parse::<Term>())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(terms))
    }

    /// Main effects for every declared covariate, numeric first, followed by
    /// the given interaction pairs.
    pub fn from_table(table: &CovariateTable, interactions: &[(String, String)]) -> Self {
        let roles = table.roles();
        let mut terms: Vec<Term> = roles
            .covariates
            .iter()
            .chain(roles.categorical.iter())
            .map(|c| Term::Main(c.clone()))
            .collect();
        terms.extend(
            interactions
                .iter()
                .map(|(a, b)| Term::Interaction(a.clone(), b.clone())),
        );
        Self::new(terms)
    }

    pub fn terms(&self) -> &[Term] {
        &self.terms
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// Checks every term against the table's declared covariates.
    pub fn validate(&self, table: &CovariateTable) -> Result<(), CausalError> {
        for term in &self.terms {
            match term {
                Term::Main(name) => {
                    if !table.is_numeric(name) && !table.is_categorical(name) {
                        return Err(CausalError::InvalidTerm(format!(
                            "'{}' is not a declared covariate",
                            name
                        )));
                    }
                }
                Term::Interaction(a, b) => {
                    for part in [a, b] {
                        if !table.is_numeric(part) {
                            return Err(CausalError::InvalidTerm(format!(
                                "interaction '{}' needs numeric covariates, '{}' is not one",
                                term, part
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Expands the terms into numeric columns over `table`'s rows.
    ///
    /// Categorical covariates become one dummy per level, named
    /// `name_level`, with the first sorted level omitted as the base.
    pub fn expand(&self, table: &CovariateTable) -> Result<DesignColumns, CausalError> {
        self.validate(table)?;
        let mut design = DesignColumns::default();
        for term in &self.terms {
            match term {
                Term::Main(name) if table.is_numeric(name) => {
                    design.names.push(name.clone());
                    design.columns.push(table.numeric(name)?.to_vec());
                }
                Term::Main(name) => {
                    let values = table.categorical(name)?;
                    let levels: BTreeSet<&String> = values.iter().collect();
                    for level in levels.into_iter().skip(1) {
                        design.names.push(format!("{}_{}", name, level));
                        design.columns.push(
                            values
                                .iter()
                                .map(|v| if v == level { 1.0 } else { 0.0 })
                                .collect(),
                        );
                    }
                }
                Term::Interaction(a, b) => {
                    let xa = table.numeric(a)?;
                    let xb = table.numeric(b)?;
                    design.names.push(term.name());
                    design
                        .columns
                        .push(xa.iter().zip(xb).map(|(u, v)| u * v).collect());
                }
            }
        }
        Ok(design)
    }
}

/// One screened covariate pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InteractionCandidate {
    pub first: String,
    pub second: String,
    pub covariance_treated: f64,
    pub covariance_control: f64,
    /// `covariance_treated / covariance_control`; `None` when the control
    /// covariance is zero.
    pub ratio: Option<f64>,
    pub flagged: bool,
}

/// Compares the within-group covariance of every numeric covariate pair.
///
/// A pair is flagged when the treated/control covariance ratio deviates from
/// 1 by more than `tolerance`, or when the ratio is undefined while the
/// treated covariance is not zero. This is a deterministic comparison, not a
/// test.
pub fn screen_interactions(
    table: &CovariateTable,
    covariates: &[String],
    tolerance: f64,
) -> Result<Vec<InteractionCandidate>, CausalError> {
    let treated: Vec<usize> = (0..table.len()).filter(|&i| table.treated()[i]).collect();
    let control = table.control_rows();
    let pick = |col: &[f64], rows: &[usize]| rows.iter().map(|&i| col[i]).collect::<Vec<f64>>();

    let mut candidates = Vec::new();
    for (i, first) in covariates.iter().enumerate() {
        for second in &covariates[i + 1..] {
            let a = table.numeric(first)?;
            let b = table.numeric(second)?;
            let cov_t = covariance(&pick(a, &treated), &pick(b, &treated));
            let cov_c = covariance(&pick(a, &control), &pick(b, &control));
            let ratio = if cov_c != 0.0 && cov_c.is_finite() && cov_t.is_finite() {
                Some(cov_t / cov_c)
            } else {
                None
            };
            let flagged = match ratio {
                Some(r) => (r - 1.0).abs() > tolerance,
                None => cov_t != 0.0 && !cov_t.is_nan(),
            };
            candidates.push(InteractionCandidate {
                first: first.clone(),
                second: second.clone(),
                covariance_treated: cov_t,
                covariance_control: cov_c,
                ratio,
                flagged,
            });
        }
    }
    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::ColumnRoles;
    use polars::prelude::*;

    fn table() -> CovariateTable {
        let df = df!(
            "id" => &[1i64, 2, 3, 4, 5, 6],
            "d" => &[1, 1, 1, 0, 0, 0],
            "y" => &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
            "a" => &[1.0, 2.0, 3.0, 1.0, 2.0, 3.0],
            "b" => &[2.0, 4.0, 6.0, 3.0, 2.0, 1.0],
            "region" => &["north", "south", "east", "north", "east", "south"]
        )
        .unwrap();
        let mut roles = ColumnRoles::new("id", "d", "y");
        roles.covariates = vec!["a".into(), "b".into()];
        roles.categorical = vec!["region".into()];
        CovariateTable::from_dataframe(&df, &roles).unwrap()
    }

    #[test]
    fn test_parse_terms() {
        let set = TermSet::parse(&["a", "a:b", "a"]).unwrap();
        assert_eq!(
            set.terms(),
            &[Term::Main("a".into()), Term::Interaction("a".into(), "b".into())]
        );
        assert!(TermSet::parse(&["a:b:c"]).is_err());
        assert!(TermSet::parse(&["a:a"]).is_err());
    }

    #[test]
    fn test_categorical_expands_without_base_level() {
        let table = table();
        let set = TermSet::parse(&["region"]).unwrap();
        let design = set.expand(&table).unwrap();
        assert_eq!(design.names, vec!["region_north", "region_south"]);
        assert_eq!(design.columns[0], vec![1.0, 0.0, 0.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_interaction_requires_numeric() {
        let table = table();
        let set = TermSet::parse(&["a:region"]).unwrap();
        assert!(matches!(set.validate(&table), Err(CausalError::InvalidTerm(_))));
        let set = TermSet::parse(&["unknown"]).unwrap();
        assert!(matches!(set.validate(&table), Err(CausalError::InvalidTerm(_))));
    }

    #[test]
    fn test_screening_flags_opposite_covariance() {
        let table = table();
        let out = screen_interactions(&table, &["a".into(), "b".into()], 0.5).unwrap();
        assert_eq!(out.len(), 1);
        // treated cov(a,b) = 2, control cov(a,b) = -1
        assert_eq!(out[0].ratio, Some(-2.0));
        assert!(out[0].flagged);
    }
}
