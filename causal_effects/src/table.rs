//! The cleaned unit-level table every estimator consumes.
use crate::CausalError;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, warn};

/// Explicit mapping from column names to their semantic roles.
///
/// Nothing is inferred from naming conventions: every column the analysis
/// touches has to be declared here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnRoles {
    /// Unique unit identifier.
    pub id: String,
    /// Binary treatment indicator (0/1 or boolean).
    pub treatment: String,
    /// Primary (post-treatment) outcome.
    pub outcome: String,
    /// Pre-treatment measurement of the outcome, required for DID.
    #[serde(default)]
    pub baseline_outcome: Option<String>,
    /// Numeric covariates.
    #[serde(default)]
    pub covariates: Vec<String>,
    /// Categorical covariates, expanded to dummies.
    #[serde(default)]
    pub categorical: Vec<String>,
    /// Excluded instruments, required for IV.
    #[serde(default)]
    pub instruments: Vec<String>,
}

impl ColumnRoles {
    pub fn new(id: &str, treatment: &str, outcome: &str) -> Self {
        Self {
            id: id.to_string(),
            treatment: treatment.to_string(),
            outcome: outcome.to_string(),
            baseline_outcome: None,
            covariates: Vec::new(),
            categorical: Vec::new(),
            instruments: Vec::new(),
        }
    }

    fn all_columns(&self) -> Vec<&str> {
        let mut cols = vec![self.id.as_str(), self.treatment.as_str(), self.outcome.as_str()];
        cols.extend(self.baseline_outcome.iter().map(String::as_str));
        cols.extend(self.covariates.iter().map(String::as_str));
        cols.extend(self.categorical.iter().map(String::as_str));
        cols.extend(self.instruments.iter().map(String::as_str));
        cols
    }
}

/// A unit identifier. Integer id columns order numerically, anything else as text.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(untagged)]
pub enum UnitId {
    Int(i64),
    Text(String),
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            UnitId::Int(v) => write!(f, "{}", v),
            UnitId::Text(s) => write!(f, "{}", s),
        }
    }
}

/// Immutable, row-aligned view of the units taking part in an analysis.
///
/// Rows are sorted by ascending [`UnitId`], so row order is the deterministic
/// processing order used by the matcher. Derived tables are produced with
/// [`CovariateTable::subset`]; nothing mutates a table in place.
#[derive(Debug, Clone)]
pub struct CovariateTable {
    roles: ColumnRoles,
    ids: Vec<UnitId>,
    treated: Vec<bool>,
    outcome: Vec<f64>,
    numeric: BTreeMap<String, Vec<f64>>,
    categorical: BTreeMap<String, Vec<String>>,
    optional: BTreeMap<String, Vec<Option<f64>>>,
    dropped_rows: usize,
}

impl CovariateTable {
    /// Builds the table from a DataFrame.
    ///
    /// Rows missing the treatment, the primary outcome or any declared
    /// covariate are dropped and counted. The baseline outcome and the
    /// instruments may contain gaps; the estimators that need them count
    /// their own exclusions.
    pub fn from_dataframe(df: &DataFrame, roles: &ColumnRoles) -> Result<Self, CausalError> {
        for name in roles.all_columns() {
            if df.column(name).is_err() {
                return Err(CausalError::ColumnNotFound(name.to_string()));
            }
        }

        let raw_ids = read_ids(df, &roles.id)?;
        let raw_treatment = read_numeric(df, &roles.treatment)?;
        let raw_outcome = read_numeric(df, &roles.outcome)?;

        let mut raw_numeric = Vec::with_capacity(roles.covariates.len());
        for name in &roles.covariates {
            raw_numeric.push((name.clone(), read_numeric(df, name)?));
        }
        let mut raw_categorical = Vec::with_capacity(roles.categorical.len());
        for name in &roles.categorical {
            raw_categorical.push((name.clone(), read_text(df, name)?));
        }
        let mut raw_optional = Vec::new();
        for name in roles.baseline_outcome.iter().chain(roles.instruments.iter()) {
            raw_optional.push((name.clone(), read_numeric(df, name)?));
        }

        // Complete cases on the required columns.
        let complete: Vec<usize> = (0..df.height())
            .filter(|&i| {
                raw_ids[i].is_some()
                    && raw_treatment[i].is_some()
                    && raw_outcome[i].is_some()
                    && raw_numeric.iter().all(|(_, col)| col[i].is_some())
                    && raw_categorical.iter().all(|(_, col)| col[i].is_some())
            })
            .collect();
        let dropped_rows = df.height() - complete.len();
        if dropped_rows > 0 {
            warn!(
                dropped = dropped_rows,
                "rows with missing treatment, outcome or covariates were dropped"
            );
        }

        let mut order = complete;
        order.sort_by(|&a, &b| raw_ids[a].cmp(&raw_ids[b]));
        for pair in order.windows(2) {
            if raw_ids[pair[0]] == raw_ids[pair[1]] {
                let id = raw_ids[pair[0]]
                    .as_ref()
                    .map(|id| id.to_string())
                    .unwrap_or_default();
                return Err(CausalError::DuplicateUnit(id));
            }
        }

        let mut treated = Vec::with_capacity(order.len());
        for &i in &order {
            match raw_treatment[i] {
                Some(v) if v == 1.0 => treated.push(true),
                Some(v) if v == 0.0 => treated.push(false),
                other => {
                    return Err(CausalError::InvalidTreatment(format!(
                        "value {:?} in column '{}' is not 0 or 1",
                        other, roles.treatment
                    )))
                }
            }
        }
        if !treated.iter().any(|&t| t) || treated.iter().all(|&t| t) {
            return Err(CausalError::InvalidTreatment(
                "both treated and control units are required".to_string(),
            ));
        }

        let ids = order.iter().filter_map(|&i| raw_ids[i].clone()).collect();
        let outcome = order.iter().filter_map(|&i| raw_outcome[i]).collect();
        let numeric = raw_numeric
            .into_iter()
            .map(|(name, col)| (name, order.iter().filter_map(|&i| col[i]).collect()))
            .collect();
        let categorical = raw_categorical
            .into_iter()
            .map(|(name, col)| {
                let values = order.iter().filter_map(|&i| col[i].clone()).collect();
                (name, values)
            })
            .collect();
        let optional = raw_optional
            .into_iter()
            .map(|(name, col)| (name, order.iter().map(|&i| col[i]).collect()))
            .collect();

        let table = Self {
            roles: roles.clone(),
            ids,
            treated,
            outcome,
            numeric,
            categorical,
            optional,
            dropped_rows,
        };
        debug!(
            units = table.len(),
            treated = table.n_treated(),
            control = table.n_control(),
            "prepared covariate table"
        );
        Ok(table)
    }

    /// Returns a new table holding the given rows, in the given order.
    pub fn subset(&self, rows: &[usize]) -> Self {
        let pick_f64 = |col: &Vec<f64>| rows.iter().map(|&i| col[i]).collect::<Vec<f64>>();
        Self {
            roles: self.roles.clone(),
            ids: rows.iter().map(|&i| self.ids[i].clone()).collect(),
            treated: rows.iter().map(|&i| self.treated[i]).collect(),
            outcome: pick_f64(&self.outcome),
            numeric: self
                .numeric
                .iter()
                .map(|(k, v)| (k.clone(), pick_f64(v)))
                .collect(),
            categorical: self
                .categorical
                .iter()
                .map(|(k, v)| (k.clone(), rows.iter().map(|&i| v[i].clone()).collect()))
                .collect(),
            optional: self
                .optional
                .iter()
                .map(|(k, v)| (k.clone(), rows.iter().map(|&i| v[i]).collect()))
                .collect(),
            dropped_rows: self.dropped_rows,
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn roles(&self) -> &ColumnRoles {
        &self.roles
    }

    pub fn ids(&self) -> &[UnitId] {
        &self.ids
    }

    pub fn treated(&self) -> &[bool] {
        &self.treated
    }

    /// The treatment indicator as 0.0 / 1.0.
    pub fn treatment_values(&self) -> Vec<f64> {
        self.treated.iter().map(|&t| if t { 1.0 } else { 0.0 }).collect()
    }

    pub fn outcome(&self) -> &[f64] {
        &self.outcome
    }

    pub fn n_treated(&self) -> usize {
        self.treated.iter().filter(|&&t| t).count()
    }

    pub fn n_control(&self) -> usize {
        self.len() - self.n_treated()
    }

    /// Rows removed by [`CovariateTable::from_dataframe`] for missing values.
    pub fn dropped_rows(&self) -> usize {
        self.dropped_rows
    }

    pub fn is_numeric(&self, name: &str) -> bool {
        self.numeric.contains_key(name)
    }

    pub fn is_categorical(&self, name: &str) -> bool {
        self.categorical.contains_key(name)
    }

    pub fn numeric(&self, name: &str) -> Result<&[f64], CausalError> {
        self.numeric
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| CausalError::ColumnNotFound(name.to_string()))
    }

    pub fn categorical(&self, name: &str) -> Result<&[String], CausalError> {
        self.categorical
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| CausalError::ColumnNotFound(name.to_string()))
    }

    /// A column that may contain gaps (baseline outcome, instruments).
    pub fn optional(&self, name: &str) -> Result<&[Option<f64>], CausalError> {
        self.optional
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| CausalError::ColumnNotFound(name.to_string()))
    }

    /// Row indices of control units.
    pub fn control_rows(&self) -> Vec<usize> {
        (0..self.len()).filter(|&i| !self.treated[i]).collect()
    }
}

fn read_numeric(df: &DataFrame, name: &str) -> Result<Vec<Option<f64>>, CausalError> {
    let column = df.column(name)?.cast(&DataType::Float64)?;
    Ok(column.f64()?.into_iter().collect())
}

fn read_text(df: &DataFrame, name: &str) -> Result<Vec<Option<String>>, CausalError> {
    let column = df.column(name)?.cast(&DataType::String)?;
    Ok(column
        .str()?
        .into_iter()
        .map(|opt| opt.map(str::to_string))
        .collect())
}

fn read_ids(df: &DataFrame, name: &str) -> Result<Vec<Option<UnitId>>, CausalError> {
    let column = df.column(name)?;
    if column.dtype().is_integer() {
        let ints = column.cast(&DataType::Int64)?;
        Ok(ints.i64()?.into_iter().map(|opt| opt.map(UnitId::Int)).collect())
    } else {
        Ok(read_text(df, name)?
            .into_iter()
            .map(|opt| opt.map(UnitId::Text))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roles() -> ColumnRoles {
        let mut roles = ColumnRoles::new("id", "treated", "y");
        roles.covariates = vec!["age".to_string()];
        roles
    }

    #[test]
    fn test_rows_sorted_by_numeric_id() {
        let df = df!(
            "id" => &[10i64, 2, 7, 1],
            "treated" => &[1, 0, 1, 0],
            "y" => &[5.0, 3.0, 4.0, 2.0],
            "age" => &[40.0, 30.0, 35.0, 25.0]
        )
        .unwrap();

        let table = CovariateTable::from_dataframe(&df, &roles()).unwrap();
        assert_eq!(
            table.ids(),
            &[UnitId::Int(1), UnitId::Int(2), UnitId::Int(7), UnitId::Int(10)]
        );
        assert_eq!(table.treated(), &[false, false, true, true]);
        assert_eq!(table.numeric("age").unwrap(), &[25.0, 30.0, 35.0, 40.0]);
    }

    #[test]
    fn test_missing_required_values_are_dropped() {
        let df = df!(
            "id" => &[1i64, 2, 3, 4, 5],
            "treated" => &[Some(1), Some(0), None, Some(1), Some(0)],
            "y" => &[Some(5.0), Some(3.0), Some(4.0), None, Some(1.0)],
            "age" => &[Some(40.0), Some(30.0), Some(35.0), Some(20.0), Some(22.0)]
        )
        .unwrap();

        let table = CovariateTable::from_dataframe(&df, &roles()).unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table.dropped_rows(), 2);
    }

    #[test]
    fn test_invalid_treatment_value() {
        let df = df!(
            "id" => &[1i64, 2, 3],
            "treated" => &[1, 2, 0],
            "y" => &[1.0, 2.0, 3.0],
            "age" => &[1.0, 2.0, 3.0]
        )
        .unwrap();

        let result = CovariateTable::from_dataframe(&df, &roles());
        assert!(matches!(result, Err(CausalError::InvalidTreatment(_))));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let df = df!(
            "id" => &["a", "b", "a"],
            "treated" => &[1, 0, 0],
            "y" => &[1.0, 2.0, 3.0],
            "age" => &[1.0, 2.0, 3.0]
        )
        .unwrap();

        let result = CovariateTable::from_dataframe(&df, &roles());
        assert!(matches!(result, Err(CausalError::DuplicateUnit(id)) if id == "a"));
    }

    #[test]
    fn test_missing_column() {
        let df = df!("id" => &[1i64], "treated" => &[1], "y" => &[1.0]).unwrap();
        let result = CovariateTable::from_dataframe(&df, &roles());
        assert!(matches!(result, Err(CausalError::ColumnNotFound(c)) if c == "age"));
    }

    #[test]
    fn test_subset_keeps_alignment() {
        let df = df!(
            "id" => &[1i64, 2, 3, 4],
            "treated" => &[1, 0, 1, 0],
            "y" => &[5.0, 3.0, 4.0, 2.0],
            "age" => &[40.0, 30.0, 35.0, 25.0]
        )
        .unwrap();
        let table = CovariateTable::from_dataframe(&df, &roles()).unwrap();
        let sub = table.subset(&[3, 0]);
        assert_eq!(sub.ids(), &[UnitId::Int(4), UnitId::Int(1)]);
        assert_eq!(sub.outcome(), &[2.0, 5.0]);
        assert_eq!(sub.numeric("age").unwrap(), &[25.0, 40.0]);
        assert_eq!(sub.treated(), &[false, true]);
    }
}
