//! Covariate balance before and after adjustment.
//!
//! Every standardized mean difference shares one denominator: the pooled SD
//! `sqrt((var_treated + var_control) / 2)` of the unadjusted full sample.
//! That keeps "before" and "after" on the same scale.

use crate::math::moments::{weighted_mean, weighted_variance};
use crate::table::CovariateTable;
use crate::terms::TermSet;
use crate::CausalError;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;

/// Balance of one covariate or term.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BalanceRow {
    pub term: String,
    pub diff_before: f64,
    /// `None` when either group's variance is zero.
    pub variance_ratio_before: Option<f64>,
    pub diff_after: f64,
    pub variance_ratio_after: Option<f64>,
}

/// One row per term, sorted by term name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BalanceTable {
    pub adjustment: String,
    pub rows: Vec<BalanceRow>,
}

impl BalanceTable {
    pub fn row(&self, term: &str) -> Option<&BalanceRow> {
        self.rows.iter().find(|r| r.term == term)
    }

    /// Largest standardized mean difference after adjustment.
    pub fn max_diff_after(&self) -> f64 {
        self.rows
            .iter()
            .map(|r| r.diff_after)
            .filter(|d| d.is_finite())
            .fold(0.0, f64::max)
    }
}

#[derive(Debug, Clone, Copy)]
struct GroupStats {
    mean_treated: f64,
    var_treated: f64,
    mean_control: f64,
    var_control: f64,
}

fn variance_ratio(var_treated: f64, var_control: f64) -> Option<f64> {
    if var_treated > 0.0 && var_control > 0.0 && var_treated.is_finite() && var_control.is_finite() {
        Some(var_treated / var_control)
    } else {
        None
    }
}

#[derive(Debug, Clone)]
struct TermColumn {
    name: String,
    values: Vec<f64>,
    pooled_sd: f64,
    before: GroupStats,
}

/// Balance calculator bound to the full unadjusted sample.
///
/// All "after" passes take row indices into that same table.
#[derive(Debug, Clone)]
pub struct BalanceDiagnostics {
    treated: Vec<bool>,
    columns: Vec<TermColumn>,
}

impl BalanceDiagnostics {
    pub fn new(table: &CovariateTable, terms: &TermSet) -> Result<Self, CausalError> {
        let design = terms.expand(table)?;
        let treated = table.treated().to_vec();
        let all: Vec<usize> = (0..table.len()).collect();
        let columns = design
            .names
            .into_iter()
            .zip(design.columns)
            .map(|(name, values)| {
                let before = group_stats(&values, &treated, &all, None);
                let pooled_sd = ((before.var_treated + before.var_control) / 2.0).sqrt();
                TermColumn {
                    name,
                    values,
                    pooled_sd,
                    before,
                }
            })
            .collect();
        Ok(Self { treated, columns })
    }

    /// Unweighted comparison over `rows` (typically the common-support sample).
    pub fn unadjusted(&self, rows: &[usize]) -> Result<BalanceTable, CausalError> {
        self.check_rows(rows, None)?;
        Ok(self.build("Unadjusted", |col| group_stats(&col.values, &self.treated, rows, None)))
    }

    /// Unweighted comparison over matched treated and control rows.
    pub fn matched(&self, rows: &[usize]) -> Result<BalanceTable, CausalError> {
        self.check_rows(rows, None)?;
        Ok(self.build("PSM", |col| group_stats(&col.values, &self.treated, rows, None)))
    }

    /// Weighted comparison; `weights` is aligned with `rows`.
    pub fn weighted(
        &self,
        adjustment: &str,
        rows: &[usize],
        weights: &[f64],
    ) -> Result<BalanceTable, CausalError> {
        self.check_rows(rows, Some(weights))?;
        Ok(self.build(adjustment, |col| {
            group_stats(&col.values, &self.treated, rows, Some(weights))
        }))
    }

    /// Pools within-stratum differences with weights `n_s / N`.
    ///
    /// `labels` is aligned with `rows`. Strata lacking one group carry no
    /// contrast and are left out of the pool.
    pub fn stratified(&self, rows: &[usize], labels: &[usize]) -> Result<BalanceTable, CausalError> {
        self.check_rows(rows, None)?;
        if labels.len() != rows.len() {
            return Err(CausalError::InvalidInput(
                "stratum labels are not aligned with rows".to_string(),
            ));
        }
        let mut by_stratum: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (&row, &label) in rows.iter().zip(labels) {
            by_stratum.entry(label).or_default().push(row);
        }
        let cells: Vec<Vec<usize>> = by_stratum
            .into_values()
            .filter(|cell| {
                cell.iter().any(|&r| self.treated[r]) && cell.iter().any(|&r| !self.treated[r])
            })
            .collect();
        let total: usize = cells.iter().map(Vec::len).sum();

        Ok(self.build("Stratified", |col| {
            let mut pooled = GroupStats {
                mean_treated: 0.0,
                var_treated: 0.0,
                mean_control: 0.0,
                var_control: 0.0,
            };
            for cell in &cells {
                let share = cell.len() as f64 / total as f64;
                let s = group_stats(&col.values, &self.treated, cell, None);
                pooled.mean_treated += share * s.mean_treated;
                pooled.mean_control += share * s.mean_control;
                // Single-unit groups contribute no within-stratum spread.
                pooled.var_treated += share * finite_or_zero(s.var_treated);
                pooled.var_control += share * finite_or_zero(s.var_control);
            }
            if total == 0 {
                pooled.mean_treated = f64::NAN;
                pooled.mean_control = f64::NAN;
            }
            pooled
        }))
    }

    /// One unweighted table per stratum, in label order.
    pub fn per_stratum(
        &self,
        rows: &[usize],
        labels: &[usize],
    ) -> Result<Vec<(usize, BalanceTable)>, CausalError> {
        self.check_rows(rows, None)?;
        let mut by_stratum: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (&row, &label) in rows.iter().zip(labels) {
            by_stratum.entry(label).or_default().push(row);
        }
        Ok(by_stratum
            .into_iter()
            .map(|(label, cell)| {
                let table = self.build(&format!("Stratum {}", label), |col| {
                    group_stats(&col.values, &self.treated, &cell, None)
                });
                (label, table)
            })
            .collect())
    }

    fn check_rows(&self, rows: &[usize], weights: Option<&[f64]>) -> Result<(), CausalError> {
        if rows.iter().any(|&r| r >= self.treated.len()) {
            return Err(CausalError::InvalidInput(
                "balance rows outside the unadjusted sample".to_string(),
            ));
        }
        if weights.is_some_and(|w| w.len() != rows.len()) {
            return Err(CausalError::InvalidInput(
                "balance weights are not aligned with rows".to_string(),
            ));
        }
        Ok(())
    }

    fn build<F>(&self, adjustment: &str, after: F) -> BalanceTable
    where
        F: Fn(&TermColumn) -> GroupStats + Sync,
    {
        let mut rows: Vec<BalanceRow> = self
            .columns
            .par_iter()
            .map(|col| {
                let b = col.before;
                let a = after(col);
                BalanceRow {
                    term: col.name.clone(),
                    diff_before: smd(b, col.pooled_sd),
                    variance_ratio_before: variance_ratio(b.var_treated, b.var_control),
                    diff_after: smd(a, col.pooled_sd),
                    variance_ratio_after: variance_ratio(a.var_treated, a.var_control),
                }
            })
            .collect();
        rows.sort_by(|x, y| x.term.cmp(&y.term));
        BalanceTable {
            adjustment: adjustment.to_string(),
            rows,
        }
    }
}

fn finite_or_zero(v: f64) -> f64 {
    if v.is_finite() {
        v
    } else {
        0.0
    }
}

fn smd(stats: GroupStats, pooled_sd: f64) -> f64 {
    let diff = (stats.mean_treated - stats.mean_control).abs();
    if pooled_sd > 0.0 {
        diff / pooled_sd
    } else if diff == 0.0 {
        0.0
    } else {
        f64::NAN
    }
}

fn group_stats(values: &[f64], treated: &[bool], rows: &[usize], weights: Option<&[f64]>) -> GroupStats {
    let split = |group: bool| {
        let mut x = Vec::new();
        let mut w = Vec::new();
        for (k, &r) in rows.iter().enumerate() {
            if treated[r] == group {
                x.push(values[r]);
                w.push(weights.map_or(1.0, |ws| ws[k]));
            }
        }
        (weighted_mean(&x, &w), weighted_variance(&x, &w))
    };
    let (mean_treated, var_treated) = split(true);
    let (mean_control, var_control) = split(false);
    GroupStats {
        mean_treated,
        var_treated,
        mean_control,
        var_control,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::ColumnRoles;
    use polars::prelude::*;

    fn table() -> CovariateTable {
        let df = df!(
            "id" => (1..=8i64).collect::<Vec<_>>(),
            "d" => &[1, 1, 1, 1, 0, 0, 0, 0],
            "y" => &[0.0; 8],
            "x" => &[3.0, 4.0, 5.0, 6.0, 1.0, 2.0, 3.0, 4.0],
            "flat" => &[1.0, 1.0, 1.0, 1.0, 2.0, 3.0, 2.0, 3.0]
        )
        .unwrap();
        let mut roles = ColumnRoles::new("id", "d", "y");
        roles.covariates = vec!["x".into(), "flat".into()];
        CovariateTable::from_dataframe(&df, &roles).unwrap()
    }

    #[test]
    fn test_smd_and_undefined_variance_ratio() {
        let table = table();
        let diag = BalanceDiagnostics::new(&table, &TermSet::from_table(&table, &[])).unwrap();
        let all: Vec<usize> = (0..8).collect();
        let out = diag.unadjusted(&all).unwrap();
        assert_eq!(out.rows[0].term, "flat");
        let x = out.row("x").unwrap();
        // means 4.5 vs 2.5, both variances 5/3
        assert!((x.diff_before - 2.0 / (5.0f64 / 3.0).sqrt()).abs() < 1e-12);
        assert_eq!(x.variance_ratio_before, Some(1.0));
        let flat = out.row("flat").unwrap();
        assert_eq!(flat.variance_ratio_before, None);
        assert_eq!(flat.variance_ratio_after, None);
    }

    #[test]
    fn test_matching_pairs_improve_balance() {
        let table = table();
        let diag = BalanceDiagnostics::new(&table, &TermSet::parse(&["x"]).unwrap()).unwrap();
        // treated x=3,4 with control x=3,4
        let matched = diag.matched(&[0, 1, 6, 7]).unwrap();
        let row = matched.row("x").unwrap();
        assert_eq!(row.diff_after, 0.0);
        assert!(row.diff_after < row.diff_before);
    }

    #[test]
    fn test_idempotent() {
        let table = table();
        let diag = BalanceDiagnostics::new(&table, &TermSet::from_table(&table, &[])).unwrap();
        let rows: Vec<usize> = (0..8).collect();
        let w = vec![0.5, 1.0, 1.5, 2.0, 1.0, 1.0, 2.0, 0.5];
        let first = diag.weighted("IPTW", &rows, &w).unwrap();
        let second = diag.weighted("IPTW", &rows, &w).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_stratified_pools_within_stratum_differences() {
        let table = table();
        let diag = BalanceDiagnostics::new(&table, &TermSet::parse(&["x"]).unwrap()).unwrap();
        let rows: Vec<usize> = (0..8).collect();
        // stratum 1: treated {3,4} control {3,4}; stratum 2: treated {5,6} control {1,2}
        let labels = [1, 1, 2, 2, 2, 2, 1, 1];
        let pooled = diag.stratified(&rows, &labels).unwrap();
        let row = pooled.row("x").unwrap();
        let sd = (5.0f64 / 3.0).sqrt();
        assert!((row.diff_after - 0.5 * 4.0 / sd).abs() < 1e-12);
        let per = diag.per_stratum(&rows, &labels).unwrap();
        assert_eq!(per.len(), 2);
        assert_eq!(per[0].1.row("x").unwrap().diff_after, 0.0);
    }
}
