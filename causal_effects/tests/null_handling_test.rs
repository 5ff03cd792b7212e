use causal_effects::{AnalysisWarning, CausalAnalysis, ColumnRoles, CovariateTable};
use polars::prelude::*;

mod common;

#[test]
fn test_rows_with_missing_required_values_are_counted() -> Result<(), Box<dyn std::error::Error>> {
    let df = df!(
        "id" => &[1i64, 2, 3, 4, 5, 6],
        "treated" => &[Some(1), Some(1), None, Some(0), Some(0), Some(0)],
        "outcome" => &[Some(3.0), Some(4.0), Some(2.0), None, Some(1.5), Some(2.5)],
        "age" => &[Some(30.0), None, Some(41.0), Some(35.0), Some(29.0), Some(44.0)],
        "baseline" => &[None, Some(1.0), Some(1.0), Some(1.0), Some(1.0), Some(1.0)]
    )?;
    let mut roles = ColumnRoles::new("id", "treated", "outcome");
    roles.covariates = vec!["age".to_string()];
    roles.baseline_outcome = Some("baseline".to_string());

    let table = CovariateTable::from_dataframe(&df, &roles)?;

    // Missing treatment, outcome and covariate each drop a row; a missing
    // baseline does not.
    assert_eq!(table.len(), 3);
    assert_eq!(table.dropped_rows(), 3);
    assert_eq!(table.n_treated(), 1);
    assert_eq!(table.optional("baseline")?[0], None);
    Ok(())
}

#[test]
fn test_analysis_reports_dropped_rows() -> Result<(), Box<dyn std::error::Error>> {
    let mut df = common::confounded_units(300, 1.0, 0.5, 8);
    let x1: Vec<Option<f64>> = df
        .column("x1")?
        .f64()?
        .into_iter()
        .enumerate()
        .map(|(i, v)| if i % 50 == 0 { None } else { v })
        .collect();
    let baseline: Vec<Option<f64>> = df
        .column("baseline")?
        .f64()?
        .into_iter()
        .enumerate()
        .map(|(i, v)| if i % 60 == 1 { None } else { v })
        .collect();
    let z: Vec<Option<f64>> = df
        .column("z")?
        .f64()?
        .into_iter()
        .enumerate()
        .map(|(i, v)| if i % 75 == 2 { None } else { v })
        .collect();
    df.with_column(Series::new("x1".into(), x1))?;
    df.with_column(Series::new("baseline".into(), baseline))?;
    df.with_column(Series::new("z".into(), z))?;

    let results = CausalAnalysis::new(df, common::full_roles(false)).run()?;

    assert_eq!(*results.dropped_rows(), 6);
    assert_eq!(*results.n_units(), 294);
    assert_eq!(*results.did().as_ref().unwrap().excluded_units(), 5);
    assert_eq!(*results.iv().as_ref().unwrap().excluded_rows(), 4);

    let counts: Vec<usize> = results
        .warnings()
        .iter()
        .filter_map(|w| match w {
            AnalysisWarning::RowsDropped { count, .. } => Some(*count),
            _ => None,
        })
        .collect();
    assert_eq!(counts, vec![6, 4, 5]);
    Ok(())
}

#[test]
fn test_duplicate_ids_are_rejected() -> Result<(), Box<dyn std::error::Error>> {
    let df = df!(
        "id" => &[1i64, 2, 2, 3],
        "treated" => &[1, 0, 1, 0],
        "outcome" => &[1.0, 2.0, 3.0, 4.0]
    )?;

    let result = CovariateTable::from_dataframe(&df, &ColumnRoles::new("id", "treated", "outcome"));

    assert!(matches!(result, Err(causal_effects::CausalError::DuplicateUnit(_))));
    Ok(())
}
