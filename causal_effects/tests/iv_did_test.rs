use causal_effects::{
    AnalysisWarning, CausalAnalysis, CovariateTable, DidEstimator, Estimand, IvEstimator, TermSet,
};
use polars::prelude::*;
use rand::distributions::Distribution;
use rand::prelude::*;
use statrs::distribution::Normal;

mod common;

fn with_extra_instruments(df: &mut DataFrame, seed: u64) -> Result<(), Box<dyn std::error::Error>> {
    let z: Vec<f64> = df.column("z")?.f64()?.into_no_null_iter().collect();
    let z_squared: Vec<f64> = z.iter().map(|v| v * v - 1.0).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, 1.0).unwrap();
    let noise: Vec<f64> = (0..z.len()).map(|_| normal.sample(&mut rng)).collect();
    df.with_column(Series::new("z_sq".into(), z_squared))?;
    df.with_column(Series::new("noise".into(), noise))?;
    Ok(())
}

#[test]
fn test_iv_recovers_effect_with_strong_instrument() -> Result<(), Box<dyn std::error::Error>> {
    let df = common::confounded_units(2000, 1.5, 0.8, 31);
    let table = CovariateTable::from_dataframe(&df, &common::full_roles(false))?;
    let mut estimator = IvEstimator::new(&["z".to_string()]);
    estimator.covariates(&TermSet::from_table(&table, &[]));

    let result = estimator.estimate(&table)?;

    assert_eq!(*result.effect().estimand(), Estimand::Late);
    assert!((result.effect().estimate() - 1.5).abs() < 4.0 * result.effect().std_error());
    assert!(result.first_stage().f_statistic > 10.0);
    assert!(!result.first_stage().weak);
    assert!(result.first_stage().partial_r_squared > 0.0 && result.first_stage().partial_r_squared < 1.0);
    // Just identified: no overidentifying restriction to test.
    assert!(result.overidentification().statistic.is_none());
    assert!(result.endogeneity().statistic.is_some());
    Ok(())
}

#[test]
fn test_overidentified_model_reports_sargan() -> Result<(), Box<dyn std::error::Error>> {
    let mut df = common::confounded_units(1500, 1.0, 0.8, 37);
    with_extra_instruments(&mut df, 1)?;
    let mut roles = common::full_roles(false);
    roles.instruments = vec!["z".to_string(), "z_sq".to_string()];
    let table = CovariateTable::from_dataframe(&df, &roles)?;
    let mut estimator = IvEstimator::new(&roles.instruments);
    estimator.covariates(&TermSet::from_table(&table, &[]));

    let result = estimator.estimate(&table)?;

    let sargan = result.overidentification();
    assert!(sargan.statistic.unwrap() >= 0.0);
    assert_eq!(sargan.df, 1);
    assert!((0.0..=1.0).contains(&sargan.p_value.unwrap()));
    assert_eq!(result.first_stage().df_numerator, 2);
    Ok(())
}

#[test]
fn test_weak_instrument_is_flagged_not_fatal() -> Result<(), Box<dyn std::error::Error>> {
    let mut df = common::confounded_units(800, 1.0, 0.8, 41);
    with_extra_instruments(&mut df, 2)?;
    let mut roles = common::full_roles(false);
    roles.instruments = vec!["noise".to_string()];

    let results = CausalAnalysis::new(df, roles).run()?;

    let iv = results.iv().as_ref().unwrap();
    assert!(iv.first_stage().weak);
    assert!(iv.effect().estimate().is_finite());
    assert!(results
        .warnings()
        .iter()
        .any(|w| matches!(w, AnalysisWarning::WeakInstrument { .. })));
    Ok(())
}

#[test]
fn test_did_matches_cell_means() -> Result<(), Box<dyn std::error::Error>> {
    let df = common::confounded_units(1000, 2.0, 0.8, 43);
    let table = CovariateTable::from_dataframe(&df, &common::full_roles(false))?;

    let result = DidEstimator::new("baseline").estimate(&table)?;

    let m = result.cell_means();
    let by_cells = (m.treated_post - m.treated_pre) - (m.control_post - m.control_pre);
    assert!((result.effect().estimate() - by_cells).abs() < 1e-9);
    assert!((result.effect().estimate() - 2.0).abs() < 4.0 * result.effect().std_error());
    assert_eq!(*result.n_units(), 1000);
    assert_eq!(*result.effect().n_obs(), 2000);
    assert!(result
        .effect()
        .notes()
        .iter()
        .any(|n| n.contains("parallel trends assumed")));
    Ok(())
}
