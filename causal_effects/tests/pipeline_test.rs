use causal_effects::{AnalysisWarning, CausalAnalysis, ColumnRoles, Estimand};
use polars::prelude::*;

mod common;

#[test]
fn test_full_pipeline_reports_five_methods() -> Result<(), Box<dyn std::error::Error>> {
    let df = common::confounded_units(1500, 2.0, 0.8, 7);

    let results = CausalAnalysis::new(df, common::full_roles(true)).run()?;

    let methods: Vec<&str> = results.effects().iter().map(|e| e.method().as_str()).collect();
    assert_eq!(methods, vec!["PSM", "IPTW", "MMWS", "IV", "DID"]);

    assert_eq!(*results.effect("psm").unwrap().estimand(), Estimand::Att);
    assert_eq!(*results.effect("iptw").unwrap().estimand(), Estimand::Ate);
    assert_eq!(*results.effect("mmws").unwrap().estimand(), Estimand::Ate);
    assert_eq!(*results.effect("did").unwrap().estimand(), Estimand::Att);

    for effect in results.effects() {
        assert!(effect.std_error().is_finite() && *effect.std_error() > 0.0);
        assert!((0.0..=1.0).contains(effect.p_value()));
        assert!(
            (effect.estimate() - 2.0).abs() < 4.0 * effect.std_error() + 0.2,
            "{} estimate {} (SE {}) far from 2.0",
            effect.method(),
            effect.estimate(),
            effect.std_error()
        );
        let expected_size = effect.estimate() / effect.reference_sd();
        assert!((effect.effect_size() - expected_size).abs() < 1e-12);
    }
    Ok(())
}

#[test]
fn test_adjustment_improves_balance() -> Result<(), Box<dyn std::error::Error>> {
    let df = common::confounded_units(1500, 2.0, 0.8, 11);

    let results = CausalAnalysis::new(df, common::full_roles(false)).run()?;

    let before = results.balance_unadjusted().row("x1").unwrap().diff_before.abs();
    assert!(before > 0.2, "expected visible imbalance on x1, got {}", before);

    for table in results.balance_tables() {
        let row = table.row("x1").unwrap();
        assert!(
            row.diff_after.abs() < row.diff_before.abs(),
            "{}: |SMD| after {} not below before {}",
            table.adjustment,
            row.diff_after,
            row.diff_before
        );
        // Before-adjustment statistics never depend on the method.
        let psm_balance = results.psm().as_ref().unwrap().balance();
        assert_eq!(row.diff_before, psm_balance.row("x1").unwrap().diff_before);
    }
    Ok(())
}

#[test]
fn test_no_effect_scenario() -> Result<(), Box<dyn std::error::Error>> {
    let df = common::balanced_quads(12);

    let results = CausalAnalysis::new(df, common::full_roles(false)).run()?;

    // Treated and control members of each quad are interchangeable, so every
    // estimator lands on zero with a non-zero standard error.
    assert_eq!(results.effects().len(), 5);
    for effect in results.effects() {
        assert!(
            effect.estimate().abs() < 1e-8,
            "{} estimate {} not zero",
            effect.method(),
            effect.estimate()
        );
        assert!(
            *effect.std_error() > 1e-6,
            "{} standard error {} collapsed",
            effect.method(),
            effect.std_error()
        );
    }

    // Identical covariate distributions: one shared score, nothing trimmed,
    // everybody matched.
    assert_eq!(results.support().excluded(), 0);
    let psm = results.psm().as_ref().unwrap();
    assert_eq!(psm.matched().pairs.len(), 24);
    assert_eq!(psm.matched().unmatched_count(), 0);
    let mmws = results.mmws().as_ref().unwrap();
    assert_eq!(mmws.stratification().strata.len(), 1);
    Ok(())
}

#[test]
fn test_no_effect_with_random_assignment() -> Result<(), Box<dyn std::error::Error>> {
    // Treatment depends on the instrument alone and the true effect is zero.
    // Each estimate should sit within one SE of zero about two times in three;
    // over 40 seeded samples a biased method or an understated SE shows up as
    // low coverage or a drifting mean z-score.
    let seeds = 40;
    let methods = ["PSM", "IPTW", "MMWS", "IV", "DID"];
    let mut within_one_se = [0usize; 5];
    let mut z_sums = [0.0f64; 5];

    for seed in 0..seeds {
        let df = common::confounded_units(400, 0.0, 0.0, 500 + seed);
        let results = CausalAnalysis::new(df, common::full_roles(false)).run()?;

        let found: Vec<&str> = results.effects().iter().map(|e| e.method().as_str()).collect();
        assert_eq!(found, methods.to_vec(), "seed {}", 500 + seed);
        for (k, effect) in results.effects().into_iter().enumerate() {
            let se = *effect.std_error();
            assert!(se.is_finite() && se > 0.0, "{} SE {}", effect.method(), se);
            let z = effect.estimate() / se;
            assert!(z.abs() < 6.0, "{} seed {}: z = {}", effect.method(), 500 + seed, z);
            z_sums[k] += z;
            if z.abs() <= 1.0 {
                within_one_se[k] += 1;
            }
        }
    }

    for (k, method) in methods.iter().enumerate() {
        assert!(
            within_one_se[k] >= 18,
            "{}: only {} of {} estimates within one SE of zero",
            method,
            within_one_se[k],
            seeds
        );
        let mean_z = z_sums[k] / seeds as f64;
        assert!(mean_z.abs() < 0.75, "{}: mean z-score {}", method, mean_z);
    }
    Ok(())
}

#[test]
fn test_failing_method_does_not_discard_others() -> Result<(), Box<dyn std::error::Error>> {
    // An instrument identical to a covariate makes the first stage singular.
    let mut df = common::confounded_units(600, 1.0, 0.8, 5);
    let x1: Vec<f64> = df.column("x1")?.f64()?.into_no_null_iter().collect();
    df.with_column(Series::new("zdup".into(), x1))?;
    let mut roles = common::full_roles(false);
    roles.instruments = vec!["zdup".to_string()];

    let results = CausalAnalysis::new(df, roles).run()?;

    assert!(results.iv().is_none());
    let methods: Vec<&str> = results.effects().iter().map(|e| e.method().as_str()).collect();
    assert_eq!(methods, vec!["PSM", "IPTW", "MMWS", "DID"]);
    let failures: Vec<(&str, &str)> = results
        .warnings()
        .iter()
        .filter_map(|w| match w {
            AnalysisWarning::MethodFailed { method, error } => Some((method.as_str(), error.as_str())),
            _ => None,
        })
        .collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, "IV");
    assert!(failures[0].1.contains("Singular design"), "{}", failures[0].1);
    assert!(failures[0].1.contains("zdup"), "{}", failures[0].1);
    assert!(results.to_markdown().contains("IV failed: Singular design"));
    Ok(())
}

#[test]
fn test_methods_without_inputs_are_skipped() -> Result<(), Box<dyn std::error::Error>> {
    let df = common::confounded_units(400, 1.0, 0.5, 3);
    let mut roles = ColumnRoles::new("id", "treated", "outcome");
    roles.covariates = vec!["x1".to_string(), "x2".to_string()];

    let results = CausalAnalysis::new(df, roles).strata(4).run()?;

    assert_eq!(results.effects().len(), 3);
    assert!(results.iv().is_none());
    assert!(results.did().is_none());
    let skipped: Vec<&str> = results
        .warnings()
        .iter()
        .filter_map(|w| match w {
            AnalysisWarning::MethodSkipped { method, .. } => Some(method.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(skipped, vec!["IV", "DID"]);
    Ok(())
}

#[test]
fn test_interaction_terms_enter_balance_and_screening() -> Result<(), Box<dyn std::error::Error>> {
    let df = common::confounded_units(600, 1.0, 0.8, 5);

    let results = CausalAnalysis::new(df, common::full_roles(true))
        .interactions(&[("x1", "x2")])
        .run()?;

    assert!(results.balance_unadjusted().row("x1:x2").is_some());
    assert!(results.balance_unadjusted().row("region_north").is_some());
    assert_eq!(results.screening().len(), 1);
    assert_eq!(results.screening()[0].first, "x1");
    assert_eq!(results.screening()[0].second, "x2");
    Ok(())
}

#[test]
fn test_bootstrap_is_reproducible() -> Result<(), Box<dyn std::error::Error>> {
    let df = common::confounded_units(400, 1.0, 0.6, 21);

    let run = || {
        CausalAnalysis::new(df.clone(), common::full_roles(false))
            .bootstrap_reps(50)
            .seed(9)
            .run()
    };
    let first = run()?;
    let second = run()?;

    let a = first.psm().as_ref().unwrap().effect().bootstrap().as_ref().unwrap();
    let b = second.psm().as_ref().unwrap().effect().bootstrap().as_ref().unwrap();
    assert_eq!(a.reps(), 50);
    assert_eq!(a.std_error(), b.std_error());
    assert!(a.ci_lower() <= a.ci_upper());
    Ok(())
}

#[test]
fn test_export_formats() -> Result<(), Box<dyn std::error::Error>> {
    let df = common::confounded_units(400, 1.0, 0.6, 13);

    let results = CausalAnalysis::new(df, common::full_roles(true)).run()?;

    let json: serde_json::Value = serde_json::from_str(&results.to_json()?)?;
    assert_eq!(json["psm"]["effect"]["method"], "PSM");
    assert_eq!(json["iptw"]["effect"]["estimand"], "ATE");
    assert!(json["mmws"]["stratification"]["strata"].is_array());
    assert!(json["did"]["effect"]["notes"][0]
        .as_str()
        .unwrap()
        .contains("parallel trends"));

    let md = results.to_markdown();
    assert!(md.contains("### Treatment Effect Estimates"));
    assert!(md.contains("| MMWS |"));
    assert!(md.contains("### Covariate Balance: IPTW"));
    Ok(())
}
