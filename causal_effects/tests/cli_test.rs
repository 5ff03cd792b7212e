use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::process::Command;

fn base_command() -> Command {
    let mut cmd = Command::cargo_bin("causal-effects-cli").unwrap();
    cmd.arg("--data")
        .arg("tests/data/units.csv")
        .arg("--id")
        .arg("id")
        .arg("--treatment")
        .arg("treated")
        .arg("--outcome")
        .arg("outcome")
        .arg("--covariates")
        .arg("age,income");
    cmd
}

#[test]
fn test_propensity_methods() {
    let mut cmd = base_command();
    cmd.arg("--strata").arg("4");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Treatment Effect Estimates"))
        .stdout(predicate::str::contains("PSM"))
        .stdout(predicate::str::contains("IPTW"))
        .stdout(predicate::str::contains("MMWS"))
        .stdout(predicate::str::contains("Covariate balance: Stratified"))
        .stdout(predicate::str::contains("IV skipped"));
}

#[test]
fn test_all_five_methods() {
    let mut cmd = base_command();
    cmd.arg("--categorical")
        .arg("region")
        .arg("--interactions")
        .arg("age:income")
        .arg("--instruments")
        .arg("distance")
        .arg("--baseline")
        .arg("baseline");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("IV diagnostics"))
        .stdout(predicate::str::contains("First-stage F"))
        .stdout(predicate::str::contains("DID"))
        .stdout(predicate::str::contains("parallel trends assumed, not tested"))
        .stdout(predicate::str::contains("missing baseline outcome"));
}

#[test]
fn test_bootstrap_and_exports() {
    let dir = std::env::temp_dir();
    let json = dir.join("causal_effects_cli_test.json");
    let md = dir.join("causal_effects_cli_test.md");

    let mut cmd = base_command();
    cmd.arg("--bootstrap-reps")
        .arg("40")
        .arg("--seed")
        .arg("3")
        .arg("--match-scale")
        .arg("probability")
        .arg("--output-json")
        .arg(&json)
        .arg("--output-markdown")
        .arg(&md);

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("bootstrap SE"));

    let json_text = std::fs::read_to_string(&json).unwrap();
    assert!(json_text.contains("\"method\": \"PSM\""));
    let md_text = std::fs::read_to_string(&md).unwrap();
    assert!(md_text.contains("### Treatment Effect Estimates"));
}

#[test]
fn test_missing_column_fails() {
    let mut cmd = base_command();
    cmd.arg("--instruments").arg("does_not_exist");

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Column not found: does_not_exist"));
}

#[test]
fn test_malformed_interaction_fails() {
    let mut cmd = base_command();
    cmd.arg("--interactions").arg("age");

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("must be written as a:b"));
}
