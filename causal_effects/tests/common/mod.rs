#![allow(dead_code)]

use causal_effects::ColumnRoles;
use polars::prelude::*;
use rand::distributions::Distribution;
use rand::prelude::*;
use statrs::distribution::Normal;

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

/// Units whose treatment depends on `x1`, `x2` and the instrument `z`.
///
/// The unit effect `1 + x1 + 0.5·x2` enters both periods, so trends are
/// parallel, and `z` moves treatment without entering the outcome.
pub fn confounded_units(n: usize, effect: f64, confounding: f64, seed: u64) -> DataFrame {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, 1.0).unwrap();
    let regions = ["north", "south", "east"];
    let mut id = Vec::with_capacity(n);
    let mut treated = Vec::with_capacity(n);
    let mut outcome = Vec::with_capacity(n);
    let mut baseline = Vec::with_capacity(n);
    let mut x1 = Vec::with_capacity(n);
    let mut x2 = Vec::with_capacity(n);
    let mut region = Vec::with_capacity(n);
    let mut z = Vec::with_capacity(n);

    for i in 0..n {
        let a = normal.sample(&mut rng);
        let b = normal.sample(&mut rng);
        let instrument = normal.sample(&mut rng);
        let p = sigmoid(-0.5 + confounding * a - 0.5 * confounding * b + 1.2 * instrument);
        let d = if rng.gen::<f64>() < p { 1 } else { 0 };
        let unit = 1.0 + a + 0.5 * b;

        id.push(i as i64 + 1);
        treated.push(d);
        baseline.push(unit + normal.sample(&mut rng));
        outcome.push(unit + 0.5 + effect * d as f64 + normal.sample(&mut rng));
        x1.push(a);
        x2.push(b);
        region.push(regions[rng.gen_range(0..regions.len())]);
        z.push(instrument);
    }

    df!(
        "id" => id,
        "treated" => treated,
        "outcome" => outcome,
        "baseline" => baseline,
        "x1" => x1,
        "x2" => x2,
        "region" => region,
        "z" => z
    )
    .unwrap()
}

/// Groups of four units sharing covariates and outcomes: two treated, two
/// control. Every estimator should report an effect of zero.
///
/// Covariates are small integers so the propensity score equations are
/// solved exactly at zero and all units share one score.
pub fn balanced_quads(quads: usize) -> DataFrame {
    let mut id = Vec::new();
    let mut treated = Vec::new();
    let mut outcome = Vec::new();
    let mut baseline = Vec::new();
    let mut x1 = Vec::new();
    let mut x2 = Vec::new();
    let mut z = Vec::new();

    for q in 0..quads {
        let pre = 3.0 + 0.5 * ((q * q) % 11) as f64;
        let post = pre + 1.0 + ((q * 5) % 3) as f64;
        // (treated, instrument shift) for the four members
        for (m, (d, u)) in [(1, 1.0), (1, -1.0), (0, 1.0), (0, -1.0)].iter().enumerate() {
            id.push((q * 4 + m) as i64 + 1);
            treated.push(*d);
            outcome.push(post);
            baseline.push(pre);
            x1.push((q % 4) as f64);
            x2.push(((q * 7) % 5) as f64);
            z.push(*d as f64 + u);
        }
    }

    df!(
        "id" => id,
        "treated" => treated,
        "outcome" => outcome,
        "baseline" => baseline,
        "x1" => x1,
        "x2" => x2,
        "z" => z
    )
    .unwrap()
}

/// Roles for the generated frames, with IV and DID enabled.
pub fn full_roles(categorical: bool) -> ColumnRoles {
    let mut roles = ColumnRoles::new("id", "treated", "outcome");
    roles.covariates = vec!["x1".to_string(), "x2".to_string()];
    if categorical {
        roles.categorical = vec!["region".to_string()];
    }
    roles.instruments = vec!["z".to_string()];
    roles.baseline_outcome = Some("baseline".to_string());
    roles
}
