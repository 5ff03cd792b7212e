use polars::prelude::*;
use rand::distributions::Distribution;
use rand::prelude::*;
use statrs::distribution::Normal;
use std::fs::File;
use std::io::BufWriter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let n_rows = 50_000;
    let effect = 1.5;
    let mut rng = StdRng::seed_from_u64(42);
    let normal = Normal::new(0.0, 1.0)?;

    let age: Vec<f64> = (0..n_rows).map(|_| rng.gen_range(20.0..65.0)).collect();
    let income: Vec<f64> = (0..n_rows).map(|_| 50.0 + 12.0 * normal.sample(&mut rng)).collect();
    let region: Vec<&str> = (0..n_rows)
        .map(|_| ["north", "south", "east"][rng.gen_range(0..3)])
        .collect();
    // Distance to the nearest provider shifts take-up only.
    let distance: Vec<f64> = (0..n_rows).map(|_| normal.sample(&mut rng)).collect();

    // Older, richer units opt in more often.
    let treated: Vec<i32> = (0..n_rows)
        .map(|i| {
            let lin = -0.3 + 0.05 * (age[i] - 42.5) + 0.04 * (income[i] - 50.0) - 0.9 * distance[i];
            let p = 1.0 / (1.0 + (-lin).exp());
            i32::from(rng.gen_bool(p))
        })
        .collect();

    let mut baseline = Vec::with_capacity(n_rows);
    let mut outcome = Vec::with_capacity(n_rows);
    for i in 0..n_rows {
        let unit = 10.0 + 0.1 * (age[i] - 42.5) + 0.05 * (income[i] - 50.0);
        baseline.push(unit + normal.sample(&mut rng));
        outcome.push(unit + 0.8 + effect * treated[i] as f64 + normal.sample(&mut rng));
    }

    let mut df = df!(
        "id" => (1..=n_rows as i64).collect::<Vec<_>>(),
        "treated" => treated,
        "outcome" => outcome,
        "baseline" => baseline,
        "age" => age,
        "income" => income,
        "region" => region,
        "distance" => distance
    )?;

    let file = File::create("units_50k.csv")?;
    let mut writer = BufWriter::new(file);
    CsvWriter::new(&mut writer).finish(&mut df)?;

    println!("Generated units_50k.csv with {} rows (true effect {}).", n_rows, effect);
    Ok(())
}
