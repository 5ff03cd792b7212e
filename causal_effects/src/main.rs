use causal_effects::{
    AnalysisConfig, CausalAnalysis, ColumnRoles, MatchScale, ReferenceSd, StratificationMode, Term,
};
use clap::{CommandFactory, Parser, ValueEnum};
use polars::prelude::*;
use std::error::Error;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(ValueEnum, Clone, Copy, Debug)]
enum StratificationArg {
    Quantile,
    EqualWidth,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ScaleArg {
    Logit,
    Probability,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ReferenceSdArg {
    ControlOutcome,
    Residual,
}

/// Estimate treatment effects with PSM, IPTW, MMWS, IV and DID from a cleaned CSV.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the input CSV data file
    #[arg(short, long)]
    data: PathBuf,

    /// Unit identifier column
    #[arg(long)]
    id: String,

    /// Binary (0/1) treatment column
    #[arg(long)]
    treatment: String,

    /// Primary (post-treatment) outcome column
    #[arg(long)]
    outcome: String,

    /// A comma-separated list of numeric covariate columns
    #[arg(long, value_delimiter = ',')]
    covariates: Vec<String>,

    /// A comma-separated list of categorical covariate columns
    #[arg(long, value_delimiter = ',')]
    categorical: Vec<String>,

    /// A comma-separated list of interaction terms written as `a:b`
    #[arg(long, value_delimiter = ',')]
    interactions: Vec<String>,

    /// A comma-separated list of instrument columns (enables IV)
    #[arg(long, value_delimiter = ',')]
    instruments: Vec<String>,

    /// Baseline (pre-treatment) outcome column (enables DID)
    #[arg(long)]
    baseline: Option<String>,

    /// JSON file with analysis settings; explicit flags take precedence
    #[arg(long)]
    config: Option<PathBuf>,

    /// Caliper as a fraction of the logit-score standard deviation
    #[arg(long)]
    caliper: Option<f64>,

    /// Number of propensity-score strata
    #[arg(long)]
    strata: Option<usize>,

    /// Stratum boundary placement
    #[arg(long, value_enum)]
    stratification: Option<StratificationArg>,

    /// Score scale used for matching distances
    #[arg(long, value_enum)]
    match_scale: Option<ScaleArg>,

    /// Reference standard deviation for effect sizes
    #[arg(long, value_enum)]
    reference_sd: Option<ReferenceSdArg>,

    /// First-stage F below which an instrument is flagged as weak
    #[arg(long)]
    weak_instrument_threshold: Option<f64>,

    /// Matched-pair bootstrap replications (0 disables)
    #[arg(long)]
    bootstrap_reps: Option<usize>,

    /// Seed for the bootstrap
    #[arg(long)]
    seed: Option<u64>,

    /// Path to export results as JSON
    #[arg(long)]
    output_json: Option<PathBuf>,

    /// Path to export results as Markdown
    #[arg(long)]
    output_markdown: Option<PathBuf>,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "warn")]
    log_level: String,
}

fn load_config(args: &Cli) -> Result<AnalysisConfig, Box<dyn Error>> {
    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)?;
            serde_json::from_str(&text).map_err(|e| format!("Invalid config file: {}", e))?
        }
        None => AnalysisConfig::default(),
    };
    if let Some(caliper) = args.caliper {
        config.caliper = caliper;
    }
    if let Some(strata) = args.strata {
        config.n_strata = strata;
    }
    if let Some(mode) = args.stratification {
        config.stratification = match mode {
            StratificationArg::Quantile => StratificationMode::Quantile,
            StratificationArg::EqualWidth => StratificationMode::EqualWidth,
        };
    }
    if let Some(scale) = args.match_scale {
        config.match_scale = match scale {
            ScaleArg::Logit => MatchScale::Logit,
            ScaleArg::Probability => MatchScale::Probability,
        };
    }
    if let Some(sd) = args.reference_sd {
        config.reference_sd = match sd {
            ReferenceSdArg::ControlOutcome => ReferenceSd::ControlOutcome,
            ReferenceSdArg::Residual => ReferenceSd::Residual,
        };
    }
    if let Some(threshold) = args.weak_instrument_threshold {
        config.weak_instrument_threshold = threshold;
    }
    if let Some(reps) = args.bootstrap_reps {
        config.bootstrap_reps = reps;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    Ok(config)
}

fn run_analysis(args: Cli) -> Result<(), Box<dyn Error>> {
    let config = load_config(&args)?;

    let df = CsvReadOptions::default()
        .with_has_header(true)
        .try_into_reader_with_file_path(Some(args.data.clone()))?
        .finish()?;

    let mut roles = ColumnRoles::new(&args.id, &args.treatment, &args.outcome);
    roles.covariates = args.covariates.clone();
    roles.categorical = args.categorical.clone();
    roles.instruments = args.instruments.clone();
    roles.baseline_outcome = args.baseline.clone();

    let mut pairs = Vec::new();
    for spec in &args.interactions {
        match spec.parse::<Term>()? {
            Term::Interaction(a, b) => pairs.push((a, b)),
            Term::Main(name) => {
                return Err(format!("Interaction '{}' must be written as a:b", name).into())
            }
        }
    }
    let pair_refs: Vec<(&str, &str)> = pairs.iter().map(|(a, b)| (a.as_str(), b.as_str())).collect();

    let mut analysis = CausalAnalysis::new(df, roles);
    analysis.config(config).interactions(&pair_refs);
    let results = analysis.run()?;
    results.summary();

    if let Some(path) = args.output_json {
        let json = results
            .to_json()
            .map_err(|e| format!("Failed to serialize to JSON: {}", e))?;
        std::fs::write(path, json)?;
    }
    if let Some(path) = args.output_markdown {
        std::fs::write(path, results.to_markdown())?;
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run_analysis(cli) {
        eprintln!("Error: {}", e);
        let mut cmd = Cli::command();
        let _ = cmd.print_help();
        std::process::exit(1);
    }
}
