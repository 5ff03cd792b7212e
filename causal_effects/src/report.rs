use crate::analysis::AnalysisResults;
use crate::balance::BalanceTable;
use crate::effect::EffectResult;
use comfy_table::{Cell, Table};

fn fmt_opt(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{:.3}", v))
}

fn effect_row(effect: &EffectResult) -> Vec<String> {
    vec![
        effect.method().clone(),
        effect.estimand().to_string(),
        format!("{:.4}", effect.estimate()),
        format!("{:.4}", effect.std_error()),
        format!("{:.3}", effect.statistic()),
        format!("{:.4}", effect.p_value()),
        format!("{:.3}", effect.effect_size()),
        effect.n_obs().to_string(),
    ]
}

const EFFECT_HEADER: [&str; 8] = [
    "Method",
    "Estimand",
    "Estimate",
    "Std. Err.",
    "t",
    "p-value",
    "Effect size",
    "N",
];

fn balance_table(balance: &BalanceTable) -> Table {
    let mut table = Table::new();
    table.set_header(vec!["Term", "SMD before", "VR before", "SMD after", "VR after"]);
    for row in &balance.rows {
        table.add_row(vec![
            Cell::new(&row.term),
            Cell::new(format!("{:.3}", row.diff_before)),
            Cell::new(fmt_opt(row.variance_ratio_before)),
            Cell::new(format!("{:.3}", row.diff_after)),
            Cell::new(fmt_opt(row.variance_ratio_after)),
        ]);
    }
    table
}

impl AnalysisResults {
    /// Prints a formatted summary of the analysis to the console.
    pub fn summary(&self) {
        println!("Treatment Effect Estimates");
        println!("========================================");
        println!(
            "Units: {} ({} treated, {} control), {} rows dropped",
            self.n_units(),
            self.n_treated(),
            self.n_control(),
            self.dropped_rows()
        );
        let support = self.support();
        println!(
            "Common support: [{:.4}, {:.4}], {} units excluded ({} treated, {} control)",
            support.lower,
            support.upper,
            support.excluded(),
            support.excluded_treated,
            support.excluded_control
        );
        if let Some(psm) = self.psm() {
            println!(
                "Matched pairs: {}, unmatched treated: {}",
                psm.matched().pairs.len(),
                psm.matched().unmatched_count()
            );
        }
        println!();

        let mut effects = Table::new();
        effects.set_header(EFFECT_HEADER.to_vec());
        for effect in self.effects() {
            effects.add_row(effect_row(effect));
        }
        println!("{}", effects);
        for effect in self.effects() {
            for note in effect.notes() {
                println!("  {}: {}", effect.method(), note);
            }
            if let Some(boot) = effect.bootstrap() {
                println!(
                    "  {}: bootstrap SE {:.4}, 95% CI [{:.3}, {:.3}] over {} replicates",
                    effect.method(),
                    boot.std_error(),
                    boot.ci_lower(),
                    boot.ci_upper(),
                    boot.reps()
                );
            }
        }

        if let Some(iv) = self.iv() {
            let fs = iv.first_stage();
            println!("\nIV diagnostics");
            println!(
                "  First-stage F = {:.3} (df {}, {}), partial R² = {:.3}{}",
                fs.f_statistic,
                fs.df_numerator,
                fs.df_denominator,
                fs.partial_r_squared,
                if fs.weak { "  [weak]" } else { "" }
            );
            for test in [iv.overidentification(), iv.endogeneity()] {
                match test.statistic {
                    Some(stat) => println!(
                        "  {} = {:.3} (p = {})",
                        test.name,
                        stat,
                        fmt_opt(test.p_value)
                    ),
                    None => println!(
                        "  {}: not computable{}",
                        test.name,
                        test.note.as_deref().map(|n| format!(" ({})", n)).unwrap_or_default()
                    ),
                }
            }
            println!(
                "  OLS comparison estimate = {:.4} (SE {:.4})",
                iv.ols_estimate(),
                iv.ols_std_error()
            );
        }

        for balance in [self.balance_unadjusted()]
            .into_iter()
            .chain(self.balance_tables())
        {
            println!("\nCovariate balance: {}", balance.adjustment);
            println!("{}", balance_table(balance));
        }

        if let Some(mmws) = self.mmws() {
            let mut strata = Table::new();
            strata.set_header(vec!["Stratum", "Logit range", "Treated", "Control", "Effect", "Std. Err."]);
            for (stratum, effect) in mmws.stratification().strata.iter().zip(mmws.stratum_effects()) {
                let (estimate, se) = match &effect.effect {
                    Some(e) => (format!("{:.4}", e.estimate()), format!("{:.4}", e.std_error())),
                    None => ("n/a".to_string(), "n/a".to_string()),
                };
                strata.add_row(vec![
                    stratum.label.to_string(),
                    format!("[{:.3}, {:.3}]", stratum.lower, stratum.upper),
                    stratum.treated.n.to_string(),
                    stratum.control.n.to_string(),
                    estimate,
                    se,
                ]);
            }
            println!("\nStrata");
            println!("{}", strata);
        }

        if !self.warnings().is_empty() {
            println!("\nWarnings");
            for warning in self.warnings() {
                println!("  - {}", warning);
            }
        }
    }

    /// Exports the effect estimates and balance tables to Markdown.
    pub fn to_markdown(&self) -> String {
        let mut md = String::new();
        md.push_str("### Treatment Effect Estimates\n\n");
        md.push_str(&format!("| {} |\n", EFFECT_HEADER.join(" | ")));
        md.push_str("|---|---|---|---|---|---|---|---|\n");
        for effect in self.effects() {
            md.push_str(&format!("| {} |\n", effect_row(effect).join(" | ")));
        }
        for balance in self.balance_tables() {
            md.push_str(&format!("\n### Covariate Balance: {}\n\n", balance.adjustment));
            md.push_str("| Term | SMD before | VR before | SMD after | VR after |\n");
            md.push_str("|---|---|---|---|---|\n");
            for row in &balance.rows {
                md.push_str(&format!(
                    "| {} | {:.3} | {} | {:.3} | {} |\n",
                    row.term,
                    row.diff_before,
                    fmt_opt(row.variance_ratio_before),
                    row.diff_after,
                    fmt_opt(row.variance_ratio_after)
                ));
            }
        }
        if !self.warnings().is_empty() {
            md.push_str("\n### Warnings\n\n");
            for warning in self.warnings() {
                md.push_str(&format!("- {}\n", warning));
            }
        }
        md
    }

    /// Exports the results to a JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
