use clap::Parser;
use colored::*;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use ab_inference::assignment::{assign, assign_stratified};
use ab_inference::cli::{Args, Command};
use ab_inference::config::EngineConfig;
use ab_inference::hypothesis::{check_sample_ratio_mismatch, TestResult};
use ab_inference::orchestrator::{Analyzer, ExperimentReport, Recommendation};
use ab_inference::power::{minimum_detectable_effect, post_hoc_power, required_sample_size};
use ab_inference::sequential::{sequential_test, spending_schedule};
use ab_inference::table::UnitTable;

// ---------------------------------------------------------------------------
// Output helpers
// ---------------------------------------------------------------------------

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn label(name: &str) -> ColoredString {
    name.bright_yellow()
}

fn colored_recommendation(recommendation: &Recommendation) -> ColoredString {
    let text = recommendation.to_string();
    match recommendation {
        Recommendation::Ship                  => text.bright_green().bold(),
        Recommendation::DoNotShip { .. }      => text.bright_red().bold(),
        Recommendation::KeepRunning           => text.bright_yellow().bold(),
        Recommendation::InvalidAnalysis { .. } => text.bright_magenta().bold(),
    }
}

fn print_test(name: &str, result: &TestResult, corrected_p: f64, significant: bool) {
    let verdict = if significant { "significant".bright_green() } else { "not significant".normal() };
    println!("{} ({})", name.bright_cyan().bold(), result.kind);
    println!(
        "  {}: {:.4} → {:.4}  (lift {:+.4}, {:+.2}%)",
        label("Estimate"),
        result.control_estimate,
        result.treatment_estimate,
        result.absolute_lift,
        result.relative_lift * 100.0
    );
    println!(
        "  {}: [{:.4}, {:.4}] at {:.0}%",
        label("CI"),
        result.ci_lower,
        result.ci_upper,
        result.ci_level * 100.0
    );
    println!(
        "  {}: {:.3}  p = {:.4}  corrected p = {:.4}  {}",
        label("Statistic"),
        result.statistic,
        result.p_value,
        corrected_p,
        verdict
    );
    if result.degenerate {
        println!("  {}", "degenerate input: no variation to test".bright_magenta());
    }
}

fn print_report(report: &ExperimentReport) {
    println!("{}", "EXPERIMENT ANALYSIS".bright_cyan().bold());
    let counts = &report.data_quality.arm_counts;
    println!(
        "{}: control {}  treatment {}  holdout {}  unlabeled {}",
        label("Units"),
        counts.control,
        counts.treatment,
        counts.holdout,
        counts.unlabeled
    );
    let srm = &report.data_quality.srm;
    let srm_text = if srm.srm_detected { "MISMATCH".bright_red().bold() } else { "ok".bright_green() };
    println!(
        "{}: {}  (observed {:.4}, expected {:.4}, p = {:.4})",
        label("Sample ratio"),
        srm_text,
        srm.observed_ratio,
        srm.expected_ratio,
        srm.p_value
    );
    if report.data_quality.completeness.duplicate_rows > 0 {
        println!(
            "{}: {} duplicate unit ids",
            label("Warning").bright_red(),
            report.data_quality.completeness.duplicate_rows
        );
    }
    if let Some(correction) = &report.correction {
        println!("{}: {} over {} metrics", label("Correction"), correction.method, correction.num_tests);
    }
    println!();

    for metric in &report.metrics {
        print_test(&metric.metric, &metric.result, metric.corrected_p_value, metric.significant_after_correction);
        if let Some(cuped) = &metric.cuped {
            println!(
                "  {}: covariate {}  theta {:.4}  variance reduction {:.1}%",
                label("CUPED"),
                cuped.covariate,
                cuped.theta,
                cuped.variance_reduction * 100.0
            );
        }
    }
    for skipped in &report.skipped {
        println!("{} {}: {}", "skipped".bright_magenta(), skipped.metric, skipped.reason);
    }
    if let Some(power) = report.primary_power {
        println!("{}: {:.1}%", label("Primary power"), power * 100.0);
    }
    println!();
    println!("{}: {}", label("Recommendation"), colored_recommendation(&report.recommendation));
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    match args.command {
        Command::Analyze { data, metrics, primary, config, alpha } => {
            let mut engine_config = match config {
                Some(path) => EngineConfig::load(path)?,
                None => EngineConfig::default(),
            };
            if let Some(alpha) = alpha {
                engine_config.analysis.alpha = alpha;
            }
            let table = UnitTable::from_json_str(&std::fs::read_to_string(data)?)?;
            let primary = primary
                .or_else(|| metrics.first().cloned())
                .ok_or("at least one metric is required")?;
            let report = Analyzer::new(engine_config)?.analyze(&table, &metrics, &primary)?;
            if args.json {
                print_json(&report)?;
            } else {
                print_report(&report);
            }
        }

        Command::Assign { unit, experiment, variants, traffic, seed, stratum } => {
            let variant = match &stratum {
                Some(stratum) => assign_stratified(&unit, &experiment, stratum, variants)?,
                None => assign(&unit, &experiment, variants, traffic, seed)?,
            };
            if args.json {
                print_json(&serde_json::json!({
                    "unit_id": unit,
                    "experiment_id": experiment,
                    "stratum": stratum,
                    "variant": variant,
                }))?;
            } else {
                println!("{}", variant);
            }
        }

        Command::SampleSize { baseline, mde, alpha, power } => {
            let n = required_sample_size(baseline, mde, alpha, power)?;
            let total = n.saturating_mul(2);
            if args.json {
                print_json(&serde_json::json!({ "sample_size_per_arm": n, "total": total }))?;
            } else {
                println!("{}: {} per arm ({} total)", label("Sample size"), n, total);
            }
        }

        Command::Mde { baseline, sample_size, alpha, power } => {
            let mde = minimum_detectable_effect(baseline, sample_size, alpha, power)?;
            if args.json {
                print_json(&serde_json::json!({ "minimum_detectable_effect": mde }))?;
            } else {
                println!(
                    "{}: {:.2}% relative ({:.4} → {:.4})",
                    label("MDE"),
                    mde * 100.0,
                    baseline,
                    baseline * (1.0 + mde)
                );
            }
        }

        Command::Power { n_control, n_treatment, control_rate, treatment_rate, alpha } => {
            let power = post_hoc_power(n_control, n_treatment, control_rate, treatment_rate, alpha)?;
            if args.json {
                print_json(&serde_json::json!({ "power": power }))?;
            } else {
                println!("{}: {:.1}%", label("Power"), power * 100.0);
            }
        }

        Command::Srm { control, treatment, expected_ratio, threshold } => {
            let srm = check_sample_ratio_mismatch(control, treatment, expected_ratio, threshold)?;
            if args.json {
                print_json(&srm)?;
            } else {
                let verdict = if srm.srm_detected { "MISMATCH".bright_red().bold() } else { "ok".bright_green() };
                println!(
                    "{}: {}  (chi² {:.3}, p = {:.4}, observed {:.4})",
                    label("Sample ratio"),
                    verdict,
                    srm.chi2_statistic,
                    srm.p_value,
                    srm.observed_ratio
                );
            }
        }

        Command::Spend { fractions, alpha, p_value } => {
            let looks = spending_schedule(&fractions, alpha)?;
            let decision = match (p_value, fractions.last()) {
                (Some(p), Some(&fraction)) => Some(sequential_test(p, fraction, alpha)?),
                _ => None,
            };
            if args.json {
                print_json(&serde_json::json!({ "looks": looks, "decision": decision }))?;
            } else {
                for look in &looks {
                    println!(
                        "{}: {:.2}  cumulative α {:.6}  incremental α {:.6}",
                        label("Look"),
                        look.fraction,
                        look.cumulative_alpha,
                        look.incremental_alpha
                    );
                }
                if let Some(d) = decision {
                    let verdict = if d.significant_at_current_stage {
                        "stop: significant".bright_green().bold()
                    } else {
                        "continue".bright_yellow()
                    };
                    println!(
                        "{}: p = {:.6} vs boundary α {:.6} → {}",
                        label("Decision"),
                        d.current_p_value,
                        d.alpha_spent,
                        verdict
                    );
                }
            }
        }
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    run(Args::parse())
}
