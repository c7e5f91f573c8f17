use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "ab-inference")]
#[command(version)]
#[command(about = "Statistical inference engine for A/B experiments")]
pub struct Args {
    /// Emit machine-readable JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Analyze a unit-level table and recommend ship / do-not-ship / keep running
    Analyze {
        /// JSON array of unit rows (unit_id, variant, stratum, metric columns)
        #[arg(long)]
        data: PathBuf,

        /// Metric columns to test, comma separated
        #[arg(long, value_delimiter = ',', required = true)]
        metrics: Vec<String>,

        /// Metric that drives the recommendation (defaults to the first metric)
        #[arg(long)]
        primary: Option<String>,

        /// TOML configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override the configured significance level
        #[arg(long)]
        alpha: Option<f64>,
    },

    /// Deterministically assign a unit to a variant
    Assign {
        #[arg(long)]
        unit: String,

        #[arg(long)]
        experiment: String,

        #[arg(long, default_value = "2")]
        variants: u32,

        /// Fraction of units admitted to the experiment
        #[arg(long, default_value = "1.0")]
        traffic: f64,

        #[arg(long)]
        seed: Option<u64>,

        /// Use stratified assignment within this stratum (ignores traffic and seed)
        #[arg(long)]
        stratum: Option<String>,
    },

    /// Units per arm needed to detect a relative lift
    SampleSize {
        /// Control conversion rate
        #[arg(long)]
        baseline: f64,

        /// Relative minimum detectable effect (0.1 = 10 % lift)
        #[arg(long)]
        mde: f64,

        #[arg(long, default_value = "0.05")]
        alpha: f64,

        #[arg(long, default_value = "0.8")]
        power: f64,
    },

    /// Smallest relative lift detectable with a given sample size per arm
    Mde {
        #[arg(long)]
        baseline: f64,

        #[arg(long)]
        sample_size: u64,

        #[arg(long, default_value = "0.05")]
        alpha: f64,

        #[arg(long, default_value = "0.8")]
        power: f64,
    },

    /// Achieved power for observed conversion rates
    Power {
        #[arg(long)]
        n_control: u64,

        #[arg(long)]
        n_treatment: u64,

        #[arg(long)]
        control_rate: f64,

        #[arg(long)]
        treatment_rate: f64,

        #[arg(long, default_value = "0.05")]
        alpha: f64,
    },

    /// Sample-ratio-mismatch check on arm sizes
    Srm {
        #[arg(long)]
        control: u64,

        #[arg(long)]
        treatment: u64,

        /// Expected control share
        #[arg(long, default_value = "0.5")]
        expected_ratio: f64,

        #[arg(long, default_value = "0.01")]
        threshold: f64,
    },

    /// O'Brien–Fleming alpha spending for interim looks
    Spend {
        /// Information fractions of the planned looks, comma separated
        #[arg(long, value_delimiter = ',', required = true)]
        fractions: Vec<f64>,

        #[arg(long, default_value = "0.05")]
        alpha: f64,

        /// Evaluate this p-value at the last listed fraction
        #[arg(long)]
        p_value: Option<f64>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_analyze_metric_list() {
        let args = Args::parse_from([
            "ab-inference", "analyze", "--data", "units.json", "--metrics", "converted,revenue",
        ]);
        match args.command {
            Command::Analyze { metrics, primary, alpha, .. } => {
                assert_eq!(metrics, vec!["converted".to_string(), "revenue".to_string()]);
                assert!(primary.is_none());
                assert!(alpha.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_parse_json_flag_after_subcommand() {
        let args = Args::parse_from(["ab-inference", "srm", "--control", "10", "--treatment", "12", "--json"]);
        assert!(args.json);
    }

    #[test]
    fn test_parse_sample_size_defaults() {
        let args = Args::parse_from(["ab-inference", "sample-size", "--baseline", "0.4", "--mde", "0.15"]);
        match args.command {
            Command::SampleSize { alpha, power, .. } => {
                assert_eq!(alpha, 0.05);
                assert_eq!(power, 0.8);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_parse_spend_fractions() {
        let args = Args::parse_from(["ab-inference", "spend", "--fractions", "0.25,0.5,1.0"]);
        match args.command {
            Command::Spend { fractions, p_value, .. } => {
                assert_eq!(fractions, vec![0.25, 0.5, 1.0]);
                assert!(p_value.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_analyze_requires_metrics() {
        assert!(Args::try_parse_from(["ab-inference", "analyze", "--data", "u.json"]).is_err());
    }
}
