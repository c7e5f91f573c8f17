//! Engine configuration.
//!
//! Configuration is an explicit value handed to each component at
//! construction; there are no process-wide defaults. The structs deserialize
//! from TOML with every field optional:
//!
//! ```toml
//! [analysis]
//! alpha = 0.05
//! power = 0.80
//! srm_threshold = 0.01
//! multiple_testing_method = "bh"
//!
//! [analysis.cuped_covariates]
//! sessions_count = "pre_sessions_count"
//!
//! [assignment]
//! experiment_id = "verification_v1"
//! variant_count = 2
//! traffic_allocation = 1.0
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::correction::CorrectionMethod;
use crate::error::{ensure_open_unit, EngineError, Result};

// ---------------------------------------------------------------------------
// AnalysisConfig
// ---------------------------------------------------------------------------

/// Options consumed by the hypothesis tester, the corrector and the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Significance level for every headline test (default: 0.05).
    pub alpha: f64,
    /// Target power for planning calculations (default: 0.80).
    pub power: f64,
    /// p-value below which a sample ratio mismatch is flagged (default: 0.01).
    ///
    /// Kept independent of `alpha` so SRM uses the stricter conventional bar.
    pub srm_threshold: f64,
    /// Expected share of control units among control + treatment (default: 0.5).
    pub expected_ratio: f64,
    /// Correction applied when more than one metric is tested (default: bh).
    pub multiple_testing_method: CorrectionMethod,
    /// Use Student's pooled-variance t-test instead of Welch's (default: false).
    pub equal_variance: bool,
    /// Apply CUPED to continuous metrics that have a mapped covariate (default: true).
    pub use_cuped: bool,
    /// Metric name → pre-period covariate column.
    pub cuped_covariates: BTreeMap<String, String>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            alpha: 0.05,
            power: 0.80,
            srm_threshold: 0.01,
            expected_ratio: 0.5,
            multiple_testing_method: CorrectionMethod::BenjaminiHochberg,
            equal_variance: false,
            use_cuped: true,
            cuped_covariates: BTreeMap::new(),
        }
    }
}

impl AnalysisConfig {
    /// Default configuration with a different significance level.
    pub fn with_alpha(alpha: f64) -> Self {
        Self { alpha, ..Self::default() }
    }

    pub fn validate(&self) -> Result<()> {
        ensure_open_unit("alpha", self.alpha)?;
        ensure_open_unit("power", self.power)?;
        ensure_open_unit("srm_threshold", self.srm_threshold)?;
        ensure_open_unit("expected_ratio", self.expected_ratio)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// AssignmentConfig
// ---------------------------------------------------------------------------

/// Options for the variant assigner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssignmentConfig {
    /// Experiment used to label rows that arrive without a variant.
    pub experiment_id: Option<String>,
    /// Number of equally-sized buckets, control included (default: 2).
    pub variant_count: u32,
    /// Fraction of units admitted to the experiment (default: 1.0).
    pub traffic_allocation: f64,
    /// Optional salt mixed into the hash input.
    pub seed: Option<u64>,
}

impl Default for AssignmentConfig {
    fn default() -> Self {
        Self {
            experiment_id: None,
            variant_count: 2,
            traffic_allocation: 1.0,
            seed: None,
        }
    }
}

impl AssignmentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.variant_count < 1 {
            return Err(EngineError::config("variant_count must be >= 1"));
        }
        if !(0.0..=1.0).contains(&self.traffic_allocation) {
            return Err(EngineError::config(format!(
                "traffic_allocation must be in [0, 1], got {}",
                self.traffic_allocation
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

/// Top-level configuration as read from a TOML file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub analysis: AnalysisConfig,
    pub assignment: AssignmentConfig,
}

impl EngineConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        self.analysis.validate()?;
        self.assignment.validate()
    }
}

impl From<AnalysisConfig> for EngineConfig {
    fn from(analysis: AnalysisConfig) -> Self {
        Self { analysis, ..Self::default() }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let c = EngineConfig::default();
        assert_eq!(c.analysis.alpha, 0.05);
        assert_eq!(c.analysis.power, 0.80);
        assert_eq!(c.analysis.srm_threshold, 0.01);
        assert_eq!(c.analysis.multiple_testing_method, CorrectionMethod::BenjaminiHochberg);
        assert_eq!(c.assignment.variant_count, 2);
        assert_eq!(c.assignment.traffic_allocation, 1.0);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_empty_toml_yields_defaults() {
        let c = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(c, EngineConfig::default());
    }

    #[test]
    fn test_toml_overrides_fields() {
        let c = EngineConfig::from_toml_str(
            r#"
            [analysis]
            alpha = 0.1
            multiple_testing_method = "holm"
            equal_variance = true

            [analysis.cuped_covariates]
            sessions = "pre_sessions"

            [assignment]
            experiment_id = "exp_1"
            variant_count = 3
            traffic_allocation = 0.5
            seed = 7
            "#,
        )
        .unwrap();
        assert_eq!(c.analysis.alpha, 0.1);
        assert_eq!(c.analysis.multiple_testing_method, CorrectionMethod::Holm);
        assert!(c.analysis.equal_variance);
        assert_eq!(c.analysis.cuped_covariates.get("sessions").map(String::as_str), Some("pre_sessions"));
        assert_eq!(c.assignment.experiment_id.as_deref(), Some("exp_1"));
        assert_eq!(c.assignment.variant_count, 3);
        assert_eq!(c.assignment.seed, Some(7));
    }

    #[test]
    fn test_alpha_out_of_range_rejected() {
        let err = EngineConfig::from_toml_str("[analysis]\nalpha = 1.5\n").unwrap_err();
        assert!(err.is_invalid_configuration());
    }

    #[test]
    fn test_zero_variant_count_rejected() {
        let c = AssignmentConfig { variant_count: 0, ..AssignmentConfig::default() };
        assert!(c.validate().unwrap_err().is_invalid_configuration());
    }

    #[test]
    fn test_traffic_allocation_out_of_range_rejected() {
        let c = AssignmentConfig { traffic_allocation: 1.2, ..AssignmentConfig::default() };
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_malformed_toml_is_parse_error() {
        let err = EngineConfig::from_toml_str("[analysis\nalpha=").unwrap_err();
        assert!(matches!(err, EngineError::ConfigParse(_)));
    }

    #[test]
    fn test_with_alpha_keeps_other_defaults() {
        let c = AnalysisConfig::with_alpha(0.01);
        assert_eq!(c.alpha, 0.01);
        assert_eq!(c.srm_threshold, 0.01);
        assert!(c.use_cuped);
    }
}
