//! # Stage: Multiple-Testing Correction
//!
//! ## Responsibility
//! Adjust a batch of p-values for multiplicity and decide which hypotheses
//! are rejected at a family-wise (or false-discovery) level `alpha`.
//!
//! | Method      | Controls | Adjusted p                                 |
//! |-------------|----------|--------------------------------------------|
//! | BH (default)| FDR      | step-up min of `m/i · p(i)`                |
//! | Bonferroni  | FWER     | `m · p`                                    |
//! | Holm        | FWER     | step-down max of `(m − i + 1) · p(i)`      |
//! | Šidák       | FWER     | `1 − (1 − p)^m`                            |
//!
//! ## Guarantees
//! - Positional: `adjusted_p_values[i]` and `rejected[i]` describe input `i`
//! - Every adjusted p-value is ≥ its raw p-value and ≤ 1
//! - Empty input yields an empty result, never an error

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ensure_open_unit, EngineError, Result};

// ---------------------------------------------------------------------------
// CorrectionMethod
// ---------------------------------------------------------------------------

/// Supported adjustment procedures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CorrectionMethod {
    /// Benjamini–Hochberg false discovery rate.
    #[default]
    BenjaminiHochberg,
    Bonferroni,
    /// Holm–Bonferroni step-down.
    Holm,
    Sidak,
}

impl fmt::Display for CorrectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorrectionMethod::BenjaminiHochberg => write!(f, "bh"),
            CorrectionMethod::Bonferroni        => write!(f, "bonferroni"),
            CorrectionMethod::Holm              => write!(f, "holm"),
            CorrectionMethod::Sidak             => write!(f, "sidak"),
        }
    }
}

impl FromStr for CorrectionMethod {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bh" | "fdr_bh" | "benjamini-hochberg" | "benjamini_hochberg" => Ok(Self::BenjaminiHochberg),
            "bonferroni" => Ok(Self::Bonferroni),
            "holm" => Ok(Self::Holm),
            "sidak" | "šidák" => Ok(Self::Sidak),
            other => Err(EngineError::config(format!(
                "unknown multiple testing method '{other}' (expected bh, bonferroni, holm or sidak)"
            ))),
        }
    }
}

impl TryFrom<String> for CorrectionMethod {
    type Error = EngineError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<CorrectionMethod> for String {
    fn from(m: CorrectionMethod) -> Self {
        m.to_string()
    }
}

// ---------------------------------------------------------------------------
// CorrectionResult
// ---------------------------------------------------------------------------

/// Adjusted p-values and decisions, aligned with the input order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CorrectionResult {
    pub method: CorrectionMethod,
    pub adjusted_p_values: Vec<f64>,
    pub rejected: Vec<bool>,
    pub num_significant: usize,
    pub num_tests: usize,
    /// Per-test threshold 1 − (1 − α)^(1/m); equals α for an empty family.
    pub alpha_sidak: f64,
    /// Per-test threshold α / m; equals α for an empty family.
    pub alpha_bonferroni: f64,
    pub original_alpha: f64,
}

impl CorrectionResult {
    fn empty(method: CorrectionMethod, alpha: f64) -> Self {
        Self {
            method,
            adjusted_p_values: Vec::new(),
            rejected: Vec::new(),
            num_significant: 0,
            num_tests: 0,
            alpha_sidak: alpha,
            alpha_bonferroni: alpha,
            original_alpha: alpha,
        }
    }
}

// ---------------------------------------------------------------------------
// Procedures
// ---------------------------------------------------------------------------

/// Indices of `p` in ascending p-value order (stable for ties).
fn ascending_order(p: &[f64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..p.len()).collect();
    order.sort_by(|&a, &b| p[a].total_cmp(&p[b]));
    order
}

fn benjamini_hochberg(p: &[f64]) -> Vec<f64> {
    let m = p.len();
    let order = ascending_order(p);
    let mut adjusted = vec![0.0; m];
    let mut running_min = 1.0_f64;
    for (rank0, &idx) in order.iter().enumerate().rev() {
        let scaled = p[idx] * m as f64 / (rank0 + 1) as f64;
        running_min = running_min.min(scaled);
        adjusted[idx] = running_min.min(1.0);
    }
    adjusted
}

fn holm(p: &[f64]) -> Vec<f64> {
    let m = p.len();
    let order = ascending_order(p);
    let mut adjusted = vec![0.0; m];
    let mut running_max = 0.0_f64;
    for (rank0, &idx) in order.iter().enumerate() {
        let scaled = (p[idx] * (m - rank0) as f64).min(1.0);
        running_max = running_max.max(scaled);
        adjusted[idx] = running_max;
    }
    adjusted
}

/// Adjust `p_values` at level `alpha` with `method`.
///
/// A hypothesis is rejected when its adjusted p-value is ≤ `alpha`, which for
/// each method coincides with its classical step-up/step-down rule.
pub fn correct(p_values: &[f64], alpha: f64, method: CorrectionMethod) -> Result<CorrectionResult> {
    ensure_open_unit("alpha", alpha)?;
    if let Some(bad) = p_values.iter().find(|p| !(0.0..=1.0).contains(*p)) {
        return Err(EngineError::config(format!("p-values must be in [0, 1], got {bad}")));
    }
    if p_values.is_empty() {
        return Ok(CorrectionResult::empty(method, alpha));
    }

    let m = p_values.len() as f64;
    let adjusted_p_values = match method {
        CorrectionMethod::BenjaminiHochberg => benjamini_hochberg(p_values),
        CorrectionMethod::Bonferroni => p_values.iter().map(|p| (p * m).min(1.0)).collect(),
        CorrectionMethod::Holm => holm(p_values),
        CorrectionMethod::Sidak => p_values.iter().map(|p| 1.0 - (1.0 - p).powf(m)).collect(),
    };
    let rejected: Vec<bool> = adjusted_p_values.iter().map(|&p| p <= alpha).collect();
    let num_significant = rejected.iter().filter(|r| **r).count();

    Ok(CorrectionResult {
        method,
        adjusted_p_values,
        rejected,
        num_significant,
        num_tests: p_values.len(),
        alpha_sidak: 1.0 - (1.0 - alpha).powf(1.0 / m),
        alpha_bonferroni: alpha / m,
        original_alpha: alpha,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
