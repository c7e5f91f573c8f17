//! Power and sample-size calculations for two-proportion experiments.
//!
//! All formulas use the normal approximation to the two-proportion z-test:
//!
//! ```text
//! n = 2 · p̄(1 − p̄) · (z_{1−α/2} + z_{power})² / (p_c − p_t)²,   p̄ = (p_c + p_t) / 2
//! ```
//!
//! where `p_t = p_c · (1 + mde)` and `mde` is a relative effect.

use serde::Serialize;

use crate::error::{ensure_open_unit, EngineError, Result};
use crate::stats::{normal_cdf, normal_ppf, z_critical};

/// Bisection bounds and tolerance for the MDE search (relative effect).
const MDE_LOWER: f64 = 0.001;
const MDE_UPPER: f64 = 1.0;
const MDE_TOLERANCE: f64 = 1e-4;
const MDE_MAX_ITERATIONS: usize = 64;

// ---------------------------------------------------------------------------
// Planning
// ---------------------------------------------------------------------------

/// Un-rounded per-arm sample size; caller has validated the inputs.
fn raw_sample_size(baseline_rate: f64, mde: f64, alpha: f64, power: f64) -> f64 {
    let treatment_rate = baseline_rate * (1.0 + mde);
    let pooled = (baseline_rate + treatment_rate) / 2.0;
    let z = z_critical(alpha) + normal_ppf(power);
    2.0 * pooled * (1.0 - pooled) * z * z / (baseline_rate - treatment_rate).powi(2)
}

fn validate_plan(baseline_rate: f64, alpha: f64, power: f64) -> Result<()> {
    ensure_open_unit("baseline_rate", baseline_rate)?;
    ensure_open_unit("alpha", alpha)?;
    ensure_open_unit("power", power)
}

/// Required sample size **per arm** to detect a relative lift of `mde` over
/// `baseline_rate`. Always rounded up.
pub fn required_sample_size(baseline_rate: f64, mde: f64, alpha: f64, power: f64) -> Result<u64> {
    validate_plan(baseline_rate, alpha, power)?;
    if !(mde.is_finite() && mde > 0.0) {
        return Err(EngineError::config(format!("mde must be > 0, got {mde}")));
    }
    if baseline_rate * (1.0 + mde) > 1.0 {
        return Err(EngineError::config(format!(
            "baseline_rate {baseline_rate} with mde {mde} implies a treatment rate above 1"
        )));
    }
    let n = raw_sample_size(baseline_rate, mde, alpha, power).ceil();
    if !n.is_finite() || n >= u64::MAX as f64 {
        return Err(EngineError::config(format!(
            "mde {mde} is too small to plan for at baseline_rate {baseline_rate}"
        )));
    }
    Ok(n as u64)
}

/// Smallest relative effect detectable with `sample_size` units per arm.
///
/// There is no closed-form inverse of [`required_sample_size`], so this
/// bisects over `[0.001, 1.0]` until the bracket is narrower than 1e-4.
/// Returns the upper bound when even a 100 % lift needs more units.
pub fn minimum_detectable_effect(baseline_rate: f64, sample_size: u64, alpha: f64, power: f64) -> Result<f64> {
    validate_plan(baseline_rate, alpha, power)?;
    if sample_size == 0 {
        return Err(EngineError::config("sample_size must be > 0"));
    }
    let target = sample_size as f64;
    let (mut left, mut right) = (MDE_LOWER, MDE_UPPER);
    for _ in 0..MDE_MAX_ITERATIONS {
        if right - left <= MDE_TOLERANCE {
            break;
        }
        let mid = (left + right) / 2.0;
        if raw_sample_size(baseline_rate, mid, alpha, power).ceil() > target {
            left = mid;
        } else {
            right = mid;
        }
    }
    Ok((left + right) / 2.0)
}

/// Achieved power given observed per-arm sizes and rates, clamped to `[0, 1]`.
///
/// Returns 0 when both observed variances are zero.
pub fn post_hoc_power(
    n_control: u64,
    n_treatment: u64,
    control_rate: f64,
    treatment_rate: f64,
    alpha: f64,
) -> Result<f64> {
    ensure_open_unit("alpha", alpha)?;
    if n_control == 0 || n_treatment == 0 {
        return Err(EngineError::config("post-hoc power needs non-empty arms"));
    }
    for (name, rate) in [("control_rate", control_rate), ("treatment_rate", treatment_rate)] {
        if !(0.0..=1.0).contains(&rate) {
            return Err(EngineError::config(format!("{name} must be in [0, 1], got {rate}")));
        }
    }
    let se = (control_rate * (1.0 - control_rate) / n_control as f64
        + treatment_rate * (1.0 - treatment_rate) / n_treatment as f64)
        .sqrt();
    if se <= 0.0 {
        return Ok(0.0);
    }
    let z = (treatment_rate - control_rate) / se;
    Ok(normal_cdf(z.abs() - z_critical(alpha)).clamp(0.0, 1.0))
}

// ---------------------------------------------------------------------------
// PowerSpec
// ---------------------------------------------------------------------------

/// The (baseline, MDE, alpha, power) tuple behind a sample-size plan.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PowerSpec {
    pub baseline_rate: f64,
    /// Relative effect, e.g. 0.15 for a 15 % lift.
    pub minimum_detectable_effect: f64,
    pub alpha: f64,
    pub power: f64,
}

impl PowerSpec {
    pub fn new(baseline_rate: f64, minimum_detectable_effect: f64, alpha: f64, power: f64) -> Self {
        Self { baseline_rate, minimum_detectable_effect, alpha, power }
    }

    /// Required units per arm.
    pub fn sample_size(&self) -> Result<u64> {
        required_sample_size(self.baseline_rate, self.minimum_detectable_effect, self.alpha, self.power)
    }

    /// Spec whose MDE is what `sample_size` units per arm can detect.
    pub fn from_sample_size(baseline_rate: f64, sample_size: u64, alpha: f64, power: f64) -> Result<Self> {
        let mde = minimum_detectable_effect(baseline_rate, sample_size, alpha, power)?;
        Ok(Self::new(baseline_rate, mde, alpha, power))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // ===== required_sample_size =====

    #[test]
    fn test_sample_size_low_thousands() {
        let n = required_sample_size(0.40, 0.15, 0.05, 0.80).unwrap();
        assert_eq!(n, 1069);
        assert!(n > 1000 && n < 10_000);
    }

    #[test]
    fn test_sample_size_grows_as_mde_shrinks() {
        let big = required_sample_size(0.40, 0.05, 0.05, 0.80).unwrap();
        let small = required_sample_size(0.40, 0.20, 0.05, 0.80).unwrap();
        assert!(big > small);
    }

    #[test]
    fn test_sample_size_grows_with_power() {
        let p80 = required_sample_size(0.25, 0.1, 0.05, 0.80).unwrap();
        let p90 = required_sample_size(0.25, 0.1, 0.05, 0.90).unwrap();
        assert!(p90 > p80);
    }

    #[test]
    fn test_sample_size_is_ceiling() {
        let raw = raw_sample_size(0.40, 0.15, 0.05, 0.80);
        let n = required_sample_size(0.40, 0.15, 0.05, 0.80).unwrap() as f64;
        assert!(n >= raw && n - raw < 1.0);
    }

    #[test]
    fn test_sample_size_invalid_inputs() {
        assert!(required_sample_size(0.0, 0.15, 0.05, 0.8).is_err());
        assert!(required_sample_size(0.4, 0.0, 0.05, 0.8).is_err());
        assert!(required_sample_size(0.4, 0.15, 1.0, 0.8).is_err());
        assert!(required_sample_size(0.4, 0.15, 0.05, 0.0).is_err());
        assert!(required_sample_size(0.8, 0.5, 0.05, 0.8).is_err());
    }

    #[test]
    fn test_sample_size_unrepresentable_is_invalid() {
        // Treatment rate rounds back to the baseline: infinite sample.
        assert!(required_sample_size(0.4, 1e-17, 0.05, 0.8).unwrap_err().is_invalid_configuration());
        // Finite but beyond u64.
        assert!(required_sample_size(0.4, 1e-12, 0.05, 0.8).unwrap_err().is_invalid_configuration());
    }

    // ===== minimum_detectable_effect =====

    #[test]
    fn test_mde_inverts_sample_size() {
        let n = required_sample_size(0.40, 0.15, 0.05, 0.80).unwrap();
        let mde = minimum_detectable_effect(0.40, n, 0.05, 0.80).unwrap();
        assert!((mde - 0.15).abs() < 1e-3, "mde={mde}");
    }

    #[test]
    fn test_mde_shrinks_with_more_units() {
        let small_n = minimum_detectable_effect(0.3, 1_000, 0.05, 0.8).unwrap();
        let large_n = minimum_detectable_effect(0.3, 50_000, 0.05, 0.8).unwrap();
        assert!(large_n < small_n);
    }

    #[test]
    fn test_mde_saturates_at_upper_bound_for_tiny_samples() {
        let mde = minimum_detectable_effect(0.05, 2, 0.05, 0.8).unwrap();
        assert!(mde > 0.999 - MDE_TOLERANCE, "mde={mde}");
        assert!(mde <= MDE_UPPER);
    }

    #[test]
    fn test_mde_zero_sample_invalid() {
        assert!(minimum_detectable_effect(0.4, 0, 0.05, 0.8).unwrap_err().is_invalid_configuration());
    }

    // ===== post_hoc_power =====

    #[test]
    fn test_power_large_effect_near_one() {
        let p = post_hoc_power(10_000, 10_000, 0.40, 0.46, 0.05).unwrap();
        assert!(p > 0.99, "power={p}");
    }

    #[test]
    fn test_power_no_effect_clamped_low() {
        let p = post_hoc_power(1000, 1000, 0.40, 0.40, 0.05).unwrap();
        assert!((0.0..0.05).contains(&p), "power={p}");
    }

    #[test]
    fn test_power_zero_variance_is_zero() {
        assert_eq!(post_hoc_power(100, 100, 0.0, 0.0, 0.05).unwrap(), 0.0);
    }

    #[test]
    fn test_power_matches_formula() {
        let se = (0.4 * 0.6 / 1000.0 + 0.46 * 0.54 / 1000.0_f64).sqrt();
        let expected = normal_cdf(0.06 / se - 1.959964);
        let p = post_hoc_power(1000, 1000, 0.40, 0.46, 0.05).unwrap();
        assert!((p - expected).abs() < 1e-5);
    }

    #[test]
    fn test_power_invalid_inputs() {
        assert!(post_hoc_power(0, 10, 0.1, 0.2, 0.05).is_err());
        assert!(post_hoc_power(10, 10, 1.1, 0.2, 0.05).is_err());
        assert!(post_hoc_power(10, 10, 0.1, 0.2, 1.5).is_err());
    }

    // ===== PowerSpec =====

    #[test]
    fn test_power_spec_round_trip() {
        let spec = PowerSpec::new(0.40, 0.15, 0.05, 0.80);
        let n = spec.sample_size().unwrap();
        let back = PowerSpec::from_sample_size(0.40, n, 0.05, 0.80).unwrap();
        assert!((back.minimum_detectable_effect - 0.15).abs() < 1e-3);
        assert_eq!(back.alpha, 0.05);
    }
}
