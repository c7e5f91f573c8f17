//! # Stage: Sequential Testing
//!
//! ## Responsibility
//! O'Brien–Fleming-style alpha spending for interim looks at a running
//! experiment. Early looks get a near-zero share of the false-positive
//! budget; the full `alpha` only becomes available at the planned sample size.
//!
//! ```text
//! α(t) = 2 · (1 − Φ(z_{1−α/2} / √t)),   0 < t < 1
//! α(t) = 0 for t ≤ 0,   α(t) = α for t ≥ 1
//! ```
//!
//! ## NOT Responsible For
//! - Stopping the experiment (lifecycle belongs to the caller)
//! - Exact group-sequential boundaries via recursive integration

use serde::Serialize;

use crate::error::{ensure_open_unit, EngineError, Result};
use crate::stats::{normal_sf, z_critical};

/// Cumulative alpha spent after collecting `fraction` of the planned sample.
///
/// Fails when `total_alpha` is outside `(0, 1)`.
pub fn alpha_spent(fraction: f64, total_alpha: f64) -> Result<f64> {
    ensure_open_unit("total_alpha", total_alpha)?;
    Ok(spent(fraction, total_alpha))
}

/// Spending function body; `total_alpha` already validated.
fn spent(fraction: f64, total_alpha: f64) -> f64 {
    if fraction.is_nan() || fraction <= 0.0 {
        return 0.0;
    }
    if fraction >= 1.0 {
        return total_alpha;
    }
    let boundary = z_critical(total_alpha) / fraction.sqrt();
    (2.0 * normal_sf(boundary)).min(total_alpha)
}

/// Interim decision for one look.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SequentialDecision {
    pub current_p_value: f64,
    pub alpha_spent: f64,
    pub fraction: f64,
    /// `current_p_value < alpha_spent`.
    pub significant_at_current_stage: bool,
    pub total_alpha: f64,
    /// Two-sided z boundary matching `alpha_spent`; infinite before any data.
    pub boundary_z: f64,
}

/// Compare an interim p-value against the spending boundary at `fraction`.
pub fn sequential_test(current_p: f64, fraction: f64, total_alpha: f64) -> Result<SequentialDecision> {
    ensure_open_unit("total_alpha", total_alpha)?;
    if !(0.0..=1.0).contains(&current_p) {
        return Err(EngineError::config(format!("p-value must be in [0, 1], got {current_p}")));
    }
    let alpha = spent(fraction, total_alpha);
    Ok(SequentialDecision {
        current_p_value: current_p,
        alpha_spent: alpha,
        fraction,
        significant_at_current_stage: current_p < alpha,
        total_alpha,
        boundary_z: z_critical(alpha),
    })
}

/// One planned look in a spending schedule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Look {
    pub fraction: f64,
    pub cumulative_alpha: f64,
    /// Alpha newly released at this look.
    pub incremental_alpha: f64,
}

/// Spending schedule over strictly increasing look fractions.
pub fn spending_schedule(fractions: &[f64], total_alpha: f64) -> Result<Vec<Look>> {
    ensure_open_unit("total_alpha", total_alpha)?;
    if fractions.windows(2).any(|w| w[1] <= w[0]) {
        return Err(EngineError::config("look fractions must be strictly increasing"));
    }
    let mut previous = 0.0;
    Ok(fractions
        .iter()
        .map(|&fraction| {
            let cumulative = spent(fraction, total_alpha);
            let look = Look {
                fraction,
                cumulative_alpha: cumulative,
                incremental_alpha: cumulative - previous,
            };
            previous = cumulative;
            look
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spent_zero_at_start() {
        assert_eq!(alpha_spent(0.0, 0.05).unwrap(), 0.0);
        assert_eq!(alpha_spent(-0.5, 0.05).unwrap(), 0.0);
    }

    #[test]
    fn test_spent_full_at_end() {
        assert_eq!(alpha_spent(1.0, 0.05).unwrap(), 0.05);
        assert_eq!(alpha_spent(1.7, 0.05).unwrap(), 0.05);
    }

    #[test]
    fn test_spent_tiny_early() {
        let early = alpha_spent(0.1, 0.05).unwrap();
        assert!(early < 1e-8, "early={early}");
    }

    #[test]
    fn test_spent_known_midpoint() {
        // z = 1.96 / sqrt(0.5) = 2.772 → 2·(1 − Φ(2.772)) ≈ 0.00557
        let mid = alpha_spent(0.5, 0.05).unwrap();
        assert!((mid - 0.00557).abs() < 1e-4, "mid={mid}");
    }

    #[test]
    fn test_spent_monotone_in_fraction() {
        let mut last = 0.0;
        for i in 0..=100 {
            let spent = alpha_spent(i as f64 / 100.0, 0.05).unwrap();
            assert!(spent >= last);
            assert!(spent <= 0.05);
            last = spent;
        }
    }

    #[test]
    fn test_spent_rejects_invalid_total_alpha() {
        assert!(alpha_spent(0.5, 1.5).unwrap_err().is_invalid_configuration());
        assert!(alpha_spent(0.5, 0.0).is_err());
        assert!(alpha_spent(0.5, f64::NAN).is_err());
    }

    #[test]
    fn test_sequential_decision() {
        let d = sequential_test(0.004, 0.5, 0.05).unwrap();
        assert!(d.significant_at_current_stage);
        let d = sequential_test(0.01, 0.5, 0.05).unwrap();
        assert!(!d.significant_at_current_stage);
        let d = sequential_test(0.01, 1.0, 0.05).unwrap();
        assert!(d.significant_at_current_stage);
        assert!((d.boundary_z - 1.959964).abs() < 1e-5);
    }

    #[test]
    fn test_sequential_no_data_never_significant() {
        let d = sequential_test(0.0, 0.0, 0.05).unwrap();
        assert!(!d.significant_at_current_stage);
        assert_eq!(d.boundary_z, f64::INFINITY);
    }

    #[test]
    fn test_sequential_invalid_inputs() {
        assert!(sequential_test(1.5, 0.5, 0.05).is_err());
        assert!(sequential_test(0.5, 0.5, 0.0).is_err());
    }

    #[test]
    fn test_schedule_increments_sum_to_total() {
        let looks = spending_schedule(&[0.25, 0.5, 0.75, 1.0], 0.05).unwrap();
        assert_eq!(looks.len(), 4);
        let total: f64 = looks.iter().map(|l| l.incremental_alpha).sum();
        assert!((total - 0.05).abs() < 1e-12);
        assert!(looks.iter().all(|l| l.incremental_alpha >= 0.0));
    }

    #[test]
    fn test_schedule_rejects_unsorted() {
        assert!(spending_schedule(&[0.5, 0.25], 0.05).is_err());
    }
}
