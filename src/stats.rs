//! Numeric kernels shared by every engine component.
//!
//! All functions treat `NaN` as "missing" only where documented; the
//! descriptive statistics here assume the caller already filtered.

use statrs::distribution::{ContinuousCDF, StudentsT};
use statrs::function::erf::{erfc, erfc_inv};

use crate::error::{EngineError, Result};

// ---------------------------------------------------------------------------
// Descriptive statistics
// ---------------------------------------------------------------------------

/// Arithmetic mean; `0.0` for an empty slice.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample variance (Bessel's correction). `0.0` when fewer than two values.
pub fn sample_variance(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let m = mean(values);
    values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / (n - 1) as f64
}

/// Sample covariance (Bessel's correction) of two equal-length slices.
pub fn sample_covariance(x: &[f64], y: &[f64]) -> f64 {
    let n = x.len().min(y.len());
    if n < 2 {
        return 0.0;
    }
    let mx = mean(&x[..n]);
    let my = mean(&y[..n]);
    x.iter()
        .zip(y)
        .map(|(a, b)| (a - mx) * (b - my))
        .sum::<f64>()
        / (n - 1) as f64
}

/// Pearson correlation; `0.0` when either side has zero variance.
pub fn pearson(x: &[f64], y: &[f64]) -> f64 {
    let vx = sample_variance(x);
    let vy = sample_variance(y);
    if vx <= 0.0 || vy <= 0.0 {
        return 0.0;
    }
    (sample_covariance(x, y) / (vx * vy).sqrt()).clamp(-1.0, 1.0)
}

/// Copy of `values` with `NaN` entries removed.
pub fn drop_missing(values: &[f64]) -> Vec<f64> {
    values.iter().copied().filter(|v| !v.is_nan()).collect()
}

// ---------------------------------------------------------------------------
// Distributions
// ---------------------------------------------------------------------------

/// Standard normal CDF Φ(x).
pub fn normal_cdf(x: f64) -> f64 {
    0.5 * erfc(-x / std::f64::consts::SQRT_2)
}

/// Upper tail of the standard normal, 1 − Φ(x), computed without cancellation.
pub fn normal_sf(x: f64) -> f64 {
    0.5 * erfc(x / std::f64::consts::SQRT_2)
}

/// Standard normal quantile Φ⁻¹(p). Infinite at the endpoints.
pub fn normal_ppf(p: f64) -> f64 {
    if p <= 0.0 {
        return f64::NEG_INFINITY;
    }
    if p >= 1.0 {
        return f64::INFINITY;
    }
    -std::f64::consts::SQRT_2 * erfc_inv(2.0 * p)
}

/// Two-sided critical value z_{1−α/2}.
pub fn z_critical(alpha: f64) -> f64 {
    normal_ppf(1.0 - alpha / 2.0)
}

/// Standard Student-t with `df` degrees of freedom.
pub fn students_t(df: f64) -> Result<StudentsT> {
    StudentsT::new(0.0, 1.0, df)
        .map_err(|e| EngineError::config(format!("invalid degrees of freedom {df}: {e}")))
}

/// Two-tailed p-value for a t statistic.
pub fn t_two_tailed_p(t: f64, df: f64) -> Result<f64> {
    let dist = students_t(df)?;
    Ok((2.0 * (1.0 - dist.cdf(t.abs()))).clamp(0.0, 1.0))
}

/// Two-sided critical value t_{1−α/2, df}.
pub fn t_critical(alpha: f64, df: f64) -> Result<f64> {
    Ok(students_t(df)?.inverse_cdf(1.0 - alpha / 2.0))
}

/// Upper tail of the chi-squared distribution with one degree of freedom.
pub fn chi2_1_sf(x: f64) -> f64 {
    if x <= 0.0 {
        return 1.0;
    }
    erfc((x / 2.0).sqrt())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // ===== Descriptive =====

    #[test]
    fn test_mean_empty_is_zero() {
        assert_eq!(mean(&[]), 0.0);
    }

    #[test]
    fn test_sample_variance_correct() {
        // samples: 2, 4, 4, 4, 5, 5, 7, 9 → variance = 4.571...
        let v = sample_variance(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        assert!((v - 4.571).abs() < 0.01, "variance={v}");
    }

    #[test]
    fn test_sample_variance_single_value_is_zero() {
        assert_eq!(sample_variance(&[3.0]), 0.0);
    }

    #[test]
    fn test_covariance_of_self_is_variance() {
        let x = [1.0, 3.0, 4.0, 8.0];
        assert!((sample_covariance(&x, &x) - sample_variance(&x)).abs() < 1e-12);
    }

    #[test]
    fn test_pearson_perfect_and_constant() {
        let x = [1.0, 2.0, 3.0, 4.0];
        let y = [2.0, 4.0, 6.0, 8.0];
        assert!((pearson(&x, &y) - 1.0).abs() < 1e-12);
        assert_eq!(pearson(&x, &[5.0; 4]), 0.0);
    }

    #[test]
    fn test_drop_missing_removes_nan() {
        assert_eq!(drop_missing(&[1.0, f64::NAN, 2.0]), vec![1.0, 2.0]);
    }

    // ===== Distributions =====

    #[test]
    fn test_normal_cdf_at_zero_is_half() {
        assert!((normal_cdf(0.0) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_normal_ppf_known_quantiles() {
        assert!((normal_ppf(0.975) - 1.959964).abs() < 1e-5);
        assert!((normal_ppf(0.8) - 0.841621).abs() < 1e-5);
        assert!((normal_ppf(0.5)).abs() < 1e-12);
    }

    #[test]
    fn test_normal_ppf_endpoints_infinite() {
        assert_eq!(normal_ppf(0.0), f64::NEG_INFINITY);
        assert_eq!(normal_ppf(1.0), f64::INFINITY);
    }

    #[test]
    fn test_normal_sf_complements_cdf() {
        for x in [-2.0, -0.3, 0.0, 1.1, 3.5] {
            assert!((normal_sf(x) + normal_cdf(x) - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_t_two_tailed_p_at_zero_is_one() {
        let p = t_two_tailed_p(0.0, 10.0).unwrap();
        assert!((p - 1.0).abs() < 1e-9, "p={p}");
    }

    #[test]
    fn test_t_critical_large_df_near_normal() {
        let t = t_critical(0.05, 1e6).unwrap();
        assert!((t - 1.96).abs() < 1e-3, "t={t}");
    }

    #[test]
    fn test_students_t_rejects_non_positive_df() {
        assert!(students_t(0.0).is_err());
        assert!(students_t(f64::NAN).is_err());
    }

    #[test]
    fn test_chi2_sf_matches_normal_tail() {
        // chi2(1) upper tail at z² equals the two-sided normal tail at z.
        let z: f64 = 1.96;
        assert!((chi2_1_sf(z * z) - 2.0 * normal_sf(z)).abs() < 1e-12);
        assert_eq!(chi2_1_sf(0.0), 1.0);
    }
}
