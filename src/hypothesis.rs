//! # Stage: Hypothesis Testing Engine
//!
//! ## Responsibility
//! Two-sample tests for conversion-rate and continuous metrics, plus the
//! sample-ratio-mismatch check that guards every analysis.
//!
//! 1. **Two-proportion z-test**: pooled standard error for the statistic,
//!    unpooled standard error for the confidence interval. The two serve
//!    different questions (testing under H₀ vs estimating the difference) and
//!    must not be unified.
//! 2. **Welch / Student t-test**: Welch–Satterthwaite degrees of freedom by
//!    default, pooled-variance Student form on request.
//! 3. **SRM chi-squared**: goodness of fit of arm sizes against the expected
//!    allocation, judged against its own (stricter) threshold.
//!
//! ## Guarantees
//! - Non-panicking: degenerate inputs (zero totals, zero variance) return a
//!   neutral result (`statistic = 0`, `p = 1`) with `degenerate = true`
//! - Missing values (`NaN`) are dropped per arm before any statistic
//!
//! ## NOT Responsible For
//! - Multiple-comparison adjustment (see [`crate::correction`])
//! - Deciding whether to ship (see [`crate::orchestrator`])

use serde::Serialize;
use tracing::debug;

use crate::config::AnalysisConfig;
use crate::error::{ensure_open_unit, EngineError, Result};
use crate::stats::{
    chi2_1_sf, drop_missing, mean, normal_sf, sample_variance, t_critical, t_two_tailed_p, z_critical,
};

/// Relative lift above which a proportion result is practically significant.
pub const PRACTICAL_SIGNIFICANCE_THRESHOLD: f64 = 0.02;

/// Default SRM p-value threshold.
pub const DEFAULT_SRM_THRESHOLD: f64 = 0.01;

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// Which test produced a [`TestResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TestKind {
    TwoProportionZ,
    WelchT,
    StudentT,
}

impl std::fmt::Display for TestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestKind::TwoProportionZ => write!(f, "two_proportion_z_test"),
            TestKind::WelchT         => write!(f, "welch_t_test"),
            TestKind::StudentT       => write!(f, "student_t_test"),
        }
    }
}

/// Test-specific fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TestDetails {
    Proportion {
        successes_control: u64,
        successes_treatment: u64,
        /// |relative lift| > 2 %, independent of the p-value.
        practically_significant: bool,
        /// Wilson score interval for the control rate.
        control_interval: (f64, f64),
        /// Wilson score interval for the treatment rate.
        treatment_interval: (f64, f64),
    },
    Continuous {
        std_control: f64,
        std_treatment: f64,
        /// Mean difference over sqrt((s₁² + s₂²) / 2).
        cohens_d: f64,
    },
}

/// Outcome of one two-sample hypothesis test. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestResult {
    pub kind: TestKind,
    /// Control rate or mean.
    pub control_estimate: f64,
    /// Treatment rate or mean.
    pub treatment_estimate: f64,
    pub absolute_lift: f64,
    /// absolute lift / control estimate; 0 when the control estimate is 0.
    pub relative_lift: f64,
    /// z or t statistic.
    pub statistic: f64,
    pub p_value: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
    /// 1 − alpha.
    pub ci_level: f64,
    pub degrees_of_freedom: Option<f64>,
    pub statistically_significant: bool,
    /// Inputs admitted no meaningful test; the statistic is neutral.
    pub degenerate: bool,
    pub n_control: u64,
    pub n_treatment: u64,
    pub details: TestDetails,
}

impl TestResult {
    /// `Some(flag)` for proportion tests, `None` otherwise.
    pub fn practically_significant(&self) -> Option<bool> {
        match self.details {
            TestDetails::Proportion { practically_significant, .. } => Some(practically_significant),
            TestDetails::Continuous { .. } => None,
        }
    }

    /// Cohen's d for continuous tests.
    pub fn cohens_d(&self) -> Option<f64> {
        match self.details {
            TestDetails::Continuous { cohens_d, .. } => Some(cohens_d),
            TestDetails::Proportion { .. } => None,
        }
    }
}

/// Outcome of a sample-ratio-mismatch check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SrmResult {
    pub chi2_statistic: f64,
    pub p_value: f64,
    pub srm_detected: bool,
    /// control / (control + treatment).
    pub observed_ratio: f64,
    pub expected_ratio: f64,
    pub deviation: f64,
    pub threshold: f64,
    pub n_control: u64,
    pub n_treatment: u64,
}

// ---------------------------------------------------------------------------
// Small helpers
// ---------------------------------------------------------------------------

/// (absolute, relative) lift; relative is 0 when `control` is 0.
pub fn relative_lift(control: f64, treatment: f64) -> (f64, f64) {
    let absolute = treatment - control;
    let relative = if control != 0.0 { absolute / control } else { 0.0 };
    (absolute, relative)
}

/// Wilson score interval for a binomial rate at confidence 1 − alpha.
///
/// Returns `(0, 0)` for an empty sample.
pub fn wilson_interval(successes: u64, total: u64, alpha: f64) -> (f64, f64) {
    if total == 0 {
        return (0.0, 0.0);
    }
    let n = total as f64;
    let p = successes as f64 / n;
    let z = z_critical(alpha);
    let z2 = z * z;
    let denominator = 1.0 + z2 / n;
    let centre = (p + z2 / (2.0 * n)) / denominator;
    let adjustment = z * (p * (1.0 - p) / n + z2 / (4.0 * n * n)).sqrt() / denominator;
    ((centre - adjustment).max(0.0), (centre + adjustment).min(1.0))
}

// ---------------------------------------------------------------------------
// HypothesisTester
// ---------------------------------------------------------------------------

/// Runs tests at a fixed significance level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HypothesisTester {
    alpha: f64,
    equal_variance: bool,
}

impl HypothesisTester {
    /// Welch tester at significance level `alpha`.
    pub fn new(alpha: f64) -> Result<Self> {
        ensure_open_unit("alpha", alpha)?;
        Ok(Self { alpha, equal_variance: false })
    }

    pub fn from_config(config: &AnalysisConfig) -> Result<Self> {
        Ok(Self::new(config.alpha)?.with_equal_variance(config.equal_variance))
    }

    /// Switch between Welch (`false`) and Student (`true`) continuous tests.
    pub fn with_equal_variance(mut self, equal_variance: bool) -> Self {
        self.equal_variance = equal_variance;
        self
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    /// Two-proportion z-test.
    pub fn proportion_test(
        &self,
        successes_control: u64,
        total_control: u64,
        successes_treatment: u64,
        total_treatment: u64,
    ) -> Result<TestResult> {
        if successes_control > total_control || successes_treatment > total_treatment {
            return Err(EngineError::config(format!(
                "successes exceed totals: control {successes_control}/{total_control}, \
                 treatment {successes_treatment}/{total_treatment}"
            )));
        }

        let rate = |s: u64, n: u64| if n > 0 { s as f64 / n as f64 } else { 0.0 };
        let p_c = rate(successes_control, total_control);
        let p_t = rate(successes_treatment, total_treatment);
        let (absolute_lift, relative_lift) = relative_lift(p_c, p_t);

        let n_c = total_control as f64;
        let n_t = total_treatment as f64;

        // Pooled SE under H0; zero when either total is empty or the pooled rate is 0 or 1.
        let se_pooled = if total_control > 0 && total_treatment > 0 {
            let pooled = (successes_control + successes_treatment) as f64 / (n_c + n_t);
            (pooled * (1.0 - pooled) * (1.0 / n_c + 1.0 / n_t)).sqrt()
        } else {
            0.0
        };

        let degenerate = se_pooled <= 0.0;
        let (z, p_value) = if degenerate {
            debug!(total_control, total_treatment, "degenerate proportion test, returning p = 1");
            (0.0, 1.0)
        } else {
            let z = absolute_lift / se_pooled;
            (z, (2.0 * normal_sf(z.abs())).min(1.0))
        };

        let unpooled_var = |p: f64, n: f64| if n > 0.0 { p * (1.0 - p) / n } else { 0.0 };
        let se_diff = (unpooled_var(p_c, n_c) + unpooled_var(p_t, n_t)).sqrt();
        let margin = z_critical(self.alpha) * se_diff;

        Ok(TestResult {
            kind: TestKind::TwoProportionZ,
            control_estimate: p_c,
            treatment_estimate: p_t,
            absolute_lift,
            relative_lift,
            statistic: z,
            p_value,
            ci_lower: absolute_lift - margin,
            ci_upper: absolute_lift + margin,
            ci_level: 1.0 - self.alpha,
            degrees_of_freedom: None,
            statistically_significant: p_value < self.alpha,
            degenerate,
            n_control: total_control,
            n_treatment: total_treatment,
            details: TestDetails::Proportion {
                successes_control,
                successes_treatment,
                practically_significant: relative_lift.abs() > PRACTICAL_SIGNIFICANCE_THRESHOLD,
                control_interval: wilson_interval(successes_control, total_control, self.alpha),
                treatment_interval: wilson_interval(successes_treatment, total_treatment, self.alpha),
            },
        })
    }

    /// Two-sample t-test on continuous values. `NaN` entries are dropped per arm.
    ///
    /// Fails with `InsufficientData` when either arm is empty after dropping.
    pub fn continuous_test(&self, control: &[f64], treatment: &[f64]) -> Result<TestResult> {
        let control = drop_missing(control);
        let treatment = drop_missing(treatment);
        if control.is_empty() {
            return Err(EngineError::insufficient("control arm has no valid observations"));
        }
        if treatment.is_empty() {
            return Err(EngineError::insufficient("treatment arm has no valid observations"));
        }

        let kind = if self.equal_variance { TestKind::StudentT } else { TestKind::WelchT };
        let n1 = control.len() as f64;
        let n2 = treatment.len() as f64;
        let m1 = mean(&control);
        let m2 = mean(&treatment);
        let v1 = sample_variance(&control);
        let v2 = sample_variance(&treatment);
        let (mean_diff, relative) = relative_lift(m1, m2);

        let pooled_sd = ((v1 + v2) / 2.0).sqrt();
        let cohens_d = if pooled_sd > 0.0 { mean_diff / pooled_sd } else { 0.0 };

        let se1 = v1 / n1;
        let se2 = v2 / n2;
        let se_unpooled = (se1 + se2).sqrt();

        let (se_test, df) = if self.equal_variance {
            let df = n1 + n2 - 2.0;
            let pooled_var = if df > 0.0 { ((n1 - 1.0) * v1 + (n2 - 1.0) * v2) / df } else { 0.0 };
            ((pooled_var * (1.0 / n1 + 1.0 / n2)).sqrt(), df)
        } else {
            let denom = if n1 > 1.0 { se1 * se1 / (n1 - 1.0) } else { 0.0 }
                + if n2 > 1.0 { se2 * se2 / (n2 - 1.0) } else { 0.0 };
            let df = if denom > 0.0 { (se1 + se2).powi(2) / denom } else { 0.0 };
            (se_unpooled, df)
        };

        let details = TestDetails::Continuous {
            std_control: v1.sqrt(),
            std_treatment: v2.sqrt(),
            cohens_d,
        };

        // A single-observation arm has no variance estimate.
        let degenerate = n1 < 2.0 || n2 < 2.0 || se_test.is_nan() || se_test <= 0.0 || !df.is_finite() || df <= 0.0;
        if degenerate {
            debug!(n_control = n1, n_treatment = n2, "degenerate t-test, returning p = 1");
            return Ok(TestResult {
                kind,
                control_estimate: m1,
                treatment_estimate: m2,
                absolute_lift: mean_diff,
                relative_lift: relative,
                statistic: 0.0,
                p_value: 1.0,
                ci_lower: mean_diff,
                ci_upper: mean_diff,
                ci_level: 1.0 - self.alpha,
                degrees_of_freedom: (df > 0.0 && df.is_finite()).then_some(df),
                statistically_significant: false,
                degenerate: true,
                n_control: control.len() as u64,
                n_treatment: treatment.len() as u64,
                details,
            });
        }

        let t_stat = mean_diff / se_test;
        let p_value = t_two_tailed_p(t_stat, df)?;
        let margin = t_critical(self.alpha, df)? * se_unpooled;

        Ok(TestResult {
            kind,
            control_estimate: m1,
            treatment_estimate: m2,
            absolute_lift: mean_diff,
            relative_lift: relative,
            statistic: t_stat,
            p_value,
            ci_lower: mean_diff - margin,
            ci_upper: mean_diff + margin,
            ci_level: 1.0 - self.alpha,
            degrees_of_freedom: Some(df),
            statistically_significant: p_value < self.alpha,
            degenerate: false,
            n_control: control.len() as u64,
            n_treatment: treatment.len() as u64,
            details,
        })
    }
}

// ---------------------------------------------------------------------------
// Sample ratio mismatch
// ---------------------------------------------------------------------------

/// Chi-squared goodness-of-fit check of arm sizes against `expected_ratio`
/// (the expected control share). SRM is flagged when `p < threshold`.
pub fn check_sample_ratio_mismatch(
    n_control: u64,
    n_treatment: u64,
    expected_ratio: f64,
    threshold: f64,
) -> Result<SrmResult> {
    ensure_open_unit("expected_ratio", expected_ratio)?;
    ensure_open_unit("srm_threshold", threshold)?;

    let total = (n_control + n_treatment) as f64;
    if total == 0.0 {
        return Ok(SrmResult {
            chi2_statistic: 0.0,
            p_value: 1.0,
            srm_detected: false,
            observed_ratio: 0.0,
            expected_ratio,
            deviation: 0.0,
            threshold,
            n_control,
            n_treatment,
        });
    }

    let expected_control = total * expected_ratio;
    let expected_treatment = total * (1.0 - expected_ratio);
    let chi2 = (n_control as f64 - expected_control).powi(2) / expected_control
        + (n_treatment as f64 - expected_treatment).powi(2) / expected_treatment;
    let p_value = chi2_1_sf(chi2);
    let observed_ratio = n_control as f64 / total;

    Ok(SrmResult {
        chi2_statistic: chi2,
        p_value,
        srm_detected: p_value < threshold,
        observed_ratio,
        expected_ratio,
        deviation: (observed_ratio - expected_ratio).abs(),
        threshold,
        n_control,
        n_treatment,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
