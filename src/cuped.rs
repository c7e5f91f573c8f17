//! # Stage: CUPED Engine
//!
//! ## Responsibility
//! Variance reduction with pre-experiment covariates:
//!
//! ```text
//! Y_adj = Y − θ · (X − mean(X)),   θ = Cov(Y, X) / Var(X)
//! ```
//!
//! `mean(X)` is taken over the whole paired population, never per arm, so the
//! treatment-effect estimate is left unbiased.
//!
//! ## Guarantees
//! - θ is estimated on paired non-missing rows only; every other row passes
//!   through unchanged (a missing post value stays `NaN`)
//! - A constant covariate, or too few paired rows, returns the unadjusted
//!   values with θ = 0 and zero reduction; never an error
//! - Effect drift above 1 % after adjustment is logged, never fatal
//!
//! ## NOT Responsible For
//! - Choosing which covariate goes with which metric (configuration)
//! - Significance testing (see [`crate::hypothesis`])

use nalgebra::{DMatrix, DVector};
use serde::Serialize;
use tracing::{debug, warn};

use crate::assignment::Variant;
use crate::error::{EngineError, Result};
use crate::hypothesis::{HypothesisTester, TestResult};
use crate::stats::{mean, pearson, sample_covariance, sample_variance};
use crate::table::split_by_variant;

/// Relative change in the treatment effect tolerated after adjustment.
pub const EFFECT_DRIFT_TOLERANCE: f64 = 0.01;

/// |r| above which the covariate is considered useful.
pub const MIN_CORRELATION: f64 = 0.1;

/// Reduction at which CUPED is considered effective.
pub const MIN_EFFECTIVE_REDUCTION: f64 = 0.10;

/// Significance level of the pre-period balance check.
const BALANCE_ALPHA: f64 = 0.05;

/// Singular values below this fraction of the largest are treated as zero.
const SVD_EPSILON: f64 = 1e-12;

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// Treatment-minus-control mean before and after adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EffectCheck {
    pub unadjusted_effect: f64,
    pub adjusted_effect: f64,
    /// |adjusted − unadjusted| / |unadjusted|; 0 when the unadjusted effect is 0.
    pub relative_change: f64,
    pub preserved: bool,
}

/// Single-covariate adjustment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CupedResult {
    /// Same length and order as the input.
    pub adjusted: Vec<f64>,
    /// (Var(before) − Var(after)) / Var(before) over the paired rows.
    pub variance_reduction: f64,
    pub theta: f64,
    pub rows_used: usize,
    /// No adjustment was possible; `adjusted` equals the input.
    pub degenerate: bool,
    pub effect_check: Option<EffectCheck>,
}

/// Multi-covariate adjustment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MultiCupedResult {
    pub adjusted: Vec<f64>,
    pub variance_reduction: f64,
    /// One OLS coefficient per covariate, in input order.
    pub coefficients: Vec<f64>,
    pub rows_used: usize,
    pub degenerate: bool,
}

/// Pass/fail summary of the conditions CUPED relies on.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AssumptionReport {
    pub correlation: f64,
    pub sufficient_correlation: bool,
    /// Student t-test of the covariate across arms.
    pub balance_p_value: f64,
    pub pre_metric_balanced: bool,
    pub variance_reduction: f64,
    pub theta: f64,
    pub effective: bool,
    pub all_assumptions_met: bool,
}

/// Same test run on raw and adjusted values.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CupedComparison {
    pub without: TestResult,
    pub with: TestResult,
    pub variance_reduction: f64,
    /// Equivalent sample-size multiplier, sqrt(1 / (1 − reduction)).
    pub power_increase_factor: f64,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn ensure_same_len(what: &str, expected: usize, actual: usize) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(EngineError::config(format!(
            "{what} has {actual} rows but the metric has {expected}"
        )))
    }
}

fn reduction(before: f64, after: f64) -> f64 {
    if before <= 0.0 {
        0.0
    } else {
        (before - after) / before
    }
}

fn unadjusted(post: &[f64], rows_used: usize) -> CupedResult {
    CupedResult {
        adjusted: post.to_vec(),
        variance_reduction: 0.0,
        theta: 0.0,
        rows_used,
        degenerate: true,
        effect_check: None,
    }
}

// ---------------------------------------------------------------------------
// Single covariate
// ---------------------------------------------------------------------------

/// Adjust `post` with the pre-period covariate `pre` (row-aligned, `NaN` = missing).
pub fn adjust(post: &[f64], pre: &[f64]) -> Result<CupedResult> {
    ensure_same_len("covariate", post.len(), pre.len())?;

    let paired: Vec<usize> = (0..post.len())
        .filter(|&i| !post[i].is_nan() && !pre[i].is_nan())
        .collect();
    let post_p: Vec<f64> = paired.iter().map(|&i| post[i]).collect();
    let pre_p: Vec<f64> = paired.iter().map(|&i| pre[i]).collect();

    if paired.len() < 2 {
        warn!(rows = paired.len(), "not enough paired rows for CUPED, leaving metric unadjusted");
        return Ok(unadjusted(post, paired.len()));
    }
    let var_pre = sample_variance(&pre_p);
    if var_pre <= 0.0 {
        warn!("covariate has zero variance, CUPED not applicable");
        return Ok(unadjusted(post, paired.len()));
    }

    let theta = sample_covariance(&post_p, &pre_p) / var_pre;
    let mean_pre = mean(&pre_p);

    let mut adjusted = post.to_vec();
    for &i in &paired {
        adjusted[i] = post[i] - theta * (pre[i] - mean_pre);
    }

    let after: Vec<f64> = paired.iter().map(|&i| adjusted[i]).collect();
    let variance_reduction = reduction(sample_variance(&post_p), sample_variance(&after));
    debug!(theta, variance_reduction, rows = paired.len(), "applied CUPED");

    Ok(CupedResult {
        adjusted,
        variance_reduction,
        theta,
        rows_used: paired.len(),
        degenerate: false,
        effect_check: None,
    })
}

/// [`adjust`] plus a check that the treatment effect survived the adjustment.
///
/// The effect is compared on paired rows only. The check is omitted when
/// either arm has no paired rows.
pub fn adjust_with_labels(post: &[f64], pre: &[f64], variants: &[Option<Variant>]) -> Result<CupedResult> {
    ensure_same_len("variant labels", post.len(), variants.len())?;
    let mut result = adjust(post, pre)?;

    let paired_labels: Vec<Option<Variant>> = variants
        .iter()
        .enumerate()
        .map(|(i, v)| if post[i].is_nan() || pre[i].is_nan() { None } else { *v })
        .collect();
    let (c_before, t_before) = split_by_variant(post, &paired_labels);
    let (c_after, t_after) = split_by_variant(&result.adjusted, &paired_labels);
    if c_before.is_empty() || t_before.is_empty() {
        return Ok(result);
    }

    let unadjusted_effect = mean(&t_before) - mean(&c_before);
    let adjusted_effect = mean(&t_after) - mean(&c_after);
    let relative_change = if unadjusted_effect == 0.0 {
        0.0
    } else {
        (adjusted_effect - unadjusted_effect).abs() / unadjusted_effect.abs()
    };
    let preserved = relative_change <= EFFECT_DRIFT_TOLERANCE;
    if !preserved {
        warn!(
            unadjusted_effect,
            adjusted_effect,
            relative_change,
            "treatment effect moved after CUPED; check covariate timing and correlation"
        );
    }

    result.effect_check = Some(EffectCheck { unadjusted_effect, adjusted_effect, relative_change, preserved });
    Ok(result)
}

// ---------------------------------------------------------------------------
// Multiple covariates
// ---------------------------------------------------------------------------

/// Adjust `post` with several covariates via an ordinary least-squares fit.
///
/// The intercept is absorbed by centering both sides on the complete rows,
/// and the centered system is solved with an SVD so collinear covariates get
/// the minimum-norm solution instead of failing.
pub fn adjust_multi(post: &[f64], covariates: &[&[f64]]) -> Result<MultiCupedResult> {
    for (j, column) in covariates.iter().enumerate() {
        ensure_same_len(&format!("covariate {j}"), post.len(), column.len())?;
    }
    let k = covariates.len();

    let complete: Vec<usize> = (0..post.len())
        .filter(|&i| !post[i].is_nan() && covariates.iter().all(|c| !c[i].is_nan()))
        .collect();
    let rows_used = complete.len();

    let degraded = || MultiCupedResult {
        adjusted: post.to_vec(),
        variance_reduction: 0.0,
        coefficients: vec![0.0; k],
        rows_used,
        degenerate: true,
    };
    if k == 0 {
        return Ok(degraded());
    }
    if rows_used <= k {
        warn!(rows_used, covariates = k, "fewer complete rows than needed for multi-covariate CUPED");
        return Ok(degraded());
    }

    let covariate_means: Vec<f64> = covariates
        .iter()
        .map(|c| complete.iter().map(|&i| c[i]).sum::<f64>() / rows_used as f64)
        .collect();
    let post_p: Vec<f64> = complete.iter().map(|&i| post[i]).collect();
    let post_mean = mean(&post_p);

    let x = DMatrix::from_fn(rows_used, k, |r, c| covariates[c][complete[r]] - covariate_means[c]);
    let y = DVector::from_iterator(rows_used, post_p.iter().map(|v| v - post_mean));
    let beta = x
        .svd(true, true)
        .solve(&y, SVD_EPSILON)
        .map_err(|e| EngineError::config(format!("least-squares fit failed: {e}")))?;

    let mut adjusted = post.to_vec();
    for &i in &complete {
        let shift: f64 = (0..k).map(|j| beta[j] * (covariates[j][i] - covariate_means[j])).sum();
        adjusted[i] = post[i] - shift;
    }

    let after: Vec<f64> = complete.iter().map(|&i| adjusted[i]).collect();
    let variance_reduction = reduction(sample_variance(&post_p), sample_variance(&after));
    let coefficients: Vec<f64> = beta.iter().copied().collect();
    debug!(?coefficients, variance_reduction, rows_used, "applied multi-covariate CUPED");

    Ok(MultiCupedResult { adjusted, variance_reduction, coefficients, rows_used, degenerate: false })
}

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

/// Check correlation, pre-period balance and achieved reduction.
///
/// Fails with `InsufficientData` when an arm has no non-missing covariate values.
pub fn validate_assumptions(post: &[f64], pre: &[f64], variants: &[Option<Variant>]) -> Result<AssumptionReport> {
    ensure_same_len("covariate", post.len(), pre.len())?;
    ensure_same_len("variant labels", post.len(), variants.len())?;

    let (post_p, pre_p): (Vec<f64>, Vec<f64>) = post
        .iter()
        .zip(pre)
        .filter(|(y, x)| !y.is_nan() && !x.is_nan())
        .map(|(&y, &x)| (y, x))
        .unzip();
    let correlation = pearson(&post_p, &pre_p);

    let (pre_control, pre_treatment) = split_by_variant(pre, variants);
    let balance = HypothesisTester::new(BALANCE_ALPHA)?
        .with_equal_variance(true)
        .continuous_test(&pre_control, &pre_treatment)?;

    let cuped = adjust(post, pre)?;

    let sufficient_correlation = correlation.abs() > MIN_CORRELATION;
    let pre_metric_balanced = balance.p_value > BALANCE_ALPHA;
    let effective = cuped.variance_reduction >= MIN_EFFECTIVE_REDUCTION;

    Ok(AssumptionReport {
        correlation,
        sufficient_correlation,
        balance_p_value: balance.p_value,
        pre_metric_balanced,
        variance_reduction: cuped.variance_reduction,
        theta: cuped.theta,
        effective,
        all_assumptions_met: sufficient_correlation && pre_metric_balanced && effective,
    })
}

/// Run `tester`'s continuous test on the raw and the adjusted metric.
pub fn compare_with_without(
    post: &[f64],
    pre: &[f64],
    variants: &[Option<Variant>],
    tester: &HypothesisTester,
) -> Result<CupedComparison> {
    let cuped = adjust_with_labels(post, pre, variants)?;

    let (control, treatment) = split_by_variant(post, variants);
    let without = tester.continuous_test(&control, &treatment)?;
    let (control, treatment) = split_by_variant(&cuped.adjusted, variants);
    let with = tester.continuous_test(&control, &treatment)?;

    let power_increase_factor = if cuped.variance_reduction < 1.0 {
        (1.0 / (1.0 - cuped.variance_reduction)).sqrt()
    } else {
        1.0
    };

    Ok(CupedComparison {
        without,
        with,
        variance_reduction: cuped.variance_reduction,
        power_increase_factor,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
