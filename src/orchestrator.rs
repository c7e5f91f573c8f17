//! # Stage: Orchestrator
//!
//! ## Responsibility
//! Run a full experiment analysis over a [`UnitTable`]:
//!
//! 1. Label unlabeled units through the assigner (when an experiment id is configured)
//! 2. Drop holdouts, measure completeness and check the sample ratio
//! 3. Classify each metric and dispatch it to the matching test, applying
//!    CUPED to continuous metrics that have a mapped covariate
//! 4. Correct the p-values when more than one metric was tested
//! 5. Derive the recommendation
//!
//! ## Guarantees
//! - A primary metric that could not be analyzed yields
//!   [`Recommendation::InvalidAnalysis`], not an error, even under SRM
//! - For an analyzed primary the order is fixed: SRM → ship → do-not-ship →
//!   keep running. A sample ratio mismatch blocks shipping whatever the
//!   metrics say.
//! - A failing secondary metric is skipped and logged
//!
//! ## NOT Responsible For
//! - Reading files or rendering output (see the binary)
//! - Comparing more than one treatment arm against control

use std::fmt;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::assignment::{Assigner, Variant};
use crate::config::{AnalysisConfig, EngineConfig};
use crate::correction::{correct, CorrectionResult};
use crate::cuped::adjust_with_labels;
use crate::error::{EngineError, Result};
use crate::hypothesis::{check_sample_ratio_mismatch, HypothesisTester, SrmResult, TestResult};
use crate::power::post_hoc_power;
use crate::table::{split_by_variant, ArmCounts, Completeness, MetricKind, UnitTable};

// ---------------------------------------------------------------------------
// Report types
// ---------------------------------------------------------------------------

/// Why an experiment should not ship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DoNotShipReason {
    /// Arm sizes deviate from the planned split; results are untrustworthy.
    SrmDetected,
    /// The primary metric moved significantly in the wrong direction.
    NegativeImpact,
}

/// Final decision for an experiment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Recommendation {
    Ship,
    DoNotShip { reason: DoNotShipReason },
    KeepRunning,
    /// The primary metric could not be analyzed.
    InvalidAnalysis { reason: String },
}

impl fmt::Display for Recommendation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recommendation::Ship                                                  => write!(f, "SHIP"),
            Recommendation::DoNotShip { reason: DoNotShipReason::SrmDetected }    => write!(f, "DO NOT SHIP (sample ratio mismatch)"),
            Recommendation::DoNotShip { reason: DoNotShipReason::NegativeImpact } => write!(f, "DO NOT SHIP (negative impact)"),
            Recommendation::KeepRunning                                           => write!(f, "KEEP RUNNING"),
            Recommendation::InvalidAnalysis { reason }                            => write!(f, "INVALID ANALYSIS ({reason})"),
        }
    }
}

/// How CUPED was applied to a metric.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CupedSummary {
    pub covariate: String,
    pub theta: f64,
    pub variance_reduction: f64,
    pub rows_used: usize,
    pub degenerate: bool,
    /// `None` when the effect check could not run.
    pub effect_preserved: Option<bool>,
}

/// One tested metric.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricAnalysis {
    pub metric: String,
    pub kind: MetricKind,
    pub result: TestResult,
    pub cuped: Option<CupedSummary>,
    /// Equals `result.p_value` when only one metric was tested.
    pub corrected_p_value: f64,
    pub significant_after_correction: bool,
}

/// A metric that could not be tested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedMetric {
    pub metric: String,
    pub reason: String,
}

/// Input health checks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataQuality {
    pub completeness: Completeness,
    /// Counts before holdouts are dropped.
    pub arm_counts: ArmCounts,
    /// Rows labeled by the assigner during this analysis.
    pub units_labeled: usize,
    pub srm: SrmResult,
}

/// Everything an analysis produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExperimentReport {
    pub primary_metric: String,
    pub alpha: f64,
    pub recommendation: Recommendation,
    pub data_quality: DataQuality,
    pub metrics: Vec<MetricAnalysis>,
    /// Present when more than one metric was tested.
    pub correction: Option<CorrectionResult>,
    pub skipped: Vec<SkippedMetric>,
    /// Achieved power of the primary metric, binary metrics only.
    pub primary_power: Option<f64>,
}

impl ExperimentReport {
    pub fn metric(&self, name: &str) -> Option<&MetricAnalysis> {
        self.metrics.iter().find(|m| m.metric == name)
    }

    pub fn primary(&self) -> Option<&MetricAnalysis> {
        self.metric(&self.primary_metric)
    }
}

// ---------------------------------------------------------------------------
// Analyzer
// ---------------------------------------------------------------------------

/// Configured analysis pipeline.
#[derive(Debug, Clone)]
pub struct Analyzer {
    config: EngineConfig,
    tester: HypothesisTester,
    assigner: Assigner,
}

/// Intermediate per-metric outcome before correction.
struct Tested {
    metric: String,
    kind: MetricKind,
    result: TestResult,
    cuped: Option<CupedSummary>,
}

impl Analyzer {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let tester = HypothesisTester::from_config(&config.analysis)?;
        let assigner = Assigner::new(config.assignment.clone())?;
        Ok(Self { config, tester, assigner })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Analyze `metrics` (the primary is added when absent) and recommend.
    ///
    /// Fails with `InsufficientData` when, after dropping holdouts, the
    /// control or treatment arm is empty.
    pub fn analyze<S: AsRef<str>>(&self, table: &UnitTable, metrics: &[S], primary: &str) -> Result<ExperimentReport> {
        let analysis = &self.config.analysis;

        let mut labeled = table.clone();
        let units_labeled = match &self.config.assignment.experiment_id {
            Some(experiment_id) => labeled.label_unassigned(&self.assigner, experiment_id)?,
            None => 0,
        };
        let arm_counts = labeled.arm_counts();
        if arm_counts.unlabeled > 0 {
            warn!(unlabeled = arm_counts.unlabeled, "rows without a variant are excluded");
        }
        if arm_counts.other_treatments > 0 {
            warn!(rows = arm_counts.other_treatments, "rows in additional treatment arms are excluded");
        }
        if arm_counts.control == 0 || arm_counts.treatment == 0 {
            return Err(EngineError::insufficient(format!(
                "need both arms, got {} control and {} treatment units",
                arm_counts.control, arm_counts.treatment
            )));
        }

        let completeness = labeled.completeness();
        let active = labeled.without_holdouts();
        let srm = check_sample_ratio_mismatch(
            arm_counts.control,
            arm_counts.treatment,
            analysis.expected_ratio,
            analysis.srm_threshold,
        )?;
        if srm.srm_detected {
            warn!(p_value = srm.p_value, observed_ratio = srm.observed_ratio, "sample ratio mismatch detected");
        }

        let mut names: Vec<&str> = Vec::with_capacity(metrics.len() + 1);
        if !metrics.iter().any(|m| m.as_ref() == primary) {
            debug!(primary, "primary metric not in metric list, analyzing it first");
            names.push(primary);
        }
        for metric in metrics {
            if !names.contains(&metric.as_ref()) {
                names.push(metric.as_ref());
            }
        }

        let mut tested = Vec::new();
        let mut skipped = Vec::new();
        for name in names {
            match self.test_metric(&active, name) {
                Ok(t) => tested.push(t),
                Err(reason) => {
                    warn!(metric = name, %reason, "skipping metric");
                    skipped.push(SkippedMetric { metric: name.to_string(), reason });
                }
            }
        }

        let (analyses, correction) = self.apply_correction(tested)?;
        let primary_analysis = analyses.iter().find(|m| m.metric == primary);

        let recommendation = match primary_analysis {
            None => {
                let reason = skipped
                    .iter()
                    .find(|s| s.metric == primary)
                    .map(|s| format!("primary metric '{primary}': {}", s.reason))
                    .unwrap_or_else(|| format!("primary metric '{primary}' was not analyzed"));
                Recommendation::InvalidAnalysis { reason }
            }
            Some(_) if srm.srm_detected => Recommendation::DoNotShip { reason: DoNotShipReason::SrmDetected },
            Some(m) => decide(m),
        };

        let primary_power = primary_analysis
            .filter(|m| m.kind == MetricKind::Binary)
            .and_then(|m| {
                post_hoc_power(
                    m.result.n_control,
                    m.result.n_treatment,
                    m.result.control_estimate,
                    m.result.treatment_estimate,
                    analysis.alpha,
                )
                .ok()
            });

        info!(
            primary,
            tested = analyses.len(),
            skipped = skipped.len(),
            recommendation = %recommendation,
            "analysis complete"
        );

        Ok(ExperimentReport {
            primary_metric: primary.to_string(),
            alpha: analysis.alpha,
            recommendation,
            data_quality: DataQuality { completeness, arm_counts, units_labeled, srm },
            metrics: analyses,
            correction,
            skipped,
            primary_power,
        })
    }

    /// Test one metric; `Err` carries the human-readable skip reason.
    fn test_metric(&self, table: &UnitTable, metric: &str) -> std::result::Result<Tested, String> {
        if !table.has_column(metric) {
            return Err("column not found".to_string());
        }
        if !table.is_numeric(metric) {
            return Err("column is not numeric".to_string());
        }
        let values = table.column(metric);
        let kind = MetricKind::classify(&values).ok_or_else(|| "no observed values".to_string())?;
        let variants = table.variants();

        match kind {
            MetricKind::Binary => {
                let (control, treatment) = split_by_variant(&values, &variants);
                let (s_c, n_c) = successes(&control);
                let (s_t, n_t) = successes(&treatment);
                if n_c == 0 || n_t == 0 {
                    return Err("an arm has no observed values".to_string());
                }
                let result = self.tester.proportion_test(s_c, n_c, s_t, n_t).map_err(|e| e.to_string())?;
                Ok(Tested { metric: metric.to_string(), kind, result, cuped: None })
            }
            MetricKind::Continuous => {
                let (values, cuped) = self.maybe_cuped(table, metric, values, &variants)?;
                let (control, treatment) = split_by_variant(&values, &variants);
                let result = self.tester.continuous_test(&control, &treatment).map_err(|e| e.to_string())?;
                Ok(Tested { metric: metric.to_string(), kind, result, cuped })
            }
        }
    }

    fn maybe_cuped(
        &self,
        table: &UnitTable,
        metric: &str,
        values: Vec<f64>,
        variants: &[Option<Variant>],
    ) -> std::result::Result<(Vec<f64>, Option<CupedSummary>), String> {
        let analysis = &self.config.analysis;
        let covariate = match analysis.cuped_covariates.get(metric) {
            Some(c) if analysis.use_cuped => c,
            _ => return Ok((values, None)),
        };
        if !table.has_column(covariate) {
            warn!(metric, covariate = covariate.as_str(), "CUPED covariate column missing, testing unadjusted");
            return Ok((values, None));
        }

        let cuped = adjust_with_labels(&values, &table.column(covariate), variants).map_err(|e| e.to_string())?;
        let summary = CupedSummary {
            covariate: covariate.clone(),
            theta: cuped.theta,
            variance_reduction: cuped.variance_reduction,
            rows_used: cuped.rows_used,
            degenerate: cuped.degenerate,
            effect_preserved: cuped.effect_check.map(|c| c.preserved),
        };
        Ok((cuped.adjusted, Some(summary)))
    }

    fn apply_correction(&self, tested: Vec<Tested>) -> Result<(Vec<MetricAnalysis>, Option<CorrectionResult>)> {
        let analysis = &self.config.analysis;
        if tested.len() <= 1 {
            let analyses = tested
                .into_iter()
                .map(|t| MetricAnalysis {
                    corrected_p_value: t.result.p_value,
                    significant_after_correction: t.result.statistically_significant,
                    metric: t.metric,
                    kind: t.kind,
                    result: t.result,
                    cuped: t.cuped,
                })
                .collect();
            return Ok((analyses, None));
        }

        let p_values: Vec<f64> = tested.iter().map(|t| t.result.p_value).collect();
        let correction = correct(&p_values, analysis.alpha, analysis.multiple_testing_method)?;
        let analyses = tested
            .into_iter()
            .enumerate()
            .map(|(i, t)| MetricAnalysis {
                corrected_p_value: correction.adjusted_p_values[i],
                significant_after_correction: correction.rejected[i],
                metric: t.metric,
                kind: t.kind,
                result: t.result,
                cuped: t.cuped,
            })
            .collect();
        Ok((analyses, Some(correction)))
    }
}

fn successes(values: &[f64]) -> (u64, u64) {
    values
        .iter()
        .filter(|v| !v.is_nan())
        .fold((0, 0), |(s, n), &v| (s + (v == 1.0) as u64, n + 1))
}

/// Ship / do-not-ship / keep-running for an analyzed primary metric.
fn decide(primary: &MetricAnalysis) -> Recommendation {
    let lift = primary.result.absolute_lift;
    if primary.significant_after_correction && lift > 0.0 {
        Recommendation::Ship
    } else if primary.significant_after_correction && lift < 0.0 {
        Recommendation::DoNotShip { reason: DoNotShipReason::NegativeImpact }
    } else {
        Recommendation::KeepRunning
    }
}

/// One-shot analysis with default configuration at significance level `alpha`.
pub fn analyze<S: AsRef<str>>(table: &UnitTable, metrics: &[S], primary: &str, alpha: f64) -> Result<ExperimentReport> {
    Analyzer::new(AnalysisConfig::with_alpha(alpha).into())?.analyze(table, metrics, primary)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
