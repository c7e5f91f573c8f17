//! # Stage: Variant Assigner
//!
//! ## Responsibility
//! Deterministic hash-based bucketing of experimental units into variants,
//! with traffic ramping (holdout) and a stratified entry point.
//!
//! ## Guarantees
//! - Pure: the variant is a function of (unit id, experiment id, seed or
//!   stratum, variant count, allocation) only. No clock, counter or state.
//! - Stable: SHA-1 over the UTF-8 bytes of `"{unit}:{experiment}"`
//!   (+ `":{seed}"` or `":{stratum}"`); the first 16 digest bytes are read as
//!   a big-endian `u128`. Any reimplementation with the same encoding
//!   reproduces every assignment bit for bit.
//! - Ramp-safe: raising `traffic_allocation` only admits new units; the
//!   variant of an admitted unit never depends on the allocation.
//!
//! ## NOT Responsible For
//! - Persisting assignments (they are recomputed on demand)
//! - Block randomization or adaptive rebalancing across strata

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::config::AssignmentConfig;
use crate::error::{EngineError, Result};

/// Resolution of the uniform draw used for the traffic check.
pub const HASH_BUCKETS: u128 = 10_000;

// ---------------------------------------------------------------------------
// Variant
// ---------------------------------------------------------------------------

/// One arm of an experiment, or the holdout for units outside the ramp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Variant {
    Control,
    /// Treatment bucket `k` (1-based; `k < variant_count`).
    Treatment(u32),
    /// Unit excluded by traffic allocation.
    Holdout,
}

impl Variant {
    /// The single treatment arm of a two-variant experiment.
    pub const TREATMENT: Variant = Variant::Treatment(1);

    pub fn is_holdout(&self) -> bool {
        matches!(self, Variant::Holdout)
    }

    fn from_bucket(bucket: u32) -> Self {
        if bucket == 0 {
            Variant::Control
        } else {
            Variant::Treatment(bucket)
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variant::Control      => write!(f, "control"),
            Variant::Treatment(1) => write!(f, "treatment"),
            Variant::Treatment(k) => write!(f, "treatment_{k}"),
            Variant::Holdout      => write!(f, "holdout"),
        }
    }
}

impl FromStr for Variant {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "control" => Ok(Variant::Control),
            "treatment" => Ok(Variant::TREATMENT),
            "holdout" => Ok(Variant::Holdout),
            other => other
                .strip_prefix("treatment_")
                .and_then(|k| k.parse::<u32>().ok())
                .filter(|k| *k >= 1)
                .map(Variant::Treatment)
                .ok_or_else(|| EngineError::config(format!("unknown variant label '{s}'"))),
        }
    }
}

impl TryFrom<String> for Variant {
    type Error = EngineError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Variant> for String {
    fn from(v: Variant) -> Self {
        v.to_string()
    }
}

// ---------------------------------------------------------------------------
// Hashing
// ---------------------------------------------------------------------------

fn hash_key(key: &str) -> u128 {
    let digest = Sha1::digest(key.as_bytes());
    let mut head = [0u8; 16];
    head.copy_from_slice(&digest[..16]);
    u128::from_be_bytes(head)
}

/// Uniform draw in `[0, 1)` with 1/10 000 resolution.
fn uniform_draw(hash: u128) -> f64 {
    (hash % HASH_BUCKETS) as f64 / HASH_BUCKETS as f64
}

fn validate(variant_count: u32, traffic_allocation: f64) -> Result<()> {
    AssignmentConfig {
        variant_count,
        traffic_allocation,
        ..AssignmentConfig::default()
    }
    .validate()
}

// ---------------------------------------------------------------------------
// Free functions
// ---------------------------------------------------------------------------

/// Assign a unit to a variant of one experiment.
///
/// Units whose uniform draw falls at or above `traffic_allocation` land in
/// [`Variant::Holdout`]; everyone else is bucketed by `hash % variant_count`.
pub fn assign(
    unit_id: &str,
    experiment_id: &str,
    variant_count: u32,
    traffic_allocation: f64,
    seed: Option<u64>,
) -> Result<Variant> {
    validate(variant_count, traffic_allocation)?;
    let key = match seed {
        Some(seed) => format!("{unit_id}:{experiment_id}:{seed}"),
        None => format!("{unit_id}:{experiment_id}"),
    };
    let hash = hash_key(&key);
    if uniform_draw(hash) >= traffic_allocation {
        return Ok(Variant::Holdout);
    }
    Ok(Variant::from_bucket((hash % variant_count as u128) as u32))
}

/// Assign within a stratum. The stratum key is mixed into the hash so each
/// stratum is randomized independently; there is no traffic ramp.
pub fn assign_stratified(
    unit_id: &str,
    experiment_id: &str,
    stratum: &str,
    variant_count: u32,
) -> Result<Variant> {
    validate(variant_count, 1.0)?;
    let hash = hash_key(&format!("{unit_id}:{experiment_id}:{stratum}"));
    Ok(Variant::from_bucket((hash % variant_count as u128) as u32))
}

/// `true` when a fresh full-traffic, unseeded assignment reproduces `expected`.
pub fn check_consistency(
    unit_id: &str,
    experiment_id: &str,
    expected: Variant,
    variant_count: u32,
) -> Result<bool> {
    Ok(assign(unit_id, experiment_id, variant_count, 1.0, None)? == expected)
}

/// Theoretical probability of landing in `variant`.
pub fn assignment_probability(variant: Variant, variant_count: u32, traffic_allocation: f64) -> Result<f64> {
    validate(variant_count, traffic_allocation)?;
    Ok(match variant {
        Variant::Holdout => 1.0 - traffic_allocation,
        Variant::Treatment(k) if k >= variant_count => 0.0,
        _ => traffic_allocation / variant_count as f64,
    })
}

// ---------------------------------------------------------------------------
// Assigner: configured entry point
// ---------------------------------------------------------------------------

/// Assigner bound to one [`AssignmentConfig`].
#[derive(Debug, Clone)]
pub struct Assigner {
    config: AssignmentConfig,
}

impl Assigner {
    pub fn new(config: AssignmentConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &AssignmentConfig {
        &self.config
    }

    pub fn assign(&self, unit_id: &str, experiment_id: &str) -> Result<Variant> {
        assign(
            unit_id,
            experiment_id,
            self.config.variant_count,
            self.config.traffic_allocation,
            self.config.seed,
        )
    }

    pub fn assign_stratified(&self, unit_id: &str, experiment_id: &str, stratum: &str) -> Result<Variant> {
        assign_stratified(unit_id, experiment_id, stratum, self.config.variant_count)
    }
}

// ---------------------------------------------------------------------------
// Distribution check
// ---------------------------------------------------------------------------

/// Observed split of a population of unit ids under one experiment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BalanceReport {
    pub control: usize,
    pub treatment: usize,
    pub holdout: usize,
    /// control / (control + treatment); 0 when nobody was admitted.
    pub observed_ratio: f64,
    pub expected_ratio: f64,
    pub deviation: f64,
    pub tolerance: f64,
    pub is_balanced: bool,
}

/// Assign every id with the default two-variant, full-traffic settings and
/// compare the control share against `expected_ratio`.
pub fn check_distribution<S: AsRef<str>>(
    unit_ids: &[S],
    experiment_id: &str,
    expected_ratio: f64,
    tolerance: f64,
) -> Result<BalanceReport> {
    let (mut control, mut treatment, mut holdout) = (0usize, 0usize, 0usize);
    for id in unit_ids {
        match assign(id.as_ref(), experiment_id, 2, 1.0, None)? {
            Variant::Control => control += 1,
            Variant::Treatment(_) => treatment += 1,
            Variant::Holdout => holdout += 1,
        }
    }
    let admitted = control + treatment;
    let observed_ratio = if admitted > 0 { control as f64 / admitted as f64 } else { 0.0 };
    let deviation = (observed_ratio - expected_ratio).abs();
    Ok(BalanceReport {
        control,
        treatment,
        holdout,
        observed_ratio,
        expected_ratio,
        deviation,
        tolerance,
        is_balanced: deviation <= tolerance,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
