//! # Stage: Unit Table
//!
//! ## Responsibility
//! The unit-level input of an analysis: one row per randomization unit with
//! its variant label, optional stratum and any number of other columns.
//! Numbers and booleans become metric values; strings and nested values are
//! kept as attributes and never tested. Converts columns into the `NaN`-encoded slices the engines take,
//! classifies metrics and reports completeness.
//!
//! ## Guarantees
//! - A `null` or absent metric value is missing, never zero
//! - `true`/`false` read as 1/0, so boolean flags classify as binary metrics
//! - Parsing never fails on a non-numeric column; only testing one does
//! - Column extraction preserves row order, so columns stay paired
//!
//! ## NOT Responsible For
//! - Any statistics beyond counting (see [`crate::hypothesis`])

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::assignment::{Assigner, Variant};
use crate::error::Result;

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

/// One randomization unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawRecord", into = "RawRecord")]
pub struct UnitRecord {
    pub unit_id: String,
    pub variant: Option<Variant>,
    pub stratum: Option<String>,
    /// Numeric and boolean columns; `None` for an explicit `null`.
    pub metrics: BTreeMap<String, Option<f64>>,
    /// Columns holding strings, arrays or objects (device type, app version...).
    pub attributes: BTreeMap<String, Value>,
}

/// Wire shape of a row: every field besides the three reserved ones is a column.
#[derive(Serialize, Deserialize)]
struct RawRecord {
    unit_id: String,
    #[serde(default)]
    variant: Option<Variant>,
    #[serde(default)]
    stratum: Option<String>,
    #[serde(flatten)]
    columns: BTreeMap<String, Value>,
}

impl From<RawRecord> for UnitRecord {
    fn from(raw: RawRecord) -> Self {
        let mut metrics = BTreeMap::new();
        let mut attributes = BTreeMap::new();
        for (name, value) in raw.columns {
            match value {
                Value::Null          => { metrics.insert(name, None); }
                Value::Bool(flag)    => { metrics.insert(name, Some(if flag { 1.0 } else { 0.0 })); }
                Value::Number(n)     => { metrics.insert(name, n.as_f64()); }
                other                => { attributes.insert(name, other); }
            }
        }
        Self { unit_id: raw.unit_id, variant: raw.variant, stratum: raw.stratum, metrics, attributes }
    }
}

impl From<UnitRecord> for RawRecord {
    fn from(record: UnitRecord) -> Self {
        let mut columns = record.attributes;
        for (name, value) in record.metrics {
            // Non-finite values have no JSON form and serialize as null.
            columns.insert(name, value.map_or(Value::Null, Value::from));
        }
        Self { unit_id: record.unit_id, variant: record.variant, stratum: record.stratum, columns }
    }
}

impl UnitRecord {
    pub fn new(unit_id: impl Into<String>, variant: Option<Variant>) -> Self {
        Self {
            unit_id: unit_id.into(),
            variant,
            stratum: None,
            metrics: BTreeMap::new(),
            attributes: BTreeMap::new(),
        }
    }

    /// Builder-style metric setter.
    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), Some(value));
        self
    }

    pub fn with_stratum(mut self, stratum: impl Into<String>) -> Self {
        self.stratum = Some(stratum.into());
        self
    }

    /// Metric value, `NaN` when missing or not numeric.
    pub fn value(&self, metric: &str) -> f64 {
        self.metrics.get(metric).copied().flatten().unwrap_or(f64::NAN)
    }

    fn is_missing(&self, column: &str) -> bool {
        match self.metrics.get(column) {
            Some(value) => value.map_or(true, f64::is_nan),
            None => !self.attributes.contains_key(column),
        }
    }
}

/// Tallies of rows per label.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ArmCounts {
    pub control: u64,
    /// Rows labeled with the first treatment arm.
    pub treatment: u64,
    /// Rows in treatment arms beyond the first.
    pub other_treatments: u64,
    pub holdout: u64,
    pub unlabeled: u64,
}

/// Split a row-aligned column into (control, first treatment) values.
/// Rows with any other label are ignored.
pub fn split_by_variant(values: &[f64], variants: &[Option<Variant>]) -> (Vec<f64>, Vec<f64>) {
    let mut control = Vec::new();
    let mut treatment = Vec::new();
    for (&value, variant) in values.iter().zip(variants) {
        match variant {
            Some(Variant::Control) => control.push(value),
            Some(v) if *v == Variant::TREATMENT => treatment.push(value),
            _ => {}
        }
    }
    (control, treatment)
}

// ---------------------------------------------------------------------------
// Metric classification
// ---------------------------------------------------------------------------

/// How a metric column is tested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Every observed value is 0 or 1.
    Binary,
    Continuous,
}

impl MetricKind {
    /// Classify a column from its non-missing values; `None` when all are missing.
    pub fn classify(values: &[f64]) -> Option<MetricKind> {
        let mut observed = values.iter().filter(|v| !v.is_nan()).peekable();
        observed.peek()?;
        if observed.all(|&v| v == 0.0 || v == 1.0) {
            Some(MetricKind::Binary)
        } else {
            Some(MetricKind::Continuous)
        }
    }
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricKind::Binary     => write!(f, "binary"),
            MetricKind::Continuous => write!(f, "continuous"),
        }
    }
}

// ---------------------------------------------------------------------------
// Completeness
// ---------------------------------------------------------------------------

/// Missing values per column and duplicated unit ids.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Completeness {
    pub total_rows: usize,
    pub total_columns: usize,
    pub missing_values: BTreeMap<String, usize>,
    /// Percent of rows missing each column, rounded to two decimals.
    pub missing_percentages: BTreeMap<String, f64>,
    /// Rows whose `unit_id` already appeared earlier in the table.
    pub duplicate_rows: usize,
    pub duplicate_percentage: f64,
}

fn percent(count: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (count as f64 / total as f64 * 10_000.0).round() / 100.0
}

// ---------------------------------------------------------------------------
// UnitTable
// ---------------------------------------------------------------------------

/// Rows of an experiment, in input order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitTable {
    pub rows: Vec<UnitRecord>,
}

impl UnitTable {
    pub fn new(rows: Vec<UnitRecord>) -> Self {
        Self { rows }
    }

    /// Parse a JSON array of flat row objects.
    pub fn from_json_str(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Every column name seen in any row, numeric or not, sorted.
    pub fn columns(&self) -> Vec<String> {
        self.rows
            .iter()
            .flat_map(|r| r.metrics.keys().chain(r.attributes.keys()).cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.rows
            .iter()
            .any(|r| r.metrics.contains_key(name) || r.attributes.contains_key(name))
    }

    /// `false` when any row holds a string or nested value in `name`.
    pub fn is_numeric(&self, name: &str) -> bool {
        !self.rows.iter().any(|r| r.attributes.contains_key(name))
    }

    /// Column values in row order with `NaN` for missing entries.
    pub fn column(&self, name: &str) -> Vec<f64> {
        self.rows.iter().map(|r| r.value(name)).collect()
    }

    /// Column values of rows labeled `variant`.
    pub fn arm_column(&self, name: &str, variant: Variant) -> Vec<f64> {
        self.rows
            .iter()
            .filter(|r| r.variant == Some(variant))
            .map(|r| r.value(name))
            .collect()
    }

    /// Variant labels in row order.
    pub fn variants(&self) -> Vec<Option<Variant>> {
        self.rows.iter().map(|r| r.variant).collect()
    }

    pub fn arm_counts(&self) -> ArmCounts {
        let mut counts = ArmCounts::default();
        for row in &self.rows {
            match row.variant {
                Some(Variant::Control) => counts.control += 1,
                Some(Variant::Treatment(1)) => counts.treatment += 1,
                Some(Variant::Treatment(_)) => counts.other_treatments += 1,
                Some(Variant::Holdout) => counts.holdout += 1,
                None => counts.unlabeled += 1,
            }
        }
        counts
    }

    /// Label every unlabeled row through `assigner`. Rows carrying a stratum
    /// use the stratified entry. Returns how many rows were labeled.
    pub fn label_unassigned(&mut self, assigner: &Assigner, experiment_id: &str) -> Result<usize> {
        let mut labeled = 0;
        for row in self.rows.iter_mut().filter(|r| r.variant.is_none()) {
            let variant = match &row.stratum {
                Some(stratum) => assigner.assign_stratified(&row.unit_id, experiment_id, stratum)?,
                None => assigner.assign(&row.unit_id, experiment_id)?,
            };
            row.variant = Some(variant);
            labeled += 1;
        }
        if labeled > 0 {
            debug!(labeled, experiment_id, "labeled unassigned units");
        }
        Ok(labeled)
    }

    /// Copy of the table without holdout rows.
    pub fn without_holdouts(&self) -> UnitTable {
        UnitTable::new(
            self.rows
                .iter()
                .filter(|r| !r.variant.is_some_and(|v| v.is_holdout()))
                .cloned()
                .collect(),
        )
    }

    pub fn completeness(&self) -> Completeness {
        let total_rows = self.rows.len();
        let columns = self.columns();

        let mut missing_values = BTreeMap::new();
        let mut missing_percentages = BTreeMap::new();
        for name in &columns {
            let missing = self.rows.iter().filter(|r| r.is_missing(name)).count();
            missing_percentages.insert(name.clone(), percent(missing, total_rows));
            missing_values.insert(name.clone(), missing);
        }

        let mut seen = HashSet::with_capacity(total_rows);
        let duplicate_rows = self.rows.iter().filter(|r| !seen.insert(r.unit_id.as_str())).count();

        Completeness {
            total_rows,
            total_columns: columns.len(),
            missing_values,
            missing_percentages,
            duplicate_rows,
            duplicate_percentage: percent(duplicate_rows, total_rows),
        }
    }
}

impl FromIterator<UnitRecord> for UnitTable {
    fn from_iter<I: IntoIterator<Item = UnitRecord>>(iter: I) -> Self {
        UnitTable::new(iter.into_iter().collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AssignmentConfig;

    fn sample_table() -> UnitTable {
        UnitTable::from_json_str(
            r#"[
                {"unit_id": "u1", "variant": "control", "converted": 1, "revenue": 12.5},
                {"unit_id": "u2", "variant": "treatment", "converted": 0, "revenue": null},
                {"unit_id": "u3", "variant": "holdout", "converted": 0},
                {"unit_id": "u1", "variant": "control", "converted": 0, "revenue": 3.0}
            ]"#,
        )
        .unwrap()
    }

    // ===== Parsing =====

    #[test]
    fn test_parse_flat_rows() {
        let table = sample_table();
        assert_eq!(table.len(), 4);
        assert_eq!(table.rows[0].variant, Some(Variant::Control));
        assert_eq!(table.rows[1].variant, Some(Variant::TREATMENT));
        assert_eq!(table.rows[0].value("revenue"), 12.5);
    }

    #[test]
    fn test_null_and_absent_are_missing() {
        let table = sample_table();
        assert!(table.rows[1].value("revenue").is_nan());
        assert!(table.rows[2].value("revenue").is_nan());
    }

    #[test]
    fn test_parse_rejects_unknown_variant() {
        let err = UnitTable::from_json_str(r#"[{"unit_id": "a", "variant": "mystery"}]"#).unwrap_err();
        assert!(matches!(err, crate::error::EngineError::TableParse(_)));
    }

    #[test]
    fn test_parse_missing_variant_is_unlabeled() {
        let table = UnitTable::from_json_str(r#"[{"unit_id": "a", "x": 2}]"#).unwrap();
        assert_eq!(table.rows[0].variant, None);
    }

    #[test]
    fn test_parse_keeps_string_columns_as_attributes() {
        let table = UnitTable::from_json_str(
            r#"[{"unit_id": "a", "variant": "control", "converted": 1, "device_type": "ios", "app_version": "4.2.0"}]"#,
        )
        .unwrap();
        let row = &table.rows[0];
        assert_eq!(row.value("converted"), 1.0);
        assert_eq!(row.attributes["device_type"], "ios");
        assert!(row.value("device_type").is_nan());
        assert!(!table.is_numeric("device_type"));
        assert!(table.is_numeric("converted"));
    }

    #[test]
    fn test_parse_booleans_as_zero_one() {
        let table = UnitTable::from_json_str(
            r#"[
                {"unit_id": "a", "variant": "control", "converted": true},
                {"unit_id": "b", "variant": "treatment", "converted": false}
            ]"#,
        )
        .unwrap();
        assert_eq!(table.column("converted"), vec![1.0, 0.0]);
        assert_eq!(MetricKind::classify(&table.column("converted")), Some(MetricKind::Binary));
    }

    #[test]
    fn test_mixed_column_is_not_numeric() {
        let table = UnitTable::from_json_str(
            r#"[
                {"unit_id": "a", "score": 3.5},
                {"unit_id": "b", "score": "n/a"},
                {"unit_id": "c", "score": null}
            ]"#,
        )
        .unwrap();
        assert!(table.has_column("score"));
        assert!(!table.is_numeric("score"));
        assert!(table.column("score")[2].is_nan());
    }

    #[test]
    fn test_attributes_survive_serialization() {
        let json = r#"[{"unit_id":"a","variant":"treatment","device_type":"android","revenue":2.5}]"#;
        let table = UnitTable::from_json_str(json).unwrap();
        let again = UnitTable::from_json_str(&serde_json::to_string(&table).unwrap()).unwrap();
        assert_eq!(again, table);
    }

    // ===== Columns =====

    #[test]
    fn test_columns_sorted_union() {
        assert_eq!(sample_table().columns(), vec!["converted".to_string(), "revenue".to_string()]);
    }

    #[test]
    fn test_arm_column_filters_by_variant() {
        let table = sample_table();
        assert_eq!(table.arm_column("converted", Variant::Control), vec![1.0, 0.0]);
        assert_eq!(table.arm_column("converted", Variant::TREATMENT), vec![0.0]);
    }

    #[test]
    fn test_split_by_variant_ignores_other_arms() {
        let variants = [
            Some(Variant::Control),
            Some(Variant::TREATMENT),
            Some(Variant::Treatment(2)),
            None,
            Some(Variant::Control),
        ];
        let (c, t) = split_by_variant(&[1.0, 2.0, 3.0, 4.0, 5.0], &variants);
        assert_eq!(c, vec![1.0, 5.0]);
        assert_eq!(t, vec![2.0]);
    }

    #[test]
    fn test_arm_counts() {
        let counts = sample_table().arm_counts();
        assert_eq!(counts.control, 2);
        assert_eq!(counts.treatment, 1);
        assert_eq!(counts.holdout, 1);
        assert_eq!(counts.unlabeled, 0);
    }

    #[test]
    fn test_without_holdouts() {
        let table = sample_table().without_holdouts();
        assert_eq!(table.len(), 3);
        assert_eq!(table.arm_counts().holdout, 0);
    }

    // ===== MetricKind =====

    #[test]
    fn test_classify_binary_ignores_missing() {
        assert_eq!(MetricKind::classify(&[0.0, 1.0, f64::NAN, 1.0]), Some(MetricKind::Binary));
    }

    #[test]
    fn test_classify_continuous() {
        assert_eq!(MetricKind::classify(&[0.0, 1.0, 0.5]), Some(MetricKind::Continuous));
    }

    #[test]
    fn test_classify_all_missing_is_none() {
        assert_eq!(MetricKind::classify(&[f64::NAN, f64::NAN]), None);
        assert_eq!(MetricKind::classify(&[]), None);
    }

    // ===== Completeness =====

    #[test]
    fn test_completeness_counts_missing_and_duplicates() {
        let report = sample_table().completeness();
        assert_eq!(report.total_rows, 4);
        assert_eq!(report.total_columns, 2);
        assert_eq!(report.missing_values["revenue"], 2);
        assert_eq!(report.missing_values["converted"], 0);
        assert_eq!(report.missing_percentages["revenue"], 50.0);
        assert_eq!(report.duplicate_rows, 1);
        assert_eq!(report.duplicate_percentage, 25.0);
    }

    #[test]
    fn test_completeness_counts_string_columns() {
        let table = UnitTable::from_json_str(
            r#"[
                {"unit_id": "a", "device_type": "ios"},
                {"unit_id": "b", "device_type": null},
                {"unit_id": "c"}
            ]"#,
        )
        .unwrap();
        let report = table.completeness();
        assert_eq!(report.total_columns, 1);
        assert_eq!(report.missing_values["device_type"], 2);
    }

    #[test]
    fn test_completeness_empty_table() {
        let report = UnitTable::default().completeness();
        assert_eq!(report.total_rows, 0);
        assert_eq!(report.duplicate_percentage, 0.0);
    }

    // ===== Labeling =====

    #[test]
    fn test_label_unassigned_only_touches_unlabeled() {
        let mut table: UnitTable = vec![
            UnitRecord::new("a", Some(Variant::Holdout)),
            UnitRecord::new("b", None),
            UnitRecord::new("c", None).with_stratum("mobile"),
        ]
        .into_iter()
        .collect();
        let assigner = Assigner::new(AssignmentConfig::default()).unwrap();
        let labeled = table.label_unassigned(&assigner, "exp").unwrap();
        assert_eq!(labeled, 2);
        assert_eq!(table.rows[0].variant, Some(Variant::Holdout));
        assert_eq!(table.rows[1].variant, Some(assigner.assign("b", "exp").unwrap()));
        assert_eq!(
            table.rows[2].variant,
            Some(assigner.assign_stratified("c", "exp", "mobile").unwrap())
        );
    }
}
