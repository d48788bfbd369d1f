//! Canonical in-memory representation of ingested measurements
//!
//! Every source (remote API, account export, FIT files) is normalized into
//! [`MetricRecord`]s before anything is written to a sink.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::error::IngestError;

/// Granularity of a metric stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    /// One summary value set per calendar day (or per activity)
    Daily,
    /// Many samples per day
    Intraday,
}

/// Supported measurement categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    DailyStats,
    Sleep,
    HeartRate,
    Stress,
    BodyBattery,
    Steps,
    Hrv,
    Hydration,
    ActivitySummary,
    ActivityGps,
}

impl MetricKind {
    /// All kinds in the order an identity pass processes them
    pub const ALL: [MetricKind; 10] = [
        MetricKind::DailyStats,
        MetricKind::Sleep,
        MetricKind::HeartRate,
        MetricKind::Stress,
        MetricKind::BodyBattery,
        MetricKind::Steps,
        MetricKind::Hrv,
        MetricKind::Hydration,
        MetricKind::ActivitySummary,
        MetricKind::ActivityGps,
    ];

    /// Stable name used in the sync database and configuration
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::DailyStats => "daily_stats",
            MetricKind::Sleep => "sleep",
            MetricKind::HeartRate => "heart_rate",
            MetricKind::Stress => "stress",
            MetricKind::BodyBattery => "body_battery",
            MetricKind::Steps => "steps",
            MetricKind::Hrv => "hrv",
            MetricKind::Hydration => "hydration",
            MetricKind::ActivitySummary => "activity_summary",
            MetricKind::ActivityGps => "activity_gps",
        }
    }

    /// Measurement name in the time-series backend
    pub fn measurement(&self) -> &'static str {
        match self {
            MetricKind::DailyStats => "DailyStats",
            MetricKind::Sleep => "SleepSummary",
            MetricKind::HeartRate => "HeartRateIntraday",
            MetricKind::Stress => "StressIntraday",
            MetricKind::BodyBattery => "BodyBatteryIntraday",
            MetricKind::Steps => "StepsIntraday",
            MetricKind::Hrv => "HRV_Intraday",
            MetricKind::Hydration => "HydrationIntake",
            MetricKind::ActivitySummary => "ActivitySummary",
            MetricKind::ActivityGps => "ActivityGPS",
        }
    }

    pub fn resolution(&self) -> Resolution {
        match self {
            MetricKind::HeartRate
            | MetricKind::Stress
            | MetricKind::BodyBattery
            | MetricKind::Steps
            | MetricKind::Hrv
            | MetricKind::ActivityGps => Resolution::Intraday,
            _ => Resolution::Daily,
        }
    }

    /// Whether old data of this kind moves to the upstream cold archive.
    ///
    /// Activity files are kept forever upstream, so GPS tracks are exempt.
    pub fn archives_cold(&self) -> bool {
        self.resolution() == Resolution::Intraday && *self != MetricKind::ActivityGps
    }

    /// Largest range, in days, the source accepts in one call
    pub fn default_max_span_days(&self) -> u32 {
        match self {
            MetricKind::ActivitySummary => 30,
            MetricKind::ActivityGps => 7,
            _ => 1,
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MetricKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| IngestError::config(format!("Unknown metric kind: {}", s)))
    }
}

/// Scalar value of a single record field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl FieldValue {
    /// Convert a JSON scalar; arrays, objects and nulls have no field value
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(FieldValue::Bool(*b)),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(FieldValue::Int)
                .or_else(|| n.as_f64().map(FieldValue::Float)),
            serde_json::Value::String(s) => Some(FieldValue::Text(s.clone())),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Int(v) => Some(*v as f64),
            FieldValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Text(v)
    }
}

/// Content-derived key of an activity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActivityIdentity(String);

impl ActivityIdentity {
    /// Hash the immutable `file_id` fields of a FIT file.
    ///
    /// Fields are serialized as sorted-key JSON, so the result depends only on
    /// content and never on the file name or modification time.
    pub fn from_file_id(file_id: &BTreeMap<String, FieldValue>) -> Self {
        let canonical = serde_json::to_vec(file_id).unwrap_or_default();
        let mut context = md5::Context::new();
        context.consume(&canonical);
        Self(format!("{:x}", context.finalize()))
    }

    /// Identity of an activity known only by its remote id
    pub fn from_remote_id(activity_id: i64) -> Self {
        Self(activity_id.to_string())
    }

    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActivityIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The overwrite key of a record in every sink
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    pub kind: MetricKind,
    pub timestamp: NaiveDateTime,
    pub owner: Option<String>,
    /// Set for activity kinds only; back-to-back activities share timestamps
    pub activity: Option<ActivityIdentity>,
}

/// A timestamped set of measurements of one kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub kind: MetricKind,
    /// Source-local wall clock time, never shifted to UTC
    pub timestamp: NaiveDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity: Option<ActivityIdentity>,
    pub fields: BTreeMap<String, FieldValue>,
}

impl MetricRecord {
    pub fn new(kind: MetricKind, timestamp: NaiveDateTime) -> Self {
        Self {
            kind,
            timestamp,
            owner: None,
            activity: None,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_owner(mut self, owner: Option<&str>) -> Self {
        self.owner = owner.map(|o| o.to_string());
        self
    }

    pub fn with_activity(mut self, activity: ActivityIdentity) -> Self {
        self.activity = Some(activity);
        self
    }

    pub fn with_field(mut self, name: &str, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    /// Insert a field only when a value is present
    pub fn set_opt(&mut self, name: &str, value: Option<FieldValue>) {
        if let Some(v) = value {
            self.fields.insert(name.to_string(), v);
        }
    }

    pub fn key(&self) -> RecordKey {
        RecordKey {
            kind: self.kind,
            timestamp: self.timestamp,
            owner: self.owner.clone(),
            activity: match self.kind {
                MetricKind::ActivitySummary | MetricKind::ActivityGps => self.activity.clone(),
                _ => None,
            },
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Drop records whose key was already seen, keeping the first occurrence.
///
/// `seen` carries keys across batches so a whole run emits each key once.
pub fn retain_unseen(records: Vec<MetricRecord>, seen: &mut HashSet<RecordKey>) -> Vec<MetricRecord> {
    records
        .into_iter()
        .filter(|r| seen.insert(r.key()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts(h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap()
    }

    #[test]
    fn test_kind_round_trips_through_name() {
        for kind in MetricKind::ALL {
            assert_eq!(kind.as_str().parse::<MetricKind>().unwrap(), kind);
        }
        assert!("calories".parse::<MetricKind>().is_err());
    }

    #[test]
    fn test_cold_archive_applies_to_wellness_intraday_only() {
        assert!(MetricKind::HeartRate.archives_cold());
        assert!(MetricKind::Stress.archives_cold());
        assert!(!MetricKind::DailyStats.archives_cold());
        assert!(!MetricKind::ActivityGps.archives_cold());
    }

    #[test]
    fn test_field_value_from_json() {
        assert_eq!(FieldValue::from_json(&serde_json::json!(5)), Some(FieldValue::Int(5)));
        assert_eq!(FieldValue::from_json(&serde_json::json!(1.5)), Some(FieldValue::Float(1.5)));
        assert_eq!(FieldValue::from_json(&serde_json::json!("x")), Some(FieldValue::Text("x".into())));
        assert_eq!(FieldValue::from_json(&serde_json::json!(null)), None);
        assert_eq!(FieldValue::from_json(&serde_json::json!([1])), None);
    }

    #[test]
    fn test_identity_ignores_field_insertion_order() {
        let mut a = BTreeMap::new();
        a.insert("serial_number".to_string(), FieldValue::Int(3_900_000_001));
        a.insert("time_created".to_string(), FieldValue::Text("2024-03-01T07:00:00".into()));

        let mut b = BTreeMap::new();
        b.insert("time_created".to_string(), FieldValue::Text("2024-03-01T07:00:00".into()));
        b.insert("serial_number".to_string(), FieldValue::Int(3_900_000_001));

        let id = ActivityIdentity::from_file_id(&a);
        assert_eq!(id, ActivityIdentity::from_file_id(&b));
        assert_eq!(id.as_str().len(), 32);

        b.insert("serial_number".to_string(), FieldValue::Int(3_900_000_002));
        assert_ne!(id, ActivityIdentity::from_file_id(&b));
    }

    #[test]
    fn test_retain_unseen_across_batches() {
        let mut seen = HashSet::new();
        let first = vec![
            MetricRecord::new(MetricKind::HeartRate, ts(1)).with_field("HeartRate", 60i64),
            MetricRecord::new(MetricKind::HeartRate, ts(1)).with_field("HeartRate", 61i64),
            MetricRecord::new(MetricKind::HeartRate, ts(2)).with_field("HeartRate", 62i64),
        ];
        let kept = retain_unseen(first, &mut seen);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].fields["HeartRate"], FieldValue::Int(60));

        let second = vec![
            MetricRecord::new(MetricKind::HeartRate, ts(2)),
            MetricRecord::new(MetricKind::HeartRate, ts(2)).with_owner(Some("alice")),
        ];
        let kept = retain_unseen(second, &mut seen);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].owner.as_deref(), Some("alice"));
    }

    #[test]
    fn test_activity_records_keyed_by_identity() {
        let mut seen = HashSet::new();
        let records = vec![
            MetricRecord::new(MetricKind::ActivitySummary, ts(7))
                .with_activity(ActivityIdentity::new("a"))
                .with_field("activityName", "END"),
            MetricRecord::new(MetricKind::ActivitySummary, ts(7))
                .with_activity(ActivityIdentity::new("b"))
                .with_field("activityType", "running"),
            MetricRecord::new(MetricKind::HeartRate, ts(7))
                .with_activity(ActivityIdentity::new("a"))
                .with_field("HeartRate", 60i64),
            MetricRecord::new(MetricKind::HeartRate, ts(7))
                .with_activity(ActivityIdentity::new("b"))
                .with_field("HeartRate", 61i64),
        ];
        let kept = retain_unseen(records, &mut seen);
        assert_eq!(kept.len(), 3);
        assert_eq!(kept[1].activity, Some(ActivityIdentity::new("b")));
    }
}
