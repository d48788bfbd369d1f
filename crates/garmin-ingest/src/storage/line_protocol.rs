//! InfluxDB line protocol encoding
//!
//! `measurement,tag=value field=value timestamp` with nanosecond timestamps.
//! Record timestamps are source-local wall clock and are written as if UTC.

use std::fmt::Write as _;

use crate::models::{FieldValue, MetricRecord};

/// Tag carrying the identity in multi-user mode
pub const OWNER_TAG: &str = "User_ID";
/// Tag carrying the content-derived activity identity
pub const ACTIVITY_TAG: &str = "ActivityID";

/// Line breaks end a point, so they cannot survive in any position
fn flatten_lines(s: &str) -> String {
    s.replace("\r\n", " ").replace(['\n', '\r'], " ")
}

fn escape_measurement(s: &str) -> String {
    flatten_lines(s).replace('\\', "\\\\").replace(',', "\\,").replace(' ', "\\ ")
}

/// Tag keys, tag values and field keys share one escaping rule
fn escape_key(s: &str) -> String {
    flatten_lines(s)
        .replace('\\', "\\\\")
        .replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}

fn escape_string_field(s: &str) -> String {
    flatten_lines(s).replace('\\', "\\\\").replace('"', "\\\"")
}

fn encode_field(value: &FieldValue) -> Option<String> {
    match value {
        FieldValue::Bool(b) => Some(b.to_string()),
        FieldValue::Int(i) => Some(format!("{}i", i)),
        FieldValue::Float(f) if f.is_finite() => Some(format!("{}", f)),
        FieldValue::Float(_) => None,
        FieldValue::Text(s) => Some(format!("\"{}\"", escape_string_field(s))),
    }
}

/// Encode one record; `None` when it has nothing writable
pub fn encode_record(record: &MetricRecord) -> Option<String> {
    let fields: Vec<String> = record
        .fields
        .iter()
        .filter_map(|(k, v)| encode_field(v).map(|v| format!("{}={}", escape_key(k), v)))
        .collect();
    if fields.is_empty() {
        return None;
    }
    let nanos = record.timestamp.and_utc().timestamp_nanos_opt()?;

    let mut line = escape_measurement(record.kind.measurement());
    // Tags sorted by key, as the server prefers
    if let Some(activity) = &record.activity {
        let _ = write!(line, ",{}={}", ACTIVITY_TAG, escape_key(activity.as_str()));
    }
    if let Some(owner) = record.owner.as_deref().filter(|o| !o.is_empty()) {
        let _ = write!(line, ",{}={}", OWNER_TAG, escape_key(owner));
    }
    let _ = write!(line, " {} {}", fields.join(","), nanos);
    Some(line)
}

/// Encode a batch, one line per writable record
pub fn encode_batch(records: &[MetricRecord]) -> String {
    records
        .iter()
        .filter_map(encode_record)
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActivityIdentity, MetricKind};
    use chrono::NaiveDate;

    fn ts() -> chrono::NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 1)
            .unwrap()
    }

    #[test]
    fn test_encode_intraday_sample() {
        let record = MetricRecord::new(MetricKind::HeartRate, ts()).with_field("HeartRate", 62i64);
        assert_eq!(
            encode_record(&record).unwrap(),
            "HeartRateIntraday HeartRate=62i 1704067201000000000"
        );
    }

    #[test]
    fn test_encode_tags_and_escaping() {
        let record = MetricRecord::new(MetricKind::ActivitySummary, ts())
            .with_owner(Some("jane doe"))
            .with_activity(ActivityIdentity::new("abc"))
            .with_field("activityName", "Run \"fast\"")
            .with_field("distance", 5000.5)
            .with_field("manual", false);
        assert_eq!(
            encode_record(&record).unwrap(),
            "ActivitySummary,ActivityID=abc,User_ID=jane\\ doe activityName=\"Run \\\"fast\\\"\",distance=5000.5,manual=false 1704067201000000000"
        );
    }

    #[test]
    fn test_backslashes_and_line_breaks_stay_on_one_line() {
        let record = MetricRecord::new(MetricKind::ActivitySummary, ts())
            .with_owner(Some("dom\\user\nx"))
            .with_field("activityName", "Lap 1\r\nLap 2 \\o/");
        let line = encode_record(&record).unwrap();
        assert_eq!(line.lines().count(), 1);
        assert_eq!(
            line,
            "ActivitySummary,User_ID=dom\\\\user\\ x activityName=\"Lap 1 Lap 2 \\\\o/\" 1704067201000000000"
        );
        assert_eq!(escape_key("trailing\\"), "trailing\\\\");
    }

    #[test]
    fn test_empty_record_is_skipped() {
        let record = MetricRecord::new(MetricKind::Sleep, ts());
        assert!(encode_record(&record).is_none());

        let record = MetricRecord::new(MetricKind::Sleep, ts()).with_field("score", f64::NAN);
        assert!(encode_record(&record).is_none());
    }

    #[test]
    fn test_encode_batch_joins_lines() {
        let records = vec![
            MetricRecord::new(MetricKind::Steps, ts()).with_field("StepsCount", 10i64),
            MetricRecord::new(MetricKind::Steps, ts()),
            MetricRecord::new(MetricKind::Steps, ts()).with_field("StepsCount", 20i64),
        ];
        assert_eq!(encode_batch(&records).lines().count(), 2);
    }
}
