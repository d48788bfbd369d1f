//! Per-kind normalization of remote JSON documents into records
//!
//! Each document is one response of the kind's endpoint (one day for the
//! wellness endpoints, one page for the activity list). Documents that mean
//! "nothing recorded" normalize to no records; shapes we do not recognize are
//! [`IngestError::UnsupportedFormat`].

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime};
use serde_json::Value;

use crate::error::{IngestError, Result};
use crate::models::{
    parse_garmin_datetime, ActivityIdentity, ActivitySummary, FieldValue, MetricKind, MetricRecord,
};

const DAILY_STATS_FIELDS: &[&str] = &[
    "activeKilocalories",
    "bmrKilocalories",
    "totalKilocalories",
    "totalSteps",
    "totalDistanceMeters",
    "highlyActiveSeconds",
    "activeSeconds",
    "sedentarySeconds",
    "sleepingSeconds",
    "moderateIntensityMinutes",
    "vigorousIntensityMinutes",
    "floorsAscended",
    "floorsDescended",
    "minHeartRate",
    "maxHeartRate",
    "restingHeartRate",
    "minAvgHeartRate",
    "maxAvgHeartRate",
    "averageStressLevel",
    "maxStressLevel",
    "stressDuration",
    "restStressDuration",
    "lowStressDuration",
    "mediumStressDuration",
    "highStressDuration",
    "bodyBatteryChargedValue",
    "bodyBatteryDrainedValue",
    "bodyBatteryHighestValue",
    "bodyBatteryLowestValue",
    "averageSpo2",
    "lowestSpo2",
    "latestSpo2",
    "avgWakingRespirationValue",
];

const SLEEP_FIELDS: &[&str] = &[
    "sleepTimeSeconds",
    "deepSleepSeconds",
    "lightSleepSeconds",
    "remSleepSeconds",
    "awakeSleepSeconds",
    "unmeasurableSeconds",
    "averageSpO2Value",
    "lowestSpO2Value",
    "highestSpO2Value",
    "averageRespirationValue",
    "lowestRespirationValue",
    "highestRespirationValue",
    "awakeCount",
    "avgSleepStress",
];

const SLEEP_TOP_LEVEL_FIELDS: &[&str] = &[
    "restlessMomentsCount",
    "avgOvernightHrv",
    "bodyBatteryChange",
    "restingHeartRate",
];

const HYDRATION_FIELDS: &[(&str, &str)] = &[
    ("valueInML", "ValueInML"),
    ("goalInML", "GoalInML"),
    ("sweatLossInML", "SweatLossInML"),
    ("activityIntakeInML", "ActivityIntakeInML"),
];

/// Normalize every document of one fetch
pub fn normalize_documents(kind: MetricKind, documents: &[Value]) -> Result<Vec<MetricRecord>> {
    let mut records = Vec::new();
    for doc in documents {
        records.extend(normalize(kind, doc)?);
    }
    Ok(records)
}

/// Normalize one endpoint response for `kind`
pub fn normalize(kind: MetricKind, doc: &Value) -> Result<Vec<MetricRecord>> {
    if doc.is_null() {
        return Ok(Vec::new());
    }
    match kind {
        MetricKind::DailyStats => daily_stats(doc),
        MetricKind::Sleep => sleep(doc),
        MetricKind::HeartRate => pairs(doc, kind, "heartRateValues", 1, "HeartRate", |_| true),
        MetricKind::Stress => pairs(doc, kind, "stressValuesArray", 1, "stressLevel", |v| v >= 0.0),
        MetricKind::BodyBattery => pairs(doc, kind, "bodyBatteryValuesArray", 2, "BodyBatteryLevel", |v| v >= 0.0),
        MetricKind::Steps => steps(doc),
        MetricKind::Hrv => hrv(doc),
        MetricKind::Hydration => hydration(doc),
        MetricKind::ActivitySummary => activities(doc),
        MetricKind::ActivityGps => Err(IngestError::unsupported(
            "activity tracks arrive as files, not JSON",
        )),
    }
}

fn object<'a>(doc: &'a Value, what: &str) -> Result<&'a serde_json::Map<String, Value>> {
    doc.as_object()
        .ok_or_else(|| IngestError::unsupported(format!("{} payload is not an object", what)))
}

fn millis_to_naive(ms: i64) -> Option<NaiveDateTime> {
    DateTime::from_timestamp_millis(ms).map(|dt| dt.naive_utc())
}

fn calendar_midnight(value: Option<&Value>) -> Option<NaiveDateTime> {
    let date = NaiveDate::parse_from_str(value?.as_str()?.trim(), "%Y-%m-%d").ok()?;
    Some(date.and_time(NaiveTime::MIN))
}

fn copy_fields(record: &mut MetricRecord, source: &serde_json::Map<String, Value>, names: &[&str]) {
    for name in names {
        record.set_opt(name, source.get(*name).and_then(FieldValue::from_json));
    }
}

fn daily_stats(doc: &Value) -> Result<Vec<MetricRecord>> {
    let stats = object(doc, "daily stats")?;
    if stats.get("includesWellnessData").and_then(|v| v.as_bool()) == Some(false) {
        return Ok(Vec::new());
    }
    let has_wellness = stats
        .get("wellnessStartTimeGmt")
        .or_else(|| stats.get("wellnessStartTimeLocal"))
        .is_some_and(|v| !v.is_null());
    if !has_wellness && !stats.contains_key("calendarDate") {
        return Ok(Vec::new());
    }

    let timestamp = stats
        .get("wellnessStartTimeLocal")
        .and_then(|v| v.as_str())
        .and_then(parse_garmin_datetime)
        .or_else(|| calendar_midnight(stats.get("calendarDate")))
        .ok_or_else(|| IngestError::unsupported("daily stats without a date"))?;

    let mut record = MetricRecord::new(MetricKind::DailyStats, timestamp);
    copy_fields(&mut record, stats, DAILY_STATS_FIELDS);
    Ok(if record.is_empty() { Vec::new() } else { vec![record] })
}

fn sleep(doc: &Value) -> Result<Vec<MetricRecord>> {
    let top = object(doc, "sleep")?;
    let dto = match top.get("dailySleepDTO") {
        Some(Value::Object(dto)) => dto,
        Some(Value::Null) => return Ok(Vec::new()),
        None if top.is_empty() => return Ok(Vec::new()),
        _ => return Err(IngestError::unsupported("sleep payload has no dailySleepDTO")),
    };

    let end = dto
        .get("sleepEndTimestampLocal")
        .and_then(|v| v.as_i64())
        .or_else(|| dto.get("sleepEndTimestampGMT").and_then(|v| v.as_i64()))
        .and_then(millis_to_naive);
    let Some(timestamp) = end else {
        return Ok(Vec::new());
    };

    let mut record = MetricRecord::new(MetricKind::Sleep, timestamp);
    copy_fields(&mut record, dto, SLEEP_FIELDS);
    copy_fields(&mut record, top, SLEEP_TOP_LEVEL_FIELDS);
    record.set_opt(
        "sleepScore",
        dto.get("sleepScores")
            .and_then(|s| s.pointer("/overall/value"))
            .and_then(FieldValue::from_json),
    );
    Ok(vec![record])
}

/// `[[epoch_ms, value, ...], ...]` series; `index` selects the value column
fn pairs(
    doc: &Value,
    kind: MetricKind,
    key: &str,
    index: usize,
    field: &str,
    keep: impl Fn(f64) -> bool,
) -> Result<Vec<MetricRecord>> {
    let top = object(doc, kind.as_str())?;
    let series = match top.get(key) {
        Some(Value::Array(series)) => series,
        Some(Value::Null) | None => return Ok(Vec::new()),
        Some(_) => return Err(IngestError::unsupported(format!("{} is not an array", key))),
    };

    let mut records = Vec::with_capacity(series.len());
    for sample in series {
        let row = sample
            .as_array()
            .ok_or_else(|| IngestError::unsupported(format!("{} sample is not an array", key)))?;
        let Some(timestamp) = row.first().and_then(|v| v.as_i64()).and_then(millis_to_naive) else {
            continue;
        };
        let Some(value) = row.get(index).and_then(FieldValue::from_json) else {
            continue;
        };
        if value.as_f64().is_some_and(|v| !keep(v)) {
            continue;
        }
        records.push(MetricRecord::new(kind, timestamp).with_field(field, value));
    }
    Ok(records)
}

fn steps(doc: &Value) -> Result<Vec<MetricRecord>> {
    let intervals = doc
        .as_array()
        .ok_or_else(|| IngestError::unsupported("steps payload is not an array"))?;

    let mut records = Vec::with_capacity(intervals.len());
    for interval in intervals {
        let interval = object(interval, "steps interval")?;
        let Some(timestamp) = interval
            .get("startGMT")
            .and_then(|v| v.as_str())
            .and_then(parse_garmin_datetime)
        else {
            continue;
        };
        let mut record = MetricRecord::new(MetricKind::Steps, timestamp);
        record.set_opt("StepsCount", interval.get("steps").and_then(FieldValue::from_json));
        record.set_opt(
            "activityLevel",
            interval.get("primaryActivityLevel").and_then(FieldValue::from_json),
        );
        if !record.is_empty() {
            records.push(record);
        }
    }
    Ok(records)
}

fn hrv(doc: &Value) -> Result<Vec<MetricRecord>> {
    let top = object(doc, "hrv")?;
    let readings = match top.get("hrvReadings") {
        Some(Value::Array(readings)) => readings,
        Some(Value::Null) | None => return Ok(Vec::new()),
        Some(_) => return Err(IngestError::unsupported("hrvReadings is not an array")),
    };

    let mut records = Vec::with_capacity(readings.len());
    for reading in readings {
        let reading = object(reading, "hrv reading")?;
        let timestamp = reading
            .get("readingTimeLocal")
            .or_else(|| reading.get("readingTimeGMT"))
            .and_then(|v| v.as_str())
            .and_then(parse_garmin_datetime);
        let value = reading.get("hrvValue").and_then(FieldValue::from_json);
        if let (Some(timestamp), Some(value)) = (timestamp, value) {
            records.push(MetricRecord::new(MetricKind::Hrv, timestamp).with_field("hrvValue", value));
        }
    }
    Ok(records)
}

fn hydration(doc: &Value) -> Result<Vec<MetricRecord>> {
    let top = object(doc, "hydration")?;
    if matches!(top.get("valueInML"), None | Some(Value::Null)) {
        return Ok(Vec::new());
    }
    let timestamp = calendar_midnight(top.get("calendarDate"))
        .ok_or_else(|| IngestError::unsupported("hydration entry without calendarDate"))?;

    let mut record = MetricRecord::new(MetricKind::Hydration, timestamp);
    for (source, target) in HYDRATION_FIELDS {
        record.set_opt(target, top.get(*source).and_then(FieldValue::from_json));
    }
    Ok(vec![record])
}

/// The summary record of one activity list entry, keyed by its remote id
pub(crate) fn activity_summary(activity: &ActivitySummary, start: NaiveDateTime) -> MetricRecord {
    let type_key = activity.type_key().to_string();
    let mut summary = MetricRecord::new(MetricKind::ActivitySummary, start)
        .with_activity(ActivityIdentity::from_remote_id(activity.activity_id))
        .with_field("Activity_ID", activity.activity_id)
        .with_field("activityType", type_key.as_str())
        .with_field(
            "activityName",
            activity.activity_name.clone().unwrap_or_else(|| type_key.clone()),
        );
    let numbers = [
        ("distance", activity.distance),
        ("elapsedDuration", activity.elapsed_duration.or(activity.duration)),
        ("movingDuration", activity.moving_duration),
        ("averageSpeed", activity.average_speed),
        ("maxSpeed", activity.max_speed),
        ("calories", activity.calories),
        ("averageHR", activity.average_hr),
        ("maxHR", activity.max_hr),
        ("elevationGain", activity.elevation_gain),
    ];
    for (name, value) in numbers {
        summary.set_opt(name, value.map(FieldValue::Float));
    }
    summary.set_opt("lapCount", activity.lap_count.map(FieldValue::Int));
    summary
}

fn activities(doc: &Value) -> Result<Vec<MetricRecord>> {
    let list: Vec<ActivitySummary> = serde_json::from_value(doc.clone())
        .map_err(|e| IngestError::unsupported(format!("activity list: {}", e)))?;

    let mut records = Vec::with_capacity(list.len() * 2);
    for activity in &list {
        let Some(start) = activity.start_local() else {
            log::debug!("Activity {} has no start time", activity.activity_id);
            continue;
        };
        let identity = ActivityIdentity::from_remote_id(activity.activity_id);
        records.push(activity_summary(activity, start));

        let elapsed = activity.elapsed_duration.or(activity.duration).unwrap_or(0.0);
        if elapsed > 0.0 {
            records.push(
                MetricRecord::new(MetricKind::ActivitySummary, start + Duration::seconds(elapsed as i64))
                    .with_activity(identity)
                    .with_field("Activity_ID", activity.activity_id)
                    .with_field("activityName", "END")
                    .with_field("activityType", "No Activity"),
            );
        }
    }
    Ok(records)
}
