//! Activity list entries as returned by the activity search endpoint
//!
//! Account exports use slightly different key names; [`ActivitySummary::from_export`]
//! reshapes those into the same structure.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Activity summary returned from the activity list endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivitySummary {
    /// Unique activity identifier
    pub activity_id: i64,

    /// User-provided or auto-generated activity name
    #[serde(default)]
    pub activity_name: Option<String>,

    /// Start time in local timezone ("YYYY-MM-DD HH:MM:SS")
    #[serde(default)]
    pub start_time_local: Option<String>,

    /// Start time in GMT
    #[serde(default, rename = "startTimeGMT")]
    pub start_time_gmt: Option<String>,

    /// Activity type information
    #[serde(default)]
    pub activity_type: Option<ActivityType>,

    /// Distance in meters
    #[serde(default)]
    pub distance: Option<f64>,

    /// Duration in seconds
    #[serde(default)]
    pub duration: Option<f64>,

    /// Elapsed duration in seconds (including pauses)
    #[serde(default)]
    pub elapsed_duration: Option<f64>,

    /// Moving duration in seconds
    #[serde(default)]
    pub moving_duration: Option<f64>,

    #[serde(default)]
    pub calories: Option<f64>,

    #[serde(default, rename = "averageHR")]
    pub average_hr: Option<f64>,

    #[serde(default, rename = "maxHR")]
    pub max_hr: Option<f64>,

    /// Average speed in m/s
    #[serde(default)]
    pub average_speed: Option<f64>,

    #[serde(default)]
    pub max_speed: Option<f64>,

    #[serde(default)]
    pub elevation_gain: Option<f64>,

    #[serde(default)]
    pub lap_count: Option<i64>,

    /// Whether the activity has GPS data
    #[serde(default)]
    pub has_polyline: Option<bool>,
}

/// Activity type information
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityType {
    /// Type key (e.g., "running", "cycling", "walking")
    pub type_key: String,
}

impl ActivitySummary {
    /// Local start time, which the sinks store as-is
    pub fn start_local(&self) -> Option<NaiveDateTime> {
        self.start_time_local
            .as_deref()
            .or(self.start_time_gmt.as_deref())
            .and_then(parse_garmin_datetime)
    }

    pub fn type_key(&self) -> &str {
        self.activity_type
            .as_ref()
            .map(|t| t.type_key.as_str())
            .unwrap_or("unknown")
    }

    /// Reshape an entry of `summarizedActivitiesExport` into the API shape.
    ///
    /// Exports carry epoch-millisecond start times and shortened key names.
    pub fn from_export(entry: &serde_json::Value) -> Option<Self> {
        let activity_id = entry.get("activityId").and_then(|v| v.as_i64())?;
        let to_text = |ms: i64| {
            chrono::DateTime::from_timestamp_millis(ms)
                .map(|dt| dt.naive_utc().format("%Y-%m-%d %H:%M:%S").to_string())
        };
        let type_key = entry
            .get("activityType")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        Some(Self {
            activity_id,
            activity_name: entry
                .get("name")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .or_else(|| type_key.clone()),
            start_time_local: entry
                .get("startTimeLocal")
                .and_then(|v| v.as_i64())
                .and_then(to_text),
            start_time_gmt: entry
                .get("startTimeGmt")
                .and_then(|v| v.as_i64())
                .and_then(to_text),
            activity_type: type_key.map(|type_key| ActivityType { type_key }),
            distance: entry.get("distance").and_then(|v| v.as_f64()),
            duration: entry.get("duration").and_then(|v| v.as_f64()),
            elapsed_duration: entry.get("elapsedDuration").and_then(|v| v.as_f64()),
            moving_duration: entry.get("movingDuration").and_then(|v| v.as_f64()),
            calories: entry.get("calories").and_then(|v| v.as_f64()),
            average_hr: entry.get("avgHr").and_then(|v| v.as_f64()),
            max_hr: entry.get("maxHr").and_then(|v| v.as_f64()),
            average_speed: entry.get("avgSpeed").and_then(|v| v.as_f64()),
            max_speed: entry.get("maxSpeed").and_then(|v| v.as_f64()),
            elevation_gain: entry.get("elevationGain").and_then(|v| v.as_f64()),
            lap_count: entry.get("lapCount").and_then(|v| v.as_i64()),
            has_polyline: None,
        })
    }
}

/// Parse the "YYYY-MM-DD HH:MM:SS[.f]" timestamps used across the API
pub fn parse_garmin_datetime(value: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f"))
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f"))
        .ok()
}
