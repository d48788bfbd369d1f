//! Activity file decoding
//!
//! Raw FIT message extraction sits behind the [`FitDecoder`] trait; the
//! [`ActivityDecoder`] validates the file signature, derives the content
//! identity and turns messages into [`MetricRecord`]s.

pub mod archive;
mod fit;

pub use fit::{FitParserDecoder, FIT_TIME_FORMAT};

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, NaiveDateTime};

use crate::error::{IngestError, Result};
use crate::models::{parse_garmin_datetime, ActivityIdentity, FieldValue, MetricKind, MetricRecord};

/// Degrees per semicircle (2^31 semicircles = 180 degrees)
const SEMICIRCLE_TO_DEGREES: f64 = 180.0 / 2_147_483_648.0;

const FIT_SIGNATURE: &[u8] = b".FIT";

/// Fields of the FIT messages the ingestion cares about
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FitMessages {
    pub file_id: BTreeMap<String, FieldValue>,
    pub sessions: Vec<BTreeMap<String, FieldValue>>,
    pub records: Vec<BTreeMap<String, FieldValue>>,
}

/// Extracts messages from FIT bytes. Date-time fields are rendered as
/// [`FIT_TIME_FORMAT`] text in UTC.
pub trait FitDecoder: Send + Sync {
    fn decode_messages(&self, bytes: &[u8]) -> Result<FitMessages>;
}

/// Result of decoding one activity file
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedActivity {
    pub identity: ActivityIdentity,
    pub start_time: NaiveDateTime,
    pub sport: String,
    pub records: Vec<MetricRecord>,
}

impl DecodedActivity {
    /// Attach a remote identity instead of the content hash
    pub fn with_identity(mut self, identity: ActivityIdentity) -> Self {
        for record in &mut self.records {
            record.activity = Some(identity.clone());
        }
        self.identity = identity;
        self
    }

    pub fn with_owner(mut self, owner: Option<&str>) -> Self {
        for record in &mut self.records {
            record.owner = owner.map(|o| o.to_string());
        }
        self
    }
}

/// Validate the FIT file header.
///
/// Too short to hold a header, or shorter than the header claims, is a
/// truncated file. A wrong signature or header size is another format.
pub fn check_header(bytes: &[u8]) -> Result<()> {
    if bytes.len() < 12 {
        return Err(IngestError::decode(format!("truncated file: {} bytes", bytes.len())));
    }
    if &bytes[8..12] != FIT_SIGNATURE {
        return Err(IngestError::unsupported("missing .FIT signature"));
    }
    let header_size = usize::from(bytes[0]);
    if header_size != 12 && header_size != 14 {
        return Err(IngestError::unsupported(format!("unexpected FIT header size {}", header_size)));
    }
    let data_size = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
    let expected = header_size + data_size + 2;
    if bytes.len() < expected {
        return Err(IngestError::decode(format!(
            "truncated file: {} of {} bytes",
            bytes.len(),
            expected
        )));
    }
    Ok(())
}

fn time_field(fields: &BTreeMap<String, FieldValue>, name: &str) -> Option<NaiveDateTime> {
    fields.get(name).and_then(|v| v.as_str()).and_then(parse_garmin_datetime)
}

fn first_of(fields: &BTreeMap<String, FieldValue>, names: &[&str]) -> Option<FieldValue> {
    names.iter().find_map(|n| fields.get(*n).cloned())
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Converts activity files into records
#[derive(Clone)]
pub struct ActivityDecoder {
    inner: Arc<dyn FitDecoder>,
}

impl Default for ActivityDecoder {
    fn default() -> Self {
        Self::new(Arc::new(FitParserDecoder))
    }
}

impl ActivityDecoder {
    pub fn new(inner: Arc<dyn FitDecoder>) -> Self {
        Self { inner }
    }

    /// Decode one FIT file.
    ///
    /// Emits an activity summary at the session start, an end marker at
    /// start + elapsed time, and one GPS/sensor record per timestamped sample.
    pub fn decode(&self, bytes: &[u8]) -> Result<DecodedActivity> {
        check_header(bytes)?;
        let messages = self.inner.decode_messages(bytes)?;

        if messages.file_id.is_empty() {
            return Err(IngestError::decode("no file_id message"));
        }
        let identity = ActivityIdentity::from_file_id(&messages.file_id);

        let session = messages
            .sessions
            .first()
            .ok_or_else(|| IngestError::decode("no session message"))?;
        let start_time = time_field(session, "start_time")
            .ok_or_else(|| IngestError::decode("session has no start_time"))?;
        let sport = session
            .get("sport")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();

        let mut records = vec![self.summary(&messages, session, &identity, start_time, &sport)];
        if let Some(end) = self.end_marker(&messages, session, &identity, start_time) {
            records.push(end);
        }
        records.extend(self.samples(&messages, &identity));

        Ok(DecodedActivity {
            identity,
            start_time,
            sport,
            records,
        })
    }

    fn summary(
        &self,
        messages: &FitMessages,
        session: &BTreeMap<String, FieldValue>,
        identity: &ActivityIdentity,
        start_time: NaiveDateTime,
        sport: &str,
    ) -> MetricRecord {
        let mut record = MetricRecord::new(MetricKind::ActivitySummary, start_time)
            .with_activity(identity.clone())
            .with_field("activityType", sport)
            .with_field("activityName", format!("{} {}", capitalize(sport), start_time.date()))
            .with_field(
                "ActivitySelector",
                format!("{}UTC-{}", start_time.format("%Y%m%dT%H%M%S"), sport),
            );
        record.set_opt("Device_ID", messages.file_id.get("serial_number").cloned());
        record.set_opt("Device", first_of(&messages.file_id, &["garmin_product", "product", "manufacturer"]));
        record.set_opt("distance", session.get("total_distance").cloned());
        record.set_opt("elapsedDuration", session.get("total_elapsed_time").cloned());
        record.set_opt("movingDuration", session.get("total_timer_time").cloned());
        record.set_opt("averageSpeed", first_of(session, &["enhanced_avg_speed", "avg_speed"]));
        record.set_opt("maxSpeed", first_of(session, &["enhanced_max_speed", "max_speed"]));
        record.set_opt("calories", session.get("total_calories").cloned());
        record.set_opt("averageHR", session.get("avg_heart_rate").cloned());
        record.set_opt("maxHR", session.get("max_heart_rate").cloned());
        record.set_opt("lapCount", session.get("num_laps").cloned());
        record
    }

    fn end_marker(
        &self,
        messages: &FitMessages,
        session: &BTreeMap<String, FieldValue>,
        identity: &ActivityIdentity,
        start_time: NaiveDateTime,
    ) -> Option<MetricRecord> {
        let elapsed = session.get("total_elapsed_time").and_then(|v| v.as_f64())?;
        if elapsed <= 0.0 {
            return None;
        }
        let end_time = start_time + Duration::seconds(elapsed as i64);
        let mut record = MetricRecord::new(MetricKind::ActivitySummary, end_time)
            .with_activity(identity.clone())
            .with_field("activityName", "END")
            .with_field("activityType", "No Activity");
        record.set_opt("Device_ID", messages.file_id.get("serial_number").cloned());
        Some(record)
    }

    fn samples(&self, messages: &FitMessages, identity: &ActivityIdentity) -> Vec<MetricRecord> {
        let mut samples = Vec::with_capacity(messages.records.len());
        for fields in &messages.records {
            let Some(timestamp) = time_field(fields, "timestamp") else {
                continue;
            };
            let mut record = MetricRecord::new(MetricKind::ActivityGps, timestamp).with_activity(identity.clone());

            let degrees = |name: &str| {
                fields
                    .get(name)
                    .and_then(|v| v.as_f64())
                    .map(|semicircles| FieldValue::Float(semicircles * SEMICIRCLE_TO_DEGREES))
            };
            record.set_opt("Latitude", degrees("position_lat"));
            record.set_opt("Longitude", degrees("position_long"));
            record.set_opt("Altitude", first_of(fields, &["enhanced_altitude", "altitude"]));
            record.set_opt("Distance", fields.get("distance").cloned());
            record.set_opt("Speed", first_of(fields, &["enhanced_speed", "speed"]));
            record.set_opt("HeartRate", fields.get("heart_rate").cloned());
            record.set_opt("Cadence", fields.get("cadence").cloned());
            record.set_opt("Power", fields.get("power").cloned());
            record.set_opt("Temperature", fields.get("temperature").cloned());

            if !record.is_empty() {
                samples.push(record);
            }
        }
        samples
    }
}
