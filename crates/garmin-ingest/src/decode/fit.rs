//! FIT message extraction backed by the `fitparser` crate

use std::collections::BTreeMap;

use chrono::Utc;
use fitparser::profile::MesgNum;
use fitparser::Value;

use super::{FitDecoder, FitMessages};
use crate::error::{IngestError, Result};
use crate::models::FieldValue;

/// Timestamp text format used for FIT date-time fields
pub const FIT_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Decodes FIT bytes with `fitparser`
#[derive(Debug, Clone, Copy, Default)]
pub struct FitParserDecoder;

/// Scalar view of a FIT value; arrays have none
fn to_field_value(value: &Value) -> Option<FieldValue> {
    let v = match value {
        Value::Timestamp(ts) => FieldValue::Text(
            ts.with_timezone(&Utc)
                .naive_utc()
                .format(FIT_TIME_FORMAT)
                .to_string(),
        ),
        Value::Byte(v) | Value::Enum(v) | Value::UInt8(v) | Value::UInt8z(v) => FieldValue::Int(i64::from(*v)),
        Value::SInt8(v) => FieldValue::Int(i64::from(*v)),
        Value::SInt16(v) => FieldValue::Int(i64::from(*v)),
        Value::UInt16(v) | Value::UInt16z(v) => FieldValue::Int(i64::from(*v)),
        Value::SInt32(v) => FieldValue::Int(i64::from(*v)),
        Value::UInt32(v) | Value::UInt32z(v) => FieldValue::Int(i64::from(*v)),
        Value::SInt64(v) => FieldValue::Int(*v),
        Value::UInt64(v) | Value::UInt64z(v) => FieldValue::Int(i64::try_from(*v).ok()?),
        Value::Float32(v) => FieldValue::Float(f64::from(*v)),
        Value::Float64(v) => FieldValue::Float(*v),
        Value::String(s) => FieldValue::Text(s.clone()),
        _ => return None,
    };
    Some(v)
}

fn collect_fields(record: &fitparser::FitDataRecord) -> BTreeMap<String, FieldValue> {
    record
        .fields()
        .iter()
        .filter_map(|field| to_field_value(field.value()).map(|v| (field.name().to_string(), v)))
        .collect()
}

impl FitDecoder for FitParserDecoder {
    fn decode_messages(&self, bytes: &[u8]) -> Result<FitMessages> {
        let records = fitparser::from_bytes(bytes).map_err(|e| IngestError::decode(e.to_string()))?;

        let mut messages = FitMessages::default();
        for record in &records {
            match record.kind() {
                MesgNum::FileId if messages.file_id.is_empty() => {
                    messages.file_id = collect_fields(record);
                }
                MesgNum::Session => messages.sessions.push(collect_fields(record)),
                MesgNum::Record => messages.records.push(collect_fields(record)),
                _ => {}
            }
        }
        Ok(messages)
    }
}
