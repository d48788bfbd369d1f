//! Data models shared by sources, the engine and sinks

pub mod activity;
pub mod record;
pub mod window;

pub use activity::{parse_garmin_datetime, ActivitySummary, ActivityType};
pub use record::{
    retain_unseen, ActivityIdentity, FieldValue, MetricKind, MetricRecord, RecordKey, Resolution,
};
pub use window::FetchWindow;
