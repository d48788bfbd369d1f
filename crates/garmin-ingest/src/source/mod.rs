//! Where raw data comes from
//!
//! A [`RemoteSource`] answers one call per (kind, window). The live
//! [`GarminSource`] talks to the Connect API; [`ExportSource`] serves the
//! same calls from an unpacked account export.

mod export;
mod garmin;

pub use export::ExportSource;
pub use garmin::GarminSource;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::models::{ActivityIdentity, FetchWindow};

/// An activity file as downloaded or found on disk
#[derive(Debug, Clone, PartialEq)]
pub struct RawFile {
    pub name: String,
    pub bytes: Vec<u8>,
    /// Identity to use instead of the content hash (remote activity id)
    pub identity: Option<ActivityIdentity>,
}

/// Unnormalized result of one fetch
#[derive(Debug, Clone, PartialEq)]
pub enum RawPayload {
    /// Endpoint responses, one per upstream call
    Documents(Vec<Value>),
    /// Activity files, zipped or bare FIT
    Files(Vec<RawFile>),
}

impl RawPayload {
    pub fn empty() -> Self {
        RawPayload::Documents(Vec::new())
    }
}

/// Per-kind fetch calls parameterized by a date window.
///
/// Errors follow the remote taxonomy: `RemoteTransient` may be retried,
/// `AuthFailure` ends the run, `NotFound` means there is no data.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Verify credentials for an identity before any window is fetched
    async fn prepare(&self, owner: Option<&str>) -> Result<()>;

    /// Fetch one window
    async fn fetch(&self, window: &FetchWindow, owner: Option<&str>) -> Result<RawPayload>;

    fn describe(&self) -> String;
}
