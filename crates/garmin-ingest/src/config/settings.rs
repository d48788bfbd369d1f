//! Run configuration
//!
//! Read once at the start of a run from a TOML file and command line
//! overrides, validated, and then treated as immutable.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{IngestError, Result};
use crate::models::MetricKind;

/// Default configuration file name inside the config directory
pub const CONFIG_FILE_NAME: &str = "ingest.toml";

/// Upper bound for every day-count setting (about ten years)
const MAX_DAY_COUNT: u32 = 3650;

/// How the starting watermark is derived
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatermarkPolicy {
    /// Continue after the last committed point
    #[default]
    Resume,
    /// Operator override: forget stored progress and start at `start_date`
    Reimport,
}

/// What the planner does with intraday data past the retention boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColdArchiveMode {
    /// Fetch through the slower archived path
    #[default]
    Archived,
    /// Do not fetch at all
    Skip,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColdArchiveConfig {
    /// Intraday data older than this many days is cold
    pub threshold_days: u32,
    pub mode: ColdArchiveMode,
}

impl Default for ColdArchiveConfig {
    fn default() -> Self {
        Self {
            threshold_days: 180,
            mode: ColdArchiveMode::Archived,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    /// Minimum delay between consecutive remote calls
    pub min_delay_ms: u64,
    /// Delay used instead for archived-path calls
    pub archived_delay_ms: u64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 2000,
            archived_delay_ms: 10_000,
        }
    }
}

impl PacingConfig {
    /// No delays at all, for local sources
    pub fn none() -> Self {
        Self {
            min_delay_ms: 0,
            archived_delay_ms: 0,
        }
    }

    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn archived_delay(&self) -> Duration {
        Duration::from_millis(self.archived_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts for one remote call or one batch write
    pub max_attempts: u32,
    /// First backoff delay; doubles on every further attempt
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2000,
        }
    }
}

impl RetryConfig {
    /// Backoff before attempt number `attempt` (1-based; the first attempt has none)
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 1u64 << (attempt - 2).min(16);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }
}

/// Storage protocol generation of the time-series backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolGeneration {
    /// `/write` + InfluxQL `/query`, user/password authentication
    V1,
    /// `/api/v3/write_lp` + SQL `/api/v3/query_sql`, bearer token
    V3,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    Influx {
        generation: ProtocolGeneration,
        url: String,
        database: String,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password: Option<String>,
        #[serde(default)]
        token: Option<String>,
    },
    Parquet {
        path: PathBuf,
    },
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Parquet {
            path: crate::storage::default_storage_path(),
        }
    }
}

/// Complete configuration of one ingestion run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub start_date: Option<NaiveDate>,
    /// Defaults to today
    pub end_date: Option<NaiveDate>,
    /// Skip failing windows and files instead of aborting
    pub lenient: bool,
    pub watermark_policy: WatermarkPolicy,
    pub multi_user: bool,
    /// Identities to run one pass each for (multi-user mode only)
    pub users: Vec<String>,
    /// Token profile for single-user mode
    pub profile: Option<String>,
    /// Sync state database, defaults to `<storage>/sync.db`
    pub state_db: Option<PathBuf>,
    /// Local dedup index used by bulk imports
    pub dedup_index: Option<PathBuf>,
    pub backend: BackendConfig,
    /// Per-kind enable flags; kinds not listed are enabled
    pub kinds: BTreeMap<MetricKind, bool>,
    pub pacing: PacingConfig,
    pub retry: RetryConfig,
    pub cold_archive: ColdArchiveConfig,
    /// Days before today that are re-fetched even when already synced
    pub trailing_refetch_days: u32,
    /// Per-kind overrides of the largest span one call may cover
    pub max_span_days: BTreeMap<MetricKind, u32>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            start_date: None,
            end_date: None,
            lenient: false,
            watermark_policy: WatermarkPolicy::Resume,
            multi_user: false,
            users: Vec::new(),
            profile: None,
            state_db: None,
            dedup_index: None,
            backend: BackendConfig::default(),
            kinds: BTreeMap::new(),
            pacing: PacingConfig::default(),
            retry: RetryConfig::default(),
            cold_archive: ColdArchiveConfig::default(),
            trailing_refetch_days: 2,
            max_span_days: BTreeMap::new(),
        }
    }
}

impl IngestConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// Load from `path`, or from the default location if it exists, or defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        let default_path = super::config_dir()?.join(CONFIG_FILE_NAME);
        if default_path.exists() {
            log::debug!("Loading configuration from {}", default_path.display());
            Self::load(&default_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| IngestError::config(format!("Invalid configuration: {}", e)))
    }

    /// Reject invalid ranges and conflicting flags
    pub fn validate(&self) -> Result<()> {
        let start = self
            .start_date
            .ok_or_else(|| IngestError::config("start_date is required"))?;
        if let Some(end) = self.end_date {
            if end < start {
                return Err(IngestError::config(format!(
                    "end_date {} is before start_date {}",
                    end, start
                )));
            }
        }
        self.validate_settings()
    }

    /// Everything [`validate`](Self::validate) checks except the sync range.
    /// File imports carry no dates.
    pub fn validate_settings(&self) -> Result<()> {
        if self.multi_user && self.users.is_empty() {
            return Err(IngestError::config("multi_user is enabled but no users are listed"));
        }
        if !self.multi_user && !self.users.is_empty() {
            return Err(IngestError::config("users are listed but multi_user is disabled"));
        }
        if self.multi_user && self.profile.is_some() {
            return Err(IngestError::config("profile cannot be combined with multi_user"));
        }
        let mut seen = std::collections::HashSet::new();
        if let Some(dup) = self.users.iter().find(|u| !seen.insert(u.as_str())) {
            return Err(IngestError::config(format!("user {} is listed twice", dup)));
        }
        if self.enabled_kinds().is_empty() {
            return Err(IngestError::config("every metric kind is disabled"));
        }
        if self.pacing.archived_delay_ms < self.pacing.min_delay_ms {
            return Err(IngestError::config(
                "pacing.archived_delay_ms must not be shorter than pacing.min_delay_ms",
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(IngestError::config("retry.max_attempts must be at least 1"));
        }
        if let Some((kind, _)) = self.max_span_days.iter().find(|(_, days)| **days == 0) {
            return Err(IngestError::config(format!("max_span_days.{} must be at least 1", kind)));
        }
        if let Some((kind, days)) = self.max_span_days.iter().find(|(_, days)| **days > MAX_DAY_COUNT) {
            return Err(IngestError::config(format!(
                "max_span_days.{} = {} exceeds {} days",
                kind, days, MAX_DAY_COUNT
            )));
        }
        if self.cold_archive.threshold_days > MAX_DAY_COUNT {
            return Err(IngestError::config(format!(
                "cold_archive.threshold_days must not exceed {}",
                MAX_DAY_COUNT
            )));
        }
        if self.trailing_refetch_days > MAX_DAY_COUNT {
            return Err(IngestError::config(format!(
                "trailing_refetch_days must not exceed {}",
                MAX_DAY_COUNT
            )));
        }
        if let BackendConfig::Influx {
            generation,
            username,
            password,
            token,
            ..
        } = &self.backend
        {
            match generation {
                ProtocolGeneration::V1 if token.is_some() => {
                    return Err(IngestError::config("token authentication requires generation = \"v3\""));
                }
                ProtocolGeneration::V1 if username.is_some() != password.is_some() => {
                    return Err(IngestError::config("username and password must be set together"));
                }
                ProtocolGeneration::V3 if username.is_some() || password.is_some() => {
                    return Err(IngestError::config("generation v3 authenticates with a token only"));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Requested range, with the end defaulting to `today`
    pub fn date_range(&self, today: NaiveDate) -> Result<(NaiveDate, NaiveDate)> {
        let start = self
            .start_date
            .ok_or_else(|| IngestError::config("start_date is required"))?;
        Ok((start, self.end_date.unwrap_or(today)))
    }

    pub fn is_enabled(&self, kind: MetricKind) -> bool {
        self.kinds.get(&kind).copied().unwrap_or(true)
    }

    /// Enabled kinds in processing order
    pub fn enabled_kinds(&self) -> Vec<MetricKind> {
        MetricKind::ALL
            .iter()
            .copied()
            .filter(|k| self.is_enabled(*k))
            .collect()
    }

    /// One entry per identity pass; `None` when multi-user tagging is off
    pub fn identities(&self) -> Vec<Option<String>> {
        if self.multi_user {
            self.users.iter().cloned().map(Some).collect()
        } else {
            vec![None]
        }
    }

    pub fn state_db_path(&self) -> PathBuf {
        self.state_db
            .clone()
            .unwrap_or_else(crate::storage::default_sync_db_path)
    }
}

/// Parse a YYYY-MM-DD command line argument
pub fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| IngestError::InvalidDateFormat(s.to_string()))
}
