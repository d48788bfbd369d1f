//! Storage layer: record sinks and sync state
//!
//! ## Architecture
//!
//! - **Sinks**: where normalized records end up. Either an InfluxDB server
//!   (v1 or v3 protocol) or local time-partitioned Parquet files.
//! - **SQLite**: per-identity, per-kind watermarks and the committed-window ledger
//!
//! ## Parquet Layout
//!
//! ```text
//! ~/.local/share/garmin/
//! ├── sync.db                      # SQLite sync state
//! ├── dedup_index.json             # Activity identities seen by bulk imports
//! ├── heart_rate/
//! │   ├── 2024-12.parquet          # Monthly partitions
//! │   └── ...
//! ├── activity_summary/
//! │   ├── 2024-W48.parquet         # Weekly partitions
//! │   └── ...
//! └── activity_gps/
//!     ├── 2024-12-01.parquet       # Daily partitions
//!     └── ...
//! ```
//!
//! Every write upserts by record key, so a re-run over the same days leaves
//! the stored data unchanged.

mod influx;
pub mod line_protocol;
mod parquet;
mod partitions;
mod sync_db;

pub use influx::InfluxSink;
pub use parquet::ParquetStore;
pub use partitions::PartitionScheme;
pub use sync_db::{SyncDb, WatermarkRow};

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{BackendConfig, IngestConfig};
use crate::error::Result;
use crate::models::{ActivityIdentity, MetricRecord};

/// Destination of normalized records.
///
/// Writes must be idempotent: writing a record whose key already exists
/// replaces the stored one. Failures are reported as
/// [`WriteTransient`](crate::error::IngestError::WriteTransient) (worth
/// retrying) or [`WriteRejected`](crate::error::IngestError::WriteRejected).
#[async_trait]
pub trait Sink: Send + Sync {
    /// Write one batch
    async fn write(&self, records: &[MetricRecord]) -> Result<()>;

    /// Activity identities already stored for an identity
    async fn known_activity_identities(&self, owner: Option<&str>) -> Result<HashSet<ActivityIdentity>>;

    /// Short human-readable destination, for logs
    fn describe(&self) -> String;
}

/// Get the default storage path
pub fn default_storage_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("garmin")
}

/// Get the default sync database path
pub fn default_sync_db_path() -> PathBuf {
    default_storage_path().join("sync.db")
}

/// Get the default dedup index path
pub fn default_dedup_index_path() -> PathBuf {
    default_storage_path().join("dedup_index.json")
}

/// Build the configured sink
pub fn open_sink(backend: &BackendConfig) -> Result<Arc<dyn Sink>> {
    match backend {
        BackendConfig::Influx {
            generation,
            url,
            database,
            username,
            password,
            token,
        } => {
            let sink = InfluxSink::new(*generation, url, database)?
                .with_credentials(username.clone(), password.clone())
                .with_token(token.clone());
            Ok(Arc::new(sink))
        }
        BackendConfig::Parquet { path } => {
            std::fs::create_dir_all(path)?;
            Ok(Arc::new(ParquetStore::new(path)))
        }
    }
}

/// Storage manager combining the record sink and the sync database
pub struct Storage {
    pub sink: Arc<dyn Sink>,
    pub sync_db: SyncDb,
}

impl Storage {
    /// Open the sink and sync database named by the configuration
    pub fn open(config: &IngestConfig) -> Result<Self> {
        let sink = open_sink(&config.backend)?;
        let sync_db = SyncDb::open(config.state_db_path())?;
        log::debug!("Opened {} with state at {}", sink.describe(), config.state_db_path().display());
        Ok(Self { sink, sync_db })
    }

    /// Combine an existing sink with an in-memory sync database (for testing)
    pub fn open_in_memory(sink: Arc<dyn Sink>) -> Result<Self> {
        Ok(Self {
            sink,
            sync_db: SyncDb::open_in_memory()?,
        })
    }
}
