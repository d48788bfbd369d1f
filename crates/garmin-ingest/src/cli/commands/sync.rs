//! Sync from the Garmin Connect API

use std::sync::Arc;

use chrono::Local;

use super::{stop_on_ctrl_c, Overrides};
use crate::client::GarminClient;
use crate::config::FileTokenStore;
use crate::error::Result;
use crate::source::GarminSource;
use crate::storage::Storage;
use crate::sync::{EngineOptions, IngestionEngine, RunReport, SharedRateLimiter};

const GARMIN_DOMAIN: &str = "garmin.com";

/// Run one incremental sync over the configured range
pub async fn run(overrides: &Overrides) -> Result<RunReport> {
    let config = overrides.load()?;
    config.validate()?;

    let today = Local::now().date_naive();
    let (start, end) = config.date_range(today)?;

    let storage = Storage::open(&config)?;
    println!("Syncing {} to {} into {}", start, end, storage.sink.describe());

    let limiter = SharedRateLimiter::new(&config.pacing);
    let tokens = Arc::new(FileTokenStore::new(config.profile.clone())?);
    let source = GarminSource::new(GarminClient::new(GARMIN_DOMAIN)?, tokens, limiter.clone());

    let engine = IngestionEngine::new(Arc::new(source), storage, EngineOptions::from_config(&config))
        .with_limiter(limiter);
    stop_on_ctrl_c(engine.shutdown_handle());

    Ok(engine.run(start, end, today).await)
}
