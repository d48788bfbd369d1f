//! Local imports: account exports and FIT files

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Local;

use super::{single_owner, stop_on_ctrl_c, Overrides};
use crate::config::PacingConfig;
use crate::error::Result;
use crate::models::{FetchWindow, MetricKind};
use crate::source::{ExportSource, RawPayload, RemoteSource};
use crate::storage::{default_dedup_index_path, Storage};
use crate::sync::{DedupIndex, EngineOptions, ImportOptions, IngestionEngine, RunReport};

/// Import an unpacked account export.
///
/// Wellness files go through the window pass with no pacing; uploaded
/// activity archives are then imported as FIT files within the same date
/// range. When the export has archives their decoded summaries replace the
/// export's activity list, enriched with the export entry that starts within
/// five minutes of each file.
pub async fn export(dir: PathBuf, overrides: &Overrides) -> Result<RunReport> {
    let mut config = overrides.load()?;
    config.validate()?;
    config.pacing = PacingConfig::none();
    let owner = single_owner(&config)?;

    let today = Local::now().date_naive();
    let (start, end) = config.date_range(today)?;

    let source = ExportSource::open(&dir)?;
    let archives = source.uploaded_archives().to_vec();
    let summaries = if archives.is_empty() {
        Vec::new()
    } else {
        // Export days are local, file start times UTC
        let from = start.pred_opt().unwrap_or(start);
        let to = end.succ_opt().unwrap_or(end);
        source.activity_summaries(from, to)?
    };
    println!("Importing {} ({} activity archives)", source.describe(), archives.len());

    let mut options = EngineOptions::from_config(&config);
    options.identities = vec![owner.clone()];
    options.kinds.retain(|kind| ExportSource::KINDS.contains(kind));
    if !archives.is_empty() {
        options.kinds.retain(|kind| *kind != MetricKind::ActivitySummary);
    }

    let engine = IngestionEngine::new(Arc::new(source), Storage::open(&config)?, options);
    stop_on_ctrl_c(engine.shutdown_handle());

    let mut report = engine.run(start, end, today).await;
    if report.is_aborted() || archives.is_empty() {
        return Ok(report);
    }

    let dedup_path = config.dedup_index.clone().unwrap_or_else(default_dedup_index_path);
    let mut dedup = DedupIndex::load(dedup_path, owner.as_deref())?;
    let import = ImportOptions {
        range: Some((start, end)),
        summaries,
    };
    let files = engine
        .import_files_with(&archives, owner.as_deref(), &mut dedup, import)
        .await;
    report.merge(files);
    Ok(report)
}

/// Import FIT files and zip archives, skipping activities the sink already has
pub async fn fit(paths: Vec<PathBuf>, overrides: &Overrides) -> Result<RunReport> {
    let config = overrides.load()?;
    config.validate_settings()?;
    let owner = single_owner(&config)?;

    let storage = Storage::open(&config)?;
    let mut dedup = DedupIndex::from_sink(storage.sink.as_ref(), owner.as_deref()).await?;
    println!("Importing {} paths into {}", paths.len(), storage.sink.describe());

    let engine = IngestionEngine::new(Arc::new(NoRemote), storage, EngineOptions::from_config(&config));
    stop_on_ctrl_c(engine.shutdown_handle());

    Ok(engine.import_files(&paths, owner.as_deref(), &mut dedup).await)
}

/// File imports never fetch
struct NoRemote;

#[async_trait]
impl RemoteSource for NoRemote {
    async fn prepare(&self, _owner: Option<&str>) -> Result<()> {
        Ok(())
    }

    async fn fetch(&self, _window: &FetchWindow, _owner: Option<&str>) -> Result<RawPayload> {
        Ok(RawPayload::empty())
    }

    fn describe(&self) -> String {
        "local files".to_string()
    }
}
