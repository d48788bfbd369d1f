//! Incremental sync engine
//!
//! Provides:
//! - Window planning from the requested range, stored watermarks and `now`
//! - Per-window fetch, normalize and write with retry at the point of failure
//! - A committed-window ledger so out-of-order commits never move the
//!   watermark across a gap
//! - Bulk import of FIT activity files with identity-based dedup
//!
//! Everything runs on one logical thread of control: identities one after
//! another, kinds sequentially inside an identity pass, windows oldest first.

pub mod dedup;
mod import;
pub mod planner;
pub mod rate_limiter;
pub mod report;
pub mod watermark;

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::NaiveDate;

use crate::config::{IngestConfig, RetryConfig, WatermarkPolicy};
use crate::decode::{archive, ActivityDecoder};
use crate::error::{IngestError, Result};
use crate::models::{retain_unseen, FetchWindow, MetricKind, MetricRecord};
use crate::normalize::normalize_documents;
use crate::source::{RawFile, RawPayload, RemoteSource};
use crate::storage::{Sink, Storage, SyncDb};

pub use dedup::DedupIndex;
pub use planner::{PlannerConfig, WindowPlanner};
pub use rate_limiter::{Pace, SharedRateLimiter};
pub use report::{RunReport, RunStatus, Skip};
pub use import::ImportOptions;

/// Run-wide settings of the engine
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Skip failing windows and files instead of aborting
    pub lenient: bool,
    pub watermark_policy: WatermarkPolicy,
    pub retry: RetryConfig,
    pub planner: PlannerConfig,
    /// Kinds to sync, in processing order
    pub kinds: Vec<MetricKind>,
    /// One pass per entry; `None` is the untagged single-user pass
    pub identities: Vec<Option<String>>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            lenient: false,
            watermark_policy: WatermarkPolicy::Resume,
            retry: RetryConfig::default(),
            planner: PlannerConfig::default(),
            kinds: MetricKind::ALL.to_vec(),
            identities: vec![None],
        }
    }
}

impl EngineOptions {
    pub fn from_config(config: &IngestConfig) -> Self {
        Self {
            lenient: config.lenient,
            watermark_policy: config.watermark_policy,
            retry: config.retry.clone(),
            planner: PlannerConfig::from_config(config),
            kinds: config.enabled_kinds(),
            identities: config.identities(),
        }
    }
}

/// Where one window's processing failed
enum WindowError {
    /// Fetch, decode or normalize; subject to the lenient toggle
    Window(IngestError),
    /// Always ends the run
    Fatal(IngestError),
}

impl From<IngestError> for WindowError {
    fn from(err: IngestError) -> Self {
        if err.is_fatal() {
            WindowError::Fatal(err)
        } else {
            WindowError::Window(err)
        }
    }
}

/// Orchestrates planner, source, normalizers and sink
pub struct IngestionEngine {
    source: Arc<dyn RemoteSource>,
    sink: Arc<dyn Sink>,
    sync_db: SyncDb,
    decoder: ActivityDecoder,
    limiter: SharedRateLimiter,
    planner: WindowPlanner,
    options: EngineOptions,
    shutdown: Arc<AtomicBool>,
}

impl IngestionEngine {
    pub fn new(source: Arc<dyn RemoteSource>, storage: Storage, options: EngineOptions) -> Self {
        Self {
            source,
            sink: storage.sink,
            sync_db: storage.sync_db,
            decoder: ActivityDecoder::default(),
            limiter: SharedRateLimiter::unlimited(),
            planner: WindowPlanner::new(options.planner.clone()),
            options,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_decoder(mut self, decoder: ActivityDecoder) -> Self {
        self.decoder = decoder;
        self
    }

    /// Share the source's limiter so retries feed its throttle backoff
    pub fn with_limiter(mut self, limiter: SharedRateLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    /// Setting the flag stops the run at the next window boundary
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn sync_db(&self) -> &SyncDb {
        &self.sync_db
    }

    pub fn sink(&self) -> &Arc<dyn Sink> {
        &self.sink
    }

    fn should_stop(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Sync `start..=end` for every configured identity and kind
    pub async fn run(&self, start: NaiveDate, end: NaiveDate, today: NaiveDate) -> RunReport {
        let mut report = RunReport::new();
        if end < start {
            report.abort(format!("invalid range {}..{}", start, end));
            return report;
        }

        log::info!(
            "Syncing {}..{} from {} into {}",
            start,
            end,
            self.source.describe(),
            self.sink.describe()
        );

        for owner in &self.options.identities {
            let owner = owner.as_deref();
            if self.should_stop() {
                report.abort("shutdown requested");
                break;
            }

            if let Err(e) = self.with_retry("prepare", || self.source.prepare(owner)).await {
                report.abort(format!("{}: {}", owner.unwrap_or("default identity"), e));
                break;
            }

            for kind in &self.options.kinds {
                if let Err(e) = self.sync_kind(*kind, owner, start, end, today, &mut report).await {
                    report.abort(e.to_string());
                }
                if report.is_aborted() {
                    return report;
                }
            }
        }

        log::info!("Run finished: {}", report.status());
        report
    }

    #[allow(clippy::too_many_arguments)]
    async fn sync_kind(
        &self,
        kind: MetricKind,
        owner: Option<&str>,
        start: NaiveDate,
        end: NaiveDate,
        today: NaiveDate,
        report: &mut RunReport,
    ) -> Result<()> {
        if self.options.watermark_policy == WatermarkPolicy::Reimport {
            log::info!("Reimport: resetting {} watermark", kind);
            self.sync_db.reset(owner, kind, None)?;
        }

        let watermark = self.sync_db.watermark(owner, kind)?;
        let ledger = self.sync_db.committed_windows(owner, kind)?;
        let origin = self.planner.origin(kind, start, today);
        if let Some(floor) = self.planner.cold_floor(kind, today).filter(|f| *f >= start) {
            log::info!("{}: data through {} is archived upstream and skipped", kind, floor);
        }
        let windows = self.planner.plan(kind, start, end, watermark, today);

        if windows.is_empty() {
            log::debug!("{} is up to date", kind);
            return Ok(());
        }
        log::info!(
            "{}: {} windows to fetch (watermark {})",
            kind,
            windows.len(),
            watermark.map_or_else(|| "none".to_string(), |w| w.to_string())
        );

        for window in windows {
            if self.should_stop() {
                report.abort("shutdown requested");
                return Ok(());
            }
            if !window.refetch && watermark::is_committed(window.start, window.end, &ledger) {
                log::debug!("{} already committed", window);
                continue;
            }

            match self.process_window(&window, owner).await {
                Ok(written) => {
                    let stored = self
                        .sync_db
                        .commit_window(owner, kind, window.start, window.end, origin)?;
                    report.windows_committed += 1;
                    report.records_written += written;
                    log::debug!("Committed {} ({} records), watermark {:?}", window, written, stored);
                }
                Err(WindowError::Fatal(e)) => return Err(e),
                Err(WindowError::Window(e)) if self.options.lenient => {
                    report.skip(window.to_string(), e.to_string());
                }
                Err(WindowError::Window(e)) => {
                    report.abort(format!("{}: {}", window, e));
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Fetch, normalize and write one window; returns the records written
    async fn process_window(
        &self,
        window: &FetchWindow,
        owner: Option<&str>,
    ) -> std::result::Result<usize, WindowError> {
        let label = window.to_string();
        let payload = match self.with_retry(&label, || self.source.fetch(window, owner)).await {
            Ok(payload) => payload,
            Err(IngestError::NotFound(what)) => {
                log::debug!("No data for {}: {}", window, what);
                RawPayload::empty()
            }
            Err(e) => return Err(e.into()),
        };

        let records = self.records_from(window.kind, payload)?;
        let records: Vec<MetricRecord> = records.into_iter().map(|r| r.with_owner(owner)).collect();
        // One row per key within the batch; the sink dedups across batches
        let records = retain_unseen(records, &mut HashSet::new());

        if !records.is_empty() {
            self.write_with_retry(&records)
                .await
                .map_err(WindowError::Fatal)?;
        }
        Ok(records.len())
    }

    fn records_from(&self, kind: MetricKind, payload: RawPayload) -> Result<Vec<MetricRecord>> {
        match payload {
            RawPayload::Documents(documents) => normalize_documents(kind, &documents),
            RawPayload::Files(files) => {
                let mut records = Vec::new();
                for file in files {
                    for (_, decoded) in self.decode_file(&file)? {
                        records.extend(decoded.into_iter().filter(|r| r.kind == kind));
                    }
                }
                Ok(records)
            }
        }
    }

    /// Decode a bare or zipped FIT file into (entry label, records) pairs
    fn decode_file(&self, file: &RawFile) -> Result<Vec<(String, Vec<MetricRecord>)>> {
        let entries = if archive::is_zip(&file.bytes) {
            archive::fit_entries(&file.bytes)?
                .into_iter()
                .map(|(name, bytes)| (format!("{}!{}", file.name, name), bytes))
                .collect()
        } else {
            vec![(file.name.clone(), file.bytes.clone())]
        };

        let mut decoded = Vec::with_capacity(entries.len());
        for (label, bytes) in entries {
            let mut activity = self.decoder.decode(&bytes)?;
            if let Some(identity) = &file.identity {
                activity = activity.with_identity(identity.clone());
            }
            decoded.push((label, activity.records));
        }
        Ok(decoded)
    }

    /// Run a remote call, retrying transient failures with backoff
    async fn with_retry<T, F, Fut>(&self, what: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.options.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => {
                    self.limiter.on_success();
                    return Ok(value);
                }
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    self.limiter.on_throttle();
                    attempt += 1;
                    let delay = self.options.retry.backoff(attempt);
                    log::warn!(
                        "{} failed ({}), attempt {}/{} in {:?}",
                        what,
                        e,
                        attempt,
                        max_attempts,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Write one batch; transient failures are retried, anything else returned
    async fn write_with_retry(&self, records: &[MetricRecord]) -> Result<()> {
        let max_attempts = self.options.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.sink.write(records).await {
                Ok(()) => return Ok(()),
                Err(e @ IngestError::WriteTransient(_)) if attempt < max_attempts => {
                    attempt += 1;
                    let delay = self.options.retry.backoff(attempt);
                    log::warn!("Write to {} failed ({}), attempt {}/{}", self.sink.describe(), e, attempt, max_attempts);
                    tokio::time::sleep(delay).await;
                }
                Err(e @ (IngestError::WriteTransient(_) | IngestError::WriteRejected(_))) => return Err(e),
                Err(e) => return Err(IngestError::WriteRejected(e.to_string())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ParquetStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    /// Source answering hydration windows from a per-day script
    #[derive(Default)]
    struct ScriptedSource {
        /// Remaining transient failures per day
        failures: Mutex<BTreeMap<NaiveDate, u32>>,
        calls: Mutex<Vec<NaiveDate>>,
        auth_fails: bool,
        /// Answer every day twice
        repeat_days: bool,
    }

    #[async_trait]
    impl RemoteSource for ScriptedSource {
        async fn prepare(&self, _owner: Option<&str>) -> Result<()> {
            if self.auth_fails {
                return Err(IngestError::auth("bad token"));
            }
            Ok(())
        }

        async fn fetch(&self, window: &FetchWindow, _owner: Option<&str>) -> Result<RawPayload> {
            self.calls.lock().unwrap().push(window.start);
            if let Some(left) = self.failures.lock().unwrap().get_mut(&window.start) {
                if *left > 0 {
                    *left -= 1;
                    return Err(IngestError::transient("503"));
                }
            }
            let copies = if self.repeat_days { 2 } else { 1 };
            let docs = window
                .dates()
                .flat_map(|date| {
                    let doc = json!({"calendarDate": date.to_string(), "valueInML": 500.0});
                    std::iter::repeat(doc).take(copies)
                })
                .collect();
            Ok(RawPayload::Documents(docs))
        }

        fn describe(&self) -> String {
            "scripted".to_string()
        }
    }

    fn options() -> EngineOptions {
        EngineOptions {
            kinds: vec![MetricKind::Hydration],
            retry: RetryConfig {
                max_attempts: 3,
                base_delay_ms: 0,
            },
            planner: PlannerConfig {
                trailing_refetch_days: 0,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn engine(source: Arc<ScriptedSource>, temp: &TempDir, options: EngineOptions) -> IngestionEngine {
        let sink = Arc::new(ParquetStore::new(temp.path()));
        IngestionEngine::new(source, Storage::open_in_memory(sink).unwrap(), options)
    }

    #[tokio::test]
    async fn test_full_run_advances_watermark_to_end() {
        let temp = TempDir::new().unwrap();
        let engine = engine(Arc::new(ScriptedSource::default()), &temp, options());

        let report = engine.run(d(1), d(3), d(10)).await;
        assert_eq!(report.status(), RunStatus::FullySynced);
        assert_eq!(report.windows_committed, 3);
        assert_eq!(engine.sync_db().watermark(None, MetricKind::Hydration).unwrap(), Some(d(3)));

        // Nothing left to do on the second run
        let report = engine.run(d(1), d(3), d(10)).await;
        assert_eq!(report.windows_committed, 0);
    }

    #[tokio::test]
    async fn test_repeated_rows_in_a_window_are_written_once() {
        let temp = TempDir::new().unwrap();
        let source = Arc::new(ScriptedSource {
            repeat_days: true,
            ..Default::default()
        });
        let mut options = options();
        options.planner.max_span_days.insert(MetricKind::Hydration, 2);
        let engine = engine(source, &temp, options);

        let report = engine.run(d(1), d(4), d(10)).await;
        assert_eq!(report.windows_committed, 2);
        assert_eq!(report.records_written, 4);

        // A fresh pass over the same days writes them again; the store keeps one row per day
        engine.sync_db().reset(None, MetricKind::Hydration, None).unwrap();
        let report = engine.run(d(1), d(4), d(10)).await;
        assert_eq!(report.records_written, 4);
        let stored = ParquetStore::new(temp.path()).read_kind(MetricKind::Hydration).unwrap();
        assert_eq!(stored.len(), 4);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let temp = TempDir::new().unwrap();
        let source = Arc::new(ScriptedSource::default());
        source.failures.lock().unwrap().insert(d(2), 2);
        let engine = engine(source.clone(), &temp, options());

        let report = engine.run(d(1), d(3), d(10)).await;
        assert_eq!(report.status(), RunStatus::FullySynced);
        assert_eq!(source.calls.lock().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_auth_failure_aborts_before_any_window() {
        let temp = TempDir::new().unwrap();
        let source = Arc::new(ScriptedSource {
            auth_fails: true,
            ..Default::default()
        });
        let engine = engine(source.clone(), &temp, options());

        let report = engine.run(d(1), d(3), d(10)).await;
        assert!(report.is_aborted());
        assert!(source.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_stops_at_window_boundary() {
        let temp = TempDir::new().unwrap();
        let source = Arc::new(ScriptedSource::default());
        let engine = engine(source.clone(), &temp, options());
        engine.shutdown_handle().store(true, Ordering::SeqCst);

        let report = engine.run(d(1), d(3), d(10)).await;
        assert!(report.is_aborted());
        assert!(source.calls.lock().unwrap().is_empty());
        assert_eq!(engine.sync_db().watermark(None, MetricKind::Hydration).unwrap(), None);
    }

    #[tokio::test]
    async fn test_reimport_resets_watermark() {
        let temp = TempDir::new().unwrap();
        let source = Arc::new(ScriptedSource::default());
        let engine = engine(source.clone(), &temp, options());
        engine.run(d(1), d(2), d(10)).await;

        let mut reimport = options();
        reimport.watermark_policy = WatermarkPolicy::Reimport;
        let engine = IngestionEngine {
            options: reimport,
            ..engine
        };
        let report = engine.run(d(1), d(2), d(10)).await;
        assert_eq!(report.windows_committed, 2);
        assert_eq!(source.calls.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_multi_user_tags_records_and_keeps_watermarks_apart() {
        let temp = TempDir::new().unwrap();
        let mut opts = options();
        opts.identities = vec![Some("alice".to_string()), Some("bob".to_string())];
        let engine = engine(Arc::new(ScriptedSource::default()), &temp, opts);

        let report = engine.run(d(1), d(2), d(10)).await;
        assert_eq!(report.records_written, 4);
        assert_eq!(engine.sync_db().watermark(Some("alice"), MetricKind::Hydration).unwrap(), Some(d(2)));
        assert_eq!(engine.sync_db().watermark(Some("bob"), MetricKind::Hydration).unwrap(), Some(d(2)));
        assert_eq!(engine.sync_db().watermark(None, MetricKind::Hydration).unwrap(), None);

        let stored = ParquetStore::new(temp.path()).read_kind(MetricKind::Hydration).unwrap();
        let owners: HashSet<_> = stored.iter().map(|r| r.owner.clone()).collect();
        assert_eq!(owners.len(), 2);
    }
}
