//! End-to-end runs of the ingestion engine
//!
//! The API path goes through wiremock; failure scenarios use a scripted
//! source so each window's outcome is explicit.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::NaiveDate;
use garmin_ingest::client::{GarminClient, OAuth2Token, StaticTokenProvider};
use garmin_ingest::config::{ColdArchiveConfig, ColdArchiveMode, RetryConfig};
use garmin_ingest::models::{FetchWindow, MetricKind};
use garmin_ingest::source::{GarminSource, RawPayload, RemoteSource};
use garmin_ingest::storage::{ParquetStore, Storage};
use garmin_ingest::sync::{EngineOptions, IngestionEngine, PlannerConfig, RunStatus, SharedRateLimiter};
use garmin_ingest::{IngestError, Result};
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn d(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
}

fn today() -> NaiveDate {
    d(20)
}

fn hydration_options() -> EngineOptions {
    EngineOptions {
        kinds: vec![MetricKind::Hydration],
        retry: RetryConfig {
            max_attempts: 3,
            base_delay_ms: 0,
        },
        ..Default::default()
    }
}

fn hydration_doc(date: NaiveDate) -> serde_json::Value {
    json!({"calendarDate": date.to_string(), "valueInML": 750.0, "goalInML": 2500.0})
}

/// Hydration source with per-day failure scripts
#[derive(Default)]
struct ScriptedSource {
    /// Days answered with a decode error
    broken: Mutex<HashSet<NaiveDate>>,
    /// Remaining transient failures per day
    flaky: Mutex<BTreeMap<NaiveDate, u32>>,
    calls: Mutex<Vec<NaiveDate>>,
}

impl ScriptedSource {
    fn calls(&self) -> Vec<NaiveDate> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteSource for ScriptedSource {
    async fn prepare(&self, _owner: Option<&str>) -> Result<()> {
        Ok(())
    }

    async fn fetch(&self, window: &FetchWindow, _owner: Option<&str>) -> Result<RawPayload> {
        self.calls.lock().unwrap().push(window.start);
        if self.broken.lock().unwrap().contains(&window.start) {
            return Err(IngestError::decode("garbled payload"));
        }
        if let Some(left) = self.flaky.lock().unwrap().get_mut(&window.start) {
            if *left > 0 {
                *left -= 1;
                return Err(IngestError::transient("503 Service Unavailable"));
            }
        }
        Ok(RawPayload::Documents(window.dates().map(hydration_doc).collect()))
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }
}

fn engine(source: Arc<dyn RemoteSource>, store: &TempDir, options: EngineOptions) -> IngestionEngine {
    let sink = Arc::new(ParquetStore::new(store.path()));
    IngestionEngine::new(source, Storage::open_in_memory(sink).unwrap(), options)
}

mod api_tests {
    use super::*;

    async fn mount_profile(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/userprofile-service/socialProfile"))
            .and(header("Authorization", "Bearer test-access-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"displayName": "runner42"})))
            .mount(server)
            .await;
    }

    async fn mount_hydration(server: &MockServer, date: NaiveDate) {
        Mock::given(method("GET"))
            .and(path(format!("/usersummary-service/usersummary/hydration/daily/{}", date)))
            .respond_with(ResponseTemplate::new(200).set_body_json(hydration_doc(date)))
            .mount(server)
            .await;
    }

    fn api_source(server: &MockServer) -> Arc<GarminSource> {
        let client = GarminClient::new_with_base_url(&server.uri()).unwrap();
        let tokens = Arc::new(StaticTokenProvider::new(OAuth2Token::bearer("test-access-token")));
        Arc::new(GarminSource::new(client, tokens, SharedRateLimiter::unlimited()))
    }

    #[tokio::test]
    async fn test_full_run_then_nothing_to_do() {
        let server = MockServer::start().await;
        mount_profile(&server).await;
        for day in 1..=3 {
            mount_hydration(&server, d(day)).await;
        }
        let store = TempDir::new().unwrap();
        let engine = engine(api_source(&server), &store, hydration_options());

        let report = engine.run(d(1), d(3), today()).await;
        assert_eq!(report.status(), RunStatus::FullySynced);
        assert_eq!(report.windows_committed, 3);
        assert_eq!(report.records_written, 3);
        assert_eq!(
            engine.sync_db().watermark(None, MetricKind::Hydration).unwrap(),
            Some(d(3))
        );

        let requests = server.received_requests().await.unwrap().len();
        assert_eq!(requests, 4);

        let report = engine.run(d(1), d(3), today()).await;
        assert_eq!(report.status(), RunStatus::FullySynced);
        assert_eq!(report.windows_committed, 0);
        assert_eq!(server.received_requests().await.unwrap().len(), requests);

        let stored = ParquetStore::new(store.path()).read_kind(MetricKind::Hydration).unwrap();
        assert_eq!(stored.len(), 3);
    }

    #[tokio::test]
    async fn test_missing_day_commits_empty() {
        let server = MockServer::start().await;
        mount_profile(&server).await;
        mount_hydration(&server, d(1)).await;
        // d(2) is not mounted: wiremock answers 404
        let store = TempDir::new().unwrap();
        let engine = engine(api_source(&server), &store, hydration_options());

        let report = engine.run(d(1), d(2), today()).await;
        assert_eq!(report.status(), RunStatus::FullySynced);
        assert_eq!(report.records_written, 1);
        assert_eq!(
            engine.sync_db().watermark(None, MetricKind::Hydration).unwrap(),
            Some(d(2))
        );
    }

    #[tokio::test]
    async fn test_rejected_token_aborts_run() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        let store = TempDir::new().unwrap();
        let engine = engine(api_source(&server), &store, hydration_options());

        let report = engine.run(d(1), d(3), today()).await;
        assert!(report.is_aborted());
        assert_eq!(report.windows_committed, 0);
        assert_eq!(engine.sync_db().watermark(None, MetricKind::Hydration).unwrap(), None);
    }
}

mod failure_tests {
    use super::*;

    #[tokio::test]
    async fn test_lenient_skip_is_retried_on_next_run() {
        let store = TempDir::new().unwrap();
        let source = Arc::new(ScriptedSource::default());
        source.broken.lock().unwrap().insert(d(2));
        let options = EngineOptions {
            lenient: true,
            ..hydration_options()
        };
        let engine = engine(source.clone(), &store, options);

        let report = engine.run(d(1), d(3), today()).await;
        assert_eq!(report.status(), RunStatus::PartiallySynced { skips: 1 });
        assert!(report.skips[0].identifier.contains("2024-01-02"));
        // d(3) is committed but the gap at d(2) holds the watermark back
        assert_eq!(
            engine.sync_db().watermark(None, MetricKind::Hydration).unwrap(),
            Some(d(1))
        );

        source.broken.lock().unwrap().clear();
        source.calls.lock().unwrap().clear();
        let report = engine.run(d(1), d(3), today()).await;
        assert_eq!(report.status(), RunStatus::FullySynced);
        assert_eq!(source.calls(), vec![d(2)]);
        assert_eq!(
            engine.sync_db().watermark(None, MetricKind::Hydration).unwrap(),
            Some(d(3))
        );
    }

    #[tokio::test]
    async fn test_strict_mode_aborts_after_retry_budget() {
        let store = TempDir::new().unwrap();
        let source = Arc::new(ScriptedSource::default());
        source.flaky.lock().unwrap().insert(d(2), 3);
        let engine = engine(source.clone(), &store, hydration_options());

        let report = engine.run(d(1), d(3), today()).await;
        assert!(report.is_aborted());
        assert_eq!(report.windows_committed, 1);
        assert_eq!(source.calls(), vec![d(1), d(2), d(2), d(2)]);
        assert_eq!(
            engine.sync_db().watermark(None, MetricKind::Hydration).unwrap(),
            Some(d(1))
        );
    }

    #[tokio::test]
    async fn test_rewrite_leaves_store_unchanged() {
        let store = TempDir::new().unwrap();

        let first = engine(Arc::new(ScriptedSource::default()), &store, hydration_options());
        first.run(d(1), d(5), today()).await;
        let before = ParquetStore::new(store.path()).read_kind(MetricKind::Hydration).unwrap();

        // Fresh sync state: every window is fetched and written again
        let second = engine(Arc::new(ScriptedSource::default()), &store, hydration_options());
        let report = second.run(d(1), d(5), today()).await;
        assert_eq!(report.windows_committed, 5);

        let after = ParquetStore::new(store.path()).read_kind(MetricKind::Hydration).unwrap();
        assert_eq!(before.len(), 5);
        assert_eq!(before, after);
    }
}

mod cold_archive_tests {
    use super::*;

    fn skip_cold_heart_rate() -> EngineOptions {
        EngineOptions {
            kinds: vec![MetricKind::HeartRate],
            planner: PlannerConfig {
                cold_archive: ColdArchiveConfig {
                    threshold_days: 10,
                    mode: ColdArchiveMode::Skip,
                },
                trailing_refetch_days: 0,
                ..Default::default()
            },
            ..hydration_options()
        }
    }

    #[tokio::test]
    async fn test_skipped_cold_days_still_advance_watermark() {
        let store = TempDir::new().unwrap();
        let source = Arc::new(ScriptedSource::default());
        let engine = engine(source.clone(), &store, skip_cold_heart_rate());

        // today is the 20th, so everything before the 10th is cold
        let report = engine.run(d(1), d(12), today()).await;
        assert_eq!(report.status(), RunStatus::FullySynced);
        assert_eq!(source.calls(), vec![d(10), d(11), d(12)]);
        assert_eq!(
            engine.sync_db().watermark(None, MetricKind::HeartRate).unwrap(),
            Some(d(12))
        );

        let report = engine.run(d(1), d(12), today()).await;
        assert_eq!(report.windows_committed, 0);
        assert_eq!(source.calls().len(), 3);
    }
}
