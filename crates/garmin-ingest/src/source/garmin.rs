//! Garmin Connect API source

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;
use serde_json::Value;

use super::{RawFile, RawPayload, RemoteSource};
use crate::client::{GarminClient, OAuth2Token, TokenProvider};
use crate::error::{IngestError, Result};
use crate::models::{ActivityIdentity, ActivitySummary, FetchWindow, MetricKind};
use crate::sync::rate_limiter::{Pace, SharedRateLimiter};

/// Page size of the activity search endpoint
const ACTIVITY_PAGE_SIZE: usize = 100;

const PROFILE_PATH: &str = "/userprofile-service/socialProfile";

/// Fetches windows from the Connect API.
///
/// Every HTTP call, including the per-day and per-activity sub-requests of
/// one window, waits on the shared limiter first.
pub struct GarminSource {
    client: GarminClient,
    tokens: Arc<dyn TokenProvider>,
    limiter: SharedRateLimiter,
    /// Display name per identity ("" in single-user mode)
    display_names: DashMap<String, String>,
}

impl GarminSource {
    pub fn new(client: GarminClient, tokens: Arc<dyn TokenProvider>, limiter: SharedRateLimiter) -> Self {
        Self {
            client,
            tokens,
            limiter,
            display_names: DashMap::new(),
        }
    }

    async fn get_json(&self, token: &OAuth2Token, path: &str, pace: Pace) -> Result<Value> {
        self.limiter.wait(pace).await;
        log::debug!("GET {}", path);
        self.client.get_json(token, path).await
    }

    /// Day documents where a missing day simply has no data
    async fn get_day(&self, token: &OAuth2Token, path: &str, pace: Pace) -> Result<Value> {
        match self.get_json(token, path, pace).await {
            Err(IngestError::NotFound(_)) => Ok(Value::Null),
            other => other,
        }
    }

    async fn display_name(&self, token: &OAuth2Token, owner: Option<&str>) -> Result<String> {
        let key = owner.unwrap_or_default().to_string();
        if let Some(name) = self.display_names.get(&key) {
            return Ok(name.value().clone());
        }

        let profile = self.get_json(token, PROFILE_PATH, Pace::Normal).await?;
        let name = profile
            .get("displayName")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| IngestError::unsupported("profile response has no displayName"))?;

        self.display_names.insert(key, name.clone());
        Ok(name)
    }

    fn day_path(kind: MetricKind, display_name: &str, date: NaiveDate) -> Option<String> {
        let path = match kind {
            MetricKind::DailyStats => format!(
                "/usersummary-service/usersummary/daily/{}?calendarDate={}",
                display_name, date
            ),
            MetricKind::Sleep => format!(
                "/wellness-service/wellness/dailySleepData/{}?date={}&nonSleepBufferMinutes=60",
                display_name, date
            ),
            MetricKind::HeartRate => format!(
                "/wellness-service/wellness/dailyHeartRate/{}?date={}",
                display_name, date
            ),
            MetricKind::Stress | MetricKind::BodyBattery => {
                format!("/wellness-service/wellness/dailyStress/{}", date)
            }
            MetricKind::Steps => format!(
                "/wellness-service/wellness/dailySummaryChart/{}?date={}",
                display_name, date
            ),
            MetricKind::Hrv => format!("/hrv-service/hrv/{}", date),
            MetricKind::Hydration => {
                format!("/usersummary-service/usersummary/hydration/daily/{}", date)
            }
            MetricKind::ActivitySummary | MetricKind::ActivityGps => return None,
        };
        Some(path)
    }

    /// All activity list pages for the window
    async fn activity_pages(&self, token: &OAuth2Token, window: &FetchWindow, pace: Pace) -> Result<Vec<Value>> {
        let mut pages = Vec::new();
        let mut start = 0;
        loop {
            let path = format!(
                "/activitylist-service/activities/search/activities?startDate={}&endDate={}&start={}&limit={}",
                window.start, window.end, start, ACTIVITY_PAGE_SIZE
            );
            let page = self.get_json(token, &path, pace).await?;
            let len = match &page {
                Value::Array(items) => items.len(),
                Value::Null => 0,
                _ => return Err(IngestError::unsupported("activity search did not return a list")),
            };
            if len > 0 {
                pages.push(page);
            }
            if len < ACTIVITY_PAGE_SIZE {
                break;
            }
            start += len;
        }
        Ok(pages)
    }

    async fn activity_files(&self, token: &OAuth2Token, window: &FetchWindow, pace: Pace) -> Result<Vec<RawFile>> {
        let mut files = Vec::new();
        for page in self.activity_pages(token, window, pace).await? {
            let activities: Vec<ActivitySummary> = serde_json::from_value(page)
                .map_err(|e| IngestError::unsupported(format!("activity list: {}", e)))?;
            for activity in activities {
                let path = format!("/download-service/files/activity/{}", activity.activity_id);
                self.limiter.wait(pace).await;
                match self.client.download(token, &path).await {
                    Ok(bytes) => files.push(RawFile {
                        name: format!("{}.zip", activity.activity_id),
                        bytes: bytes.to_vec(),
                        identity: Some(ActivityIdentity::from_remote_id(activity.activity_id)),
                    }),
                    Err(IngestError::NotFound(_)) => {
                        log::debug!("Activity {} has no original file", activity.activity_id);
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(files)
    }
}

#[async_trait]
impl RemoteSource for GarminSource {
    async fn prepare(&self, owner: Option<&str>) -> Result<()> {
        let token = self.tokens.token(owner).await?;
        let name = self.display_name(&token, owner).await?;
        log::info!("Authenticated as {}", name);
        Ok(())
    }

    async fn fetch(&self, window: &FetchWindow, owner: Option<&str>) -> Result<RawPayload> {
        let token = self.tokens.token(owner).await?;
        let pace = if window.archived { Pace::Archived } else { Pace::Normal };

        match window.kind {
            MetricKind::ActivitySummary => {
                let pages = self.activity_pages(&token, window, pace).await?;
                Ok(RawPayload::Documents(pages))
            }
            MetricKind::ActivityGps => {
                let files = self.activity_files(&token, window, pace).await?;
                Ok(RawPayload::Files(files))
            }
            kind => {
                let display_name = self.display_name(&token, owner).await?;
                let mut documents = Vec::with_capacity(window.days() as usize);
                for date in window.dates() {
                    if let Some(path) = Self::day_path(kind, &display_name, date) {
                        documents.push(self.get_day(&token, &path, pace).await?);
                    }
                }
                Ok(RawPayload::Documents(documents))
            }
        }
    }

    fn describe(&self) -> String {
        "Garmin Connect".to_string()
    }
}
