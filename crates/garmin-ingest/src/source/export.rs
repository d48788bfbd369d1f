//! Account export source
//!
//! Serves fetch calls from an unpacked "export your data" archive. Entries are
//! reshaped into the API response shape so the normal per-kind normalizers
//! apply unchanged.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::NaiveDate;
use regex::Regex;
use serde_json::Value;

use super::{RawPayload, RemoteSource};
use crate::error::{IngestError, Result};
use crate::models::{parse_garmin_datetime, ActivitySummary, FetchWindow, MetricKind};

const ACTIVITIES_PATTERN: &str = r"DI-Connect-Fitness.*summarizedActivities.*\.json$";
const SLEEP_PATTERN: &str = r"DI-Connect-Wellness.*sleepData.*\.json$";
const AGGREGATOR_PATTERN: &str = r"DI-Connect-Aggregator.*UDSFile.*\.json$";
const UPLOADS_PATTERN: &str = r"DI-Connect-Uploaded-Files.*\.zip$";

/// Sleep phases that add up to the time spent asleep
const SLEEP_PHASES: [&str; 4] = [
    "deepSleepSeconds",
    "lightSleepSeconds",
    "awakeSleepSeconds",
    "unmeasurableSeconds",
];

/// An unpacked account export loaded into memory
#[derive(Debug)]
pub struct ExportSource {
    root: PathBuf,
    daily_stats: BTreeMap<NaiveDate, Value>,
    sleep: BTreeMap<NaiveDate, Value>,
    hydration: BTreeMap<NaiveDate, Value>,
    /// API-shaped activity summaries with their local start day
    activities: Vec<(NaiveDate, Value)>,
    uploaded_archives: Vec<PathBuf>,
}

fn pattern(re: &str) -> Result<Regex> {
    Regex::new(re).map_err(|e| IngestError::config(format!("bad export pattern {}: {}", re, e)))
}

/// Every regular file under `dir`, sorted for a stable load order
fn walk(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

fn read_json(path: &Path) -> Result<Value> {
    let text = fs::read_to_string(path)?;
    serde_json::from_str(&text).map_err(|e| IngestError::decode(format!("{}: {}", path.display(), e)))
}

fn entries(path: &Path) -> Result<Vec<Value>> {
    match read_json(path)? {
        Value::Array(items) => Ok(items),
        _ => Err(IngestError::unsupported(format!("{}: expected a JSON list", path.display()))),
    }
}

fn calendar_date(entry: &Value) -> Option<NaiveDate> {
    let text = entry.get("calendarDate")?.as_str()?;
    NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d").ok()
}

/// Exports carry ISO timestamps where the API returns epoch milliseconds
fn iso_to_millis(entry: &mut Value, key: &str) {
    let millis = entry
        .get(key)
        .and_then(|v| v.as_str())
        .and_then(parse_garmin_datetime)
        .map(|dt| dt.and_utc().timestamp_millis());
    if let (Some(ms), Some(obj)) = (millis, entry.as_object_mut()) {
        obj.insert(key.to_string(), Value::from(ms));
    }
}

fn sleeping_seconds(sleep: Option<&Value>) -> Option<i64> {
    let sleep = sleep?;
    let total: i64 = SLEEP_PHASES
        .iter()
        .filter_map(|key| sleep.get(*key).and_then(|v| v.as_i64()))
        .sum();
    (total > 0).then_some(total)
}

impl ExportSource {
    /// Index the export under `root`
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(IngestError::config(format!("{} is not a directory", root.display())));
        }
        let files = walk(&root)?;
        log::info!("Found {} files in {}", files.len(), root.display());

        let matching = |re: &str| -> Result<Vec<&PathBuf>> {
            let re = pattern(re)?;
            Ok(files.iter().filter(|p| re.is_match(&p.to_string_lossy())).collect())
        };

        let sleep = Self::load_sleep(&matching(SLEEP_PATTERN)?)?;
        let (daily_stats, hydration) = Self::load_aggregates(&matching(AGGREGATOR_PATTERN)?, &sleep)?;
        let activities = Self::load_activities(&matching(ACTIVITIES_PATTERN)?)?;
        let uploaded_archives = matching(UPLOADS_PATTERN)?.into_iter().cloned().collect();

        log::info!(
            "Export holds {} days of stats, {} nights of sleep, {} activities",
            daily_stats.len(),
            sleep.len(),
            activities.len()
        );

        Ok(Self {
            root,
            daily_stats,
            sleep,
            hydration,
            activities,
            uploaded_archives,
        })
    }

    fn load_sleep(paths: &[&PathBuf]) -> Result<BTreeMap<NaiveDate, Value>> {
        if paths.is_empty() {
            return Err(IngestError::config("export contains no sleep data files"));
        }
        let mut sleep = BTreeMap::new();
        for path in paths {
            for mut entry in entries(path)? {
                let Some(date) = calendar_date(&entry) else {
                    continue;
                };
                if sleep.contains_key(&date) {
                    return Err(IngestError::decode(format!(
                        "duplicate sleep entries for {} in {}",
                        date,
                        path.display()
                    )));
                }
                iso_to_millis(&mut entry, "sleepStartTimestampGMT");
                iso_to_millis(&mut entry, "sleepEndTimestampGMT");
                sleep.insert(date, entry);
            }
        }
        Ok(sleep)
    }

    #[allow(clippy::type_complexity)]
    fn load_aggregates(
        paths: &[&PathBuf],
        sleep: &BTreeMap<NaiveDate, Value>,
    ) -> Result<(BTreeMap<NaiveDate, Value>, BTreeMap<NaiveDate, Value>)> {
        if paths.is_empty() {
            return Err(IngestError::config("export contains no aggregated stats files"));
        }
        let mut stats = BTreeMap::new();
        let mut hydration = BTreeMap::new();
        for path in paths {
            for entry in entries(path)? {
                if let Some(water) = entry.get("hydration") {
                    if let Some(date) = calendar_date(water) {
                        hydration.insert(date, water.clone());
                    }
                    continue;
                }
                let Some(date) = calendar_date(&entry) else {
                    continue;
                };
                if stats.contains_key(&date) {
                    return Err(IngestError::decode(format!(
                        "duplicate aggregated stats for {} in {}",
                        date,
                        path.display()
                    )));
                }
                let mut entry = entry;
                if let (Some(seconds), Some(obj)) = (sleeping_seconds(sleep.get(&date)), entry.as_object_mut()) {
                    obj.insert("sleepingSeconds".to_string(), Value::from(seconds));
                }
                stats.insert(date, entry);
            }
        }
        Ok((stats, hydration))
    }

    fn load_activities(paths: &[&PathBuf]) -> Result<Vec<(NaiveDate, Value)>> {
        let mut activities = Vec::new();
        for path in paths {
            for wrapper in entries(path)? {
                let Some(list) = wrapper.get("summarizedActivitiesExport").and_then(|v| v.as_array()) else {
                    continue;
                };
                for raw in list {
                    let Some(summary) = ActivitySummary::from_export(raw) else {
                        log::debug!("Skipping export activity without an id");
                        continue;
                    };
                    let Some(start) = summary.start_local() else {
                        continue;
                    };
                    activities.push((start.date(), serde_json::to_value(&summary)?));
                }
            }
        }
        activities.sort_by_key(|(date, _)| *date);
        Ok(activities)
    }

    /// Zip archives of the original uploaded activity files
    pub fn uploaded_archives(&self) -> &[PathBuf] {
        &self.uploaded_archives
    }

    /// Export activity summaries starting within `start..=end`
    pub fn activity_summaries(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<ActivitySummary>> {
        self.activities
            .iter()
            .filter(|(date, _)| (start..=end).contains(date))
            .map(|(_, activity)| Ok(serde_json::from_value(activity.clone())?))
            .collect()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Kinds an account export carries, in processing order
    pub const KINDS: [MetricKind; 4] = [
        MetricKind::DailyStats,
        MetricKind::Sleep,
        MetricKind::Hydration,
        MetricKind::ActivitySummary,
    ];

    fn per_day(&self, window: &FetchWindow, days: &BTreeMap<NaiveDate, Value>, wrap: impl Fn(&Value) -> Value) -> Vec<Value> {
        window
            .dates()
            .map(|date| days.get(&date).map(&wrap).unwrap_or(Value::Null))
            .collect()
    }
}

#[async_trait]
impl RemoteSource for ExportSource {
    async fn prepare(&self, _owner: Option<&str>) -> Result<()> {
        Ok(())
    }

    async fn fetch(&self, window: &FetchWindow, _owner: Option<&str>) -> Result<RawPayload> {
        let documents = match window.kind {
            MetricKind::DailyStats => self.per_day(window, &self.daily_stats, Value::clone),
            MetricKind::Hydration => self.per_day(window, &self.hydration, Value::clone),
            MetricKind::Sleep => self.per_day(window, &self.sleep, |dto| {
                serde_json::json!({ "dailySleepDTO": dto })
            }),
            MetricKind::ActivitySummary => {
                let list: Vec<Value> = self
                    .activities
                    .iter()
                    .filter(|(date, _)| window.contains(*date))
                    .map(|(_, activity)| activity.clone())
                    .collect();
                if list.is_empty() {
                    Vec::new()
                } else {
                    vec![Value::Array(list)]
                }
            }
            kind => {
                return Err(IngestError::NotFound(format!("{} is not part of an account export", kind)));
            }
        };
        Ok(RawPayload::Documents(documents))
    }

    fn describe(&self) -> String {
        format!("account export at {}", self.root.display())
    }
}
