//! Bulk import of FIT activity files
//!
//! Candidates are bare `.fit` files and `.fit` entries of `.zip` archives,
//! found recursively under the given paths. Each candidate is read and
//! decoded once to learn its (start time, identity); only that pair is kept.
//! Candidates are then sorted by it and re-read one at a time for writing,
//! skipping identities the dedup index already knows.

use std::collections::HashSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, NaiveDateTime};

use super::{DedupIndex, IngestionEngine, RunReport};
use crate::decode::archive;
use crate::error::{IngestError, Result};
use crate::models::{
    parse_garmin_datetime, retain_unseen, ActivityIdentity, ActivitySummary, MetricKind, MetricRecord,
};
use crate::normalize::activity_summary;

/// Largest start-time gap between a file and an export summary of the same activity
const SUMMARY_MATCH_SECS: i64 = 5 * 60;

/// Narrowing and enrichment for one import
#[derive(Debug, Clone, Default)]
pub struct ImportOptions {
    /// Only activities starting on these days (inclusive)
    pub range: Option<(NaiveDate, NaiveDate)>,
    /// Export summaries folded into the decoded summary they match
    pub summaries: Vec<ActivitySummary>,
}

/// One decodable activity file: a bare file or an archive entry
struct Candidate {
    path: PathBuf,
    entry: Option<String>,
}

impl Candidate {
    fn label(&self) -> String {
        match &self.entry {
            Some(name) => format!("{}!{}", self.path.display(), name),
            None => self.path.display().to_string(),
        }
    }

    fn read(&self) -> Result<Vec<u8>> {
        match &self.entry {
            Some(name) => archive::read_fit_entry(File::open(&self.path)?, name),
            None => Ok(fs::read(&self.path)?),
        }
    }
}

fn is_candidate_name(path: &Path) -> bool {
    let name = path.to_string_lossy().to_ascii_lowercase();
    name.ends_with(".fit") || name.ends_with(".zip")
}

/// Candidate files under `paths`, directories walked recursively in name order
fn candidate_files(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for path in paths {
        if !path.exists() {
            return Err(IngestError::config(format!("{} does not exist", path.display())));
        }
        if path.is_file() {
            files.push(path.clone());
            continue;
        }
        let mut pending = vec![path.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries: Vec<PathBuf> = fs::read_dir(&dir)?
                .map(|entry| entry.map(|e| e.path()))
                .collect::<std::io::Result<_>>()?;
            entries.sort();
            for entry in entries {
                if entry.is_dir() {
                    pending.push(entry);
                } else if is_candidate_name(&entry) {
                    files.push(entry);
                }
            }
        }
    }
    Ok(files)
}

/// Bare files become one candidate, archives one per `.fit` entry
fn expand(path: &Path) -> Result<Vec<Candidate>> {
    if !archive::is_zip_file(path)? {
        return Ok(vec![Candidate {
            path: path.to_path_buf(),
            entry: None,
        }]);
    }
    Ok(archive::fit_entry_names(File::open(path)?)?
        .into_iter()
        .map(|name| Candidate {
            path: path.to_path_buf(),
            entry: Some(name),
        })
        .collect())
}

fn export_starts(summary: &ActivitySummary) -> impl Iterator<Item = NaiveDateTime> + '_ {
    [summary.start_time_gmt.as_deref(), summary.start_time_local.as_deref()]
        .into_iter()
        .flatten()
        .filter_map(parse_garmin_datetime)
}

/// Fold the closest export summary into the decoded one.
///
/// File values win; the export adds its name, remote id and whatever the file
/// lacks. A matched export summary is consumed.
fn merge_export_summary(
    records: &mut [MetricRecord],
    start: NaiveDateTime,
    summaries: &mut Vec<ActivitySummary>,
) -> bool {
    let closest = summaries
        .iter()
        .enumerate()
        .filter_map(|(i, s)| {
            export_starts(s)
                .map(|t| (t - start).num_seconds().abs())
                .min()
                .map(|gap| (i, gap))
        })
        .filter(|(_, gap)| *gap <= SUMMARY_MATCH_SECS)
        .min_by_key(|(_, gap)| *gap);
    let Some((index, _)) = closest else {
        return false;
    };
    let Some(summary) = records.iter_mut().find(|r| {
        r.kind == MetricKind::ActivitySummary
            && r.timestamp == start
            && r.fields.get("activityName").and_then(|v| v.as_str()) != Some("END")
    }) else {
        return false;
    };

    let export = summaries.swap_remove(index);
    for (name, value) in activity_summary(&export, start).fields {
        if matches!(name.as_str(), "activityName" | "Activity_ID") {
            summary.fields.insert(name, value);
        } else {
            summary.fields.entry(name).or_insert(value);
        }
    }
    true
}

impl IngestionEngine {
    /// Import activity files for one identity.
    ///
    /// Decode failures skip the file in lenient mode and abort otherwise;
    /// write failures always abort.
    pub async fn import_files(&self, paths: &[PathBuf], owner: Option<&str>, dedup: &mut DedupIndex) -> RunReport {
        self.import_files_with(paths, owner, dedup, ImportOptions::default()).await
    }

    /// [`import_files`](Self::import_files) restricted to a date range and
    /// enriched with export summaries
    pub async fn import_files_with(
        &self,
        paths: &[PathBuf],
        owner: Option<&str>,
        dedup: &mut DedupIndex,
        options: ImportOptions,
    ) -> RunReport {
        let mut report = RunReport::new();
        let mut summaries = options.summaries;

        let files = match candidate_files(paths) {
            Ok(files) => files,
            Err(e) => {
                report.abort(e.to_string());
                return report;
            }
        };

        let mut candidates = Vec::new();
        for path in &files {
            match expand(path) {
                Ok(expanded) => candidates.extend(expanded),
                Err(e) => {
                    if !self.skip_or_abort(&mut report, &path.display().to_string(), e) {
                        return report;
                    }
                }
            }
        }
        log::info!("Found {} activity files in {} paths", candidates.len(), paths.len());

        // First pass: identity and start time only
        let mut order: Vec<(NaiveDateTime, ActivityIdentity, usize)> = Vec::with_capacity(candidates.len());
        for (index, candidate) in candidates.iter().enumerate() {
            match candidate.read().and_then(|bytes| self.decoder.decode(&bytes)) {
                Ok(decoded) => {
                    let day = decoded.start_time.date();
                    if let Some((start, end)) = options.range {
                        if day < start || day > end {
                            log::debug!("Skipping {}: starts {} outside {}..{}", candidate.label(), day, start, end);
                            continue;
                        }
                    }
                    order.push((decoded.start_time, decoded.identity, index));
                }
                Err(e) => {
                    if !self.skip_or_abort(&mut report, &candidate.label(), e) {
                        return report;
                    }
                }
            }
        }
        order.sort();

        for (start, identity, index) in order {
            if self.should_stop() {
                report.abort("shutdown requested");
                break;
            }
            let candidate = &candidates[index];
            let label = candidate.label();
            if dedup.has(&identity) {
                log::info!("Skipping {} ({} at {}): already imported", label, identity, start);
                report.files_already_known += 1;
                continue;
            }

            let mut records = match candidate.read().and_then(|bytes| self.decoder.decode(&bytes)) {
                Ok(decoded) => decoded.with_owner(owner).records,
                Err(e) => {
                    if !self.skip_or_abort(&mut report, &label, e) {
                        return report;
                    }
                    continue;
                }
            };
            if merge_export_summary(&mut records, start, &mut summaries) {
                log::debug!("Merged export summary into {}", label);
            }
            let records: Vec<MetricRecord> = retain_unseen(records, &mut HashSet::new());

            if !records.is_empty() {
                if let Err(e) = self.write_with_retry(&records).await {
                    report.abort(format!("{}: {}", label, e));
                    return report;
                }
            }
            if let Err(e) = dedup.record(identity) {
                report.abort(format!("dedup index: {}", e));
                return report;
            }
            log::info!("Imported {} ({} records)", label, records.len());
            report.files_imported += 1;
            report.records_written += records.len();
        }

        log::info!("Import finished: {}", report.status());
        report
    }

    /// Report a failed file; returns whether the import may continue
    fn skip_or_abort(&self, report: &mut RunReport, label: &str, err: IngestError) -> bool {
        if self.options.lenient && !err.is_fatal() {
            report.skip(label, err.to_string());
            true
        } else {
            report.abort(format!("{}: {}", label, err));
            false
        }
    }
}
