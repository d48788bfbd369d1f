//! Known activity identities for the file import path

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::models::ActivityIdentity;
use crate::storage::Sink;

/// Set of activity identities already written, for one identity.
///
/// A file-backed index keeps every identity's set in one JSON document and
/// rewrites it atomically after each [`record`](Self::record).
#[derive(Debug, Default)]
pub struct DedupIndex {
    owner: String,
    sets: BTreeMap<String, BTreeSet<ActivityIdentity>>,
    path: Option<PathBuf>,
}

impl DedupIndex {
    /// Index persisted at `path`; a missing file starts empty
    pub fn load(path: impl Into<PathBuf>, owner: Option<&str>) -> Result<Self> {
        let path = path.into();
        let sets = if path.exists() {
            let text = fs::read_to_string(&path)?;
            serde_json::from_str(&text)?
        } else {
            BTreeMap::new()
        };
        let index = Self {
            owner: owner.unwrap_or_default().to_string(),
            sets,
            path: Some(path),
        };
        log::debug!("Loaded {} known activities from dedup index", index.len());
        Ok(index)
    }

    /// In-memory index seeded with what the sink already stores
    pub async fn from_sink(sink: &dyn Sink, owner: Option<&str>) -> Result<Self> {
        let known = sink.known_activity_identities(owner).await?;
        let key = owner.unwrap_or_default().to_string();
        let mut sets = BTreeMap::new();
        sets.insert(key.clone(), known.into_iter().collect());
        log::debug!("{} reports {} known activities", sink.describe(), sets[&key].len());
        Ok(Self {
            owner: key,
            sets,
            path: None,
        })
    }

    pub fn has(&self, identity: &ActivityIdentity) -> bool {
        self.sets
            .get(&self.owner)
            .is_some_and(|set| set.contains(identity))
    }

    /// Remember an identity whose records were written
    pub fn record(&mut self, identity: ActivityIdentity) -> Result<()> {
        let inserted = self.sets.entry(self.owner.clone()).or_default().insert(identity);
        if inserted {
            if let Some(path) = &self.path {
                persist(path, &self.sets)?;
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.sets.get(&self.owner).map_or(0, |set| set.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Write to a sibling temp file, then rename over the index
fn persist(path: &Path, sets: &BTreeMap<String, BTreeSet<ActivityIdentity>>) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let temp_path = path.with_extension("json.tmp");
    fs::write(&temp_path, serde_json::to_vec_pretty(sets)?)?;
    fs::rename(&temp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MetricKind, MetricRecord};
    use crate::storage::ParquetStore;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    #[test]
    fn test_file_index_survives_reload() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("dedup_index.json");

        let mut index = DedupIndex::load(&path, None).unwrap();
        assert!(index.is_empty());
        index.record(ActivityIdentity::new("abc")).unwrap();
        index.record(ActivityIdentity::new("abc")).unwrap();

        let reloaded = DedupIndex::load(&path, None).unwrap();
        assert!(reloaded.has(&ActivityIdentity::new("abc")));
        assert_eq!(reloaded.len(), 1);
        assert!(!temp.path().join("dedup_index.json.tmp").exists());
    }

    #[test]
    fn test_identities_are_scoped_per_owner() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("dedup_index.json");

        let mut alice = DedupIndex::load(&path, Some("alice")).unwrap();
        alice.record(ActivityIdentity::new("abc")).unwrap();

        let bob = DedupIndex::load(&path, Some("bob")).unwrap();
        assert!(!bob.has(&ActivityIdentity::new("abc")));
        let alice = DedupIndex::load(&path, Some("alice")).unwrap();
        assert!(alice.has(&ActivityIdentity::new("abc")));
    }

    #[tokio::test]
    async fn test_seeded_from_sink() {
        let temp = TempDir::new().unwrap();
        let store = ParquetStore::new(temp.path());
        let ts = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap().and_hms_opt(7, 0, 0).unwrap();
        store
            .upsert_records_async(&[MetricRecord::new(MetricKind::ActivitySummary, ts)
                .with_activity(ActivityIdentity::new("known"))
                .with_field("activityType", "running")])
            .await
            .unwrap();

        let mut index = DedupIndex::from_sink(&store, None).await.unwrap();
        assert!(index.has(&ActivityIdentity::new("known")));
        index.record(ActivityIdentity::new("new")).unwrap();
        assert_eq!(index.len(), 2);
    }
}
