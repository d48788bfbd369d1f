//! Parquet read/write utilities for time-partitioned storage
//!
//! Uses Arrow record batches for columnar storage. Writes replace whole
//! partition files atomically, so readers always see a consistent file.
//! Concurrent writes to the same partition are serialized by per-partition locks.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, StringArray, TimestampMicrosecondArray};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime};
use dashmap::DashMap;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use tokio::sync::Mutex as TokioMutex;

use super::partitions::{dir_name, PartitionScheme};
use super::Sink;
use crate::error::{IngestError, Result};
use crate::models::{ActivityIdentity, FieldValue, MetricKind, MetricRecord, RecordKey};

/// Parquet storage for metric records
///
/// One directory per metric kind, one file per partition. Records are
/// upserted by (timestamp, owner) within their kind.
#[derive(Clone)]
pub struct ParquetStore {
    base_path: PathBuf,
    /// Per-partition locks for concurrent write safety
    partition_locks: Arc<DashMap<String, Arc<TokioMutex<()>>>>,
}

fn storage_err(context: &str, e: impl std::fmt::Display) -> IngestError {
    IngestError::Database(format!("{}: {}", context, e))
}

fn schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("kind", DataType::Utf8, false),
        Field::new("timestamp", DataType::Timestamp(TimeUnit::Microsecond, None), false),
        Field::new("owner", DataType::Utf8, true),
        Field::new("activity_id", DataType::Utf8, true),
        Field::new("fields_json", DataType::Utf8, false),
    ]))
}

impl ParquetStore {
    /// Create a new ParquetStore at the given base path
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            partition_locks: Arc::new(DashMap::new()),
        }
    }

    /// Get or create a lock for a specific partition
    fn get_partition_lock(&self, partition_key: &str) -> Arc<TokioMutex<()>> {
        self.partition_locks
            .entry(partition_key.to_string())
            .or_insert_with(|| Arc::new(TokioMutex::new(())))
            .clone()
    }

    /// Get the full path for a partition file
    pub fn partition_path(&self, kind: MetricKind, partition_key: &str) -> PathBuf {
        self.base_path
            .join(dir_name(kind))
            .join(format!("{}.parquet", partition_key))
    }

    /// Write a record batch to a partition file atomically
    fn write_batch(&self, path: &Path, batch: &RecordBatch) -> Result<()> {
        let temp_path = path.with_extension("parquet.tmp");

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| storage_err("Failed to create directory", e))?;
        }

        let file = File::create(&temp_path)
            .map_err(|e| storage_err("Failed to create temp file", e))?;

        let props = WriterProperties::builder()
            .set_compression(Compression::ZSTD(Default::default()))
            .build();

        let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))
            .map_err(|e| storage_err("Failed to create Parquet writer", e))?;
        writer
            .write(batch)
            .map_err(|e| storage_err("Failed to write batch", e))?;
        writer
            .close()
            .map_err(|e| storage_err("Failed to close writer", e))?;

        // Atomic rename
        fs::rename(&temp_path, path)
            .map_err(|e| storage_err("Failed to rename temp file", e))?;

        Ok(())
    }

    /// Read all record batches from a partition file
    fn read_batches(&self, path: &Path) -> Result<Vec<RecordBatch>> {
        if !path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(path).map_err(|e| storage_err("Failed to open file", e))?;

        let reader = ParquetRecordBatchReaderBuilder::try_new(file)
            .map_err(|e| storage_err("Failed to create reader", e))?
            .build()
            .map_err(|e| storage_err("Failed to build reader", e))?;

        reader
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| storage_err("Failed to read batches", e))
    }

    /// Read every record stored in one partition file
    pub fn read_partition(&self, path: &Path) -> Result<Vec<MetricRecord>> {
        let mut records = Vec::new();
        for batch in self.read_batches(path)? {
            records.extend(Self::batch_to_records(&batch)?);
        }
        Ok(records)
    }

    /// Read every stored record of a kind, oldest first
    pub fn read_kind(&self, kind: MetricKind) -> Result<Vec<MetricRecord>> {
        let dir = self.base_path.join(dir_name(kind));
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut paths: Vec<PathBuf> = fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("parquet"))
            .collect();
        paths.sort();

        let mut records = Vec::new();
        for path in paths {
            records.extend(self.read_partition(&path)?);
        }
        records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(records)
    }

    /// Upsert records with partition-level locking for concurrent writes.
    ///
    /// A record replaces any stored record with the same key, so rewriting
    /// the same batch leaves the store unchanged.
    pub async fn upsert_records_async(&self, records: &[MetricRecord]) -> Result<()> {
        let mut partitions: HashMap<(MetricKind, String), Vec<MetricRecord>> = HashMap::new();
        for record in records.iter().filter(|r| !r.is_empty()) {
            let key = PartitionScheme::for_kind(record.kind).partition_key(record.timestamp.date());
            partitions.entry((record.kind, key)).or_default().push(record.clone());
        }

        for ((kind, key), new_records) in partitions {
            let lock = self.get_partition_lock(&format!("{}/{}", dir_name(kind), key));
            let _guard = lock.lock().await;

            let path = self.partition_path(kind, &key);
            let existing = self.read_partition(&path)?;

            // Later records win within the batch as well
            let mut merged: BTreeMap<RecordKey, MetricRecord> =
                existing.into_iter().map(|r| (r.key(), r)).collect();
            for record in new_records {
                merged.insert(record.key(), record);
            }

            let rows: Vec<&MetricRecord> = merged.values().collect();
            let batch = Self::records_to_batch(&rows)?;
            self.write_batch(&path, &batch)?;
        }

        Ok(())
    }

    fn records_to_batch(records: &[&MetricRecord]) -> Result<RecordBatch> {
        let kind: StringArray = records.iter().map(|r| Some(r.kind.as_str())).collect();
        let timestamp: TimestampMicrosecondArray = records
            .iter()
            .map(|r| Some(r.timestamp.and_utc().timestamp_micros()))
            .collect();
        let owner: StringArray = records.iter().map(|r| r.owner.as_deref()).collect();
        let activity_id: StringArray = records
            .iter()
            .map(|r| r.activity.as_ref().map(|a| a.as_str()))
            .collect();
        let mut fields_json = Vec::with_capacity(records.len());
        for r in records {
            fields_json.push(serde_json::to_string(&r.fields)?);
        }
        let fields_json = StringArray::from(fields_json);

        let columns: Vec<ArrayRef> = vec![
            Arc::new(kind),
            Arc::new(timestamp),
            Arc::new(owner),
            Arc::new(activity_id),
            Arc::new(fields_json),
        ];
        RecordBatch::try_new(schema(), columns)
            .map_err(|e| storage_err("Failed to build record batch", e))
    }

    fn batch_to_records(batch: &RecordBatch) -> Result<Vec<MetricRecord>> {
        fn column<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
            batch
                .column_by_name(name)
                .and_then(|c| c.as_any().downcast_ref::<T>())
                .ok_or_else(|| IngestError::Database(format!("Parquet file lacks column {}", name)))
        }

        let kind = column::<StringArray>(batch, "kind")?;
        let timestamp = column::<TimestampMicrosecondArray>(batch, "timestamp")?;
        let owner = column::<StringArray>(batch, "owner")?;
        let activity_id = column::<StringArray>(batch, "activity_id")?;
        let fields_json = column::<StringArray>(batch, "fields_json")?;

        let mut records = Vec::with_capacity(batch.num_rows());
        for i in 0..batch.num_rows() {
            let kind: MetricKind = kind.value(i).parse()?;
            let timestamp: NaiveDateTime = DateTime::from_timestamp_micros(timestamp.value(i))
                .map(|dt| dt.naive_utc())
                .ok_or_else(|| IngestError::Database("timestamp out of range".to_string()))?;
            let fields: BTreeMap<String, FieldValue> = serde_json::from_str(fields_json.value(i))?;
            records.push(MetricRecord {
                kind,
                timestamp,
                owner: owner.is_valid(i).then(|| owner.value(i).to_string()),
                activity: activity_id
                    .is_valid(i)
                    .then(|| ActivityIdentity::new(activity_id.value(i))),
                fields,
            });
        }
        Ok(records)
    }

    /// Get the base path for external readers
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }
}

#[async_trait]
impl Sink for ParquetStore {
    async fn write(&self, records: &[MetricRecord]) -> Result<()> {
        self.upsert_records_async(records).await.map_err(|e| match e {
            IngestError::Database(msg) => IngestError::WriteTransient(msg),
            IngestError::Io(err) => IngestError::WriteTransient(err.to_string()),
            other => IngestError::WriteRejected(other.to_string()),
        })
    }

    async fn known_activity_identities(&self, owner: Option<&str>) -> Result<HashSet<ActivityIdentity>> {
        Ok(self
            .read_kind(MetricKind::ActivitySummary)?
            .into_iter()
            .filter(|r| r.owner.as_deref() == owner)
            .filter_map(|r| r.activity)
            .collect())
    }

    fn describe(&self) -> String {
        format!("parquet {}", self.base_path.display())
    }
}
