//! Partition key calculation for time-partitioned Parquet storage

use chrono::{Datelike, NaiveDate};

use crate::models::MetricKind;

/// How a metric stream is split into files
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionScheme {
    /// Daily partitions (YYYY-MM-DD)
    Daily,
    /// Weekly partitions (YYYY-Www)
    Weekly,
    /// Monthly partitions (YYYY-MM)
    Monthly,
}

impl PartitionScheme {
    /// Partition scheme for a metric kind, sized by expected row volume
    pub fn for_kind(kind: MetricKind) -> Self {
        match kind {
            MetricKind::ActivityGps => PartitionScheme::Daily,
            MetricKind::ActivitySummary => PartitionScheme::Weekly,
            _ => PartitionScheme::Monthly,
        }
    }

    /// Calculate partition key for a given date
    pub fn partition_key(&self, date: NaiveDate) -> String {
        match self {
            PartitionScheme::Daily => date.format("%Y-%m-%d").to_string(),
            PartitionScheme::Weekly => {
                format!("{}-W{:02}", date.iso_week().year(), date.iso_week().week())
            }
            PartitionScheme::Monthly => date.format("%Y-%m").to_string(),
        }
    }
}

/// Directory holding a kind's partitions
pub fn dir_name(kind: MetricKind) -> &'static str {
    kind.as_str()
}

/// Glob pattern matching every partition of a kind
pub fn glob_pattern(kind: MetricKind) -> String {
    format!("{}/*.parquet", dir_name(kind))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 12, 15).unwrap()
    }

    #[test]
    fn test_weekly_partition_key() {
        // Sunday of ISO week 50
        let scheme = PartitionScheme::for_kind(MetricKind::ActivitySummary);
        assert_eq!(scheme.partition_key(date()), "2024-W50");
    }

    #[test]
    fn test_daily_partition_key() {
        let scheme = PartitionScheme::for_kind(MetricKind::ActivityGps);
        assert_eq!(scheme.partition_key(date()), "2024-12-15");
    }

    #[test]
    fn test_monthly_partition_key() {
        let scheme = PartitionScheme::for_kind(MetricKind::HeartRate);
        assert_eq!(scheme.partition_key(date()), "2024-12");
    }

    #[test]
    fn test_iso_week_crosses_year() {
        let d = NaiveDate::from_ymd_opt(2024, 12, 30).unwrap();
        assert_eq!(PartitionScheme::Weekly.partition_key(d), "2025-W01");
    }

    #[test]
    fn test_glob_pattern() {
        assert_eq!(glob_pattern(MetricKind::Sleep), "sleep/*.parquet");
    }
}
