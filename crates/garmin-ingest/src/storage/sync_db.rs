//! SQLite-based sync state
//!
//! This module handles the operational data for sync:
//! - watermarks: last committed day per identity and metric kind
//! - committed_windows: windows committed past a gap, pending watermark advance

use std::path::Path;

use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{IngestError, Result};
use crate::models::MetricKind;
use crate::sync::watermark::advance_frontier;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// One row of the watermark table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatermarkRow {
    pub owner: Option<String>,
    pub kind: String,
    pub committed_through: NaiveDate,
}

/// SQLite database for sync state
pub struct SyncDb {
    conn: Connection,
}

fn db_err(context: &str) -> impl FnOnce(rusqlite::Error) -> IngestError + '_ {
    move |e| IngestError::Database(format!("{}: {}", context, e))
}

fn owner_key(owner: Option<&str>) -> &str {
    owner.unwrap_or("")
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, DATE_FORMAT).ok()
}

fn format_date(d: NaiveDate) -> String {
    d.format(DATE_FORMAT).to_string()
}

impl SyncDb {
    /// Open or create the sync database
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path.as_ref()).map_err(db_err("Failed to open sync database"))?;

        let db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err("Failed to open in-memory database"))?;

        let db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    /// Run migrations
    fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS watermarks (
                    owner TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    committed_through TEXT NOT NULL,
                    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                    PRIMARY KEY (owner, kind)
                );

                CREATE TABLE IF NOT EXISTS committed_windows (
                    owner TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    start_date TEXT NOT NULL,
                    end_date TEXT NOT NULL,
                    PRIMARY KEY (owner, kind, start_date, end_date)
                );
                "#,
            )
            .map_err(db_err("Failed to run migrations"))?;

        Ok(())
    }

    // =========================================================================
    // Watermarks
    // =========================================================================

    /// Last committed day for an identity and kind
    pub fn watermark(&self, owner: Option<&str>, kind: MetricKind) -> Result<Option<NaiveDate>> {
        read_watermark(&self.conn, owner, kind)
    }

    /// Every stored watermark, for status output
    pub fn list_watermarks(&self) -> Result<Vec<WatermarkRow>> {
        let mut stmt = self
            .conn
            .prepare("SELECT owner, kind, committed_through FROM watermarks ORDER BY owner, kind")
            .map_err(db_err("Failed to list watermarks"))?;
        let rows = stmt
            .query_map([], |row| {
                let owner: String = row.get(0)?;
                let through: String = row.get(2)?;
                Ok((owner, row.get::<_, String>(1)?, through))
            })
            .map_err(db_err("Failed to list watermarks"))?;

        let mut out = Vec::new();
        for row in rows {
            let (owner, kind, through) = row.map_err(db_err("Failed to read watermark"))?;
            if let Some(committed_through) = parse_date(&through) {
                out.push(WatermarkRow {
                    owner: (!owner.is_empty()).then_some(owner),
                    kind,
                    committed_through,
                });
            }
        }
        Ok(out)
    }

    /// Operator override: set the watermark to `to` (or clear it) and drop the ledger
    pub fn reset(&self, owner: Option<&str>, kind: MetricKind, to: Option<NaiveDate>) -> Result<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .map_err(db_err("Failed to begin transaction"))?;
        tx.execute(
            "DELETE FROM committed_windows WHERE owner = ? AND kind = ?",
            params![owner_key(owner), kind.as_str()],
        )
        .map_err(db_err("Failed to clear committed windows"))?;
        match to {
            Some(date) => {
                tx.execute(
                    "INSERT INTO watermarks (owner, kind, committed_through)
                     VALUES (?, ?, ?)
                     ON CONFLICT (owner, kind) DO UPDATE SET
                         committed_through = excluded.committed_through,
                         updated_at = datetime('now')",
                    params![owner_key(owner), kind.as_str(), format_date(date)],
                )
                .map_err(db_err("Failed to reset watermark"))?;
            }
            None => {
                tx.execute(
                    "DELETE FROM watermarks WHERE owner = ? AND kind = ?",
                    params![owner_key(owner), kind.as_str()],
                )
                .map_err(db_err("Failed to reset watermark"))?;
            }
        }
        tx.commit().map_err(db_err("Failed to commit reset"))
    }

    // =========================================================================
    // Committed windows
    // =========================================================================

    /// Committed ranges not yet absorbed into the watermark
    pub fn committed_windows(&self, owner: Option<&str>, kind: MetricKind) -> Result<Vec<(NaiveDate, NaiveDate)>> {
        read_windows(&self.conn, owner, kind)
    }

    /// Record a committed window and advance the watermark as far as the
    /// ledger is contiguous from `origin`. Returns the resulting watermark.
    pub fn commit_window(
        &self,
        owner: Option<&str>,
        kind: MetricKind,
        start: NaiveDate,
        end: NaiveDate,
        origin: NaiveDate,
    ) -> Result<Option<NaiveDate>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .map_err(db_err("Failed to begin transaction"))?;

        tx.execute(
            "INSERT OR IGNORE INTO committed_windows (owner, kind, start_date, end_date)
             VALUES (?, ?, ?, ?)",
            params![owner_key(owner), kind.as_str(), format_date(start), format_date(end)],
        )
        .map_err(db_err("Failed to record committed window"))?;

        let current = read_watermark(&tx, owner, kind)?;
        let ledger = read_windows(&tx, owner, kind)?;
        let frontier = advance_frontier(current, origin, &ledger);

        if let Some(frontier) = frontier {
            // ISO dates compare correctly as text
            tx.execute(
                "INSERT INTO watermarks (owner, kind, committed_through)
                 VALUES (?, ?, ?)
                 ON CONFLICT (owner, kind) DO UPDATE SET
                     committed_through = MAX(committed_through, excluded.committed_through),
                     updated_at = datetime('now')",
                params![owner_key(owner), kind.as_str(), format_date(frontier)],
            )
            .map_err(db_err("Failed to update watermark"))?;

            tx.execute(
                "DELETE FROM committed_windows WHERE owner = ? AND kind = ? AND end_date <= ?",
                params![owner_key(owner), kind.as_str(), format_date(frontier)],
            )
            .map_err(db_err("Failed to prune committed windows"))?;
        }

        let stored = read_watermark(&tx, owner, kind)?;
        tx.commit().map_err(db_err("Failed to commit window"))?;
        Ok(stored)
    }
}

fn read_watermark(conn: &Connection, owner: Option<&str>, kind: MetricKind) -> Result<Option<NaiveDate>> {
    let value: Option<String> = conn
        .query_row(
            "SELECT committed_through FROM watermarks WHERE owner = ? AND kind = ?",
            params![owner_key(owner), kind.as_str()],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err("Failed to get watermark"))?;
    Ok(value.as_deref().and_then(parse_date))
}

fn read_windows(conn: &Connection, owner: Option<&str>, kind: MetricKind) -> Result<Vec<(NaiveDate, NaiveDate)>> {
    let mut stmt = conn
        .prepare(
            "SELECT start_date, end_date FROM committed_windows
             WHERE owner = ? AND kind = ?
             ORDER BY start_date",
        )
        .map_err(db_err("Failed to query committed windows"))?;
    let rows = stmt
        .query_map(params![owner_key(owner), kind.as_str()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })
        .map_err(db_err("Failed to query committed windows"))?;

    let mut out = Vec::new();
    for row in rows {
        let (start, end) = row.map_err(db_err("Failed to read committed window"))?;
        if let (Some(start), Some(end)) = (parse_date(&start), parse_date(&end)) {
            out.push((start, end));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    #[test]
    fn test_commit_advances_watermark() {
        let db = SyncDb::open_in_memory().unwrap();
        assert_eq!(db.watermark(None, MetricKind::Sleep).unwrap(), None);

        let w = db.commit_window(None, MetricKind::Sleep, d(1), d(1), d(1)).unwrap();
        assert_eq!(w, Some(d(1)));
        assert!(db.committed_windows(None, MetricKind::Sleep).unwrap().is_empty());
    }

    #[test]
    fn test_gap_keeps_window_in_ledger() {
        let db = SyncDb::open_in_memory().unwrap();
        db.commit_window(None, MetricKind::Steps, d(1), d(1), d(1)).unwrap();
        let w = db.commit_window(None, MetricKind::Steps, d(3), d(3), d(1)).unwrap();
        assert_eq!(w, Some(d(1)));
        assert_eq!(
            db.committed_windows(None, MetricKind::Steps).unwrap(),
            vec![(d(3), d(3))]
        );

        let w = db.commit_window(None, MetricKind::Steps, d(2), d(2), d(1)).unwrap();
        assert_eq!(w, Some(d(3)));
        assert!(db.committed_windows(None, MetricKind::Steps).unwrap().is_empty());
    }

    #[test]
    fn test_watermarks_scoped_by_owner() {
        let db = SyncDb::open_in_memory().unwrap();
        db.commit_window(Some("alice"), MetricKind::Hrv, d(1), d(5), d(1)).unwrap();
        assert_eq!(db.watermark(Some("alice"), MetricKind::Hrv).unwrap(), Some(d(5)));
        assert_eq!(db.watermark(Some("bob"), MetricKind::Hrv).unwrap(), None);
        assert_eq!(db.watermark(None, MetricKind::Hrv).unwrap(), None);
    }

    #[test]
    fn test_refetch_never_moves_watermark_back() {
        let db = SyncDb::open_in_memory().unwrap();
        db.commit_window(None, MetricKind::HeartRate, d(1), d(10), d(1)).unwrap();
        let w = db.commit_window(None, MetricKind::HeartRate, d(9), d(10), d(1)).unwrap();
        assert_eq!(w, Some(d(10)));
    }

    #[test]
    fn test_reset_overrides_and_clears() {
        let db = SyncDb::open_in_memory().unwrap();
        db.commit_window(None, MetricKind::Sleep, d(1), d(10), d(1)).unwrap();
        db.commit_window(None, MetricKind::Sleep, d(12), d(12), d(1)).unwrap();

        db.reset(None, MetricKind::Sleep, Some(d(4))).unwrap();
        assert_eq!(db.watermark(None, MetricKind::Sleep).unwrap(), Some(d(4)));
        assert!(db.committed_windows(None, MetricKind::Sleep).unwrap().is_empty());

        db.reset(None, MetricKind::Sleep, None).unwrap();
        assert_eq!(db.watermark(None, MetricKind::Sleep).unwrap(), None);
    }

    #[test]
    fn test_list_watermarks() {
        let db = SyncDb::open_in_memory().unwrap();
        db.commit_window(None, MetricKind::Sleep, d(1), d(2), d(1)).unwrap();
        db.commit_window(Some("bob"), MetricKind::Steps, d(1), d(3), d(1)).unwrap();

        let rows = db.list_watermarks().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].owner, None);
        assert_eq!(rows[0].kind, "sleep");
        assert_eq!(rows[1].owner.as_deref(), Some("bob"));
        assert_eq!(rows[1].committed_through, d(3));
    }

    #[test]
    fn test_reopen_persists_state() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("state").join("sync.db");
        {
            let db = SyncDb::open(&path).unwrap();
            db.commit_window(None, MetricKind::Sleep, d(1), d(7), d(1)).unwrap();
        }
        let db = SyncDb::open(&path).unwrap();
        assert_eq!(db.watermark(None, MetricKind::Sleep).unwrap(), Some(d(7)));
    }
}
