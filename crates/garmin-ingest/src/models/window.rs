//! Fetch windows produced by the planner

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::record::{MetricKind, Resolution};

/// A bounded date range submitted as one fetch unit.
///
/// `start` and `end` are both inclusive calendar days.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchWindow {
    pub kind: MetricKind,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub resolution: Resolution,
    /// Served by the slower cold-archive path upstream
    pub archived: bool,
    /// Re-fetch of days at or before the watermark (late-arriving data)
    pub refetch: bool,
}

impl FetchWindow {
    pub fn new(kind: MetricKind, start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            kind,
            start,
            end,
            resolution: kind.resolution(),
            archived: false,
            refetch: false,
        }
    }

    /// Number of calendar days covered
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    /// Every day of the window, oldest first
    pub fn dates(&self) -> impl Iterator<Item = NaiveDate> {
        let end = self.end;
        self.start.iter_days().take_while(move |d| *d <= end)
    }
}

impl fmt::Display for FetchWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}..{}", self.kind, self.start, self.end)?;
        if self.archived {
            write!(f, " (archived)")?;
        }
        if self.refetch {
            write!(f, " (refetch)")?;
        }
        Ok(())
    }
}
