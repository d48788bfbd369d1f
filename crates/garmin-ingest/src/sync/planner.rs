//! Fetch window planning
//!
//! Turns a requested date range and the stored watermark into the ordered
//! list of windows to fetch for one metric kind. Planning is a pure function
//! of its arguments; `now` is the only notion of time.

use std::collections::BTreeMap;

use chrono::{Duration, NaiveDate};

use crate::config::{ColdArchiveConfig, ColdArchiveMode, IngestConfig};
use crate::models::{FetchWindow, MetricKind};

/// Planner settings taken from the run configuration
#[derive(Debug, Clone, Default)]
pub struct PlannerConfig {
    pub cold_archive: ColdArchiveConfig,
    /// Days up to and including `now` re-fetched even when already synced
    pub trailing_refetch_days: u32,
    /// Per-kind overrides of the largest span one call may cover
    pub max_span_days: BTreeMap<MetricKind, u32>,
}

impl PlannerConfig {
    pub fn from_config(config: &IngestConfig) -> Self {
        Self {
            cold_archive: config.cold_archive.clone(),
            trailing_refetch_days: config.trailing_refetch_days,
            max_span_days: config.max_span_days.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct WindowPlanner {
    config: PlannerConfig,
}

impl WindowPlanner {
    pub fn new(config: PlannerConfig) -> Self {
        Self { config }
    }

    /// Largest number of days one call for `kind` may cover
    pub fn max_span(&self, kind: MetricKind) -> u32 {
        self.config
            .max_span_days
            .get(&kind)
            .copied()
            .unwrap_or_else(|| kind.default_max_span_days())
            .max(1)
    }

    /// First day that is not cold for `kind`, or `None` if the kind never goes cold
    pub fn cold_cutoff(&self, kind: MetricKind, now: NaiveDate) -> Option<NaiveDate> {
        if !kind.archives_cold() {
            return None;
        }
        let threshold = Duration::days(i64::from(self.config.cold_archive.threshold_days));
        Some(now.checked_sub_signed(threshold).unwrap_or(NaiveDate::MIN))
    }

    /// Last day that will never be fetched for `kind` when cold data is skipped
    pub fn cold_floor(&self, kind: MetricKind, now: NaiveDate) -> Option<NaiveDate> {
        match self.config.cold_archive.mode {
            ColdArchiveMode::Skip => self.cold_cutoff(kind, now).and_then(|c| c.pred_opt()),
            ColdArchiveMode::Archived => None,
        }
    }

    /// First day a pass for `kind` has to cover.
    ///
    /// When cold data is skipped, the skipped days count as done so the
    /// watermark can move past them.
    pub fn origin(&self, kind: MetricKind, overall_start: NaiveDate, now: NaiveDate) -> NaiveDate {
        self.cold_floor(kind, now)
            .and_then(|floor| floor.succ_opt())
            .map_or(overall_start, |first| overall_start.max(first))
    }

    /// Ordered windows for one kind, oldest first.
    ///
    /// Without a watermark the windows exactly cover `overall_start..=overall_end`
    /// (minus skipped cold days). With one, fetching resumes the day after it,
    /// preceded by re-fetch windows for the trailing days before `now`.
    pub fn plan(
        &self,
        kind: MetricKind,
        overall_start: NaiveDate,
        overall_end: NaiveDate,
        watermark: Option<NaiveDate>,
        now: NaiveDate,
    ) -> Vec<FetchWindow> {
        if overall_end < overall_start {
            return Vec::new();
        }

        let mut segments: Vec<(NaiveDate, NaiveDate, bool)> = Vec::new();

        let fresh_start = match watermark {
            Some(w) if w >= overall_start => w.succ_opt().unwrap_or(w),
            _ => overall_start,
        };

        if let (Some(w), Some(days)) = (watermark, self.config.trailing_refetch_days.checked_sub(1)) {
            let trailing = now
                .checked_sub_signed(Duration::days(i64::from(days)))
                .unwrap_or(NaiveDate::MIN);
            let refetch_start = overall_start.max(trailing);
            let refetch_end = w.min(overall_end);
            if refetch_start <= refetch_end {
                segments.push((refetch_start, refetch_end, true));
            }
        }

        if fresh_start <= overall_end && fresh_start > watermark.unwrap_or(NaiveDate::MIN) {
            segments.push((fresh_start, overall_end, false));
        }

        let cutoff = self.cold_cutoff(kind, now);
        let span = i64::from(self.max_span(kind));
        let mut windows = Vec::new();

        for (start, end, refetch) in segments {
            for (seg_start, seg_end, archived) in split_cold(start, end, cutoff) {
                if archived && self.config.cold_archive.mode == ColdArchiveMode::Skip {
                    log::debug!("Skipping cold {} data {}..{}", kind, seg_start, seg_end);
                    continue;
                }
                let mut chunk_start = seg_start;
                while chunk_start <= seg_end {
                    let chunk_end = chunk_start
                        .checked_add_signed(Duration::days(span - 1))
                        .map_or(seg_end, |end| end.min(seg_end));
                    let mut window = FetchWindow::new(kind, chunk_start, chunk_end);
                    window.archived = archived;
                    window.refetch = refetch;
                    windows.push(window);
                    match chunk_end.succ_opt() {
                        Some(next) => chunk_start = next,
                        None => break,
                    }
                }
            }
        }

        windows
    }
}

/// Split a range at the cold cutoff into (start, end, cold) parts, oldest first
fn split_cold(
    start: NaiveDate,
    end: NaiveDate,
    cutoff: Option<NaiveDate>,
) -> Vec<(NaiveDate, NaiveDate, bool)> {
    match cutoff {
        Some(cutoff) if start < cutoff => {
            let last_cold = cutoff.pred_opt().unwrap_or(cutoff);
            if end < cutoff {
                vec![(start, end, true)]
            } else {
                vec![(start, last_cold, true), (cutoff, end, false)]
            }
        }
        _ => vec![(start, end, false)],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, m, day).unwrap()
    }

    fn planner(f: impl FnOnce(&mut PlannerConfig)) -> WindowPlanner {
        let mut config = PlannerConfig {
            trailing_refetch_days: 0,
            ..Default::default()
        };
        f(&mut config);
        WindowPlanner::new(config)
    }

    fn ranges(windows: &[FetchWindow]) -> Vec<(NaiveDate, NaiveDate)> {
        windows.iter().map(|w| (w.start, w.end)).collect()
    }

    #[test]
    fn test_daily_kind_three_day_span() {
        let p = planner(|c| {
            c.max_span_days.insert(MetricKind::DailyStats, 3);
        });
        let windows = p.plan(MetricKind::DailyStats, d(1, 1), d(1, 10), None, d(6, 1));
        assert_eq!(
            ranges(&windows),
            vec![
                (d(1, 1), d(1, 3)),
                (d(1, 4), d(1, 6)),
                (d(1, 7), d(1, 9)),
                (d(1, 10), d(1, 10)),
            ]
        );
        assert!(windows.iter().all(|w| !w.archived && !w.refetch));
    }

    #[test]
    fn test_windows_cover_range_without_gaps() {
        let p = planner(|_| {});
        for kind in MetricKind::ALL {
            let windows = p.plan(kind, d(2, 1), d(3, 15), None, d(3, 20));
            assert_eq!(windows.first().unwrap().start, d(2, 1), "{}", kind);
            assert_eq!(windows.last().unwrap().end, d(3, 15), "{}", kind);
            for pair in windows.windows(2) {
                assert_eq!(pair[0].end.succ_opt().unwrap(), pair[1].start, "{}", kind);
            }
            assert!(windows.iter().all(|w| w.days() <= i64::from(p.max_span(kind))));
        }
    }

    #[test]
    fn test_resume_after_watermark() {
        let p = planner(|_| {});
        let windows = p.plan(MetricKind::Sleep, d(1, 1), d(1, 5), Some(d(1, 3)), d(6, 1));
        assert_eq!(ranges(&windows), vec![(d(1, 4), d(1, 4)), (d(1, 5), d(1, 5))]);
    }

    #[test]
    fn test_watermark_before_start_is_ignored() {
        let p = planner(|_| {});
        let windows = p.plan(MetricKind::Sleep, d(1, 10), d(1, 11), Some(d(1, 1)), d(6, 1));
        assert_eq!(ranges(&windows), vec![(d(1, 10), d(1, 10)), (d(1, 11), d(1, 11))]);
    }

    #[test]
    fn test_fully_synced_plans_nothing() {
        let p = planner(|_| {});
        assert!(p
            .plan(MetricKind::Sleep, d(1, 1), d(1, 5), Some(d(1, 5)), d(6, 1))
            .is_empty());
    }

    #[test]
    fn test_trailing_refetch() {
        let p = planner(|c| c.trailing_refetch_days = 2);
        let windows = p.plan(MetricKind::Steps, d(1, 1), d(1, 10), Some(d(1, 9)), d(1, 10));
        assert_eq!(ranges(&windows), vec![(d(1, 9), d(1, 9)), (d(1, 10), d(1, 10))]);
        assert!(windows[0].refetch);
        assert!(!windows[1].refetch);
    }

    #[test]
    fn test_no_refetch_without_watermark() {
        let p = planner(|c| c.trailing_refetch_days = 2);
        let windows = p.plan(MetricKind::Steps, d(1, 9), d(1, 10), None, d(1, 10));
        assert!(windows.iter().all(|w| !w.refetch));
        assert_eq!(windows.len(), 2);
    }

    #[test]
    fn test_cold_intraday_flagged_archived() {
        let p = planner(|c| {
            c.cold_archive = ColdArchiveConfig {
                threshold_days: 10,
                mode: ColdArchiveMode::Archived,
            }
        });
        let now = d(1, 20);
        let windows = p.plan(MetricKind::HeartRate, d(1, 8), d(1, 12), None, now);
        let archived: Vec<bool> = windows.iter().map(|w| w.archived).collect();
        assert_eq!(archived, vec![true, true, false, false, false]);
        assert_eq!(p.cold_cutoff(MetricKind::HeartRate, now), Some(d(1, 10)));
    }

    #[test]
    fn test_cold_intraday_skipped() {
        let p = planner(|c| {
            c.cold_archive = ColdArchiveConfig {
                threshold_days: 10,
                mode: ColdArchiveMode::Skip,
            }
        });
        let now = d(1, 20);
        let windows = p.plan(MetricKind::Stress, d(1, 8), d(1, 12), None, now);
        assert_eq!(windows.first().unwrap().start, d(1, 10));
        assert_eq!(p.origin(MetricKind::Stress, d(1, 8), now), d(1, 10));
        assert_eq!(p.cold_floor(MetricKind::Stress, now), Some(d(1, 9)));
        assert_eq!(p.cold_floor(MetricKind::Sleep, now), None);
    }

    #[test]
    fn test_daily_kinds_never_cold() {
        let p = planner(|c| {
            c.cold_archive = ColdArchiveConfig {
                threshold_days: 1,
                mode: ColdArchiveMode::Skip,
            }
        });
        let windows = p.plan(MetricKind::Sleep, d(1, 1), d(1, 3), None, d(6, 1));
        assert_eq!(windows.len(), 3);
        assert!(windows.iter().all(|w| !w.archived));
    }

    #[test]
    fn test_plan_is_repeatable() {
        let p = planner(|c| c.trailing_refetch_days = 3);
        let a = p.plan(MetricKind::ActivitySummary, d(1, 1), d(4, 1), Some(d(2, 1)), d(3, 30));
        let b = p.plan(MetricKind::ActivitySummary, d(1, 1), d(4, 1), Some(d(2, 1)), d(3, 30));
        assert_eq!(a, b);
    }

    #[test]
    fn test_inverted_range_is_empty() {
        let p = planner(|_| {});
        assert!(p.plan(MetricKind::Sleep, d(1, 5), d(1, 1), None, d(6, 1)).is_empty());
    }

    #[test]
    fn test_extreme_day_counts_do_not_overflow() {
        let p = planner(|c| {
            c.cold_archive = ColdArchiveConfig {
                threshold_days: u32::MAX,
                mode: ColdArchiveMode::Skip,
            };
            c.trailing_refetch_days = u32::MAX;
            c.max_span_days.insert(MetricKind::HeartRate, u32::MAX);
        });
        assert_eq!(p.cold_cutoff(MetricKind::HeartRate, d(6, 1)), Some(NaiveDate::MIN));

        let windows = p.plan(MetricKind::HeartRate, d(1, 1), d(1, 2), None, d(6, 1));
        assert_eq!(ranges(&windows), vec![(d(1, 1), d(1, 2))]);

        let windows = p.plan(MetricKind::HeartRate, d(1, 1), d(1, 2), Some(d(1, 1)), d(6, 1));
        assert_eq!(ranges(&windows), vec![(d(1, 1), d(1, 1)), (d(1, 2), d(1, 2))]);
        assert!(windows[0].refetch);
    }

    #[test]
    fn test_range_ending_at_max_date_terminates() {
        let p = planner(|_| {});
        let start = NaiveDate::MAX.pred_opt().unwrap();
        let windows = p.plan(MetricKind::Sleep, start, NaiveDate::MAX, None, NaiveDate::MAX);
        assert_eq!(windows.len(), 2);
    }
}
