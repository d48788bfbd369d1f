//! Watermark advancement over the committed-window ledger
//!
//! Windows may commit out of order (a failed window is skipped in lenient
//! mode while later ones succeed). The watermark only moves across a
//! contiguous run of committed days, so it never passes a gap.

use chrono::NaiveDate;

/// Furthest day reachable from `current` through contiguous committed ranges.
///
/// `origin` is the first day that has to be covered at all; days before it
/// count as committed. Returns `None` when there was no watermark and nothing
/// contiguous from `origin` is committed yet.
pub fn advance_frontier(
    current: Option<NaiveDate>,
    origin: NaiveDate,
    ledger: &[(NaiveDate, NaiveDate)],
) -> Option<NaiveDate> {
    let floor = origin.pred_opt().unwrap_or(origin);
    let mut frontier = current.map_or(floor, |c| c.max(floor));

    let mut ranges = ledger.to_vec();
    ranges.sort();
    for (start, end) in ranges {
        let next = frontier.succ_opt().unwrap_or(frontier);
        if start > next {
            break;
        }
        frontier = frontier.max(end);
    }

    if current.is_none() && frontier == floor {
        None
    } else {
        Some(frontier)
    }
}

/// Whether a window is already fully covered by a committed range
pub fn is_committed(start: NaiveDate, end: NaiveDate, ledger: &[(NaiveDate, NaiveDate)]) -> bool {
    ledger.iter().any(|(s, e)| *s <= start && end <= *e)
}
