//! Ordering, deduplication and range windows over point lists.
//!
//! Tie-break rule, applied everywhere points are merged: when two points share
//! a timestamp the one that arrived last wins.

use super::time::TimeNormalizer;
use super::Point;
use crate::shared::RangeKey;
use chrono::{DateTime, Utc};

const SECS_PER_DAY: i64 = 86_400;

/// Sort ascending by time and keep the last-arriving point of each timestamp.
pub fn sort_dedup(mut points: Vec<Point>) -> Vec<Point> {
    // Stable, so arrival order survives inside a run of equal times.
    points.sort_by_key(|p| p.time);

    let mut out: Vec<Point> = Vec::with_capacity(points.len());
    for p in points {
        match out.last_mut() {
            Some(last) if last.time == p.time => *last = p,
            _ => out.push(p),
        }
    }
    out
}

/// Restrict `points` to the window `range` shows.
///
/// `1D` is the zone's calendar day containing `now`, so intraday charts reset at
/// local midnight. Longer ranges trail the newest point by `range.days()`.
pub fn filter_range(
    points: &[Point],
    range: RangeKey,
    normalizer: &TimeNormalizer,
    now: DateTime<Utc>,
) -> Vec<Point> {
    if range.is_intraday() {
        let (start, end) = normalizer.day_bounds(now);
        return points
            .iter()
            .filter(|p| p.time >= start && p.time <= end)
            .copied()
            .collect();
    }

    let Some(newest) = points.iter().map(|p| p.time).max() else {
        return Vec::new();
    };
    let from = newest - range.days() * SECS_PER_DAY;
    points.iter().filter(|p| p.time >= from).copied().collect()
}

/// [`sort_dedup`] then [`filter_range`]. Idempotent.
pub fn normalize_series(
    points: Vec<Point>,
    range: RangeKey,
    normalizer: &TimeNormalizer,
    now: DateTime<Utc>,
) -> Vec<Point> {
    filter_range(&sort_dedup(points), range, normalizer, now)
}

pub fn is_strictly_ascending(points: &[Point]) -> bool {
    points.windows(2).all(|w| w[0].time < w[1].time)
}
