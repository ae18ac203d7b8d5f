//! Streaming buffer: app-owned, SDK-provided update logic.

use super::Point;
use std::collections::{HashSet, VecDeque};

/// 24 hours of minute buckets.
pub const DEFAULT_CAPACITY: usize = 1440;

const BUCKET_SECS: i64 = 60;

/// What a [`StreamingBuffer::push`] did with a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// A new minute bucket was added.
    Inserted,
    /// An existing minute bucket was overwritten.
    Updated,
    /// Non-finite, or older than everything a full buffer keeps.
    Rejected,
}

/// Live ticks bucketed to the minute, kept ascending and bounded.
///
/// Buckets filled by [`merge_snapshot`](Self::merge_snapshot) stay correctable
/// by later snapshots until a tick lands in them.
///
/// The app owns instances of this type. The SDK provides update methods.
#[derive(Debug, Clone)]
pub struct StreamingBuffer {
    points: VecDeque<Point>,
    /// Minutes that received at least one tick.
    live: HashSet<i64>,
    capacity: usize,
}

impl Default for StreamingBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

fn bucket(time: i64) -> i64 {
    time.div_euclid(BUCKET_SECS) * BUCKET_SECS
}

impl StreamingBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            points: VecDeque::with_capacity(capacity),
            live: HashSet::new(),
            capacity,
        }
    }

    /// Record a tick. Last write wins within a minute.
    pub fn push(&mut self, time: i64, value: f64) -> TickOutcome {
        if !value.is_finite() {
            tracing::debug!(time, "rejecting non-finite tick");
            return TickOutcome::Rejected;
        }

        let minute = bucket(time);
        match self.points.binary_search_by_key(&minute, |p| p.time) {
            Ok(i) => {
                self.points[i].value = value;
                self.live.insert(minute);
                TickOutcome::Updated
            }
            Err(i) => {
                self.points.insert(i, Point::new(minute, value));
                self.live.insert(minute);
                match self.evict() {
                    Some(oldest) if oldest.time == minute => TickOutcome::Rejected,
                    _ => TickOutcome::Inserted,
                }
            }
        }
    }

    /// Fill minutes the live stream has not covered. Returns how many were added.
    ///
    /// Minutes that received a tick keep their live value. Minutes an earlier
    /// snapshot filled take the newer snapshot value.
    pub fn merge_snapshot(&mut self, points: &[Point]) -> usize {
        let mut added = 0;

        for p in points {
            if !p.value.is_finite() {
                continue;
            }
            let minute = bucket(p.time);
            if self.live.contains(&minute) {
                continue;
            }
            match self.points.binary_search_by_key(&minute, |q| q.time) {
                Ok(i) => self.points[i].value = p.value,
                Err(i) => {
                    self.points.insert(i, Point::new(minute, p.value));
                    added += 1;
                }
            }
        }

        while self.evict().is_some() {}
        added
    }

    /// Replace all points (e.g. rehydrating from cache). The new points count
    /// as snapshot data.
    pub fn replace(&mut self, points: &[Point]) {
        self.clear();
        self.merge_snapshot(points);
    }

    /// Whether the minute containing `time` received a tick.
    pub fn is_live(&self, time: i64) -> bool {
        self.live.contains(&bucket(time))
    }

    pub fn points(&self) -> Vec<Point> {
        self.points.iter().copied().collect()
    }

    pub fn last(&self) -> Option<&Point> {
        self.points.back()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn clear(&mut self) {
        self.points.clear();
        self.live.clear();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn evict(&mut self) -> Option<Point> {
        if self.points.len() <= self.capacity {
            return None;
        }
        let oldest = self.points.pop_front()?;
        self.live.remove(&oldest.time);
        Some(oldest)
    }
}
