//! Label → epoch-seconds normalization anchored to a fixed civil time zone.
//!
//! Intraday labels such as `"09:30"` carry no date; they mean "today, in the
//! market's zone", never the host's zone. Bare dates are anchored at noon so a
//! UTC conversion cannot push them across a day boundary.

use super::Label;
use crate::error::ParseError;
use crate::shared::RangeKey;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

/// Zone of the USD/COP spot market.
pub const DEFAULT_ZONE: Tz = chrono_tz::America::Bogota;

/// Epoch values above this are milliseconds.
const MILLIS_THRESHOLD: i64 = 1_000_000_000_000;

const TIME_FORMATS: [&str; 2] = ["%H:%M:%S", "%H:%M"];

const DATETIME_FORMATS: [&str; 9] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%Y/%m/%d %H:%M",
];

const DATE_FORMATS: [&str; 6] = [
    "%Y-%m-%d",
    "%d/%m/%Y",
    "%Y/%m/%d",
    "%b %d, %Y",
    "%B %d, %Y",
    "%d %b %Y",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeNormalizer {
    zone: Tz,
}

impl Default for TimeNormalizer {
    fn default() -> Self {
        Self::new(DEFAULT_ZONE)
    }
}

impl TimeNormalizer {
    pub fn new(zone: Tz) -> Self {
        Self { zone }
    }

    pub fn zone(&self) -> Tz {
        self.zone
    }

    /// Normalize one label to epoch seconds.
    pub fn normalize(&self, label: &Label, now: DateTime<Utc>) -> Result<i64, ParseError> {
        match label {
            Label::Time(t) => Ok(from_epoch(*t)),
            Label::Number(v) => epoch_from_f64(*v).ok_or_else(|| ParseError::Label(v.to_string())),
            Label::Text(s) => self.normalize_text(s, now),
        }
    }

    fn normalize_text(&self, raw: &str, now: DateTime<Utc>) -> Result<i64, ParseError> {
        let s = raw.trim();
        if s.is_empty() {
            return Err(ParseError::Label("empty label".into()));
        }

        if let Ok(t) = s.parse::<i64>() {
            return Ok(from_epoch(t));
        }
        if let Ok(v) = s.parse::<f64>() {
            if let Some(t) = epoch_from_f64(v) {
                return Ok(t);
            }
        }

        for fmt in TIME_FORMATS {
            if let Ok(time) = NaiveTime::parse_from_str(s, fmt) {
                return self
                    .local(&self.today(now).and_time(time))
                    .ok_or_else(|| ParseError::Label(s.to_string()));
            }
        }

        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Ok(dt.timestamp());
        }

        for fmt in DATETIME_FORMATS {
            if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
                return self.local(&naive).ok_or_else(|| ParseError::Label(s.to_string()));
            }
        }

        for fmt in DATE_FORMATS {
            if let Ok(date) = NaiveDate::parse_from_str(s, fmt) {
                return self.noon(date).ok_or_else(|| ParseError::Label(s.to_string()));
            }
        }

        if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
            return Ok(dt.timestamp());
        }

        Err(ParseError::Label(s.to_string()))
    }

    /// Normalize a label axis for `range`.
    ///
    /// A batch whose labels are all identical is a known upstream echo bug; its
    /// times are synthesized from position instead. Unparseable labels become `None`.
    pub fn normalize_batch(
        &self,
        labels: &[Label],
        range: RangeKey,
        now: DateTime<Utc>,
    ) -> Vec<Option<i64>> {
        if labels.len() >= 2 && labels.iter().all(|l| l == &labels[0]) {
            tracing::debug!(
                count = labels.len(),
                range = %range,
                "all labels identical, synthesizing times"
            );
            return self.synthesize(labels.len(), range, now).into_iter().map(Some).collect();
        }

        labels
            .iter()
            .map(|label| match self.normalize(label, now) {
                Ok(t) => Some(t),
                Err(e) => {
                    tracing::debug!("dropping point: {}", e);
                    None
                }
            })
            .collect()
    }

    /// `n` ascending times ending at `now`, spaced by the range's interval.
    pub fn synthesize(&self, n: usize, range: RangeKey, now: DateTime<Utc>) -> Vec<i64> {
        let end = now.timestamp();
        let step = range.synthetic_interval_secs();
        (0..n)
            .map(|i| end - (n - i - 1) as i64 * step)
            .collect()
    }

    /// Calendar date of `now` in the zone.
    pub fn today(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.zone).date_naive()
    }

    /// Calendar date of an epoch-seconds instant in the zone.
    pub fn civil_date(&self, epoch_secs: i64) -> Option<NaiveDate> {
        Utc.timestamp_opt(epoch_secs, 0)
            .single()
            .map(|dt| dt.with_timezone(&self.zone).date_naive())
    }

    /// First and last second of the zone's calendar day containing `now`.
    pub fn day_bounds(&self, now: DateTime<Utc>) -> (i64, i64) {
        let today = self.today(now);
        let start = today
            .and_hms_opt(0, 0, 0)
            .and_then(|dt| self.local(&dt))
            .unwrap_or_else(|| now.timestamp() - now.timestamp().rem_euclid(86_400));
        let end = today
            .succ_opt()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .and_then(|dt| self.local(&dt))
            .unwrap_or(start + 86_400);
        (start, end - 1)
    }

    fn local(&self, naive: &NaiveDateTime) -> Option<i64> {
        self.zone
            .from_local_datetime(naive)
            .earliest()
            .map(|dt| dt.timestamp())
    }

    fn noon(&self, date: NaiveDate) -> Option<i64> {
        date.and_hms_opt(12, 0, 0).and_then(|dt| self.local(&dt))
    }
}

fn from_epoch(t: i64) -> i64 {
    if t > MILLIS_THRESHOLD {
        t / 1000
    } else {
        t
    }
}

fn epoch_from_f64(v: f64) -> Option<i64> {
    if !v.is_finite() {
        return None;
    }
    let secs = if v > MILLIS_THRESHOLD as f64 { v / 1000.0 } else { v };
    Some(secs.floor() as i64)
}
