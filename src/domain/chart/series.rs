//! Series assembly and derived overlays.
//!
//! Everything here is pure and recomputed in full from the canonical point
//! list on each update. Nothing is patched incrementally.

use super::{Candle, Point};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Round to 2 decimals, the precision the overlays are displayed at.
pub fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Pair times with values by index, dropping gaps and non-finite values.
pub fn zip(times: &[Option<i64>], values: &[Option<f64>]) -> Vec<Point> {
    times
        .iter()
        .zip(values)
        .filter_map(|(t, v)| match (t, v) {
            (Some(t), Some(v)) if v.is_finite() => Some(Point::new(*t, *v)),
            _ => None,
        })
        .collect()
}

pub fn values_of(points: &[Point]) -> Vec<f64> {
    points.iter().map(|p| p.value).collect()
}

/// Simple moving average over a trailing window, `None` until the window fills.
pub fn sma(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    if period == 0 {
        return out;
    }

    let mut sum = 0.0;
    for (i, v) in values.iter().enumerate() {
        sum += v;
        if i >= period {
            sum -= values[i - period];
        }
        if i + 1 >= period {
            out[i] = Some(round2(sum / period as f64));
        }
    }
    out
}

/// Bollinger band configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BollingerParams {
    pub period: usize,
    /// Standard deviations between the middle and each band.
    pub k: f64,
}

impl BollingerParams {
    pub fn new(period: usize, k: f64) -> Self {
        Self { period, k }
    }

    /// 20-period SMA with 2 standard deviations.
    pub fn standard() -> Self {
        Self::new(20, 2.0)
    }

    /// Dataset label of the middle band, e.g. `SMA 20`.
    pub fn middle_label(&self) -> String {
        format!("SMA {}", self.period)
    }
}

impl Default for BollingerParams {
    fn default() -> Self {
        Self::standard()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BollingerBands {
    pub middle: Vec<Option<f64>>,
    pub upper: Vec<Option<f64>>,
    pub lower: Vec<Option<f64>>,
}

/// Bollinger bands over the same trailing window as [`sma`].
///
/// Uses the population standard deviation. Bands are rounded around the
/// already-rounded middle so `lower <= middle <= upper` holds exactly.
pub fn bollinger(values: &[f64], params: BollingerParams) -> BollingerBands {
    let n = values.len();
    let mut bands = BollingerBands {
        middle: vec![None; n],
        upper: vec![None; n],
        lower: vec![None; n],
    };
    let period = params.period;
    if period == 0 {
        return bands;
    }

    let k = params.k.abs();
    let (mut sum, mut sum_sq) = (0.0, 0.0);
    for (i, v) in values.iter().enumerate() {
        sum += v;
        sum_sq += v * v;
        if i >= period {
            let old = values[i - period];
            sum -= old;
            sum_sq -= old * old;
        }
        if i + 1 < period {
            continue;
        }

        let mean = sum / period as f64;
        let variance = (sum_sq / period as f64 - mean * mean).max(0.0);
        let width = k * variance.sqrt();
        let middle = round2(mean);

        bands.middle[i] = Some(middle);
        bands.upper[i] = Some(round2(middle + width));
        bands.lower[i] = Some(round2(middle - width));
    }
    bands
}

/// Bucket points into OHLC candles of `bucket_secs`.
///
/// Points must be ascending: the first value in a bucket opens it and the last closes it.
pub fn to_candles(points: &[Point], bucket_secs: i64) -> Vec<Candle> {
    if bucket_secs <= 0 {
        return Vec::new();
    }

    let mut buckets: BTreeMap<i64, Candle> = BTreeMap::new();
    for p in points {
        let start = p.time.div_euclid(bucket_secs) * bucket_secs;
        buckets
            .entry(start)
            .and_modify(|c| c.absorb(p.value))
            .or_insert_with(|| Candle::opened_at(start, p.value));
    }
    buckets.into_values().collect()
}

/// Headline statistics for a series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeriesSummary {
    pub open: f64,
    pub close: f64,
    pub high: f64,
    pub low: f64,
    pub average: f64,
    pub change: f64,
    /// Percentage change from open, `0` when the open is zero.
    pub change_pct: f64,
    pub count: usize,
    pub first_time: i64,
    pub last_time: i64,
}

pub fn summarize(points: &[Point]) -> Option<SeriesSummary> {
    let first = points.first()?;
    let last = points.last()?;

    let (mut high, mut low, mut sum) = (f64::MIN, f64::MAX, 0.0);
    for p in points {
        high = high.max(p.value);
        low = low.min(p.value);
        sum += p.value;
    }

    let change = last.value - first.value;
    let change_pct = if first.value != 0.0 {
        change / first.value * 100.0
    } else {
        0.0
    };

    Some(SeriesSummary {
        open: first.value,
        close: last.value,
        high,
        low,
        average: round2(sum / points.len() as f64),
        change: round2(change),
        change_pct: round2(change_pct),
        count: points.len(),
        first_time: first.time,
        last_time: last.time,
    })
}
