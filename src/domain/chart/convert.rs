//! Conversions between parsed chart blocks, canonical points and rendered blocks.

use super::filter::sort_dedup;
use super::series::{bollinger, values_of, zip, BollingerParams};
use super::time::TimeNormalizer;
use super::wire::RawTick;
use super::{Candle, ChartBlock, Dataset, Label, Point};
use crate::error::ParseError;
use crate::shared::{ChartKind, RangeKey};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Label-axis times for a block: normalized labels, or synthesized ones when
/// the block has no label axis.
fn block_times(
    block: &ChartBlock,
    rows: usize,
    normalizer: &TimeNormalizer,
    range: RangeKey,
    now: DateTime<Utc>,
) -> Vec<Option<i64>> {
    if block.labels.is_empty() {
        normalizer
            .synthesize(rows, range, now)
            .into_iter()
            .map(Some)
            .collect()
    } else {
        normalizer.normalize_batch(&block.labels[..rows.min(block.labels.len())], range, now)
    }
}

/// The series a chart kind plots out of a parsed block.
fn primary<'a>(block: &'a ChartBlock, kind: ChartKind) -> Option<&'a Dataset> {
    if kind.reads_volume() {
        return block.amounts().or_else(|| block.prices());
    }
    block.dataset("close").or_else(|| block.prices())
}

/// Canonical ascending-unique points for `kind` out of a parsed block.
pub fn block_points(
    block: &ChartBlock,
    kind: ChartKind,
    normalizer: &TimeNormalizer,
    range: RangeKey,
    now: DateTime<Utc>,
) -> Vec<Point> {
    let Some(dataset) = primary(block, kind) else {
        return Vec::new();
    };
    let rows = block.common_len();
    let times = block_times(block, rows, normalizer, range, now);
    sort_dedup(zip(&times, &dataset.data[..rows.min(dataset.len())]))
}

/// Candles out of an OHLC block. Rows missing a field are dropped; rows that
/// break `low <= open, close <= high` are widened to hold.
pub fn block_candles(
    block: &ChartBlock,
    normalizer: &TimeNormalizer,
    range: RangeKey,
    now: DateTime<Utc>,
) -> Vec<Candle> {
    let (Some(open), Some(high), Some(low), Some(close)) = (
        block.dataset("open"),
        block.dataset("high"),
        block.dataset("low"),
        block.dataset("close"),
    ) else {
        return Vec::new();
    };

    let rows = block.common_len();
    let times = block_times(block, rows, normalizer, range, now);

    let mut by_time: BTreeMap<i64, Candle> = BTreeMap::new();
    for (i, time) in times.iter().enumerate() {
        let fields = (time, open.data[i], high.data[i], low.data[i], close.data[i]);
        let (Some(time), Some(o), Some(h), Some(l), Some(c)) = fields else {
            continue;
        };
        if ![o, h, l, c].iter().all(|v| v.is_finite()) {
            continue;
        }
        by_time.insert(
            *time,
            Candle {
                time: *time,
                open: o,
                high: h.max(o).max(c),
                low: l.min(o).min(c),
                close: c,
            },
        );
    }
    by_time.into_values().collect()
}

/// Time and value of a live tick for `kind`.
pub fn tick_point(
    tick: &RawTick,
    kind: ChartKind,
    normalizer: &TimeNormalizer,
    now: DateTime<Utc>,
) -> Result<Point, ParseError> {
    let time = normalizer.normalize(&tick.label, now)?;
    let value = if kind.reads_volume() {
        tick.volume.unwrap_or(tick.value)
    } else {
        tick.value
    };
    Ok(Point::new(time, value))
}

// ─── Rendered blocks ─────────────────────────────────────────────────────────

fn time_labels(times: impl Iterator<Item = i64>) -> Vec<Label> {
    times.map(Label::Time).collect()
}

/// A single-dataset block.
pub fn line_block(points: &[Point], label: &str) -> ChartBlock {
    ChartBlock::new(
        time_labels(points.iter().map(|p| p.time)),
        vec![Dataset::new(label, points.iter().map(|p| Some(p.value)).collect())],
    )
}

/// Price plus the middle, upper and lower bands.
pub fn bollinger_block(points: &[Point], params: BollingerParams) -> ChartBlock {
    let bands = bollinger(&values_of(points), params);
    ChartBlock::new(
        time_labels(points.iter().map(|p| p.time)),
        vec![
            Dataset::new("price", points.iter().map(|p| Some(p.value)).collect()),
            Dataset::new(params.middle_label(), bands.middle),
            Dataset::new("upper", bands.upper),
            Dataset::new("lower", bands.lower),
        ],
    )
}

impl From<&[Candle]> for ChartBlock {
    fn from(candles: &[Candle]) -> Self {
        let column = |f: fn(&Candle) -> f64| -> Vec<Option<f64>> {
            candles.iter().map(|c| Some(f(c))).collect()
        };
        ChartBlock::new(
            time_labels(candles.iter().map(|c| c.time)),
            vec![
                Dataset::new("open", column(|c| c.open)),
                Dataset::new("high", column(|c| c.high)),
                Dataset::new("low", column(|c| c.low)),
                Dataset::new("close", column(|c| c.close)),
            ],
        )
    }
}

/// Overlay candles built from live ticks onto snapshot candles.
///
/// Where both cover a bucket the snapshot keeps its open, high and low widen
/// to cover both, and the live close wins.
pub fn merge_candles(snapshot: &[Candle], live: &[Candle]) -> Vec<Candle> {
    let mut by_time: BTreeMap<i64, Candle> = snapshot.iter().map(|c| (c.time, *c)).collect();
    for c in live {
        by_time
            .entry(c.time)
            .and_modify(|s| {
                s.high = s.high.max(c.high);
                s.low = s.low.min(c.low);
                s.close = c.close;
            })
            .or_insert(*c);
    }
    by_time.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 15, 15, 0, 0).unwrap()
    }

    #[test]
    fn test_block_points_from_template() {
        let block = ChartBlock::new(
            vec![Label::text("09:01"), Label::text("09:00"), Label::text("bad")],
            vec![
                Dataset::from_values("price", &[3905.0, 3900.0, 1.0]),
                Dataset::from_values("amount", &[20.0, 10.0, 5.0]),
            ],
        );
        let n = TimeNormalizer::default();
        let prices = block_points(&block, ChartKind::Line, &n, RangeKey::Day1, now());
        assert_eq!(prices.len(), 2);
        assert_eq!(prices[0].value, 3900.0);
        assert_eq!(prices[1].time - prices[0].time, 60);

        let volumes = block_points(&block, ChartKind::LiveVolume, &n, RangeKey::Day1, now());
        assert_eq!(volumes[0].value, 10.0);
    }

    #[test]
    fn test_block_points_without_labels_are_synthesized() {
        let block = ChartBlock::new(vec![], vec![Dataset::from_values("value", &[1.0, 2.0, 3.0])]);
        let points = block_points(
            &block,
            ChartKind::Line,
            &TimeNormalizer::default(),
            RangeKey::Day5,
            now(),
        );
        assert_eq!(points.len(), 3);
        assert_eq!(points[2].time, now().timestamp());
        assert_eq!(points[1].time, now().timestamp() - 1800);
    }

    #[test]
    fn test_block_candles_repairs_invariant() {
        let block = ChartBlock::new(
            vec![Label::Time(120), Label::Time(60)],
            vec![
                Dataset::from_values("open", &[10.0, 5.0]),
                Dataset::from_values("high", &[9.0, 6.0]),
                Dataset::from_values("low", &[11.0, 4.0]),
                Dataset::from_values("close", &[12.0, 5.5]),
            ],
        );
        let candles = block_candles(&block, &TimeNormalizer::default(), RangeKey::Day1, now());
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].time, 60);
        assert_eq!(candles[1], Candle { time: 120, open: 10.0, high: 12.0, low: 10.0, close: 12.0 });
        assert!(candles.iter().all(Candle::is_consistent));
    }

    #[test]
    fn test_tick_point_reads_volume_for_volume_kind() {
        let tick = RawTick::from_value(&json!({"t": 1_700_000_040, "close": 3901, "volume": 7})).unwrap();
        let n = TimeNormalizer::default();
        assert_eq!(
            tick_point(&tick, ChartKind::LiveVolume, &n, now()).unwrap(),
            Point::new(1_700_000_040, 7.0)
        );
        assert_eq!(tick_point(&tick, ChartKind::LivePrice, &n, now()).unwrap().value, 3901.0);
    }

    #[test]
    fn test_bollinger_block_shape() {
        let points: Vec<Point> = (0..25).map(|i| Point::new(i * 60, 3900.0 + i as f64)).collect();
        let block = bollinger_block(&points, BollingerParams::standard());
        let names: Vec<&str> = block.datasets.iter().map(|d| d.label.as_str()).collect();
        assert_eq!(names, ["price", "SMA 20", "upper", "lower"]);
        assert_eq!(block.labels.len(), 25);
        assert!(block.dataset("SMA 20").unwrap().data[18].is_none());
        assert!(block.dataset("SMA 20").unwrap().data[19].is_some());
    }

    #[test]
    fn test_merge_candles_keeps_invariants() {
        let snapshot = [
            Candle { time: 0, open: 10.0, high: 12.0, low: 9.0, close: 11.0 },
            Candle { time: 60, open: 11.0, high: 11.5, low: 10.5, close: 11.2 },
        ];
        let live = [
            Candle { time: 60, open: 11.3, high: 13.0, low: 11.1, close: 12.5 },
            Candle { time: 120, open: 12.5, high: 12.6, low: 12.4, close: 12.4 },
        ];
        let merged = merge_candles(&snapshot, &live);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[1], Candle { time: 60, open: 11.0, high: 13.0, low: 10.5, close: 12.5 });
        assert!(merged.iter().all(Candle::is_consistent));
    }

    #[test]
    fn test_candle_block_round_trip_to_candles() {
        let candles = vec![Candle::opened_at(60, 1.0), Candle::opened_at(120, 2.0)];
        let block = ChartBlock::from(candles.as_slice());
        assert!(block.is_ohlc());
        let back = block_candles(&block, &TimeNormalizer::default(), RangeKey::Day1, now());
        assert_eq!(back, candles);
    }
}
