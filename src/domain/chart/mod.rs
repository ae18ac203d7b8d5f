//! Chart domain: points, candles, chart blocks and the pipeline that produces them.
//!
//! Data flows `wire`/`parser` → `time` → `series`/`filter` → `state`, with
//! `convert` gluing the stages together for the provider.

pub mod convert;
pub mod filter;
pub mod parser;
pub mod series;
pub mod state;
pub mod time;
pub mod wire;

use serde::{Deserialize, Serialize};

pub use parser::{parse_payload, parse_text, Parsed};
pub use series::{BollingerBands, BollingerParams, SeriesSummary};
pub use state::{StreamingBuffer, TickOutcome};
pub use time::TimeNormalizer;

/// One sample of a series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Unix timestamp in seconds.
    pub time: i64,
    pub value: f64,
}

impl Point {
    pub fn new(time: i64, value: f64) -> Self {
        Self { time, value }
    }
}

/// An open/high/low/close bar starting at `time`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Bucket start, Unix seconds.
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

impl Candle {
    /// A candle opened by a single value.
    pub fn opened_at(time: i64, value: f64) -> Self {
        Self {
            time,
            open: value,
            high: value,
            low: value,
            close: value,
        }
    }

    /// Fold another value into the bar as its latest close.
    pub fn absorb(&mut self, value: f64) {
        self.high = self.high.max(value);
        self.low = self.low.min(value);
        self.close = value;
    }

    /// `low <= min(open, close) <= max(open, close) <= high`.
    pub fn is_consistent(&self) -> bool {
        self.low <= self.open.min(self.close) && self.open.max(self.close) <= self.high
    }
}

/// An axis label as the upstream sent it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Label {
    Time(i64),
    Number(f64),
    Text(String),
}

impl Label {
    pub fn text(s: impl Into<String>) -> Self {
        Label::Text(s.into())
    }
}

impl From<&str> for Label {
    fn from(s: &str) -> Self {
        Label::Text(s.to_string())
    }
}

impl From<i64> for Label {
    fn from(t: i64) -> Self {
        Label::Time(t)
    }
}

/// One named value series inside a [`ChartBlock`]. `None` marks a gap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    #[serde(default)]
    pub label: String,
    pub data: Vec<Option<f64>>,
}

impl Dataset {
    pub fn new(label: impl Into<String>, data: Vec<Option<f64>>) -> Self {
        Self {
            label: label.into(),
            data,
        }
    }

    pub fn from_values(label: impl Into<String>, values: &[f64]) -> Self {
        Self::new(
            label,
            values
                .iter()
                .map(|v| if v.is_finite() { Some(*v) } else { None })
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// `{ labels, datasets }`: the shape rendering components consume and most
/// endpoints return at some nesting depth.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChartBlock {
    #[serde(default)]
    pub labels: Vec<Label>,
    #[serde(default)]
    pub datasets: Vec<Dataset>,
}

impl ChartBlock {
    pub fn new(labels: Vec<Label>, datasets: Vec<Dataset>) -> Self {
        Self { labels, datasets }
    }

    pub fn dataset(&self, label: &str) -> Option<&Dataset> {
        self.datasets
            .iter()
            .find(|d| d.label.eq_ignore_ascii_case(label))
    }

    /// Primary numeric series (the first dataset).
    pub fn prices(&self) -> Option<&Dataset> {
        self.datasets.first()
    }

    /// Secondary numeric series: a dataset labelled amount/volume, else the second one.
    pub fn amounts(&self) -> Option<&Dataset> {
        self.dataset("amount")
            .or_else(|| self.dataset("amounts"))
            .or_else(|| self.dataset("volume"))
            .or_else(|| self.datasets.get(1))
    }

    /// Whether the block carries open/high/low/close datasets.
    pub fn is_ohlc(&self) -> bool {
        ["open", "high", "low", "close"]
            .iter()
            .all(|name| self.dataset(name).is_some())
    }

    /// Number of rows every dataset and the label axis can agree on.
    /// An absent label axis does not constrain the length.
    pub fn common_len(&self) -> usize {
        let labels = (!self.labels.is_empty()).then_some(self.labels.len());
        self.datasets
            .iter()
            .map(Dataset::len)
            .chain(labels)
            .min()
            .unwrap_or(0)
    }

    /// Truncate labels and datasets to [`common_len`](Self::common_len).
    pub fn truncate_to_common(&mut self) {
        let n = self.common_len();
        self.labels.truncate(n);
        for dataset in &mut self.datasets {
            dataset.data.truncate(n);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.datasets.iter().all(Dataset::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_untagged_serde() {
        let labels: Vec<Label> = serde_json::from_str(r#"[1700000000, "09:00", 1.5]"#).unwrap();
        assert_eq!(labels[0], Label::Time(1_700_000_000));
        assert_eq!(labels[1], Label::text("09:00"));
        assert_eq!(labels[2], Label::Number(1.5));
    }

    #[test]
    fn test_chart_block_serde_with_gaps() {
        let block = ChartBlock::new(
            vec![Label::Time(60), Label::Time(120)],
            vec![Dataset::new("SMA 20", vec![None, Some(3900.5)])],
        );
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["datasets"][0]["data"][0], serde_json::Value::Null);
        let back: ChartBlock = serde_json::from_value(json).unwrap();
        assert_eq!(back, block);
    }

    #[test]
    fn test_truncate_to_common() {
        let mut block = ChartBlock::new(
            vec!["a".into(), "b".into(), "c".into(), "d".into(), "e".into()],
            vec![Dataset::from_values("price", &[1.0, 2.0, 3.0])],
        );
        block.truncate_to_common();
        assert_eq!(block.labels.len(), 3);
        assert_eq!(block.prices().unwrap().len(), 3);
    }

    #[test]
    fn test_amounts_prefers_named_dataset() {
        let block = ChartBlock::new(
            vec![],
            vec![
                Dataset::from_values("price", &[1.0]),
                Dataset::from_values("other", &[2.0]),
                Dataset::from_values("Volume", &[3.0]),
            ],
        );
        assert_eq!(block.amounts().unwrap().label, "Volume");
    }

    #[test]
    fn test_candle_absorb_keeps_invariant() {
        let mut candle = Candle::opened_at(0, 10.0);
        candle.absorb(12.0);
        candle.absorb(9.0);
        candle.absorb(11.0);
        assert_eq!(candle.open, 10.0);
        assert_eq!(candle.high, 12.0);
        assert_eq!(candle.low, 9.0);
        assert_eq!(candle.close, 11.0);
        assert!(candle.is_consistent());
    }
}
