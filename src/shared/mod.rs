//! Shared newtypes and utilities used across all modules.
//!
//! These types are serialization-transparent: they serialize/deserialize identically
//! to the raw format the upstream feeds send, so they can be used directly in wire
//! types without conversion overhead.

pub mod clock;

pub use clock::{Clock, ManualClock, SystemClock};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::str::FromStr;
use std::time::Duration;

// ─── ChartId ─────────────────────────────────────────────────────────────────

/// Newtype for a logical channel id (e.g. `1000` for the live price feed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChartId(u32);

impl ChartId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for ChartId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ChartId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl Serialize for ChartId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u32(self.0)
    }
}

impl<'de> Deserialize<'de> for ChartId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        // Some channels echo the id back as a string.
        let value = serde_json::Value::deserialize(deserializer)?;
        match &value {
            serde_json::Value::Number(n) => n
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .map(ChartId)
                .ok_or_else(|| serde::de::Error::custom(format!("Invalid chart id: {}", n))),
            serde_json::Value::String(s) => s
                .trim()
                .parse::<u32>()
                .map(ChartId)
                .map_err(|_| serde::de::Error::custom(format!("Invalid chart id: {}", s))),
            other => Err(serde::de::Error::custom(format!(
                "Invalid chart id: {}",
                other
            ))),
        }
    }
}

// ─── ChartKind ───────────────────────────────────────────────────────────────

/// What a channel carries, which decides how its series is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChartKind {
    LivePrice,
    LiveVolume,
    Line,
    Candles,
    Bollinger,
    Average,
}

impl ChartKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LivePrice => "price",
            Self::LiveVolume => "volume",
            Self::Line => "line",
            Self::Candles => "candles",
            Self::Bollinger => "bollinger",
            Self::Average => "average",
        }
    }

    /// Whether the tick value of interest is the traded amount rather than the price.
    pub fn reads_volume(&self) -> bool {
        matches!(self, Self::LiveVolume)
    }
}

impl std::fmt::Display for ChartKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Channel table used when the provider is built without overrides.
pub const DEFAULT_CHANNELS: [(ChartId, ChartKind); 6] = [
    (ChartId::new(1000), ChartKind::LivePrice),
    (ChartId::new(1001), ChartKind::LiveVolume),
    (ChartId::new(1002), ChartKind::Line),
    (ChartId::new(1003), ChartKind::Candles),
    (ChartId::new(1004), ChartKind::Bollinger),
    (ChartId::new(1005), ChartKind::Average),
];

// ─── RangeKey ────────────────────────────────────────────────────────────────

/// Display range selector. Governs the trailing window, cache TTL and bucketing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RangeKey {
    #[default]
    #[serde(rename = "1D")]
    Day1,
    #[serde(rename = "5D")]
    Day5,
    #[serde(rename = "1M")]
    Month1,
    #[serde(rename = "6M")]
    Month6,
    #[serde(rename = "1A", alias = "1Y")]
    Year1,
}

impl RangeKey {
    pub const ALL: [RangeKey; 5] = [
        RangeKey::Day1,
        RangeKey::Day5,
        RangeKey::Month1,
        RangeKey::Month6,
        RangeKey::Year1,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Day1 => "1D",
            Self::Day5 => "5D",
            Self::Month1 => "1M",
            Self::Month6 => "6M",
            Self::Year1 => "1A",
        }
    }

    /// Trailing window length in days.
    pub fn days(&self) -> i64 {
        match self {
            Self::Day1 => 1,
            Self::Day5 => 5,
            Self::Month1 => 30,
            Self::Month6 => 182,
            Self::Year1 => 365,
        }
    }

    /// How long a cached series for this range stays fresh.
    pub fn cache_ttl(&self) -> Duration {
        match self {
            Self::Day1 => Duration::from_secs(5 * 60),
            Self::Day5 => Duration::from_secs(30 * 60),
            Self::Month1 => Duration::from_secs(2 * 3600),
            Self::Month6 => Duration::from_secs(6 * 3600),
            Self::Year1 => Duration::from_secs(12 * 3600),
        }
    }

    /// Spacing used when labels are useless and timestamps must be synthesized.
    pub fn synthetic_interval_secs(&self) -> i64 {
        match self {
            Self::Day1 => 300,
            Self::Day5 => 1800,
            Self::Month1 => 3600,
            Self::Month6 => 43_200,
            Self::Year1 => 86_400,
        }
    }

    /// Candle width for this range.
    pub fn candle_bucket_secs(&self) -> i64 {
        match self {
            Self::Day1 => 60,
            Self::Day5 => 900,
            Self::Month1 => 3600,
            Self::Month6 => 14_400,
            Self::Year1 => 86_400,
        }
    }

    pub fn is_intraday(&self) -> bool {
        matches!(self, Self::Day1)
    }
}

impl std::fmt::Display for RangeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RangeKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "1D" => Ok(Self::Day1),
            "5D" => Ok(Self::Day5),
            "1M" => Ok(Self::Month1),
            "6M" => Ok(Self::Month6),
            "1A" | "1Y" => Ok(Self::Year1),
            other => Err(format!("Unknown range: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chart_id_serde_number() {
        let id = ChartId::new(1002);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "1002");
        let back: ChartId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_chart_id_accepts_numeric_string() {
        let id: ChartId = serde_json::from_str("\"1004\"").unwrap();
        assert_eq!(id.get(), 1004);
        assert!(serde_json::from_str::<ChartId>("\"abc\"").is_err());
        assert!(serde_json::from_str::<ChartId>("-3").is_err());
    }

    #[test]
    fn test_range_key_serde() {
        let r: RangeKey = serde_json::from_str("\"6M\"").unwrap();
        assert_eq!(r, RangeKey::Month6);
        let y: RangeKey = serde_json::from_str("\"1Y\"").unwrap();
        assert_eq!(y, RangeKey::Year1);
        assert_eq!(serde_json::to_string(&RangeKey::Year1).unwrap(), "\"1A\"");
    }

    #[test]
    fn test_range_key_from_str() {
        assert_eq!("1d".parse::<RangeKey>().unwrap(), RangeKey::Day1);
        assert_eq!(" 5D ".parse::<RangeKey>().unwrap(), RangeKey::Day5);
        assert!("2W".parse::<RangeKey>().is_err());
    }

    #[test]
    fn test_range_key_tables() {
        let days: Vec<_> = RangeKey::ALL.iter().map(|r| r.days()).collect();
        assert_eq!(days, [1, 5, 30, 182, 365]);
        assert_eq!(RangeKey::Day1.cache_ttl(), Duration::from_secs(300));
        assert_eq!(RangeKey::Year1.cache_ttl(), Duration::from_secs(43_200));
        assert_eq!(RangeKey::Day1.candle_bucket_secs(), 60);
        assert_eq!(RangeKey::Year1.candle_bucket_secs(), 86_400);
        assert!(RangeKey::Day1.is_intraday());
        assert!(!RangeKey::Day5.is_intraday());
    }

    #[test]
    fn test_chart_kind_keys() {
        assert_eq!(ChartKind::LivePrice.as_str(), "price");
        assert_eq!(ChartKind::Bollinger.to_string(), "bollinger");
        assert!(ChartKind::LiveVolume.reads_volume());
        assert!(!ChartKind::Line.reads_volume());
    }
}
