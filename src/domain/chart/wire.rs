//! Wire types for chart feeds (REST + WS) and the lenient scalar readers they need.

use super::Label;
use crate::error::ParseError;
use crate::shared::ChartId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Keys that carry a point's time across the feeds we consume.
pub(crate) const TIME_KEYS: [&str; 7] = ["time", "t", "date", "label", "timestamp", "hour", "x"];

/// Keys that carry a tick's price, in order of preference.
pub(crate) const VALUE_KEYS: [&str; 7] = ["close", "price", "value", "c", "avg", "last", "y"];

/// Keys that carry a tick's traded amount.
pub(crate) const VOLUME_KEYS: [&str; 3] = ["amount", "volume", "v"];

/// WS message envelope: `{ id, data }` for ticks, `{ id, result: [...] }` for chart blobs.
#[derive(Deserialize, Debug, Clone)]
pub struct WsEnvelope {
    pub id: ChartId,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
}

/// Extra chart parameters sent upstream with a snapshot or subscribe request.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct RequestParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instrument: Option<String>,
    /// Moving-average window for band charts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<u32>,
    /// Band width in standard deviations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deviation: Option<f64>,
}

impl RequestParams {
    pub fn instrument(instrument: impl Into<String>) -> Self {
        Self {
            instrument: Some(instrument.into()),
            ..Default::default()
        }
    }

    pub fn with_bands(mut self, window: u32, deviation: f64) -> Self {
        self.window = Some(window);
        self.deviation = Some(deviation);
        self
    }

    /// `&key=value` pairs for the present fields, values URL-encoded.
    pub fn query_string(&self) -> String {
        let mut out = String::new();
        if let Some(instrument) = &self.instrument {
            out.push_str(&format!("&instrument={}", urlencoding::encode(instrument)));
        }
        if let Some(window) = self.window {
            out.push_str(&format!("&window={}", window));
        }
        if let Some(deviation) = self.deviation {
            out.push_str(&format!("&deviation={}", deviation));
        }
        out
    }
}

/// A single live update before time normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct RawTick {
    pub label: Label,
    pub value: f64,
    pub volume: Option<f64>,
}

impl RawTick {
    /// Read a tick object such as `{"time": "09:01", "close": 3905}`.
    pub fn from_value(value: &Value) -> Result<Self, ParseError> {
        let obj = match value {
            Value::Object(obj) => obj,
            Value::String(s) => {
                let inner: Value = serde_json::from_str(s)?;
                return match inner {
                    Value::Object(_) => Self::from_value(&inner),
                    _ => Err(ParseError::Unrecognized),
                };
            }
            Value::Null => return Err(ParseError::Empty),
            _ => return Err(ParseError::Unrecognized),
        };

        let label = TIME_KEYS
            .iter()
            .find_map(|k| obj.get(*k).and_then(label_from))
            .ok_or_else(|| ParseError::Label("missing time field".into()))?;

        let volume = VOLUME_KEYS.iter().find_map(|k| obj.get(*k).and_then(number_from));
        let price = VALUE_KEYS.iter().find_map(|k| obj.get(*k).and_then(number_from));

        // A volume-only tick still carries something worth buffering.
        let value = price
            .or(volume)
            .ok_or_else(|| ParseError::Value("missing value field".into()))?;

        Ok(Self {
            label,
            value,
            volume,
        })
    }

    /// Whether an object looks like a single tick rather than a chart.
    pub fn looks_like_tick(value: &Value) -> bool {
        match value {
            Value::Object(obj) => {
                TIME_KEYS.iter().any(|k| obj.contains_key(*k))
                    && VALUE_KEYS
                        .iter()
                        .chain(VOLUME_KEYS.iter())
                        .any(|k| obj.contains_key(*k))
                    && !obj.contains_key("datasets")
                    && !obj.contains_key("labels")
            }
            _ => false,
        }
    }
}

/// Read a number or a numeric string. Thousands separators are tolerated.
pub fn number_from(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|v| v.is_finite()),
        Value::String(s) => parse_number(s),
        _ => None,
    }
}

/// Parse a numeric token, tolerating surrounding quotes/space and `1,234.5` grouping.
pub fn parse_number(raw: &str) -> Option<f64> {
    let s = raw.trim().trim_matches(|c| c == '"' || c == '\'').trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(v) = s.parse::<f64>() {
        return v.is_finite().then_some(v);
    }
    if s.contains(',') && s.contains('.') {
        let ungrouped: String = s.chars().filter(|c| *c != ',').collect();
        if let Ok(v) = ungrouped.parse::<f64>() {
            return v.is_finite().then_some(v);
        }
    }
    None
}

/// Read a label: integers stay integral, other numbers stay numeric, strings are trimmed.
pub fn label_from(value: &Value) -> Option<Label> {
    match value {
        Value::Number(n) => match n.as_i64() {
            Some(i) => Some(Label::Time(i)),
            None => n.as_f64().map(Label::Number),
        },
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| Label::Text(trimmed.to_string()))
        }
        _ => None,
    }
}
