//! Wire parser: turns whatever an upstream sent into a [`ChartBlock`] or a flat value list.
//!
//! Upstreams disagree on framing: some return `{labels, datasets}` nested under one
//! to three `data` envelopes, some return arrays of OHLC objects, and one stringifies a
//! chart template so the payload is `labels:[09:00,...], data:[...], data:[...]` text
//! that no JSON parser accepts. Parsing is an ordered chain of [`Strategy`]s tried on
//! each envelope candidate, then a bounded breadth-first search.

use super::wire::{label_from, number_from, parse_number, TIME_KEYS};
use super::{ChartBlock, Dataset, Label};
use crate::error::ParseError;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::VecDeque;

/// Deepest level the breadth-first search descends to.
pub const MAX_SEARCH_DEPTH: usize = 5;

/// Node budget for one breadth-first search.
const MAX_SEARCH_NODES: usize = 256;

/// How many JSON-encoded strings may be nested inside one another.
const MAX_TEXT_DEPTH: usize = 3;

/// `data` envelopes probed before searching.
const MAX_ENVELOPE_DEPTH: usize = 3;

lazy_static! {
    static ref LABELS_FRAGMENT: Regex =
        Regex::new(r#"(?s)\blabels["']?\s*:\s*\[(.*?)\]"#).expect("labels fragment regex");
    static ref DATA_FRAGMENT: Regex =
        Regex::new(r#"(?s)\bdata["']?\s*:\s*\[(.*?)\]"#).expect("data fragment regex");
    static ref NUMBER_TOKEN: Regex =
        Regex::new(r"-?\d+(?:\.\d+)?(?:[eE][-+]?\d+)?").expect("number regex");
    static ref BARE_KEY: Regex =
        Regex::new(r"([\{,]\s*)([A-Za-z_][A-Za-z0-9_]*)\s*:").expect("bare key regex");
    static ref TRAILING_COMMA: Regex = Regex::new(r",\s*([\]\}])").expect("trailing comma regex");
    static ref LABEL_TOKEN: Regex = Regex::new(
        r"\b\d{4}-\d{2}-\d{2}(?:[ T]\d{2}:\d{2}(?::\d{2})?)?\b|\b\d{1,2}:\d{2}(?::\d{2})?\b"
    )
    .expect("label token regex");
}

/// Output of the parser.
#[derive(Debug, Clone, PartialEq)]
pub enum Parsed {
    /// A labelled chart.
    Chart(ChartBlock),
    /// A bare value list with no usable label axis.
    Values(Vec<Option<f64>>),
}

impl Parsed {
    /// Number of rows.
    pub fn len(&self) -> usize {
        match self {
            Parsed::Chart(block) => block.common_len(),
            Parsed::Values(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// View a value list as a label-less single-dataset chart.
    pub fn into_chart(self) -> ChartBlock {
        match self {
            Parsed::Chart(block) => block,
            Parsed::Values(values) => ChartBlock::new(Vec::new(), vec![Dataset::new("value", values)]),
        }
    }
}

// ─── Strategies ──────────────────────────────────────────────────────────────

/// A typed recognizer for one known payload shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// `{labels?, datasets: [{label?, data}]}`
    ChartShape,
    /// `{prices: [...] | "...", labels?, amounts?}`
    PricesShape,
    /// `[{time, open, high, low, close}, ...]`
    CandleArray,
    /// `[3900.1, 3900.4, ...]`
    NumericArray,
}

impl Strategy {
    /// Priority order on envelope candidates.
    pub const ORDER: [Strategy; 4] = [
        Strategy::ChartShape,
        Strategy::PricesShape,
        Strategy::CandleArray,
        Strategy::NumericArray,
    ];

    /// Strategies specific enough to trust on arbitrary nested nodes.
    const SEARCHABLE: [Strategy; 3] = [
        Strategy::ChartShape,
        Strategy::PricesShape,
        Strategy::CandleArray,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Strategy::ChartShape => "chart",
            Strategy::PricesShape => "prices",
            Strategy::CandleArray => "candles",
            Strategy::NumericArray => "numeric",
        }
    }

    pub fn apply(&self, value: &Value) -> Result<Parsed, ParseError> {
        match self {
            Strategy::ChartShape => chart_shape(value),
            Strategy::PricesShape => prices_shape(value),
            Strategy::CandleArray => candle_array(value),
            Strategy::NumericArray => numeric_array(value),
        }
    }
}

fn chart_shape(value: &Value) -> Result<Parsed, ParseError> {
    let obj = value.as_object().ok_or(ParseError::Unrecognized)?;
    let raw = obj
        .get("datasets")
        .and_then(Value::as_array)
        .ok_or(ParseError::Unrecognized)?;

    let datasets: Vec<Dataset> = raw
        .iter()
        .filter_map(|d| {
            let values = values_from(d.get("data")?)?;
            let label = d.get("label").and_then(Value::as_str).unwrap_or_default();
            Some(Dataset::new(label, values))
        })
        .collect();

    if datasets.is_empty() {
        return Err(ParseError::Unrecognized);
    }

    let labels = obj.get("labels").map(labels_from).unwrap_or_default();
    let mut block = ChartBlock::new(labels, datasets);
    block.truncate_to_common();
    Ok(Parsed::Chart(block))
}

fn prices_shape(value: &Value) -> Result<Parsed, ParseError> {
    let obj = value.as_object().ok_or(ParseError::Unrecognized)?;
    let prices = obj.get("prices").ok_or(ParseError::Unrecognized)?;

    // A stringified template hiding behind the `prices` key.
    if let Value::String(text) = prices {
        if DATA_FRAGMENT.is_match(text) {
            return extract_fragments(text);
        }
    }

    let prices = values_from(prices).ok_or(ParseError::Unrecognized)?;
    let labels = first_key(obj, &["labels", "times", "dates"])
        .map(labels_from)
        .unwrap_or_default();

    let mut datasets = vec![Dataset::new("price", prices)];
    if let Some(amounts) = first_key(obj, &["amounts", "volumes", "amount", "volume"]).and_then(values_from) {
        datasets.push(Dataset::new("amount", amounts));
    }

    let mut block = ChartBlock::new(labels, datasets);
    block.truncate_to_common();
    Ok(Parsed::Chart(block))
}

fn candle_array(value: &Value) -> Result<Parsed, ParseError> {
    let items = value.as_array().ok_or(ParseError::Unrecognized)?;
    if items.is_empty() {
        return Err(ParseError::Unrecognized);
    }

    let mut labels = Vec::with_capacity(items.len());
    let mut columns: [Vec<Option<f64>>; 4] = Default::default();

    for item in items {
        let obj = item.as_object().ok_or(ParseError::Unrecognized)?;
        let fields = [
            first_key(obj, &["open", "o"]),
            first_key(obj, &["high", "h"]),
            first_key(obj, &["low", "l"]),
            first_key(obj, &["close", "c"]),
        ];
        if fields.iter().any(Option::is_none) {
            return Err(ParseError::Unrecognized);
        }
        let Some(label) = TIME_KEYS.iter().find_map(|k| obj.get(*k).and_then(label_from)) else {
            continue;
        };
        labels.push(label);
        for (column, field) in columns.iter_mut().zip(fields) {
            column.push(field.and_then(number_from));
        }
    }

    if labels.is_empty() {
        return Err(ParseError::Label("no candle carried a time".into()));
    }

    let [open, high, low, close] = columns;
    Ok(Parsed::Chart(ChartBlock::new(
        labels,
        vec![
            Dataset::new("open", open),
            Dataset::new("high", high),
            Dataset::new("low", low),
            Dataset::new("close", close),
        ],
    )))
}

fn numeric_array(value: &Value) -> Result<Parsed, ParseError> {
    let items = value.as_array().ok_or(ParseError::Unrecognized)?;
    let mut values = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Value::Null => values.push(None),
            Value::Number(_) | Value::String(_) => match number_from(item) {
                Some(v) => values.push(Some(v)),
                None => return Err(ParseError::Value(item.to_string())),
            },
            _ => return Err(ParseError::Unrecognized),
        }
    }
    if values.iter().all(Option::is_none) {
        return Err(ParseError::Empty);
    }
    Ok(Parsed::Values(values))
}

fn first_key<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| obj.get(*k))
}

/// Values from a JSON array or a comma-separated string. Unreadable entries become gaps.
fn values_from(value: &Value) -> Option<Vec<Option<f64>>> {
    match value {
        Value::Array(items) => Some(items.iter().map(number_from).collect()),
        Value::String(s) => Some(split_values(strip_brackets(s))),
        _ => None,
    }
}

/// Labels from a JSON array or a comma-separated string. Unreadable entries stay
/// in place as empty text so rows keep their alignment.
fn labels_from(value: &Value) -> Vec<Label> {
    match value {
        Value::Array(items) => items
            .iter()
            .map(|v| label_from(v).unwrap_or_else(|| Label::text("")))
            .collect(),
        Value::String(s) => split_labels(strip_brackets(s)),
        _ => Vec::new(),
    }
}

// ─── Entry points ────────────────────────────────────────────────────────────

/// Parse an already-decoded JSON payload (HTTP body or WS frame).
pub fn parse_payload(value: &Value) -> Result<Parsed, ParseError> {
    parse_value(value, 0)
}

/// Parse a raw text payload: JSON, JSON-encoded JSON, almost-JSON or template fragments.
pub fn parse_text(text: &str) -> Result<Parsed, ParseError> {
    parse_text_at(text, 0, true)
}

fn parse_value(value: &Value, text_depth: usize) -> Result<Parsed, ParseError> {
    if value.is_null() {
        return Err(ParseError::Empty);
    }

    let mut last_err = ParseError::Unrecognized;
    for candidate in envelope_candidates(value) {
        let attempt = match candidate {
            Value::String(s) => parse_text_at(s, text_depth + 1, false),
            other => try_strategies(other, &Strategy::ORDER),
        };
        match attempt {
            Ok(parsed) => return Ok(parsed),
            Err(ParseError::TooDeep(d)) => return Err(ParseError::TooDeep(d)),
            Err(e) => last_err = e,
        }
    }

    search(value, text_depth).map_err(|e| match e {
        ParseError::Unrecognized => last_err,
        other => other,
    })
}

/// The value itself, its `data` envelopes, then every `result` entry.
fn envelope_candidates(value: &Value) -> Vec<&Value> {
    let mut out = vec![value];
    let mut current = value;
    for _ in 0..MAX_ENVELOPE_DEPTH {
        match current.get("data") {
            Some(next) if !next.is_null() => {
                out.push(next);
                current = next;
            }
            _ => break,
        }
    }
    match value.get("result") {
        Some(Value::Array(items)) => out.extend(items.iter()),
        Some(other) if !other.is_null() => out.push(other),
        _ => {}
    }
    out
}

fn try_strategies(value: &Value, strategies: &[Strategy]) -> Result<Parsed, ParseError> {
    let mut last_err = ParseError::Unrecognized;
    for strategy in strategies {
        match strategy.apply(value) {
            Ok(parsed) => {
                tracing::trace!(strategy = strategy.name(), rows = parsed.len(), "payload recognized");
                return Ok(parsed);
            }
            Err(e) => last_err = e,
        }
    }
    Err(last_err)
}

/// Breadth-first search for the first nested node a specific strategy accepts.
fn search(root: &Value, text_depth: usize) -> Result<Parsed, ParseError> {
    let mut queue: VecDeque<(&Value, usize)> = VecDeque::from([(root, 0)]);
    let mut visited = 0usize;

    while let Some((node, depth)) = queue.pop_front() {
        visited += 1;
        if visited > MAX_SEARCH_NODES {
            tracing::debug!("payload search gave up after {} nodes", MAX_SEARCH_NODES);
            break;
        }

        if depth > 0 {
            let attempt = match node {
                Value::String(s) if looks_structured(s) => parse_text_at(s, text_depth + 1, false),
                Value::Object(_) | Value::Array(_) => try_strategies(node, &Strategy::SEARCHABLE),
                _ => Err(ParseError::Unrecognized),
            };
            if let Ok(parsed) = attempt {
                return Ok(parsed);
            }
        }

        if depth >= MAX_SEARCH_DEPTH {
            continue;
        }
        match node {
            Value::Object(map) => queue.extend(map.values().map(|v| (v, depth + 1))),
            Value::Array(items) => queue.extend(items.iter().map(|v| (v, depth + 1))),
            _ => {}
        }
    }

    Err(ParseError::Unrecognized)
}

fn looks_structured(s: &str) -> bool {
    s.contains('[') || s.contains('{')
}

fn parse_text_at(text: &str, depth: usize, lenient: bool) -> Result<Parsed, ParseError> {
    if depth > MAX_TEXT_DEPTH {
        return Err(ParseError::TooDeep(MAX_TEXT_DEPTH));
    }
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(ParseError::Empty);
    }

    // Plain JSON, or JSON that was itself encoded as a JSON string.
    let mut is_json = false;
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        is_json = true;
        match value {
            Value::String(inner) => return parse_text_at(&inner, depth + 1, lenient),
            Value::Null => return Err(ParseError::Empty),
            other => {
                if let Ok(parsed) = parse_value(&other, depth) {
                    return Ok(parsed);
                }
            }
        }
    }

    // A template dump with repeated `data` keys would lose its first series to a
    // JSON object, so fragments go first unless real datasets are present.
    let fragments_first = DATA_FRAGMENT.is_match(trimmed) && !trimmed.contains("datasets");
    if fragments_first {
        if let Ok(parsed) = extract_fragments(trimmed) {
            return Ok(parsed);
        }
    }

    if !is_json {
        let repaired = repair_json(trimmed);
        match serde_json::from_str::<Value>(&repaired) {
            Ok(value) => {
                is_json = true;
                if let Ok(parsed) = parse_value(&value, depth) {
                    return Ok(parsed);
                }
            }
            Err(e) => tracing::trace!("almost-JSON repair did not parse: {}", e),
        }
    }

    if !fragments_first {
        if let Ok(parsed) = extract_fragments(trimmed) {
            return Ok(parsed);
        }
    }

    // Well-formed JSON without a chart shape is not a chart.
    if lenient && !is_json {
        return scan_tokens(trimmed);
    }

    Err(ParseError::Unrecognized)
}

/// Last resort for text no parser accepts: bare labels and bare numbers.
///
/// Labels come from a `labels:[...]` fragment when one exists, otherwise from
/// time-shaped tokens. Label text is removed before numbers are scanned so a
/// `09:00` never turns into two values.
fn scan_tokens(text: &str) -> Result<Parsed, ParseError> {
    let (labels, rest) = match LABELS_FRAGMENT.captures(text).and_then(|c| c.get(1)) {
        Some(inner) => (
            split_labels(inner.as_str()),
            LABELS_FRAGMENT.replace_all(text, " ").into_owned(),
        ),
        None => (
            LABEL_TOKEN
                .find_iter(text)
                .map(|m| Label::text(m.as_str()))
                .collect(),
            LABEL_TOKEN.replace_all(text, " ").into_owned(),
        ),
    };

    let mut values: Vec<Option<f64>> = NUMBER_TOKEN
        .find_iter(&rest)
        .filter_map(|m| parse_number(m.as_str()))
        .map(Some)
        .collect();
    if values.is_empty() {
        return Err(ParseError::Unrecognized);
    }
    if labels.is_empty() {
        return Ok(Parsed::Values(values));
    }

    let mut labels = labels;
    let n = labels.len().min(values.len());
    labels.truncate(n);
    values.truncate(n);
    Ok(Parsed::Chart(ChartBlock::new(labels, vec![Dataset::new("price", values)])))
}

// ─── Text repair ─────────────────────────────────────────────────────────────

/// Best-effort rewrite of JavaScript-ish object text into JSON.
pub fn repair_json(text: &str) -> String {
    let mut t = text.trim();
    let wrapped = t.len() >= 2
        && ((t.starts_with('"') && t.ends_with('"')) || (t.starts_with('\'') && t.ends_with('\'')));
    if wrapped {
        t = &t[1..t.len() - 1];
    }

    let unescaped = t
        .replace("\\\"", "\"")
        .replace("\\'", "'")
        .replace("\\n", " ")
        .replace("\\r", " ")
        .replace("\\t", " ")
        .replace('\'', "\"");

    let keyed = BARE_KEY.replace_all(&unescaped, r#"$1"$2":"#);
    let cleaned = TRAILING_COMMA.replace_all(&keyed, "$1").trim().to_string();

    if !(cleaned.starts_with('{') || cleaned.starts_with('[')) && cleaned.contains(':') {
        // Keys at the very start have no `{` or `,` before them.
        let braced = format!("{{{}}}", cleaned);
        BARE_KEY.replace_all(&braced, r#"$1"$2":"#).into_owned()
    } else {
        cleaned
    }
}

/// Pull `labels: [...]` and the first two `data: [...]` arrays out of template text.
///
/// The first `data` array is the price series and the second the traded amount.
/// All present arrays are truncated to their common length.
pub fn extract_fragments(text: &str) -> Result<Parsed, ParseError> {
    let labels = LABELS_FRAGMENT
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| split_labels(m.as_str()))
        .ok_or(ParseError::Unrecognized)?;

    let mut data = DATA_FRAGMENT
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| split_values(m.as_str()));

    let mut prices = data.next().ok_or(ParseError::Unrecognized)?;
    let mut amounts = data.next();

    let n = [Some(labels.len()), Some(prices.len()), amounts.as_ref().map(Vec::len)]
        .into_iter()
        .flatten()
        .min()
        .unwrap_or(0);

    let mut labels = labels;
    labels.truncate(n);
    prices.truncate(n);

    let mut datasets = vec![Dataset::new("price", prices)];
    if let Some(mut amounts) = amounts.take() {
        amounts.truncate(n);
        datasets.push(Dataset::new("amount", amounts));
    }

    Ok(Parsed::Chart(ChartBlock::new(labels, datasets)))
}

fn strip_brackets(s: &str) -> &str {
    s.trim().trim_start_matches('[').trim_end_matches(']')
}

fn split_items(s: &str) -> impl Iterator<Item = &str> {
    s.split(',')
        .map(|item| item.trim().trim_matches(|c| c == '"' || c == '\'').trim())
}

fn split_values(s: &str) -> Vec<Option<f64>> {
    if s.trim().is_empty() {
        return Vec::new();
    }
    split_items(s).map(parse_number).collect()
}

fn split_labels(s: &str) -> Vec<Label> {
    if s.trim().is_empty() {
        return Vec::new();
    }
    split_items(s)
        .map(|item| match item.parse::<i64>() {
            Ok(t) => Label::Time(t),
            Err(_) => Label::text(item),
        })
        .collect()
}
