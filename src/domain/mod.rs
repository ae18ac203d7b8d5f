//! Domain modules organized as vertical slices.
//!
//! `chart` contains:
//! - `mod.rs`: Points, candles, labels and chart blocks
//! - `wire.rs`: Raw feed envelopes, ticks and lenient scalar readers
//! - `parser.rs`: Ordered strategy chain from any payload to a chart block
//! - `time.rs`, `filter.rs`, `series.rs`: Normalization, windows, overlays
//! - `convert.rs`: Blocks to canonical points/candles and back
//! - `state.rs`: The streaming buffer (for WS-driven data)

pub mod chart;
