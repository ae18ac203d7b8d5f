//! # USD/COP chart data
//!
//! Turns the messy chart feeds of a USD/COP market backend into clean,
//! renderable series: wire parsing, time normalization, range filtering,
//! live buffers, SMA/Bollinger overlays, candles, and cached snapshots.
//!
//! ## Architecture
//!
//! The SDK is organized in layers:
//!
//! 1. **Core**: Shared types, the chart pipeline, the cache (always available)
//! 2. **HTTP API**: `ChartHttp` with snapshot retry policies
//! 3. **WebSocket**: Message types always; `tokio-tungstenite` transport behind `ws-native`
//! 4. **Provider**: `ChartProvider`, the composition root rendering code talks to
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use usdcop_charts::prelude::*;
//!
//! let provider = ChartProvider::builder()
//!     .base_url("https://charts.example.com")
//!     .build()?;
//!
//! let req = provider.request(ChartId::new(1002), RangeKey::Day1, RequestParams::default()).await;
//! ws.send(req.message)?;
//! provider.fetch_snapshot(req.chart_id, req.range, &RequestParams::default()).await;
//!
//! let series = provider.get_series(ChartId::new(1002), RangeKey::Day1).await;
//! ```

// ── Layer 1: Core ────────────────────────────────────────────────────────────

/// Shared newtypes, range keys and the clock.
pub mod shared;

/// The chart pipeline: types, wire parser, time normalizer, series, buffers.
pub mod domain;

/// Series cache with range-dependent expiry and intraday rollover.
pub mod cache;

/// Unified SDK error types.
pub mod error;

/// Network URL constants.
pub mod network;

// ── Layer 2: HTTP API ────────────────────────────────────────────────────────

/// HTTP client with retry policies.
#[cfg(feature = "http")]
pub mod http;

// ── Layer 3: WebSocket ───────────────────────────────────────────────────────

/// WebSocket client: messages, subscriptions, events.
pub mod ws;

// ── Layer 4: Provider ────────────────────────────────────────────────────────

/// `ChartProvider`: the primary entry point.
#[cfg(feature = "http")]
pub mod provider;

// ── Prelude ──────────────────────────────────────────────────────────────────

pub mod prelude {
    // Shared types
    pub use crate::shared::{
        ChartId, ChartKind, Clock, ManualClock, RangeKey, SystemClock, DEFAULT_CHANNELS,
    };

    // Chart pipeline
    pub use crate::domain::chart::wire::RequestParams;
    pub use crate::domain::chart::{
        parse_payload, parse_text, BollingerBands, BollingerParams, Candle, ChartBlock, Dataset,
        Label, Parsed, Point, SeriesSummary, StreamingBuffer, TickOutcome, TimeNormalizer,
    };

    // Cache
    pub use crate::cache::{CacheStore, CachedData, ChartCache, FileStore, MemoryStore};

    // Errors
    pub use crate::error::SdkError;

    // Network
    pub use crate::network::{DEFAULT_API_URL, DEFAULT_WS_URL};

    // HTTP client + provider
    #[cfg(feature = "http")]
    pub use crate::http::{ChartHttp, RetryConfig, RetryPolicy};
    #[cfg(feature = "http")]
    pub use crate::provider::{
        ChartProvider, ChartProviderBuilder, ChartRequest, Phase, SnapshotOutcome,
    };

    // WebSocket types
    pub use crate::ws::{
        ChannelBody, ChannelMessage, MessageIn, MessageOut, ReadyState, SubscribeParams, WsConfig,
        WsEvent,
    };
    #[cfg(feature = "ws-native")]
    pub use crate::ws::native::WsClient;
}
