//! WebSocket layer: messages, subscriptions, events.
//!
//! The transport lives behind the `ws-native` feature (`tokio-tungstenite`,
//! native.rs). This module defines the message and event types shared with the
//! provider, which only ever sees [`WsEvent`]s and hands back [`MessageOut`]s.

pub mod subscriptions;

#[cfg(feature = "ws-native")]
pub mod native;

use crate::domain::chart::wire::{RequestParams, WsEnvelope};
use crate::error::WsError;
use crate::shared::{ChartId, RangeKey};
use serde::Serialize;
use serde_json::Value;

pub use subscriptions::{SubscribeParams, SubscriptionSet};

// ─── Outbound messages ───────────────────────────────────────────────────────

/// Messages sent from client to server.
///
/// A request serialises flat: `{"id": 1002, "range": "1D", "instrument": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MessageOut {
    Request(SubscribeParams),
}

impl MessageOut {
    pub fn request(id: ChartId, range: RangeKey, params: RequestParams) -> Self {
        MessageOut::Request(SubscribeParams { id, range, params })
    }

    pub fn chart_id(&self) -> ChartId {
        match self {
            MessageOut::Request(p) => p.id,
        }
    }
}

// ─── Inbound messages ────────────────────────────────────────────────────────

/// Raw inbound frame: `{ id, data? , result? }`.
pub type MessageIn = WsEnvelope;

/// What an inbound frame carried.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelBody {
    /// `data`: usually a single tick, sometimes a whole chart.
    Data(Value),
    /// `result`: chart blobs, often stringified templates.
    Result(Value),
    /// Neither field present (acks, keep-alives).
    Empty,
}

/// A decoded frame for one logical channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMessage {
    pub id: ChartId,
    pub body: ChannelBody,
}

impl ChannelMessage {
    pub fn new(id: ChartId, body: ChannelBody) -> Self {
        Self { id, body }
    }

    /// Decode a text frame.
    pub fn from_text(text: &str) -> Result<Self, WsError> {
        let envelope: MessageIn = serde_json::from_str(text)
            .map_err(|e| WsError::DeserializationError(e.to_string()))?;
        Ok(envelope.into())
    }
}

impl From<MessageIn> for ChannelMessage {
    fn from(env: MessageIn) -> Self {
        let body = match (env.result, env.data) {
            (Some(result), _) if !result.is_null() => ChannelBody::Result(result),
            (_, Some(data)) if !data.is_null() => ChannelBody::Data(data),
            _ => ChannelBody::Empty,
        };
        Self { id: env.id, body }
    }
}

// ─── WsEvent ─────────────────────────────────────────────────────────────────

/// High-level events emitted by the WS client to the consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum WsEvent {
    /// A decoded channel frame.
    Message(ChannelMessage),
    /// Connection established.
    Connected,
    /// Connection lost (may trigger reconnect).
    Disconnected { code: Option<u16>, reason: String },
    /// A deserialization or protocol error.
    Error(String),
    /// Reconnection gave up; no more events will follow.
    MaxReconnectReached,
}

/// Configuration for the WS client.
#[derive(Debug, Clone)]
pub struct WsConfig {
    pub url: String,
    /// Short-lived token from `GET /api/ws/token`, sent as `?token=`.
    pub token: Option<String>,
    pub reconnect: bool,
    pub max_reconnect_attempts: u32,
    pub base_reconnect_delay_ms: u32,
    pub ping_interval_ms: u32,
    pub pong_timeout_ms: u32,
    pub connect_timeout_ms: u64,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            url: crate::network::DEFAULT_WS_URL.to_string(),
            token: None,
            reconnect: true,
            max_reconnect_attempts: 10,
            base_reconnect_delay_ms: 1000,
            ping_interval_ms: 30_000,
            pong_timeout_ms: 10_000,
            connect_timeout_ms: 5_000,
        }
    }
}

impl WsConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// The URL to dial, token included.
    pub fn endpoint(&self) -> String {
        match &self.token {
            Some(token) => {
                let sep = if self.url.contains('?') { '&' } else { '?' };
                format!("{}{}token={}", self.url, sep, urlencoding::encode(token))
            }
            None => self.url.clone(),
        }
    }
}

/// Connection state, mirroring the browser `WebSocket.readyState` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ReadyState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl From<u16> for ReadyState {
    fn from(v: u16) -> Self {
        match v {
            0 => ReadyState::Connecting,
            1 => ReadyState::Open,
            2 => ReadyState::Closing,
            _ => ReadyState::Closed,
        }
    }
}
