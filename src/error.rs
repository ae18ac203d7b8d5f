//! Unified SDK error types.

use thiserror::Error;

/// Top-level SDK error.
#[derive(Error, Debug)]
pub enum SdkError {
    #[error("HTTP error: {0}")]
    Http(#[from] HttpError),

    #[error("WebSocket error: {0}")]
    Ws(#[from] WsError),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// HTTP-layer errors.
#[derive(Error, Debug)]
pub enum HttpError {
    #[cfg(feature = "http")]
    #[error("Request failed: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("Server error {status}: {body}")]
    ServerError { status: u16, body: String },

    #[error("Rate limited (retry after {retry_after_ms:?}ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Timeout")]
    Timeout,

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("Max retries exceeded after {attempts} attempts: {last_error}")]
    MaxRetriesExceeded { attempts: u32, last_error: String },
}

/// WebSocket errors.
#[derive(Error, Debug)]
pub enum WsError {
    #[error("Not connected")]
    NotConnected,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}

/// Payload and label decoding errors.
///
/// Expected on real traffic: upstream feeds are flaky. The provider logs these
/// and degrades to "no update" instead of surfacing them.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("Empty payload")]
    Empty,

    #[error("No chart-like structure found")]
    Unrecognized,

    #[error("Invalid JSON: {0}")]
    Json(String),

    #[error("Unparseable label: {0}")]
    Label(String),

    #[error("Invalid value: {0}")]
    Value(String),

    #[error("Nesting deeper than {0} levels")]
    TooDeep(usize),
}

/// Cache storage errors. Never escape `ChartCache`; backends report them.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupted entry {key}: {reason}")]
    Corrupted { key: String, reason: String },
}

impl From<serde_json::Error> for ParseError {
    fn from(err: serde_json::Error) -> Self {
        ParseError::Json(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_errors_convert_into_sdk_error() {
        let ws: SdkError = WsError::NotConnected.into();
        assert_eq!(ws.to_string(), "WebSocket error: Not connected");
        let http: SdkError = HttpError::Timeout.into();
        assert!(matches!(http, SdkError::Http(HttpError::Timeout)));
    }

    #[test]
    fn test_json_errors_become_parse_errors() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(matches!(ParseError::from(err), ParseError::Json(_)));
    }
}
