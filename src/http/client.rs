//! Low-level HTTP client: `ChartHttp`.
//!
//! One method per endpoint. Snapshot bodies come back as raw JSON values (or a
//! JSON string holding the raw text when the body is not JSON); shape handling
//! is the parser's job, not this layer's.

use crate::domain::chart::wire::RequestParams;
use crate::error::HttpError;
use crate::http::retry::RetryPolicy;
use crate::shared::{ChartId, RangeKey};

use async_lock::RwLock;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Per-request timeout for snapshot and token calls.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
}

/// Low-level HTTP client for the chart API.
#[derive(Clone)]
pub struct ChartHttp {
    base_url: String,
    client: Client,
    retry: RetryPolicy,
    /// Last WS token handed out, reused until refreshed.
    ws_token: Arc<RwLock<Option<String>>>,
}

impl ChartHttp {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, HttpError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .pool_max_idle_per_host(4)
            .build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            retry: RetryPolicy::Snapshot,
            ws_token: Arc::new(RwLock::new(None)),
        })
    }

    /// Replace the retry policy used for snapshot requests.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    // ── Charts ───────────────────────────────────────────────────────────

    /// `GET /api/charts/{id}?range=..` plus any request params.
    pub async fn get_chart(
        &self,
        chart_id: ChartId,
        range: RangeKey,
        params: &RequestParams,
    ) -> Result<Value, HttpError> {
        let url = format!(
            "{}/api/charts/{}?range={}{}",
            self.base_url,
            chart_id,
            range.as_str(),
            params.query_string()
        );
        let body = self.get_text(&url, self.retry.clone()).await?;
        Ok(serde_json::from_str(&body).unwrap_or(Value::String(body)))
    }

    // ── WS token ─────────────────────────────────────────────────────────

    /// Fetch a fresh WS token from `GET /api/ws/token`.
    pub async fn get_ws_token(&self) -> Result<String, HttpError> {
        let url = format!("{}/api/ws/token", self.base_url);
        let body = self.get_text(&url, RetryPolicy::None).await?;

        let token = match serde_json::from_str::<TokenResponse>(&body) {
            Ok(resp) => resp.token,
            Err(_) => match serde_json::from_str::<String>(&body) {
                Ok(token) => token,
                Err(_) => body.trim().to_string(),
            },
        };
        if token.is_empty() {
            return Err(HttpError::UnexpectedResponse("empty ws token".into()));
        }

        *self.ws_token.write().await = Some(token.clone());
        Ok(token)
    }

    /// The last token fetched, or a fresh one.
    pub async fn ws_token(&self) -> Result<String, HttpError> {
        if let Some(token) = self.ws_token.read().await.as_ref() {
            return Ok(token.clone());
        }
        self.get_ws_token().await
    }

    /// Forget the cached token (e.g. after the WS rejected it).
    pub async fn clear_ws_token(&self) {
        *self.ws_token.write().await = None;
    }

    // ── Internal HTTP methods ────────────────────────────────────────────

    async fn get_text(&self, url: &str, retry: RetryPolicy) -> Result<String, HttpError> {
        let Some(config) = retry.config() else {
            return self.do_request(url).await;
        };

        let mut last_error = None;

        for attempt in 0..=config.max_retries {
            match self.do_request(url).await {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    let should_retry = match &e {
                        HttpError::ServerError { status, .. } => {
                            config.retryable_statuses.contains(status)
                        }
                        HttpError::RateLimited { retry_after_ms } => {
                            if let Some(ms) = retry_after_ms {
                                futures_timer::Delay::new(Duration::from_millis(*ms)).await;
                            }
                            config.retryable_statuses.contains(&429)
                        }
                        HttpError::Timeout => true,
                        HttpError::Reqwest(re) => re.is_connect() || re.is_request(),
                        _ => false,
                    };

                    if should_retry && attempt < config.max_retries {
                        let delay = config.delay_for_attempt(attempt);
                        tracing::debug!(
                            attempt = attempt + 1,
                            max = config.max_retries,
                            delay_ms = delay.as_millis() as u64,
                            "Retrying request to {}",
                            url
                        );
                        futures_timer::Delay::new(delay).await;
                        last_error = Some(e);
                    } else {
                        return Err(e);
                    }
                }
            }
        }

        Err(HttpError::MaxRetriesExceeded {
            attempts: config.max_retries + 1,
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        })
    }

    async fn do_request(&self, url: &str) -> Result<String, HttpError> {
        let resp = self.client.get(url).send().await.map_err(transport)?;
        let status = resp.status();

        if status.is_success() {
            return resp.text().await.map_err(transport);
        }

        let status_code = status.as_u16();
        let retry_after_ms = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(|secs| secs * 1000);
        let body_text = resp.text().await.unwrap_or_default();

        Err(status_error(status_code, body_text, retry_after_ms))
    }
}

fn transport(e: reqwest::Error) -> HttpError {
    if e.is_timeout() {
        HttpError::Timeout
    } else {
        HttpError::Reqwest(e)
    }
}

fn status_error(status: u16, body: String, retry_after_ms: Option<u64>) -> HttpError {
    match status {
        401 | 403 => HttpError::Unauthorized,
        404 => HttpError::NotFound(body),
        408 => HttpError::Timeout,
        429 => HttpError::RateLimited { retry_after_ms },
        400..=499 => HttpError::BadRequest(body),
        _ => HttpError::ServerError { status, body },
    }
}
