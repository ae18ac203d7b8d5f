//! HTTP client layer: `ChartHttp` with snapshot retry policies.

pub mod client;
pub mod retry;

pub use client::{ChartHttp, DEFAULT_TIMEOUT};
pub use retry::{RetryConfig, RetryPolicy};
