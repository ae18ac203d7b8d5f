//! Provider tests against a local HTTP responder.
//!
//! The responder answers each request by path prefix with a canned body,
//! optionally after a delay, so snapshot races can be staged deterministically.

#![cfg(feature = "http")]

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use usdcop_charts::cache::{ChartCache, FileStore};
use usdcop_charts::domain::chart::wire::RequestParams;
use usdcop_charts::http::RetryPolicy;
use usdcop_charts::provider::{ChartProvider, Phase, SnapshotOutcome};
use usdcop_charts::shared::{ChartId, ChartKind, Clock, ManualClock, RangeKey};
use usdcop_charts::ws::{ChannelBody, ChannelMessage, WsEvent};

const LINE: ChartId = ChartId::new(1002);
const PRICE: ChartId = ChartId::new(1000);

#[derive(Clone)]
struct Route {
    prefix: &'static str,
    status: u16,
    body: String,
    delay: Duration,
}

impl Route {
    fn ok(prefix: &'static str, body: Value) -> Self {
        Self {
            prefix,
            status: 200,
            body: body.to_string(),
            delay: Duration::ZERO,
        }
    }

    fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Serve `routes` on an ephemeral port; returns the base URL.
async fn serve(routes: Vec<Route>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let routes = Arc::new(routes);

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let routes = Arc::clone(&routes);
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                let mut read = 0;
                loop {
                    let n = socket.read(&mut buf[read..]).await.unwrap_or(0);
                    read += n;
                    if n == 0 || buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                let request = String::from_utf8_lossy(&buf[..read]);
                let path = request.split_whitespace().nth(1).unwrap_or("/").to_string();

                let (status, body, delay) = match routes.iter().find(|r| path.starts_with(r.prefix)) {
                    Some(r) => (r.status, r.body.clone(), r.delay),
                    None => (404, "not found".to_string(), Duration::ZERO),
                };
                tokio::time::sleep(delay).await;

                let response = format!(
                    "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    format!("http://{}", addr)
}

/// 10:00 in Bogota.
fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 5, 15, 0, 0).unwrap()))
}

fn provider(base_url: &str, clock: Arc<ManualClock>) -> ChartProvider {
    ChartProvider::builder()
        .base_url(base_url)
        .clock(clock)
        .retry(RetryPolicy::None)
        .request_timeout(Duration::from_secs(2))
        .build()
        .unwrap()
}

fn daily_chart(days: u32) -> Value {
    let labels: Vec<String> = (1..=days).map(|d| format!("2024-02-{:02}", d)).collect();
    let data: Vec<f64> = (1..=days).map(|d| 3900.0 + d as f64).collect();
    json!({"data": {"data": {"labels": labels, "datasets": [{"label": "close", "data": data}]}}})
}

#[tokio::test]
async fn test_fetch_snapshot_applies_nested_payload() {
    let base = serve(vec![Route::ok("/api/charts/1002", daily_chart(20))]).await;
    let p = provider(&base, clock());

    p.request(LINE, RangeKey::Month1, RequestParams::default()).await;
    let outcome = p
        .fetch_snapshot(LINE, RangeKey::Month1, &RequestParams::default())
        .await;
    assert_eq!(outcome, SnapshotOutcome::Applied(20));
    assert_eq!(p.phase(LINE).await, Some(Phase::Live));

    let block = p.get_series(LINE, RangeKey::Month1).await.unwrap();
    assert_eq!(block.labels.len(), 20);
    assert_eq!(block.datasets[0].data[0], Some(3901.0));

    // Served from the cache for the next request of the same range.
    assert!(p.cache().load(RangeKey::Month1, ChartKind::Line).is_some());
}

#[tokio::test]
async fn test_fetch_snapshot_without_data_is_empty() {
    let base = serve(vec![Route::ok("/api/charts/1002", json!({"data": {"status": "ok"}}))]).await;
    let p = provider(&base, clock());

    let outcome = p
        .fetch_snapshot(LINE, RangeKey::Day5, &RequestParams::default())
        .await;
    assert_eq!(outcome, SnapshotOutcome::Empty);
    assert_eq!(p.phase(LINE).await, Some(Phase::Empty));
    assert!(p.get_series(LINE, RangeKey::Day5).await.is_none());
}

#[tokio::test]
async fn test_server_error_keeps_cached_series() {
    let base = serve(vec![Route {
        prefix: "/api/charts/",
        status: 503,
        body: "busy".into(),
        delay: Duration::ZERO,
    }])
    .await;
    let clock = clock();
    let p = provider(&base, clock.clone());

    let fresh = serve(vec![Route::ok("/api/charts/1002", daily_chart(10))]).await;
    let seeded = provider(&fresh, clock.clone());
    // Both providers share nothing but the clock, so seed through the HTTP path
    // and copy the cache entry across.
    seeded
        .fetch_snapshot(LINE, RangeKey::Month1, &RequestParams::default())
        .await;
    let entry = seeded.cache().load(RangeKey::Month1, ChartKind::Line).unwrap();
    p.cache().save(RangeKey::Month1, ChartKind::Line, &entry);

    let req = p.request(LINE, RangeKey::Month1, RequestParams::default()).await;
    assert_eq!(req.phase, Phase::Cached);

    let outcome = p
        .fetch_snapshot(LINE, RangeKey::Month1, &RequestParams::default())
        .await;
    assert_eq!(outcome, SnapshotOutcome::Failed);
    assert_eq!(p.phase(LINE).await, Some(Phase::Cached));
    assert_eq!(p.get_series(LINE, RangeKey::Month1).await.unwrap().labels.len(), 10);
}

#[tokio::test]
async fn test_late_snapshot_for_old_range_is_stale() {
    let base = serve(vec![
        Route::ok("/api/charts/1002?range=1M", daily_chart(20)).delayed(Duration::from_millis(300)),
    ])
    .await;
    let p = provider(&base, clock());

    p.request(LINE, RangeKey::Month1, RequestParams::default()).await;
    let params = RequestParams::default();
    let (outcome, _) = tokio::join!(
        p.fetch_snapshot(LINE, RangeKey::Month1, &params),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            p.request(LINE, RangeKey::Month6, RequestParams::default()).await
        }
    );

    assert_eq!(outcome, SnapshotOutcome::Stale);
    assert_eq!(p.phase(LINE).await, Some(Phase::Empty));
    assert!(p.get_series(LINE, RangeKey::Month6).await.is_none());
    assert!(p.cache().load(RangeKey::Month1, ChartKind::Line).is_none());
}

#[tokio::test]
async fn test_ws_config_carries_token() {
    let base = serve(vec![Route::ok("/api/ws/token", json!({"token": "t0k3n"}))]).await;
    let p = ChartProvider::builder()
        .base_url(&base)
        .ws_url("ws://127.0.0.1:1/ws")
        .retry(RetryPolicy::None)
        .build()
        .unwrap();

    let config = p.ws_config().await.unwrap();
    assert_eq!(config.token.as_deref(), Some("t0k3n"));
    assert_eq!(config.endpoint(), "ws://127.0.0.1:1/ws?token=t0k3n");
}

#[tokio::test]
async fn test_drive_consumes_event_stream() {
    let p = provider("http://127.0.0.1:9", clock());
    p.request(PRICE, RangeKey::Day1, RequestParams::default()).await;

    let events = futures_util::stream::iter(vec![
        WsEvent::Connected,
        WsEvent::Message(ChannelMessage::new(
            PRICE,
            ChannelBody::Data(json!({"time": "09:30", "close": 3910.5})),
        )),
        WsEvent::Error("bad frame".into()),
        WsEvent::Message(ChannelMessage::new(
            PRICE,
            ChannelBody::Data(json!("{\"time\": \"09:31\", \"price\": \"3911\"}")),
        )),
        WsEvent::Disconnected {
            code: Some(1006),
            reason: "gone".into(),
        },
    ]);
    p.drive(events).await;

    let block = p.get_series(PRICE, RangeKey::Day1).await.unwrap();
    assert_eq!(block.datasets[0].data, vec![Some(3910.5), Some(3911.0)]);
    assert_eq!(p.phase(PRICE).await, Some(Phase::Live));
}

#[tokio::test]
async fn test_flushed_buffer_rehydrates_next_session() {
    let dir = tempfile::tempdir().unwrap();
    let clock = clock();

    let first = ChartProvider::builder()
        .base_url("http://127.0.0.1:9")
        .clock(clock.clone())
        .store(Arc::new(FileStore::open(dir.path()).unwrap()))
        .build()
        .unwrap();
    first.request(PRICE, RangeKey::Day1, RequestParams::default()).await;
    for (time, close) in [("09:00", 3900.0), ("09:01", 3901.0)] {
        first
            .handle_message(&ChannelMessage::new(
                PRICE,
                ChannelBody::Data(json!({"time": time, "close": close})),
            ))
            .await;
    }
    assert!(first.flush(PRICE).await);
    drop(first);

    clock.advance_secs(60);
    let second = ChartProvider::builder()
        .base_url("http://127.0.0.1:9")
        .clock(clock.clone())
        .store(Arc::new(FileStore::open(dir.path()).unwrap()))
        .build()
        .unwrap();
    let req = second.request(PRICE, RangeKey::Day1, RequestParams::default()).await;
    assert_eq!(req.phase, Phase::Cached);
    let block = second.get_series(PRICE, RangeKey::Day1).await.unwrap();
    assert_eq!(block.datasets[0].data, vec![Some(3900.0), Some(3901.0)]);

    // A fresh cache over the same directory sees the same entry.
    let cache = ChartCache::new(
        Arc::new(FileStore::open(dir.path()).unwrap()),
        clock.clone() as Arc<dyn Clock>,
        second.normalizer(),
    );
    assert!(cache.load(RangeKey::Day1, ChartKind::LivePrice).is_some());
}
