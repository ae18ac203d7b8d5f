//! Chart data provider: `ChartProvider` and its builder.
//!
//! The composition root of the pipeline. It owns one streaming buffer per
//! channel, the current range selection per chart, the last snapshot applied
//! for that selection, and the rendered series. WS and HTTP results flow in
//! through [`ChartProvider::handle_event`] and [`ChartProvider::fetch_snapshot`];
//! rendering code reads [`ChartProvider::get_series`].
//!
//! Every selection carries a generation number. A snapshot fetch remembers the
//! generation it was issued for and is discarded if the selection moved on
//! before it resolved.
//!
//! This is the single place where pipeline errors are logged and degraded to
//! "no update": nothing here returns a parse error to the caller.

use crate::cache::{CacheStore, CachedData, ChartCache, MemoryStore};
use crate::domain::chart::convert::{
    block_candles, block_points, bollinger_block, line_block, merge_candles, tick_point,
};
use crate::domain::chart::filter::{filter_range, normalize_series, sort_dedup};
use crate::domain::chart::series::{summarize, to_candles};
use crate::domain::chart::wire::{RawTick, RequestParams};
use crate::domain::chart::{
    parse_payload, BollingerParams, Candle, ChartBlock, Point, SeriesSummary, StreamingBuffer,
    TickOutcome, TimeNormalizer,
};
use crate::domain::chart::state::DEFAULT_CAPACITY;
use crate::error::{ParseError, SdkError};
use crate::http::{ChartHttp, RetryPolicy, DEFAULT_TIMEOUT};
use crate::shared::{ChartId, ChartKind, Clock, RangeKey, SystemClock, DEFAULT_CHANNELS};
use crate::ws::{ChannelBody, ChannelMessage, MessageOut, WsConfig, WsEvent};

use async_lock::RwLock;
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use futures_util::stream::{Stream, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Where a chart's current selection stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    /// Nothing to show yet.
    #[default]
    Empty,
    /// Showing data rehydrated from the cache.
    Cached,
    /// Showing data from a snapshot fetch or the live stream.
    Live,
}

/// Result of [`ChartProvider::fetch_snapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOutcome {
    /// The snapshot parsed to this many points (or candles) and was applied.
    Applied(usize),
    /// The response carried no usable data; state is unchanged.
    Empty,
    /// The selection changed while the fetch was in flight; the result was dropped.
    Stale,
    /// The request failed; state is unchanged.
    Failed,
}

/// What [`ChartProvider::request`] recorded.
#[derive(Debug, Clone, PartialEq)]
pub struct ChartRequest {
    pub chart_id: ChartId,
    pub range: RangeKey,
    pub generation: u64,
    /// Phase right after the cache was consulted.
    pub phase: Phase,
    /// The frame to send on the application's WS client.
    pub message: MessageOut,
}

// ─── Internal state ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Selection {
    range: RangeKey,
    params: RequestParams,
    /// Band settings from `params`, falling back to the builder's.
    bands: BollingerParams,
    generation: u64,
    phase: Phase,
}

/// Snapshot data for the current selection.
#[derive(Debug, Clone)]
enum Snapshot {
    Points(Vec<Point>),
    Candles(Vec<Candle>),
}

impl Snapshot {
    fn len(&self) -> usize {
        match self {
            Snapshot::Points(points) => points.len(),
            Snapshot::Candles(candles) => candles.len(),
        }
    }
}

/// Settings every pipeline stage reads.
#[derive(Debug, Clone, Copy)]
struct Pipeline {
    normalizer: TimeNormalizer,
    bollinger: BollingerParams,
    capacity: usize,
}

impl Pipeline {
    /// Band settings for a request: its `window`/`deviation` where valid,
    /// the configured defaults otherwise.
    fn bands_for(&self, params: &RequestParams) -> BollingerParams {
        let period = match params.window {
            Some(0) => {
                tracing::debug!("ignoring zero band window");
                self.bollinger.period
            }
            Some(window) => window as usize,
            None => self.bollinger.period,
        };
        let k = match params.deviation {
            Some(k) if k.is_finite() && k >= 0.0 => k,
            Some(k) => {
                tracing::debug!(k, "ignoring invalid band deviation");
                self.bollinger.k
            }
            None => self.bollinger.k,
        };
        BollingerParams::new(period, k)
    }

    fn snapshot_from_block(
        &self,
        block: &ChartBlock,
        kind: ChartKind,
        range: RangeKey,
        now: DateTime<Utc>,
    ) -> Snapshot {
        if kind != ChartKind::Candles {
            return Snapshot::Points(block_points(block, kind, &self.normalizer, range, now));
        }
        if block.is_ohlc() {
            Snapshot::Candles(block_candles(block, &self.normalizer, range, now))
        } else {
            let points = block_points(block, kind, &self.normalizer, range, now);
            Snapshot::Candles(to_candles(&points, range.candle_bucket_secs()))
        }
    }

    fn snapshot_from_cache(
        &self,
        data: &CachedData,
        kind: ChartKind,
        range: RangeKey,
        now: DateTime<Utc>,
    ) -> Snapshot {
        match data {
            CachedData::Block(block) => self.snapshot_from_block(block, kind, range, now),
            CachedData::Points(points) if kind == ChartKind::Candles => {
                Snapshot::Candles(to_candles(points, range.candle_bucket_secs()))
            }
            CachedData::Points(points) => Snapshot::Points(sort_dedup(points.clone())),
        }
    }

    /// Render the block a chart shows, `None` when there is nothing to show.
    fn render(
        &self,
        kind: ChartKind,
        range: RangeKey,
        bands: BollingerParams,
        snapshot: Option<&Snapshot>,
        live: &[Point],
        now: DateTime<Utc>,
    ) -> Option<ChartBlock> {
        let live = filter_range(live, range, &self.normalizer, now);

        let block = match kind {
            ChartKind::Candles => {
                let base = match snapshot {
                    Some(Snapshot::Candles(candles)) => candles.as_slice(),
                    _ => &[],
                };
                let merged = merge_candles(base, &to_candles(&live, range.candle_bucket_secs()));
                let kept = self.filter_candles(merged, range, now);
                ChartBlock::from(kept.as_slice())
            }
            _ => {
                let mut points = match snapshot {
                    Some(Snapshot::Points(points)) => points.clone(),
                    _ => Vec::new(),
                };
                // Live points go last so they win any tie.
                points.extend(live);
                let points = normalize_series(points, range, &self.normalizer, now);
                if kind == ChartKind::Bollinger {
                    bollinger_block(&points, bands)
                } else {
                    line_block(&points, kind.as_str())
                }
            }
        };

        (!block.is_empty()).then_some(block)
    }

    /// Apply the range window to candles, keyed on their open time.
    fn filter_candles(&self, candles: Vec<Candle>, range: RangeKey, now: DateTime<Utc>) -> Vec<Candle> {
        let opens: Vec<Point> = candles.iter().map(|c| Point::new(c.time, c.close)).collect();
        let kept = filter_range(&opens, range, &self.normalizer, now);
        let (Some(first), Some(last)) = (kept.first(), kept.last()) else {
            return Vec::new();
        };
        let (from, to) = (first.time, last.time);
        candles
            .into_iter()
            .filter(|c| c.time >= from && c.time <= to)
            .collect()
    }
}

#[derive(Debug, Default)]
struct ProviderState {
    buffers: HashMap<ChartId, StreamingBuffer>,
    selections: HashMap<ChartId, Selection>,
    snapshots: HashMap<ChartId, Snapshot>,
    series: HashMap<ChartId, ChartBlock>,
    next_generation: u64,
    /// Zone calendar day the buffers belong to.
    day: Option<NaiveDate>,
}

impl ProviderState {
    /// Record a selection and return its new generation. A range change resets
    /// the chart to `Empty`.
    fn select(
        &mut self,
        id: ChartId,
        range: RangeKey,
        params: RequestParams,
        bands: BollingerParams,
    ) -> u64 {
        self.next_generation += 1;
        let generation = self.next_generation;

        match self.selections.get_mut(&id) {
            Some(sel) if sel.range == range => {
                sel.params = params;
                sel.bands = bands;
                sel.generation = generation;
            }
            _ => {
                self.snapshots.remove(&id);
                self.series.remove(&id);
                self.selections.insert(
                    id,
                    Selection {
                        range,
                        params,
                        bands,
                        generation,
                        phase: Phase::Empty,
                    },
                );
            }
        }
        generation
    }

    fn is_current(&self, id: ChartId, generation: u64) -> bool {
        self.selections
            .get(&id)
            .is_some_and(|sel| sel.generation == generation)
    }

    fn phase(&self, id: ChartId) -> Option<Phase> {
        self.selections.get(&id).map(|sel| sel.phase)
    }

    fn set_phase(&mut self, id: ChartId, phase: Phase) {
        if let Some(sel) = self.selections.get_mut(&id) {
            sel.phase = phase;
        }
    }

    fn buffer_mut(&mut self, id: ChartId, capacity: usize) -> &mut StreamingBuffer {
        self.buffers
            .entry(id)
            .or_insert_with(|| StreamingBuffer::new(capacity))
    }

    /// Install snapshot data for `id`. Intraday point series are folded into
    /// the live buffer; everything else is kept beside it. Returns the row count.
    fn apply(&mut self, id: ChartId, range: RangeKey, snapshot: Snapshot, capacity: usize) -> usize {
        let rows = snapshot.len();
        if rows == 0 {
            return 0;
        }
        match snapshot {
            Snapshot::Points(points) if range.is_intraday() => {
                let added = self.buffer_mut(id, capacity).merge_snapshot(&points);
                tracing::debug!(chart_id = %id, rows, added, "merged intraday snapshot into buffer");
                self.snapshots.remove(&id);
            }
            other => {
                self.snapshots.insert(id, other);
            }
        }
        rows
    }

    fn refresh(&mut self, id: ChartId, kind: ChartKind, pipeline: &Pipeline, now: DateTime<Utc>) {
        let Some((range, bands)) = self.selections.get(&id).map(|sel| (sel.range, sel.bands)) else {
            return;
        };
        let live = self.buffers.get(&id).map(StreamingBuffer::points).unwrap_or_default();
        match pipeline.render(kind, range, bands, self.snapshots.get(&id), &live, now) {
            Some(block) => {
                self.series.insert(id, block);
            }
            None => {
                self.series.remove(&id);
            }
        }
    }

    /// What the cache should hold for the current selection of `id`.
    fn cache_payload(
        &self,
        id: ChartId,
        kind: ChartKind,
        range: RangeKey,
        pipeline: &Pipeline,
        now: DateTime<Utc>,
    ) -> Option<CachedData> {
        let data = match (kind, self.snapshots.get(&id)) {
            (ChartKind::Candles, Some(Snapshot::Candles(candles))) => {
                CachedData::Block(ChartBlock::from(candles.as_slice()))
            }
            (ChartKind::Candles, _) => return None,
            (_, Some(Snapshot::Points(points))) => CachedData::Points(points.clone()),
            (_, _) if range.is_intraday() => {
                let buffered = self.buffers.get(&id)?.points();
                CachedData::Points(filter_range(&buffered, range, &pipeline.normalizer, now))
            }
            _ => return None,
        };
        (!data.is_empty()).then_some(data)
    }

    /// Today's live data for `id`, shaped for the `1D` cache entry.
    fn flush_payload(
        &self,
        id: ChartId,
        kind: ChartKind,
        pipeline: &Pipeline,
        now: DateTime<Utc>,
    ) -> Option<CachedData> {
        let buffered = self.buffers.get(&id)?.points();
        let today = filter_range(&buffered, RangeKey::Day1, &pipeline.normalizer, now);

        let data = if kind == ChartKind::Candles {
            let live = to_candles(&today, RangeKey::Day1.candle_bucket_secs());
            let candles = match (self.selections.get(&id), self.snapshots.get(&id)) {
                (Some(sel), Some(Snapshot::Candles(snapshot))) if sel.range.is_intraday() => {
                    merge_candles(snapshot, &live)
                }
                _ => live,
            };
            CachedData::Block(ChartBlock::from(candles.as_slice()))
        } else {
            CachedData::Points(today)
        };
        (!data.is_empty()).then_some(data)
    }

    /// Move to `today`. On an actual day change, clear the buffers and reset
    /// every intraday selection to `Empty`. Returns whether the day changed.
    fn roll_to(&mut self, today: NaiveDate) -> bool {
        let previous = self.day.replace(today);
        if previous.map_or(true, |day| day == today) {
            return false;
        }

        self.buffers.values_mut().for_each(StreamingBuffer::clear);

        let intraday: Vec<ChartId> = self
            .selections
            .iter()
            .filter(|(_, sel)| sel.range.is_intraday())
            .map(|(id, _)| *id)
            .collect();
        for id in &intraday {
            self.next_generation += 1;
            let generation = self.next_generation;
            if let Some(sel) = self.selections.get_mut(id) {
                sel.phase = Phase::Empty;
                sel.generation = generation;
            }
            self.snapshots.remove(id);
            self.series.remove(id);
        }

        tracing::info!(%today, reset = intraday.len(), "day rollover: cleared live buffers");
        true
    }
}

// ─── Public ChartProvider ────────────────────────────────────────────────────

/// The pipeline's composition root.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ChartProvider {
    http: ChartHttp,
    cache: Arc<ChartCache>,
    clock: Arc<dyn Clock>,
    channels: Arc<HashMap<ChartId, ChartKind>>,
    pipeline: Pipeline,
    ws_url: String,
    state: Arc<RwLock<ProviderState>>,
}

impl std::fmt::Debug for ChartProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChartProvider")
            .field("base_url", &self.http.base_url())
            .field("ws_url", &self.ws_url)
            .field("channels", &self.channels)
            .finish_non_exhaustive()
    }
}

impl ChartProvider {
    pub fn builder() -> ChartProviderBuilder {
        ChartProviderBuilder::default()
    }

    /// The kind a channel carries. Unknown ids are plain lines.
    pub fn kind_of(&self, chart_id: ChartId) -> ChartKind {
        self.channels
            .get(&chart_id)
            .copied()
            .unwrap_or(ChartKind::Line)
    }

    pub fn http(&self) -> &ChartHttp {
        &self.http
    }

    pub fn cache(&self) -> &ChartCache {
        &self.cache
    }

    pub fn normalizer(&self) -> TimeNormalizer {
        self.pipeline.normalizer
    }

    // ── Selection ────────────────────────────────────────────────────────

    /// Select `range` for a chart and rehydrate it from the cache.
    ///
    /// The returned message must be sent on the application's WS client;
    /// the provider does not own a connection.
    pub async fn request(
        &self,
        chart_id: ChartId,
        range: RangeKey,
        params: RequestParams,
    ) -> ChartRequest {
        self.check_day_rollover().await;

        let kind = self.kind_of(chart_id);
        let now = self.clock.now();
        let cached = self.cache.load(range, kind);

        let bands = self.pipeline.bands_for(&params);
        let mut state = self.state.write().await;
        let generation = state.select(chart_id, range, params.clone(), bands);

        if state.phase(chart_id) == Some(Phase::Empty) {
            if let Some(data) = cached.filter(|d| !d.is_empty()) {
                let snapshot = self.pipeline.snapshot_from_cache(&data, kind, range, now);
                if state.apply(chart_id, range, snapshot, self.pipeline.capacity) > 0 {
                    state.set_phase(chart_id, Phase::Cached);
                    tracing::debug!(chart_id = %chart_id, %range, "rehydrated from cache");
                }
            }
        }
        state.refresh(chart_id, kind, &self.pipeline, now);

        ChartRequest {
            chart_id,
            range,
            generation,
            phase: state.phase(chart_id).unwrap_or_default(),
            message: MessageOut::request(chart_id, range, params),
        }
    }

    /// The series to render for `(chart_id, range)`, `None` for "no data".
    ///
    /// Ranges other than the chart's current selection are served from the
    /// cache only.
    pub async fn get_series(&self, chart_id: ChartId, range: RangeKey) -> Option<ChartBlock> {
        {
            let state = self.state.read().await;
            if let Some(sel) = state.selections.get(&chart_id) {
                if sel.range == range {
                    return state.series.get(&chart_id).cloned();
                }
            }
        }

        let kind = self.kind_of(chart_id);
        let now = self.clock.now();
        let data = self.cache.load(range, kind)?;
        let snapshot = self.pipeline.snapshot_from_cache(&data, kind, range, now);
        self.pipeline
            .render(kind, range, self.pipeline.bollinger, Some(&snapshot), &[], now)
    }

    pub async fn phase(&self, chart_id: ChartId) -> Option<Phase> {
        self.state.read().await.phase(chart_id)
    }

    /// Headline numbers for the series `get_series` would return.
    pub async fn summary(&self, chart_id: ChartId, range: RangeKey) -> Option<SeriesSummary> {
        let block = self.get_series(chart_id, range).await?;
        let kind = self.kind_of(chart_id);
        let points = block_points(&block, kind, &self.pipeline.normalizer, range, self.clock.now());
        summarize(&points)
    }

    // ── Snapshots ────────────────────────────────────────────────────────

    /// Fetch and apply an HTTP snapshot for `(chart_id, range)`.
    ///
    /// Selects `range` first if it is not the chart's current selection.
    /// Failures leave existing state untouched.
    pub async fn fetch_snapshot(
        &self,
        chart_id: ChartId,
        range: RangeKey,
        params: &RequestParams,
    ) -> SnapshotOutcome {
        let generation = {
            let mut state = self.state.write().await;
            match state.selections.get(&chart_id) {
                Some(sel) if sel.range == range => sel.generation,
                _ => state.select(chart_id, range, params.clone(), self.pipeline.bands_for(params)),
            }
        };

        let payload = match self.http.get_chart(chart_id, range, params).await {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(chart_id = %chart_id, %range, "snapshot fetch failed: {}", e);
                return SnapshotOutcome::Failed;
            }
        };

        match self.apply_payload(chart_id, range, &payload, Some(generation)).await {
            Ok(0) => SnapshotOutcome::Empty,
            Ok(rows) => SnapshotOutcome::Applied(rows),
            Err(ApplyError::Stale) => SnapshotOutcome::Stale,
            Err(ApplyError::Parse(e)) => {
                tracing::warn!(chart_id = %chart_id, %range, "unusable snapshot: {}", e);
                SnapshotOutcome::Empty
            }
        }
    }

    /// Parse a chart payload and apply it to the current selection of `chart_id`.
    ///
    /// With `generation`, the payload is dropped unless the selection still
    /// carries it.
    async fn apply_payload(
        &self,
        chart_id: ChartId,
        range: RangeKey,
        payload: &Value,
        generation: Option<u64>,
    ) -> Result<usize, ApplyError> {
        let parsed = parse_payload(payload)?;
        let kind = self.kind_of(chart_id);
        let now = self.clock.now();
        let snapshot = self
            .pipeline
            .snapshot_from_block(&parsed.into_chart(), kind, range, now);

        let mut state = self.state.write().await;
        if let Some(generation) = generation {
            if !state.is_current(chart_id, generation) {
                tracing::debug!(chart_id = %chart_id, %range, generation, "discarding stale snapshot");
                return Err(ApplyError::Stale);
            }
        }

        let rows = state.apply(chart_id, range, snapshot, self.pipeline.capacity);
        if rows == 0 {
            return Ok(0);
        }
        state.set_phase(chart_id, Phase::Live);
        state.refresh(chart_id, kind, &self.pipeline, now);
        let cached = state.cache_payload(chart_id, kind, range, &self.pipeline, now);
        drop(state);

        if let Some(data) = cached {
            self.cache.save(range, kind, &data);
        }
        Ok(rows)
    }

    // ── Stream ───────────────────────────────────────────────────────────

    /// Route one WS event. Returns the chart whose data changed, if any.
    pub async fn handle_event(&self, event: WsEvent) -> Option<ChartId> {
        match event {
            WsEvent::Message(msg) => self.handle_message(&msg).await.then_some(msg.id),
            WsEvent::Connected => {
                tracing::info!("chart stream connected");
                None
            }
            WsEvent::Disconnected { code, reason } => {
                tracing::info!(?code, "chart stream disconnected: {}", reason);
                // 1008: the server rejected the token; the next ws_config fetches a new one.
                if code == Some(1008) {
                    self.http.clear_ws_token().await;
                }
                None
            }
            WsEvent::Error(e) => {
                tracing::warn!("chart stream error: {}", e);
                None
            }
            WsEvent::MaxReconnectReached => {
                tracing::warn!("chart stream gave up reconnecting; serving last known data");
                None
            }
        }
    }

    /// Apply one channel frame: a tick goes to the channel's buffer, a chart
    /// blob becomes a snapshot for the channel's current range.
    /// Returns whether anything changed.
    pub async fn handle_message(&self, msg: &ChannelMessage) -> bool {
        self.roll_day().await;

        match &msg.body {
            ChannelBody::Empty => false,
            ChannelBody::Data(value) => match tick_of(value) {
                Some(Ok(tick)) => self.apply_tick(msg.id, &tick).await,
                Some(Err(e)) => {
                    tracing::debug!(chart_id = %msg.id, "dropping tick: {}", e);
                    false
                }
                None => self.apply_pushed(msg.id, value).await,
            },
            ChannelBody::Result(value) => self.apply_pushed(msg.id, value).await,
        }
    }

    async fn apply_tick(&self, chart_id: ChartId, tick: &RawTick) -> bool {
        let kind = self.kind_of(chart_id);
        let now = self.clock.now();
        let point = match tick_point(tick, kind, &self.pipeline.normalizer, now) {
            Ok(point) => point,
            Err(e) => {
                tracing::debug!(chart_id = %chart_id, "dropping tick: {}", e);
                return false;
            }
        };

        let mut state = self.state.write().await;
        let outcome = state
            .buffer_mut(chart_id, self.pipeline.capacity)
            .push(point.time, point.value);
        if outcome == TickOutcome::Rejected {
            return false;
        }
        if state.selections.contains_key(&chart_id) {
            state.set_phase(chart_id, Phase::Live);
            state.refresh(chart_id, kind, &self.pipeline, now);
        }
        true
    }

    async fn apply_pushed(&self, chart_id: ChartId, value: &Value) -> bool {
        let Some((range, generation)) = self.selection_of(chart_id).await else {
            tracing::debug!(chart_id = %chart_id, "chart blob for unselected chart");
            return false;
        };

        match self.apply_payload(chart_id, range, value, Some(generation)).await {
            Ok(rows) => rows > 0,
            Err(ApplyError::Stale) => false,
            Err(e) => {
                tracing::warn!(chart_id = %chart_id, %range, "malformed chart blob: {}", e);
                false
            }
        }
    }

    /// Range and generation of the current selection of `chart_id`.
    async fn selection_of(&self, chart_id: ChartId) -> Option<(RangeKey, u64)> {
        let state = self.state.read().await;
        state
            .selections
            .get(&chart_id)
            .map(|sel| (sel.range, sel.generation))
    }

    /// Consume a WS event stream until it ends.
    pub async fn drive<S>(&self, events: S)
    where
        S: Stream<Item = WsEvent>,
    {
        futures_util::pin_mut!(events);
        while let Some(event) = events.next().await {
            self.handle_event(event).await;
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// Evict yesterday's intraday cache entries and, when the zone's calendar
    /// day changed since the last check, clear the live buffers and reset
    /// every `1D` selection to `Empty`.
    pub async fn check_day_rollover(&self) -> bool {
        let today = self.pipeline.normalizer.today(self.clock.now());
        let evicted = self.cache.check_day_rollover();
        let rolled = self.state.write().await.roll_to(today);
        evicted || rolled
    }

    /// Per-tick rollover check. Compares the day in memory and only scans the
    /// cache when the day actually changed.
    async fn roll_day(&self) -> bool {
        let today = self.pipeline.normalizer.today(self.clock.now());
        if self.state.read().await.day == Some(today) {
            return false;
        }
        let rolled = self.state.write().await.roll_to(today);
        if rolled {
            self.cache.check_day_rollover();
        }
        rolled
    }

    /// Persist today's live data for `chart_id` as its `1D` cache entry.
    /// Returns whether anything was written.
    pub async fn flush(&self, chart_id: ChartId) -> bool {
        let kind = self.kind_of(chart_id);
        let now = self.clock.now();
        let data = self
            .state
            .read()
            .await
            .flush_payload(chart_id, kind, &self.pipeline, now);
        match data {
            Some(data) => {
                self.cache.save(RangeKey::Day1, kind, &data);
                true
            }
            None => false,
        }
    }

    /// A WS config for the chart stream, authenticated with a fresh token.
    pub async fn ws_config(&self) -> Result<WsConfig, SdkError> {
        let token = self.http.ws_token().await?;
        Ok(WsConfig::new(self.ws_url.clone()).with_token(token))
    }

    /// A native WS client for the chart stream. Not connected yet.
    #[cfg(feature = "ws-native")]
    pub async fn ws_native(&self) -> Result<crate::ws::native::WsClient, SdkError> {
        Ok(crate::ws::native::WsClient::new(self.ws_config().await?))
    }
}

enum ApplyError {
    Stale,
    Parse(ParseError),
}

impl From<ParseError> for ApplyError {
    fn from(e: ParseError) -> Self {
        ApplyError::Parse(e)
    }
}

impl std::fmt::Display for ApplyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApplyError::Stale => f.write_str("stale generation"),
            ApplyError::Parse(e) => e.fmt(f),
        }
    }
}

/// A tick in a `data` body, if the body is tick-shaped.
fn tick_of(value: &Value) -> Option<Result<RawTick, ParseError>> {
    if RawTick::looks_like_tick(value) {
        return Some(RawTick::from_value(value));
    }
    match value {
        Value::String(_) => RawTick::from_value(value).ok().map(Ok),
        _ => None,
    }
}

// ═════════════════════════════════════════════════════════════════════════════
// Builder
// ═════════════════════════════════════════════════════════════════════════════

pub struct ChartProviderBuilder {
    base_url: String,
    ws_url: String,
    time_zone: Tz,
    store: Option<Arc<dyn CacheStore>>,
    clock: Arc<dyn Clock>,
    channels: HashMap<ChartId, ChartKind>,
    buffer_capacity: usize,
    request_timeout: Duration,
    bollinger: BollingerParams,
    retry: RetryPolicy,
}

impl Default for ChartProviderBuilder {
    fn default() -> Self {
        Self {
            base_url: crate::network::DEFAULT_API_URL.to_string(),
            ws_url: crate::network::DEFAULT_WS_URL.to_string(),
            time_zone: crate::domain::chart::time::DEFAULT_ZONE,
            store: None,
            clock: Arc::new(SystemClock),
            channels: DEFAULT_CHANNELS.into_iter().collect(),
            buffer_capacity: DEFAULT_CAPACITY,
            request_timeout: DEFAULT_TIMEOUT,
            bollinger: BollingerParams::standard(),
            retry: RetryPolicy::Snapshot,
        }
    }
}

impl ChartProviderBuilder {
    pub fn base_url(mut self, url: &str) -> Self {
        self.base_url = url.to_string();
        self
    }

    pub fn ws_url(mut self, url: &str) -> Self {
        self.ws_url = url.to_string();
        self
    }

    /// Zone that anchors clock-only labels and the intraday day boundary.
    pub fn time_zone(mut self, zone: Tz) -> Self {
        self.time_zone = zone;
        self
    }

    /// Cache backend. Defaults to an in-memory store.
    pub fn store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Map a channel id to the kind of chart it carries.
    pub fn channel(mut self, chart_id: ChartId, kind: ChartKind) -> Self {
        self.channels.insert(chart_id, kind);
        self
    }

    pub fn buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn bollinger(mut self, params: BollingerParams) -> Self {
        self.bollinger = params;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn build(self) -> Result<ChartProvider, SdkError> {
        if self.buffer_capacity == 0 {
            return Err(SdkError::Validation("buffer_capacity must be positive".into()));
        }
        if self.bollinger.period == 0 || !self.bollinger.k.is_finite() || self.bollinger.k < 0.0 {
            return Err(SdkError::Validation(format!(
                "invalid bollinger params: period {}, k {}",
                self.bollinger.period, self.bollinger.k
            )));
        }
        if self.request_timeout.is_zero() {
            return Err(SdkError::Validation("request_timeout must be positive".into()));
        }

        let normalizer = TimeNormalizer::new(self.time_zone);
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()));

        Ok(ChartProvider {
            http: ChartHttp::new(&self.base_url, self.request_timeout)?.with_retry(self.retry),
            cache: Arc::new(ChartCache::new(store, Arc::clone(&self.clock), normalizer)),
            clock: self.clock,
            channels: Arc::new(self.channels),
            pipeline: Pipeline {
                normalizer,
                bollinger: self.bollinger,
                capacity: self.buffer_capacity,
            },
            ws_url: self.ws_url,
            state: Arc::new(RwLock::new(ProviderState::default())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CacheError;
    use crate::shared::ManualClock;
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn clock_at(y: i32, m: u32, d: u32, h: u32, min: u32) -> Arc<ManualClock> {
        let utc = Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap();
        Arc::new(ManualClock::new(utc))
    }

    fn provider(clock: Arc<ManualClock>) -> ChartProvider {
        ChartProvider::builder()
            .base_url("http://127.0.0.1:9")
            .clock(clock)
            .retry(RetryPolicy::None)
            .build()
            .unwrap()
    }

    fn tick(id: u32, time: &str, close: f64) -> ChannelMessage {
        ChannelMessage::new(
            ChartId::new(id),
            ChannelBody::Data(json!({"time": time, "close": close})),
        )
    }

    fn values(block: &ChartBlock) -> Vec<Option<f64>> {
        block.datasets[0].data.clone()
    }

    const PRICE: ChartId = ChartId::new(1000);
    const LINE: ChartId = ChartId::new(1002);
    const CANDLES: ChartId = ChartId::new(1003);
    const BANDS: ChartId = ChartId::new(1004);

    #[test]
    fn test_builder_validation() {
        assert!(ChartProvider::builder().buffer_capacity(0).build().is_err());
        assert!(ChartProvider::builder()
            .bollinger(BollingerParams::new(0, 2.0))
            .build()
            .is_err());
        assert!(ChartProvider::builder().build().is_ok());
    }

    #[test]
    fn test_unknown_channel_is_line() {
        let p = ChartProvider::builder()
            .channel(ChartId::new(7), ChartKind::Average)
            .build()
            .unwrap();
        assert_eq!(p.kind_of(ChartId::new(7)), ChartKind::Average);
        assert_eq!(p.kind_of(ChartId::new(4242)), ChartKind::Line);
        assert_eq!(p.kind_of(PRICE), ChartKind::LivePrice);
    }

    #[tokio::test]
    async fn test_request_returns_message_and_bumps_generation() {
        // 15:00 UTC is 10:00 in Bogota.
        let p = provider(clock_at(2024, 3, 5, 15, 0));
        let first = p.request(PRICE, RangeKey::Day1, RequestParams::default()).await;
        let second = p.request(PRICE, RangeKey::Day1, RequestParams::default()).await;
        assert!(second.generation > first.generation);
        assert_eq!(first.phase, Phase::Empty);
        assert_eq!(first.message.chart_id(), PRICE);
        assert!(p.get_series(PRICE, RangeKey::Day1).await.is_none());
    }

    #[tokio::test]
    async fn test_ticks_update_in_place_and_go_live() {
        let p = provider(clock_at(2024, 3, 5, 15, 0));
        p.request(PRICE, RangeKey::Day1, RequestParams::default()).await;

        assert!(p.handle_message(&tick(1000, "09:00", 3900.0)).await);
        assert!(p.handle_message(&tick(1000, "09:01", 3905.0)).await);
        assert!(p.handle_message(&tick(1000, "09:00", 3902.0)).await);

        let block = p.get_series(PRICE, RangeKey::Day1).await.unwrap();
        assert_eq!(values(&block), vec![Some(3902.0), Some(3905.0)]);
        assert_eq!(block.datasets[0].label, "price");
        assert_eq!(p.phase(PRICE).await, Some(Phase::Live));
    }

    #[tokio::test]
    async fn test_bad_frames_degrade() {
        let p = provider(clock_at(2024, 3, 5, 15, 0));
        p.request(LINE, RangeKey::Day1, RequestParams::default()).await;

        let garbage = ChannelMessage::new(LINE, ChannelBody::Result(json!("}}}{{not a chart")));
        assert!(!p.handle_message(&garbage).await);
        let bad_time = ChannelMessage::new(LINE, ChannelBody::Data(json!({"time": "soon", "close": 1})));
        assert!(!p.handle_message(&bad_time).await);
        assert!(!p.handle_message(&ChannelMessage::new(LINE, ChannelBody::Empty)).await);
        assert!(p.get_series(LINE, RangeKey::Day1).await.is_none());
        assert_eq!(p.phase(LINE).await, Some(Phase::Empty));
    }

    #[tokio::test]
    async fn test_pushed_chart_blob_applies_to_selection() {
        let p = provider(clock_at(2024, 3, 5, 15, 0));
        p.request(LINE, RangeKey::Day1, RequestParams::default()).await;

        let blob = json!([{"chart": "labels:[09:00,09:05], data:[3900,3910]"}]);
        let changed = p
            .handle_event(WsEvent::Message(ChannelMessage::new(LINE, ChannelBody::Result(blob))))
            .await;
        assert_eq!(changed, Some(LINE));

        let block = p.get_series(LINE, RangeKey::Day1).await.unwrap();
        assert_eq!(values(&block), vec![Some(3900.0), Some(3910.0)]);
        assert_eq!(p.phase(LINE).await, Some(Phase::Live));

        // Saved for the next session.
        assert!(p.cache().load(RangeKey::Day1, ChartKind::Line).is_some());
    }

    #[tokio::test]
    async fn test_range_change_resets_to_empty_then_cache() {
        let clock = clock_at(2024, 3, 5, 15, 0);
        let p = provider(clock.clone());
        p.cache().save(
            RangeKey::Month1,
            ChartKind::Line,
            &CachedData::Points(vec![Point::new(1_709_000_000, 3950.0)]),
        );

        p.request(LINE, RangeKey::Day1, RequestParams::default()).await;
        p.handle_message(&tick(1002, "09:00", 3900.0)).await;
        assert_eq!(p.phase(LINE).await, Some(Phase::Live));

        let req = p.request(LINE, RangeKey::Month1, RequestParams::default()).await;
        assert_eq!(req.phase, Phase::Cached);
        let block = p.get_series(LINE, RangeKey::Month1).await.unwrap();
        assert_eq!(block.datasets[0].data.first(), Some(&Some(3950.0)));

        let req = p.request(LINE, RangeKey::Month6, RequestParams::default()).await;
        assert_eq!(req.phase, Phase::Empty);
    }

    #[tokio::test]
    async fn test_candles_merge_snapshot_and_live() {
        let p = provider(clock_at(2024, 3, 5, 15, 0));
        p.request(CANDLES, RangeKey::Day1, RequestParams::default()).await;

        // Bogota 09:00 on 2024-03-05 is 14:00 UTC.
        let t0 = Utc.with_ymd_and_hms(2024, 3, 5, 14, 0, 0).unwrap().timestamp();
        let blob = json!([
            {"time": t0, "open": 3900, "high": 3910, "low": 3895, "close": 3905}
        ]);
        p.handle_message(&ChannelMessage::new(CANDLES, ChannelBody::Result(blob))).await;
        p.handle_message(&tick(1003, "09:00", 3920.0)).await;

        let block = p.get_series(CANDLES, RangeKey::Day1).await.unwrap();
        assert!(block.is_ohlc());
        assert_eq!(block.dataset("open").unwrap().data, vec![Some(3900.0)]);
        assert_eq!(block.dataset("high").unwrap().data, vec![Some(3920.0)]);
        assert_eq!(block.dataset("low").unwrap().data, vec![Some(3895.0)]);
        assert_eq!(block.dataset("close").unwrap().data, vec![Some(3920.0)]);
    }

    #[tokio::test]
    async fn test_bollinger_series_shape() {
        let p = ChartProvider::builder()
            .clock(clock_at(2024, 3, 5, 15, 0))
            .bollinger(BollingerParams::new(3, 2.0))
            .build()
            .unwrap();
        p.request(BANDS, RangeKey::Day1, RequestParams::default()).await;
        for (i, v) in [3900.0, 3910.0, 3905.0, 3915.0].iter().enumerate() {
            p.handle_message(&tick(1004, &format!("09:0{}", i), *v)).await;
        }

        let block = p.get_series(BANDS, RangeKey::Day1).await.unwrap();
        let labels: Vec<&str> = block.datasets.iter().map(|d| d.label.as_str()).collect();
        assert_eq!(labels, vec!["price", "SMA 3", "upper", "lower"]);
        assert_eq!(block.dataset("SMA 3").unwrap().data[..2], [None, None]);
    }

    #[tokio::test]
    async fn test_day_rollover_clears_provider_state() {
        let clock = clock_at(2024, 3, 5, 15, 0);
        let p = provider(clock.clone());
        p.request(PRICE, RangeKey::Day1, RequestParams::default()).await;
        p.handle_message(&tick(1000, "09:00", 3900.0)).await;
        assert!(p.flush(PRICE).await);

        // Next Bogota day.
        clock.advance_secs(24 * 3600);
        assert!(p.check_day_rollover().await);
        assert_eq!(p.phase(PRICE).await, Some(Phase::Empty));
        assert!(p.get_series(PRICE, RangeKey::Day1).await.is_none());
        assert!(p.cache().load(RangeKey::Day1, ChartKind::LivePrice).is_none());
        assert!(!p.check_day_rollover().await);
    }

    #[tokio::test]
    async fn test_summary_of_live_series() {
        let p = provider(clock_at(2024, 3, 5, 15, 0));
        p.request(PRICE, RangeKey::Day1, RequestParams::default()).await;
        p.handle_message(&tick(1000, "09:00", 3900.0)).await;
        p.handle_message(&tick(1000, "09:01", 3950.0)).await;

        let summary = p.summary(PRICE, RangeKey::Day1).await.unwrap();
        assert_eq!(summary.open, 3900.0);
        assert_eq!(summary.close, 3950.0);
        assert_eq!(summary.count, 2);
    }

    #[tokio::test]
    async fn test_failed_fetch_keeps_state() {
        let p = provider(clock_at(2024, 3, 5, 15, 0));
        p.request(PRICE, RangeKey::Day1, RequestParams::default()).await;
        p.handle_message(&tick(1000, "09:00", 3900.0)).await;

        let outcome = p
            .fetch_snapshot(PRICE, RangeKey::Day1, &RequestParams::default())
            .await;
        assert_eq!(outcome, SnapshotOutcome::Failed);
        assert_eq!(p.phase(PRICE).await, Some(Phase::Live));
        assert!(p.get_series(PRICE, RangeKey::Day1).await.is_some());
    }
    #[tokio::test]
    async fn test_request_band_params_drive_overlay() {
        let p = provider(clock_at(2024, 3, 5, 15, 0));
        p.request(BANDS, RangeKey::Day1, RequestParams::default().with_bands(5, 1.0))
            .await;
        for i in 0..10 {
            p.handle_message(&tick(1004, &format!("09:0{}", i), 3900.0 + (i % 3) as f64))
                .await;
        }

        let block = p.get_series(BANDS, RangeKey::Day1).await.unwrap();
        let labels: Vec<&str> = block.datasets.iter().map(|d| d.label.as_str()).collect();
        assert_eq!(labels, vec!["price", "SMA 5", "upper", "lower"]);
        let middle = &block.dataset("SMA 5").unwrap().data;
        assert!(middle[..4].iter().all(Option::is_none));
        assert!(middle[4..].iter().all(Option::is_some));
    }

    #[test]
    fn test_invalid_band_params_fall_back_to_builder() {
        let p = provider(clock_at(2024, 3, 5, 15, 0));
        let bands = p
            .pipeline
            .bands_for(&RequestParams::default().with_bands(0, f64::NAN));
        assert_eq!((bands.period, bands.k), (20, 2.0));
        let bands = p.pipeline.bands_for(&RequestParams {
            deviation: Some(1.5),
            ..Default::default()
        });
        assert_eq!((bands.period, bands.k), (20, 1.5));
    }

    #[tokio::test]
    async fn test_blob_for_superseded_selection_is_dropped() {
        let p = provider(clock_at(2024, 3, 5, 15, 0));
        p.request(LINE, RangeKey::Day1, RequestParams::default()).await;
        let (range, generation) = p.selection_of(LINE).await.unwrap();

        // The range changes after the blob was routed but before it is applied.
        p.request(LINE, RangeKey::Month1, RequestParams::default()).await;
        let blob = json!([{"chart": "labels:[09:00,09:05], data:[3900,3910]"}]);
        let applied = p.apply_payload(LINE, range, &blob, Some(generation)).await;

        assert!(matches!(applied, Err(ApplyError::Stale)));
        assert_eq!(p.phase(LINE).await, Some(Phase::Empty));
        assert!(p.get_series(LINE, RangeKey::Month1).await.is_none());
        assert!(p.cache().load(RangeKey::Day1, ChartKind::Line).is_none());
    }

    #[tokio::test]
    async fn test_second_intraday_snapshot_corrects_the_first() {
        let p = provider(clock_at(2024, 3, 5, 15, 0));
        p.request(LINE, RangeKey::Day1, RequestParams::default()).await;
        let push = |chart: &str| {
            ChannelMessage::new(LINE, ChannelBody::Result(json!([{ "chart": chart }])))
        };

        assert!(p.handle_message(&push("labels:[09:00,09:05], data:[3900,3910]")).await);
        assert!(p.handle_message(&push("labels:[09:00,09:05], data:[3901,3911]")).await);
        let block = p.get_series(LINE, RangeKey::Day1).await.unwrap();
        assert_eq!(values(&block), vec![Some(3901.0), Some(3911.0)]);

        // A tick owns its minute from then on.
        p.handle_message(&tick(1002, "09:05", 3950.0)).await;
        p.handle_message(&push("labels:[09:00,09:05], data:[3902,3912]")).await;
        let block = p.get_series(LINE, RangeKey::Day1).await.unwrap();
        assert_eq!(values(&block), vec![Some(3902.0), Some(3950.0)]);
    }

    /// Memory store that counts key listings.
    #[derive(Default)]
    struct CountingStore {
        inner: MemoryStore,
        listings: AtomicUsize,
    }

    impl CacheStore for CountingStore {
        fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
            self.inner.get(key)
        }
        fn set(&self, key: &str, value: String) -> Result<(), CacheError> {
            self.inner.set(key, value)
        }
        fn remove(&self, key: &str) -> Result<(), CacheError> {
            self.inner.remove(key)
        }
        fn keys(&self) -> Result<Vec<String>, CacheError> {
            self.listings.fetch_add(1, Ordering::SeqCst);
            self.inner.keys()
        }
    }

    #[tokio::test]
    async fn test_ticks_scan_cache_only_on_day_change() {
        let clock = clock_at(2024, 3, 5, 15, 0);
        let store = Arc::new(CountingStore::default());
        let p = ChartProvider::builder()
            .clock(clock.clone())
            .store(store.clone())
            .build()
            .unwrap();
        p.request(PRICE, RangeKey::Day1, RequestParams::default()).await;

        let before = store.listings.load(Ordering::SeqCst);
        for i in 0..5 {
            p.handle_message(&tick(1000, &format!("09:0{}", i), 3900.0)).await;
        }
        assert_eq!(store.listings.load(Ordering::SeqCst), before);

        clock.advance_secs(24 * 3600);
        p.handle_message(&tick(1000, "09:00", 3900.0)).await;
        assert!(store.listings.load(Ordering::SeqCst) > before);
        let block = p.get_series(PRICE, RangeKey::Day1).await.unwrap();
        assert_eq!(block.labels.len(), 1);
    }
}
