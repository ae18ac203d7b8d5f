//! Subscription types and tracking.

use crate::domain::chart::wire::RequestParams;
use crate::shared::{ChartId, RangeKey};
use serde::{Deserialize, Serialize};

/// Parameters for a chart request over the socket.
///
/// Params are flattened so the frame reads `{"id": .., "range": .., "instrument": ..}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubscribeParams {
    pub id: ChartId,
    pub range: RangeKey,
    #[serde(flatten)]
    pub params: RequestParams,
}

impl SubscribeParams {
    pub fn new(id: ChartId, range: RangeKey) -> Self {
        Self {
            id,
            range,
            params: RequestParams::default(),
        }
    }

    /// One logical channel per chart id: a new range replaces the old one.
    pub fn subscription_key(&self) -> String {
        format!("chart:{}", self.id)
    }
}

/// The set of chart requests to replay after a reconnect, at most one per chart id.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionSet {
    subs: Vec<SubscribeParams>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a request, superseding any earlier one for the same chart.
    /// Returns `false` when an identical request was already tracked.
    pub fn track(&mut self, params: &SubscribeParams) -> bool {
        match self.subs.iter_mut().find(|s| s.id == params.id) {
            Some(existing) if existing == params => false,
            Some(existing) => {
                *existing = params.clone();
                true
            }
            None => {
                self.subs.push(params.clone());
                true
            }
        }
    }

    /// Stop tracking a chart. Returns the request that was tracked, if any.
    pub fn remove(&mut self, id: ChartId) -> Option<SubscribeParams> {
        let idx = self.subs.iter().position(|s| s.id == id)?;
        Some(self.subs.remove(idx))
    }

    pub fn get(&self, id: ChartId) -> Option<&SubscribeParams> {
        self.subs.iter().find(|s| s.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SubscribeParams> {
        self.subs.iter()
    }

    pub fn len(&self) -> usize {
        self.subs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }
}
