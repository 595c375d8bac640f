// =============================================================================
// Rolling History — per-KLineId ordered, de-duplicated, time-bounded candle
// sequence, plus the two-level venue -> symbol -> interval index over them.
// =============================================================================

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::types::{KLine, KLineId, KLineInterval};

/// Maximum number of candles retained per KLineId.
pub const HISTORY_CAPACITY: usize = 2000;

/// Default window for `mean_quote_volume`.
pub const DEFAULT_MEAN_WINDOW: usize = 20;

/// Ordered, capacity-bounded candle sequence for a single KLineId. One
/// writer (the owning Poller), many concurrent readers.
#[derive(Debug, Default)]
pub struct RollingHistory {
    candles: RwLock<VecDeque<KLine>>,
}

impl RollingHistory {
    pub fn new() -> Self {
        Self {
            candles: RwLock::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
        }
    }

    /// Append `kline` if its `openTime` is strictly greater than the current
    /// tail's; otherwise a no-op (idempotent re-append of the same or an
    /// older candle). Evicts the oldest candle once length exceeds capacity.
    pub fn append(&self, kline: KLine) {
        let mut candles = self.candles.write();
        if let Some(tail) = candles.back() {
            if kline.open_time <= tail.open_time {
                return;
            }
        }
        candles.push_back(kline);
        if candles.len() > HISTORY_CAPACITY {
            candles.pop_front();
        }
    }

    /// Last `n` candles, newest last.
    pub fn tail(&self, n: usize) -> Vec<KLine> {
        let candles = self.candles.read();
        let len = candles.len();
        let start = len.saturating_sub(n);
        candles.iter().skip(start).cloned().collect()
    }

    /// `closeTime` of the newest candle, or `0` if empty.
    pub fn last_close(&self) -> i64 {
        self.candles.read().back().map(|k| k.close_time).unwrap_or(0)
    }

    /// Arithmetic mean of `quoteVolume` over the last `window_n` candles.
    pub fn mean_quote_volume(&self, window_n: usize) -> f64 {
        let candles = self.candles.read();
        let len = candles.len();
        if len == 0 {
            return 0.0;
        }
        let start = len.saturating_sub(window_n);
        let slice: Vec<f64> = candles.iter().skip(start).map(|k| k.quote_volume).collect();
        slice.iter().sum::<f64>() / slice.len() as f64
    }

    pub fn len(&self) -> usize {
        self.candles.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Two-level concurrent index: venueId -> symbol -> interval -> history.
/// `DashMap` lets instrument add/remove (§4.A.2 reconciliation) proceed
/// without a crate-wide writer lock; each leaf still serializes its own
/// reads/writes through `RollingHistory`'s `RwLock`.
#[derive(Debug, Default)]
pub struct HistoryIndex {
    venues: DashMap<String, DashMap<String, DashMap<KLineInterval, Arc<RollingHistory>>>>,
}

impl HistoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch or create the history slot for `id`.
    pub fn get_or_create(&self, id: &KLineId) -> Arc<RollingHistory> {
        let venue = self
            .venues
            .entry(id.venue_id.clone())
            .or_insert_with(DashMap::new);
        let symbol = venue.entry(id.symbol.clone()).or_insert_with(DashMap::new);
        symbol
            .entry(id.interval)
            .or_insert_with(|| Arc::new(RollingHistory::new()))
            .clone()
    }

    /// Existing history slot for `id`, if any.
    pub fn get(&self, id: &KLineId) -> Option<Arc<RollingHistory>> {
        self.venues
            .get(&id.venue_id)?
            .get(&id.symbol)?
            .get(&id.interval)
            .map(|h| h.clone())
    }

    /// Remove every interval's history for `(venueId, symbol)`. Called when
    /// an instrument is delisted during reconciliation (§4.A.2/E6).
    pub fn remove_instrument(&self, venue_id: &str, symbol: &str) {
        if let Some(venue) = self.venues.get(venue_id) {
            venue.remove(symbol);
        }
    }

    pub fn venues(&self) -> Vec<String> {
        self.venues.iter().map(|e| e.key().clone()).collect()
    }

    /// `(symbol, interval)` pairs with a history slot under `venue_id`.
    pub fn kline_ids(&self, venue_id: &str) -> Vec<(String, KLineInterval)> {
        let Some(venue) = self.venues.get(venue_id) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for symbol_entry in venue.iter() {
            for interval_entry in symbol_entry.value().iter() {
                out.push((symbol_entry.key().clone(), *interval_entry.key()));
            }
        }
        out
    }
}
