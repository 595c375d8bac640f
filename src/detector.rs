// =============================================================================
// Detector — evaluates every newly arrived candle against online sessions'
// filters and fans matches out to session mailboxes (§4.E).
// =============================================================================
//
// Grounded on `original_source/Src/core.cpp`'s wiring (the venue adapter's
// candle-emission signal fans out to both the history store and the
// detector); here that fan-out is a single channel consumed by one task that
// does both in order, which also gives each KLineId a single history writer.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::filter;
use crate::history::HistoryIndex;
use crate::session::SessionRegistry;
use crate::types::{DetectEvent, KLine, KLineInterval};

const HISTORY_TAIL_N: usize = 20;

/// Owns the candle intake channel; every Poller's `out_tx` feeds the
/// matching `in_rx` here.
pub struct Detector {
    history: Arc<HistoryIndex>,
    sessions: Arc<SessionRegistry>,
}

impl Detector {
    pub fn new(history: Arc<HistoryIndex>, sessions: Arc<SessionRegistry>) -> Self {
        Self { history, sessions }
    }

    /// Drain `in_rx` until the channel closes (i.e. every Poller sender has
    /// dropped, which only happens at shutdown).
    pub async fn run(self: Arc<Self>, mut in_rx: mpsc::UnboundedReceiver<KLine>) {
        while let Some(k) = in_rx.recv().await {
            self.handle_candle(k);
        }
    }

    /// Append to history, then evaluate every online subscribed session's
    /// filters against the candle (§4.E steps 1-3).
    fn handle_candle(&self, k: KLine) {
        let id = k.id.clone();
        let history = self.history.get_or_create(&id);
        history.append(k.clone());

        let review_history = self.review_history(&id.venue_id, &id.symbol);

        let subscribed = self.sessions.snapshot_subscribed(&id.venue_id);
        for (session_id, config) in subscribed {
            for f in &config.filters {
                if filter::evaluate(f, &id, &k, &history) {
                    let event = DetectEvent {
                        kline_id: id.clone(),
                        triggering_candle: k.clone(),
                        history_tail: history.tail(HISTORY_TAIL_N),
                        review_tail: review_history
                            .as_ref()
                            .map(|h| h.tail(HISTORY_TAIL_N))
                            .unwrap_or_default(),
                        filter_activated: f.clone(),
                    };
                    debug!(session_id, kline_id = %id, "filter matched, enqueuing detect event");
                    self.sessions.enqueue(session_id, event);
                }
            }
        }
    }

    /// VolumeDelta's "review" history is the symbol's MIN5 history (§4.E).
    fn review_history(&self, venue_id: &str, symbol: &str) -> Option<Arc<crate::history::RollingHistory>> {
        let id = crate::types::KLineId::new(venue_id, symbol, KLineInterval::Min5);
        self.history.get(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryUserStore;
    use crate::types::{Filter, KLineId, UserConfig};
    use std::collections::HashSet;

    fn kline(id: &KLineId, open_time: i64, high: f64, low: f64) -> KLine {
        KLine::new(id.clone(), open_time, low, high, low, low, 1.0, 1000.0).unwrap()
    }

    #[tokio::test]
    async fn matching_candle_enqueues_detect_event() {
        let history = Arc::new(HistoryIndex::new());
        let sessions = Arc::new(SessionRegistry::new(Box::new(InMemoryUserStore::new()), true));
        let (sid, _) = sessions.login("alice", "pw").await.unwrap();
        sessions
            .update_config(
                sid,
                UserConfig {
                    filters: vec![Filter::Delta {
                        min: 0.02,
                        max: 1.0,
                        interval: KLineInterval::Min1,
                        include: None,
                        exclude: None,
                    }],
                    subscribed_venues: HashSet::from(["binance".to_string()]),
                },
            )
            .unwrap();

        let detector = Arc::new(Detector::new(history, sessions.clone()));
        let id = KLineId::new("binance", "BTCUSDT", KLineInterval::Min1);
        let k = kline(&id, 60_000, 103.0, 100.0);
        detector.handle_candle(k);

        let (events, is_full) = sessions.poll_detect(sid).unwrap();
        assert_eq!(events.len(), 1);
        assert!(!is_full);
    }

    #[tokio::test]
    async fn non_matching_venue_is_ignored() {
        let history = Arc::new(HistoryIndex::new());
        let sessions = Arc::new(SessionRegistry::new(Box::new(InMemoryUserStore::new()), true));
        let (sid, _) = sessions.login("alice", "pw").await.unwrap();
        sessions
            .update_config(
                sid,
                UserConfig {
                    filters: vec![Filter::Delta {
                        min: 0.0,
                        max: 1.0,
                        interval: KLineInterval::Min1,
                        include: None,
                        exclude: None,
                    }],
                    subscribed_venues: HashSet::from(["bybit".to_string()]),
                },
            )
            .unwrap();

        let detector = Arc::new(Detector::new(history, sessions.clone()));
        let id = KLineId::new("binance", "BTCUSDT", KLineInterval::Min1);
        let k = kline(&id, 60_000, 103.0, 100.0);
        detector.handle_candle(k);

        let (events, _) = sessions.poll_detect(sid).unwrap();
        assert!(events.is_empty());
    }
}
