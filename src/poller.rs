// =============================================================================
// Poller — one per KLineId. Request sizing, duplicate suppression, cooldown,
// and the two backoff classes (§4.B).
// =============================================================================

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use reqwest::StatusCode;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::types::{KLine, KLineId};
use crate::venues::DynVenueAdapter;
use crate::fetcher::HttpFetcher;

/// Status >= this, or a cancelled request, triggers LONG_BACKOFF.
const LONG_BACKOFF: Duration = Duration::from_secs(10 * 60);
/// Base for SHORT_BACKOFF; `interval + U[0, interval)` is added on top.
const SHORT_BACKOFF_BASE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffClass {
    Long,
    Short,
}

fn backoff_duration(class: BackoffClass, interval_ms: i64) -> Duration {
    match class {
        BackoffClass::Long => LONG_BACKOFF,
        BackoffClass::Short => {
            let jitter_ms = rand::thread_rng().gen_range(0..interval_ms.max(1));
            SHORT_BACKOFF_BASE + Duration::from_millis((interval_ms + jitter_ms) as u64)
        }
    }
}

/// Number of candles to request, per §4.B's sizing formula, capped at the
/// venue's page limit.
pub fn request_count(now_ms: i64, last_closed_seen: i64, interval_ms: i64, page_limit: u32) -> u32 {
    let elapsed = (now_ms - last_closed_seen).max(0);
    let wanted = (elapsed as f64 / interval_ms as f64).ceil() as i64 + 10;
    wanted.clamp(1, page_limit as i64) as u32
}

/// Drop the last (possibly still-forming) row, drop rows with
/// `closeTime <= last_closed_seen`, and return the surviving rows in
/// ascending `closeTime` order plus the advanced `last_closed_seen`.
///
/// `rows` is expected pre-sorted ascending by `openTime` (adapters already
/// normalize venue-specific ordering before this call).
pub fn dedupe_and_discard_tail(mut rows: Vec<KLine>, last_closed_seen: i64) -> (Vec<KLine>, i64) {
    if rows.is_empty() {
        return (rows, last_closed_seen);
    }
    rows.pop(); // possibly still-open
    let mut advanced = last_closed_seen;
    rows.retain(|k| {
        if k.close_time <= advanced {
            false
        } else {
            advanced = advanced.max(k.close_time);
            true
        }
    });
    (rows, advanced)
}

/// One per `(venue, symbol, interval)`. Owns no shared state beyond its own
/// `last_closed_seen` cursor; history/detector wiring happens downstream of
/// `out_tx`.
pub struct Poller {
    pub id: KLineId,
    adapter: DynVenueAdapter,
    fetcher: Arc<HttpFetcher>,
    out_tx: mpsc::UnboundedSender<KLine>,
    last_closed_seen: AtomicI64,
}

impl Poller {
    pub fn new(
        id: KLineId,
        adapter: DynVenueAdapter,
        fetcher: Arc<HttpFetcher>,
        out_tx: mpsc::UnboundedSender<KLine>,
        initial_last_closed_seen: i64,
    ) -> Self {
        Self {
            id,
            adapter,
            fetcher,
            out_tx,
            last_closed_seen: AtomicI64::new(initial_last_closed_seen),
        }
    }

    /// Run the IDLE -> REQUESTING -> COOLDOWN/backoff loop until `stop`
    /// fires. Terminates within one in-flight request of a stop signal.
    pub async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        loop {
            if *stop.borrow() {
                return;
            }

            let sleep_for = tokio::select! {
                _ = stop.changed() => {
                    if *stop.borrow() {
                        return;
                    }
                    continue;
                }
                result = self.request_once() => {
                    match result {
                        Ok(()) => self.id.interval.millis() as u64 * 2,
                        Err(class) => backoff_duration(class, self.id.interval.millis()).as_millis() as u64,
                    }
                }
            };

            tokio::select! {
                _ = stop.changed() => {
                    if *stop.borrow() {
                        return;
                    }
                }
                _ = tokio::time::sleep(Duration::from_millis(sleep_for)) => {}
            }
        }
    }

    async fn request_once(&self) -> Result<(), BackoffClass> {
        let interval_ms = self.id.interval.millis();
        let last_closed_seen = self.last_closed_seen.load(Ordering::Acquire);
        let now_ms = chrono::Utc::now().timestamp_millis();
        let count = request_count(now_ms, last_closed_seen, interval_ms, self.adapter.page_limit());
        let url = self
            .adapter
            .build_kline_url(&self.id.symbol, self.id.interval, count, last_closed_seen);

        let resp = match self.fetcher.fetch(&url, Default::default()).await {
            Ok(r) => r,
            Err(e) => {
                warn!(kline_id = %self.id, error = %e, "poller transport error");
                return Err(BackoffClass::Short);
            }
        };

        if resp.status.as_u16() >= 400 || resp.status == StatusCode::TOO_MANY_REQUESTS {
            warn!(kline_id = %self.id, status = resp.status.as_u16(), "poller received error status");
            return Err(BackoffClass::Long);
        }

        let rows = match self.adapter.parse_klines(&self.id.symbol, self.id.interval, &resp.body) {
            Ok(r) => r,
            Err(e) => {
                warn!(kline_id = %self.id, error = %e, "poller failed to parse response");
                return Err(BackoffClass::Short);
            }
        };

        let (emitted, advanced) = dedupe_and_discard_tail(rows, last_closed_seen);
        self.last_closed_seen.store(advanced, Ordering::Release);

        for k in emitted {
            debug!(kline_id = %self.id, close_time = k.close_time, "poller emitting candle");
            let _ = self.out_tx.send(k);
        }

        info!(kline_id = %self.id, "poller cooldown entered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::KLineInterval;

    fn k(id: &KLineId, open_time: i64) -> KLine {
        KLine::new(id.clone(), open_time, 100.0, 103.0, 100.0, 101.0, 10.0, 1000.0).unwrap()
    }

    #[test]
    fn request_count_formula_matches_spec() {
        // now=0, lastClosedSeen=-600_000 (10 intervals ago) -> ceil(10)+10 = 20
        let n = request_count(0, -600_000, 60_000, 1000);
        assert_eq!(n, 20);
    }

    #[test]
    fn request_count_caps_at_page_limit() {
        let n = request_count(100_000_000_000, 0, 60_000, 200);
        assert_eq!(n, 200);
    }

    #[test]
    fn dedupe_discards_last_row_and_old_rows() {
        let id = KLineId::new("binance", "BTCUSDT", KLineInterval::Min1);
        let rows = vec![k(&id, 0), k(&id, 60_000), k(&id, 120_000), k(&id, 180_000)];
        let (emitted, advanced) = dedupe_and_discard_tail(rows, 0);
        // last row (openTime=180_000) dropped as possibly-open; remaining
        // closeTimes are 60_000, 120_000, 180_000 — all > lastClosedSeen=0.
        assert_eq!(emitted.len(), 3);
        assert_eq!(advanced, 180_000);
    }

    #[test]
    fn dedupe_drops_rows_at_or_before_last_closed_seen() {
        let id = KLineId::new("binance", "BTCUSDT", KLineInterval::Min1);
        let rows = vec![k(&id, 0), k(&id, 60_000), k(&id, 120_000)];
        let (emitted, advanced) = dedupe_and_discard_tail(rows, 60_000);
        // last row dropped (openTime=120_000, closeTime=180_000); of the
        // remaining rows, closeTime=60_000 <= lastClosedSeen is dropped,
        // closeTime=120_000 survives.
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].close_time, 120_000);
        assert_eq!(advanced, 120_000);
    }

    #[test]
    fn reapplying_same_response_yields_no_change() {
        let id = KLineId::new("binance", "BTCUSDT", KLineInterval::Min1);
        let rows = vec![k(&id, 0), k(&id, 60_000), k(&id, 120_000), k(&id, 180_000)];
        let (_, advanced1) = dedupe_and_discard_tail(rows.clone(), 0);
        let (emitted2, advanced2) = dedupe_and_discard_tail(rows, advanced1);
        assert_eq!(emitted2.len(), 0);
        assert_eq!(advanced2, advanced1);
    }
}

/// Exercises the IDLE -> REQUESTING -> COOLDOWN/backoff state machine in
/// `Poller::run` itself, against a real local HTTP server (`wiremock`) with
/// virtual time (`tokio::time::pause`/`advance`) standing in for the 60s/10min
/// real-world delays.
#[cfg(test)]
mod run_tests {
    use super::*;
    use crate::types::{InstrumentId, KLineInterval};
    use crate::venues::VenueAdapter;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicI64;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn k_at(id: &KLineId, open_time: i64) -> KLine {
        KLine::new(id.clone(), open_time, 100.0, 103.0, 100.0, 101.0, 10.0, 1000.0).unwrap()
    }

    /// Counts every URL built (one per `request_once` attempt, independent of
    /// the eventual status), and every successful parse (one per 200
    /// response). Each successful parse synthesizes two strictly-increasing
    /// rows so a candle is always emitted on `out_tx`, giving tests a
    /// channel-based signal for "a request cycle completed" that doesn't
    /// depend on virtual-time races.
    struct TestAdapter {
        base_url: String,
        requests_built: Arc<AtomicI64>,
        parses: Arc<AtomicI64>,
    }

    #[async_trait]
    impl VenueAdapter for TestAdapter {
        fn venue_id(&self) -> &str {
            "test"
        }

        fn interval_code(&self, _interval: KLineInterval) -> Option<String> {
            Some("1m".to_string())
        }

        fn page_limit(&self) -> u32 {
            1000
        }

        async fn discover_instruments(
            &self,
            _fetcher: &HttpFetcher,
            _accepted_prefixes: &[String],
        ) -> anyhow::Result<Vec<InstrumentId>> {
            Ok(Vec::new())
        }

        fn build_kline_url(&self, symbol: &str, _interval: KLineInterval, count: u32, _last_closed_seen: i64) -> String {
            self.requests_built.fetch_add(1, Ordering::SeqCst);
            format!("{}/klines?symbol={symbol}&limit={count}", self.base_url)
        }

        fn parse_klines(&self, symbol: &str, interval: KLineInterval, _body: &str) -> anyhow::Result<Vec<KLine>> {
            let n = self.parses.fetch_add(1, Ordering::SeqCst);
            let id = KLineId::new("test", symbol, interval);
            let base = n * 2 * interval.millis();
            Ok(vec![k_at(&id, base), k_at(&id, base + interval.millis())])
        }
    }

    /// Yields repeatedly so a real (non-timer) completion already scheduled
    /// on the executor — a loopback HTTP round trip, a watch-channel wakeup —
    /// gets to run, without advancing virtual time.
    async fn drain_ready() {
        for _ in 0..200 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_after_success_waits_two_intervals() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET")).respond_with(ResponseTemplate::new(200)).mount(&mock_server).await;

        let requests_built = Arc::new(AtomicI64::new(0));
        let parses = Arc::new(AtomicI64::new(0));
        let adapter: DynVenueAdapter = Arc::new(TestAdapter {
            base_url: mock_server.uri(),
            requests_built: requests_built.clone(),
            parses: parses.clone(),
        });
        let fetcher = Arc::new(HttpFetcher::new(&[]).unwrap());
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let id = KLineId::new("test", "BTCUSDT", KLineInterval::Min1);
        let poller = Arc::new(Poller::new(id, adapter, fetcher, out_tx, 0));
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(poller.run(stop_rx));

        let first = tokio::time::timeout(Duration::from_secs(5), out_rx.recv()).await.unwrap();
        assert!(first.is_some());
        assert_eq!(parses.load(Ordering::SeqCst), 1);

        // Cooldown after a success is 2x the interval (120s for Min1, §4.B).
        // Advancing just short of that must not trigger a second request.
        tokio::time::advance(Duration::from_millis(119_000)).await;
        drain_ready().await;
        assert_eq!(parses.load(Ordering::SeqCst), 1, "cooldown fired early");

        tokio::time::advance(Duration::from_millis(2_000)).await;
        let second = tokio::time::timeout(Duration::from_secs(5), out_rx.recv()).await.unwrap();
        assert!(second.is_some());
        assert_eq!(parses.load(Ordering::SeqCst), 2);

        let _ = stop_tx.send(true);
        let _ = task.await;
    }

    #[tokio::test(start_paused = true)]
    async fn error_status_triggers_long_backoff_before_retry() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET")).respond_with(ResponseTemplate::new(500)).mount(&mock_server).await;

        let requests_built = Arc::new(AtomicI64::new(0));
        let parses = Arc::new(AtomicI64::new(0));
        let adapter: DynVenueAdapter = Arc::new(TestAdapter {
            base_url: mock_server.uri(),
            requests_built: requests_built.clone(),
            parses,
        });
        let fetcher = Arc::new(HttpFetcher::new(&[]).unwrap());
        let (out_tx, _out_rx) = mpsc::unbounded_channel();
        let id = KLineId::new("test", "BTCUSDT", KLineInterval::Min1);
        let poller = Arc::new(Poller::new(id, adapter, fetcher, out_tx, 0));
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(poller.run(stop_rx));

        drain_ready().await;
        assert_eq!(requests_built.load(Ordering::SeqCst), 1);

        // LONG_BACKOFF is 10 minutes; just under that must not retry yet.
        tokio::time::advance(Duration::from_secs(10 * 60 - 1)).await;
        drain_ready().await;
        assert_eq!(requests_built.load(Ordering::SeqCst), 1, "retried before LONG_BACKOFF elapsed");

        tokio::time::advance(Duration::from_secs(2)).await;
        drain_ready().await;
        assert_eq!(requests_built.load(Ordering::SeqCst), 2);

        let _ = stop_tx.send(true);
        let _ = task.await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_signal_cancels_during_cooldown_sleep() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET")).respond_with(ResponseTemplate::new(200)).mount(&mock_server).await;

        let requests_built = Arc::new(AtomicI64::new(0));
        let parses = Arc::new(AtomicI64::new(0));
        let adapter: DynVenueAdapter = Arc::new(TestAdapter {
            base_url: mock_server.uri(),
            requests_built,
            parses,
        });
        let fetcher = Arc::new(HttpFetcher::new(&[]).unwrap());
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let id = KLineId::new("test", "BTCUSDT", KLineInterval::Min1);
        let poller = Arc::new(Poller::new(id, adapter, fetcher, out_tx, 0));
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(poller.run(stop_rx));

        // Let the first request complete so the poller enters its cooldown
        // sleep (120s out), then stop it well before that sleep would fire.
        let _ = tokio::time::timeout(Duration::from_secs(5), out_rx.recv()).await.unwrap();
        let _ = stop_tx.send(true);

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("poller should exit promptly on stop, not wait out the cooldown")
            .unwrap();
    }
}
