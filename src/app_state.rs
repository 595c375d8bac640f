// =============================================================================
// Central Application State
// =============================================================================
//
// Single source of truth wiring the history index, session registry,
// detector, and venue adapters together. Subsystems hold their own interior
// mutability; `AppState` exists to give the Query Facade one shared handle.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::info;

use crate::config::AppConfig;
use crate::detector::Detector;
use crate::fetcher::HttpFetcher;
use crate::history::HistoryIndex;
use crate::persistence::UserStore;
use crate::poller::Poller;
use crate::session::SessionRegistry;
use crate::types::{KLine, KLineId};
use crate::venues::DynVenueAdapter;

pub const SERVER_NAME: &str = "kline-sentry";
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// One adapter's poller set, reconciled on each discovery tick (§4.A.2).
pub struct AdapterHandle {
    pub adapter: DynVenueAdapter,
    pub symbol_prefixes: Vec<String>,
    pub intervals: Vec<crate::types::KLineInterval>,
    pub pollers: dashmap::DashMap<KLineId, PollerHandle>,
}

pub struct PollerHandle {
    pub stop_tx: watch::Sender<bool>,
    pub task: tokio::task::JoinHandle<()>,
}

pub struct AppState {
    pub history: Arc<HistoryIndex>,
    pub sessions: Arc<SessionRegistry>,
    pub fetcher: Arc<HttpFetcher>,
    pub adapters: Vec<Arc<AdapterHandle>>,
    pub candle_tx: mpsc::UnboundedSender<KLine>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        config: &AppConfig,
        users: Box<dyn UserStore>,
        adapters: Vec<(DynVenueAdapter, Vec<crate::types::KLineInterval>, Vec<String>)>,
    ) -> anyhow::Result<(Arc<Self>, mpsc::UnboundedReceiver<KLine>)> {
        let fetcher = Arc::new(HttpFetcher::new(&config.proxies)?);
        let history = Arc::new(HistoryIndex::new());
        let sessions = Arc::new(SessionRegistry::new(users, config.system.debug_mode));
        let (candle_tx, candle_rx) = mpsc::unbounded_channel();

        let adapters = adapters
            .into_iter()
            .map(|(adapter, intervals, symbol_prefixes)| {
                Arc::new(AdapterHandle {
                    adapter,
                    symbol_prefixes,
                    intervals,
                    pollers: dashmap::DashMap::new(),
                })
            })
            .collect();

        let state = Arc::new(Self {
            history,
            sessions,
            fetcher,
            adapters,
            candle_tx,
            started_at: Instant::now(),
        });
        Ok((state, candle_rx))
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn venues(&self) -> Vec<String> {
        self.adapters.iter().map(|a| a.adapter.venue_id().to_string()).collect()
    }

    /// Reconcile one adapter's poller set against a freshly-discovered
    /// instrument list (§4.A.2). Idempotent: existing pollers for
    /// still-present ids are untouched; missing ids spawn new pollers;
    /// stale ids are stopped and their history dropped.
    pub fn reconcile_adapter(self: &Arc<Self>, handle: &Arc<AdapterHandle>, discovered: Vec<crate::types::InstrumentId>) {
        let mut wanted: std::collections::HashSet<KLineId> = std::collections::HashSet::new();
        for instrument in &discovered {
            for interval in &handle.intervals {
                if handle.adapter.interval_code(*interval).is_none() {
                    continue;
                }
                wanted.insert(KLineId::new(instrument.venue_id.clone(), instrument.symbol.clone(), *interval));
            }
        }

        for id in &wanted {
            if handle.pollers.contains_key(id) {
                continue;
            }
            let last_closed_seen = self.history.get(id).map(|h| h.last_close()).unwrap_or(0);
            let poller = Arc::new(Poller::new(
                id.clone(),
                handle.adapter.clone(),
                self.fetcher.clone(),
                self.candle_tx.clone(),
                last_closed_seen,
            ));
            let (stop_tx, stop_rx) = watch::channel(false);
            let task = tokio::spawn(poller.run(stop_rx));
            handle.pollers.insert(id.clone(), PollerHandle { stop_tx, task });
            info!(kline_id = %id, "poller started");
        }

        let stale: Vec<KLineId> = handle
            .pollers
            .iter()
            .map(|e| e.key().clone())
            .filter(|id| !wanted.contains(id))
            .collect();
        for id in stale {
            if let Some((_, handle_entry)) = handle.pollers.remove(&id) {
                let _ = handle_entry.stop_tx.send(true);
                handle_entry.task.abort();
            }
            self.history.remove_instrument(&id.venue_id, &id.symbol);
            info!(kline_id = %id, "poller stopped, history dropped");
        }
    }

    /// Run the 60s idle-sweep and 10-minute rediscovery timers alongside the
    /// detector. Shutdown order is Pollers -> Detector -> SessionRegistry ->
    /// QueryFacade (§5/§9); callers abort pollers before dropping this.
    pub async fn run_background_tasks(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut sweep = tokio::time::interval(crate::session::IDLE_TIMEOUT);
        loop {
            tokio::select! {
                _ = stop.changed() => {
                    if *stop.borrow() {
                        return;
                    }
                }
                _ = sweep.tick() => {
                    self.sessions.sweep_idle();
                }
            }
        }
    }

    pub fn now_rfc3339() -> String {
        Utc::now().to_rfc3339()
    }
}
