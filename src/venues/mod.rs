pub mod binance;
pub mod bybit;
pub mod moex;

pub use binance::BinanceAdapter;
pub use bybit::BybitAdapter;
pub use moex::MoexAdapter;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::fetcher::HttpFetcher;
use crate::types::{InstrumentId, KLine, KLineId, KLineInterval};

/// Sentinel returned by `interval_code` for an interval the venue does not
/// support; the corresponding Poller is never created (§4.A.4).
pub const UNKNOWN_INTERVAL: &str = "UNKNOWN";

/// Per-venue adapter: instrument discovery, interval-code table, and the
/// venue-specific JSON -> canonical KLine mapping (§4.A).
#[async_trait]
pub trait VenueAdapter: Send + Sync {
    /// Stable identifier for this venue, used as `KLineId::venue_id`.
    fn venue_id(&self) -> &str;

    /// Venue-specific wire code for `interval`, or `None` if unsupported.
    fn interval_code(&self, interval: KLineInterval) -> Option<String>;

    /// Venue page-size cap for a single kline request.
    fn page_limit(&self) -> u32;

    /// Fetch and parse the venue's instrument list, applying the
    /// prefix-filter (`accepted_prefixes`; empty = accept all) and any
    /// venue-native predicate (e.g. "ends in USDT").
    async fn discover_instruments(
        &self,
        fetcher: &HttpFetcher,
        accepted_prefixes: &[String],
    ) -> anyhow::Result<Vec<InstrumentId>>;

    /// Build the request URL for `count` candles of `symbol`/`interval`
    /// starting after `last_closed_seen` (epoch-ms, 0 = from the start).
    fn build_kline_url(&self, symbol: &str, interval: KLineInterval, count: u32, last_closed_seen: i64) -> String;

    /// Parse a raw response body into canonical candles. Per-row failures
    /// are dropped with a WARN and do not fail the whole batch; a body that
    /// isn't the expected shape at all returns `Err`.
    fn parse_klines(&self, symbol: &str, interval: KLineInterval, body: &str) -> anyhow::Result<Vec<KLine>>;
}

fn prefix_accepted(symbol: &str, accepted_prefixes: &[String]) -> bool {
    accepted_prefixes.is_empty() || accepted_prefixes.iter().any(|p| symbol.starts_with(p.as_str()))
}

/// Build the canonical `KLineId` list an adapter should be polling, applying
/// the prefix filter. Shared helper used by all three adapters'
/// `discover_instruments` implementations.
pub(crate) fn filter_symbols(venue_id: &str, symbols: Vec<String>, accepted_prefixes: &[String]) -> Vec<InstrumentId> {
    symbols
        .into_iter()
        .filter(|s| prefix_accepted(s, accepted_prefixes))
        .map(|s| InstrumentId::new(venue_id, s))
        .collect()
}

/// Helper shared by adapters: build a `KLine`, logging and dropping on
/// invariant violation rather than failing the whole batch (§4.A.3/§7).
pub(crate) fn try_build_kline(
    id: KLineId,
    open_time: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    quote_volume: f64,
) -> Option<KLine> {
    match KLine::new(id, open_time, open, high, low, close, volume, quote_volume) {
        Ok(k) => Some(k),
        Err(e) => {
            warn!(error = %e, "dropping malformed kline row");
            None
        }
    }
}

pub type DynVenueAdapter = Arc<dyn VenueAdapter>;
