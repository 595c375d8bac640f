// =============================================================================
// MOEX-style adapter: columnar object layout, positional column names
// resolved at parse time, datetime-string open/close times.
// =============================================================================
//
// Grounded on `original_source/Src/moexkline.cpp`.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use tracing::warn;

use crate::fetcher::HttpFetcher;
use crate::types::{InstrumentId, KLine, KLineId, KLineInterval};
use crate::venues::{filter_symbols, try_build_kline, VenueAdapter};

const BASE_URL: &str = "https://iss.moex.com";
const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub struct MoexAdapter {
    venue_id: String,
    engines: String,
    markets: String,
    boards: String,
}

impl MoexAdapter {
    pub fn new(engines: impl Into<String>, markets: impl Into<String>, boards: impl Into<String>) -> Self {
        Self {
            venue_id: "moex".to_string(),
            engines: engines.into(),
            markets: markets.into(),
            boards: boards.into(),
        }
    }
}

impl Default for MoexAdapter {
    fn default() -> Self {
        Self::new("stock", "shares", "TQBR")
    }
}

fn parse_datetime_ms(s: &str) -> Option<i64> {
    NaiveDateTime::parse_from_str(s, DATETIME_FORMAT)
        .ok()
        .map(|dt| dt.and_utc().timestamp_millis())
}

#[async_trait]
impl VenueAdapter for MoexAdapter {
    fn venue_id(&self) -> &str {
        &self.venue_id
    }

    fn interval_code(&self, interval: KLineInterval) -> Option<String> {
        let code = match interval {
            KLineInterval::Min1 => "1",
            KLineInterval::Min10 => "10",
            _ => return None,
        };
        Some(code.to_string())
    }

    fn page_limit(&self) -> u32 {
        500
    }

    async fn discover_instruments(
        &self,
        fetcher: &HttpFetcher,
        accepted_prefixes: &[String],
    ) -> anyhow::Result<Vec<InstrumentId>> {
        let url = format!(
            "{BASE_URL}/iss/engines/{}/markets/{}/boards/{}/securities.json?iss.meta=off",
            self.engines, self.markets, self.boards
        );
        let resp = fetcher.fetch(&url, Default::default()).await?;
        let root: serde_json::Value = serde_json::from_str(&resp.body)?;
        let securities = &root["securities"];
        let columns = securities["columns"]
            .as_array()
            .ok_or_else(|| anyhow::anyhow!("missing field securities.columns"))?;
        let secid_index = columns.iter().position(|c| c.as_str() == Some("SECID"));
        let rows = securities["data"]
            .as_array()
            .ok_or_else(|| anyhow::anyhow!("missing field securities.data"))?;
        let mut names = Vec::new();
        if let Some(idx) = secid_index {
            for row in rows {
                if let Some(name) = row.as_array().and_then(|r| r.get(idx)).and_then(|v| v.as_str()) {
                    names.push(name.to_string());
                }
            }
        }
        Ok(filter_symbols(&self.venue_id, names, accepted_prefixes))
    }

    fn build_kline_url(&self, symbol: &str, interval: KLineInterval, _count: u32, last_closed_seen: i64) -> String {
        let code = self.interval_code(interval).unwrap_or_default();
        let from = chrono::DateTime::from_timestamp_millis(last_closed_seen)
            .unwrap_or_default()
            .format(DATETIME_FORMAT);
        format!(
            "{BASE_URL}/iss/engines/{}/markets/{}/boards/{}/securities/{symbol}/candles.json?iss.meta=off&interval={code}&from={from}",
            self.engines, self.markets, self.boards
        )
    }

    fn parse_klines(&self, symbol: &str, interval: KLineInterval, body: &str) -> anyhow::Result<Vec<KLine>> {
        let root: serde_json::Value = serde_json::from_str(body)?;
        let candles = &root["candles"];
        let columns = candles["columns"]
            .as_array()
            .ok_or_else(|| anyhow::anyhow!("missing field candles.columns"))?;
        let col_names: Vec<String> = columns.iter().filter_map(|c| c.as_str().map(str::to_string)).collect();
        let rows = candles["data"]
            .as_array()
            .ok_or_else(|| anyhow::anyhow!("missing field candles.data"))?;
        let id = KLineId::new(&self.venue_id, symbol, interval);
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(cells) = row.as_array() else {
                warn!("moex candle row is not an array");
                continue;
            };
            let mut open = None;
            let mut high = None;
            let mut low = None;
            let mut close = None;
            let mut volume = None;
            let mut quote_volume = None;
            let mut open_time = None;
            for (i, name) in col_names.iter().enumerate() {
                let Some(cell) = cells.get(i) else { continue };
                match name.as_str() {
                    "open" => open = cell.as_f64(),
                    "high" => high = cell.as_f64(),
                    "low" => low = cell.as_f64(),
                    "close" => close = cell.as_f64(),
                    "volume" => volume = cell.as_f64(),
                    "value" => quote_volume = cell.as_f64(),
                    "begin" => open_time = cell.as_str().and_then(parse_datetime_ms),
                    _ => {}
                }
            }
            let (Some(o), Some(h), Some(l), Some(c), Some(v), Some(qv), Some(ot)) =
                (open, high, low, close, volume, quote_volume, open_time)
            else {
                warn!("moex candle row missing a required column value");
                continue;
            };
            if let Some(k) = try_build_kline(id.clone(), ot, o, h, l, c, v, qv) {
                out.push(k);
            }
        }
        Ok(out)
    }
}
