// =============================================================================
// Binance-style adapter: REST klines endpoint, array-of-arrays rows,
// epoch-ms times, numbers as JSON strings or numbers.
// =============================================================================
//
// Grounded on the public-endpoint shape this teacher's own
// `binance::client::get_klines` already parses.

use async_trait::async_trait;
use tracing::warn;

use crate::fetcher::HttpFetcher;
use crate::types::{InstrumentId, KLineId, KLineInterval};
use crate::venues::{filter_symbols, try_build_kline, VenueAdapter};

const BASE_URL: &str = "https://api.binance.com";

pub struct BinanceAdapter {
    venue_id: String,
}

impl BinanceAdapter {
    pub fn new() -> Self {
        Self {
            venue_id: "binance".to_string(),
        }
    }
}

impl Default for BinanceAdapter {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_str_f64(val: &serde_json::Value) -> Option<f64> {
    match val {
        serde_json::Value::String(s) => s.parse::<f64>().ok(),
        serde_json::Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

#[async_trait]
impl VenueAdapter for BinanceAdapter {
    fn venue_id(&self) -> &str {
        &self.venue_id
    }

    fn interval_code(&self, interval: KLineInterval) -> Option<String> {
        let code = match interval {
            KLineInterval::Min1 => "1m",
            KLineInterval::Min5 => "5m",
            KLineInterval::Min15 => "15m",
            KLineInterval::Min30 => "30m",
            KLineInterval::Min60 => "1h",
            KLineInterval::Hour4 => "4h",
            KLineInterval::Hour8 => "8h",
            KLineInterval::Day1 => "1d",
            KLineInterval::Week1 => "1w",
            KLineInterval::Min10 => return None,
        };
        Some(code.to_string())
    }

    fn page_limit(&self) -> u32 {
        1000
    }

    async fn discover_instruments(
        &self,
        fetcher: &HttpFetcher,
        accepted_prefixes: &[String],
    ) -> anyhow::Result<Vec<InstrumentId>> {
        let url = format!("{BASE_URL}/api/v3/exchangeInfo");
        let resp = fetcher.fetch(&url, Default::default()).await?;
        let root: serde_json::Value = serde_json::from_str(&resp.body)?;
        let symbols = root["symbols"]
            .as_array()
            .ok_or_else(|| anyhow::anyhow!("missing field symbols"))?;
        let mut names = Vec::new();
        for s in symbols {
            let Some(name) = s["symbol"].as_str() else {
                continue;
            };
            let status_trading = s["status"].as_str() == Some("TRADING");
            if status_trading && name.ends_with("USDT") {
                names.push(name.to_string());
            }
        }
        Ok(filter_symbols(&self.venue_id, names, accepted_prefixes))
    }

    fn build_kline_url(&self, symbol: &str, interval: KLineInterval, count: u32, _last_closed_seen: i64) -> String {
        let code = self.interval_code(interval).unwrap_or_default();
        format!("{BASE_URL}/api/v3/klines?symbol={symbol}&interval={code}&limit={count}")
    }

    fn parse_klines(&self, symbol: &str, interval: KLineInterval, body: &str) -> anyhow::Result<Vec<crate::types::KLine>> {
        let rows: Vec<serde_json::Value> = serde_json::from_str(body)?;
        let id = KLineId::new(&self.venue_id, symbol, interval);
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let arr = match row.as_array() {
                Some(a) if a.len() >= 7 => a,
                _ => {
                    warn!("binance kline row is not a >=7-element array");
                    continue;
                }
            };
            let open_time = match arr[0].as_i64() {
                Some(v) => v,
                None => continue,
            };
            let (open, high, low, close, volume, quote_volume) = match (
                parse_str_f64(&arr[1]),
                parse_str_f64(&arr[2]),
                parse_str_f64(&arr[3]),
                parse_str_f64(&arr[4]),
                parse_str_f64(&arr[5]),
                parse_str_f64(&arr[7]),
            ) {
                (Some(o), Some(h), Some(l), Some(c), Some(v), Some(qv)) => (o, h, l, c, v, qv),
                _ => {
                    warn!("binance kline row has unparsable numeric field");
                    continue;
                }
            };
            if let Some(k) = try_build_kline(id.clone(), open_time, open, high, low, close, volume, quote_volume) {
                out.push(k);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_code_covers_all_but_min10() {
        let a = BinanceAdapter::new();
        assert_eq!(a.interval_code(KLineInterval::Min1).as_deref(), Some("1m"));
        assert_eq!(a.interval_code(KLineInterval::Min10), None);
    }

    #[test]
    fn parse_klines_drops_short_rows() {
        let a = BinanceAdapter::new();
        let body = serde_json::json!([
            [60_000, "100.0", "103.0", "100.0", "101.0", "10.0", 123, "1000.0"],
            [1, 2, 3],
        ])
        .to_string();
        let out = a.parse_klines("BTCUSDT", KLineInterval::Min1, &body).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].open_time, 60_000);
    }
}
