// =============================================================================
// Bybit-style adapter: `{"result":{"list":[...]}}` envelope, array rows in
// reverse-chronological (newest-first) order, numbers as JSON strings,
// epoch-ms times.
// =============================================================================
//
// Grounded on `original_source/Src/bybitkline.cpp`.

use async_trait::async_trait;
use tracing::warn;

use crate::fetcher::HttpFetcher;
use crate::types::{InstrumentId, KLine, KLineId, KLineInterval};
use crate::venues::{filter_symbols, try_build_kline, VenueAdapter};

const BASE_URL: &str = "https://api.bybit.com";

pub struct BybitAdapter {
    venue_id: String,
}

impl BybitAdapter {
    pub fn new() -> Self {
        Self {
            venue_id: "bybit".to_string(),
        }
    }
}

impl Default for BybitAdapter {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_str_f64(val: &serde_json::Value) -> Option<f64> {
    val.as_str().and_then(|s| s.parse::<f64>().ok())
}

#[async_trait]
impl VenueAdapter for BybitAdapter {
    fn venue_id(&self) -> &str {
        &self.venue_id
    }

    fn interval_code(&self, interval: KLineInterval) -> Option<String> {
        let code = match interval {
            KLineInterval::Min1 => "1",
            KLineInterval::Min5 => "5",
            KLineInterval::Min15 => "15",
            KLineInterval::Min30 => "30",
            KLineInterval::Min60 => "60",
            KLineInterval::Hour4 => "240",
            KLineInterval::Hour8 => "360",
            KLineInterval::Day1 => "D",
            KLineInterval::Week1 => "W",
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
        let url = format!("{BASE_URL}/v5/market/instruments-info?category=spot");
        let resp = fetcher.fetch(&url, Default::default()).await?;
        let root: serde_json::Value = serde_json::from_str(&resp.body)?;
        let list = root["result"]["list"]
            .as_array()
            .ok_or_else(|| anyhow::anyhow!("missing field result.list"))?;
        let mut names = Vec::new();
        for s in list {
            let Some(name) = s["symbol"].as_str() else {
                continue;
            };
            let trading = s["status"].as_str() == Some("Trading");
            if trading && name.ends_with("USDT") {
                names.push(name.to_string());
            }
        }
        Ok(filter_symbols(&self.venue_id, names, accepted_prefixes))
    }

    fn build_kline_url(&self, symbol: &str, interval: KLineInterval, count: u32, _last_closed_seen: i64) -> String {
        let code = self.interval_code(interval).unwrap_or_default();
        format!("{BASE_URL}/v5/market/kline?category=spot&symbol={symbol}&interval={code}&limit={count}")
    }

    fn parse_klines(&self, symbol: &str, interval: KLineInterval, body: &str) -> anyhow::Result<Vec<KLine>> {
        let root: serde_json::Value = serde_json::from_str(body)?;
        let list = root["result"]["list"]
            .as_array()
            .ok_or_else(|| anyhow::anyhow!("missing field result.list"))?;
        let id = KLineId::new(&self.venue_id, symbol, interval);
        // Bybit returns rows newest-first; canonical order is ascending.
        let mut out = Vec::with_capacity(list.len());
        for row in list.iter().rev() {
            let arr = match row.as_array() {
                Some(a) if a.len() >= 7 => a,
                _ => {
                    warn!("bybit kline row is not a >=7-element array");
                    continue;
                }
            };
            let open_time: i64 = match arr[0].as_str().and_then(|s| s.parse().ok()) {
                Some(v) => v,
                None => continue,
            };
            let (open, high, low, close, volume, quote_volume) = match (
                parse_str_f64(&arr[1]),
                parse_str_f64(&arr[2]),
                parse_str_f64(&arr[3]),
                parse_str_f64(&arr[4]),
                parse_str_f64(&arr[5]),
                parse_str_f64(&arr[6]),
            ) {
                (Some(o), Some(h), Some(l), Some(c), Some(v), Some(qv)) => (o, h, l, c, v, qv),
                _ => {
                    warn!("bybit kline row has unparsable numeric field");
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
    fn interval_code_matches_bybit_table() {
        let a = BybitAdapter::new();
        assert_eq!(a.interval_code(KLineInterval::Day1).as_deref(), Some("D"));
        assert_eq!(a.interval_code(KLineInterval::Week1).as_deref(), Some("W"));
        assert_eq!(a.interval_code(KLineInterval::Min10), None);
    }

    #[test]
    fn parse_klines_reverses_newest_first_order() {
        let a = BybitAdapter::new();
        let body = serde_json::json!({
            "result": {
                "list": [
                    ["120000", "100.0", "103.0", "100.0", "101.0", "10.0", "1000.0"],
                    ["60000", "100.0", "103.0", "100.0", "101.0", "10.0", "1000.0"],
                ]
            }
        })
        .to_string();
        let out = a.parse_klines("BTCUSDT", KLineInterval::Min1, &body).unwrap();
        assert_eq!(out.len(), 2);
        assert!(out[0].open_time < out[1].open_time);
    }
}
