// =============================================================================
// Filter evaluation — §4.E predicate semantics.
// =============================================================================

use crate::history::{RollingHistory, DEFAULT_MEAN_WINDOW};
use crate::types::{Filter, KLine, KLineId};

/// Evaluate `filter` against candle `k` (whose id is `id`), using `history`
/// (the RollingHistory for `id`) to compute the recent-mean denominator for
/// VolumeDelta. Returns `true` on a match.
pub fn evaluate(filter: &Filter, id: &KLineId, k: &KLine, history: &RollingHistory) -> bool {
    if !filter.admits_symbol(&id.symbol) {
        return false;
    }
    match filter {
        Filter::Delta { min, max, interval, .. } => {
            *interval == id.interval && in_range(k.delta(), *min, *max)
        }
        Filter::VolumeDelta { min, max, interval, .. } => {
            if *interval != id.interval {
                return false;
            }
            let mean = history.mean_quote_volume(DEFAULT_MEAN_WINDOW);
            in_range(k.volume_delta(mean), *min, *max)
        }
        Filter::OrderBookDepth => false,
    }
}

fn in_range(v: f64, min: f64, max: f64) -> bool {
    v >= min && v <= max
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::KLineInterval;

    fn kline(id: &KLineId, open_time: i64, high: f64, low: f64, quote_volume: f64) -> KLine {
        KLine::new(id.clone(), open_time, low, high, low, low, 1.0, quote_volume).unwrap()
    }

    #[test]
    fn delta_filter_matches_within_range() {
        let id = KLineId::new("binance", "BTCUSDT", KLineInterval::Min1);
        let k = kline(&id, 60_000, 103.0, 100.0, 1000.0);
        let h = RollingHistory::new();
        let f = Filter::Delta {
            min: 0.02,
            max: 1.0,
            interval: KLineInterval::Min1,
            include: None,
            exclude: None,
        };
        assert!(evaluate(&f, &id, &k, &h));
    }

    #[test]
    fn delta_filter_rejects_wrong_interval() {
        let id = KLineId::new("binance", "BTCUSDT", KLineInterval::Min1);
        let k = kline(&id, 60_000, 103.0, 100.0, 1000.0);
        let h = RollingHistory::new();
        let f = Filter::Delta {
            min: 0.02,
            max: 1.0,
            interval: KLineInterval::Min5,
            include: None,
            exclude: None,
        };
        assert!(!evaluate(&f, &id, &k, &h));
    }

    #[test]
    fn volume_delta_uses_history_mean() {
        let id = KLineId::new("binance", "BTCUSDT", KLineInterval::Min1);
        let h = RollingHistory::new();
        for i in 0..5 {
            h.append(kline(&id, (i as i64 + 1) * 60_000, 103.0, 100.0, 1000.0));
        }
        let k = kline(&id, 6 * 60_000, 103.0, 100.0, 2000.0);
        let f = Filter::VolumeDelta {
            min: 1.5,
            max: 3.0,
            interval: KLineInterval::Min1,
            include: None,
            exclude: None,
        };
        assert!(evaluate(&f, &id, &k, &h));
    }

    #[test]
    fn exclude_list_beats_match() {
        let id = KLineId::new("binance", "BTCUSDT", KLineInterval::Min1);
        let k = kline(&id, 60_000, 103.0, 100.0, 1000.0);
        let h = RollingHistory::new();
        let f = Filter::Delta {
            min: 0.0,
            max: 1.0,
            interval: KLineInterval::Min1,
            include: None,
            exclude: Some(std::collections::HashSet::from(["BTCUSDT".to_string()])),
        };
        assert!(!evaluate(&f, &id, &k, &h));
    }
}
