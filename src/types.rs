// =============================================================================
// Canonical data model: intervals, instrument/kline identifiers, candles,
// filters and user configuration.
// =============================================================================

use anyhow::{bail, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashSet;

/// Candle duration. The numeric value (ms) is used arithmetically for
/// request sizing, alignment checks, and cooldown scheduling, and is also
/// the wire representation: `Filter.interval` round-trips as a bare
/// millisecond integer (e.g. `60000`), not the variant name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KLineInterval {
    Min1,
    Min5,
    Min10,
    Min15,
    Min30,
    Min60,
    Hour4,
    Hour8,
    Day1,
    Week1,
}

impl KLineInterval {
    pub const ALL: [KLineInterval; 10] = [
        Self::Min1,
        Self::Min5,
        Self::Min10,
        Self::Min15,
        Self::Min30,
        Self::Min60,
        Self::Hour4,
        Self::Hour8,
        Self::Day1,
        Self::Week1,
    ];

    /// Duration of one candle, in milliseconds.
    pub fn millis(self) -> i64 {
        match self {
            Self::Min1 => 60_000,
            Self::Min5 => 5 * 60_000,
            Self::Min10 => 10 * 60_000,
            Self::Min15 => 15 * 60_000,
            Self::Min30 => 30 * 60_000,
            Self::Min60 => 60 * 60_000,
            Self::Hour4 => 4 * 60 * 60_000,
            Self::Hour8 => 8 * 60 * 60_000,
            Self::Day1 => 24 * 60 * 60_000,
            Self::Week1 => 7 * 24 * 60 * 60_000,
        }
    }

    /// Parse the config-file shorthand ("1m", "5m", "1h", "4h", "1d", "1w").
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s.trim() {
            "1m" => Self::Min1,
            "5m" => Self::Min5,
            "10m" => Self::Min10,
            "15m" => Self::Min15,
            "30m" => Self::Min30,
            "60m" | "1h" => Self::Min60,
            "4h" => Self::Hour4,
            "8h" => Self::Hour8,
            "1d" => Self::Day1,
            "1w" => Self::Week1,
            _ => return None,
        })
    }

    /// Inverse of `millis()`; the wire/JSON representation.
    pub fn from_millis(ms: i64) -> Option<Self> {
        Some(match ms {
            60_000 => Self::Min1,
            300_000 => Self::Min5,
            600_000 => Self::Min10,
            900_000 => Self::Min15,
            1_800_000 => Self::Min30,
            3_600_000 => Self::Min60,
            14_400_000 => Self::Hour4,
            28_800_000 => Self::Hour8,
            86_400_000 => Self::Day1,
            604_800_000 => Self::Week1,
            _ => return None,
        })
    }
}

impl Serialize for KLineInterval {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.millis())
    }
}

impl<'de> Deserialize<'de> for KLineInterval {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let ms = i64::deserialize(deserializer)?;
        Self::from_millis(ms).ok_or_else(|| serde::de::Error::custom(format!("unknown interval {ms}ms")))
    }
}

impl std::fmt::Display for KLineInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Min1 => "1m",
            Self::Min5 => "5m",
            Self::Min10 => "10m",
            Self::Min15 => "15m",
            Self::Min30 => "30m",
            Self::Min60 => "1h",
            Self::Hour4 => "4h",
            Self::Hour8 => "8h",
            Self::Day1 => "1d",
            Self::Week1 => "1w",
        };
        write!(f, "{s}")
    }
}

/// A tradable instrument on a single venue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstrumentId {
    pub venue_id: String,
    pub symbol: String,
}

impl InstrumentId {
    pub fn new(venue_id: impl Into<String>, symbol: impl Into<String>) -> Self {
        Self {
            venue_id: venue_id.into(),
            symbol: symbol.into(),
        }
    }
}

/// Unique key for a poller, and for a history slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KLineId {
    pub venue_id: String,
    pub symbol: String,
    pub interval: KLineInterval,
}

impl KLineId {
    pub fn new(venue_id: impl Into<String>, symbol: impl Into<String>, interval: KLineInterval) -> Self {
        Self {
            venue_id: venue_id.into(),
            symbol: symbol.into(),
            interval,
        }
    }
}

impl std::fmt::Display for KLineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.venue_id, self.symbol, self.interval)
    }
}

/// Canonical candle. Prices/volumes are `f64` — the same representation the
/// upstream venues already hand us as JSON (either numeric or
/// string-encoded decimals), and `serde_json` round-trips `f64` losslessly
/// for the magnitudes these venues emit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KLine {
    pub id: KLineId,
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub quote_volume: f64,
}

impl KLine {
    /// Construct a candle, validating the invariants from the data model.
    /// A failure here is the "single row dropped with WARN" path used by
    /// every venue adapter's row parser.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: KLineId,
        open_time: i64,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
        quote_volume: f64,
    ) -> Result<Self> {
        let interval = id.interval.millis();
        let close_time = open_time + interval;
        if low <= 0.0 {
            bail!("low must be > 0, got {low}");
        }
        if !(low <= open && open <= high) || !(low <= close && close <= high) {
            bail!("open/close must lie within [low, high]");
        }
        if open_time % interval != 0 {
            bail!("openTime {open_time} not aligned to interval {interval}");
        }
        Ok(Self {
            id,
            open_time,
            close_time,
            open,
            high,
            low,
            close,
            volume,
            quote_volume,
        })
    }

    /// `(high - low) / low`.
    pub fn delta(&self) -> f64 {
        (self.high - self.low) / self.low
    }

    /// `quoteVolume` normalized against a supplied recent mean; `0.0` mean
    /// yields `0.0` rather than dividing by zero (an empty/young history).
    pub fn volume_delta(&self, mean_quote_volume: f64) -> f64 {
        if mean_quote_volume <= 0.0 {
            0.0
        } else {
            self.quote_volume / mean_quote_volume
        }
    }
}

/// A user-defined anomaly predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Filter {
    Delta {
        min: f64,
        max: f64,
        interval: KLineInterval,
        #[serde(default)]
        include: Option<HashSet<String>>,
        #[serde(default)]
        exclude: Option<HashSet<String>>,
    },
    VolumeDelta {
        min: f64,
        max: f64,
        interval: KLineInterval,
        #[serde(default)]
        include: Option<HashSet<String>>,
        #[serde(default)]
        exclude: Option<HashSet<String>>,
    },
    /// Reserved; no evaluation logic exists yet.
    OrderBookDepth,
}

impl Filter {
    pub fn interval(&self) -> Option<KLineInterval> {
        match self {
            Self::Delta { interval, .. } | Self::VolumeDelta { interval, .. } => Some(*interval),
            Self::OrderBookDepth => None,
        }
    }

    /// Symbol admitted by this filter's include/exclude lists (empty/absent
    /// include = accept all; presence on exclude always rejects).
    pub fn admits_symbol(&self, symbol: &str) -> bool {
        let (include, exclude) = match self {
            Self::Delta { include, exclude, .. } | Self::VolumeDelta { include, exclude, .. } => {
                (include, exclude)
            }
            Self::OrderBookDepth => return true,
        };
        if let Some(ex) = exclude {
            if ex.contains(symbol) {
                return false;
            }
        }
        match include {
            Some(inc) => inc.contains(symbol),
            None => true,
        }
    }
}

/// Per-user subscription and filter set. JSON round-trips structurally.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserConfig {
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub subscribed_venues: HashSet<String>,
}

/// Emitted by the Detector on a filter hit (§3/§4.E).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectEvent {
    pub kline_id: KLineId,
    pub triggering_candle: KLine,
    /// Tail of `kline_id`'s own history (<= 20 candles).
    pub history_tail: Vec<KLine>,
    /// Tail of a coarser interval's history for the same symbol (VolumeDelta
    /// review window); empty when not applicable.
    pub review_tail: Vec<KLine>,
    pub filter_activated: Filter,
}

/// Persisted user record (§3/§6). Persistence itself is an external
/// collaborator; this is the shape the collaborator round-trips.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub name: String,
    pub password: String,
    pub config: UserConfig,
    pub last_login: chrono::DateTime<chrono::Utc>,
}
