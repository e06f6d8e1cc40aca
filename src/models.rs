//! Core data model: normalized ticks, feed statistics, feed configuration.
//!
//! Prices are carried as fixed-point integer mantissas
//! (`price_i = round(price * 10^precision)`) end to end; floats exist only at
//! serialization boundaries.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock time in nanoseconds since the Unix epoch.
#[inline]
pub fn current_time_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Kind of market-data event a tick represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TickKind {
    Trade,
    Quote,
    /// Best bid/offer (top of book).
    Bbo,
}

impl TickKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TickKind::Trade => "trade",
            TickKind::Quote => "quote",
            TickKind::Bbo => "bbo",
        }
    }
}

/// Upstream market-data vendors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vendor {
    Databento,
    Bloomberg,
    Cme,
    Ice,
    Refinitiv,
}

impl Vendor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Vendor::Databento => "databento",
            Vendor::Bloomberg => "bloomberg",
            Vendor::Cme => "cme",
            Vendor::Ice => "ice",
            Vendor::Refinitiv => "refinitiv",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "databento" => Some(Vendor::Databento),
            "bloomberg" => Some(Vendor::Bloomberg),
            "cme" => Some(Vendor::Cme),
            "ice" => Some(Vendor::Ice),
            "refinitiv" => Some(Vendor::Refinitiv),
            _ => None,
        }
    }
}

impl std::fmt::Display for Vendor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalized market-data tick.
///
/// Produced by exactly one vendor handler and never mutated afterwards.
/// At least one of the three prices is present; a `Bbo` tick carries both
/// bid and ask.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Tick {
    /// Nanoseconds since epoch; vendor-supplied when available, else ingress
    /// wall clock.
    pub timestamp_ns: i64,
    /// Vendor-normalized symbol (e.g. "ESZ4").
    pub symbol: String,
    pub kind: TickKind,

    // Fixed-point mantissas, `price * 10^precision`.
    pub bid_price: Option<i64>,
    pub ask_price: Option<i64>,
    pub trade_price: Option<i64>,

    pub bid_size: Option<u64>,
    pub ask_size: Option<u64>,
    pub trade_size: Option<u64>,

    pub exchange: Option<String>,
    pub vendor: Option<Vendor>,
    /// Vendor sequence number, used for gap detection.
    pub sequence_num: Option<u64>,

    /// Decimal digits encoded into the fixed-point mantissas (0..=9).
    pub precision: u8,
}

impl Tick {
    /// Convert a fixed-point mantissa to a float at this tick's precision.
    #[inline]
    pub fn price_f64(&self, mantissa: i64) -> f64 {
        mantissa as f64 / 10f64.powi(self.precision as i32)
    }

    /// Mid price from bid/ask, if both are present.
    #[inline]
    pub fn mid_price(&self) -> Option<f64> {
        match (self.bid_price, self.ask_price) {
            (Some(bid), Some(ask)) => Some((bid + ask) as f64 / 2.0 / 10f64.powi(self.precision as i32)),
            _ => None,
        }
    }

    /// Trade price as a float, if present.
    #[inline]
    pub fn trade_price_f64(&self) -> Option<f64> {
        self.trade_price.map(|p| self.price_f64(p))
    }

    /// The price the aggregator keys on: trade, else bid, else ask.
    #[inline]
    pub fn best_price(&self) -> Option<i64> {
        self.trade_price.or(self.bid_price).or(self.ask_price)
    }
}

/// Round a decimal price into a fixed-point mantissa at `precision` digits.
#[inline]
pub fn to_fixed_point(price: f64, precision: u8) -> i64 {
    (price * 10f64.powi(precision as i32)).round() as i64
}

/// Per-(vendor, symbol) feed health counters.
#[derive(Debug, Clone)]
pub struct FeedStats {
    pub vendor: Vendor,
    pub symbol: String,
    pub ticks_received: u64,
    pub last_tick_time_ns: i64,
    pub gaps_detected: u64,
    pub last_sequence: u64,
    /// EWMA of ingress latency, alpha = 0.1, seeded by the first sample.
    pub latency_ns_avg: i64,
}

impl FeedStats {
    pub fn new(vendor: Vendor, symbol: impl Into<String>) -> Self {
        Self {
            vendor,
            symbol: symbol.into(),
            ticks_received: 0,
            last_tick_time_ns: 0,
            gaps_detected: 0,
            last_sequence: 0,
            latency_ns_avg: 0,
        }
    }

    /// Fold a delivered tick into the counters.
    pub fn update(&mut self, tick: &Tick, receive_time_ns: i64) {
        self.ticks_received += 1;

        if let Some(seq) = tick.sequence_num {
            if self.last_sequence > 0 && seq != self.last_sequence + 1 {
                self.gaps_detected += 1;
            }
            self.last_sequence = seq;
        }

        if tick.timestamp_ns > 0 {
            let latency = receive_time_ns - tick.timestamp_ns;
            if self.latency_ns_avg == 0 {
                self.latency_ns_avg = latency;
            } else {
                self.latency_ns_avg =
                    (0.9 * self.latency_ns_avg as f64 + 0.1 * latency as f64) as i64;
            }
        }

        self.last_tick_time_ns = receive_time_ns;
    }
}

/// Lifecycle state of a feed, as reported in status snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeedState {
    Stopped,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl std::fmt::Display for FeedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "STOPPED"),
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Connected => write!(f, "CONNECTED"),
            Self::Reconnecting => write!(f, "RECONNECTING"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// Configuration for one vendor feed.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub vendor: Vendor,
    pub symbols: Vec<String>,
    pub enabled: bool,

    pub api_key: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub dataset: Option<String>,

    /// -1 means retry forever.
    pub reconnect_max_attempts: i32,
    pub reconnect_delay_seconds: f64,
}

impl FeedConfig {
    pub fn new(vendor: Vendor, symbols: Vec<String>) -> Self {
        Self {
            vendor,
            symbols,
            enabled: true,
            api_key: None,
            host: None,
            port: None,
            dataset: None,
            reconnect_max_attempts: -1,
            reconnect_delay_seconds: 1.0,
        }
    }
}

/// Aggregated status of a feed across its subscribed symbols.
#[derive(Debug, Clone, Serialize)]
pub struct FeedStatus {
    pub vendor: Vendor,
    pub state: FeedState,
    pub connected: bool,
    pub symbols: Vec<String>,
    pub ticks_received: u64,
    pub last_tick_time: i64,
    pub errors: Vec<String>,
    pub latency_avg_us: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbo(symbol: &str, seq: u64) -> Tick {
        Tick {
            timestamp_ns: 1_000,
            symbol: symbol.to_string(),
            kind: TickKind::Bbo,
            bid_price: Some(453225),
            ask_price: Some(453250),
            trade_price: None,
            bid_size: Some(150),
            ask_size: Some(200),
            trade_size: None,
            exchange: None,
            vendor: Some(Vendor::Databento),
            sequence_num: Some(seq),
            precision: 2,
        }
    }

    #[test]
    fn test_fixed_point_round_trip() {
        for &(price, precision) in &[(4532.25, 2u8), (1.23456789, 8), (0.5, 0), (99.999, 3)] {
            let mantissa = to_fixed_point(price, precision);
            let back = mantissa as f64 / 10f64.powi(precision as i32);
            let ulp = 10f64.powi(-(precision as i32));
            assert!(
                (back - price).abs() <= ulp,
                "round trip {price} @ p{precision}: {back}"
            );
        }
        assert_eq!(to_fixed_point(4532.25, 2), 453225);
    }

    #[test]
    fn test_mid_price() {
        let tick = bbo("ESZ4", 1);
        let mid = tick.mid_price().unwrap();
        assert!((mid - 4532.375).abs() < 1e-9);
        assert_eq!(tick.best_price(), Some(453225));
    }

    #[test]
    fn test_gap_detection() {
        let mut stats = FeedStats::new(Vendor::Databento, "ESZ4");
        for seq in [100u64, 101, 105, 106, 110] {
            stats.update(&bbo("ESZ4", seq), 2_000);
        }
        // 101 -> 105 and 106 -> 110 are gaps; the first observed sequence is not.
        assert_eq!(stats.gaps_detected, 2);
        assert_eq!(stats.last_sequence, 110);
        assert_eq!(stats.ticks_received, 5);
    }

    #[test]
    fn test_latency_ewma_seeded_by_first_sample() {
        let mut stats = FeedStats::new(Vendor::Cme, "ESZ4");
        let mut tick = bbo("ESZ4", 1);
        tick.sequence_num = None;
        stats.update(&tick, 2_000); // latency 1000
        assert_eq!(stats.latency_ns_avg, 1_000);
        stats.update(&tick, 3_000); // latency 2000
        assert_eq!(stats.latency_ns_avg, (0.9 * 1_000.0 + 0.1 * 2_000.0) as i64);
    }

    #[test]
    fn test_vendor_parse() {
        assert_eq!(Vendor::parse(" databento "), Some(Vendor::Databento));
        assert_eq!(Vendor::parse("CME"), Some(Vendor::Cme));
        assert_eq!(Vendor::parse("nyse"), None);
    }
}
