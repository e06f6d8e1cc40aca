//! Real-time OHLCV aggregation.
//!
//! One open bar per symbol; a tick whose bar boundary is past the open bar
//! closes it and seeds the next one. Late ticks (before the open bar) are
//! dropped, so emitted bars are final and strictly increasing in `bar_ts`.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;

use crate::models::Tick;

/// Async sink receiving each closed bar.
pub type BarSink = Arc<dyn Fn(Bar) -> BoxFuture<'static, ()> + Send + Sync>;

/// An OHLCV bar in fixed-point prices at the first contributing tick's
/// precision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bar {
    /// Tick timestamp floored to the timeframe boundary.
    pub bar_ts: i64,
    pub symbol: String,
    pub open: i64,
    pub high: i64,
    pub low: i64,
    pub close: i64,
    pub volume: u64,
    pub tick_count: u64,
    pub precision: u8,
}

pub struct BarAggregator {
    timeframe_ns: i64,
    timeframe_seconds: u64,
    on_bar: Option<BarSink>,
    bars: Mutex<HashMap<String, Bar>>,
}

impl BarAggregator {
    pub fn new(timeframe_seconds: u64, on_bar: Option<BarSink>) -> Self {
        Self {
            timeframe_ns: timeframe_seconds as i64 * 1_000_000_000,
            timeframe_seconds,
            on_bar,
            bars: Mutex::new(HashMap::new()),
        }
    }

    #[inline]
    pub fn timeframe_seconds(&self) -> u64 {
        self.timeframe_seconds
    }

    #[inline]
    fn bar_ts(&self, tick_time_ns: i64) -> i64 {
        (tick_time_ns / self.timeframe_ns) * self.timeframe_ns
    }

    /// Fold a tick into its symbol's open bar. Returns the closed bar when
    /// the tick crossed a boundary; ticks without any price return `None`.
    pub async fn process_tick(&self, tick: &Tick) -> Option<Bar> {
        let price = tick.best_price()?;
        let size = tick.trade_size.unwrap_or(0);
        let bar_ts = self.bar_ts(tick.timestamp_ns);

        let completed = {
            let mut bars = self.bars.lock();
            match bars.get_mut(&tick.symbol) {
                None => {
                    bars.insert(
                        tick.symbol.clone(),
                        Self::new_bar(bar_ts, tick, price, size),
                    );
                    None
                }
                Some(current) if bar_ts > current.bar_ts => {
                    let closed = std::mem::replace(
                        current,
                        Self::new_bar(bar_ts, tick, price, size),
                    );
                    Some(closed)
                }
                Some(current) if bar_ts == current.bar_ts => {
                    current.high = current.high.max(price);
                    current.low = current.low.min(price);
                    current.close = price;
                    current.volume += size;
                    current.tick_count += 1;
                    None
                }
                // Late tick: emitted bars are never revisited.
                Some(_) => None,
            }
        };

        if let Some(bar) = completed.clone() {
            if let Some(sink) = &self.on_bar {
                sink(bar).await;
            }
        }
        completed
    }

    /// The open (incomplete) bar for a symbol.
    pub fn current_bar(&self, symbol: &str) -> Option<Bar> {
        self.bars.lock().get(symbol).cloned()
    }

    /// Emit every open bar and clear the map; for shutdown.
    pub async fn flush_all(&self) -> Vec<Bar> {
        let bars: Vec<Bar> = {
            let mut map = self.bars.lock();
            let mut drained: Vec<Bar> = map.drain().map(|(_, bar)| bar).collect();
            drained.sort_by(|a, b| a.symbol.cmp(&b.symbol));
            drained
        };
        if let Some(sink) = &self.on_bar {
            for bar in &bars {
                sink(bar.clone()).await;
            }
        }
        bars
    }

    fn new_bar(bar_ts: i64, tick: &Tick, price: i64, size: u64) -> Bar {
        Bar {
            bar_ts,
            symbol: tick.symbol.clone(),
            open: price,
            high: price,
            low: price,
            close: price,
            volume: size,
            tick_count: 1,
            precision: tick.precision,
        }
    }
}
