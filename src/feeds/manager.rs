//! Feed manager: orchestrates vendor handlers, fans ticks into the pipeline,
//! and aggregates per-feed status.
//!
//! One registry entry per vendor holds the config, lifecycle state, handler,
//! and supervisor task. The central tick path runs on whichever handler task
//! produced the tick: batcher first, then the per-tick callback, then the
//! aggregator. A failed feed is marked ERROR and logged; it never takes the
//! manager down.

use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicI64, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::bloomberg::{BloombergConfig, BloombergHandler};
use super::cme::{CmeConfig, CmeHandler};
use super::databento::{DatabentoConfig, DatabentoHandler, FramingMode};
use super::handler::{run_handler, FeedHandler, ReconnectPolicy, SharedFeedState};
use super::{ErrorCallback, FeedError, TickCallback};
use crate::models::{
    current_time_ns, FeedConfig, FeedState, FeedStatus, Tick, Vendor,
};
use crate::pipeline::{BarAggregator, BarSink, BatchSink, BatcherConfig, BufferStats, TickBatcher};
use crate::publisher::{timeframe_label, RedisPublisher};

const MAX_RECORDED_ERRORS: usize = 10;

#[derive(Debug, Clone, Copy)]
pub struct FeedManagerConfig {
    pub buffer_capacity: usize,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
}

impl Default for FeedManagerConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 65536,
            batch_size: 1000,
            flush_interval_ms: 100,
        }
    }
}

/// Aggregate manager statistics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ManagerStats {
    pub total_ticks: u64,
    pub ticks_per_second: f64,
    pub uptime_seconds: f64,
    pub feeds_connected: usize,
    pub feeds_total: usize,
    pub buffer: Option<BufferStats>,
}

/// Central tick fan-out shared with every supervisor task.
struct FanOut {
    batcher: Option<Arc<TickBatcher>>,
    aggregator: RwLock<Option<Arc<BarAggregator>>>,
    on_tick: Option<TickCallback>,
    total_ticks: AtomicU64,
}

impl FanOut {
    async fn handle_tick(&self, tick: Tick) {
        self.total_ticks.fetch_add(1, Ordering::Relaxed);

        if let Some(batcher) = &self.batcher {
            batcher.push(tick.clone()).await;
        }
        if let Some(cb) = &self.on_tick {
            cb(tick.clone()).await;
        }
        let aggregator = self.aggregator.read().clone();
        if let Some(aggregator) = aggregator {
            aggregator.process_tick(&tick).await;
        }
    }
}

struct FeedEntry {
    config: FeedConfig,
    state: SharedFeedState,
    handler: Option<Arc<dyn FeedHandler>>,
    task: Option<JoinHandle<()>>,
    errors: Arc<Mutex<Vec<String>>>,
}

impl FeedEntry {
    fn new(config: FeedConfig) -> Self {
        Self {
            config,
            state: Arc::new(RwLock::new(FeedState::Stopped)),
            handler: None,
            task: None,
            errors: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn record_error(errors: &Mutex<Vec<String>>, message: String) {
        let mut errors = errors.lock();
        if errors.len() >= MAX_RECORDED_ERRORS {
            errors.remove(0);
        }
        errors.push(message);
    }
}

pub struct FeedManager {
    fanout: Arc<FanOut>,
    publisher: Option<Arc<RedisPublisher>>,
    feeds: Mutex<HashMap<Vendor, FeedEntry>>,
    start_time_ns: AtomicI64,
}

impl FeedManager {
    /// Build a manager. The batcher exists whenever there is somewhere for
    /// batches to go (a user sink or the publisher).
    pub fn new(
        config: FeedManagerConfig,
        on_tick: Option<TickCallback>,
        on_batch: Option<BatchSink>,
        publisher: Option<Arc<RedisPublisher>>,
    ) -> Self {
        let batcher = if on_batch.is_some() || publisher.is_some() {
            let user_sink = on_batch;
            let batch_publisher = publisher.clone();
            let sink: BatchSink = Arc::new(move |batch: Vec<Tick>| {
                let user_sink = user_sink.clone();
                let batch_publisher = batch_publisher.clone();
                Box::pin(async move {
                    if let Some(publisher) = &batch_publisher {
                        for tick in &batch {
                            publisher.publish_tick(tick).await;
                        }
                    }
                    if let Some(user_sink) = &user_sink {
                        user_sink(batch).await;
                    }
                })
            });
            Some(TickBatcher::new(
                BatcherConfig {
                    batch_size: config.batch_size,
                    flush_interval_ms: config.flush_interval_ms,
                    capacity: config.buffer_capacity,
                },
                sink,
            ))
        } else {
            None
        };

        Self {
            fanout: Arc::new(FanOut {
                batcher,
                aggregator: RwLock::new(None),
                on_tick,
                total_ticks: AtomicU64::new(0),
            }),
            publisher,
            feeds: Mutex::new(HashMap::new()),
            start_time_ns: AtomicI64::new(0),
        }
    }

    /// Turn on real-time OHLCV aggregation; closed bars go to `on_bar` and,
    /// when a publisher is wired, onto the bar channels.
    pub fn enable_aggregation(&self, timeframe_seconds: u64, on_bar: Option<BarSink>) {
        let label = timeframe_label(timeframe_seconds);
        let bar_publisher = self.publisher.clone();

        let sink: Option<BarSink> = if on_bar.is_some() || bar_publisher.is_some() {
            Some(Arc::new(move |bar| {
                let on_bar = on_bar.clone();
                let bar_publisher = bar_publisher.clone();
                let label = label.clone();
                Box::pin(async move {
                    if let Some(publisher) = &bar_publisher {
                        publisher.publish_bar(&bar, &label).await;
                    }
                    if let Some(on_bar) = &on_bar {
                        on_bar(bar).await;
                    }
                })
            }))
        } else {
            None
        };

        *self.fanout.aggregator.write() =
            Some(Arc::new(BarAggregator::new(timeframe_seconds, sink)));
    }

    /// Register a feed. Replaces any existing configuration for the vendor.
    pub fn add_feed(&self, config: FeedConfig) {
        self.feeds
            .lock()
            .insert(config.vendor, FeedEntry::new(config));
    }

    pub fn configured_vendors(&self) -> Vec<Vendor> {
        self.feeds.lock().keys().copied().collect()
    }

    /// Vendor-specific handler factory.
    fn create_handler(&self, config: &FeedConfig) -> Result<Arc<dyn FeedHandler>, FeedError> {
        match config.vendor {
            Vendor::Databento => Ok(DatabentoHandler::new(DatabentoConfig {
                api_key: config.api_key.clone().unwrap_or_default(),
                dataset: config
                    .dataset
                    .clone()
                    .unwrap_or_else(|| "GLBX.MDP3".to_string()),
                host: config.host.clone().unwrap_or_else(|| "localhost".to_string()),
                port: config.port.unwrap_or(13000),
                mode: FramingMode::Text,
                ..Default::default()
            })),
            Vendor::Bloomberg => Ok(BloombergHandler::with_mock_session(BloombergConfig {
                host: config.host.clone().unwrap_or_else(|| "localhost".to_string()),
                port: config.port.unwrap_or(8194),
                ..Default::default()
            })),
            Vendor::Cme => {
                let mut cme = CmeConfig::default();
                if let Some(host) = &config.host {
                    cme.multicast_group = host.parse().map_err(|_| {
                        FeedError::Config(format!("invalid multicast group {host}"))
                    })?;
                }
                if let Some(port) = config.port {
                    cme.port = port;
                }
                Ok(CmeHandler::new(cme))
            }
            vendor => Err(FeedError::Config(format!("unsupported vendor: {vendor}"))),
        }
    }

    /// Start the batcher and every enabled feed. Per-feed failures are
    /// recorded and logged; the manager keeps going.
    pub async fn start(&self) {
        self.start_time_ns.store(current_time_ns(), Ordering::SeqCst);

        if let Some(batcher) = &self.fanout.batcher {
            batcher.start();
        }

        let vendors: Vec<Vendor> = {
            let feeds = self.feeds.lock();
            feeds
                .iter()
                .filter(|(_, entry)| entry.config.enabled)
                .map(|(vendor, _)| *vendor)
                .collect()
        };

        for vendor in vendors {
            self.start_feed(vendor).await;
        }

        if let Some(publisher) = &self.publisher {
            publisher.set_connected_feeds(self.connected_feed_names());
        }
    }

    async fn start_feed(&self, vendor: Vendor) {
        let (config, state, errors) = {
            let mut feeds = self.feeds.lock();
            let Some(entry) = feeds.get_mut(&vendor) else {
                return;
            };
            *entry.state.write() = FeedState::Connecting;
            (entry.config.clone(), entry.state.clone(), entry.errors.clone())
        };

        let fail = |message: String| {
            error!(vendor = %vendor, error = %message, "feed_start_failed");
            FeedEntry::record_error(&errors, message);
            *state.write() = FeedState::Error;
        };

        let handler = match self.create_handler(&config) {
            Ok(handler) => handler,
            Err(err) => {
                fail(err.to_string());
                return;
            }
        };

        if let Err(err) = handler.connect().await {
            fail(err.to_string());
            return;
        }
        if let Err(err) = handler.subscribe(&config.symbols).await {
            fail(err.to_string());
            return;
        }
        *state.write() = FeedState::Connected;

        let policy = ReconnectPolicy {
            initial_delay: Duration::from_secs_f64(config.reconnect_delay_seconds.max(0.001)),
            max_delay: Duration::from_secs(60),
            max_attempts: config.reconnect_max_attempts,
        };

        let fanout = self.fanout.clone();
        let on_tick: TickCallback = Arc::new(move |tick| {
            let fanout = fanout.clone();
            Box::pin(async move { fanout.handle_tick(tick).await })
        });

        let error_sink = errors.clone();
        let on_error: ErrorCallback = Arc::new(move |err: FeedError| {
            let error_sink = error_sink.clone();
            Box::pin(async move {
                FeedEntry::record_error(&error_sink, err.to_string());
            })
        });

        let task = tokio::spawn(run_handler(
            handler.clone(),
            on_tick,
            Some(on_error),
            policy,
            state.clone(),
        ));

        {
            let mut feeds = self.feeds.lock();
            if let Some(entry) = feeds.get_mut(&vendor) {
                entry.handler = Some(handler);
                entry.task = Some(task);
            }
        }

        info!(
            vendor = %vendor,
            symbols = config.symbols.len(),
            "feed_started"
        );
    }

    /// Stop every feed, the batcher, and flush the aggregator. Idempotent.
    pub async fn stop(&self) {
        let entries: Vec<(Vendor, Option<Arc<dyn FeedHandler>>, Option<JoinHandle<()>>)> = {
            let mut feeds = self.feeds.lock();
            feeds
                .iter_mut()
                .map(|(vendor, entry)| (*vendor, entry.handler.take(), entry.task.take()))
                .collect()
        };

        for (_, handler, _) in &entries {
            if let Some(handler) = handler {
                handler.core().stop();
            }
        }

        for (vendor, handler, task) in entries {
            if let Some(task) = task {
                task.abort();
                // Cancellation is the expected outcome here.
                let _ = task.await;
            }
            if let Some(handler) = handler {
                handler.disconnect().await;
            }
            let feeds = self.feeds.lock();
            if let Some(entry) = feeds.get(&vendor) {
                *entry.state.write() = FeedState::Stopped;
            }
        }

        if let Some(batcher) = &self.fanout.batcher {
            batcher.stop().await;
        }

        let aggregator = self.fanout.aggregator.read().clone();
        if let Some(aggregator) = aggregator {
            aggregator.flush_all().await;
        }

        info!("all_feeds_stopped");
    }

    /// Subscribe additional symbols on a connected feed and grow its config.
    pub async fn subscribe(&self, vendor: Vendor, symbols: &[String]) -> Result<(), FeedError> {
        let handler = {
            let feeds = self.feeds.lock();
            feeds
                .get(&vendor)
                .and_then(|entry| entry.handler.clone())
        };
        let Some(handler) = handler else {
            return Err(FeedError::Config(format!("feed {vendor} is not running")));
        };
        if !handler.core().is_connected() {
            return Err(FeedError::Connection(format!("feed {vendor} is not connected")));
        }
        handler.subscribe(symbols).await?;

        let mut feeds = self.feeds.lock();
        if let Some(entry) = feeds.get_mut(&vendor) {
            for symbol in symbols {
                if !entry.config.symbols.contains(symbol) {
                    entry.config.symbols.push(symbol.clone());
                }
            }
        }
        Ok(())
    }

    /// Unsubscribe symbols on a connected feed and shrink its config.
    pub async fn unsubscribe(&self, vendor: Vendor, symbols: &[String]) -> Result<(), FeedError> {
        let handler = {
            let feeds = self.feeds.lock();
            feeds
                .get(&vendor)
                .and_then(|entry| entry.handler.clone())
        };
        let Some(handler) = handler else {
            return Err(FeedError::Config(format!("feed {vendor} is not running")));
        };
        if handler.core().is_connected() {
            handler.unsubscribe(symbols).await?;
        }

        let mut feeds = self.feeds.lock();
        if let Some(entry) = feeds.get_mut(&vendor) {
            entry.config.symbols.retain(|s| !symbols.contains(s));
        }
        Ok(())
    }

    /// Per-feed status aggregated across the handler's symbols.
    pub fn get_status(&self, vendor: Vendor) -> Option<FeedStatus> {
        let feeds = self.feeds.lock();
        let entry = feeds.get(&vendor)?;

        let stats = entry
            .handler
            .as_ref()
            .map(|h| h.core().all_stats())
            .unwrap_or_default();

        let ticks_received: u64 = stats.values().map(|s| s.ticks_received).sum();
        let last_tick_time = stats
            .values()
            .map(|s| s.last_tick_time_ns)
            .max()
            .unwrap_or(0);
        let latency_avg_ns = if stats.is_empty() {
            0
        } else {
            stats.values().map(|s| s.latency_ns_avg).sum::<i64>() / stats.len() as i64
        };

        let status = FeedStatus {
            vendor,
            state: *entry.state.read(),
            connected: entry
                .handler
                .as_ref()
                .map(|h| h.core().is_connected())
                .unwrap_or(false),
            symbols: entry.config.symbols.clone(),
            ticks_received,
            last_tick_time,
            errors: entry.errors.lock().clone(),
            latency_avg_us: latency_avg_ns / 1000,
        };
        Some(status)
    }

    pub fn get_all_status(&self) -> HashMap<Vendor, FeedStatus> {
        let vendors = self.configured_vendors();
        vendors
            .into_iter()
            .filter_map(|vendor| self.get_status(vendor).map(|status| (vendor, status)))
            .collect()
    }

    /// Names of feeds whose handler is currently connected.
    pub fn connected_feed_names(&self) -> Vec<String> {
        let feeds = self.feeds.lock();
        feeds
            .iter()
            .filter(|(_, entry)| {
                entry
                    .handler
                    .as_ref()
                    .map(|h| h.core().is_connected())
                    .unwrap_or(false)
            })
            .map(|(vendor, _)| vendor.to_string())
            .collect()
    }

    pub fn get_stats(&self) -> ManagerStats {
        let start = self.start_time_ns.load(Ordering::SeqCst);
        let uptime_seconds = if start > 0 {
            (current_time_ns() - start) as f64 / 1e9
        } else {
            0.0
        };
        let total_ticks = self.fanout.total_ticks.load(Ordering::Relaxed);

        let (connected, total) = {
            let feeds = self.feeds.lock();
            let connected = feeds
                .values()
                .filter(|entry| {
                    entry
                        .handler
                        .as_ref()
                        .map(|h| h.core().is_connected())
                        .unwrap_or(false)
                })
                .count();
            (connected, feeds.len())
        };

        ManagerStats {
            total_ticks,
            ticks_per_second: if uptime_seconds > 0.0 {
                total_ticks as f64 / uptime_seconds
            } else {
                0.0
            },
            uptime_seconds,
            feeds_connected: connected,
            feeds_total: total,
            buffer: self.fanout.batcher.as_ref().map(|b| b.stats()),
        }
    }

    /// Surface a warning when a feed's supervisor has died unexpectedly.
    pub fn check_feed_health(&self) {
        let feeds = self.feeds.lock();
        for (vendor, entry) in feeds.iter() {
            if let Some(task) = &entry.task {
                if task.is_finished() && *entry.state.read() != FeedState::Stopped {
                    warn!(vendor = %vendor, "feed_supervisor_exited");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TickKind;
    use std::sync::atomic::AtomicUsize;

    fn manager_with_sinks() -> (FeedManager, Arc<Mutex<Vec<Vec<Tick>>>>, Arc<AtomicUsize>) {
        let batches: Arc<Mutex<Vec<Vec<Tick>>>> = Arc::new(Mutex::new(Vec::new()));
        let batch_copy = batches.clone();
        let on_batch: BatchSink = Arc::new(move |batch| {
            let batch_copy = batch_copy.clone();
            Box::pin(async move {
                batch_copy.lock().push(batch);
            })
        });

        let tick_count = Arc::new(AtomicUsize::new(0));
        let count_copy = tick_count.clone();
        let on_tick: TickCallback = Arc::new(move |_tick| {
            let count_copy = count_copy.clone();
            Box::pin(async move {
                count_copy.fetch_add(1, Ordering::SeqCst);
            })
        });

        let manager = FeedManager::new(
            FeedManagerConfig {
                batch_size: 2,
                flush_interval_ms: 10_000,
                buffer_capacity: 64,
            },
            Some(on_tick),
            Some(on_batch),
            None,
        );
        (manager, batches, tick_count)
    }

    fn trade(symbol: &str, ts_ns: i64, price: i64) -> Tick {
        Tick {
            timestamp_ns: ts_ns,
            symbol: symbol.to_string(),
            kind: TickKind::Trade,
            bid_price: None,
            ask_price: None,
            trade_price: Some(price),
            bid_size: None,
            ask_size: None,
            trade_size: Some(1),
            exchange: None,
            vendor: Some(Vendor::Cme),
            sequence_num: None,
            precision: 2,
        }
    }

    #[tokio::test]
    async fn test_fan_out_order_and_counters() {
        let (manager, batches, tick_count) = manager_with_sinks();
        manager.enable_aggregation(60, None);

        manager.fanout.handle_tick(trade("ES", 1_000_000_000, 100)).await;
        manager.fanout.handle_tick(trade("ES", 2_000_000_000, 110)).await;

        // batch_size=2 forces an inline flush on the second tick.
        assert_eq!(batches.lock().len(), 1);
        assert_eq!(tick_count.load(Ordering::SeqCst), 2);

        let stats = manager.get_stats();
        assert_eq!(stats.total_ticks, 2);
        let buffer = stats.buffer.unwrap();
        assert_eq!(buffer.received, 2);
        assert_eq!(buffer.processed, 2);

        let aggregator = manager.fanout.aggregator.read().clone().unwrap();
        assert_eq!(aggregator.current_bar("ES").unwrap().tick_count, 2);
    }

    #[tokio::test]
    async fn test_unknown_vendor_is_config_error() {
        let (manager, _, _) = manager_with_sinks();
        let config = FeedConfig::new(Vendor::Ice, vec!["BRN".to_string()]);
        let result = manager.create_handler(&config);
        assert!(matches!(result, Err(FeedError::Config(_))));
    }

    #[tokio::test]
    async fn test_failed_feed_does_not_abort_manager() {
        let (manager, _, _) = manager_with_sinks();
        // ICE is configured but unsupported; Bloomberg's mock session works.
        manager.add_feed(FeedConfig::new(Vendor::Ice, vec!["BRN".to_string()]));
        manager.add_feed(FeedConfig::new(
            Vendor::Bloomberg,
            vec!["ESZ4 Index".to_string()],
        ));

        manager.start().await;

        let ice = manager.get_status(Vendor::Ice).unwrap();
        assert_eq!(ice.state, FeedState::Error);
        assert!(!ice.errors.is_empty());

        let bloomberg = manager.get_status(Vendor::Bloomberg).unwrap();
        assert!(bloomberg.connected);

        manager.stop().await;
        let bloomberg = manager.get_status(Vendor::Bloomberg).unwrap();
        assert_eq!(bloomberg.state, FeedState::Stopped);
        assert!(!bloomberg.connected);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (manager, _, _) = manager_with_sinks();
        manager.add_feed(FeedConfig::new(
            Vendor::Bloomberg,
            vec!["ESZ4 Index".to_string()],
        ));
        manager.start().await;
        manager.stop().await;
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_subscribe_updates_config() {
        let (manager, _, _) = manager_with_sinks();
        manager.add_feed(FeedConfig::new(
            Vendor::Bloomberg,
            vec!["ESZ4 Index".to_string()],
        ));
        manager.start().await;

        manager
            .subscribe(Vendor::Bloomberg, &["NQZ4 Index".to_string()])
            .await
            .unwrap();
        let status = manager.get_status(Vendor::Bloomberg).unwrap();
        assert_eq!(status.symbols.len(), 2);

        manager
            .unsubscribe(Vendor::Bloomberg, &["ESZ4 Index".to_string()])
            .await
            .unwrap();
        let status = manager.get_status(Vendor::Bloomberg).unwrap();
        assert_eq!(status.symbols, vec!["NQZ4 Index".to_string()]);

        manager.stop().await;
    }
}
