//! Redis pub/sub publisher for normalized ticks, closed bars, and feed
//! status.
//!
//! Channel layout:
//!   `<prefix>:ticks:<symbol>`          high-frequency tick payloads
//!   `<prefix>:bars:<symbol>:<tf>`      OHLCV bars on close
//!   `<prefix>:status:feeds`            health frame every few seconds
//!
//! Publishes are batched: messages accumulate under a lock and go out as one
//! non-transactional pipeline either when the batch fills or when the flush
//! timer fires, whichever comes first. A failed pipeline marks the publisher
//! disconnected, counts the lost messages, and schedules a reconnect with
//! exponential backoff.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::models::Tick;
use crate::pipeline::Bar;

/// Human-readable timeframe label used in bar channel names and payloads.
pub fn timeframe_label(seconds: u64) -> String {
    if seconds > 0 && seconds % 3600 == 0 {
        format!("{}h", seconds / 3600)
    } else if seconds > 0 && seconds % 60 == 0 {
        format!("{}m", seconds / 60)
    } else {
        format!("{seconds}s")
    }
}

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub host: String,
    pub port: u16,
    pub channel_prefix: String,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub reconnect_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub status_interval: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            channel_prefix: "trading".to_string(),
            batch_size: 100,
            flush_interval_ms: 10,
            reconnect_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            status_interval: Duration::from_secs(5),
        }
    }
}

impl PublisherConfig {
    /// Load from environment with defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(v) = std::env::var("REDIS_HOST") {
            config.host = v;
        }
        if let Ok(v) = std::env::var("REDIS_PORT") {
            config.port = v.parse().unwrap_or(config.port);
        }
        if let Ok(v) = std::env::var("REDIS_CHANNEL_PREFIX") {
            config.channel_prefix = v;
        }
        if let Ok(v) = std::env::var("PUBLISH_BATCH_SIZE") {
            config.batch_size = v.parse().unwrap_or(config.batch_size);
        }
        if let Ok(v) = std::env::var("PUBLISH_FLUSH_MS") {
            config.flush_interval_ms = v.parse().unwrap_or(config.flush_interval_ms);
        }
        config
    }

    fn url(&self) -> String {
        format!("redis://{}:{}", self.host, self.port)
    }
}

/// JSON tick payload with ms-epoch timestamp and float prices.
fn tick_payload(tick: &Tick) -> String {
    let divisor = 10f64.powi(tick.precision as i32);
    json!({
        "type": "tick",
        "symbol": tick.symbol,
        "ts": tick.timestamp_ns / 1_000_000,
        "bid": tick.bid_price.map(|p| p as f64 / divisor),
        "ask": tick.ask_price.map(|p| p as f64 / divisor),
        "last": tick.trade_price.map(|p| p as f64 / divisor),
        "volume": tick.trade_size.unwrap_or(0),
    })
    .to_string()
}

fn bar_payload(bar: &Bar, timeframe: &str) -> String {
    let divisor = 10f64.powi(bar.precision as i32);
    json!({
        "type": "bar",
        "symbol": bar.symbol,
        "timeframe": timeframe,
        "ts": bar.bar_ts / 1_000_000,
        "o": bar.open as f64 / divisor,
        "h": bar.high as f64 / divisor,
        "l": bar.low as f64 / divisor,
        "c": bar.close as f64 / divisor,
        "v": bar.volume,
    })
    .to_string()
}

pub struct RedisPublisher {
    config: PublisherConfig,
    conn: tokio::sync::Mutex<Option<MultiplexedConnection>>,
    connected: AtomicBool,
    running: AtomicBool,
    // (channel, payload) pairs awaiting the next pipeline.
    batch: tokio::sync::Mutex<Vec<(String, String)>>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    messages_published: AtomicU64,
    publish_errors: AtomicU64,
    flushes: AtomicU64,
    connected_feeds: parking_lot::RwLock<Vec<String>>,
}

impl RedisPublisher {
    pub fn new(config: PublisherConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            conn: tokio::sync::Mutex::new(None),
            connected: AtomicBool::new(false),
            running: AtomicBool::new(false),
            batch: tokio::sync::Mutex::new(Vec::new()),
            tasks: parking_lot::Mutex::new(Vec::new()),
            messages_published: AtomicU64::new(0),
            publish_errors: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            connected_feeds: parking_lot::RwLock::new(Vec::new()),
        })
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn messages_published(&self) -> u64 {
        self.messages_published.load(Ordering::Relaxed)
    }

    pub fn publish_errors(&self) -> u64 {
        self.publish_errors.load(Ordering::Relaxed)
    }

    /// Update the connected-feed names carried by status frames.
    pub fn set_connected_feeds(&self, feeds: Vec<String>) {
        *self.connected_feeds.write() = feeds;
    }

    fn channel(&self, parts: &[&str]) -> String {
        let mut channel = self.config.channel_prefix.clone();
        for part in parts {
            channel.push(':');
            channel.push_str(part);
        }
        channel
    }

    /// Connect, retrying with exponential backoff until a PING succeeds.
    pub async fn connect(&self) {
        let mut delay = self.config.reconnect_delay;
        loop {
            match self.try_connect().await {
                Ok(conn) => {
                    *self.conn.lock().await = Some(conn);
                    self.connected.store(true, Ordering::SeqCst);
                    info!(
                        host = %self.config.host,
                        port = self.config.port,
                        "redis_connected"
                    );
                    return;
                }
                Err(err) => {
                    warn!(
                        error = %err,
                        retry_in_ms = delay.as_millis() as u64,
                        "redis_connect_failed"
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.config.reconnect_max_delay);
                }
            }
        }
    }

    async fn try_connect(&self) -> redis::RedisResult<MultiplexedConnection> {
        let client = redis::Client::open(self.config.url())?;
        let mut conn = client.get_multiplexed_tokio_connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(conn)
    }

    /// Connect (if needed) and start the flush and status loops.
    pub async fn start(self: &Arc<Self>) {
        if !self.is_connected() {
            self.connect().await;
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let flusher = self.clone();
        let flush_task = tokio::spawn(async move {
            let interval = Duration::from_millis(flusher.config.flush_interval_ms);
            while flusher.running.load(Ordering::Relaxed) {
                tokio::time::sleep(interval).await;
                flusher.flush().await;
            }
        });

        let status = self.clone();
        let status_task = tokio::spawn(async move {
            while status.running.load(Ordering::Relaxed) {
                tokio::time::sleep(status.config.status_interval).await;
                status.publish_status().await;
            }
        });

        self.tasks.lock().extend([flush_task, status_task]);
    }

    /// Stop the loops, deliver the final batch, and close the client.
    pub async fn stop(self: &Arc<Self>) {
        self.running.store(false, Ordering::SeqCst);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }

        self.flush().await;

        *self.conn.lock().await = None;
        self.connected.store(false, Ordering::SeqCst);
        info!(
            messages_published = self.messages_published(),
            "redis_publisher_stopped"
        );
    }

    /// Queue a tick for batched publishing.
    pub async fn publish_tick(self: &Arc<Self>, tick: &Tick) {
        let channel = self.channel(&["ticks", &tick.symbol]);
        self.enqueue(channel, tick_payload(tick)).await;
    }

    /// Queue a closed bar for batched publishing.
    pub async fn publish_bar(self: &Arc<Self>, bar: &Bar, timeframe: &str) {
        let channel = self.channel(&["bars", &bar.symbol, timeframe]);
        self.enqueue(channel, bar_payload(bar, timeframe)).await;
    }

    async fn enqueue(self: &Arc<Self>, channel: String, payload: String) {
        let mut batch = self.batch.lock().await;
        batch.push((channel, payload));
        if batch.len() >= self.config.batch_size {
            self.flush_locked(&mut batch).await;
        }
    }

    async fn flush(self: &Arc<Self>) {
        let mut batch = self.batch.lock().await;
        self.flush_locked(&mut batch).await;
    }

    /// Deliver the batch as a single non-transactional pipeline. Caller
    /// holds the batch lock. Without a live connection the batch is kept for
    /// the next attempt.
    async fn flush_locked(self: &Arc<Self>, batch: &mut Vec<(String, String)>) {
        if batch.is_empty() {
            return;
        }
        let Some(mut conn) = self.conn.lock().await.clone() else {
            return;
        };

        let messages = std::mem::take(batch);
        let mut pipe = redis::pipe();
        for (channel, payload) in &messages {
            pipe.publish(channel, payload).ignore();
        }

        match pipe.query_async::<_, ()>(&mut conn).await {
            Ok(()) => {
                self.messages_published
                    .fetch_add(messages.len() as u64, Ordering::Relaxed);
                self.flushes.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                self.publish_errors
                    .fetch_add(messages.len() as u64, Ordering::Relaxed);
                error!(
                    lost = messages.len(),
                    error = %err,
                    "redis_publish_failed"
                );
                self.connected.store(false, Ordering::SeqCst);
                let publisher = self.clone();
                tokio::spawn(async move { publisher.reconnect().await });
            }
        }
    }

    async fn reconnect(self: &Arc<Self>) {
        if self.is_connected() {
            return;
        }
        info!("redis_reconnecting");
        self.connect().await;
    }

    async fn publish_status(self: &Arc<Self>) {
        if !self.is_connected() {
            return;
        }
        let Some(mut conn) = self.conn.lock().await.clone() else {
            return;
        };

        let payload = json!({
            "type": "status",
            "connected": true,
            "feeds": self.connected_feeds.read().clone(),
            "messages_published": self.messages_published(),
            "publish_errors": self.publish_errors(),
            "flushes": self.flushes.load(Ordering::Relaxed),
            "ts": chrono::Utc::now().timestamp_millis(),
        })
        .to_string();

        let channel = self.channel(&["status", "feeds"]);
        let result: redis::RedisResult<i64> = conn.publish(&channel, payload).await;
        if let Err(err) = result {
            warn!(error = %err, "status_publish_failed");
        } else {
            debug!("status_published");
        }
    }
}
