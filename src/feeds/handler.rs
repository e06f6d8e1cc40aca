//! Feed handler base: capability trait, shared lifecycle state, and the
//! supervised reconnect loop every vendor handler runs under.
//!
//! The supervisor owns the state machine
//! STOPPED -> CONNECTING -> CONNECTED -> RECONNECTING -> (CONNECTING | STOPPED);
//! ERROR is a reporting label that always resolves into RECONNECTING or
//! STOPPED. Reconnects back off exponentially (1 s doubling, 60 s cap) and
//! the delay resets on every successful connect.

use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::{ErrorCallback, FeedError, TickCallback};
use crate::models::{current_time_ns, FeedState, FeedStats, Tick, Vendor};

/// Shared per-feed state that lives in the manager and is updated by the
/// supervisor as the lifecycle progresses.
pub type SharedFeedState = Arc<RwLock<FeedState>>;

/// Capability set every vendor handler implements.
///
/// `next_tick` is the pull side of the vendor's read loop: `Ok(Some(tick))`
/// on data, `Ok(None)` when the stream ended cleanly (the supervisor
/// reconnects), `Err` on a connection-level failure. Read timeouts are
/// handled inside the implementation and never surface here.
#[async_trait]
pub trait FeedHandler: Send + Sync {
    fn vendor(&self) -> Vendor;

    /// Shared lifecycle state (running/connected flags, subscriptions,
    /// per-symbol stats).
    fn core(&self) -> &HandlerCore;

    async fn connect(&self) -> Result<(), FeedError>;

    async fn disconnect(&self);

    async fn subscribe(&self, symbols: &[String]) -> Result<(), FeedError>;

    async fn unsubscribe(&self, symbols: &[String]) -> Result<(), FeedError>;

    async fn next_tick(&self) -> Result<Option<Tick>, FeedError>;

    /// Recovery hook for sequenced feeds; no-op by default.
    async fn request_snapshot(&self, _symbols: &[String]) -> Result<(), FeedError> {
        Ok(())
    }
}

/// Lifecycle state shared by every handler implementation.
pub struct HandlerCore {
    vendor: Vendor,
    running: AtomicBool,
    connected: AtomicBool,
    subscriptions: RwLock<Vec<String>>,
    stats: RwLock<HashMap<String, FeedStats>>,
}

impl HandlerCore {
    pub fn new(vendor: Vendor) -> Self {
        Self {
            vendor,
            running: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            subscriptions: RwLock::new(Vec::new()),
            stats: RwLock::new(HashMap::new()),
        }
    }

    #[inline]
    pub fn vendor(&self) -> Vendor {
        self.vendor
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Request the supervisor to wind down at its next suspension point.
    /// Idempotent.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.read().clone()
    }

    /// Add symbols to the subscription list and seed their stats entries.
    /// Re-subscribing an already-subscribed symbol is a no-op.
    pub fn add_subscriptions(&self, symbols: &[String]) {
        let mut subs = self.subscriptions.write();
        let mut stats = self.stats.write();
        for symbol in symbols {
            if !subs.contains(symbol) {
                subs.push(symbol.clone());
            }
            stats
                .entry(symbol.clone())
                .or_insert_with(|| FeedStats::new(self.vendor, symbol.clone()));
        }
    }

    /// Remove symbols; unsubscribing a symbol never in the set is a no-op.
    pub fn remove_subscriptions(&self, symbols: &[String]) {
        let mut subs = self.subscriptions.write();
        subs.retain(|s| !symbols.contains(s));
    }

    pub fn is_subscribed(&self, symbol: &str) -> bool {
        self.subscriptions.read().iter().any(|s| s == symbol)
    }

    /// Fold a delivered tick into its symbol's stats.
    pub fn record_tick(&self, tick: &Tick, receive_time_ns: i64) {
        let mut stats = self.stats.write();
        if let Some(entry) = stats.get_mut(&tick.symbol) {
            entry.update(tick, receive_time_ns);
        }
    }

    pub fn stats_for(&self, symbol: &str) -> Option<FeedStats> {
        self.stats.read().get(symbol).cloned()
    }

    pub fn all_stats(&self) -> HashMap<String, FeedStats> {
        self.stats.read().clone()
    }
}

/// Reconnect policy for the supervisor loop.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// -1 retries forever.
    pub max_attempts: i32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: -1,
        }
    }
}

/// Deterministic exponential backoff: the delay doubles on every failed
/// attempt and resets on success.
#[derive(Debug)]
pub struct Backoff {
    policy: ReconnectPolicy,
    current: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            current: policy.initial_delay,
            attempt: 0,
        }
    }

    /// The delay to sleep before the next attempt; doubles up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.policy.max_delay);
        self.attempt += 1;
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.policy.initial_delay;
        self.attempt = 0;
    }

    #[inline]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Whether the policy's attempt budget is spent.
    pub fn exhausted(&self) -> bool {
        self.policy.max_attempts >= 0 && self.attempt >= self.policy.max_attempts as u32
    }
}

enum ConnectionEnd {
    /// `stop()` was observed; leave the supervisor.
    Stopped,
    /// The stream ended without an error; reconnect immediately.
    StreamEnded,
}

/// Supervise a handler: connect, resubscribe, pump ticks into `on_tick`,
/// and reconnect with backoff on failure until `core().stop()` is called.
pub async fn run_handler(
    handler: Arc<dyn FeedHandler>,
    on_tick: TickCallback,
    on_error: Option<ErrorCallback>,
    policy: ReconnectPolicy,
    state: SharedFeedState,
) {
    let core = handler.core();
    core.set_running(true);
    let mut backoff = Backoff::new(policy);

    while core.is_running() {
        *state.write() = FeedState::Connecting;

        match run_connection(handler.as_ref(), &on_tick, &mut backoff, &state).await {
            Ok(ConnectionEnd::Stopped) => break,
            Ok(ConnectionEnd::StreamEnded) => {
                debug!(vendor = %core.vendor(), "stream_ended");
                core.set_connected(false);
                continue;
            }
            Err(err) => {
                core.set_connected(false);
                warn!(vendor = %core.vendor(), error = %err, "feed_error");
                if let Some(cb) = &on_error {
                    cb(err).await;
                }
                if !core.is_running() {
                    break;
                }
                if backoff.exhausted() {
                    warn!(
                        vendor = %core.vendor(),
                        attempts = backoff.attempt(),
                        "reconnect_attempts_exhausted"
                    );
                    break;
                }
                *state.write() = FeedState::Reconnecting;
                let delay = backoff.next_delay();
                debug!(
                    vendor = %core.vendor(),
                    delay_ms = delay.as_millis() as u64,
                    attempt = backoff.attempt(),
                    "reconnect_backoff"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }

    handler.disconnect().await;
    core.set_connected(false);
    core.set_running(false);
    *state.write() = FeedState::Stopped;
    info!(vendor = %core.vendor(), "feed_stopped");
}

async fn run_connection(
    handler: &dyn FeedHandler,
    on_tick: &TickCallback,
    backoff: &mut Backoff,
    state: &SharedFeedState,
) -> Result<ConnectionEnd, FeedError> {
    let core = handler.core();

    handler.connect().await?;
    core.set_connected(true);
    backoff.reset();
    *state.write() = FeedState::Connected;

    let subscriptions = core.subscriptions();
    if !subscriptions.is_empty() {
        handler.subscribe(&subscriptions).await?;
    }

    loop {
        if !core.is_running() {
            return Ok(ConnectionEnd::Stopped);
        }
        match handler.next_tick().await? {
            Some(tick) => {
                core.record_tick(&tick, current_time_ns());
                on_tick(tick).await;
            }
            None => return Ok(ConnectionEnd::StreamEnded),
        }
    }
}
