//! Bloomberg feed handler: bridge for a blocking, event-polled terminal API.
//!
//! The terminal library is synchronous, so a dedicated worker thread blocks
//! on its event poll and hands normalized ticks to the async read loop over a
//! bounded queue (capacity 100 000, drop-on-full). Subscribe and unsubscribe
//! are dispatched to the worker as commands drained between polls. A `None`
//! sentinel on the queue terminates the stream.
//!
//! The production blpapi binding stays out of scope; the crate ships
//! [`MockTerminalSession`], which emits synthetic events for demo runs.

use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::handler::{FeedHandler, HandlerCore};
use super::FeedError;
use crate::models::{current_time_ns, to_fixed_point, Tick, TickKind, Vendor};

/// Terminal field names requested on subscription.
pub const FIELD_BID: &str = "BID";
pub const FIELD_ASK: &str = "ASK";
pub const FIELD_LAST_PRICE: &str = "LAST_PRICE";
pub const FIELD_BID_SIZE: &str = "BID_SIZE";
pub const FIELD_ASK_SIZE: &str = "ASK_SIZE";

/// Terminal quotes carry four decimal places.
const PRECISION: u8 = 4;

const QUEUE_CAPACITY: usize = 100_000;
const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// A subscription-data event as surfaced by the terminal session.
#[derive(Debug, Clone, Default)]
pub struct TerminalEvent {
    pub symbol: String,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub last_price: Option<f64>,
    pub bid_size: Option<u64>,
    pub ask_size: Option<u64>,
}

/// Blocking terminal session the worker thread drives.
///
/// `next_event` blocks for at most `timeout` and returns `None` when no
/// event arrived in the window.
pub trait TerminalSession: Send {
    fn start(&mut self) -> Result<(), FeedError>;
    fn stop(&mut self);
    fn subscribe(&mut self, symbols: &[String], fields: &[String]);
    fn unsubscribe(&mut self, symbols: &[String]);
    fn next_event(&mut self, timeout: Duration) -> Option<TerminalEvent>;
}

/// Factory producing a fresh session per connection attempt.
pub type SessionFactory = Arc<dyn Fn() -> Box<dyn TerminalSession> + Send + Sync>;

enum WorkerCommand {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
    Stop,
}

#[derive(Debug, Clone)]
pub struct BloombergConfig {
    pub host: String,
    pub port: u16,
    pub fields: Vec<String>,
}

impl Default for BloombergConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8194,
            fields: vec![
                FIELD_BID.to_string(),
                FIELD_ASK.to_string(),
                FIELD_LAST_PRICE.to_string(),
                FIELD_BID_SIZE.to_string(),
                FIELD_ASK_SIZE.to_string(),
            ],
        }
    }
}

struct WorkerLink {
    commands: std_mpsc::Sender<WorkerCommand>,
    handle: Option<JoinHandle<()>>,
}

pub struct BloombergHandler {
    core: HandlerCore,
    config: BloombergConfig,
    session_factory: SessionFactory,
    ticks: tokio::sync::Mutex<Option<mpsc::Receiver<Option<Tick>>>>,
    worker: parking_lot::Mutex<Option<WorkerLink>>,
}

impl BloombergHandler {
    pub fn new(config: BloombergConfig, session_factory: SessionFactory) -> Arc<Self> {
        Arc::new(Self {
            core: HandlerCore::new(Vendor::Bloomberg),
            config,
            session_factory,
            ticks: tokio::sync::Mutex::new(None),
            worker: parking_lot::Mutex::new(None),
        })
    }

    /// Handler backed by the synthetic demo session.
    pub fn with_mock_session(config: BloombergConfig) -> Arc<Self> {
        Self::new(
            config,
            Arc::new(|| Box::new(MockTerminalSession::new()) as Box<dyn TerminalSession>),
        )
    }

    fn send_command(&self, command: WorkerCommand) {
        let worker = self.worker.lock();
        if let Some(link) = worker.as_ref() {
            let _ = link.commands.send(command);
        }
    }
}

/// Translate a terminal event into a normalized tick: a last price makes it
/// a trade, both sides of the book make it a BBO, anything else is a quote.
fn event_to_tick(event: &TerminalEvent) -> Option<Tick> {
    if event.bid.is_none() && event.ask.is_none() && event.last_price.is_none() {
        return None;
    }

    let kind = if event.last_price.is_some() {
        TickKind::Trade
    } else if event.bid.is_some() && event.ask.is_some() {
        TickKind::Bbo
    } else {
        TickKind::Quote
    };

    Some(Tick {
        timestamp_ns: current_time_ns(),
        symbol: event.symbol.clone(),
        kind,
        bid_price: event.bid.map(|p| to_fixed_point(p, PRECISION)),
        ask_price: event.ask.map(|p| to_fixed_point(p, PRECISION)),
        trade_price: event.last_price.map(|p| to_fixed_point(p, PRECISION)),
        bid_size: event.bid_size,
        ask_size: event.ask_size,
        trade_size: None,
        exchange: None,
        vendor: Some(Vendor::Bloomberg),
        sequence_num: None,
        precision: PRECISION,
    })
}

fn worker_loop(
    mut session: Box<dyn TerminalSession>,
    fields: Vec<String>,
    commands: std_mpsc::Receiver<WorkerCommand>,
    ticks: mpsc::Sender<Option<Tick>>,
    ready: oneshot::Sender<Result<(), FeedError>>,
) {
    if let Err(err) = session.start() {
        let _ = ready.send(Err(err));
        return;
    }
    let _ = ready.send(Ok(()));

    let mut dropped: u64 = 0;
    loop {
        // Drain pending commands before blocking on the poll again.
        loop {
            match commands.try_recv() {
                Ok(WorkerCommand::Subscribe(symbols)) => session.subscribe(&symbols, &fields),
                Ok(WorkerCommand::Unsubscribe(symbols)) => session.unsubscribe(&symbols),
                Ok(WorkerCommand::Stop) | Err(std_mpsc::TryRecvError::Disconnected) => {
                    session.stop();
                    let _ = ticks.try_send(None);
                    if dropped > 0 {
                        warn!(dropped, "terminal_ticks_dropped");
                    }
                    return;
                }
                Err(std_mpsc::TryRecvError::Empty) => break,
            }
        }

        if let Some(event) = session.next_event(POLL_TIMEOUT) {
            if let Some(tick) = event_to_tick(&event) {
                // Queue full means the async side is behind; drop.
                if ticks.try_send(Some(tick)).is_err() {
                    dropped += 1;
                }
            }
        }
    }
}

#[async_trait]
impl FeedHandler for BloombergHandler {
    fn vendor(&self) -> Vendor {
        Vendor::Bloomberg
    }

    fn core(&self) -> &HandlerCore {
        &self.core
    }

    async fn connect(&self) -> Result<(), FeedError> {
        if self.core.is_connected() {
            return Ok(());
        }

        let session = (self.session_factory)();
        let (tick_tx, tick_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (cmd_tx, cmd_rx) = std_mpsc::channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        let fields = self.config.fields.clone();
        let handle = std::thread::Builder::new()
            .name("bbg-terminal".to_string())
            .spawn(move || worker_loop(session, fields, cmd_rx, tick_tx, ready_tx))
            .map_err(|e| FeedError::Connection(format!("worker spawn: {e}")))?;

        match ready_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                let _ = handle.join();
                return Err(err);
            }
            Err(_) => {
                return Err(FeedError::Connection("terminal worker died".into()));
            }
        }

        *self.ticks.lock().await = Some(tick_rx);
        *self.worker.lock() = Some(WorkerLink {
            commands: cmd_tx,
            handle: Some(handle),
        });
        self.core.set_connected(true);
        info!(
            host = %self.config.host,
            port = self.config.port,
            "bloomberg_session_started"
        );
        Ok(())
    }

    async fn disconnect(&self) {
        self.send_command(WorkerCommand::Stop);
        let handle = self.worker.lock().take().and_then(|mut link| link.handle.take());
        if let Some(handle) = handle {
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        }
        *self.ticks.lock().await = None;
        self.core.set_connected(false);
        debug!("bloomberg_session_stopped");
    }

    async fn subscribe(&self, symbols: &[String]) -> Result<(), FeedError> {
        self.send_command(WorkerCommand::Subscribe(symbols.to_vec()));
        self.core.add_subscriptions(symbols);
        Ok(())
    }

    async fn unsubscribe(&self, symbols: &[String]) -> Result<(), FeedError> {
        self.send_command(WorkerCommand::Unsubscribe(symbols.to_vec()));
        self.core.remove_subscriptions(symbols);
        Ok(())
    }

    async fn next_tick(&self) -> Result<Option<Tick>, FeedError> {
        let mut ticks = self.ticks.lock().await;
        let rx = match ticks.as_mut() {
            Some(rx) => rx,
            None => return Ok(None),
        };
        loop {
            match tokio::time::timeout(POLL_TIMEOUT, rx.recv()).await {
                Ok(Some(Some(tick))) => return Ok(Some(tick)),
                // Sentinel or closed channel: the worker is gone.
                Ok(Some(None)) | Ok(None) => return Ok(None),
                Err(_) => {
                    if !self.core.is_running() {
                        return Ok(None);
                    }
                }
            }
        }
    }
}

/// Synthetic terminal session for demo mode: emits a random BBO (and
/// occasionally a trade) for one subscribed symbol every ~10 ms.
pub struct MockTerminalSession {
    running: bool,
    symbols: Vec<String>,
    next_idx: usize,
}

impl MockTerminalSession {
    pub fn new() -> Self {
        Self {
            running: false,
            symbols: Vec::new(),
            next_idx: 0,
        }
    }
}

impl Default for MockTerminalSession {
    fn default() -> Self {
        Self::new()
    }
}

impl TerminalSession for MockTerminalSession {
    fn start(&mut self) -> Result<(), FeedError> {
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) {
        self.running = false;
    }

    fn subscribe(&mut self, symbols: &[String], _fields: &[String]) {
        for symbol in symbols {
            if !self.symbols.contains(symbol) {
                self.symbols.push(symbol.clone());
            }
        }
    }

    fn unsubscribe(&mut self, symbols: &[String]) {
        self.symbols.retain(|s| !symbols.contains(s));
    }

    fn next_event(&mut self, timeout: Duration) -> Option<TerminalEvent> {
        use rand::Rng;

        if !self.running || self.symbols.is_empty() {
            std::thread::sleep(timeout);
            return None;
        }

        std::thread::sleep(Duration::from_millis(10));

        let mut rng = rand::thread_rng();
        let symbol = self.symbols[self.next_idx % self.symbols.len()].clone();
        self.next_idx += 1;

        let base_price = 4500.0 + rng.gen::<f64>() * 100.0;
        let spread = 0.25;
        let last = rng
            .gen_bool(0.5)
            .then_some(base_price + spread / 2.0);

        Some(TerminalEvent {
            symbol,
            bid: Some(base_price),
            ask: Some(base_price + spread),
            last_price: last,
            bid_size: Some(rng.gen_range(10..500)),
            ask_size: Some(rng.gen_range(10..500)),
        })
    }
}
