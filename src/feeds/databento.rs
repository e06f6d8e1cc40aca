//! Databento feed handler: framed TCP client for the live gateway.
//!
//! Two framing modes share one connection lifecycle:
//! - Text: newline-delimited JSON (auth handshake, subscribe frames, data
//!   frames keyed by schema field names).
//! - Binary: DBN-style records behind the same JSON handshake, little-endian
//!   `(u64 ts, u32 length, u16 rtype)` headers followed by the record body.
//!
//! Read timeouts are not fatal; the read loop simply re-enters. Malformed
//! frames are dropped without touching the connection.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, trace};

use super::handler::{FeedHandler, HandlerCore};
use super::FeedError;
use crate::models::{current_time_ns, to_fixed_point, Tick, TickKind, Vendor};

/// Top-of-book schema.
pub const SCHEMA_MBP_1: &str = "mbp-1";
/// Trade tick schema.
pub const SCHEMA_TRADES: &str = "trades";

/// Decimal digits for JSON cash prices.
const TEXT_PRECISION: u8 = 2;
/// DBN binary records carry 1e-9 fixed-point mantissas.
const BINARY_PRECISION: u8 = 9;

/// Record header: timestamp(8) + length(4) + rtype(2), little-endian.
const HEADER_SIZE: usize = 14;
/// MBP-1 body: bid_px(8) + ask_px(8) + trade_px(8) + bid_sz(4) + ask_sz(4)
/// + flags(1) + pad(1).
const MBP1_BODY_SIZE: usize = 34;
const RTYPE_MBP1: u16 = 0x01;

const READ_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingMode {
    Text,
    Binary,
}

#[derive(Debug, Clone)]
pub struct DatabentoConfig {
    pub api_key: String,
    /// e.g. "GLBX.MDP3" for CME Globex.
    pub dataset: String,
    pub schema: String,
    pub host: String,
    pub port: u16,
    pub mode: FramingMode,
}

impl Default for DatabentoConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            dataset: "GLBX.MDP3".to_string(),
            schema: SCHEMA_MBP_1.to_string(),
            host: "localhost".to_string(),
            port: 13000,
            mode: FramingMode::Text,
        }
    }
}

pub struct DatabentoHandler {
    core: HandlerCore,
    config: DatabentoConfig,
    reader: tokio::sync::Mutex<Option<BufReader<OwnedReadHalf>>>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
}

impl DatabentoHandler {
    pub fn new(config: DatabentoConfig) -> Arc<Self> {
        Arc::new(Self {
            core: HandlerCore::new(Vendor::Databento),
            config,
            reader: tokio::sync::Mutex::new(None),
            writer: tokio::sync::Mutex::new(None),
        })
    }

    async fn send_frame(&self, frame: &Value) -> Result<(), FeedError> {
        let mut writer = self.writer.lock().await;
        let writer = writer
            .as_mut()
            .ok_or_else(|| FeedError::Connection("not connected".into()))?;
        let mut data = frame.to_string().into_bytes();
        data.push(b'\n');
        writer.write_all(&data).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Parse a text-mode data frame. Heartbeats and unknown types are
    /// discarded.
    fn parse_text_message(&self, msg: &Value, receive_time_ns: i64) -> Option<Tick> {
        match msg.get("type").and_then(Value::as_str) {
            Some("heartbeat") => return None,
            Some("mbp") | Some("trade") | None => {}
            Some(other) => {
                trace!(msg_type = other, "unknown_frame_discarded");
                return None;
            }
        }

        let symbol = msg.get("symbol")?.as_str()?.to_string();
        let timestamp_ns = msg
            .get("ts_event")
            .and_then(Value::as_i64)
            .unwrap_or(receive_time_ns);

        let bid_px = msg.get("bid_px").and_then(Value::as_f64);
        let ask_px = msg.get("ask_px").and_then(Value::as_f64);
        let trade_px = msg.get("trade_px").and_then(Value::as_f64);

        if bid_px.is_none() && ask_px.is_none() && trade_px.is_none() {
            return None;
        }

        let kind = if trade_px.is_some() {
            TickKind::Trade
        } else if bid_px.is_some() && ask_px.is_some() {
            TickKind::Bbo
        } else {
            TickKind::Quote
        };

        Some(Tick {
            timestamp_ns,
            symbol,
            kind,
            bid_price: bid_px.map(|p| to_fixed_point(p, TEXT_PRECISION)),
            ask_price: ask_px.map(|p| to_fixed_point(p, TEXT_PRECISION)),
            trade_price: trade_px.map(|p| to_fixed_point(p, TEXT_PRECISION)),
            bid_size: msg.get("bid_sz").and_then(Value::as_u64),
            ask_size: msg.get("ask_sz").and_then(Value::as_u64),
            trade_size: msg.get("trade_sz").and_then(Value::as_u64),
            exchange: msg
                .get("exchange")
                .and_then(Value::as_str)
                .map(str::to_string),
            vendor: Some(Vendor::Databento),
            sequence_num: msg.get("sequence").and_then(Value::as_u64),
            precision: TEXT_PRECISION,
        })
    }

    /// Parse a binary record body by rtype. Records that cannot be
    /// attributed to a symbol are dropped (the simplified DBN framing
    /// carries no instrument id, so a binary session is run per instrument
    /// and records belong to the sole subscribed symbol).
    fn parse_binary_record(&self, rtype: u16, timestamp_ns: i64, body: &[u8]) -> Option<Tick> {
        if rtype != RTYPE_MBP1 || body.len() < MBP1_BODY_SIZE {
            return None;
        }

        let symbol = {
            let subs = self.core.subscriptions();
            if subs.len() == 1 {
                subs.into_iter().next().unwrap()
            } else {
                trace!(subs = subs.len(), "binary_record_without_symbol_dropped");
                return None;
            }
        };

        let bid_px = i64::from_le_bytes(body[0..8].try_into().ok()?);
        let ask_px = i64::from_le_bytes(body[8..16].try_into().ok()?);
        let trade_px = i64::from_le_bytes(body[16..24].try_into().ok()?);
        let bid_sz = u32::from_le_bytes(body[24..28].try_into().ok()?);
        let ask_sz = u32::from_le_bytes(body[28..32].try_into().ok()?);

        Some(Tick {
            timestamp_ns,
            symbol,
            kind: TickKind::Bbo,
            bid_price: Some(bid_px),
            ask_price: Some(ask_px),
            trade_price: (trade_px != 0).then_some(trade_px),
            bid_size: Some(bid_sz as u64),
            ask_size: Some(ask_sz as u64),
            trade_size: None,
            exchange: None,
            vendor: Some(Vendor::Databento),
            sequence_num: None,
            precision: BINARY_PRECISION,
        })
    }

    async fn next_text_tick(
        &self,
        reader: &mut BufReader<OwnedReadHalf>,
    ) -> Result<Option<Tick>, FeedError> {
        loop {
            let mut line = String::new();
            match timeout(READ_TIMEOUT, reader.read_line(&mut line)).await {
                // Heartbeat window elapsed; re-enter the read.
                Err(_) => {
                    if !self.core.is_running() {
                        return Ok(None);
                    }
                    continue;
                }
                Ok(Ok(0)) => return Ok(None),
                Ok(Ok(_)) => {
                    let receive_time = current_time_ns();
                    let msg: Value = match serde_json::from_str(line.trim_end()) {
                        Ok(msg) => msg,
                        Err(err) => {
                            debug!(error = %err, "bad_json_frame_dropped");
                            continue;
                        }
                    };
                    if let Some(tick) = self.parse_text_message(&msg, receive_time) {
                        return Ok(Some(tick));
                    }
                }
                Ok(Err(err)) => return Err(err.into()),
            }
        }
    }

    async fn next_binary_tick(
        &self,
        reader: &mut BufReader<OwnedReadHalf>,
    ) -> Result<Option<Tick>, FeedError> {
        loop {
            let mut header = [0u8; HEADER_SIZE];
            match reader.read_exact(&mut header).await {
                Ok(_) => {}
                // Incomplete read terminates the stream.
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Ok(None);
                }
                Err(err) => return Err(err.into()),
            }

            let timestamp_ns = i64::from_le_bytes(header[0..8].try_into().unwrap());
            let length = u32::from_le_bytes(header[8..12].try_into().unwrap()) as usize;
            let rtype = u16::from_le_bytes(header[12..14].try_into().unwrap());

            if length < HEADER_SIZE {
                debug!(length, "short_record_header_dropped");
                continue;
            }

            let mut body = vec![0u8; length - HEADER_SIZE];
            match reader.read_exact(&mut body).await {
                Ok(_) => {}
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Ok(None);
                }
                Err(err) => return Err(err.into()),
            }

            // Malformed records are skipped without breaking the connection.
            if let Some(tick) = self.parse_binary_record(rtype, timestamp_ns, &body) {
                return Ok(Some(tick));
            }
        }
    }
}

#[async_trait]
impl FeedHandler for DatabentoHandler {
    fn vendor(&self) -> Vendor {
        Vendor::Databento
    }

    fn core(&self) -> &HandlerCore {
        &self.core
    }

    async fn connect(&self) -> Result<(), FeedError> {
        if self.core.is_connected() {
            return Ok(());
        }

        let stream = TcpStream::connect((self.config.host.as_str(), self.config.port))
            .await
            .map_err(|e| FeedError::Connection(format!("{}:{}: {e}", self.config.host, self.config.port)))?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        *self.writer.lock().await = Some(write_half);

        // Auth handshake is JSON lines in both framing modes.
        self.send_frame(&json!({
            "type": "auth",
            "key": self.config.api_key,
            "dataset": self.config.dataset,
            "schema": self.config.schema,
        }))
        .await?;

        let mut line = String::new();
        let read = timeout(READ_TIMEOUT, reader.read_line(&mut line))
            .await
            .map_err(|_| FeedError::Connection("auth response timed out".into()))??;
        if read == 0 {
            return Err(FeedError::Connection("closed during auth".into()));
        }
        let response: Value = serde_json::from_str(line.trim_end())
            .map_err(|e| FeedError::Protocol(format!("auth response: {e}")))?;
        if response.get("status").and_then(Value::as_str) != Some("ok") {
            return Err(FeedError::Auth(format!("gateway replied {response}")));
        }

        *self.reader.lock().await = Some(reader);
        self.core.set_connected(true);
        info!(
            host = %self.config.host,
            port = self.config.port,
            dataset = %self.config.dataset,
            schema = %self.config.schema,
            "databento_connected"
        );
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        *self.reader.lock().await = None;
        self.core.set_connected(false);
    }

    async fn subscribe(&self, symbols: &[String]) -> Result<(), FeedError> {
        self.send_frame(&json!({
            "type": "subscribe",
            "symbols": symbols,
        }))
        .await?;
        self.core.add_subscriptions(symbols);
        Ok(())
    }

    async fn unsubscribe(&self, symbols: &[String]) -> Result<(), FeedError> {
        self.send_frame(&json!({
            "type": "unsubscribe",
            "symbols": symbols,
        }))
        .await?;
        self.core.remove_subscriptions(symbols);
        Ok(())
    }

    async fn next_tick(&self) -> Result<Option<Tick>, FeedError> {
        let mut reader = self.reader.lock().await;
        let reader = match reader.as_mut() {
            Some(reader) => reader,
            None => return Ok(None),
        };
        match self.config.mode {
            FramingMode::Text => self.next_text_tick(reader).await,
            FramingMode::Binary => self.next_binary_tick(reader).await,
        }
    }
}
