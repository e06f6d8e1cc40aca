//! CME MDP 3.0 feed handler: passive multicast UDP receiver.
//!
//! The incremental feed is joined as a multicast group; everything on the
//! channel is received and decoded, and filtering down to the subscribed
//! symbols happens client-side. Packets carry a `(u32 seq, u64 sending_time)`
//! header followed by SBE messages; sequence gaps are recorded (range plus
//! counter) and never fatal. Snapshot recovery is exposed as a hook only.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::handler::{FeedHandler, HandlerCore};
use super::FeedError;
use crate::models::{Tick, TickKind, Vendor};

/// MD incremental refresh.
const TEMPLATE_INCREMENTAL_REFRESH: u16 = 32;
/// MD snapshot full refresh, reserved for book recovery.
const TEMPLATE_SNAPSHOT_FULL_REFRESH: u16 = 38;

const ENTRY_TYPE_BID: u8 = b'0';
const ENTRY_TYPE_OFFER: u8 = b'1';
const ENTRY_TYPE_TRADE: u8 = b'2';

/// Packet header: seq(4) + sending_time(8), little-endian.
const PACKET_HEADER_SIZE: usize = 12;
/// Message header: msg_size(2) + block_length(2) + template_id(2) +
/// schema_id(2) + version(2).
const MSG_HEADER_SIZE: usize = 10;
/// Incremental entry: entry_type(1) + security_id(4) + price(8) + size(4).
const ENTRY_SIZE: usize = 17;

/// CME prices are fixed-point mantissas with exponent -7.
const PRECISION: u8 = 7;

const QUEUE_CAPACITY: usize = 100_000;
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct CmeConfig {
    /// Incremental feed group (feed A).
    pub multicast_group: Ipv4Addr,
    pub port: u16,
    /// Local interface address; unspecified joins on the default interface.
    pub interface: Ipv4Addr,
    pub snapshot_group: Ipv4Addr,
    pub snapshot_port: u16,
    pub recv_buffer_bytes: usize,
}

impl Default for CmeConfig {
    fn default() -> Self {
        Self {
            multicast_group: Ipv4Addr::new(224, 0, 28, 1),
            port: 14310,
            interface: Ipv4Addr::UNSPECIFIED,
            snapshot_group: Ipv4Addr::new(224, 0, 27, 1),
            snapshot_port: 15310,
            recv_buffer_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Packet decoding state shared between the receive task and the handler:
/// sequence tracking, gap history, and the instrument-definition map.
pub struct PacketDecoder {
    expected_seq: Mutex<u32>,
    gaps: Mutex<Vec<(u32, u32)>>,
    security_map: RwLock<HashMap<u32, String>>,
}

impl PacketDecoder {
    pub fn new() -> Self {
        Self {
            expected_seq: Mutex::new(0),
            gaps: Mutex::new(Vec::new()),
            security_map: RwLock::new(HashMap::new()),
        }
    }

    /// Install a security-id mapping, normally populated from the
    /// definition feed.
    pub fn map_security(&self, security_id: u32, symbol: impl Into<String>) {
        self.security_map.write().insert(security_id, symbol.into());
    }

    pub fn gaps(&self) -> Vec<(u32, u32)> {
        self.gaps.lock().clone()
    }

    pub fn gaps_detected(&self) -> u64 {
        self.gaps.lock().len() as u64
    }

    fn resolve_symbol(&self, security_id: u32) -> String {
        self.security_map
            .read()
            .get(&security_id)
            .cloned()
            .unwrap_or_else(|| format!("SEC_{security_id}"))
    }

    /// Decode one packet into ticks, recording any sequence gap.
    pub fn parse_packet(&self, data: &[u8]) -> Vec<Tick> {
        if data.len() < PACKET_HEADER_SIZE {
            return Vec::new();
        }

        let seq = u32::from_le_bytes(data[0..4].try_into().unwrap());
        let sending_time = u64::from_le_bytes(data[4..12].try_into().unwrap());

        {
            let mut expected = self.expected_seq.lock();
            if *expected > 0 && seq != *expected && seq > *expected {
                self.gaps.lock().push((*expected, seq - 1));
                debug!(expected = *expected, received = seq, "sequence_gap");
            }
            *expected = seq + 1;
        }

        let mut ticks = Vec::new();
        let mut offset = PACKET_HEADER_SIZE;

        while offset + MSG_HEADER_SIZE <= data.len() {
            let msg_size =
                u16::from_le_bytes(data[offset..offset + 2].try_into().unwrap()) as usize;
            let template_id =
                u16::from_le_bytes(data[offset + 4..offset + 6].try_into().unwrap());

            if msg_size == 0 {
                break;
            }
            if msg_size < MSG_HEADER_SIZE {
                // Malformed frame; nothing sane to resync on.
                debug!(msg_size, "runt_sbe_message_dropped");
                break;
            }
            let end = (offset + msg_size).min(data.len());
            let body = &data[offset + MSG_HEADER_SIZE..end];

            match template_id {
                TEMPLATE_INCREMENTAL_REFRESH => {
                    self.parse_incremental_refresh(body, sending_time as i64, &mut ticks);
                }
                // Snapshot refresh feeds book recovery, which stays out of
                // the incremental path.
                TEMPLATE_SNAPSHOT_FULL_REFRESH => {}
                _ => {}
            }

            offset += msg_size;
        }

        ticks
    }

    /// Walk the repeating entry group of an incremental refresh:
    /// `(u8 count)` then `count` entries of
    /// `(u8 type, u32 security_id, i64 price, u32 size)`.
    fn parse_incremental_refresh(&self, body: &[u8], timestamp_ns: i64, out: &mut Vec<Tick>) {
        let Some(&count) = body.first() else {
            return;
        };
        let mut offset = 1usize;

        for _ in 0..count {
            if offset + ENTRY_SIZE > body.len() {
                // Truncated group: keep what decoded so far.
                break;
            }
            let entry_type = body[offset];
            let security_id =
                u32::from_le_bytes(body[offset + 1..offset + 5].try_into().unwrap());
            let price =
                i64::from_le_bytes(body[offset + 5..offset + 13].try_into().unwrap());
            let size =
                u32::from_le_bytes(body[offset + 13..offset + 17].try_into().unwrap()) as u64;
            offset += ENTRY_SIZE;

            let symbol = self.resolve_symbol(security_id);

            let tick = match entry_type {
                ENTRY_TYPE_BID => Tick {
                    timestamp_ns,
                    symbol,
                    kind: TickKind::Quote,
                    bid_price: Some(price),
                    ask_price: None,
                    trade_price: None,
                    bid_size: Some(size),
                    ask_size: None,
                    trade_size: None,
                    exchange: None,
                    vendor: Some(Vendor::Cme),
                    sequence_num: None,
                    precision: PRECISION,
                },
                ENTRY_TYPE_OFFER => Tick {
                    timestamp_ns,
                    symbol,
                    kind: TickKind::Quote,
                    bid_price: None,
                    ask_price: Some(price),
                    trade_price: None,
                    bid_size: None,
                    ask_size: Some(size),
                    trade_size: None,
                    exchange: None,
                    vendor: Some(Vendor::Cme),
                    sequence_num: None,
                    precision: PRECISION,
                },
                ENTRY_TYPE_TRADE => Tick {
                    timestamp_ns,
                    symbol,
                    kind: TickKind::Trade,
                    bid_price: None,
                    ask_price: None,
                    trade_price: Some(price),
                    bid_size: None,
                    ask_size: None,
                    trade_size: Some(size),
                    exchange: None,
                    vendor: Some(Vendor::Cme),
                    sequence_num: None,
                    precision: PRECISION,
                },
                _ => continue,
            };
            out.push(tick);
        }
    }
}

impl Default for PacketDecoder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct CmeHandler {
    core: HandlerCore,
    config: CmeConfig,
    decoder: Arc<PacketDecoder>,
    ticks: tokio::sync::Mutex<Option<mpsc::Receiver<Tick>>>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
    snapshot_requests: Mutex<Vec<String>>,
}

impl CmeHandler {
    pub fn new(config: CmeConfig) -> Arc<Self> {
        Arc::new(Self {
            core: HandlerCore::new(Vendor::Cme),
            config,
            decoder: Arc::new(PacketDecoder::new()),
            ticks: tokio::sync::Mutex::new(None),
            recv_task: Mutex::new(None),
            snapshot_requests: Mutex::new(Vec::new()),
        })
    }

    /// Decoder state: sequence gaps and the security-id map.
    pub fn decoder(&self) -> &Arc<PacketDecoder> {
        &self.decoder
    }

    /// Symbols for which a snapshot has been requested via the hook.
    pub fn pending_snapshot_requests(&self) -> Vec<String> {
        self.snapshot_requests.lock().clone()
    }

    /// Bind the incremental-feed socket with the tuning the channel needs:
    /// `SO_REUSEPORT` so multiple receivers can coexist, and a 16 MiB
    /// receive buffer to ride out bursts.
    #[cfg(unix)]
    fn bind_multicast_socket(&self) -> std::io::Result<std::net::UdpSocket> {
        use std::os::unix::io::FromRawFd;

        unsafe {
            let fd = libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0);
            if fd < 0 {
                return Err(std::io::Error::last_os_error());
            }

            let one: libc::c_int = 1;
            for opt in [libc::SO_REUSEADDR, libc::SO_REUSEPORT] {
                if libc::setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    opt,
                    &one as *const _ as *const libc::c_void,
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                ) < 0
                {
                    let err = std::io::Error::last_os_error();
                    libc::close(fd);
                    return Err(err);
                }
            }

            let rcvbuf: libc::c_int = self.config.recv_buffer_bytes as libc::c_int;
            if libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                &rcvbuf as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            ) < 0
            {
                let err = std::io::Error::last_os_error();
                libc::close(fd);
                return Err(err);
            }

            let addr = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: self.config.port.to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from(Ipv4Addr::UNSPECIFIED).to_be(),
                },
                sin_zero: [0; 8],
            };
            if libc::bind(
                fd,
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            ) < 0
            {
                let err = std::io::Error::last_os_error();
                libc::close(fd);
                return Err(err);
            }

            Ok(std::net::UdpSocket::from_raw_fd(fd))
        }
    }
}

#[async_trait]
impl FeedHandler for CmeHandler {
    fn vendor(&self) -> Vendor {
        Vendor::Cme
    }

    fn core(&self) -> &HandlerCore {
        &self.core
    }

    async fn connect(&self) -> Result<(), FeedError> {
        if self.core.is_connected() {
            return Ok(());
        }

        let socket = self
            .bind_multicast_socket()
            .map_err(|e| FeedError::Connection(format!("multicast bind: {e}")))?;
        socket
            .join_multicast_v4(&self.config.multicast_group, &self.config.interface)
            .map_err(|e| FeedError::Connection(format!("multicast join: {e}")))?;
        socket.set_nonblocking(true)?;
        let socket = tokio::net::UdpSocket::from_std(socket)?;

        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let decoder = self.decoder.clone();
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            let mut dropped: u64 = 0;
            loop {
                match socket.recv(&mut buf).await {
                    Ok(len) => {
                        for tick in decoder.parse_packet(&buf[..len]) {
                            if tx.try_send(tick).is_err() {
                                dropped += 1;
                                if dropped % 10_000 == 1 {
                                    warn!(dropped, "multicast_queue_full");
                                }
                            }
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "multicast_recv_error");
                        break;
                    }
                }
            }
        });

        *self.ticks.lock().await = Some(rx);
        *self.recv_task.lock() = Some(task);
        self.core.set_connected(true);
        info!(
            group = %self.config.multicast_group,
            port = self.config.port,
            "cme_multicast_joined"
        );
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(task) = self.recv_task.lock().take() {
            task.abort();
        }
        *self.ticks.lock().await = None;
        self.core.set_connected(false);
    }

    /// Subscription is passive: the channel delivers every instrument and
    /// the read loop filters client-side.
    async fn subscribe(&self, symbols: &[String]) -> Result<(), FeedError> {
        self.core.add_subscriptions(symbols);
        Ok(())
    }

    async fn unsubscribe(&self, symbols: &[String]) -> Result<(), FeedError> {
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
            match tokio::time::timeout(RECV_TIMEOUT, rx.recv()).await {
                Ok(Some(tick)) => {
                    if self.core.is_subscribed(&tick.symbol) {
                        return Ok(Some(tick));
                    }
                }
                Ok(None) => return Ok(None),
                Err(_) => {
                    if !self.core.is_running() {
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Book-recovery hook for gap handling; records the request without
    /// mandating a recovery implementation.
    async fn request_snapshot(&self, symbols: &[String]) -> Result<(), FeedError> {
        info!(
            group = %self.config.snapshot_group,
            port = self.config.snapshot_port,
            symbols = ?symbols,
            "snapshot_requested"
        );
        let mut pending = self.snapshot_requests.lock();
        for symbol in symbols {
            if !pending.contains(symbol) {
                pending.push(symbol.clone());
            }
        }
        Ok(())
    }
}
