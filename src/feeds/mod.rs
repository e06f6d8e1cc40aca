//! Vendor feed handlers and orchestration.
//!
//! Each vendor module implements the [`FeedHandler`] capability set; the
//! shared lifecycle (supervised reconnect loop, per-symbol stats,
//! subscription bookkeeping) lives in [`handler`]. The [`manager`] wires
//! handlers into the pipeline and fans ticks out.

pub mod bloomberg;
pub mod cme;
pub mod databento;
pub mod handler;
pub mod manager;

pub use bloomberg::{BloombergHandler, MockTerminalSession, TerminalEvent, TerminalSession};
pub use cme::CmeHandler;
pub use databento::{DatabentoHandler, FramingMode};
pub use handler::{run_handler, Backoff, FeedHandler, HandlerCore, ReconnectPolicy};
pub use manager::{FeedManager, FeedManagerConfig};

use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::models::Tick;

/// Async callback invoked for every normalized tick.
pub type TickCallback = Arc<dyn Fn(Tick) -> BoxFuture<'static, ()> + Send + Sync>;

/// Async callback invoked when a feed's connection fails.
pub type ErrorCallback = Arc<dyn Fn(FeedError) -> BoxFuture<'static, ()> + Send + Sync>;

/// Feed error taxonomy.
///
/// Connection, auth, and I/O failures are transient: the supervisor marks the
/// feed down and retries with backoff. Protocol errors drop the offending
/// frame without touching the connection. Config errors are fatal to the one
/// feed that carries them.
#[derive(Debug)]
pub enum FeedError {
    Connection(String),
    Auth(String),
    Protocol(String),
    Config(String),
    Io(std::io::Error),
}

impl std::fmt::Display for FeedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connection(msg) => write!(f, "connection error: {msg}"),
            Self::Auth(msg) => write!(f, "authentication failed: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::Io(err) => write!(f, "io error: {err}"),
        }
    }
}

impl std::error::Error for FeedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for FeedError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}
