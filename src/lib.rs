//! Tickline Backend Library
//!
//! Exposes the market-data core for use by binaries and tests: the
//! normalized tick model, the ring-buffer pipeline with batching and OHLCV
//! aggregation, the vendor feed handlers, and the redis publisher.

pub mod feeds;
pub mod models;
pub mod pipeline;
pub mod publisher;

// Re-export the types most callers wire together.
pub use feeds::{FeedError, FeedHandler, FeedManager, FeedManagerConfig};
pub use models::{FeedConfig, FeedState, FeedStats, FeedStatus, Tick, TickKind, Vendor};
pub use pipeline::{Bar, BarAggregator, BufferStats, TickBatcher};
pub use publisher::{PublisherConfig, RedisPublisher};
