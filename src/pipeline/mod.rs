//! Ingress-to-egress pipeline: ring buffer, batcher, OHLCV aggregation.

pub mod aggregator;
pub mod batcher;
pub mod ring;

pub use aggregator::{Bar, BarAggregator, BarSink};
pub use batcher::{BatchSink, BatcherConfig, BufferStats, TickBatcher};
pub use ring::SpscRing;
