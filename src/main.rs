//! Tickline - High-Performance Market Data Feed Handler
//!
//! Ingests live tick data from multiple vendors (Databento, Bloomberg, CME
//! direct), normalizes it into a single tick schema, and fans it out as
//! batches, OHLCV bars, and redis pub/sub publications.
//!
//! Usage:
//!     tickline --vendors databento,bloomberg --symbols ESZ4,NQZ4
//!     tickline --demo

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;
use dotenv::dotenv;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tickline_backend::feeds::manager::FeedManagerConfig;
use tickline_backend::models::{current_time_ns, FeedConfig, Tick, Vendor};
use tickline_backend::pipeline::{BarSink, BatchSink};
use tickline_backend::publisher::{PublisherConfig, RedisPublisher};
use tickline_backend::FeedManager;

#[derive(Parser, Debug)]
#[command(name = "tickline", about = "High-performance market data feed handler")]
struct Args {
    /// Comma-separated list of vendors (databento,bloomberg,cme)
    #[arg(long, default_value = "bloomberg")]
    vendors: String,

    /// Comma-separated list of symbols
    #[arg(long, default_value = "ESZ4,NQZ4")]
    symbols: String,

    /// Run in demo mode with mock data
    #[arg(long)]
    demo: bool,

    /// OHLCV bar timeframe in seconds
    #[arg(long, default_value_t = 60)]
    aggregation_timeframe: u64,
}

/// Downstream batch consumer: counts throughput and logs a sample tick
/// every few seconds. A production deployment would hand batches to a
/// database writer here.
struct BatchLogger {
    tick_count: AtomicU64,
    last_log_ns: AtomicI64,
}

const LOG_INTERVAL_NS: i64 = 5_000_000_000;

impl BatchLogger {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            tick_count: AtomicU64::new(0),
            last_log_ns: AtomicI64::new(current_time_ns()),
        })
    }

    fn record(&self, batch: &[Tick]) {
        self.tick_count.fetch_add(batch.len() as u64, Ordering::Relaxed);

        let now = current_time_ns();
        let last = self.last_log_ns.load(Ordering::Relaxed);
        if now - last > LOG_INTERVAL_NS
            && self
                .last_log_ns
                .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            let count = self.tick_count.swap(0, Ordering::Relaxed);
            let rate = count as f64 / ((now - last) as f64 / 1e9);
            info!(ticks = count, rate_per_sec = rate as u64, "batch_throughput");
            if let Some(sample) = batch.last() {
                info!(
                    symbol = %sample.symbol,
                    bid = ?sample.bid_price,
                    ask = ?sample.ask_price,
                    trade = ?sample.trade_price,
                    "sample_tick"
                );
            }
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tickline_backend=info,tickline=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Demo configurations: only Bloomberg is enabled since its mock terminal
/// session produces data without any upstream connectivity.
fn demo_configs() -> Vec<FeedConfig> {
    let mut databento = FeedConfig::new(
        Vendor::Databento,
        vec![
            "ESZ4".to_string(),
            "NQZ4".to_string(),
            "CLZ4".to_string(),
            "GCZ4".to_string(),
        ],
    );
    databento.api_key = Some("demo-key".to_string());
    databento.dataset = Some("GLBX.MDP3".to_string());
    databento.host = Some("localhost".to_string());
    databento.port = Some(13000);
    databento.enabled = false;

    let bloomberg = FeedConfig::new(
        Vendor::Bloomberg,
        vec!["ESZ4 Index".to_string(), "NQZ4 Index".to_string()],
    );

    vec![databento, bloomberg]
}

fn parse_configs(args: &Args) -> Result<Vec<FeedConfig>> {
    let symbols: Vec<String> = args
        .symbols
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if symbols.is_empty() {
        bail!("no symbols given");
    }

    let mut configs = Vec::new();
    for name in args.vendors.split(',') {
        let Some(vendor) = Vendor::parse(name) else {
            bail!("unknown vendor: {name}");
        };
        configs.push(FeedConfig::new(vendor, symbols.clone()));
    }
    if configs.is_empty() {
        bail!("no vendors given");
    }
    Ok(configs)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    {
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(err) => {
                    error!(error = %err, "sigterm_handler_failed");
                    std::future::pending::<()>().await;
                }
            }
        };
        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    }

    #[cfg(not(unix))]
    ctrl_c.await;
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    init_tracing();

    let args = Args::parse();

    let configs = if args.demo {
        info!("demo_mode");
        demo_configs()
    } else {
        parse_configs(&args)?
    };

    // Publisher connects in the background so a missing redis never blocks
    // feed startup; enqueued messages go out once the connection lands.
    let publisher = RedisPublisher::new(PublisherConfig::from_env());
    let publisher_task = {
        let publisher = publisher.clone();
        tokio::spawn(async move { publisher.start().await })
    };

    let batch_logger = BatchLogger::new();
    let on_batch: BatchSink = {
        let logger = batch_logger.clone();
        Arc::new(move |batch: Vec<Tick>| {
            let logger = logger.clone();
            Box::pin(async move {
                logger.record(&batch);
            })
        })
    };

    let manager = Arc::new(FeedManager::new(
        FeedManagerConfig {
            buffer_capacity: 131_072,
            batch_size: 5000,
            flush_interval_ms: 50,
        },
        None,
        Some(on_batch),
        Some(publisher.clone()),
    ));

    let on_bar: BarSink = Arc::new(|bar| {
        Box::pin(async move {
            info!(
                symbol = %bar.symbol,
                o = bar.open,
                h = bar.high,
                l = bar.low,
                c = bar.close,
                v = bar.volume,
                ticks = bar.tick_count,
                "bar_closed"
            );
        })
    });
    manager.enable_aggregation(args.aggregation_timeframe, Some(on_bar));

    for config in configs {
        manager.add_feed(config);
    }

    info!(feeds = manager.configured_vendors().len(), "starting_feeds");
    manager.start().await;

    // Status loop until a shutdown signal arrives.
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut status_interval = tokio::time::interval(Duration::from_secs(10));
    status_interval.tick().await; // first tick fires immediately
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = status_interval.tick() => {
                let stats = manager.get_stats();
                info!(
                    total_ticks = stats.total_ticks,
                    rate_per_sec = stats.ticks_per_second as u64,
                    feeds_connected = stats.feeds_connected,
                    feeds_total = stats.feeds_total,
                    "stats"
                );
                for (vendor, status) in manager.get_all_status() {
                    info!(
                        vendor = %vendor,
                        state = %status.state,
                        ticks = status.ticks_received,
                        latency_us = status.latency_avg_us,
                        "feed_status"
                    );
                }
                manager.check_feed_health();
                publisher.set_connected_feeds(manager.connected_feed_names());
            }
        }
    }

    info!("shutdown_requested");
    manager.stop().await;
    publisher_task.abort();
    let _ = publisher_task.await;
    publisher.stop().await;

    let stats = manager.get_stats();
    info!(
        total_ticks = stats.total_ticks,
        uptime_seconds = stats.uptime_seconds as u64,
        "final_stats"
    );
    Ok(())
}
