//! End-to-end feed tests against a loopback framed-stream gateway.
//!
//! A minimal in-process TCP server speaks the text framing: it reads the
//! auth frame, answers with an `ok` (or `denied`) status, consumes the
//! subscribe frame, and then streams canned data lines.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use tickline_backend::feeds::databento::{DatabentoConfig, DatabentoHandler, FramingMode};
use tickline_backend::feeds::handler::{run_handler, ReconnectPolicy, SharedFeedState};
use tickline_backend::feeds::manager::FeedManagerConfig;
use tickline_backend::feeds::{ErrorCallback, FeedError, FeedHandler, TickCallback};
use tickline_backend::models::{FeedConfig, FeedState, TickKind, Vendor};
use tickline_backend::pipeline::BatchSink;
use tickline_backend::{FeedManager, Tick};

struct Gateway {
    addr: SocketAddr,
    accepts: Arc<AtomicU32>,
}

/// Spawn a gateway that accepts connections forever. `deny` makes the auth
/// handshake fail; otherwise each connection receives `lines` after the
/// subscribe frame and then stays open.
async fn spawn_gateway(deny: bool, lines: Vec<String>) -> Gateway {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepts = Arc::new(AtomicU32::new(0));

    let accept_count = accepts.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            accept_count.fetch_add(1, Ordering::SeqCst);
            let lines = lines.clone();
            tokio::spawn(async move {
                let (read_half, mut write_half) = stream.into_split();
                let mut reader = BufReader::new(read_half).lines();

                let Ok(Some(auth)) = reader.next_line().await else {
                    return;
                };
                let frame: Value = serde_json::from_str(&auth).unwrap_or_default();
                if frame["type"] != "auth" {
                    return;
                }

                if deny {
                    let _ = write_half.write_all(b"{\"status\":\"denied\"}\n").await;
                    return;
                }
                if write_half.write_all(b"{\"status\":\"ok\"}\n").await.is_err() {
                    return;
                }

                // Subscribe frame before any data flows.
                let Ok(Some(_subscribe)) = reader.next_line().await else {
                    return;
                };
                for line in &lines {
                    if write_half.write_all(line.as_bytes()).await.is_err() {
                        return;
                    }
                    let _ = write_half.write_all(b"\n").await;
                }
                // Hold the connection open so the client keeps reading.
                tokio::time::sleep(Duration::from_secs(60)).await;
            });
        }
    });

    Gateway { addr, accepts }
}

fn databento_handler(addr: SocketAddr) -> Arc<DatabentoHandler> {
    DatabentoHandler::new(DatabentoConfig {
        api_key: "k".to_string(),
        dataset: "d".to_string(),
        schema: "mbp-1".to_string(),
        host: addr.ip().to_string(),
        port: addr.port(),
        mode: FramingMode::Text,
    })
}

#[tokio::test]
async fn auth_success_yields_normalized_tick() {
    let gateway = spawn_gateway(
        false,
        vec![
            r#"{"symbol":"ESZ4","ts_event":1700000000000000000,"bid_px":4532.25,"ask_px":4532.50,"bid_sz":150,"ask_sz":200,"sequence":1}"#
                .to_string(),
        ],
    )
    .await;

    let handler = databento_handler(gateway.addr);
    handler.core().set_running(true);

    handler.connect().await.expect("auth should succeed");
    assert!(handler.core().is_connected());
    handler.subscribe(&["ESZ4".to_string()]).await.unwrap();

    let tick = tokio::time::timeout(Duration::from_secs(2), handler.next_tick())
        .await
        .expect("tick within deadline")
        .unwrap()
        .expect("exactly one tick");

    assert_eq!(tick.symbol, "ESZ4");
    assert_eq!(tick.kind, TickKind::Bbo);
    assert_eq!(tick.bid_price, Some(453225));
    assert_eq!(tick.ask_price, Some(453250));
    assert_eq!(tick.bid_size, Some(150));
    assert_eq!(tick.ask_size, Some(200));
    assert_eq!(tick.precision, 2);
    assert_eq!(tick.vendor, Some(Vendor::Databento));

    handler.disconnect().await;
}

#[tokio::test]
async fn auth_denied_fails_connect() {
    let gateway = spawn_gateway(true, Vec::new()).await;
    let handler = databento_handler(gateway.addr);

    let err = handler.connect().await.expect_err("auth must fail");
    assert!(matches!(err, FeedError::Auth(_)), "got {err}");
    assert!(!handler.core().is_connected());
}

#[tokio::test]
async fn supervisor_retries_denied_auth_with_backoff() {
    let gateway = spawn_gateway(true, Vec::new()).await;
    let handler = databento_handler(gateway.addr);

    let on_tick: TickCallback = Arc::new(|_tick| Box::pin(async {}));
    let errors: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let error_sink = errors.clone();
    let on_error: ErrorCallback = Arc::new(move |err| {
        let error_sink = error_sink.clone();
        Box::pin(async move {
            error_sink.lock().push(err.to_string());
        })
    });

    let state: SharedFeedState =
        Arc::new(parking_lot::RwLock::new(FeedState::Stopped));
    // Short delays keep the test fast; the doubling schedule itself is
    // asserted against a fake clock in the handler unit tests.
    let policy = ReconnectPolicy {
        initial_delay: Duration::from_millis(20),
        max_delay: Duration::from_secs(1),
        max_attempts: 2,
    };

    run_handler(handler.clone(), on_tick, Some(on_error), policy, state).await;

    // Initial attempt plus two retries.
    assert_eq!(gateway.accepts.load(Ordering::SeqCst), 3);
    let errors = errors.lock();
    assert_eq!(errors.len(), 3);
    assert!(errors.iter().all(|e| e.contains("authentication failed")));
}

#[tokio::test]
async fn manager_runs_framed_feed_end_to_end() {
    let gateway = spawn_gateway(
        false,
        vec![
            r#"{"symbol":"ESZ4","ts_event":1700000000000000000,"bid_px":4532.25,"ask_px":4532.50,"sequence":1}"#.to_string(),
            r#"{"symbol":"ESZ4","ts_event":1700000000100000000,"trade_px":4532.50,"trade_sz":3,"sequence":2}"#.to_string(),
            r#"{"symbol":"ESZ4","ts_event":1700000000200000000,"bid_px":4532.50,"ask_px":4532.75,"sequence":3}"#.to_string(),
        ],
    )
    .await;

    let batches: Arc<Mutex<Vec<Vec<Tick>>>> = Arc::new(Mutex::new(Vec::new()));
    let batch_sink = batches.clone();
    let on_batch: BatchSink = Arc::new(move |batch| {
        let batch_sink = batch_sink.clone();
        Box::pin(async move {
            batch_sink.lock().push(batch);
        })
    });

    let manager = FeedManager::new(
        FeedManagerConfig {
            buffer_capacity: 1024,
            batch_size: 100,
            flush_interval_ms: 20,
        },
        None,
        Some(on_batch),
        None,
    );

    let mut config = FeedConfig::new(Vendor::Databento, vec!["ESZ4".to_string()]);
    config.api_key = Some("k".to_string());
    config.dataset = Some("d".to_string());
    config.host = Some(gateway.addr.ip().to_string());
    config.port = Some(gateway.addr.port());
    manager.add_feed(config);

    manager.start().await;

    // Wait for the three canned ticks to flow through.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while manager.get_stats().total_ticks < 3 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for ticks"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let status = manager.get_status(Vendor::Databento).unwrap();
    assert_eq!(status.state, FeedState::Connected);
    assert!(status.connected);
    assert_eq!(status.ticks_received, 3);
    assert!(status.errors.is_empty());

    manager.stop().await;

    let delivered: usize = batches.lock().iter().map(Vec::len).sum();
    assert_eq!(delivered, 3);
    let stats = manager.get_stats();
    let buffer = stats.buffer.unwrap();
    assert_eq!(buffer.processed, 3);
    assert_eq!(buffer.dropped, 0);

    let status = manager.get_status(Vendor::Databento).unwrap();
    assert_eq!(status.state, FeedState::Stopped);
}
