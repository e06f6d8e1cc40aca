//! Pipeline-level scenarios: batch flushing under time and overload, and
//! bar aggregation across a timeframe boundary.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use tickline_backend::models::{current_time_ns, TickKind, Vendor};
use tickline_backend::pipeline::{
    BarAggregator, BatchSink, BatcherConfig, SpscRing, TickBatcher,
};
use tickline_backend::Tick;

fn trade(symbol: &str, ts_ns: i64, price: i64, size: u64) -> Tick {
    Tick {
        timestamp_ns: ts_ns,
        symbol: symbol.to_string(),
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
        precision: 2,
    }
}

fn collecting_sink() -> (BatchSink, Arc<Mutex<Vec<Vec<Tick>>>>) {
    let collected: Arc<Mutex<Vec<Vec<Tick>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink_copy = collected.clone();
    let sink: BatchSink = Arc::new(move |batch| {
        let sink_copy = sink_copy.clone();
        Box::pin(async move {
            sink_copy.lock().push(batch);
        })
    });
    (sink, collected)
}

#[tokio::test(start_paused = true)]
async fn batcher_time_flush_delivers_one_batch() {
    let (sink, collected) = collecting_sink();
    let batcher = TickBatcher::new(
        BatcherConfig {
            batch_size: 10,
            flush_interval_ms: 50,
            capacity: 1024,
        },
        sink,
    );
    batcher.start();

    for i in 0..3 {
        batcher.push(trade("ESZ4", current_time_ns() + i, 100 + i, 1)).await;
    }

    // Paused clock auto-advances while this sleep parks the test, so the
    // 50 ms timer fires exactly once before t=60ms.
    tokio::time::sleep(Duration::from_millis(60)).await;

    {
        let batches = collected.lock();
        assert_eq!(batches.len(), 1, "exactly one batch at t=60ms");
        assert_eq!(batches[0].len(), 3);
    }

    let stats = batcher.stats();
    assert_eq!(stats.batches_flushed, 1);
    assert_eq!(stats.processed, 3);
    assert_eq!(stats.dropped, 0);

    batcher.stop().await;
}

#[tokio::test]
async fn batcher_overload_drops_and_keeps_order() {
    let (sink, collected) = collecting_sink();
    let batcher = TickBatcher::new(
        BatcherConfig {
            batch_size: 10_000,
            flush_interval_ms: 60_000,
            capacity: 64,
        },
        sink,
    );

    // The ring keeps one slot free, so its usable capacity is 63.
    let usable = 64 - 1;
    for i in 0..(usable + 5) {
        batcher.push(trade("ESZ4", i as i64, 100, 1)).await;
    }

    let stats = batcher.stats();
    assert_eq!(stats.received, (usable + 5) as u64);
    assert_eq!(stats.dropped, 5);

    batcher.stop().await;

    let batches = collected.lock();
    let timestamps: Vec<i64> = batches.iter().flatten().map(|t| t.timestamp_ns).collect();
    let expected: Vec<i64> = (0..usable as i64).collect();
    assert_eq!(timestamps, expected, "survivors delivered in push order");

    let stats = batcher.stats();
    assert_eq!(stats.received, stats.processed + stats.dropped);
}

#[tokio::test]
async fn aggregator_closes_bar_on_boundary() {
    let agg = BarAggregator::new(60, None);

    assert!(agg.process_tick(&trade("ESZ4", 1_000_000_000, 100, 1)).await.is_none());
    assert!(agg.process_tick(&trade("ESZ4", 30_000_000_000, 150, 2)).await.is_none());

    let closed = agg
        .process_tick(&trade("ESZ4", 61_000_000_000, 120, 3))
        .await
        .expect("crossing the boundary closes the bar");

    assert_eq!(closed.bar_ts, 0);
    assert_eq!(closed.open, 100);
    assert_eq!(closed.high, 150);
    assert_eq!(closed.low, 100);
    assert_eq!(closed.close, 150);
    assert_eq!(closed.volume, 3);
    assert_eq!(closed.tick_count, 2);

    let next = agg.current_bar("ESZ4").expect("new bar seeded");
    assert_eq!(next.bar_ts, 60_000_000_000);
    assert_eq!(next.open, 120);
}

#[test]
fn ring_capacity_and_balance_invariants() {
    for requested in [1usize, 2, 3, 7, 100, 1000] {
        let ring = SpscRing::new(requested);
        let actual = ring.capacity();
        assert!(actual.is_power_of_two());
        assert!(actual >= requested.max(2));

        // K pushes then K pops leave the ring empty.
        let k = (actual - 1).min(50);
        for i in 0..k {
            assert!(ring.push(trade("ESZ4", i as i64, 1, 1)));
        }
        let mut popped = 0;
        while ring.pop().is_some() {
            popped += 1;
        }
        assert_eq!(popped, k);
        assert!(ring.is_empty());
    }
}
