//! End-to-end tests for the feed pipeline
//!
//! Drives the full ingest → validate → cache/aggregate → dispatch path
//! over a running pipeline and asserts the externally observable
//! behavior: delivered messages, queue states, counters, and recovery.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;

use feed_pipeline::config::{DispatchConfig, PipelineConfig};
use feed_pipeline::events::{RawRecord, Tick};
use feed_pipeline::pipeline::{now_nanos, Pipeline};
use feed_pipeline::protocol::ServerMessage;
use feed_pipeline::sink::{MemorySink, PersistenceSink};
use feed_pipeline::subscriptions::MessageKind;
use types::ids::Symbol;
use types::numeric::{Price, Quantity};
use uuid::Uuid;

const MINUTE: i64 = 60 * 1_000_000_000;

/// Current minute boundary, so open buckets close via tick flow rather
/// than the wall-clock flush racing the test.
fn bucket_base() -> i64 {
    (now_nanos() / MINUTE) * MINUTE
}

fn record(symbol: &str, seq: u64, price: i64, volume: i64, event_time: i64) -> RawRecord {
    RawRecord {
        symbol: symbol.to_string(),
        price: Decimal::from(price),
        volume: Decimal::from(volume),
        bids: vec![],
        asks: vec![],
        sequence: seq,
        event_time,
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool, what: &str) {
    for _ in 0..1_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("timed out waiting for {}", what);
}

fn start_default() -> (Pipeline, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::new());
    let pipeline = Pipeline::start(PipelineConfig::default(), sink.clone(), None);
    (pipeline, sink)
}

#[tokio::test]
async fn test_candle_folds_one_minute_of_trades() {
    let (pipeline, _sink) = start_default();
    let base = bucket_base();

    let session = pipeline.dispatcher().register(now_nanos());
    pipeline
        .registry()
        .subscribe(session.id, Symbol::new("rb2405"), MessageKind::Kline);

    // Three trades inside one minute, then one in the next to close it.
    pipeline.ingest("ctp-front-1", record("rb2405", 1, 3500, 10, base + 1_000));
    pipeline.ingest("ctp-front-1", record("rb2405", 2, 3502, 5, base + 2_000));
    pipeline.ingest("ctp-front-1", record("rb2405", 3, 3498, 20, base + 3_000));
    pipeline.ingest("ctp-front-1", record("rb2405", 4, 3499, 1, base + MINUTE + 1_000));

    let metrics = pipeline.metrics().clone();
    wait_until(
        || metrics.ticks_accepted.load(Ordering::Relaxed) == 4,
        "4 accepted ticks",
    )
    .await;
    wait_until(|| session.queue_len() >= 1, "kline delivery").await;

    let drained = session.drain(10);
    let kline = drained
        .iter()
        .find_map(|m| match serde_json::from_str(&m.payload) {
            Ok(ServerMessage::Kline(candle)) => Some(candle),
            _ => None,
        })
        .expect("a kline message");

    assert_eq!(kline.open_time, base);
    assert_eq!(kline.open, Decimal::from(3500));
    assert_eq!(kline.high, Decimal::from(3502));
    assert_eq!(kline.low, Decimal::from(3498));
    assert_eq!(kline.close, Decimal::from(3498));
    assert_eq!(kline.volume, Decimal::from(35));
    assert_eq!(kline.trade_count, 3);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_zero_price_rejected_without_side_effects() {
    let (pipeline, _sink) = start_default();
    let base = bucket_base();
    let sym = Symbol::new("rb2405");

    pipeline.ingest("ctp-front-1", record("rb2405", 1, 0, 10, base + 1_000));

    let metrics = pipeline.metrics().clone();
    wait_until(
        || {
            metrics
                .rejected(feed_pipeline::validation::RejectReason::InvalidPrice)
                == 1
        },
        "invalid_price rejection",
    )
    .await;

    // Neither cache nor aggregation saw the record.
    assert!(pipeline.cache().get_recent(&sym, 10).is_empty());
    assert_eq!(metrics.ticks_accepted.load(Ordering::Relaxed), 0);
    assert_eq!(metrics.candles_emitted.load(Ordering::Relaxed), 0);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery_immediately() {
    let (pipeline, _sink) = start_default();
    let base = bucket_base();
    let sym = Symbol::new("cu2405");

    let session = pipeline.dispatcher().register(now_nanos());
    pipeline
        .registry()
        .subscribe(session.id, sym.clone(), MessageKind::Tick);

    pipeline.ingest("ctp-front-1", record("cu2405", 1, 71000, 10, base + 1_000));

    let metrics = pipeline.metrics().clone();
    wait_until(
        || metrics.ticks_accepted.load(Ordering::Relaxed) == 1,
        "first tick accepted",
    )
    .await;
    assert_eq!(session.queue_len(), 1);

    pipeline.registry().unsubscribe(session.id, &sym, MessageKind::Tick);

    pipeline.ingest("ctp-front-1", record("cu2405", 2, 71010, 10, base + 2_000));
    wait_until(
        || metrics.ticks_accepted.load(Ordering::Relaxed) == 2,
        "second tick accepted",
    )
    .await;

    // The post-unsubscribe tick was never enqueued.
    assert_eq!(session.queue_len(), 1);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_slow_consumer_keeps_newest_and_counts_drops() {
    let sink = Arc::new(MemorySink::new());
    let config = PipelineConfig {
        dispatch: DispatchConfig {
            queue_capacity: 1_000,
            drop_rate_threshold: 10_000,
            ..DispatchConfig::default()
        },
        ..PipelineConfig::default()
    };
    let pipeline = Pipeline::start(config, sink, None);
    let base = bucket_base();

    let session = pipeline.dispatcher().register(now_nanos());
    pipeline
        .registry()
        .subscribe(session.id, Symbol::new("rb2405"), MessageKind::Tick);

    // 1500 ticks, consumer never reads.
    for seq in 1..=1_500u64 {
        pipeline.ingest(
            "ctp-front-1",
            record("rb2405", seq, 3500, 10, base + seq as i64 * 1_000),
        );
    }

    let metrics = pipeline.metrics().clone();
    wait_until(
        || metrics.ticks_accepted.load(Ordering::Relaxed) == 1_500,
        "1500 accepted ticks",
    )
    .await;

    assert_eq!(session.queue_len(), 1_000);
    assert_eq!(session.dropped_total(), 500);

    // Newest 1000 survive, oldest 500 are gone.
    let drained = session.drain(usize::MAX);
    let first: ServerMessage = serde_json::from_str(&drained.first().unwrap().payload).unwrap();
    let last: ServerMessage = serde_json::from_str(&drained.last().unwrap().payload).unwrap();
    match (first, last) {
        (ServerMessage::Tick(first), ServerMessage::Tick(last)) => {
            assert_eq!(first.sequence, 501);
            assert_eq!(last.sequence, 1_500);
        }
        other => panic!("expected tick messages, got {:?}", other),
    }

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_ring_cache_bounded_end_to_end() {
    let (pipeline, _sink) = start_default();
    let base = bucket_base();
    let sym = Symbol::new("rb2405");

    for seq in 1..=600u64 {
        pipeline.ingest(
            "ctp-front-1",
            record("rb2405", seq, 3500, 1, base + seq as i64 * 1_000),
        );
    }

    let metrics = pipeline.metrics().clone();
    wait_until(
        || metrics.ticks_accepted.load(Ordering::Relaxed) == 600,
        "600 accepted ticks",
    )
    .await;

    let recent = pipeline.cache().get_recent(&sym, 1_000);
    assert_eq!(recent.len(), 500);
    assert_eq!(recent.first().unwrap().sequence, 101);
    assert_eq!(recent.last().unwrap().sequence, 600);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_malformed_framing_never_reaches_validation() {
    let (pipeline, _sink) = start_default();
    let base = bucket_base();

    pipeline.ingest("ctp-front-1", record("", 1, 3500, 10, base + 1_000));

    let metrics = pipeline.metrics().clone();
    wait_until(
        || metrics.malformed_records.load(Ordering::Relaxed) == 1,
        "malformed record counted",
    )
    .await;
    assert_eq!(metrics.ticks_accepted.load(Ordering::Relaxed), 0);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_gap_backfill_reconciles_candles() {
    let (pipeline, sink) = start_default();
    let base = bucket_base();
    let sym = Symbol::new("rb2405");

    // The missing tick (sequence 3) is durable from another writer.
    let missing = Tick {
        event_id: Uuid::now_v7(),
        symbol: sym.clone(),
        price: Price::from_u64(3520),
        volume: Quantity::from_u64(7),
        bids: vec![],
        asks: vec![],
        sequence: 3,
        event_time: base + 3_000,
        arrival_index: 0,
        arrival_time: base + 3_000,
        source: "ctp-front-1".to_string(),
        replay: false,
    };
    sink.store_tick(&missing).await.unwrap();

    let session = pipeline.dispatcher().register(now_nanos());
    pipeline
        .registry()
        .subscribe(session.id, sym.clone(), MessageKind::Kline);

    pipeline.ingest("ctp-front-1", record("rb2405", 1, 3500, 10, base + 1_000));
    pipeline.ingest("ctp-front-1", record("rb2405", 2, 3502, 5, base + 2_000));
    // Sequence 3 lost in transit: the jump to 4 triggers recovery.
    pipeline.ingest("ctp-front-1", record("rb2405", 4, 3498, 20, base + 4_000));

    let metrics = pipeline.metrics().clone();
    wait_until(
        || metrics.gaps_detected.load(Ordering::Relaxed) >= 1,
        "gap detection",
    )
    .await;
    wait_until(
        || metrics.backfills_completed.load(Ordering::Relaxed) >= 1,
        "backfill completion",
    )
    .await;
    wait_until(
        || metrics.events_replayed.load(Ordering::Relaxed) >= 1,
        "replayed event",
    )
    .await;

    // Close the bucket and check the corrected aggregate includes the
    // replayed tick exactly once.
    pipeline.ingest("ctp-front-1", record("rb2405", 5, 3499, 1, base + MINUTE + 1_000));
    wait_until(|| session.queue_len() >= 1, "kline delivery").await;

    let drained = session.drain(100);
    let kline = drained
        .iter()
        .rev()
        .find_map(|m| match serde_json::from_str(&m.payload) {
            Ok(ServerMessage::Kline(candle)) if candle.open_time == base => Some(candle),
            _ => None,
        })
        .expect("closed kline for the gapped bucket");

    assert_eq!(kline.high, Decimal::from(3520));
    assert_eq!(kline.volume, Decimal::from(42)); // 10 + 5 + 7 + 20
    assert_eq!(kline.trade_count, 4);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_sink_outage_degrades_to_unresolved_gap() {
    let (pipeline, sink) = start_default();
    let base = bucket_base();

    sink.set_available(false);

    pipeline.ingest("ctp-front-1", record("rb2405", 1, 3500, 10, base + 1_000));
    pipeline.ingest("ctp-front-1", record("rb2405", 10, 3502, 5, base + 2_000));

    let metrics = pipeline.metrics().clone();
    wait_until(
        || metrics.unresolved_gaps.load(Ordering::Relaxed) >= 1,
        "unresolved gap",
    )
    .await;

    // Live flow is unaffected by the dead sink.
    pipeline.ingest("ctp-front-1", record("rb2405", 11, 3503, 5, base + 3_000));
    wait_until(
        || metrics.ticks_accepted.load(Ordering::Relaxed) == 3,
        "live ticks despite outage",
    )
    .await;

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_sequences_rejected_across_lanes() {
    let (pipeline, _sink) = start_default();
    let base = bucket_base();

    pipeline.ingest("ctp-front-1", record("rb2405", 1, 3500, 10, base + 1_000));
    pipeline.ingest("ctp-front-1", record("rb2405", 1, 3500, 10, base + 2_000));

    let metrics = pipeline.metrics().clone();
    wait_until(
        || metrics.rejected(feed_pipeline::validation::RejectReason::Duplicate) == 1,
        "duplicate rejection",
    )
    .await;
    assert_eq!(metrics.ticks_accepted.load(Ordering::Relaxed), 1);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_depth_reaches_only_depth_subscribers() {
    let (pipeline, _sink) = start_default();
    let base = bucket_base();
    let sym = Symbol::new("rb2405");

    let depth_session = pipeline.dispatcher().register(now_nanos());
    let tick_session = pipeline.dispatcher().register(now_nanos());
    pipeline
        .registry()
        .subscribe(depth_session.id, sym.clone(), MessageKind::Depth);
    pipeline
        .registry()
        .subscribe(tick_session.id, sym.clone(), MessageKind::Tick);

    let mut rec = record("rb2405", 1, 3500, 10, base + 1_000);
    rec.bids = vec![(Decimal::from(3499), Decimal::from(5))];
    rec.asks = vec![(Decimal::from(3501), Decimal::from(6))];
    pipeline.ingest("ctp-front-1", rec);

    let metrics = pipeline.metrics().clone();
    wait_until(
        || metrics.ticks_accepted.load(Ordering::Relaxed) == 1,
        "tick accepted",
    )
    .await;

    let depth_msgs = depth_session.drain(10);
    assert_eq!(depth_msgs.len(), 1);
    assert!(depth_msgs[0].payload.contains(r#""type":"depth""#));

    let tick_msgs = tick_session.drain(10);
    assert_eq!(tick_msgs.len(), 1);
    assert!(tick_msgs[0].payload.contains(r#""type":"tick""#));

    // Cache holds the latest depth for late joiners.
    let snap = pipeline.cache().depth(&sym).unwrap();
    assert_eq!(snap.bids.len(), 1);

    pipeline.shutdown().await;
}
