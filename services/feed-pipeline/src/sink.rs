//! Persistence sink boundary
//!
//! The durable time-series store is an external collaborator. This
//! module defines the trait the pipeline writes through and reads
//! backfill from, a write-behind worker with a bounded retry budget
//! (durability must never block ingestion), and an in-memory sink used
//! by tests and single-process runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use types::ids::Symbol;

use crate::candles::Candle;
use crate::config::SinkConfig;
use crate::events::Tick;
use crate::metrics::PipelineMetrics;

/// Errors from the persistence sink.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    #[error("sink unavailable: {0}")]
    Unavailable(String),

    #[error("range query failed: {0}")]
    QueryFailed(String),
}

/// Async write/read boundary to the durable store.
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    /// Persist one validated tick.
    async fn store_tick(&self, tick: &Tick) -> Result<(), SinkError>;

    /// Persist one closed candle.
    async fn store_candle(&self, candle: &Candle) -> Result<(), SinkError>;

    /// Ticks for a symbol within [from_time, to_time], oldest first,
    /// capped at `limit`.
    async fn fetch_range(
        &self,
        symbol: &Symbol,
        from_time: i64,
        to_time: i64,
        limit: usize,
    ) -> Result<Vec<Tick>, SinkError>;
}

/// In-memory [`PersistenceSink`] for tests and single-process runs.
pub struct MemorySink {
    ticks: DashMap<Symbol, Vec<Tick>>,
    candles: DashMap<Symbol, Vec<Candle>>,
    available: AtomicBool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self {
            ticks: DashMap::new(),
            candles: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate outage (recovery must degrade, not block).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    fn check_available(&self) -> Result<(), SinkError> {
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(SinkError::Unavailable("simulated outage".to_string()))
        }
    }

    /// Ticks stored for a symbol.
    pub fn tick_count(&self, symbol: &Symbol) -> usize {
        self.ticks.get(symbol).map(|v| v.len()).unwrap_or(0)
    }

    /// Candles stored for a symbol.
    pub fn candle_count(&self, symbol: &Symbol) -> usize {
        self.candles.get(symbol).map(|v| v.len()).unwrap_or(0)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PersistenceSink for MemorySink {
    async fn store_tick(&self, tick: &Tick) -> Result<(), SinkError> {
        self.check_available()?;
        let mut entry = self.ticks.entry(tick.symbol.clone()).or_default();
        // Keep the vector ordered by event time; appends are the common case.
        let pos = entry
            .iter()
            .rposition(|t| t.event_time <= tick.event_time)
            .map(|i| i + 1)
            .unwrap_or(0);
        entry.insert(pos, tick.clone());
        Ok(())
    }

    async fn store_candle(&self, candle: &Candle) -> Result<(), SinkError> {
        self.check_available()?;
        self.candles
            .entry(candle.symbol.clone())
            .or_default()
            .push(candle.clone());
        Ok(())
    }

    async fn fetch_range(
        &self,
        symbol: &Symbol,
        from_time: i64,
        to_time: i64,
        limit: usize,
    ) -> Result<Vec<Tick>, SinkError> {
        self.check_available()?;
        let Some(ticks) = self.ticks.get(symbol) else {
            return Ok(Vec::new());
        };
        Ok(ticks
            .iter()
            .filter(|t| t.event_time >= from_time && t.event_time <= to_time)
            .take(limit)
            .cloned()
            .collect())
    }
}

/// Commands for the write-behind worker.
enum SinkCommand {
    Tick(Tick),
    Candle(Candle),
}

/// Fire-and-forget writer in front of a [`PersistenceSink`].
///
/// Producers enqueue with `try_send`; a full queue drops the write and
/// counts it. The worker retries each write up to the configured budget
/// and then abandons it: durability degradation is observable but
/// never back-pressures the pipeline.
pub struct SinkWriter {
    tx: mpsc::Sender<SinkCommand>,
    metrics: Arc<PipelineMetrics>,
}

impl SinkWriter {
    /// Spawn the writer task. Returns the handle pair.
    pub fn spawn(
        sink: Arc<dyn PersistenceSink>,
        config: SinkConfig,
        metrics: Arc<PipelineMetrics>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let worker_metrics = metrics.clone();
        let handle = tokio::spawn(write_behind_worker(sink, rx, config, worker_metrics));
        (Self { tx, metrics }, handle)
    }

    /// Enqueue a tick write. Never blocks.
    pub fn store_tick(&self, tick: Tick) {
        if self.tx.try_send(SinkCommand::Tick(tick)).is_err() {
            self.metrics.sink_queue_overflow.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Enqueue a candle write. Never blocks.
    pub fn store_candle(&self, candle: Candle) {
        if self.tx.try_send(SinkCommand::Candle(candle)).is_err() {
            self.metrics.sink_queue_overflow.fetch_add(1, Ordering::Relaxed);
        }
    }
}

async fn write_behind_worker(
    sink: Arc<dyn PersistenceSink>,
    mut rx: mpsc::Receiver<SinkCommand>,
    config: SinkConfig,
    metrics: Arc<PipelineMetrics>,
) {
    while let Some(command) = rx.recv().await {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let result = match &command {
                SinkCommand::Tick(tick) => sink.store_tick(tick).await,
                SinkCommand::Candle(candle) => sink.store_candle(candle).await,
            };
            match result {
                Ok(()) => break,
                Err(err) if attempts < config.retry_budget => {
                    debug!(attempts, error = %err, "Sink write failed — retrying");
                    tokio::time::sleep(std::time::Duration::from_millis(config.retry_delay_ms))
                        .await;
                }
                Err(err) => {
                    metrics.sink_write_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(attempts, error = %err, "Sink write abandoned");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use types::numeric::{Price, Quantity};
    use uuid::Uuid;

    fn tick(seq: u64, event_time: i64) -> Tick {
        Tick {
            event_id: Uuid::now_v7(),
            symbol: Symbol::new("rb2405"),
            price: Price::from_u64(3500),
            volume: Quantity::from_u64(10),
            bids: vec![],
            asks: vec![],
            sequence: seq,
            event_time,
            arrival_index: seq,
            arrival_time: event_time + 500,
            source: "ctp-front-1".to_string(),
            replay: false,
        }
    }

    #[tokio::test]
    async fn test_memory_sink_range_query() {
        let sink = MemorySink::new();
        for seq in 1..=5u64 {
            sink.store_tick(&tick(seq, seq as i64 * 1_000)).await.unwrap();
        }

        let sym = Symbol::new("rb2405");
        let ticks = sink.fetch_range(&sym, 2_000, 4_000, 100).await.unwrap();
        assert_eq!(ticks.len(), 3);
        assert_eq!(ticks[0].sequence, 2);
        assert_eq!(ticks[2].sequence, 4);

        let capped = sink.fetch_range(&sym, 0, 10_000, 2).await.unwrap();
        assert_eq!(capped.len(), 2);
    }

    #[tokio::test]
    async fn test_memory_sink_orders_out_of_sequence_writes() {
        let sink = MemorySink::new();
        sink.store_tick(&tick(3, 3_000)).await.unwrap();
        sink.store_tick(&tick(1, 1_000)).await.unwrap();
        sink.store_tick(&tick(2, 2_000)).await.unwrap();

        let ticks = sink
            .fetch_range(&Symbol::new("rb2405"), 0, 10_000, 100)
            .await
            .unwrap();
        assert_eq!(
            ticks.iter().map(|t| t.sequence).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[tokio::test]
    async fn test_memory_sink_outage() {
        let sink = MemorySink::new();
        sink.set_available(false);
        assert!(sink.store_tick(&tick(1, 1_000)).await.is_err());
        assert!(sink
            .fetch_range(&Symbol::new("rb2405"), 0, 10_000, 10)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_writer_persists_asynchronously() {
        let sink = Arc::new(MemorySink::new());
        let metrics = Arc::new(PipelineMetrics::new());
        let (writer, handle) = SinkWriter::spawn(
            sink.clone(),
            SinkConfig::default(),
            metrics.clone(),
        );

        writer.store_tick(tick(1, 1_000));
        writer.store_tick(tick(2, 2_000));
        drop(writer);
        handle.await.unwrap();

        assert_eq!(sink.tick_count(&Symbol::new("rb2405")), 2);
    }

    #[tokio::test]
    async fn test_writer_abandons_after_retry_budget() {
        let sink = Arc::new(MemorySink::new());
        sink.set_available(false);
        let metrics = Arc::new(PipelineMetrics::new());
        let config = SinkConfig {
            retry_budget: 2,
            retry_delay_ms: 1,
            ..SinkConfig::default()
        };
        let (writer, handle) = SinkWriter::spawn(sink.clone(), config, metrics.clone());

        writer.store_tick(tick(1, 1_000));
        drop(writer);
        handle.await.unwrap();

        assert_eq!(metrics.sink_write_failures.load(Ordering::Relaxed), 1);
        assert_eq!(sink.tick_count(&Symbol::new("rb2405")), 0);
    }
}
