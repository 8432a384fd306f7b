//! Ingestion gateway
//!
//! Front door for feed adapters. Each raw record gets a process-wide
//! arrival index and an arrival timestamp, passes framing checks, and
//! is routed to a symbol lane (`hash(symbol) % lanes`) so one worker
//! sees all of a symbol's records in FIFO order while different symbols
//! process in parallel. Sequence observations stream to recovery; per-
//! source activity is tracked for liveness timeouts. Nothing in this
//! path ever blocks: full lanes drop and count.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use types::ids::Symbol;

use crate::config::GatewayConfig;
use crate::events::{IngressRecord, RawRecord};
use crate::metrics::PipelineMetrics;

/// Why a record was dropped before validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingError {
    /// Symbol missing or not a plausible instrument code.
    InvalidSymbol,
    /// Event timestamp absent or non-positive.
    InvalidTimestamp,
}

/// Result of offering one record to the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Routed to a symbol lane.
    Routed,
    /// Dropped at framing; never reached validation.
    Malformed(FramingError),
    /// The symbol's lane queue was full; record dropped.
    LaneOverflow,
}

/// Work item consumed by a lane worker.
#[derive(Debug)]
pub enum LaneMessage {
    /// A live record from a feed source.
    Live(Symbol, IngressRecord),
    /// A recovery batch for one symbol, already marked as replay.
    Replay(Symbol, Vec<IngressRecord>),
    /// Close any candle buckets whose window has elapsed.
    Flush(i64),
}

/// Sequence observation forwarded to the recovery monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeqObservation {
    pub source: String,
    pub symbol: Symbol,
    pub sequence: u64,
    pub observed_at: i64,
}

/// Routes feed records into symbol lanes.
pub struct IngestionGateway {
    lanes: Vec<mpsc::Sender<LaneMessage>>,
    arrival_counter: AtomicU64,
    /// Last activity per feed source, Unix nanoseconds.
    sources: DashMap<String, i64>,
    seq_tx: mpsc::Sender<SeqObservation>,
    config: GatewayConfig,
    metrics: Arc<PipelineMetrics>,
}

impl IngestionGateway {
    pub fn new(
        lanes: Vec<mpsc::Sender<LaneMessage>>,
        seq_tx: mpsc::Sender<SeqObservation>,
        config: GatewayConfig,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        assert!(!lanes.is_empty(), "gateway needs at least one lane");
        Self {
            lanes,
            arrival_counter: AtomicU64::new(0),
            sources: DashMap::new(),
            seq_tx,
            config,
            metrics,
        }
    }

    /// Offer one raw record from a feed source.
    pub fn ingest(&self, source: &str, record: RawRecord, now: i64) -> IngestOutcome {
        self.metrics.records_ingested.fetch_add(1, Ordering::Relaxed);
        self.sources.insert(source.to_string(), now);

        let Some(symbol) = Symbol::try_new(record.symbol.clone()) else {
            self.metrics.malformed_records.fetch_add(1, Ordering::Relaxed);
            debug!(source, symbol = %record.symbol, "Dropping record with bad symbol");
            return IngestOutcome::Malformed(FramingError::InvalidSymbol);
        };
        if record.event_time <= 0 {
            self.metrics.malformed_records.fetch_add(1, Ordering::Relaxed);
            debug!(source, symbol = %symbol, "Dropping record with bad timestamp");
            return IngestOutcome::Malformed(FramingError::InvalidTimestamp);
        }

        // Recovery watches the sequence stream; a full channel only
        // costs gap-detection fidelity, never ingest throughput.
        let _ = self.seq_tx.try_send(SeqObservation {
            source: source.to_string(),
            symbol: symbol.clone(),
            sequence: record.sequence,
            observed_at: now,
        });

        let arrival_index = self.arrival_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let ingress = IngressRecord {
            record,
            source: source.to_string(),
            arrival_index,
            arrival_time: now,
            replay: false,
        };

        let lane = self.lane_for(&symbol);
        match self.lanes[lane].try_send(LaneMessage::Live(symbol, ingress)) {
            Ok(()) => IngestOutcome::Routed,
            Err(_) => {
                self.metrics.lane_overflow.fetch_add(1, Ordering::Relaxed);
                warn!(lane, "Lane queue full — dropping record");
                IngestOutcome::LaneOverflow
            }
        }
    }

    /// Inject a replay batch into the owning lane.
    ///
    /// Called from the recovery task; awaits lane capacity because a
    /// backfill batch must not be silently lost.
    pub async fn inject_replay(&self, symbol: Symbol, records: Vec<IngressRecord>) -> bool {
        let lane = self.lane_for(&symbol);
        self.lanes[lane]
            .send(LaneMessage::Replay(symbol, records))
            .await
            .is_ok()
    }

    /// Ask every lane to close elapsed candle buckets.
    pub async fn broadcast_flush(&self, now: i64) {
        for lane in &self.lanes {
            let _ = lane.send(LaneMessage::Flush(now)).await;
        }
    }

    /// Lane index owning a symbol.
    pub fn lane_for(&self, symbol: &Symbol) -> usize {
        let mut hasher = DefaultHasher::new();
        symbol.hash(&mut hasher);
        (hasher.finish() % self.lanes.len() as u64) as usize
    }

    /// Sources with no activity inside the liveness timeout.
    ///
    /// Each dead source is reported once; it re-registers on its next
    /// record.
    pub fn take_stale_sources(&self, now: i64) -> Vec<String> {
        let timeout = self.config.liveness_timeout_nanos;
        let stale: Vec<String> = self
            .sources
            .iter()
            .filter(|entry| now - *entry.value() > timeout)
            .map(|entry| entry.key().clone())
            .collect();
        for source in &stale {
            self.sources.remove(source);
            warn!(source = %source, "Feed source liveness timeout");
        }
        stale
    }

    /// Total records assigned an arrival index so far.
    pub fn arrival_count(&self) -> u64 {
        self.arrival_counter.load(Ordering::Relaxed)
    }
}
