//! Observability counters for the feed pipeline
//!
//! Tracks accepted/rejected ticks per reason, cache behavior, dispatcher
//! queue pressure, and recovery activity. Everything is exported as an
//! ordered name → value map for an external monitoring collaborator.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use dashmap::DashMap;
use types::ids::Symbol;

use crate::validation::RejectReason;

/// Core metrics for the pipeline.
pub struct PipelineMetrics {
    // Ingestion
    pub records_ingested: AtomicU64,
    pub malformed_records: AtomicU64,
    pub lane_overflow: AtomicU64,

    // Validation
    pub ticks_accepted: AtomicU64,
    rejected_invalid_price: AtomicU64,
    rejected_invalid_volume: AtomicU64,
    rejected_duplicate: AtomicU64,
    rejected_out_of_order: AtomicU64,
    rejected_spike: AtomicU64,
    rejected_by_symbol: DashMap<Symbol, u64>,

    // Cache
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub cache_evictions: AtomicU64,

    // Aggregation
    pub candles_emitted: AtomicU64,
    pub late_data: AtomicU64,

    // Dispatch
    pub messages_enqueued: AtomicU64,
    pub messages_dropped: AtomicU64,
    pub forced_disconnects: AtomicU64,
    pub connected_sessions: AtomicU64,

    // Recovery
    pub gaps_detected: AtomicU64,
    pub backfills_completed: AtomicU64,
    pub events_replayed: AtomicU64,
    pub unresolved_gaps: AtomicU64,

    // Sink
    pub sink_write_failures: AtomicU64,
    pub sink_queue_overflow: AtomicU64,

    // Latency
    pub processing_ns: Mutex<LatencyTracker>,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            records_ingested: AtomicU64::new(0),
            malformed_records: AtomicU64::new(0),
            lane_overflow: AtomicU64::new(0),
            ticks_accepted: AtomicU64::new(0),
            rejected_invalid_price: AtomicU64::new(0),
            rejected_invalid_volume: AtomicU64::new(0),
            rejected_duplicate: AtomicU64::new(0),
            rejected_out_of_order: AtomicU64::new(0),
            rejected_spike: AtomicU64::new(0),
            rejected_by_symbol: DashMap::new(),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            cache_evictions: AtomicU64::new(0),
            candles_emitted: AtomicU64::new(0),
            late_data: AtomicU64::new(0),
            messages_enqueued: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            forced_disconnects: AtomicU64::new(0),
            connected_sessions: AtomicU64::new(0),
            gaps_detected: AtomicU64::new(0),
            backfills_completed: AtomicU64::new(0),
            events_replayed: AtomicU64::new(0),
            unresolved_gaps: AtomicU64::new(0),
            sink_write_failures: AtomicU64::new(0),
            sink_queue_overflow: AtomicU64::new(0),
            processing_ns: Mutex::new(LatencyTracker::new(1000)),
        }
    }

    /// Record an accepted tick with its processing latency.
    pub fn record_accepted(&self, latency_ns: u64) {
        self.ticks_accepted.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut tracker) = self.processing_ns.lock() {
            tracker.record(latency_ns);
        }
    }

    /// Record a validation rejection by symbol and reason.
    pub fn record_rejection(&self, symbol: &Symbol, reason: RejectReason) {
        let counter = match reason {
            RejectReason::InvalidPrice => &self.rejected_invalid_price,
            RejectReason::InvalidVolume => &self.rejected_invalid_volume,
            RejectReason::Duplicate => &self.rejected_duplicate,
            RejectReason::OutOfOrder => &self.rejected_out_of_order,
            RejectReason::Spike => &self.rejected_spike,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        *self.rejected_by_symbol.entry(symbol.clone()).or_insert(0) += 1;
    }

    /// Rejections counted for a reason.
    pub fn rejected(&self, reason: RejectReason) -> u64 {
        let counter = match reason {
            RejectReason::InvalidPrice => &self.rejected_invalid_price,
            RejectReason::InvalidVolume => &self.rejected_invalid_volume,
            RejectReason::Duplicate => &self.rejected_duplicate,
            RejectReason::OutOfOrder => &self.rejected_out_of_order,
            RejectReason::Spike => &self.rejected_spike,
        };
        counter.load(Ordering::Relaxed)
    }

    /// Total rejections counted for a symbol, any reason.
    pub fn rejected_for_symbol(&self, symbol: &Symbol) -> u64 {
        self.rejected_by_symbol
            .get(symbol)
            .map(|v| *v)
            .unwrap_or(0)
    }

    /// Export all counters as an ordered map for exposition.
    pub fn export(&self) -> BTreeMap<String, u64> {
        let mut m = BTreeMap::new();
        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);
        m.insert("records_ingested".to_string(), load(&self.records_ingested));
        m.insert("malformed_records".to_string(), load(&self.malformed_records));
        m.insert("lane_overflow".to_string(), load(&self.lane_overflow));
        m.insert("ticks_accepted".to_string(), load(&self.ticks_accepted));
        m.insert(
            "rejected_invalid_price".to_string(),
            load(&self.rejected_invalid_price),
        );
        m.insert(
            "rejected_invalid_volume".to_string(),
            load(&self.rejected_invalid_volume),
        );
        m.insert("rejected_duplicate".to_string(), load(&self.rejected_duplicate));
        m.insert(
            "rejected_out_of_order".to_string(),
            load(&self.rejected_out_of_order),
        );
        m.insert("rejected_spike".to_string(), load(&self.rejected_spike));
        m.insert("cache_hits".to_string(), load(&self.cache_hits));
        m.insert("cache_misses".to_string(), load(&self.cache_misses));
        m.insert("cache_evictions".to_string(), load(&self.cache_evictions));
        m.insert("candles_emitted".to_string(), load(&self.candles_emitted));
        m.insert("late_data".to_string(), load(&self.late_data));
        m.insert("messages_enqueued".to_string(), load(&self.messages_enqueued));
        m.insert("messages_dropped".to_string(), load(&self.messages_dropped));
        m.insert(
            "forced_disconnects".to_string(),
            load(&self.forced_disconnects),
        );
        m.insert(
            "connected_sessions".to_string(),
            load(&self.connected_sessions),
        );
        m.insert("gaps_detected".to_string(), load(&self.gaps_detected));
        m.insert(
            "backfills_completed".to_string(),
            load(&self.backfills_completed),
        );
        m.insert("events_replayed".to_string(), load(&self.events_replayed));
        m.insert("unresolved_gaps".to_string(), load(&self.unresolved_gaps));
        m.insert(
            "sink_write_failures".to_string(),
            load(&self.sink_write_failures),
        );
        m.insert(
            "sink_queue_overflow".to_string(),
            load(&self.sink_queue_overflow),
        );
        m
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks latency samples for percentile calculation.
pub struct LatencyTracker {
    samples: Vec<u64>,
    max_samples: usize,
}

impl LatencyTracker {
    pub fn new(max_samples: usize) -> Self {
        Self {
            samples: Vec::with_capacity(max_samples),
            max_samples,
        }
    }

    /// Record a latency sample.
    pub fn record(&mut self, value: u64) {
        if self.samples.len() >= self.max_samples {
            self.samples.remove(0);
        }
        self.samples.push(value);
    }

    /// Get a percentile value (0-100).
    pub fn percentile(&self, p: usize) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }

        let mut sorted = self.samples.clone();
        sorted.sort_unstable();

        let idx = (p as f64 / 100.0 * (sorted.len() - 1) as f64) as usize;
        Some(sorted[idx.min(sorted.len() - 1)])
    }

    /// Average latency.
    pub fn average(&self) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }
        let sum: u64 = self.samples.iter().sum();
        Some(sum / self.samples.len() as u64)
    }

    /// Number of samples recorded.
    pub fn count(&self) -> usize {
        self.samples.len()
    }
}
