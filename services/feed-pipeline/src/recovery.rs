//! Recovery and gap handling
//!
//! Watches the sequence stream coming out of the ingestion gateway and
//! tracks the highest sequence seen per (source, symbol). A sequence
//! jump, or a source going quiet past its liveness timeout, produces a
//! bounded backfill: a window of ticks is fetched from the persistence
//! sink, marked as replay, and injected back through validation so the
//! aggregation engine can reconcile. A dead sink degrades to an
//! unresolved-gap counter; live ingestion is never blocked.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tracing::{info, warn};
use types::ids::Symbol;

use crate::config::RecoveryConfig;
use crate::events::{IngressRecord, RecoveryRequest};
use crate::ingestion::SeqObservation;
use crate::sink::{PersistenceSink, SinkError};

/// Source label stamped on replayed records.
pub const REPLAY_SOURCE: &str = "backfill";

/// Tracks per-(source, symbol) sequence continuity.
#[derive(Debug, Default)]
pub struct RecoveryMonitor {
    last_seq: HashMap<(String, Symbol), u64>,
    symbols_by_source: HashMap<String, BTreeSet<Symbol>>,
}

impl RecoveryMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one sequence observation; returns a recovery request when a
    /// gap is detected.
    pub fn observe(&mut self, obs: &SeqObservation) -> Option<RecoveryRequest> {
        self.symbols_by_source
            .entry(obs.source.clone())
            .or_default()
            .insert(obs.symbol.clone());

        let key = (obs.source.clone(), obs.symbol.clone());
        let last = match self.last_seq.get(&key) {
            None => {
                // First observation for this stream; nothing to compare.
                self.last_seq.insert(key, obs.sequence);
                return None;
            }
            Some(last) => *last,
        };

        if obs.sequence <= last {
            // Duplicate or stale; validation rejects it independently.
            return None;
        }

        let request = if obs.sequence > last + 1 {
            warn!(
                source = %obs.source,
                symbol = %obs.symbol,
                from = last + 1,
                to = obs.sequence - 1,
                "Sequence gap detected"
            );
            Some(RecoveryRequest {
                source: obs.source.clone(),
                symbol: obs.symbol.clone(),
                from_sequence: last + 1,
                to_sequence: obs.sequence - 1,
                detected_at: obs.observed_at,
            })
        } else {
            None
        };

        self.last_seq.insert(key, obs.sequence);
        request
    }

    /// Symbols ever observed on a source, for disconnect backfill.
    pub fn symbols_for(&self, source: &str) -> Vec<Symbol> {
        self.symbols_by_source
            .get(source)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Highest sequence seen for a stream.
    pub fn last_sequence(&self, source: &str, symbol: &Symbol) -> Option<u64> {
        self.last_seq
            .get(&(source.to_string(), symbol.clone()))
            .copied()
    }
}

/// Fetch the bounded backfill window for one symbol from the sink and
/// frame it for replay through validation.
///
/// The window ends at the detection time and is bounded both by wall
/// clock and event count, whichever is smaller.
pub async fn fetch_backfill(
    sink: &Arc<dyn PersistenceSink>,
    symbol: &Symbol,
    detected_at: i64,
    config: &RecoveryConfig,
) -> Result<Vec<IngressRecord>, SinkError> {
    let from_time = detected_at - config.backfill_window_nanos;
    let ticks = sink
        .fetch_range(symbol, from_time, detected_at, config.backfill_max_events)
        .await?;

    info!(
        symbol = %symbol,
        events = ticks.len(),
        window_nanos = config.backfill_window_nanos,
        "Backfill window fetched"
    );

    Ok(ticks
        .into_iter()
        .map(|tick| IngressRecord {
            record: tick.to_raw(),
            source: REPLAY_SOURCE.to_string(),
            arrival_index: 0,
            arrival_time: detected_at,
            replay: true,
        })
        .collect())
}
