//! Event definitions for the feed pipeline
//!
//! Two shapes matter here: `RawRecord` is what a feed adapter delivers
//! before any checking, and `Tick` is the validated, immutable form that
//! flows through cache, aggregation, and dispatch. Keeping them as
//! separate types means downstream code never sees an unvalidated price.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use types::ids::Symbol;
use types::numeric::{Price, Quantity};
use uuid::Uuid;

/// One side's price level in an order-book snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: Price,
    pub size: Quantity,
}

/// A raw market event as framed by an upstream feed adapter.
///
/// At-least-once delivery: duplicates and gaps in `sequence` are
/// expected and handled downstream. All numeric fields are untrusted
/// until the cleaning rules accept the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    /// Instrument code as sent by the exchange.
    pub symbol: String,
    /// Last trade price (unvalidated).
    pub price: Decimal,
    /// Traded volume (unvalidated).
    pub volume: Decimal,
    /// Bid depth levels as (price, size) pairs, best first.
    #[serde(default)]
    pub bids: Vec<(Decimal, Decimal)>,
    /// Ask depth levels as (price, size) pairs, best first.
    #[serde(default)]
    pub asks: Vec<(Decimal, Decimal)>,
    /// Exchange-assigned sequence number, monotonic per symbol.
    pub sequence: u64,
    /// Exchange event timestamp in Unix nanoseconds.
    pub event_time: i64,
}

/// A raw record stamped by the ingestion gateway.
///
/// Carries the pipeline-assigned arrival index (ordering diagnostics,
/// not business correctness) and the replay marker set by recovery.
#[derive(Debug, Clone, PartialEq)]
pub struct IngressRecord {
    pub record: RawRecord,
    /// Feed source that delivered the record.
    pub source: String,
    /// Process-wide monotonic arrival index.
    pub arrival_index: u64,
    /// Wall-clock arrival timestamp in Unix nanoseconds.
    pub arrival_time: i64,
    /// True when this record re-enters via recovery backfill.
    pub replay: bool,
}

/// A validated market tick. Immutable once built.
///
/// Cache, aggregation, and dispatch each receive independent clones;
/// nothing mutates a tick after validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    /// Unique event identifier (UUID v7, time-sortable).
    pub event_id: Uuid,
    pub symbol: Symbol,
    pub price: Price,
    pub volume: Quantity,
    /// Bid depth, best (highest) first. Empty for pure trade ticks.
    pub bids: Vec<BookLevel>,
    /// Ask depth, best (lowest) first. Empty for pure trade ticks.
    pub asks: Vec<BookLevel>,
    /// Exchange sequence number, monotonic per symbol.
    pub sequence: u64,
    /// Exchange event timestamp in Unix nanoseconds.
    pub event_time: i64,
    /// Pipeline-assigned arrival index.
    pub arrival_index: u64,
    /// Wall-clock arrival timestamp in Unix nanoseconds.
    pub arrival_time: i64,
    /// Feed source that delivered the record.
    pub source: String,
    /// True when the tick entered via recovery backfill.
    pub replay: bool,
}

impl Tick {
    /// Whether this tick carries order-book depth.
    pub fn has_depth(&self) -> bool {
        !self.bids.is_empty() || !self.asks.is_empty()
    }

    /// Extract a depth snapshot if the tick carries one.
    pub fn depth_snapshot(&self) -> Option<DepthSnapshot> {
        if !self.has_depth() {
            return None;
        }
        Some(DepthSnapshot {
            symbol: self.symbol.clone(),
            bids: self.bids.clone(),
            asks: self.asks.clone(),
            sequence: self.sequence,
            event_time: self.event_time,
        })
    }

    /// Re-frame as a raw record, e.g. when the persistence sink hands
    /// ticks back for backfill and they re-enter validation.
    pub fn to_raw(&self) -> RawRecord {
        RawRecord {
            symbol: self.symbol.as_str().to_string(),
            price: self.price.as_decimal(),
            volume: self.volume.as_decimal(),
            bids: self
                .bids
                .iter()
                .map(|l| (l.price.as_decimal(), l.size.as_decimal()))
                .collect(),
            asks: self
                .asks
                .iter()
                .map(|l| (l.price.as_decimal(), l.size.as_decimal()))
                .collect(),
            sequence: self.sequence,
            event_time: self.event_time,
        }
    }
}

/// Last-known order-book state for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthSnapshot {
    pub symbol: Symbol,
    /// Bid levels, best (highest price) first.
    pub bids: Vec<BookLevel>,
    /// Ask levels, best (lowest price) first.
    pub asks: Vec<BookLevel>,
    pub sequence: u64,
    pub event_time: i64,
}

/// Request to backfill missing events from the persistence sink.
///
/// Emitted when recovery detects a sequence gap or a dead feed source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryRequest {
    /// Feed source the gap was observed on.
    pub source: String,
    pub symbol: Symbol,
    /// First missing sequence number (inclusive).
    pub from_sequence: u64,
    /// Last missing sequence number (inclusive).
    pub to_sequence: u64,
    /// Unix nanoseconds when the gap was detected.
    pub detected_at: i64,
}

impl RecoveryRequest {
    /// Number of events missing in this gap.
    pub fn gap_size(&self) -> u64 {
        self.to_sequence - self.from_sequence + 1
    }
}
