//! Validation/cleaning engine
//!
//! Runs inside a symbol lane worker, so each instance is touched by
//! exactly one task and no locking is needed. Rules are applied in a
//! fixed order; the first failure rejects the record with a reason code.
//! Accepted records pass through unchanged; values are never smoothed
//! or corrected.

use std::collections::{HashSet, VecDeque};

use rust_decimal::Decimal;
use tracing::debug;
use types::ids::Symbol;
use types::numeric::{Price, Quantity};
use uuid::Uuid;

use crate::config::ValidatorConfig;
use crate::events::{BookLevel, IngressRecord, Tick};

/// Reason a record failed cleaning. Closed set; each maps to a counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    /// Price not strictly positive.
    InvalidPrice,
    /// Volume negative.
    InvalidVolume,
    /// Exchange sequence already accepted for this symbol.
    Duplicate,
    /// Event timestamp not strictly after the last accepted one.
    OutOfOrder,
    /// Large price move on thin volume.
    Spike,
}

impl RejectReason {
    /// Stable label used in metrics and error payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::InvalidPrice => "invalid_price",
            RejectReason::InvalidVolume => "invalid_volume",
            RejectReason::Duplicate => "duplicate",
            RejectReason::OutOfOrder => "out_of_order",
            RejectReason::Spike => "spike",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-symbol cleaning state.
///
/// Tracks the monotonicity cursor, the previous accepted price for the
/// spike filter, and a bounded window of seen sequence numbers for
/// duplicate detection.
#[derive(Debug, Default)]
pub struct SymbolValidator {
    last_event_time: Option<i64>,
    last_price: Option<Decimal>,
    seen_sequences: HashSet<u64>,
    seen_order: VecDeque<u64>,
    accepted: u64,
}

impl SymbolValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply the cleaning rules to one stamped record.
    ///
    /// Replayed records (recovery backfill) skip the monotonicity and
    /// spike rules: they are historical by construction and their
    /// acceptance is reconciled downstream by the aggregation engine.
    pub fn validate(
        &mut self,
        symbol: &Symbol,
        rec: &IngressRecord,
        config: &ValidatorConfig,
    ) -> Result<Tick, RejectReason> {
        let raw = &rec.record;

        // Rule 1: price strictly positive.
        let price = Price::try_new(raw.price).map_err(|_| RejectReason::InvalidPrice)?;

        // Rule 2: volume non-negative.
        let volume = Quantity::try_new(raw.volume).map_err(|_| RejectReason::InvalidVolume)?;

        // Depth levels obey the same numeric rules as the trade fields.
        let bids = convert_levels(&raw.bids)?;
        let asks = convert_levels(&raw.asks)?;

        // Rule 3a: duplicate sequence.
        if self.seen_sequences.contains(&raw.sequence) {
            return Err(RejectReason::Duplicate);
        }

        // Rule 3b: strict timestamp monotonicity (live records only).
        if !rec.replay {
            if let Some(last) = self.last_event_time {
                if raw.event_time <= last {
                    return Err(RejectReason::OutOfOrder);
                }
            }

            // Rule 4: spike filter. A large relative move on thin volume
            // is treated as feed noise; proportional volume legitimizes it.
            if let Some(prev) = self.last_price {
                let deviation = ((raw.price - prev) / prev).abs();
                if deviation > config.max_deviation && raw.volume < config.min_spike_volume {
                    debug!(
                        symbol = %symbol,
                        sequence = raw.sequence,
                        deviation = %deviation,
                        volume = %raw.volume,
                        "Rejecting spike"
                    );
                    return Err(RejectReason::Spike);
                }
            }
        }

        // Accept.
        self.record_sequence(raw.sequence, config.dedup_window);
        if self.last_event_time.map_or(true, |last| raw.event_time > last) {
            self.last_event_time = Some(raw.event_time);
            self.last_price = Some(raw.price);
        }
        self.accepted += 1;

        Ok(Tick {
            event_id: Uuid::now_v7(),
            symbol: symbol.clone(),
            price,
            volume,
            bids,
            asks,
            sequence: raw.sequence,
            event_time: raw.event_time,
            arrival_index: rec.arrival_index,
            arrival_time: rec.arrival_time,
            source: rec.source.clone(),
            replay: rec.replay,
        })
    }

    /// Total records accepted by this validator.
    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    /// Last accepted event timestamp, if any.
    pub fn last_event_time(&self) -> Option<i64> {
        self.last_event_time
    }

    fn record_sequence(&mut self, seq: u64, window: usize) {
        if self.seen_order.len() >= window {
            if let Some(evicted) = self.seen_order.pop_front() {
                self.seen_sequences.remove(&evicted);
            }
        }
        self.seen_order.push_back(seq);
        self.seen_sequences.insert(seq);
    }
}

fn convert_levels(levels: &[(Decimal, Decimal)]) -> Result<Vec<BookLevel>, RejectReason> {
    levels
        .iter()
        .map(|(price, size)| {
            Ok(BookLevel {
                price: Price::try_new(*price).map_err(|_| RejectReason::InvalidPrice)?,
                size: Quantity::try_new(*size).map_err(|_| RejectReason::InvalidVolume)?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RawRecord;

    fn ingress(seq: u64, price: i64, volume: i64, event_time: i64) -> IngressRecord {
        IngressRecord {
            record: RawRecord {
                symbol: "rb2405".to_string(),
                price: Decimal::from(price),
                volume: Decimal::from(volume),
                bids: vec![],
                asks: vec![],
                sequence: seq,
                event_time,
            },
            source: "ctp-front-1".to_string(),
            arrival_index: seq,
            arrival_time: event_time + 500,
            replay: false,
        }
    }

    fn validate_one(
        v: &mut SymbolValidator,
        rec: &IngressRecord,
    ) -> Result<Tick, RejectReason> {
        v.validate(&Symbol::new("rb2405"), rec, &ValidatorConfig::default())
    }

    #[test]
    fn test_accepts_clean_sequence() {
        let mut v = SymbolValidator::new();
        for seq in 1..=5 {
            let rec = ingress(seq, 3500, 10, 1_000_000 * seq as i64);
            assert!(validate_one(&mut v, &rec).is_ok());
        }
        assert_eq!(v.accepted(), 5);
        assert_eq!(v.last_event_time(), Some(5_000_000));
    }

    #[test]
    fn test_rejects_zero_price() {
        let mut v = SymbolValidator::new();
        let rec = ingress(1, 0, 10, 1_000_000);
        assert_eq!(validate_one(&mut v, &rec), Err(RejectReason::InvalidPrice));
        assert_eq!(v.accepted(), 0);
    }

    #[test]
    fn test_rejects_negative_volume() {
        let mut v = SymbolValidator::new();
        let rec = ingress(1, 3500, -1, 1_000_000);
        assert_eq!(validate_one(&mut v, &rec), Err(RejectReason::InvalidVolume));
    }

    #[test]
    fn test_price_rule_checked_before_volume() {
        let mut v = SymbolValidator::new();
        let rec = ingress(1, -10, -1, 1_000_000);
        assert_eq!(validate_one(&mut v, &rec), Err(RejectReason::InvalidPrice));
    }

    #[test]
    fn test_rejects_duplicate_sequence() {
        let mut v = SymbolValidator::new();
        validate_one(&mut v, &ingress(1, 3500, 10, 1_000_000)).unwrap();

        let dup = ingress(1, 3501, 10, 2_000_000);
        assert_eq!(validate_one(&mut v, &dup), Err(RejectReason::Duplicate));
    }

    #[test]
    fn test_rejects_stale_and_equal_timestamps() {
        let mut v = SymbolValidator::new();
        validate_one(&mut v, &ingress(1, 3500, 10, 2_000_000)).unwrap();

        let older = ingress(2, 3501, 10, 1_000_000);
        assert_eq!(validate_one(&mut v, &older), Err(RejectReason::OutOfOrder));

        let equal = ingress(3, 3501, 10, 2_000_000);
        assert_eq!(validate_one(&mut v, &equal), Err(RejectReason::OutOfOrder));
    }

    #[test]
    fn test_spike_rejected_on_thin_volume() {
        let mut v = SymbolValidator::new();
        validate_one(&mut v, &ingress(1, 3500, 10, 1_000_000)).unwrap();

        // +20% on volume 10 (< 50): spike.
        let spike = ingress(2, 4200, 10, 2_000_000);
        assert_eq!(validate_one(&mut v, &spike), Err(RejectReason::Spike));

        // Spike rejection must not move the reference price.
        let normal = ingress(3, 3510, 10, 3_000_000);
        assert!(validate_one(&mut v, &normal).is_ok());
    }

    #[test]
    fn test_large_move_with_volume_is_legitimate_gap() {
        let mut v = SymbolValidator::new();
        validate_one(&mut v, &ingress(1, 3500, 10, 1_000_000)).unwrap();

        // +20% but volume 200 >= 50: accepted.
        let gap = ingress(2, 4200, 200, 2_000_000);
        assert!(validate_one(&mut v, &gap).is_ok());
    }

    #[test]
    fn test_small_move_on_thin_volume_accepted() {
        let mut v = SymbolValidator::new();
        validate_one(&mut v, &ingress(1, 3500, 10, 1_000_000)).unwrap();

        // ~0.06% move: fine regardless of volume.
        let rec = ingress(2, 3502, 1, 2_000_000);
        assert!(validate_one(&mut v, &rec).is_ok());
    }

    #[test]
    fn test_replay_skips_monotonicity_but_not_dedup() {
        let mut v = SymbolValidator::new();
        validate_one(&mut v, &ingress(10, 3500, 10, 10_000_000)).unwrap();

        // Historical record arriving via backfill.
        let mut replayed = ingress(5, 3490, 10, 5_000_000);
        replayed.replay = true;
        let tick = validate_one(&mut v, &replayed).unwrap();
        assert!(tick.replay);

        // Replaying it again is still a duplicate.
        let mut again = ingress(5, 3490, 10, 5_000_000);
        again.replay = true;
        assert_eq!(validate_one(&mut v, &again), Err(RejectReason::Duplicate));

        // The monotonicity cursor did not move backwards.
        assert_eq!(v.last_event_time(), Some(10_000_000));
    }

    #[test]
    fn test_rejects_bad_depth_level() {
        let mut v = SymbolValidator::new();
        let mut rec = ingress(1, 3500, 10, 1_000_000);
        rec.record.bids = vec![(Decimal::from(0), Decimal::from(5))];
        assert_eq!(validate_one(&mut v, &rec), Err(RejectReason::InvalidPrice));
    }

    #[test]
    fn test_dedup_window_eviction() {
        let mut v = SymbolValidator::new();
        let config = ValidatorConfig {
            dedup_window: 2,
            ..ValidatorConfig::default()
        };
        let sym = Symbol::new("rb2405");

        for seq in 1..=3u64 {
            let rec = ingress(seq, 3500, 10, 1_000_000 * seq as i64);
            v.validate(&sym, &rec, &config).unwrap();
        }

        // Sequence 1 fell out of the window; only the timestamp rule
        // stands in its way now.
        let mut replayed = ingress(1, 3500, 10, 500_000);
        replayed.replay = true;
        assert!(v.validate(&sym, &replayed, &config).is_ok());
    }
}
