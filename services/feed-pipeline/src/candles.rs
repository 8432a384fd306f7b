//! OHLCV candle aggregation
//!
//! Folds accepted ticks into fixed-width time buckets, one open bucket
//! per (symbol, interval) at a time. Bucket boundaries are aligned to
//! epoch. Fully-skipped buckets are backfilled as flat candles carrying
//! the previous close, so charts have no gaps. Replayed tick sets are
//! reconciled by recomputing the affected buckets rather than folding
//! twice.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use types::ids::Symbol;

use crate::events::Tick;

/// Supported candle intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Interval {
    /// 1 minute
    M1,
    /// 5 minutes
    M5,
    /// 15 minutes
    M15,
    /// 30 minutes
    M30,
    /// 1 hour
    H1,
    /// 4 hours
    H4,
    /// 1 day
    D1,
}

impl Interval {
    /// Duration of this interval in nanoseconds.
    pub fn duration_nanos(&self) -> i64 {
        match self {
            Interval::M1 => 60 * 1_000_000_000,
            Interval::M5 => 5 * 60 * 1_000_000_000,
            Interval::M15 => 15 * 60 * 1_000_000_000,
            Interval::M30 => 30 * 60 * 1_000_000_000,
            Interval::H1 => 3600 * 1_000_000_000,
            Interval::H4 => 4 * 3600 * 1_000_000_000,
            Interval::D1 => 86400 * 1_000_000_000_i64,
        }
    }

    /// Wire label, e.g. "1m".
    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::M1 => "1m",
            Interval::M5 => "5m",
            Interval::M15 => "15m",
            Interval::M30 => "30m",
            Interval::H1 => "1h",
            Interval::H4 => "4h",
            Interval::D1 => "1d",
        }
    }

    /// All supported intervals.
    pub fn all() -> &'static [Interval] {
        &[
            Interval::M1,
            Interval::M5,
            Interval::M15,
            Interval::M30,
            Interval::H1,
            Interval::H4,
            Interval::D1,
        ]
    }

    /// Align a timestamp to this interval's boundary (floor).
    pub fn align_to_boundary(&self, timestamp_nanos: i64) -> i64 {
        let duration = self.duration_nanos();
        (timestamp_nanos / duration) * duration
    }
}

/// A single OHLCV candle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: Symbol,
    pub interval: Interval,
    pub open_time: i64,
    pub close_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub trade_count: u64,
}

impl Candle {
    /// Create a new candle from the first tick in this bucket.
    fn new(
        price: Decimal,
        volume: Decimal,
        open_time: i64,
        interval: Interval,
        symbol: Symbol,
    ) -> Self {
        let close_time = open_time + interval.duration_nanos() - 1;
        Self {
            symbol,
            interval,
            open_time,
            close_time,
            open: price,
            high: price,
            low: price,
            close: price,
            volume,
            trade_count: 1,
        }
    }

    /// Fold another tick into the candle.
    fn update(&mut self, price: Decimal, volume: Decimal) {
        if price > self.high {
            self.high = price;
        }
        if price < self.low {
            self.low = price;
        }
        self.close = price;
        self.volume += volume;
        self.trade_count += 1;
    }

    /// Create a flat (no-trade) continuation candle for backfill.
    fn flat(prev_close: Decimal, open_time: i64, interval: Interval, symbol: Symbol) -> Self {
        let close_time = open_time + interval.duration_nanos() - 1;
        Self {
            symbol,
            interval,
            open_time,
            close_time,
            open: prev_close,
            high: prev_close,
            low: prev_close,
            close: prev_close,
            volume: Decimal::ZERO,
            trade_count: 0,
        }
    }

    /// Validate candle integrity (OHLCV invariants).
    pub fn is_valid(&self) -> bool {
        self.high >= self.open
            && self.high >= self.close
            && self.high >= self.low
            && self.low <= self.open
            && self.low <= self.close
            && self.volume >= Decimal::ZERO
            && self.close_time > self.open_time
    }
}

/// Builds candles for a single interval on a single symbol.
pub struct CandleBuilder {
    interval: Interval,
    symbol: Symbol,
    /// Currently open bucket.
    current: Option<Candle>,
    /// Closed candles stored by open_time (BTreeMap for deterministic order).
    closed: BTreeMap<i64, Candle>,
    /// Max closed candles to retain.
    max_history: usize,
    /// Ticks that arrived for an already-closed bucket outside replay.
    late_data: u64,
}

impl CandleBuilder {
    pub fn new(interval: Interval, symbol: Symbol, max_history: usize) -> Self {
        Self {
            interval,
            symbol,
            current: None,
            closed: BTreeMap::new(),
            max_history,
            late_data: 0,
        }
    }

    /// Fold one accepted tick.
    ///
    /// Returns the candles emitted by this tick: the closed bucket (if
    /// the tick crossed a boundary) followed by any flat backfill
    /// candles for fully-skipped buckets, in chronological order. A tick
    /// for an already-closed bucket is dropped and counted.
    pub fn process_tick(&mut self, price: Decimal, volume: Decimal, event_time: i64) -> Vec<Candle> {
        let boundary = self.interval.align_to_boundary(event_time);
        let duration = self.interval.duration_nanos();

        let current_open = match self.current.as_ref().map(|c| c.open_time) {
            None => {
                self.current = Some(Candle::new(
                    price,
                    volume,
                    boundary,
                    self.interval,
                    self.symbol.clone(),
                ));
                return Vec::new();
            }
            Some(open_time) => open_time,
        };

        if boundary == current_open {
            if let Some(candle) = self.current.as_mut() {
                candle.update(price, volume);
            }
            return Vec::new();
        }

        if boundary < current_open {
            self.late_data += 1;
            return Vec::new();
        }

        // Strictly later window: close, backfill skipped buckets flat,
        // then open the new bucket with this tick.
        let mut emitted = Vec::new();
        let prev_close = match self.close_current() {
            Some(candle) => {
                let close = candle.close;
                emitted.push(candle);
                close
            }
            None => price,
        };

        let mut t = current_open + duration;
        while t < boundary {
            let flat = Candle::flat(prev_close, t, self.interval, self.symbol.clone());
            self.closed.insert(t, flat.clone());
            emitted.push(flat);
            t += duration;
        }
        self.trim_history();

        self.current = Some(Candle::new(
            price,
            volume,
            boundary,
            self.interval,
            self.symbol.clone(),
        ));

        emitted
    }

    /// Force-close the current bucket (shutdown or explicit flush).
    pub fn close_current(&mut self) -> Option<Candle> {
        if let Some(candle) = self.current.take() {
            self.closed.insert(candle.open_time, candle.clone());
            self.trim_history();
            Some(candle)
        } else {
            None
        }
    }

    /// Close the open bucket if the wall clock has passed its boundary.
    pub fn flush_elapsed(&mut self, now: i64) -> Option<Candle> {
        let elapsed = self
            .current
            .as_ref()
            .map_or(false, |candle| now > candle.close_time);
        if elapsed {
            self.close_current()
        } else {
            None
        }
    }

    /// Get closed candles, newest first.
    pub fn get_candles(&self, limit: usize) -> Vec<Candle> {
        self.closed.values().rev().take(limit).cloned().collect()
    }

    /// The currently open bucket.
    pub fn current_candle(&self) -> Option<&Candle> {
        self.current.as_ref()
    }

    /// Ticks dropped for already-closed buckets.
    pub fn late_data(&self) -> u64 {
        self.late_data
    }

    /// Rebuild every bucket from `start_boundary` onwards from the given
    /// tick set, replacing whatever was folded before.
    ///
    /// Input ticks must be sorted by event time and deduplicated; the
    /// caller derives the set from the cached window plus the replay
    /// batch. Returns the recomputed candles (closed buckets in range).
    fn rebuild_from(&mut self, start_boundary: i64, ticks: &[Tick]) -> Vec<Candle> {
        self.closed.retain(|open_time, _| *open_time < start_boundary);
        if self
            .current
            .as_ref()
            .map_or(false, |c| c.open_time >= start_boundary)
        {
            self.current = None;
        }

        let mut emitted = Vec::new();
        for tick in ticks {
            if tick.event_time < start_boundary {
                continue;
            }
            emitted.extend(self.process_tick(
                tick.price.as_decimal(),
                tick.volume.as_decimal(),
                tick.event_time,
            ));
        }
        emitted
    }

    fn trim_history(&mut self) {
        while self.closed.len() > self.max_history {
            self.closed.pop_first();
        }
    }
}

/// Manages candle builders across all configured intervals for a symbol.
pub struct SymbolCandles {
    builders: BTreeMap<Interval, CandleBuilder>,
    symbol: Symbol,
}

impl SymbolCandles {
    pub fn new(symbol: Symbol, intervals: &[Interval], max_history: usize) -> Self {
        let mut builders = BTreeMap::new();
        for &interval in intervals {
            builders.insert(
                interval,
                CandleBuilder::new(interval, symbol.clone(), max_history),
            );
        }
        Self { builders, symbol }
    }

    /// Fold an accepted tick across all intervals; returns every candle
    /// emitted (closed buckets and flat backfills).
    pub fn process_tick(&mut self, tick: &Tick) -> Vec<Candle> {
        let mut emitted = Vec::new();
        for builder in self.builders.values_mut() {
            emitted.extend(builder.process_tick(
                tick.price.as_decimal(),
                tick.volume.as_decimal(),
                tick.event_time,
            ));
        }
        emitted
    }

    /// Close any open buckets whose window has elapsed.
    pub fn flush_elapsed(&mut self, now: i64) -> Vec<Candle> {
        self.builders
            .values_mut()
            .filter_map(|b| b.flush_elapsed(now))
            .collect()
    }

    /// Reconcile after a replay: recompute every bucket the replayed
    /// ticks touch from the combined tick set, idempotently.
    ///
    /// `ticks` is the union of the cached window and the replay batch;
    /// it is deduplicated by sequence and sorted here. Returns corrected
    /// candles for re-emission.
    pub fn reconcile(&mut self, ticks: &[Tick]) -> Vec<Candle> {
        let mut merged: Vec<Tick> = ticks.to_vec();
        merged.sort_by_key(|t| (t.event_time, t.sequence));
        merged.dedup_by_key(|t| t.sequence);

        let Some(earliest) = merged.iter().map(|t| t.event_time).min() else {
            return Vec::new();
        };

        let mut corrected = Vec::new();
        for builder in self.builders.values_mut() {
            let start = builder.interval.align_to_boundary(earliest);
            corrected.extend(builder.rebuild_from(start, &merged));
        }
        corrected
    }

    /// Closed candles for one interval, newest first.
    pub fn get_candles(&self, interval: Interval, limit: usize) -> Vec<Candle> {
        self.builders
            .get(&interval)
            .map(|b| b.get_candles(limit))
            .unwrap_or_default()
    }

    /// Total late-data drops across intervals.
    pub fn late_data(&self) -> u64 {
        self.builders.values().map(|b| b.late_data()).sum()
    }

    /// SHA-256 checksum over all closed and open buckets.
    ///
    /// Two instances that processed equivalent tick sets produce the
    /// same checksum, which is how replay idempotence is verified.
    pub fn state_checksum(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.symbol.as_str().as_bytes());
        for (interval, builder) in &self.builders {
            hasher.update(interval.as_str().as_bytes());
            hasher.update(b"|");
            for candle in builder.closed.values() {
                hash_candle(&mut hasher, candle);
            }
            hasher.update(b"~");
            if let Some(current) = &builder.current {
                hash_candle(&mut hasher, current);
            }
            hasher.update(b"===");
        }
        format!("{:x}", hasher.finalize())
    }

    /// Symbol managed by this instance.
    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }
}

fn hash_candle(hasher: &mut Sha256, candle: &Candle) {
    hasher.update(candle.open_time.to_le_bytes());
    hasher.update(candle.open.to_string().as_bytes());
    hasher.update(b":");
    hasher.update(candle.high.to_string().as_bytes());
    hasher.update(b":");
    hasher.update(candle.low.to_string().as_bytes());
    hasher.update(b":");
    hasher.update(candle.close.to_string().as_bytes());
    hasher.update(b":");
    hasher.update(candle.volume.to_string().as_bytes());
    hasher.update(b":");
    hasher.update(candle.trade_count.to_le_bytes());
    hasher.update(b",");
}
