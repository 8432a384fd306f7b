//! Configuration for the feed pipeline
//!
//! Per-component config structs with defaults matching the service's
//! documented targets. The umbrella [`PipelineConfig`] is what the
//! binary builds and hands to [`crate::pipeline::Pipeline::start`].

use rust_decimal::Decimal;

/// Configuration for the ingestion gateway.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Number of symbol-lane workers. Symbols hash onto lanes.
    pub lanes: usize,
    /// Capacity of each lane's input queue.
    pub lane_capacity: usize,
    /// Feed source liveness timeout in nanoseconds.
    pub liveness_timeout_nanos: i64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            lanes: 8,
            lane_capacity: 16_384,
            liveness_timeout_nanos: 5 * 1_000_000_000,
        }
    }
}

/// Configuration for the validation/cleaning engine.
#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    /// Maximum relative price deviation before the spike filter fires.
    pub max_deviation: Decimal,
    /// Volume at or above which a large move is accepted as a
    /// legitimate gap rather than a spike.
    pub min_spike_volume: Decimal,
    /// Number of recent sequence numbers tracked per symbol for dedup.
    pub dedup_window: usize,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_deviation: Decimal::new(10, 2), // 0.10 = 10%
            min_spike_volume: Decimal::from(50),
            dedup_window: 10_000,
        }
    }
}

/// Configuration for the cache layer.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Ticks retained per symbol in the hot-tier ring buffer.
    pub ring_capacity: usize,
    /// Maximum resident symbols before LRU eviction.
    pub max_symbols: usize,
    /// TTL for shared-tier entries in nanoseconds.
    pub shared_ttl_nanos: i64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 500,
            max_symbols: 1024,
            shared_ttl_nanos: 60 * 1_000_000_000,
        }
    }
}

/// Configuration for the candle aggregation engine.
#[derive(Debug, Clone)]
pub struct CandleConfig {
    /// Intervals built for every symbol.
    pub intervals: Vec<crate::candles::Interval>,
    /// Closed candles retained per (symbol, interval).
    pub max_history: usize,
}

impl Default for CandleConfig {
    fn default() -> Self {
        Self {
            intervals: vec![crate::candles::Interval::M1],
            max_history: 1_000,
        }
    }
}

/// Configuration for the fan-out dispatcher.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Outbound queue capacity per session.
    pub queue_capacity: usize,
    /// Sliding window for drop-rate accounting, nanoseconds.
    pub drop_window_nanos: i64,
    /// Drops within one window that force a disconnect.
    pub drop_rate_threshold: u64,
    /// Session heartbeat timeout in nanoseconds.
    pub heartbeat_timeout_nanos: i64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1_000,
            drop_window_nanos: 5 * 1_000_000_000,
            drop_rate_threshold: 250,
            heartbeat_timeout_nanos: 90 * 1_000_000_000,
        }
    }
}

/// Configuration for recovery/backfill.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Maximum wall-clock span requested from the sink, nanoseconds.
    pub backfill_window_nanos: i64,
    /// Maximum events requested per backfill.
    pub backfill_max_events: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            backfill_window_nanos: 5 * 60 * 1_000_000_000,
            backfill_max_events: 5_000,
        }
    }
}

/// Configuration for the async sink writer.
#[derive(Debug, Clone)]
pub struct SinkConfig {
    /// Write-behind queue capacity.
    pub queue_capacity: usize,
    /// Attempts per write before the record is abandoned.
    pub retry_budget: u32,
    /// Delay between retries in milliseconds.
    pub retry_delay_ms: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 8_192,
            retry_budget: 3,
            retry_delay_ms: 50,
        }
    }
}

/// Umbrella configuration for the whole pipeline.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub gateway: GatewayConfig,
    pub validator: ValidatorConfig,
    pub cache: CacheConfig,
    pub candles: CandleConfig,
    pub dispatch: DispatchConfig,
    pub recovery: RecoveryConfig,
    pub sink: SinkConfig,
}
