//! Feed Pipeline Service
//!
//! Ingests raw market events from upstream feed adapters and produces:
//! - Validated, cleaned tick streams (per-symbol monotonic)
//! - Hot-tier ring caches with symbol-level LRU bounding
//! - OHLCV candle aggregation with flat-candle gap backfill
//! - WebSocket fan-out with per-session bounded queues
//! - Gap detection and bounded backfill from the persistence sink
//!
//! # Architecture
//!
//! ```text
//! Feed adapters
//!        │
//!    ┌───▼────┐
//!    │Gateway │  ← Framing checks, arrival index, lane routing
//!    └───┬────┘
//!        │ per-symbol lanes
//!    ┌───▼─────┐
//!    │Validate │  ← Price/volume/monotonicity/spike rules
//!    └───┬─────┘
//!   ┌────┴─────┐
//!   │          │
//! ┌─▼────┐ ┌──▼─────┐
//! │Cache │ │Candles │
//! └─┬────┘ └──┬─────┘
//!   │         │
//! ┌─▼─────────▼──┐
//! │  Dispatcher  │  ← Bounded queues, drop-oldest, fan-out
//! └──────────────┘
//! ```

pub mod cache;
pub mod candles;
pub mod config;
pub mod dispatch;
pub mod events;
pub mod ingestion;
pub mod metrics;
pub mod pipeline;
pub mod protocol;
pub mod recovery;
pub mod server;
pub mod sink;
pub mod subscriptions;
pub mod validation;

// Library version
pub const SERVICE_VERSION: &str = "0.1.0";
