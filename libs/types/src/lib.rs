//! Types library for the market data pipeline
//!
//! Provides the core type vocabulary shared by the feed pipeline service:
//! instrument symbols and fixed-point numerics. All monetary arithmetic
//! uses `rust_decimal` so results are deterministic across platforms.
//!
//! # Modules
//! - `ids`: Instrument identifiers (Symbol)
//! - `numeric`: Fixed-point decimal types (Price, Quantity)

// Public modules
pub mod ids;
pub mod numeric;

// Library version constant
pub const LIB_VERSION: &str = "1.0.0";

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::ids::*;
    pub use crate::numeric::*;
}
