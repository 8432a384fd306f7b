//! Fixed-point decimal types for prices and volumes
//!
//! Uses `rust_decimal` for deterministic arithmetic (no floating-point
//! errors). `Price` is strictly positive; `Quantity` is non-negative.
//! Both validate at construction so downstream code never re-checks.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors from numeric construction or parsing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NumericError {
    #[error("invalid price: {0}")]
    InvalidPrice(String),

    #[error("invalid quantity: {0}")]
    InvalidQuantity(String),

    #[error("unparseable decimal: {0}")]
    Parse(String),
}

/// A strictly positive execution price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Price(Decimal);

impl Price {
    /// Validate and wrap a decimal price. Must be strictly positive.
    pub fn try_new(value: Decimal) -> Result<Self, NumericError> {
        if value <= Decimal::ZERO {
            return Err(NumericError::InvalidPrice(value.to_string()));
        }
        Ok(Self(value))
    }

    /// Construct from an integer number of quote units.
    ///
    /// # Panics
    /// Panics on zero; literal prices come from code, not feed input.
    pub fn from_u64(value: u64) -> Self {
        assert!(value > 0, "price literal must be positive");
        Self(Decimal::from(value))
    }

    /// Parse from a decimal string.
    pub fn from_str(s: &str) -> Result<Self, NumericError> {
        let dec = Decimal::from_str(s).map_err(|e| NumericError::Parse(e.to_string()))?;
        Self::try_new(dec)
    }

    /// Get the inner decimal value.
    pub fn as_decimal(&self) -> Decimal {
        self.0
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A non-negative traded quantity / volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Quantity(Decimal);

impl Quantity {
    /// Validate and wrap a decimal quantity. Must be non-negative.
    pub fn try_new(value: Decimal) -> Result<Self, NumericError> {
        if value < Decimal::ZERO {
            return Err(NumericError::InvalidQuantity(value.to_string()));
        }
        Ok(Self(value))
    }

    /// The zero quantity.
    pub fn zero() -> Self {
        Self(Decimal::ZERO)
    }

    /// Construct from an integer unit count.
    pub fn from_u64(value: u64) -> Self {
        Self(Decimal::from(value))
    }

    /// Parse from a decimal string.
    pub fn from_str(s: &str) -> Result<Self, NumericError> {
        let dec = Decimal::from_str(s).map_err(|e| NumericError::Parse(e.to_string()))?;
        Self::try_new(dec)
    }

    /// Get the inner decimal value.
    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    /// Whether this quantity is exactly zero.
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
