//! Instrument identifier types
//!
//! Symbols arrive from upstream feeds as short contract codes (futures
//! style, e.g. "rb2405", "cu2405") or pair codes. The pipeline never
//! interprets the code beyond equality and hashing; validation only
//! guards against empty or garbage framing.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum accepted symbol length. Anything longer is feed garbage.
const MAX_SYMBOL_LEN: usize = 32;

/// Instrument symbol as delivered by the exchange feed.
///
/// Symbols are case-sensitive and compared byte-wise. The pipeline keys
/// all per-instrument state (lanes, caches, candles, subscriptions) on
/// this type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(String);

impl Symbol {
    /// Create a new Symbol from a string
    ///
    /// # Panics
    /// Panics if the code is empty, too long, or contains non-printable
    /// characters. Use [`Symbol::try_new`] for untrusted input.
    pub fn new(code: impl Into<String>) -> Self {
        Self::try_new(code).expect("invalid symbol code")
    }

    /// Try to create a Symbol, returning None if invalid
    pub fn try_new(code: impl Into<String>) -> Option<Self> {
        let s = code.into();
        if s.is_empty() || s.len() > MAX_SYMBOL_LEN {
            return None;
        }
        if !s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/'))
        {
            return None;
        }
        Some(Self(s))
    }

    /// Get the symbol string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_creation() {
        let sym = Symbol::new("rb2405");
        assert_eq!(sym.as_str(), "rb2405");
    }

    #[test]
    fn test_symbol_try_new() {
        assert!(Symbol::try_new("cu2405").is_some());
        assert!(Symbol::try_new("BTC/USDT").is_some());
        assert!(Symbol::try_new("").is_none());
        assert!(Symbol::try_new("has space").is_none());
        assert!(Symbol::try_new("x".repeat(33)).is_none());
    }

    #[test]
    #[should_panic(expected = "invalid symbol code")]
    fn test_symbol_invalid_panics() {
        Symbol::new("");
    }

    #[test]
    fn test_symbol_serialization() {
        let sym = Symbol::new("rb2405");
        let json = serde_json::to_string(&sym).unwrap();
        assert_eq!(json, "\"rb2405\"");

        let deserialized: Symbol = serde_json::from_str(&json).unwrap();
        assert_eq!(sym, deserialized);
    }

    #[test]
    fn test_symbol_ordering() {
        let mut symbols = vec![Symbol::new("cu2405"), Symbol::new("ag2406"), Symbol::new("rb2405")];
        symbols.sort();
        assert_eq!(symbols[0].as_str(), "ag2406");
        assert_eq!(symbols[2].as_str(), "rb2405");
    }
}
