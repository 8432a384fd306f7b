//! Client streaming protocol
//!
//! JSON over a persistent WebSocket. Client requests and server
//! messages are tagged unions handled exhaustively, with no runtime
//! field sniffing. Unknown or malformed input produces an `error`
//! message on the same connection; it never tears the session down.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::candles::Candle;
use crate::events::{DepthSnapshot, Tick};
use crate::subscriptions::MessageKind;

/// Errors from request decoding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("invalid symbol: {0}")]
    InvalidSymbol(String),
}

/// Client → server requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientRequest {
    Subscribe {
        symbols: Vec<String>,
        kinds: Vec<MessageKind>,
    },
    Unsubscribe {
        symbols: Vec<String>,
        kinds: Vec<MessageKind>,
    },
    Ping,
}

/// Server → client messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Tick(Tick),
    Kline(Candle),
    Depth(DepthSnapshot),
    Pong { timestamp: i64 },
    Error { code: String, message: String },
}

impl ServerMessage {
    /// Build an error message from a reject/parse code.
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }

    /// Serialize for the wire. Serialization of our own types cannot
    /// fail; a broken message is replaced by a generic error payload.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"type":"error","code":"internal","message":"encoding"}"#.into())
    }
}

/// Decode one inbound frame.
pub fn parse_request(text: &str) -> Result<ClientRequest, ProtocolError> {
    serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
}
