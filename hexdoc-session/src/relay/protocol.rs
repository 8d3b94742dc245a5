//! Binary relay protocol.
//!
//! Every WebSocket binary frame carries one bincode-encoded [`RelayMessage`]:
//! ```text
//! client                               relay
//!   │ ── Join { room, peer } ──────────► │
//!   │ ◄───────── Welcome { version, update }
//!   │ ── Update { update } ────────────► │ ── Update { version, update } ──► peers
//!   │ ── Ephemeral { key, value } ─────► │ ── Ephemeral { key, value } ────► peers
//!   │ ── Ping { nonce } ───────────────► │
//!   │ ◄──────────────────── Pong { nonce }
//!   │ ── Leave { room } ───────────────► │
//! ```
//!
//! Ephemeral values travel as JSON bytes so arbitrary structured payloads
//! survive the non-self-describing bincode encoding.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::document::PeerId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayMessage {
    /// Enter a room under a replica identity.
    Join { room: String, peer: Option<PeerId> },
    /// Relay's answer to `Join`: the full room state and its version.
    Welcome {
        room: String,
        version: u64,
        update: Vec<u8>,
    },
    /// Incremental document update. Client-sent updates carry version 0;
    /// the relay stamps the version it assigned before fanning out.
    Update {
        room: String,
        version: u64,
        update: Vec<u8>,
    },
    /// Ephemeral key write (`Some`) or removal (`None`).
    Ephemeral {
        room: String,
        key: String,
        value: Option<Vec<u8>>,
    },
    Leave { room: String },
    Ping { nonce: u64 },
    Pong { nonce: u64 },
}

impl RelayMessage {
    pub fn ephemeral(room: &str, key: String, value: Option<&Value>) -> Result<Self, ProtocolError> {
        let value = value
            .map(serde_json::to_vec)
            .transpose()
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(RelayMessage::Ephemeral {
            room: room.to_string(),
            key,
            value,
        })
    }

    /// Room the message belongs to, if any.
    pub fn room(&self) -> Option<&str> {
        match self {
            RelayMessage::Join { room, .. }
            | RelayMessage::Welcome { room, .. }
            | RelayMessage::Update { room, .. }
            | RelayMessage::Ephemeral { room, .. }
            | RelayMessage::Leave { room } => Some(room),
            RelayMessage::Ping { .. } | RelayMessage::Pong { .. } => None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }
}

/// Decode the JSON bytes carried by an `Ephemeral` frame.
pub fn decode_ephemeral_value(bytes: &[u8]) -> Result<Value, ProtocolError> {
    serde_json::from_slice(bytes).map_err(|e| ProtocolError::Deserialization(e.to_string()))
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Connection closed")]
    ConnectionClosed,
}
