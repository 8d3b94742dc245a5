//! Relay connection contract.
//!
//! A [`RelayClient`] is created per session by a [`RelayConnector`]. It owns
//! one authenticated connection, reports its health on watch channels, and
//! hands out rooms (document sync) and ephemeral channels (presence and
//! selection) multiplexed over that connection.
//!
//! Once connected, a client re-establishes a lost connection by itself:
//! status goes `Disconnected` → `Connecting` → `Connected`, attached rooms
//! are re-joined and their convergence starts over, and local changes made
//! in between are sent after the re-join.

pub mod protocol;
pub mod ws;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

use crate::document::DocumentHandle;
use crate::ephemeral::SharedChannel;

pub use protocol::{ProtocolError, RelayMessage};
pub use ws::{OfflineQueue, WsConnector, WsRelayClient, WsRelayConfig};

/// Connection health as reported by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Connect failed: {0}")]
    Connect(String),
    #[error("Not connected")]
    NotConnected,
    #[error("Join of room {room} failed: {reason}")]
    Join { room: String, reason: String },
    #[error("Client destroyed")]
    Destroyed,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// One joined room.
#[async_trait]
pub trait RelayRoom: Send + Sync {
    /// Resolve once the local replica has observed the version the relay
    /// reported at the latest (re-)join.
    async fn wait_for_convergence(&self) -> Result<(), RelayError>;

    /// Round-trip ping.
    async fn ping(&self) -> Result<Duration, RelayError>;

    async fn leave(&self) -> Result<(), RelayError>;

    /// Stop forwarding document changes in either direction.
    fn detach(&self);
}

/// Connection client contract.
#[async_trait]
pub trait RelayClient: Send + Sync {
    async fn connect(&self, url: &str) -> Result<(), RelayError>;

    fn status(&self) -> watch::Receiver<ConnectionStatus>;

    /// Latest round-trip sample; `None` unless connected.
    fn latency(&self) -> watch::Receiver<Option<Duration>>;

    async fn join(
        &self,
        room: &str,
        doc: Arc<dyn DocumentHandle>,
    ) -> Result<Arc<dyn RelayRoom>, RelayError>;

    /// Open a TTL-expiring broadcast channel scoped to `room`.
    async fn open_ephemeral(&self, room: &str, ttl: Duration) -> Result<SharedChannel, RelayError>;

    async fn destroy(&self);
}

/// Builds one client per connection session.
pub trait RelayConnector: Send + Sync {
    fn create(&self) -> Arc<dyn RelayClient>;
}

/// Wait until `rx` reports `Connected`. Returns `false` if the client is
/// gone or the wait exceeds `timeout`.
pub async fn wait_connected(rx: &mut watch::Receiver<ConnectionStatus>, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, rx.wait_for(|s| *s == ConnectionStatus::Connected)).await,
        Ok(Ok(_))
    )
}
