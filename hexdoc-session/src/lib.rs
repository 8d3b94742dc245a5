//! # hexdoc-session — Session orchestration for collaborative workspaces
//!
//! Brings a workspace document online: derives its identity from a pair of
//! hex secrets, persists it locally, claims a unique replica identity,
//! connects to the relay, and runs presence and selection sharing over an
//! ephemeral channel.
//!
//! ## Architecture
//!
//! ```text
//!                       ┌─────────────────────┐
//!                       │  ConnectionSession  │
//!                       └──────────┬──────────┘
//!        ┌───────────────┬─────────┼──────────────┬────────────────┐
//!        ▼               ▼         ▼              ▼                ▼
//! ┌─────────────┐ ┌────────────┐ ┌───────────┐ ┌─────────────┐ ┌─────────────┐
//! │IdentityCodec│ │ LocalStore │ │ PeerLease │ │ RelayClient │ │  Presence   │
//! │ (P-256)     │ │ (RocksDB)  │ │ Manager   │ │ (WebSocket) │ │  Selection  │
//! └─────────────┘ └────────────┘ └───────────┘ └──────┬──────┘ └──────┬──────┘
//!                                                     │               │
//!                                                     └──► ChannelBroker (shared ephemeral channel)
//! ```
//!
//! ## Modules
//!
//! - [`identity`] — Key pair import, challenge signing, route encoding
//! - [`storage`] — RocksDB store, persistence grant, debounced snapshots
//! - [`ephemeral`] — TTL-expiring key-value channel
//! - [`broker`] — Shared channel registry per session
//! - [`presence`] — Heartbeats and the live peer set
//! - [`selection`] — Per-peer selection records
//! - [`lease`] — Unique replica identity per workspace
//! - [`relay`] — Relay contract and WebSocket client
//! - [`session`] — The orchestrator

pub mod broker;
pub mod document;
pub mod ephemeral;
pub mod identity;
pub mod lease;
pub mod presence;
pub mod relay;
pub mod runtime;
pub mod schedule;
pub mod selection;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use broker::{ChannelBroker, SessionId};
pub use document::{ChangeOrigin, DocChange, DocumentError, DocumentHandle, PeerId, YrsDocument};
pub use ephemeral::{EphemeralChange, EphemeralError, EphemeralStore, MemoryEphemeralStore, SharedChannel};
pub use identity::{
    connection_url, parse_route, share_url, CryptoSupport, HexError, IdentityCodec,
    WorkspaceKeyPair, WorkspaceKeys,
};
pub use lease::{LeaseError, LocalReplicaLocks, PeerLeaseManager, ReacquirePolicy, ReplicaLocks};
pub use presence::{live_peers, PresenceConfig, PresenceScheduler, PresenceSnapshot, PresenceState};
pub use relay::{ConnectionStatus, RelayClient, RelayConnector, RelayError, RelayRoom};
pub use runtime::{Advisory, AdvisoryBoard, SessionRuntime, StaticWelcome, WelcomeSource};
pub use schedule::{Deferral, Lifecycle, Visibility};
pub use selection::{LocalSelection, RemoteSelection, SelectionMode, SelectionSync};
pub use session::{
    ConnectionSession, SessionConfig, SessionHandle, SessionIdentity, SessionPhase, SessionStatus,
};
pub use storage::{LocalStore, Partition, PersistenceGrant, StoreConfig, StoreError, WorkspaceRecord};
