//! Document handle consumed by the session layer.
//!
//! The CRDT engine is opaque here: a document can export/import whole
//! snapshots, ingest remote updates, and announces every change on a
//! broadcast channel. [`YrsDocument`] is the yrs-backed implementation.
//!
//! A leased [`PeerId`] is the engine's client id: once assigned, every
//! local edit is recorded under it.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};
use thiserror::Error;
use tokio::sync::broadcast;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, Options, ReadTxn, StateVector, Text, Transact, Update, WriteTxn};

/// Replica identity a document contributes changes under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub u64);

/// Largest id the engine encodes losslessly for every peer.
const MAX_CLIENT_ID: u64 = (1 << 53) - 1;

impl PeerId {
    pub fn random() -> Self {
        Self(rand::random::<u64>() & MAX_CLIENT_ID)
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for PeerId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(PeerId)
    }
}

/// Where a change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// Made by this replica.
    Local,
    /// Received from the relay.
    Remote,
    /// Restored from a snapshot.
    Import,
}

/// A change notification carrying the encoded update.
#[derive(Debug, Clone)]
pub struct DocChange {
    pub origin: ChangeOrigin,
    pub update: Arc<Vec<u8>>,
}

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("Malformed update: {0}")]
    Decode(String),
    #[error("Engine rejected update: {0}")]
    Apply(String),
}

/// Opaque document contract.
pub trait DocumentHandle: Send + Sync {
    /// Full self-contained state.
    fn export_snapshot(&self) -> Vec<u8>;

    /// Merge a snapshot into the current state.
    fn import_snapshot(&self, snapshot: &[u8]) -> Result<(), DocumentError>;

    /// Merge an update received from the relay.
    fn apply_remote(&self, update: &[u8]) -> Result<(), DocumentError>;

    /// Subscribe to change notifications.
    fn subscribe(&self) -> broadcast::Receiver<DocChange>;

    /// Replica identity currently in use, if a lease assigned one.
    fn peer_id(&self) -> Option<PeerId>;

    fn set_peer_id(&self, peer: PeerId);

    /// True when no change has ever been applied.
    fn is_empty(&self) -> bool;
}

/// yrs-backed document.
pub struct YrsDocument {
    doc: RwLock<Doc>,
    changes: broadcast::Sender<DocChange>,
    peer: Mutex<Option<PeerId>>,
}

impl Default for YrsDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl YrsDocument {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(1024);
        Self {
            doc: RwLock::new(Doc::new()),
            changes,
            peer: Mutex::new(None),
        }
    }

    fn engine(&self) -> RwLockReadGuard<'_, Doc> {
        self.doc.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Client id local edits are recorded under.
    pub fn client_id(&self) -> u64 {
        self.engine().client_id()
    }

    /// Insert text into a named root text and announce the delta.
    pub fn insert_text(&self, name: &str, index: u32, content: &str) {
        let delta = {
            let doc = self.engine();
            let before = doc.transact().state_vector();
            {
                let mut txn = doc.transact_mut();
                let text = txn.get_or_insert_text(name);
                text.insert(&mut txn, index, content);
            }
            let delta = doc.transact().encode_state_as_update_v1(&before);
            delta
        };
        self.emit(ChangeOrigin::Local, delta);
    }

    /// Append text to the end of a named root text.
    pub fn append_text(&self, name: &str, content: &str) {
        let len = {
            let doc = self.engine();
            let mut txn = doc.transact_mut();
            let text = txn.get_or_insert_text(name);
            text.len(&txn)
        };
        self.insert_text(name, len, content);
    }

    /// Current contents of a named root text.
    pub fn text(&self, name: &str) -> String {
        let doc = self.engine();
        let mut txn = doc.transact_mut();
        let text = txn.get_or_insert_text(name);
        text.get_string(&txn)
    }

    /// Encoded state vector, for diff-based sync.
    pub fn state_vector(&self) -> Vec<u8> {
        self.engine().transact().state_vector().encode_v1()
    }

    fn apply(&self, bytes: &[u8], origin: ChangeOrigin) -> Result<(), DocumentError> {
        let update = Update::decode_v1(bytes).map_err(|e| DocumentError::Decode(e.to_string()))?;
        {
            let doc = self.engine();
            let mut txn = doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| DocumentError::Apply(e.to_string()))?;
        }
        self.emit(origin, bytes.to_vec());
        Ok(())
    }

    /// Move the engine onto `client_id`, carrying the full state over.
    fn rebind(&self, client_id: u64) -> Result<(), DocumentError> {
        let mut doc = self.doc.write().unwrap_or_else(|e| e.into_inner());
        if doc.client_id() == client_id {
            return Ok(());
        }
        let state = doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default());
        let update = Update::decode_v1(&state).map_err(|e| DocumentError::Decode(e.to_string()))?;
        let rebound = Doc::with_options(Options::with_client_id(client_id));
        {
            let mut txn = rebound.transact_mut();
            txn.apply_update(update)
                .map_err(|e| DocumentError::Apply(e.to_string()))?;
        }
        *doc = rebound;
        Ok(())
    }

    fn emit(&self, origin: ChangeOrigin, update: Vec<u8>) {
        // No receivers is fine.
        let _ = self.changes.send(DocChange {
            origin,
            update: Arc::new(update),
        });
    }
}

impl DocumentHandle for YrsDocument {
    fn export_snapshot(&self) -> Vec<u8> {
        self.engine()
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    fn import_snapshot(&self, snapshot: &[u8]) -> Result<(), DocumentError> {
        self.apply(snapshot, ChangeOrigin::Import)
    }

    fn apply_remote(&self, update: &[u8]) -> Result<(), DocumentError> {
        self.apply(update, ChangeOrigin::Remote)
    }

    fn subscribe(&self) -> broadcast::Receiver<DocChange> {
        self.changes.subscribe()
    }

    fn peer_id(&self) -> Option<PeerId> {
        self.peer.lock().ok().and_then(|p| *p)
    }

    fn set_peer_id(&self, peer: PeerId) {
        if let Err(e) = self.rebind(peer.0) {
            log::error!("Document not moved to peer {peer}: {e}");
            return;
        }
        if let Ok(mut current) = self.peer.lock() {
            *current = Some(peer);
        }
    }

    fn is_empty(&self) -> bool {
        self.engine().transact().state_vector().is_empty()
    }
}
