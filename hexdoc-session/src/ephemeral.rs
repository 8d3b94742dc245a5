//! Short-lived broadcast key-value channel shared with relay peers.
//!
//! Entries expire after a fixed TTL unless rewritten. Keys are namespaced
//! by purpose (`p:<peer>` for presence beats, `sel:<peer>` for selections)
//! and each key is only ever written by the peer named in it.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

/// A channel shared through the broker.
pub type SharedChannel = Arc<dyn EphemeralStore>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EphemeralError {
    #[error("Ephemeral channel destroyed")]
    Destroyed,
    #[error("Transport rejected write: {0}")]
    Transport(String),
}

/// Who caused a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeSource {
    Local,
    Remote,
}

/// A key was written or removed.
#[derive(Debug, Clone, PartialEq)]
pub struct EphemeralChange {
    pub key: String,
    /// `None` when the key was deleted.
    pub value: Option<Value>,
    pub source: ChangeSource,
}

/// Ephemeral key-value channel contract.
#[async_trait]
pub trait EphemeralStore: Send + Sync {
    async fn set(&self, key: &str, value: Value) -> Result<(), EphemeralError>;

    async fn delete(&self, key: &str) -> Result<(), EphemeralError>;

    /// All entries that have not expired.
    fn entries(&self) -> Vec<(String, Value)>;

    fn subscribe(&self) -> broadcast::Receiver<EphemeralChange>;

    /// Drop expired entries. Returns how many were removed.
    fn sweep(&self) -> usize {
        0
    }

    /// Stop the channel. Later writes fail with [`EphemeralError::Destroyed`].
    async fn destroy(&self);
}

struct Entry {
    value: Value,
    written_at: Instant,
}

/// TTL-expiring in-memory channel.
///
/// A transport mirrors local writes by passing an outbound sender and
/// feeds peer writes back through [`MemoryEphemeralStore::apply_remote`].
pub struct MemoryEphemeralStore {
    ttl: Duration,
    entries: Mutex<HashMap<String, Entry>>,
    changes: broadcast::Sender<EphemeralChange>,
    outbound: Option<mpsc::UnboundedSender<EphemeralChange>>,
    destroyed: AtomicBool,
}

impl MemoryEphemeralStore {
    pub fn new(ttl: Duration) -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
            changes,
            outbound: None,
            destroyed: AtomicBool::new(false),
        }
    }

    /// Create a channel whose local writes are also pushed to `outbound`.
    pub fn with_outbound(ttl: Duration, outbound: mpsc::UnboundedSender<EphemeralChange>) -> Self {
        Self {
            outbound: Some(outbound),
            ..Self::new(ttl)
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Ingest a write made by a remote peer.
    pub fn apply_remote(&self, key: String, value: Option<Value>) {
        if self.is_destroyed() {
            return;
        }
        self.write(key, value, ChangeSource::Remote);
    }

    fn write(&self, key: String, value: Option<Value>, source: ChangeSource) {
        if let Ok(mut entries) = self.entries.lock() {
            match &value {
                Some(v) => {
                    entries.insert(
                        key.clone(),
                        Entry {
                            value: v.clone(),
                            written_at: Instant::now(),
                        },
                    );
                }
                None => {
                    entries.remove(&key);
                }
            }
        }
        let change = EphemeralChange { key, value, source };
        if source == ChangeSource::Local {
            if let Some(tx) = &self.outbound {
                let _ = tx.send(change.clone());
            }
        }
        let _ = self.changes.send(change);
    }

    fn check_live(&self) -> Result<(), EphemeralError> {
        if self.is_destroyed() {
            return Err(EphemeralError::Destroyed);
        }
        if let Some(tx) = &self.outbound {
            if tx.is_closed() {
                return Err(EphemeralError::Transport("outbound closed".into()));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EphemeralStore for MemoryEphemeralStore {
    async fn set(&self, key: &str, value: Value) -> Result<(), EphemeralError> {
        self.check_live()?;
        self.write(key.to_string(), Some(value), ChangeSource::Local);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), EphemeralError> {
        self.check_live()?;
        self.write(key.to_string(), None, ChangeSource::Local);
        Ok(())
    }

    fn entries(&self) -> Vec<(String, Value)> {
        let now = Instant::now();
        match self.entries.lock() {
            Ok(entries) => entries
                .iter()
                .filter(|(_, e)| now.duration_since(e.written_at) < self.ttl)
                .map(|(k, e)| (k.clone(), e.value.clone()))
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<EphemeralChange> {
        self.changes.subscribe()
    }

    fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = match self.entries.lock() {
            Ok(e) => e,
            Err(_) => return 0,
        };
        let before = entries.len();
        entries.retain(|_, e| now.duration_since(e.written_at) < self.ttl);
        before - entries.len()
    }

    async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_and_read() {
        let store = MemoryEphemeralStore::new(Duration::from_secs(30));
        store.set("p:1", json!(100)).await.unwrap();
        assert_eq!(store.entries(), vec![("p:1".to_string(), json!(100))]);

        store.delete("p:1").await.unwrap();
        assert!(store.entries().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let store = MemoryEphemeralStore::new(Duration::from_secs(30));
        store.set("p:1", json!(1)).await.unwrap();

        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(store.entries().len(), 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(store.entries().is_empty());
        assert_eq!(store.sweep(), 1);
    }

    #[tokio::test]
    async fn test_changes_are_broadcast() {
        let store = MemoryEphemeralStore::new(Duration::from_secs(30));
        let mut rx = store.subscribe();
        store.set("sel:2", json!({"cid": "a"})).await.unwrap();

        let change = rx.recv().await.unwrap();
        assert_eq!(change.key, "sel:2");
        assert_eq!(change.source, ChangeSource::Local);
    }

    #[tokio::test]
    async fn test_outbound_only_mirrors_local_writes() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let store = MemoryEphemeralStore::with_outbound(Duration::from_secs(30), tx);

        store.set("p:1", json!(1)).await.unwrap();
        store.apply_remote("p:2".into(), Some(json!(2)));

        let sent = rx.recv().await.unwrap();
        assert_eq!(sent.key, "p:1");
        assert!(rx.try_recv().is_err());
        assert_eq!(store.entries().len(), 2);
    }

    #[tokio::test]
    async fn test_destroy_rejects_writes() {
        let store = MemoryEphemeralStore::new(Duration::from_secs(30));
        store.set("p:1", json!(1)).await.unwrap();
        store.destroy().await;
        store.destroy().await;

        assert!(store.entries().is_empty());
        assert_eq!(store.set("p:1", json!(2)).await, Err(EphemeralError::Destroyed));
    }
}
