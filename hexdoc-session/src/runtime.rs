//! Process-level container shared by every connection session.
//!
//! Holds what would otherwise be global: the identity codec, the lazily
//! opened store, the memoised persistence grant and welcome snapshot, the
//! channel broker, the replica lock registry, the relay connector, the page
//! lifecycle signal, and the session generation counter. One instance per
//! process (or per test).

use async_trait::async_trait;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{watch, OnceCell};

use crate::broker::ChannelBroker;
use crate::identity::{CryptoSupport, IdentityCodec};
use crate::lease::{LocalReplicaLocks, ReplicaLocks};
use crate::relay::RelayConnector;
use crate::schedule::{Deferral, Lifecycle};
use crate::storage::{DiskQuota, LazyStore, PersistenceGrantCache, StorageQuota, StoreConfig};

// ───────────────────────────────────────────────────────────────────
// Welcome snapshot
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Error)]
#[error("Welcome snapshot unavailable: {0}")]
pub struct WelcomeError(pub String);

/// Source of the bundled starter document.
#[async_trait]
pub trait WelcomeSource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<u8>, WelcomeError>;
}

/// Starter snapshot compiled into the binary or built in memory.
pub struct StaticWelcome(pub Vec<u8>);

#[async_trait]
impl WelcomeSource for StaticWelcome {
    async fn fetch(&self) -> Result<Vec<u8>, WelcomeError> {
        Ok(self.0.clone())
    }
}

/// Starter snapshot read from disk.
pub struct FileWelcome(pub PathBuf);

#[async_trait]
impl WelcomeSource for FileWelcome {
    async fn fetch(&self) -> Result<Vec<u8>, WelcomeError> {
        tokio::fs::read(&self.0)
            .await
            .map_err(|e| WelcomeError(format!("{}: {e}", self.0.display())))
    }
}

/// Memoised welcome snapshot. Only a successful fetch is cached.
pub struct WelcomeSnapshot {
    source: Arc<dyn WelcomeSource>,
    cell: Mutex<Arc<OnceCell<Arc<Vec<u8>>>>>,
    fetches: AtomicUsize,
}

impl WelcomeSnapshot {
    pub fn new(source: Arc<dyn WelcomeSource>) -> Self {
        Self {
            source,
            cell: Mutex::new(Arc::new(OnceCell::new())),
            fetches: AtomicUsize::new(0),
        }
    }

    /// The snapshot, fetching it if no fetch has succeeded yet. Callers
    /// arriving while a fetch is pending wait for it.
    pub async fn get(&self) -> Option<Arc<Vec<u8>>> {
        let cell = match self.cell.lock() {
            Ok(cell) => cell.clone(),
            Err(_) => return None,
        };
        let fetched = cell
            .get_or_try_init(|| async {
                self.fetches.fetch_add(1, Ordering::SeqCst);
                self.source.fetch().await.map(Arc::new)
            })
            .await;
        match fetched {
            Ok(bytes) => Some(bytes.clone()),
            Err(e) => {
                log::warn!("{e}");
                None
            }
        }
    }

    pub fn reset(&self) {
        if let Ok(mut cell) = self.cell.lock() {
            *cell = Arc::new(OnceCell::new());
        }
    }

    /// Number of fetches started.
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

// ───────────────────────────────────────────────────────────────────
// Advisories
// ───────────────────────────────────────────────────────────────────

/// User-visible degradation notices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Advisory {
    /// The local store could not be opened or written.
    StorageUnavailable,
    /// Storage works but may be evicted.
    StorageNotPersistent,
    /// No cryptographic subsystem: offline for good.
    CryptoUnavailable,
}

impl Advisory {
    /// Storage notices can be dismissed; the crypto notice stays.
    pub fn is_dismissible(self) -> bool {
        !matches!(self, Advisory::CryptoUnavailable)
    }
}

/// Raises each advisory at most once per process.
pub struct AdvisoryBoard {
    raised: Mutex<HashSet<Advisory>>,
    active: watch::Sender<Vec<Advisory>>,
}

impl Default for AdvisoryBoard {
    fn default() -> Self {
        let (active, _) = watch::channel(Vec::new());
        Self {
            raised: Mutex::new(HashSet::new()),
            active,
        }
    }
}

impl AdvisoryBoard {
    /// Show `advisory` unless it was shown before. Returns whether it is new.
    pub fn raise(&self, advisory: Advisory) -> bool {
        let fresh = self
            .raised
            .lock()
            .map(|mut raised| raised.insert(advisory))
            .unwrap_or(false);
        if fresh {
            log::warn!("Advisory raised: {advisory:?}");
            self.active.send_modify(|active| active.push(advisory));
        }
        fresh
    }

    /// Hide a dismissible advisory. It is not raised again.
    pub fn dismiss(&self, advisory: Advisory) -> bool {
        if !advisory.is_dismissible() {
            return false;
        }
        self.active.send_if_modified(|active| {
            let before = active.len();
            active.retain(|a| *a != advisory);
            active.len() != before
        })
    }

    pub fn active(&self) -> Vec<Advisory> {
        self.active.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<Advisory>> {
        self.active.subscribe()
    }
}

// ───────────────────────────────────────────────────────────────────
// Runtime
// ───────────────────────────────────────────────────────────────────

pub struct SessionRuntime {
    codec: IdentityCodec,
    store: Arc<LazyStore>,
    grants: PersistenceGrantCache,
    welcome: Option<WelcomeSnapshot>,
    broker: Arc<ChannelBroker>,
    locks: Arc<dyn ReplicaLocks>,
    connector: Arc<dyn RelayConnector>,
    lifecycle: Lifecycle,
    generation: AtomicU64,
    advisories: AdvisoryBoard,
}

impl SessionRuntime {
    /// Runtime with an available crypto subsystem, local disk quota, an
    /// in-process lock registry and no welcome document.
    pub fn new(connector: Arc<dyn RelayConnector>, store: StoreConfig) -> Self {
        Self {
            codec: IdentityCodec::new(CryptoSupport::Available),
            store: Arc::new(LazyStore::new(store, Deferral::Idle)),
            grants: PersistenceGrantCache::new(Arc::new(DiskQuota)),
            welcome: None,
            broker: Arc::new(ChannelBroker::new()),
            locks: Arc::new(LocalReplicaLocks::new()),
            connector,
            lifecycle: Lifecycle::new(),
            generation: AtomicU64::new(0),
            advisories: AdvisoryBoard::default(),
        }
    }

    pub fn with_crypto(mut self, support: CryptoSupport) -> Self {
        self.codec = IdentityCodec::new(support);
        self
    }

    pub fn with_store(mut self, store: Arc<LazyStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_quota(mut self, quota: Arc<dyn StorageQuota>) -> Self {
        self.grants = PersistenceGrantCache::new(quota);
        self
    }

    pub fn with_welcome(mut self, source: Arc<dyn WelcomeSource>) -> Self {
        self.welcome = Some(WelcomeSnapshot::new(source));
        self
    }

    pub fn with_locks(mut self, locks: Arc<dyn ReplicaLocks>) -> Self {
        self.locks = locks;
        self
    }

    pub fn codec(&self) -> &IdentityCodec {
        &self.codec
    }

    pub fn store(&self) -> &Arc<LazyStore> {
        &self.store
    }

    pub fn grants(&self) -> &PersistenceGrantCache {
        &self.grants
    }

    pub fn welcome(&self) -> Option<&WelcomeSnapshot> {
        self.welcome.as_ref()
    }

    pub fn broker(&self) -> &Arc<ChannelBroker> {
        &self.broker
    }

    pub fn locks(&self) -> &Arc<dyn ReplicaLocks> {
        &self.locks
    }

    pub fn connector(&self) -> &Arc<dyn RelayConnector> {
        &self.connector
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn advisories(&self) -> &AdvisoryBoard {
        &self.advisories
    }

    /// Start a new session generation, invalidating every older one.
    pub fn begin_session(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }
}
