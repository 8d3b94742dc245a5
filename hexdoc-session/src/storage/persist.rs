//! Storage permission, lazy store opening, and debounced snapshot saves.
//!
//! ```text
//! DocChange ─► restart quiet timer ─► (timer fires) ─► export_snapshot
//!                                                        │
//!                              previous write done? ◄────┘
//!                                      │
//!                                      ▼
//!                       spawn_blocking(LocalStore::put_snapshot)
//! ```
//!
//! Every failure here is logged and treated as transient: the in-memory
//! document stays authoritative and the next change retries. Write
//! failures are also handed to the caller's [`FailureHook`].

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, OnceCell};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::rocks::{LocalStore, StoreConfig, StoreError};
use crate::document::{ChangeOrigin, DocumentHandle};
use crate::schedule::Deferral;

// ───────────────────────────────────────────────────────────────────
// Persistence permission
// ───────────────────────────────────────────────────────────────────

/// Platform permission for non-evictable storage.
#[async_trait]
pub trait StorageQuota: Send + Sync {
    fn is_supported(&self) -> bool;

    /// Whether storage is already persistent.
    async fn persisted(&self) -> bool;

    /// Ask for persistent storage.
    async fn request(&self) -> bool;
}

/// Local disk: always supported, always persistent.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiskQuota;

#[async_trait]
impl StorageQuota for DiskQuota {
    fn is_supported(&self) -> bool {
        true
    }

    async fn persisted(&self) -> bool {
        true
    }

    async fn request(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistenceGrant {
    pub granted: bool,
    pub supported: bool,
}

/// Process-wide memo of the persistence request.
pub struct PersistenceGrantCache {
    quota: Arc<dyn StorageQuota>,
    cell: Mutex<Arc<OnceCell<PersistenceGrant>>>,
}

impl PersistenceGrantCache {
    pub fn new(quota: Arc<dyn StorageQuota>) -> Self {
        Self {
            quota,
            cell: Mutex::new(Arc::new(OnceCell::new())),
        }
    }

    /// Request persistence once; concurrent callers share the pending
    /// request and later callers get the cached answer.
    pub async fn ensure(&self) -> PersistenceGrant {
        let cell = match self.cell.lock() {
            Ok(cell) => cell.clone(),
            Err(_) => Arc::new(OnceCell::new()),
        };
        *cell
            .get_or_init(|| async {
                if !self.quota.is_supported() {
                    return PersistenceGrant {
                        granted: false,
                        supported: false,
                    };
                }
                let granted = self.quota.persisted().await || self.quota.request().await;
                log::debug!("Persistent storage granted: {granted}");
                PersistenceGrant {
                    granted,
                    supported: true,
                }
            })
            .await
    }

    /// Forget the cached answer.
    pub fn reset(&self) {
        if let Ok(mut cell) = self.cell.lock() {
            *cell = Arc::new(OnceCell::new());
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Lazy store
// ───────────────────────────────────────────────────────────────────

/// Opens the [`LocalStore`] on first use, off the critical path.
pub struct LazyStore {
    config: StoreConfig,
    deferral: Deferral,
    cell: OnceCell<Arc<LocalStore>>,
    attempts: AtomicUsize,
}

impl LazyStore {
    pub fn new(config: StoreConfig, deferral: Deferral) -> Self {
        Self {
            config,
            deferral,
            cell: OnceCell::new(),
            attempts: AtomicUsize::new(0),
        }
    }

    /// The store, opening it if needed. `None` when it cannot be opened;
    /// the next call tries again.
    pub async fn get(&self) -> Option<Arc<LocalStore>> {
        if let Some(store) = self.cell.get() {
            return Some(store.clone());
        }
        let opened = self
            .cell
            .get_or_try_init(|| async {
                self.deferral.wait().await;
                self.attempts.fetch_add(1, Ordering::SeqCst);
                let config = self.config.clone();
                tokio::task::spawn_blocking(move || LocalStore::open(config))
                    .await
                    .map_err(|e| StoreError::Io(e.to_string()))?
                    .map(Arc::new)
            })
            .await;
        match opened {
            Ok(store) => Some(store.clone()),
            Err(e) => {
                log::warn!("Local store unavailable: {e}");
                None
            }
        }
    }

    /// The store if it is already open.
    pub fn opened(&self) -> Option<Arc<LocalStore>> {
        self.cell.get().cloned()
    }

    /// How many opens were attempted.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

/// Destination of debounced snapshot writes.
#[async_trait]
pub trait SnapshotSink: Send + Sync {
    async fn write(&self, id: &str, snapshot: Vec<u8>) -> Result<(), StoreError>;
}

#[async_trait]
impl SnapshotSink for LazyStore {
    async fn write(&self, id: &str, snapshot: Vec<u8>) -> Result<(), StoreError> {
        let store = self
            .get()
            .await
            .ok_or_else(|| StoreError::Io("local store could not be opened".into()))?;
        let id = id.to_string();
        tokio::task::spawn_blocking(move || store.put_snapshot(&id, &snapshot))
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?
    }
}

/// Called with every failed snapshot write.
pub type FailureHook = Arc<dyn Fn(&StoreError) + Send + Sync>;

// ───────────────────────────────────────────────────────────────────
// Debounced persistence
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Quiet interval after the last change before saving.
    pub debounce: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
        }
    }
}

impl PersistenceConfig {
    pub fn for_testing() -> Self {
        Self {
            debounce: Duration::from_millis(50),
        }
    }
}

enum Command {
    Flush(oneshot::Sender<()>),
    Stop(oneshot::Sender<()>),
}

/// Controls the debounced save task of one document.
pub struct PersistenceHandle {
    commands: mpsc::UnboundedSender<Command>,
    task: Mutex<Option<JoinHandle<()>>>,
    saves: Arc<AtomicUsize>,
    failures: Arc<AtomicUsize>,
}

impl PersistenceHandle {
    /// Save pending changes now and wait for the write.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Flush and end the task. Idempotent.
    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Stop(tx)).is_ok() {
            let _ = rx.await;
        }
        let task = self.task.lock().ok().and_then(|mut t| t.take());
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Completed snapshot writes.
    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Failed snapshot writes.
    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }
}

/// Persist `doc` under `workspace_id` after every quiet interval.
pub fn setup_persistence(
    doc: Arc<dyn DocumentHandle>,
    workspace_id: String,
    store: Arc<dyn SnapshotSink>,
    config: PersistenceConfig,
    on_failure: Option<FailureHook>,
) -> PersistenceHandle {
    let (commands, rx) = mpsc::unbounded_channel();
    let saves = Arc::new(AtomicUsize::new(0));
    let failures = Arc::new(AtomicUsize::new(0));
    let writer = SnapshotWriter {
        doc,
        workspace_id,
        store,
        saves: saves.clone(),
        failures: failures.clone(),
        on_failure,
        in_flight: None,
    };
    let task = tokio::spawn(writer.run(rx, config.debounce));
    PersistenceHandle {
        commands,
        task: Mutex::new(Some(task)),
        saves,
        failures,
    }
}

struct SnapshotWriter {
    doc: Arc<dyn DocumentHandle>,
    workspace_id: String,
    store: Arc<dyn SnapshotSink>,
    saves: Arc<AtomicUsize>,
    failures: Arc<AtomicUsize>,
    on_failure: Option<FailureHook>,
    in_flight: Option<JoinHandle<()>>,
}

impl SnapshotWriter {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>, debounce: Duration) {
        let mut changes = self.doc.subscribe();
        let mut deadline: Option<Instant> = None;

        loop {
            let wake = deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
            // Changes first, so a flush sees everything sent before it.
            tokio::select! {
                biased;
                change = changes.recv() => match change {
                    Ok(change) if change.origin == ChangeOrigin::Import => {}
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        deadline = Some(Instant::now() + debounce);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        if deadline.take().is_some() {
                            self.save();
                        }
                        self.settle().await;
                        break;
                    }
                },
                _ = tokio::time::sleep_until(wake), if deadline.is_some() => {
                    deadline = None;
                    self.save();
                }
                command = commands.recv() => {
                    if deadline.take().is_some() {
                        self.save();
                    }
                    self.settle().await;
                    match command {
                        Some(Command::Flush(ack)) => {
                            let _ = ack.send(());
                        }
                        Some(Command::Stop(ack)) => {
                            let _ = ack.send(());
                            break;
                        }
                        None => break,
                    }
                }
            }
        }
        log::debug!("Persistence for workspace {} stopped", self.workspace_id);
    }

    /// Export now and queue the write behind any write still in flight.
    fn save(&mut self) {
        let snapshot = self.doc.export_snapshot();
        let previous = self.in_flight.take();
        let store = self.store.clone();
        let saves = self.saves.clone();
        let failures = self.failures.clone();
        let on_failure = self.on_failure.clone();
        let workspace_id = self.workspace_id.clone();

        self.in_flight = Some(tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            match store.write(&workspace_id, snapshot).await {
                Ok(()) => {
                    saves.fetch_add(1, Ordering::SeqCst);
                    log::debug!("Persisted snapshot for workspace {workspace_id}");
                }
                Err(e) => {
                    failures.fetch_add(1, Ordering::SeqCst);
                    log::warn!("Snapshot save for workspace {workspace_id} failed: {e}");
                    if let Some(hook) = on_failure {
                        hook(&e);
                    }
                }
            }
        }));
    }

    async fn settle(&mut self) {
        if let Some(write) = self.in_flight.take() {
            let _ = write.await;
        }
    }
}
