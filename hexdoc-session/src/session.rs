//! Connection session: brings one workspace online and takes it down again.
//!
//! ```text
//! Init ─► LoadingSnapshot ─► [SeedingWelcomeDoc] ─► AcquiringLease
//!                                                        │
//!            (degraded identity) ◄───────────────────────┤
//!                   │                                    ▼
//!                   ▼                               Connecting ─► Joining ─► Converged ⟷ Reconnecting
//!                Offline ◄──── relay failure ───────────┴───────────┘
//!
//! Reconnecting ends only once the client is connected again and the
//! re-joined room has converged.
//!
//! teardown (any phase, once): lease ─► presence/selection ─► leave room
//!          ─► status listeners ─► detach ─► Disconnected ─► destroy client
//! ```
//!
//! Every setup step runs after the previous one resolved. After each
//! suspension point the setup checks that it was neither torn down nor
//! superseded by a newer session on the same runtime; a superseded setup
//! releases whatever it had acquired. Teardown waits for setup to finish
//! before releasing, whichever handle clone calls it.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::broker::SessionId;
use crate::document::{DocumentHandle, PeerId};
use crate::identity::{connection_url, share_url, WorkspaceKeys};
use crate::lease::{PeerLeaseManager, ReacquirePolicy};
use crate::presence::{PresenceConfig, PresenceScheduler};
use crate::relay::{ConnectionStatus, RelayClient, RelayRoom};
use crate::runtime::{Advisory, SessionRuntime};
use crate::selection::SelectionSync;
use crate::storage::{
    setup_persistence, FailureHook, PersistenceConfig, PersistenceHandle, StoreError, WorkspaceRecord,
};

// ───────────────────────────────────────────────────────────────────
// Configuration and observable state
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Relay base URL, e.g. `wss://relay.example.com`.
    pub relay_base: String,
    /// Origin used for share URLs.
    pub origin: String,
    /// Seed the starter document on a first visit.
    pub bootstrap_welcome_doc: bool,
    pub connect_timeout: Duration,
    /// Bound on waiting for the relay's join-time version.
    pub convergence_timeout: Duration,
    pub presence: PresenceConfig,
    pub persistence: PersistenceConfig,
    pub reacquire: ReacquirePolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            relay_base: "ws://localhost:8787".into(),
            origin: "http://localhost:8080".into(),
            bootstrap_welcome_doc: false,
            connect_timeout: Duration::from_secs(10),
            convergence_timeout: Duration::from_secs(10),
            presence: PresenceConfig::default(),
            persistence: PersistenceConfig::default(),
            reacquire: ReacquirePolicy::default(),
        }
    }
}

impl SessionConfig {
    pub fn for_testing(relay_base: impl Into<String>) -> Self {
        Self {
            relay_base: relay_base.into(),
            connect_timeout: Duration::from_millis(500),
            convergence_timeout: Duration::from_millis(500),
            presence: PresenceConfig::for_testing(),
            persistence: PersistenceConfig::for_testing(),
            reacquire: ReacquirePolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(10),
            },
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Init,
    LoadingSnapshot,
    SeedingWelcomeDoc,
    AcquiringLease,
    Connecting,
    Joining,
    Converged,
    Reconnecting,
    /// No relay: degraded identity or relay failure. Editing and local
    /// persistence continue.
    Offline,
    TornDown,
}

impl SessionPhase {
    /// Setup is over, one way or another.
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            SessionPhase::Converged
                | SessionPhase::Reconnecting
                | SessionPhase::Offline
                | SessionPhase::TornDown
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStatus {
    pub status: ConnectionStatus,
    pub latency: Option<Duration>,
    pub phase: SessionPhase,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            latency: None,
            phase: SessionPhase::Init,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionIdentity {
    Pending,
    Ready {
        /// Canonical keys, derived from the key material.
        keys: WorkspaceKeys,
        share_url: String,
        /// Running on the fallback identity.
        degraded: bool,
    },
    /// The supplied key pair could not be reconstructed or verified.
    Unusable,
}

impl SessionIdentity {
    pub fn keys(&self) -> Option<&WorkspaceKeys> {
        match self {
            SessionIdentity::Ready { keys, .. } => Some(keys),
            _ => None,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Session
// ───────────────────────────────────────────────────────────────────

/// Resources acquired by setup, released by teardown.
#[derive(Default)]
struct Resources {
    client: Option<Arc<dyn RelayClient>>,
    room: Option<Arc<dyn RelayRoom>>,
    monitor: Option<JoinHandle<()>>,
    persistence: Option<Arc<PersistenceHandle>>,
    presence: Option<Arc<PresenceScheduler>>,
    selection: Option<Arc<SelectionSync>>,
}

enum Abort {
    Cancelled,
    Superseded,
}

struct LoadedWorkspace {
    first_visit: bool,
    snapshot: Option<Vec<u8>>,
}

struct SessionInner {
    runtime: Arc<SessionRuntime>,
    config: SessionConfig,
    session_id: SessionId,
    generation: u64,
    doc: Arc<dyn DocumentHandle>,
    lease: Arc<PeerLeaseManager>,
    cancel: CancellationToken,
    status: Arc<watch::Sender<SessionStatus>>,
    identity: watch::Sender<SessionIdentity>,
    resources: Mutex<Resources>,
    /// Flips to `true` once the setup task ended, however it ended.
    setup_done: watch::Sender<bool>,
    released: AtomicBool,
}

pub struct ConnectionSession;

impl ConnectionSession {
    /// Start a session for `keys` on `doc`. Setup runs in the background;
    /// watch [`SessionHandle::status`] or await [`SessionHandle::wait_ready`].
    pub fn open(
        runtime: Arc<SessionRuntime>,
        keys: WorkspaceKeys,
        doc: Arc<dyn DocumentHandle>,
        config: SessionConfig,
    ) -> SessionHandle {
        let generation = runtime.begin_session();
        let lease = PeerLeaseManager::new(
            doc.clone(),
            runtime.locks().clone(),
            runtime.lifecycle().subscribe(),
            config.reacquire,
        );
        let (status, _) = watch::channel(SessionStatus::default());
        let (identity, _) = watch::channel(SessionIdentity::Pending);
        let inner = Arc::new(SessionInner {
            runtime,
            config,
            session_id: SessionId::new(),
            generation,
            doc,
            lease,
            cancel: CancellationToken::new(),
            status: Arc::new(status),
            identity,
            resources: Mutex::new(Resources::default()),
            setup_done: watch::channel(false).0,
            released: AtomicBool::new(false),
        });
        log::debug!(
            "Session {} (generation {generation}) opening",
            inner.session_id
        );

        let setup = tokio::spawn(inner.clone().run(keys));
        let watcher = inner.clone();
        tokio::spawn(async move {
            if let Err(e) = setup.await {
                if e.is_panic() {
                    log::error!("Session {} setup panicked", watcher.session_id);
                }
            }
            watcher.setup_done.send_replace(true);
        });
        SessionHandle { inner }
    }
}

impl SessionInner {
    async fn run(self: Arc<Self>, keys: WorkspaceKeys) {
        match self.setup(keys).await {
            Ok(()) => {}
            Err(Abort::Cancelled) => {
                log::debug!("Session {} setup cancelled", self.session_id);
            }
            Err(Abort::Superseded) => {
                log::info!(
                    "Session {} superseded during setup, releasing",
                    self.session_id
                );
                self.release_resources().await;
            }
        }
    }

    /// Await `fut` unless torn down first; afterwards make sure this
    /// session is still wanted.
    async fn guard<T>(&self, fut: impl Future<Output = T>) -> Result<T, Abort> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Abort::Cancelled),
            out = fut => {
                if self.cancel.is_cancelled() {
                    Err(Abort::Cancelled)
                } else if !self.runtime.is_current(self.generation) {
                    Err(Abort::Superseded)
                } else {
                    Ok(out)
                }
            }
        }
    }

    async fn setup(self: &Arc<Self>, keys: WorkspaceKeys) -> Result<(), Abort> {
        let runtime = self.runtime.clone();
        let codec = *runtime.codec();

        // Identity.
        let pair = if codec.is_available() {
            let (public, private) = (keys.public_hex.clone(), keys.private_hex.clone());
            let imported = self
                .guard(tokio::task::spawn_blocking(move || {
                    codec.import_key_pair(&public, &private)
                }))
                .await?;
            match imported {
                Ok(Some(pair)) => Some(pair),
                Ok(None) | Err(_) => {
                    log::warn!("No usable identity for workspace {}", keys.public_hex);
                    self.identity.send_replace(SessionIdentity::Unusable);
                    self.go_offline();
                    return Ok(());
                }
            }
        } else {
            log::warn!("Cryptographic subsystem unavailable, running offline on the fallback identity");
            runtime.advisories().raise(Advisory::CryptoUnavailable);
            None
        };
        let canonical = match &pair {
            Some(pair) => pair.keys(),
            None => codec.fallback_keys(),
        };
        let workspace_id = canonical.public_hex.clone();

        // Metadata and local snapshot.
        self.set_phase(SessionPhase::LoadingSnapshot);
        let loaded = self.guard(self.load_workspace(&canonical)).await?;
        if let Some(snapshot) = &loaded.snapshot {
            match self.doc.import_snapshot(snapshot) {
                Ok(()) => log::debug!("Restored local snapshot of workspace {workspace_id}"),
                Err(e) => log::warn!("Local snapshot of workspace {workspace_id} rejected: {e}"),
            }
        }

        // Starter document.
        let seed = self.config.bootstrap_welcome_doc
            && loaded.first_visit
            && loaded.snapshot.is_none()
            && self.doc.is_empty();
        if let (true, Some(welcome)) = (seed, runtime.welcome()) {
            self.set_phase(SessionPhase::SeedingWelcomeDoc);
            if let Some(bytes) = self.guard(welcome.get()).await? {
                match self.doc.import_snapshot(&bytes) {
                    Ok(()) => self.guard(self.save_now(&workspace_id)).await?,
                    Err(e) => log::warn!("Welcome snapshot rejected: {e}"),
                }
            }
        }

        let on_failure: FailureHook = {
            let runtime = runtime.clone();
            Arc::new(move |_: &StoreError| {
                runtime.advisories().raise(Advisory::StorageUnavailable);
            })
        };
        let persistence = setup_persistence(
            self.doc.clone(),
            workspace_id.clone(),
            runtime.store().clone(),
            self.config.persistence.clone(),
            Some(on_failure),
        );
        self.with_resources(|r| r.persistence = Some(Arc::new(persistence)));

        // Peer lease.
        self.set_phase(SessionPhase::AcquiringLease);
        if !self.guard(self.lease.acquire(&workspace_id)).await? {
            log::warn!(
                "Session {} continues without a peer lease",
                self.session_id
            );
        }
        let peer = match self.doc.peer_id() {
            Some(peer) => peer,
            None => {
                let peer = PeerId::random();
                self.doc.set_peer_id(peer);
                peer
            }
        };

        self.identity.send_replace(SessionIdentity::Ready {
            share_url: share_url(&self.config.origin, &canonical),
            keys: canonical,
            degraded: pair.is_none(),
        });
        let Some(pair) = pair else {
            self.go_offline();
            return Ok(());
        };

        // Authenticated connection.
        self.status.send_modify(|s| {
            s.phase = SessionPhase::Connecting;
            s.status = ConnectionStatus::Connecting;
        });
        let client = runtime.connector().create();
        self.with_resources(|r| r.client = Some(client.clone()));
        self.spawn_monitor(&client);

        let token = codec.sign_challenge(&pair);
        let url = connection_url(&self.config.relay_base, &workspace_id, &token);
        let connected = self
            .guard(tokio::time::timeout(
                self.config.connect_timeout,
                client.connect(&url),
            ))
            .await?;
        match connected {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return self.relay_failed(&format!("connect failed: {e}")).await,
            Err(_) => return self.relay_failed("connect timed out").await,
        }

        // Room and convergence.
        self.set_phase(SessionPhase::Joining);
        let room = match self.guard(client.join(&workspace_id, self.doc.clone())).await? {
            Ok(room) => room,
            Err(e) => return self.relay_failed(&format!("join failed: {e}")).await,
        };
        self.with_resources(|r| r.room = Some(room.clone()));

        let converged = self
            .guard(tokio::time::timeout(
                self.config.convergence_timeout,
                room.wait_for_convergence(),
            ))
            .await?;
        match converged {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return self.relay_failed(&format!("convergence failed: {e}")).await,
            Err(_) => return self.relay_failed("convergence timed out").await,
        }
        self.set_phase(SessionPhase::Converged);
        log::info!(
            "Session {} converged on workspace {workspace_id}",
            self.session_id
        );

        let presence = Arc::new(
            PresenceScheduler::new(
                runtime.broker().clone(),
                peer,
                self.config.presence.clone(),
                runtime.lifecycle().subscribe(),
            )
            .with_peer_source(self.doc.clone()),
        );
        presence
            .schedule(self.session_id, client.clone(), &workspace_id)
            .await;
        let selection = SelectionSync::new(runtime.broker().clone(), self.session_id, peer);
        self.with_resources(|r| {
            r.presence = Some(presence);
            r.selection = Some(selection.clone());
        });
        tokio::spawn(async move {
            selection.attach().await;
        });

        let status = self.status.clone();
        tokio::spawn(async move {
            match room.ping().await {
                Ok(rtt) => {
                    status.send_if_modified(|s| {
                        let live = s.status == ConnectionStatus::Connected
                            && s.phase != SessionPhase::TornDown;
                        if live {
                            s.latency = Some(rtt);
                        }
                        live
                    });
                }
                Err(e) => log::debug!("Post-convergence ping failed: {e}"),
            }
        });
        Ok(())
    }

    async fn load_workspace(&self, keys: &WorkspaceKeys) -> LoadedWorkspace {
        let runtime = &self.runtime;
        let unknown = LoadedWorkspace {
            first_visit: false,
            snapshot: None,
        };

        let grant = runtime.grants().ensure().await;
        if !grant.supported {
            runtime.advisories().raise(Advisory::StorageUnavailable);
        } else if !grant.granted {
            runtime.advisories().raise(Advisory::StorageNotPersistent);
        }

        let Some(store) = runtime.store().get().await else {
            runtime.advisories().raise(Advisory::StorageUnavailable);
            return unknown;
        };
        let id = keys.public_hex.clone();
        let private = keys.private_hex.clone();
        let loaded = tokio::task::spawn_blocking(move || -> Result<LoadedWorkspace, StoreError> {
            let first_visit = match store.touch_workspace(&id)? {
                Some(_) => false,
                None => {
                    store.put_workspace(&WorkspaceRecord::new(id.clone(), private))?;
                    true
                }
            };
            let snapshot = store.get_snapshot(&id)?;
            Ok(LoadedWorkspace {
                first_visit,
                snapshot,
            })
        })
        .await;

        match loaded {
            Ok(Ok(loaded)) => loaded,
            Ok(Err(e)) => {
                log::warn!("Workspace {} not loaded from storage: {e}", keys.public_hex);
                runtime.advisories().raise(Advisory::StorageUnavailable);
                unknown
            }
            Err(e) => {
                log::error!("Workspace load task failed: {e}");
                unknown
            }
        }
    }

    /// Write the current snapshot without waiting for the debounce.
    async fn save_now(&self, workspace_id: &str) {
        let Some(store) = self.runtime.store().get().await else {
            return;
        };
        let snapshot = self.doc.export_snapshot();
        let id = workspace_id.to_string();
        match tokio::task::spawn_blocking(move || store.put_snapshot(&id, &snapshot)).await {
            Ok(Ok(())) => log::debug!("Seeded snapshot of workspace {workspace_id} saved"),
            Ok(Err(e)) => {
                log::warn!("Seeded snapshot of workspace {workspace_id} not saved: {e}");
                self.runtime.advisories().raise(Advisory::StorageUnavailable);
            }
            Err(e) => log::error!("Snapshot save task failed: {e}"),
        }
    }

    /// Mirror the client's status and latency into the session status.
    /// Latency is only reported while connected.
    fn spawn_monitor(self: &Arc<Self>, client: &Arc<dyn RelayClient>) {
        let session = Arc::downgrade(self);
        let status = self.status.clone();
        let convergence_timeout = self.config.convergence_timeout;
        let mut connection = client.status();
        let mut latency = client.latency();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = connection.changed() => if changed.is_err() { break },
                    changed = latency.changed() => if changed.is_err() { break },
                }
                let current = *connection.borrow_and_update();
                let sample = *latency.borrow_and_update();
                let sample = if current == ConnectionStatus::Connected { sample } else { None };
                let mut resync = false;
                status.send_if_modified(|s| {
                    let before = *s;
                    s.status = current;
                    s.latency = sample;
                    if s.phase == SessionPhase::Converged && current != ConnectionStatus::Connected {
                        s.phase = SessionPhase::Reconnecting;
                    }
                    resync = s.phase == SessionPhase::Reconnecting
                        && current == ConnectionStatus::Connected;
                    *s != before
                });
                if resync && !reconverge(&session, &status, convergence_timeout).await {
                    break;
                }
            }
        });
        self.with_resources(|r| r.monitor = Some(task));
    }

    fn current_room(&self) -> Option<Arc<dyn RelayRoom>> {
        self.resources.lock().ok().and_then(|r| r.room.clone())
    }

    /// Relay is unusable: go offline and give up the lease. The document and
    /// its persistence keep running.
    async fn relay_failed(&self, reason: &str) -> Result<(), Abort> {
        log::warn!("Session {} offline: {reason}", self.session_id);
        let (monitor, room) = self
            .resources
            .lock()
            .map(|mut r| (r.monitor.take(), r.room.clone()))
            .unwrap_or((None, None));
        if let Some(monitor) = monitor {
            monitor.abort();
        }
        if let Some(room) = room {
            room.detach();
        }
        self.go_offline();
        self.lease.release().await;
        Ok(())
    }

    fn go_offline(&self) {
        self.status.send_modify(|s| {
            s.status = ConnectionStatus::Disconnected;
            s.latency = None;
            s.phase = SessionPhase::Offline;
        });
    }

    fn set_phase(&self, phase: SessionPhase) {
        self.status.send_if_modified(|s| {
            let changed = s.phase != phase;
            s.phase = phase;
            changed
        });
        log::debug!("Session {} -> {phase:?}", self.session_id);
    }

    fn with_resources(&self, f: impl FnOnce(&mut Resources)) {
        if let Ok(mut resources) = self.resources.lock() {
            f(&mut resources);
        }
    }

    /// Ordered release of everything setup acquired. Runs at most once.
    async fn release_resources(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let resources = self
            .resources
            .lock()
            .map(|mut r| std::mem::take(&mut *r))
            .unwrap_or_default();
        let Resources {
            client,
            room,
            monitor,
            persistence,
            presence,
            selection,
        } = resources;

        self.lease.destroy().await;

        // Presence runs the broker cleanups, so selection reacts first.
        if let Some(presence) = presence {
            presence.dispose().await;
        }
        if let Some(selection) = selection {
            selection.dispose().await;
        }
        self.runtime.broker().forget(self.session_id);

        if let Some(room) = &room {
            if let Err(e) = room.leave().await {
                log::warn!("Leaving room of session {} failed: {e}", self.session_id);
            }
        }
        if let Some(monitor) = monitor {
            monitor.abort();
            // Dropped listeners are gone once the aborted task is.
            let _ = monitor.await;
        }
        if let Some(room) = &room {
            room.detach();
        }
        self.status.send_modify(|s| {
            s.status = ConnectionStatus::Disconnected;
            s.latency = None;
            s.phase = SessionPhase::TornDown;
        });
        if let Some(client) = client {
            client.destroy().await;
        }
        if let Some(persistence) = persistence {
            persistence.stop().await;
        }
        log::info!("Session {} torn down", self.session_id);
    }
}

// ───────────────────────────────────────────────────────────────────
// Handle
// ───────────────────────────────────────────────────────────────────

/// Caller's view of a running session.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<SessionInner>,
}

impl SessionHandle {
    pub fn session_id(&self) -> SessionId {
        self.inner.session_id
    }

    pub fn status(&self) -> SessionStatus {
        *self.inner.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.inner.status.subscribe()
    }

    pub fn identity(&self) -> SessionIdentity {
        self.inner.identity.borrow().clone()
    }

    pub fn subscribe_identity(&self) -> watch::Receiver<SessionIdentity> {
        self.inner.identity.subscribe()
    }

    pub fn is_ready(&self) -> bool {
        self.status().phase == SessionPhase::Converged
    }

    /// Wait for setup to settle. Returns whether the session converged.
    pub async fn wait_ready(&self) -> bool {
        let mut rx = self.subscribe();
        let ready = match rx.wait_for(|s| s.phase.is_settled()).await {
            Ok(status) => status.phase == SessionPhase::Converged,
            Err(_) => false,
        };
        ready
    }

    pub fn peer_id(&self) -> Option<PeerId> {
        self.inner.doc.peer_id()
    }

    pub fn has_lease(&self) -> bool {
        self.inner.lease.is_held()
    }

    pub fn presence(&self) -> Option<Arc<PresenceScheduler>> {
        self.inner
            .resources
            .lock()
            .ok()
            .and_then(|r| r.presence.clone())
    }

    pub fn selection(&self) -> Option<Arc<SelectionSync>> {
        self.inner
            .resources
            .lock()
            .ok()
            .and_then(|r| r.selection.clone())
    }

    /// Save pending document changes now.
    pub async fn flush(&self) {
        let persistence = self
            .inner
            .resources
            .lock()
            .ok()
            .and_then(|r| r.persistence.clone());
        if let Some(persistence) = persistence {
            persistence.flush().await;
        }
    }

    /// Stop setup and release everything, in order. Later calls do nothing.
    pub async fn teardown(&self) {
        self.inner.cancel.cancel();
        let mut setup_done = self.inner.setup_done.subscribe();
        let _ = setup_done.wait_for(|done| *done).await;
        self.inner.release_resources().await;
    }
}

/// Wait for the re-joined room after a reconnect and mark the session
/// converged again. Returns `false` once the session is gone.
async fn reconverge(
    session: &Weak<SessionInner>,
    status: &watch::Sender<SessionStatus>,
    timeout: Duration,
) -> bool {
    let room = match session.upgrade() {
        Some(inner) => inner.current_room(),
        None => return false,
    };
    let Some(room) = room else {
        return true;
    };
    match tokio::time::timeout(timeout, room.wait_for_convergence()).await {
        Ok(Ok(())) => {
            let converged = status.send_if_modified(|s| {
                let ready = s.phase == SessionPhase::Reconnecting
                    && s.status == ConnectionStatus::Connected;
                if ready {
                    s.phase = SessionPhase::Converged;
                }
                ready
            });
            if converged {
                log::info!("Session re-converged after reconnect");
            }
        }
        Ok(Err(e)) => log::debug!("Re-convergence interrupted: {e}"),
        Err(_) => log::warn!("Re-convergence timed out, still reconnecting"),
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settled_phases() {
        assert!(!SessionPhase::Init.is_settled());
        assert!(!SessionPhase::Joining.is_settled());
        assert!(SessionPhase::Converged.is_settled());
        assert!(SessionPhase::Offline.is_settled());
        assert!(SessionPhase::TornDown.is_settled());
    }

    #[test]
    fn test_identity_keys_only_when_ready() {
        assert!(SessionIdentity::Pending.keys().is_none());
        assert!(SessionIdentity::Unusable.keys().is_none());
        let ready = SessionIdentity::Ready {
            keys: WorkspaceKeys::fallback(),
            share_url: String::new(),
            degraded: true,
        };
        assert_eq!(ready.keys(), Some(&WorkspaceKeys::fallback()));
    }
}
