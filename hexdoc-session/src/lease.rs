//! Peer leases: which tab may contribute under which replica identity.
//!
//! ```text
//!   acquire(ws) ──┐
//!   acquire(ws) ──┼──► one Shared claim ──► ReplicaLocks::claim
//!   acquire(ws) ──┘            │
//!                              ▼
//!                 held = new, then release(previous)
//!
//!   Frozen  ──► release (workspace remembered)
//!   Visible ──► reacquire if not held, bounded backoff
//! ```
//!
//! At most one lease is held per manager. A claim that completes after
//! `destroy()` is released immediately.

use async_trait::async_trait;
use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::document::{DocumentHandle, PeerId};
use crate::schedule::Visibility;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LeaseError {
    #[error("No replica identity available for workspace {0}")]
    Unavailable(String),
    #[error("Lock registry failed: {0}")]
    Registry(String),
}

/// A claimed replica identity.
#[derive(Debug, Clone)]
pub struct ReplicaLease {
    pub workspace_id: String,
    pub peer_id: PeerId,
    /// Registry-assigned claim number; distinguishes successive holders
    /// of the same peer id.
    pub token: u64,
    /// Flips to `true` when the registry takes the identity back.
    pub revoked: watch::Receiver<bool>,
}

/// Registry that hands out replica identities per workspace.
#[async_trait]
pub trait ReplicaLocks: Send + Sync {
    async fn claim(&self, workspace_id: &str) -> Result<ReplicaLease, LeaseError>;

    async fn release(&self, lease: &ReplicaLease);
}

// ───────────────────────────────────────────────────────────────────
// In-process registry
// ───────────────────────────────────────────────────────────────────

#[derive(Default)]
struct WorkspaceLocks {
    held: HashMap<PeerId, (u64, watch::Sender<bool>)>,
    free: Vec<PeerId>,
}

/// Replica identities shared by every tab of this process.
#[derive(Default)]
pub struct LocalReplicaLocks {
    workspaces: Mutex<HashMap<String, WorkspaceLocks>>,
    next_token: AtomicU64,
    claims: AtomicUsize,
    unavailable: AtomicBool,
    claim_delay: Mutex<Option<Duration>>,
}

impl LocalReplicaLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every claim, to exercise in-flight collapsing.
    pub fn with_claim_delay(delay: Duration) -> Self {
        let locks = Self::default();
        if let Ok(mut d) = locks.claim_delay.lock() {
            *d = Some(delay);
        }
        locks
    }

    /// Make claims fail while `false`.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Number of `claim` calls made, successful or not.
    pub fn claims(&self) -> usize {
        self.claims.load(Ordering::SeqCst)
    }

    /// Identities currently held for `workspace_id`.
    pub fn held_count(&self, workspace_id: &str) -> usize {
        self.workspaces
            .lock()
            .map(|w| w.get(workspace_id).map_or(0, |l| l.held.len()))
            .unwrap_or(0)
    }

    /// Take an identity back from its holder, as when a frozen tab's
    /// identity is handed to another tab.
    pub fn revoke(&self, workspace_id: &str, peer: PeerId) -> bool {
        let Ok(mut workspaces) = self.workspaces.lock() else {
            return false;
        };
        let Some(locks) = workspaces.get_mut(workspace_id) else {
            return false;
        };
        match locks.held.remove(&peer) {
            Some((_, revoked)) => {
                revoked.send_replace(true);
                locks.free.push(peer);
                log::debug!("Revoked peer {peer} for workspace {workspace_id}");
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl ReplicaLocks for LocalReplicaLocks {
    async fn claim(&self, workspace_id: &str) -> Result<ReplicaLease, LeaseError> {
        self.claims.fetch_add(1, Ordering::SeqCst);
        let delay = self.claim_delay.lock().ok().and_then(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(LeaseError::Unavailable(workspace_id.to_string()));
        }

        let mut workspaces = self
            .workspaces
            .lock()
            .map_err(|e| LeaseError::Registry(e.to_string()))?;
        let locks = workspaces.entry(workspace_id.to_string()).or_default();
        let peer_id = loop {
            let candidate = locks.free.pop().unwrap_or_else(PeerId::random);
            if !locks.held.contains_key(&candidate) {
                break candidate;
            }
        };
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (tx, revoked) = watch::channel(false);
        locks.held.insert(peer_id, (token, tx));
        Ok(ReplicaLease {
            workspace_id: workspace_id.to_string(),
            peer_id,
            token,
            revoked,
        })
    }

    async fn release(&self, lease: &ReplicaLease) {
        let Ok(mut workspaces) = self.workspaces.lock() else {
            return;
        };
        let Some(locks) = workspaces.get_mut(&lease.workspace_id) else {
            return;
        };
        // A revoked lease may have been re-issued to someone else.
        if locks
            .held
            .get(&lease.peer_id)
            .is_some_and(|(token, _)| *token == lease.token)
        {
            locks.held.remove(&lease.peer_id);
            locks.free.push(lease.peer_id);
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Handle
// ───────────────────────────────────────────────────────────────────

/// Capability to use one replica identity. Held until released or revoked.
pub struct PeerLeaseHandle {
    lease: ReplicaLease,
    locks: Arc<dyn ReplicaLocks>,
    released: AtomicBool,
}

impl PeerLeaseHandle {
    fn new(lease: ReplicaLease, locks: Arc<dyn ReplicaLocks>) -> Self {
        Self {
            lease,
            locks,
            released: AtomicBool::new(false),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.lease.peer_id
    }

    pub fn workspace_id(&self) -> &str {
        &self.lease.workspace_id
    }

    pub fn is_held(&self) -> bool {
        !self.released.load(Ordering::SeqCst) && !*self.lease.revoked.borrow()
    }

    pub fn is_revoked(&self) -> bool {
        *self.lease.revoked.borrow()
    }

    /// Give the identity back. Idempotent.
    pub async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.locks.release(&self.lease).await;
    }
}

// ───────────────────────────────────────────────────────────────────
// Manager
// ───────────────────────────────────────────────────────────────────

/// Bounded retry for reacquiring after resume.
#[derive(Debug, Clone, Copy)]
pub struct ReacquirePolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for ReacquirePolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(250),
        }
    }
}

impl ReacquirePolicy {
    /// Delay after failed attempt `attempt` (zero based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.initial_backoff * 2u32.saturating_pow(attempt)
    }
}

type AcquireFuture = Shared<BoxFuture<'static, bool>>;

#[derive(Default)]
struct ManagerState {
    held: Option<Arc<PeerLeaseHandle>>,
    in_flight: Option<(String, AcquireFuture)>,
    /// Workspace to reacquire on resume.
    wanted: Option<String>,
}

/// Owns the peer lease of one document.
pub struct PeerLeaseManager {
    doc: Arc<dyn DocumentHandle>,
    locks: Arc<dyn ReplicaLocks>,
    policy: ReacquirePolicy,
    state: Mutex<ManagerState>,
    destroyed: AtomicBool,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl PeerLeaseManager {
    pub fn new(
        doc: Arc<dyn DocumentHandle>,
        locks: Arc<dyn ReplicaLocks>,
        lifecycle: watch::Receiver<Visibility>,
        policy: ReacquirePolicy,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            doc,
            locks,
            policy,
            state: Mutex::new(ManagerState::default()),
            destroyed: AtomicBool::new(false),
            watcher: Mutex::new(None),
        });
        let watcher = tokio::spawn(watch_lifecycle(Arc::downgrade(&manager), lifecycle));
        if let Ok(mut slot) = manager.watcher.lock() {
            *slot = Some(watcher);
        }
        manager
    }

    /// Claim an identity for `workspace_id`. Concurrent callers share one
    /// claim. Returns whether a lease is held afterwards.
    pub async fn acquire(self: &Arc<Self>, workspace_id: &str) -> bool {
        loop {
            if self.is_destroyed() {
                return false;
            }
            let (pending, ours) = {
                let Ok(mut state) = self.state.lock() else {
                    return false;
                };
                state.wanted = Some(workspace_id.to_string());
                if state
                    .held
                    .as_ref()
                    .is_some_and(|h| h.workspace_id() == workspace_id && h.is_held())
                {
                    return true;
                }
                match &state.in_flight {
                    Some((ws, fut)) => (fut.clone(), ws == workspace_id),
                    None => {
                        let fut = self.start_claim(workspace_id.to_string());
                        state.in_flight = Some((workspace_id.to_string(), fut.clone()));
                        (fut, true)
                    }
                }
            };
            let held = pending.await;
            if ours {
                return held;
            }
            // Another workspace's claim was in flight; go again.
        }
    }

    fn start_claim(self: &Arc<Self>, workspace_id: String) -> AcquireFuture {
        let task = tokio::spawn(self.clone().claim_and_swap(workspace_id));
        async move { task.await.unwrap_or(false) }.boxed().shared()
    }

    async fn claim_and_swap(self: Arc<Self>, workspace_id: String) -> bool {
        let claimed = self.locks.claim(&workspace_id).await;
        let held = match claimed {
            Ok(lease) if self.is_destroyed() => {
                self.locks.release(&lease).await;
                false
            }
            Ok(lease) => {
                let handle = Arc::new(PeerLeaseHandle::new(lease, self.locks.clone()));
                let peer = handle.peer_id();
                self.doc.set_peer_id(peer);
                let previous = self
                    .state
                    .lock()
                    .ok()
                    .and_then(|mut s| s.held.replace(handle));
                if let Some(previous) = previous {
                    previous.release().await;
                }
                if self.is_destroyed() {
                    // destroy() ran while the new lease was being installed.
                    self.release_held().await;
                    false
                } else {
                    log::info!("Peer lease {peer} acquired for workspace {workspace_id}");
                    true
                }
            }
            Err(e) => {
                log::warn!("Peer lease for workspace {workspace_id} not acquired: {e}");
                self.release_held().await;
                false
            }
        };
        if let Ok(mut state) = self.state.lock() {
            if state
                .in_flight
                .as_ref()
                .is_some_and(|(ws, _)| *ws == workspace_id)
            {
                state.in_flight = None;
            }
        }
        held
    }

    /// Release the held lease, if any, and forget the workspace. Idempotent.
    pub async fn release(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.wanted = None;
        }
        self.release_held().await;
    }

    /// Release and stop reacting to lifecycle changes. Any claim still in
    /// flight is released on arrival.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(watcher) = self.watcher.lock().ok().and_then(|mut w| w.take()) {
            watcher.abort();
        }
        self.release().await;
        log::debug!("Peer lease manager destroyed");
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn is_held(&self) -> bool {
        self.state
            .lock()
            .map(|s| s.held.as_ref().is_some_and(|h| h.is_held()))
            .unwrap_or(false)
    }

    pub fn current_peer(&self) -> Option<PeerId> {
        self.state.lock().ok().and_then(|s| {
            s.held
                .as_ref()
                .filter(|h| h.is_held())
                .map(|h| h.peer_id())
        })
    }

    async fn release_held(&self) {
        let held = self.state.lock().ok().and_then(|mut s| s.held.take());
        if let Some(handle) = held {
            handle.release().await;
            log::debug!("Peer lease {} released", handle.peer_id());
        }
    }

    async fn suspend(&self) {
        self.release_held().await;
    }

    async fn reacquire(self: &Arc<Self>) {
        let wanted = self.state.lock().ok().and_then(|s| s.wanted.clone());
        let Some(workspace_id) = wanted else {
            return;
        };
        if self.is_held() {
            return;
        }
        for attempt in 0..self.policy.max_attempts {
            if self.is_destroyed() {
                return;
            }
            if self.acquire(&workspace_id).await {
                return;
            }
            if attempt + 1 < self.policy.max_attempts {
                tokio::time::sleep(self.policy.backoff(attempt)).await;
            }
        }
        log::warn!(
            "Gave up reacquiring peer lease for workspace {workspace_id} after {} attempts",
            self.policy.max_attempts
        );
    }
}

async fn watch_lifecycle(manager: Weak<PeerLeaseManager>, mut lifecycle: watch::Receiver<Visibility>) {
    let mut previous = *lifecycle.borrow_and_update();
    while lifecycle.changed().await.is_ok() {
        let current = *lifecycle.borrow_and_update();
        let Some(manager) = manager.upgrade() else {
            break;
        };
        if manager.is_destroyed() {
            break;
        }
        match current {
            Visibility::Frozen => manager.suspend().await,
            Visibility::Visible if previous != Visibility::Visible => manager.reacquire().await,
            _ => {}
        }
        previous = current;
    }
}
