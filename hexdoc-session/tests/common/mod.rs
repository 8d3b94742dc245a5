//! Shared fixtures: an in-memory relay and runtime builders.
//!
//! The relay keeps an event log that the fake client, its rooms and
//! [`RecordingLocks`] append to, so tests can check the order of teardown
//! side effects.

#![allow(dead_code)]

use async_trait::async_trait;
use hexdoc_session::ephemeral::MemoryEphemeralStore;
use hexdoc_session::lease::ReplicaLease;
use hexdoc_session::{
    ConnectionStatus, DocumentHandle, IdentityCodec, LeaseError, LocalReplicaLocks, RelayClient,
    RelayConnector, RelayError, RelayRoom, ReplicaLocks, SessionRuntime, SessionStatus,
    SharedChannel, StoreConfig, WorkspaceKeys,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// How the fake relay treats the clients it creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Healthy,
    RefuseConnect,
    /// `connect` never resolves.
    HangConnect,
    FailJoin,
    /// Joined rooms never converge.
    NeverConverge,
}

pub struct FakeRelay {
    behavior: Behavior,
    clients: Mutex<Vec<Arc<FakeClient>>>,
    urls: Mutex<Vec<String>>,
    events: Mutex<Vec<String>>,
    session: Mutex<Option<watch::Receiver<SessionStatus>>>,
}

impl FakeRelay {
    pub fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            clients: Mutex::new(Vec::new()),
            urls: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
            session: Mutex::new(None),
        })
    }

    pub fn record(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    /// Let `destroy` record the session status it observes.
    pub fn observe_session(&self, status: watch::Receiver<SessionStatus>) {
        *self.session.lock().unwrap() = Some(status);
    }

    pub fn created(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    pub fn client(&self, index: usize) -> Arc<FakeClient> {
        self.clients.lock().unwrap()[index].clone()
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }
}

/// Lets the runtime own the connector while the test keeps the relay.
pub struct SharedRelay(pub Arc<FakeRelay>);

impl RelayConnector for SharedRelay {
    fn create(&self) -> Arc<dyn RelayClient> {
        let relay = self.0.clone();
        let client = Arc::new(FakeClient::new(relay.behavior, relay.clone()));
        relay.clients.lock().unwrap().push(client.clone());
        client
    }
}

pub struct FakeClient {
    behavior: Behavior,
    relay: Arc<FakeRelay>,
    status: Arc<watch::Sender<ConnectionStatus>>,
    latency: Arc<watch::Sender<Option<Duration>>>,
    channels: Mutex<Vec<Arc<MemoryEphemeralStore>>>,
    joins: AtomicUsize,
    pub room: Mutex<Option<Arc<FakeRoom>>>,
    destroyed: AtomicBool,
}

impl FakeClient {
    fn new(behavior: Behavior, relay: Arc<FakeRelay>) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        let (latency, _) = watch::channel(None);
        Self {
            behavior,
            relay,
            status: Arc::new(status),
            latency: Arc::new(latency),
            channels: Mutex::new(Vec::new()),
            joins: AtomicUsize::new(0),
            room: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn joins(&self) -> usize {
        self.joins.load(Ordering::SeqCst)
    }

    pub fn channels(&self) -> Vec<Arc<MemoryEphemeralStore>> {
        self.channels.lock().unwrap().clone()
    }

    /// Simulate a dropped connection.
    pub fn drop_connection(&self) {
        self.status.send_replace(ConnectionStatus::Disconnected);
    }

    pub fn restore_connection(&self) {
        self.status.send_replace(ConnectionStatus::Connected);
    }

    pub fn report_latency(&self, rtt: Duration) {
        self.latency.send_replace(Some(rtt));
    }

    /// Status or latency watchers still subscribed.
    pub fn listeners(&self) -> usize {
        self.status.receiver_count() + self.latency.receiver_count()
    }
}

#[async_trait]
impl RelayClient for FakeClient {
    async fn connect(&self, url: &str) -> Result<(), RelayError> {
        self.relay.urls.lock().unwrap().push(url.to_string());
        self.status.send_replace(ConnectionStatus::Connecting);
        match self.behavior {
            Behavior::RefuseConnect => {
                self.status.send_replace(ConnectionStatus::Disconnected);
                Err(RelayError::Connect("refused".into()))
            }
            Behavior::HangConnect => std::future::pending().await,
            _ => {
                self.status.send_replace(ConnectionStatus::Connected);
                Ok(())
            }
        }
    }

    fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    fn latency(&self) -> watch::Receiver<Option<Duration>> {
        self.latency.subscribe()
    }

    async fn join(
        &self,
        room: &str,
        _doc: Arc<dyn DocumentHandle>,
    ) -> Result<Arc<dyn RelayRoom>, RelayError> {
        self.joins.fetch_add(1, Ordering::SeqCst);
        if self.behavior == Behavior::FailJoin {
            return Err(RelayError::Join {
                room: room.to_string(),
                reason: "rejected".into(),
            });
        }
        let joined = Arc::new(FakeRoom {
            converges: self.behavior != Behavior::NeverConverge,
            left: AtomicBool::new(false),
            detached: AtomicBool::new(false),
            convergence_waits: AtomicUsize::new(0),
            relay: self.relay.clone(),
            status: self.status.clone(),
            latency: self.latency.clone(),
        });
        *self.room.lock().unwrap() = Some(joined.clone());
        Ok(joined)
    }

    async fn open_ephemeral(&self, _room: &str, ttl: Duration) -> Result<SharedChannel, RelayError> {
        if *self.status.borrow() != ConnectionStatus::Connected {
            return Err(RelayError::NotConnected);
        }
        let channel = Arc::new(MemoryEphemeralStore::new(ttl));
        self.channels.lock().unwrap().push(channel.clone());
        Ok(channel)
    }

    async fn destroy(&self) {
        let observed = self
            .relay
            .session
            .lock()
            .unwrap()
            .as_ref()
            .map(|rx| rx.borrow().status);
        if let Some(status) = observed {
            self.relay.record(format!("destroy: session {status:?}"));
        }
        self.destroyed.store(true, Ordering::SeqCst);
        self.status.send_replace(ConnectionStatus::Disconnected);
    }
}

pub struct FakeRoom {
    converges: bool,
    pub left: AtomicBool,
    pub detached: AtomicBool,
    pub convergence_waits: AtomicUsize,
    relay: Arc<FakeRelay>,
    status: Arc<watch::Sender<ConnectionStatus>>,
    latency: Arc<watch::Sender<Option<Duration>>>,
}

impl FakeRoom {
    fn subscription(&self) -> &'static str {
        if self.status.receiver_count() + self.latency.receiver_count() > 0 {
            "listening"
        } else {
            "unsubscribed"
        }
    }
}

#[async_trait]
impl RelayRoom for FakeRoom {
    async fn wait_for_convergence(&self) -> Result<(), RelayError> {
        self.convergence_waits.fetch_add(1, Ordering::SeqCst);
        if self.converges {
            Ok(())
        } else {
            std::future::pending().await
        }
    }

    async fn ping(&self) -> Result<Duration, RelayError> {
        Ok(Duration::from_millis(1))
    }

    async fn leave(&self) -> Result<(), RelayError> {
        self.relay.record(format!("leave: {}", self.subscription()));
        self.left.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn detach(&self) {
        self.relay.record(format!("detach: {}", self.subscription()));
        self.detached.store(true, Ordering::SeqCst);
    }
}

/// Lock registry that logs releases to the relay's event log.
pub struct RecordingLocks {
    pub inner: Arc<LocalReplicaLocks>,
    relay: Arc<FakeRelay>,
}

impl RecordingLocks {
    pub fn new(relay: &Arc<FakeRelay>) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(LocalReplicaLocks::new()),
            relay: relay.clone(),
        })
    }
}

#[async_trait]
impl ReplicaLocks for RecordingLocks {
    async fn claim(&self, workspace_id: &str) -> Result<ReplicaLease, LeaseError> {
        self.inner.claim(workspace_id).await
    }

    async fn release(&self, lease: &ReplicaLease) {
        self.relay.record("lease released");
        self.inner.release(lease).await;
    }
}

/// Runtime over a temp store, the given relay and an observable lock registry.
pub fn runtime(
    relay: &Arc<FakeRelay>,
    dir: &tempfile::TempDir,
) -> (SessionRuntime, Arc<LocalReplicaLocks>) {
    let locks = Arc::new(LocalReplicaLocks::new());
    let runtime = SessionRuntime::new(
        Arc::new(SharedRelay(relay.clone())),
        StoreConfig::for_testing(dir.path()),
    )
    .with_locks(locks.clone());
    (runtime, locks)
}

pub fn fresh_keys() -> WorkspaceKeys {
    let (pair, _) = IdentityCodec::default()
        .generate_pair_and_url("http://localhost")
        .expect("crypto available");
    pair.keys()
}
