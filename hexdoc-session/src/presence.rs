//! Presence scheduler: low-chatter liveness over the shared ephemeral channel.
//!
//! ```text
//! schedule(session, client)
//!       │  dispose previous, defer until idle
//!       ▼
//! wait Connected ──(timeout)──► abort: clear broker, empty snapshot
//!       │
//!       ▼
//! open_ephemeral ─► ChannelBroker::publish ─► p:<self> = now
//!       │
//!       ▼
//! loop: channel change │ heartbeat tick │ visibility regained
//!       └──► live_peers() ──► watch<PresenceSnapshot>
//! ```
//!
//! Each heartbeat re-reads the peer id from the document, so a lease that
//! was reacquired under a different id moves the beat key with it. The
//! same tick sweeps expired channel entries.
//!
//! Disposal order: stop the loop, run the broker's dependent cleanups,
//! delete the own beat key, destroy the channel, clear the broker slot,
//! zero the snapshot.

use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::broker::{ChannelBroker, SessionId};
use crate::document::{DocumentHandle, PeerId};
use crate::ephemeral::SharedChannel;
use crate::relay::{wait_connected, RelayClient};
use crate::schedule::{Deferral, Visibility};

/// Key prefix of heartbeat entries.
pub const PRESENCE_PREFIX: &str = "p:";

/// Presence timing.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// How often the own beat is rewritten.
    pub heartbeat_interval: Duration,
    /// A beat older than this is not live.
    pub freshness_window: Duration,
    /// Expiry of entries on the ephemeral channel.
    pub channel_ttl: Duration,
    /// How long to wait for the relay connection before giving up.
    pub connect_timeout: Duration,
    pub deferral: Deferral,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            freshness_window: Duration::from_secs(30),
            channel_ttl: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            deferral: Deferral::Idle,
        }
    }
}

impl PresenceConfig {
    pub fn for_testing() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(100),
            freshness_window: Duration::from_millis(300),
            channel_ttl: Duration::from_millis(300),
            connect_timeout: Duration::from_millis(200),
            deferral: Deferral::None,
        }
    }
}

/// Live peers other than self, and the participant count including self.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceSnapshot {
    pub others: Vec<PeerId>,
    /// Zero only when no presence session is active.
    pub total: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceState {
    Idle,
    Scheduled,
    Running,
    Disposed,
}

pub fn presence_key(peer: PeerId) -> String {
    format!("{PRESENCE_PREFIX}{peer}")
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Compute the live set from raw channel entries.
///
/// A beat stamped `ts` is live while `now_ms - ts < window`. Entries outside
/// the presence namespace, with unparsable peer ids, or with non-numeric
/// values are ignored, as are beats dated a full window into the future.
pub fn live_peers(
    entries: &[(String, Value)],
    self_id: PeerId,
    now_ms: u64,
    window: Duration,
) -> PresenceSnapshot {
    let window = window.as_millis() as f64;
    let now = now_ms as f64;
    let mut others: Vec<PeerId> = entries
        .iter()
        .filter_map(|(key, value)| {
            let peer: PeerId = key.strip_prefix(PRESENCE_PREFIX)?.parse().ok()?;
            let ts = value.as_f64().filter(|ts| ts.is_finite())?;
            let age = now - ts;
            (age < window && age > -window).then_some(peer)
        })
        .filter(|peer| *peer != self_id)
        .collect();
    others.sort_unstable();
    others.dedup();
    let total = others.len() + 1;
    PresenceSnapshot { others, total }
}

struct ActiveSession {
    session: SessionId,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    channel: Arc<Mutex<Option<SharedChannel>>>,
}

/// Per-connection presence lifecycle.
pub struct PresenceScheduler {
    broker: Arc<ChannelBroker>,
    peer: Arc<AtomicU64>,
    peer_source: Option<Arc<dyn DocumentHandle>>,
    config: PresenceConfig,
    lifecycle: watch::Receiver<Visibility>,
    snapshot: Arc<watch::Sender<PresenceSnapshot>>,
    state: Arc<watch::Sender<PresenceState>>,
    active: tokio::sync::Mutex<Option<ActiveSession>>,
}

impl PresenceScheduler {
    pub fn new(
        broker: Arc<ChannelBroker>,
        peer_id: PeerId,
        config: PresenceConfig,
        lifecycle: watch::Receiver<Visibility>,
    ) -> Self {
        let (snapshot, _) = watch::channel(PresenceSnapshot::default());
        let (state, _) = watch::channel(PresenceState::Idle);
        Self {
            broker,
            peer: Arc::new(AtomicU64::new(peer_id.0)),
            peer_source: None,
            config,
            lifecycle,
            snapshot: Arc::new(snapshot),
            state: Arc::new(state),
            active: tokio::sync::Mutex::new(None),
        }
    }

    /// Follow the peer id assigned to `doc` instead of a fixed one.
    pub fn with_peer_source(mut self, doc: Arc<dyn DocumentHandle>) -> Self {
        self.peer_source = Some(doc);
        self
    }

    /// The peer id the beat is currently written under.
    pub fn peer_id(&self) -> PeerId {
        PeerId(self.peer.load(Ordering::SeqCst))
    }

    pub fn state(&self) -> PresenceState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<PresenceSnapshot> {
        self.snapshot.subscribe()
    }

    pub fn snapshot(&self) -> PresenceSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Start presence for `session` on `client`, disposing any previous run.
    pub async fn schedule(&self, session: SessionId, client: Arc<dyn RelayClient>, room: &str) {
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            self.teardown(previous).await;
        }

        let cancel = CancellationToken::new();
        let channel = Arc::new(Mutex::new(None));
        let run = PresenceRun {
            broker: self.broker.clone(),
            session,
            client,
            room: room.to_string(),
            peer: self.peer.clone(),
            peer_source: self.peer_source.clone(),
            config: self.config.clone(),
            lifecycle: self.lifecycle.clone(),
            snapshot: self.snapshot.clone(),
            state: self.state.clone(),
            channel: channel.clone(),
            cancel: cancel.clone(),
        };
        self.state.send_replace(PresenceState::Scheduled);
        log::debug!("Presence scheduled for session {session}");
        let task = tokio::spawn(run.run());
        *active = Some(ActiveSession {
            session,
            cancel,
            task,
            channel,
        });
    }

    /// Stop presence. Safe to call repeatedly and before setup finished.
    pub async fn dispose(&self) {
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            self.teardown(previous).await;
        }
        self.state.send_replace(PresenceState::Disposed);
    }

    async fn teardown(&self, active: ActiveSession) {
        let ActiveSession {
            session,
            cancel,
            task,
            channel,
        } = active;

        cancel.cancel();
        if let Err(e) = task.await {
            if e.is_panic() {
                log::error!("Presence task for session {session} panicked");
            }
        }

        let failed = self.broker.run_cleanups(session).await;
        if failed > 0 {
            log::debug!("{failed} presence dependents failed to clean up");
        }

        let channel = channel.lock().ok().and_then(|mut c| c.take());
        if let Some(channel) = channel {
            if let Err(e) = channel.delete(&presence_key(self.peer_id())).await {
                log::debug!("Presence beat not removed: {e}");
            }
            channel.destroy().await;
        }
        self.broker.clear(session);
        self.snapshot.send_replace(PresenceSnapshot::default());
        log::debug!("Presence disposed for session {session}");
    }
}

struct PresenceRun {
    broker: Arc<ChannelBroker>,
    session: SessionId,
    client: Arc<dyn RelayClient>,
    room: String,
    peer: Arc<AtomicU64>,
    peer_source: Option<Arc<dyn DocumentHandle>>,
    config: PresenceConfig,
    lifecycle: watch::Receiver<Visibility>,
    snapshot: Arc<watch::Sender<PresenceSnapshot>>,
    state: Arc<watch::Sender<PresenceState>>,
    channel: Arc<Mutex<Option<SharedChannel>>>,
    cancel: CancellationToken,
}

impl PresenceRun {
    async fn run(self) {
        tokio::select! {
            _ = self.cancel.cancelled() => return,
            _ = self.config.deferral.wait() => {}
        }

        let mut status = self.client.status();
        let connected = tokio::select! {
            _ = self.cancel.cancelled() => return,
            ok = wait_connected(&mut status, self.config.connect_timeout) => ok,
        };
        if !connected {
            log::info!("Presence skipped: relay not connected");
            self.abort();
            return;
        }

        let opened = tokio::select! {
            _ = self.cancel.cancelled() => return,
            res = self.client.open_ephemeral(&self.room, self.config.channel_ttl) => res,
        };
        let channel = match opened {
            Ok(channel) => channel,
            Err(e) => {
                log::warn!("Presence channel unavailable: {e}");
                self.abort();
                return;
            }
        };

        // Disposal owns whatever lands in this slot.
        if let Ok(mut slot) = self.channel.lock() {
            *slot = Some(channel.clone());
        }
        if self.cancel.is_cancelled() {
            return;
        }
        self.broker.publish(self.session, channel.clone());
        self.state.send_replace(PresenceState::Running);
        log::debug!("Presence running as peer {}", self.peer_id());

        self.beat(&channel).await;
        self.recompute(&channel);
        self.pump(channel).await;
    }

    async fn pump(&self, channel: SharedChannel) {
        let mut changes = channel.subscribe();
        let period = self.config.heartbeat_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        let mut lifecycle = self.lifecycle.clone();
        let mut visibility = *lifecycle.borrow_and_update();
        let mut lifecycle_open = true;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                change = changes.recv() => match change {
                    Ok(change) if change.key.starts_with(PRESENCE_PREFIX) => self.recompute(&channel),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => self.recompute(&channel),
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = ticker.tick() => {
                    let expired = channel.sweep();
                    if expired > 0 {
                        log::trace!("Swept {expired} expired channel entries");
                    }
                    self.beat(&channel).await;
                    self.recompute(&channel);
                }
                res = lifecycle.changed(), if lifecycle_open => {
                    if res.is_err() {
                        lifecycle_open = false;
                        continue;
                    }
                    let now = *lifecycle.borrow_and_update();
                    if now == Visibility::Visible && visibility != Visibility::Visible {
                        self.beat(&channel).await;
                        self.recompute(&channel);
                    }
                    visibility = now;
                }
            }
        }
    }

    fn peer_id(&self) -> PeerId {
        PeerId(self.peer.load(Ordering::SeqCst))
    }

    async fn beat(&self, channel: &SharedChannel) {
        if let Some(current) = self.peer_source.as_ref().and_then(|doc| doc.peer_id()) {
            let previous = PeerId(self.peer.swap(current.0, Ordering::SeqCst));
            if previous != current {
                log::debug!("Presence peer changed from {previous} to {current}");
                if let Err(e) = channel.delete(&presence_key(previous)).await {
                    log::debug!("Stale presence beat not removed: {e}");
                }
            }
        }
        if let Err(e) = channel.set(&presence_key(self.peer_id()), json!(now_ms())).await {
            log::debug!("Presence beat failed: {e}");
        }
    }

    fn recompute(&self, channel: &SharedChannel) {
        let snapshot = live_peers(
            &channel.entries(),
            self.peer_id(),
            now_ms(),
            self.config.freshness_window,
        );
        self.snapshot.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            *current = snapshot;
            true
        });
    }

    fn abort(&self) {
        self.broker.clear(self.session);
        self.snapshot.send_replace(PresenceSnapshot::default());
        self.state.send_replace(PresenceState::Idle);
    }
}
