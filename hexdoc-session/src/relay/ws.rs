//! WebSocket relay client.
//!
//! Provides:
//! - Connection lifecycle (connect, reconnect, destroy) with status and latency watches
//! - Room join with convergence tracking and local change forwarding
//! - Offline queueing of local changes, replayed after reconnecting
//! - Ephemeral channels mirrored over the same socket
//!
//! ```text
//!            ┌──────────── writer task ◄── outgoing mpsc ◄── rooms / channels / pings
//! socket ────┤
//!            └──────────── reader task ──► Welcome/Update ──► DocumentHandle::apply_remote
//!                                      ──► Ephemeral      ──► MemoryEphemeralStore::apply_remote
//!                                      ──► Pong           ──► latency watch
//!
//! reader ends ─► Disconnected ─► backoff ─► Connecting ─► re-Join rooms
//!                                   ▲                        │
//!                                   └──── open failed ◄──────┤
//!                                                            ▼
//!                                        replay OfflineQueue ─► Connected
//! ```
//!
//! Only a connection that was established once is re-established; a failed
//! initial [`connect`](RelayClient::connect) is reported to the caller.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;

use super::protocol::{decode_ephemeral_value, RelayMessage};
use super::{ConnectionStatus, RelayClient, RelayConnector, RelayError, RelayRoom};
use crate::document::{ChangeOrigin, DocumentHandle};
use crate::ephemeral::{MemoryEphemeralStore, SharedChannel};

/// WebSocket client configuration.
#[derive(Debug, Clone)]
pub struct WsRelayConfig {
    /// Interval between latency pings.
    pub ping_interval: Duration,
    /// Outgoing frame queue depth.
    pub outgoing_capacity: usize,
    /// First delay before reconnecting; doubles per failed attempt.
    pub reconnect_initial: Duration,
    /// Upper bound on the reconnect delay.
    pub reconnect_max: Duration,
    /// Local updates kept while disconnected. Past this the whole document
    /// state is sent on reconnect instead.
    pub offline_capacity: usize,
}

impl Default for WsRelayConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(5),
            outgoing_capacity: 256,
            reconnect_initial: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(30),
            offline_capacity: 10_000,
        }
    }
}

impl WsRelayConfig {
    pub fn for_testing() -> Self {
        Self {
            ping_interval: Duration::from_millis(50),
            outgoing_capacity: 64,
            reconnect_initial: Duration::from_millis(20),
            reconnect_max: Duration::from_millis(200),
            offline_capacity: 1024,
        }
    }

    /// Delay before reconnect attempt `attempt` (zero-based).
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        self.reconnect_initial
            .saturating_mul(1u32 << attempt.min(16))
            .min(self.reconnect_max)
    }
}

// ───────────────────────────────────────────────────────────────────
// Offline queue
// ───────────────────────────────────────────────────────────────────

/// Local updates made while disconnected, replayed in order on reconnect.
pub struct OfflineQueue {
    queue: VecDeque<QueuedUpdate>,
    max_size: usize,
    overflowed: bool,
}

#[derive(Debug, Clone)]
struct QueuedUpdate {
    room: String,
    payload: Vec<u8>,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
            overflowed: false,
        }
    }

    /// Queue an update for replay. Returns `false` once full; the queue is
    /// then marked overflowed until drained.
    pub fn enqueue(&mut self, room: &str, payload: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            self.overflowed = true;
            return false;
        }
        self.queue.push_back(QueuedUpdate {
            room: room.to_string(),
            payload,
        });
        true
    }

    /// Take every queued update, oldest first, and reset the overflow mark.
    pub fn drain(&mut self) -> Vec<(String, Vec<u8>)> {
        self.overflowed = false;
        self.queue.drain(..).map(|u| (u.room, u.payload)).collect()
    }

    /// Some updates were dropped since the last drain.
    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.overflowed = false;
    }

    /// Total bytes queued.
    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|u| u.payload.len()).sum()
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct SyncProgress {
    /// Version reported in the relay's `Welcome`.
    target: Option<u64>,
    /// Highest version applied locally.
    observed: u64,
}

impl SyncProgress {
    fn converged(&self) -> bool {
        self.target.is_some_and(|t| self.observed >= t)
    }
}

struct RoomState {
    name: String,
    doc: Arc<dyn DocumentHandle>,
    progress: watch::Sender<SyncProgress>,
    attached: AtomicBool,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl RoomState {
    fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    fn stop_forwarding(&self) {
        self.attached.store(false, Ordering::SeqCst);
        if let Ok(mut forwarder) = self.forwarder.lock() {
            if let Some(task) = forwarder.take() {
                task.abort();
            }
        }
    }

    fn apply(&self, version: u64, update: &[u8]) {
        if !self.attached.load(Ordering::SeqCst) {
            return;
        }
        if !update.is_empty() {
            if let Err(e) = self.doc.apply_remote(update) {
                log::warn!("Dropping update v{version} for room {}: {e}", self.name);
                return;
            }
        }
        self.progress.send_modify(|p| p.observed = p.observed.max(version));
    }
}

type PendingPing = (Instant, oneshot::Sender<Duration>);

struct Shared {
    config: WsRelayConfig,
    url: Mutex<Option<String>>,
    outgoing: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    offline: tokio::sync::Mutex<OfflineQueue>,
    rooms: Mutex<HashMap<String, Arc<RoomState>>>,
    channels: Mutex<HashMap<String, Vec<Arc<MemoryEphemeralStore>>>>,
    pending_pings: Mutex<HashMap<u64, PendingPing>>,
    next_nonce: AtomicU64,
    status: watch::Sender<ConnectionStatus>,
    latency: watch::Sender<Option<Duration>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    pinger: Mutex<Option<AbortHandle>>,
    destroyed: AtomicBool,
}

impl Shared {
    fn is_connected(&self) -> bool {
        *self.status.borrow() == ConnectionStatus::Connected
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Open the socket and start the reader and writer. Leaves the status
    /// to the caller.
    async fn open(self: &Arc<Self>, url: &str) -> Result<(), RelayError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| RelayError::Connect(e.to_string()))?;
        if self.is_destroyed() {
            return Err(RelayError::Destroyed);
        }
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(self.config.outgoing_capacity);
        if let Ok(mut outgoing) = self.outgoing.lock() {
            *outgoing = Some(out_tx);
        }

        let writer = tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });
        self.track(writer);

        let shared = self.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(Message::Binary(data)) => match RelayMessage::decode(&data) {
                        Ok(msg) => shared.handle(msg).await,
                        Err(e) => log::debug!("Ignoring undecodable frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            log::info!("Relay connection closed");
            shared.connection_lost();
            if !shared.is_destroyed() {
                shared.spawn_reconnect();
            }
        });
        self.track(reader);
        Ok(())
    }

    fn spawn_reconnect(self: &Arc<Self>) {
        let task = tokio::spawn(reconnect(Arc::downgrade(self)));
        self.track(task);
    }

    /// Re-join every attached room and replay what was queued offline, then
    /// report `Connected`. Local changes wait on the queue lock meanwhile.
    async fn resync(&self) {
        let rooms: Vec<Arc<RoomState>> = self
            .rooms
            .lock()
            .map(|r| r.values().filter(|s| s.is_attached()).cloned().collect())
            .unwrap_or_default();
        let mut offline = self.offline.lock().await;
        let overflowed = offline.overflowed();
        let queued = offline.drain();

        for room in &rooms {
            room.progress.send_modify(|p| p.target = None);
            let join = RelayMessage::Join {
                room: room.name.clone(),
                peer: room.doc.peer_id(),
            };
            if let Err(e) = self.send(&join).await {
                log::warn!("Rejoin of room {} failed: {e}", room.name);
                continue;
            }
            if overflowed {
                let full = RelayMessage::Update {
                    room: room.name.clone(),
                    version: 0,
                    update: room.doc.export_snapshot(),
                };
                if let Err(e) = self.send(&full).await {
                    log::warn!("Full state of room {} not sent: {e}", room.name);
                }
            }
        }

        let mut replayed = 0usize;
        if !overflowed {
            for (room, update) in queued {
                if !rooms.iter().any(|r| r.name == room) {
                    continue;
                }
                let msg = RelayMessage::Update {
                    room,
                    version: 0,
                    update,
                };
                match self.send(&msg).await {
                    Ok(()) => replayed += 1,
                    Err(e) => log::warn!("Queued update not replayed: {e}"),
                }
            }
        }
        log::info!(
            "Rejoined {} rooms, replayed {replayed} queued updates{}",
            rooms.len(),
            if overflowed { " (sent full state)" } else { "" }
        );
        self.status.send_replace(ConnectionStatus::Connected);
    }

    /// Send a local update now, or queue it while disconnected.
    async fn forward(&self, room: &str, update: Vec<u8>) {
        let msg = {
            let mut offline = self.offline.lock().await;
            if !self.is_connected() {
                if !offline.enqueue(room, update) {
                    log::warn!("Offline queue full, room {room} will resend its full state");
                }
                return;
            }
            RelayMessage::Update {
                room: room.to_string(),
                version: 0,
                update,
            }
        };
        if let Err(e) = self.send(&msg).await {
            log::debug!("Local update queued after send failure: {e}");
            if let RelayMessage::Update { room, update, .. } = msg {
                self.offline.lock().await.enqueue(&room, update);
            }
        }
    }

    /// Start latency pings for the current connection, replacing the loop of
    /// an earlier one.
    fn spawn_ping_loop(self: &Arc<Self>) {
        let shared = Arc::downgrade(self);
        let period = self.config.ping_interval;
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                if !shared.is_connected() {
                    break;
                }
                if let Ok(mut pending) = shared.pending_pings.lock() {
                    pending.retain(|_, (sent_at, _)| sent_at.elapsed() < period * 4);
                }
                if shared.ping().await.is_err() {
                    break;
                }
            }
        });
        if let Ok(mut pinger) = self.pinger.lock() {
            if let Some(previous) = pinger.replace(task.abort_handle()) {
                previous.abort();
            }
        }
        self.track(task);
    }

    async fn send(&self, msg: &RelayMessage) -> Result<(), RelayError> {
        let tx = self
            .outgoing
            .lock()
            .ok()
            .and_then(|o| o.clone())
            .ok_or(RelayError::NotConnected)?;
        let encoded = msg.encode()?;
        tx.send(encoded).await.map_err(|_| RelayError::NotConnected)
    }

    async fn ping(&self) -> Result<oneshot::Receiver<Duration>, RelayError> {
        let nonce = self.next_nonce.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending_pings.lock() {
            pending.insert(nonce, (Instant::now(), tx));
        }
        self.send(&RelayMessage::Ping { nonce }).await?;
        Ok(rx)
    }

    async fn handle(&self, msg: RelayMessage) {
        match msg {
            RelayMessage::Welcome {
                room,
                version,
                update,
            } => {
                if let Some(state) = self.room(&room) {
                    state.progress.send_modify(|p| p.target = Some(version));
                    state.apply(version, &update);
                    log::debug!("Joined room {room} at version {version}");
                }
            }
            RelayMessage::Update {
                room,
                version,
                update,
            } => {
                if let Some(state) = self.room(&room) {
                    state.apply(version, &update);
                }
            }
            RelayMessage::Ephemeral { room, key, value } => {
                let value = match value.as_deref().map(decode_ephemeral_value).transpose() {
                    Ok(v) => v,
                    Err(e) => {
                        log::debug!("Ignoring ephemeral write for {key}: {e}");
                        return;
                    }
                };
                let targets = match self.channels.lock() {
                    Ok(mut channels) => channels
                        .get_mut(&room)
                        .map(|list| {
                            list.retain(|c| !c.is_destroyed());
                            list.clone()
                        })
                        .unwrap_or_default(),
                    Err(_) => Vec::new(),
                };
                for channel in targets {
                    channel.apply_remote(key.clone(), value.clone());
                }
            }
            RelayMessage::Pong { nonce } => {
                let pending = self
                    .pending_pings
                    .lock()
                    .ok()
                    .and_then(|mut p| p.remove(&nonce));
                if let Some((sent_at, tx)) = pending {
                    let rtt = sent_at.elapsed();
                    self.latency.send_replace(Some(rtt));
                    let _ = tx.send(rtt);
                }
            }
            RelayMessage::Ping { nonce } => {
                let _ = self.send(&RelayMessage::Pong { nonce }).await;
            }
            RelayMessage::Join { .. } | RelayMessage::Leave { .. } => {}
        }
    }

    fn room(&self, name: &str) -> Option<Arc<RoomState>> {
        self.rooms.lock().ok().and_then(|r| r.get(name).cloned())
    }

    fn connection_lost(&self) {
        if let Ok(mut outgoing) = self.outgoing.lock() {
            outgoing.take();
        }
        if let Ok(mut pending) = self.pending_pings.lock() {
            pending.clear();
        }
        self.latency.send_replace(None);
        self.status.send_replace(ConnectionStatus::Disconnected);
    }

    fn track(&self, task: JoinHandle<()>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.retain(|t| !t.is_finished());
            tasks.push(task);
        }
    }
}

/// Re-establish a lost connection, backing off between failed attempts,
/// until it succeeds or the client is destroyed.
async fn reconnect(shared: Weak<Shared>) {
    let mut attempt = 0u32;
    loop {
        let (delay, url) = match shared.upgrade() {
            Some(s) if !s.is_destroyed() => (
                s.config.reconnect_delay(attempt),
                s.url.lock().ok().and_then(|u| u.clone()),
            ),
            _ => return,
        };
        let Some(url) = url else {
            return;
        };
        tokio::time::sleep(delay).await;

        let Some(s) = shared.upgrade() else {
            return;
        };
        if s.is_destroyed() {
            return;
        }
        s.status.send_replace(ConnectionStatus::Connecting);
        match s.open(&url).await {
            Ok(()) => {
                s.resync().await;
                s.spawn_ping_loop();
                log::info!("Reconnected to relay after {} attempts", attempt + 1);
                return;
            }
            Err(e) => {
                s.status.send_replace(ConnectionStatus::Disconnected);
                attempt = attempt.saturating_add(1);
                log::debug!("Reconnect attempt {attempt} failed: {e}");
            }
        }
    }
}

/// Relay client over a single WebSocket.
pub struct WsRelayClient {
    shared: Arc<Shared>,
}

impl WsRelayClient {
    pub fn new(config: WsRelayConfig) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        let (latency, _) = watch::channel(None);
        Self {
            shared: Arc::new(Shared {
                offline: tokio::sync::Mutex::new(OfflineQueue::new(config.offline_capacity)),
                config,
                url: Mutex::new(None),
                outgoing: Mutex::new(None),
                rooms: Mutex::new(HashMap::new()),
                channels: Mutex::new(HashMap::new()),
                pending_pings: Mutex::new(HashMap::new()),
                next_nonce: AtomicU64::new(1),
                status,
                latency,
                tasks: Mutex::new(Vec::new()),
                pinger: Mutex::new(None),
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    /// Local updates waiting for the connection to come back.
    pub async fn queued_updates(&self) -> usize {
        self.shared.offline.lock().await.len()
    }
}

#[async_trait]
impl RelayClient for WsRelayClient {
    async fn connect(&self, url: &str) -> Result<(), RelayError> {
        if self.shared.is_destroyed() {
            return Err(RelayError::Destroyed);
        }
        self.shared.status.send_replace(ConnectionStatus::Connecting);
        if let Ok(mut stored) = self.shared.url.lock() {
            *stored = Some(url.to_string());
        }
        if let Err(e) = self.shared.open(url).await {
            if !matches!(e, RelayError::Destroyed) {
                self.shared.connection_lost();
            }
            return Err(e);
        }
        self.shared.status.send_replace(ConnectionStatus::Connected);
        self.shared.spawn_ping_loop();
        log::info!("Connected to relay");
        Ok(())
    }

    fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    fn latency(&self) -> watch::Receiver<Option<Duration>> {
        self.shared.latency.subscribe()
    }

    async fn join(
        &self,
        room: &str,
        doc: Arc<dyn DocumentHandle>,
    ) -> Result<Arc<dyn RelayRoom>, RelayError> {
        if !self.shared.is_connected() {
            return Err(RelayError::NotConnected);
        }
        let (progress, _) = watch::channel(SyncProgress::default());
        let state = Arc::new(RoomState {
            name: room.to_string(),
            doc: doc.clone(),
            progress,
            attached: AtomicBool::new(true),
            forwarder: Mutex::new(None),
        });
        if let Ok(mut rooms) = self.shared.rooms.lock() {
            if let Some(previous) = rooms.insert(room.to_string(), state.clone()) {
                previous.stop_forwarding();
            }
        }

        let mut changes = doc.subscribe();
        let shared = self.shared.clone();
        let forward_state = state.clone();
        let forwarder = tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) if change.origin == ChangeOrigin::Local => {
                        if !forward_state.is_attached() {
                            break;
                        }
                        shared
                            .forward(&forward_state.name, change.update.to_vec())
                            .await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Forwarder for room {} lagged by {n} changes", forward_state.name);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        if let Ok(mut slot) = state.forwarder.lock() {
            *slot = Some(forwarder);
        }

        let join = RelayMessage::Join {
            room: room.to_string(),
            peer: doc.peer_id(),
        };
        if let Err(e) = self.shared.send(&join).await {
            state.stop_forwarding();
            if let Ok(mut rooms) = self.shared.rooms.lock() {
                rooms.remove(room);
            }
            return Err(RelayError::Join {
                room: room.to_string(),
                reason: e.to_string(),
            });
        }

        Ok(Arc::new(WsRoom {
            shared: self.shared.clone(),
            state,
        }))
    }

    async fn open_ephemeral(&self, room: &str, ttl: Duration) -> Result<SharedChannel, RelayError> {
        if !self.shared.is_connected() {
            return Err(RelayError::NotConnected);
        }
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let channel = Arc::new(MemoryEphemeralStore::with_outbound(ttl, out_tx));
        if let Ok(mut channels) = self.shared.channels.lock() {
            channels.entry(room.to_string()).or_default().push(channel.clone());
        }

        let shared = Arc::downgrade(&self.shared);
        let room_name = room.to_string();
        let task = tokio::spawn(async move {
            while let Some(change) = out_rx.recv().await {
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                match RelayMessage::ephemeral(&room_name, change.key, change.value.as_ref()) {
                    Ok(msg) => {
                        let _ = shared.send(&msg).await;
                    }
                    Err(e) => log::debug!("Ephemeral write not mirrored: {e}"),
                }
            }
        });
        self.shared.track(task);
        Ok(channel)
    }

    async fn destroy(&self) {
        if self.shared.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        let rooms: Vec<_> = self
            .shared
            .rooms
            .lock()
            .map(|mut r| r.drain().map(|(_, s)| s).collect())
            .unwrap_or_default();
        for room in rooms {
            room.stop_forwarding();
        }
        let channels: Vec<_> = self
            .shared
            .channels
            .lock()
            .map(|mut c| c.drain().flat_map(|(_, list)| list).collect())
            .unwrap_or_default();
        for channel in channels {
            crate::ephemeral::EphemeralStore::destroy(channel.as_ref()).await;
        }
        self.shared.offline.lock().await.clear();
        self.shared.connection_lost();
        let tasks: Vec<_> = self
            .shared
            .tasks
            .lock()
            .map(|mut t| t.drain(..).collect())
            .unwrap_or_default();
        for task in tasks {
            task.abort();
        }
        log::debug!("Relay client destroyed");
    }
}

struct WsRoom {
    shared: Arc<Shared>,
    state: Arc<RoomState>,
}

#[async_trait]
impl RelayRoom for WsRoom {
    async fn wait_for_convergence(&self) -> Result<(), RelayError> {
        let mut progress = self.state.progress.subscribe();
        let mut status = self.shared.status.subscribe();
        tokio::select! {
            res = progress.wait_for(SyncProgress::converged) => {
                res.map(|_| ()).map_err(|_| RelayError::Destroyed)
            }
            _ = status.wait_for(|s| *s == ConnectionStatus::Disconnected) => {
                Err(RelayError::NotConnected)
            }
        }
    }

    async fn ping(&self) -> Result<Duration, RelayError> {
        let rx = self.shared.ping().await?;
        rx.await.map_err(|_| RelayError::NotConnected)
    }

    async fn leave(&self) -> Result<(), RelayError> {
        self.state.stop_forwarding();
        if let Ok(mut rooms) = self.shared.rooms.lock() {
            if rooms
                .get(&self.state.name)
                .is_some_and(|r| Arc::ptr_eq(r, &self.state))
            {
                rooms.remove(&self.state.name);
            }
        }
        self.shared
            .send(&RelayMessage::Leave {
                room: self.state.name.clone(),
            })
            .await
    }

    fn detach(&self) {
        self.state.stop_forwarding();
    }
}

/// Creates [`WsRelayClient`]s.
#[derive(Debug, Clone, Default)]
pub struct WsConnector {
    pub config: WsRelayConfig,
}

impl WsConnector {
    pub fn new(config: WsRelayConfig) -> Self {
        Self { config }
    }
}

impl RelayConnector for WsConnector {
    fn create(&self) -> Arc<dyn RelayClient> {
        Arc::new(WsRelayClient::new(self.config.clone()))
    }
}
