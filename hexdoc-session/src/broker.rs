//! Per-session registry for the shared ephemeral channel.
//!
//! Presence opens the channel; selection sync (and any later consumer)
//! borrows it from here instead of opening its own relay subscription.
//!
//! ```text
//!   PresenceScheduler ── publish ──►┌──────────────┐◄── wait_for ── SelectionSync
//!                                   │ ChannelBroker│
//!   PresenceScheduler ── clear ────►│  SessionId → │── cleanups ──► SelectionSync::dispose
//!                                   └──────────────┘
//! ```
//!
//! Whichever side starts first, the waiter resolves once the channel is
//! published, or with `None` once it is cleared.
//!
//! A finished session is [`forget`](ChannelBroker::forget)-ed: its slot is
//! dropped and the id is remembered in a bounded list of retired sessions, so
//! late callers still see it as cleared.

use futures_util::future::{join_all, BoxFuture};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::ephemeral::{EphemeralError, SharedChannel};

/// Opaque identity of one connection session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle returned by [`ChannelBroker::add_cleanup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CleanupId(u64);

/// A dependent teardown step run before the channel is destroyed.
pub type CleanupFn = Arc<dyn Fn() -> BoxFuture<'static, Result<(), EphemeralError>> + Send + Sync>;

#[derive(Default)]
struct Slot {
    channel: Option<SharedChannel>,
    cleared: bool,
    waiters: Vec<oneshot::Sender<Option<SharedChannel>>>,
    cleanups: Vec<(CleanupId, CleanupFn)>,
}

/// Retired session ids remembered after [`ChannelBroker::forget`].
pub const RETIRED_CAPACITY: usize = 256;

#[derive(Default)]
struct Registry {
    slots: HashMap<SessionId, Slot>,
    retired: VecDeque<SessionId>,
}

impl Registry {
    fn is_retired(&self, session: SessionId) -> bool {
        self.retired.contains(&session)
    }

    /// Slot for a live session; `None` once the session was forgotten.
    fn live_slot(&mut self, session: SessionId) -> Option<&mut Slot> {
        if self.is_retired(session) {
            return None;
        }
        Some(self.slots.entry(session).or_default())
    }
}

/// Registry of shared channels keyed by [`SessionId`].
#[derive(Default)]
pub struct ChannelBroker {
    slots: Mutex<Registry>,
    next_cleanup: AtomicU64,
}

impl ChannelBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `channel` available for `session` and wake pending waiters.
    pub fn publish(&self, session: SessionId, channel: SharedChannel) {
        let waiters = {
            let Ok(mut registry) = self.slots.lock() else {
                return;
            };
            let Some(slot) = registry.live_slot(session) else {
                log::debug!("Ignoring publish for retired session {session}");
                return;
            };
            slot.channel = Some(channel.clone());
            slot.cleared = false;
            std::mem::take(&mut slot.waiters)
        };
        log::debug!("Ephemeral channel published for session {session}");
        for waiter in waiters {
            let _ = waiter.send(Some(channel.clone()));
        }
    }

    /// Mark the channel unavailable. Pending and future waiters get `None`
    /// until the next [`publish`](Self::publish).
    pub fn clear(&self, session: SessionId) {
        let waiters = {
            let Ok(mut registry) = self.slots.lock() else {
                return;
            };
            let Some(slot) = registry.live_slot(session) else {
                return;
            };
            slot.channel = None;
            slot.cleared = true;
            std::mem::take(&mut slot.waiters)
        };
        log::debug!("Ephemeral channel cleared for session {session}");
        for waiter in waiters {
            let _ = waiter.send(None);
        }
    }

    /// The channel if currently published.
    pub fn current(&self, session: SessionId) -> Option<SharedChannel> {
        self.slots
            .lock()
            .ok()
            .and_then(|registry| registry.slots.get(&session).and_then(|s| s.channel.clone()))
    }

    /// Whether `clear` (or `forget`) was the last thing that happened to
    /// this slot.
    pub fn is_cleared(&self, session: SessionId) -> bool {
        self.slots
            .lock()
            .map(|registry| {
                registry.is_retired(session)
                    || registry.slots.get(&session).is_some_and(|s| s.cleared)
            })
            .unwrap_or(false)
    }

    /// Resolve with the channel once published, or `None` once cleared.
    pub async fn wait_for(&self, session: SessionId) -> Option<SharedChannel> {
        let rx = {
            let mut registry = self.slots.lock().ok()?;
            let slot = registry.live_slot(session)?;
            if let Some(channel) = &slot.channel {
                return Some(channel.clone());
            }
            if slot.cleared {
                return None;
            }
            let (tx, rx) = oneshot::channel();
            slot.waiters.push(tx);
            rx
        };
        rx.await.ok().flatten()
    }

    /// Register a step to run before the channel owner tears it down.
    pub fn add_cleanup(&self, session: SessionId, cleanup: CleanupFn) -> CleanupId {
        let id = CleanupId(self.next_cleanup.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut registry) = self.slots.lock() {
            if let Some(slot) = registry.live_slot(session) {
                slot.cleanups.push((id, cleanup));
            }
        }
        id
    }

    pub fn remove_cleanup(&self, session: SessionId, id: CleanupId) -> bool {
        let Ok(mut registry) = self.slots.lock() else {
            return false;
        };
        match registry.slots.get_mut(&session) {
            Some(slot) => {
                let before = slot.cleanups.len();
                slot.cleanups.retain(|(cid, _)| *cid != id);
                slot.cleanups.len() != before
            }
            None => false,
        }
    }

    /// Cleanups registered and not yet run.
    pub fn pending_cleanups(&self, session: SessionId) -> usize {
        self.slots
            .lock()
            .ok()
            .and_then(|registry| registry.slots.get(&session).map(|s| s.cleanups.len()))
            .unwrap_or(0)
    }

    /// Run and drop every registered cleanup. All of them are awaited even
    /// if some fail; failures are logged. Returns how many failed.
    pub async fn run_cleanups(&self, session: SessionId) -> usize {
        let cleanups = match self.slots.lock() {
            Ok(mut registry) => registry
                .slots
                .get_mut(&session)
                .map(|s| std::mem::take(&mut s.cleanups))
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        };
        if cleanups.is_empty() {
            return 0;
        }

        let results = join_all(cleanups.iter().map(|(_, f)| f())).await;
        let failed = results.iter().filter(|r| r.is_err()).count();
        for err in results.into_iter().filter_map(Result::err) {
            log::warn!("Ephemeral cleanup for session {session} failed: {err}");
        }
        failed
    }

    /// Drop all state for a finished session. Pending waiters resolve with
    /// `None`; later calls treat the session as cleared and never recreate
    /// its slot.
    pub fn forget(&self, session: SessionId) {
        let slot = {
            let Ok(mut registry) = self.slots.lock() else {
                return;
            };
            if !registry.is_retired(session) {
                if registry.retired.len() >= RETIRED_CAPACITY {
                    registry.retired.pop_front();
                }
                registry.retired.push_back(session);
            }
            registry.slots.remove(&session)
        };
        if let Some(slot) = slot {
            for waiter in slot.waiters {
                let _ = waiter.send(None);
            }
        }
    }

    /// Number of sessions with any broker state.
    pub fn session_count(&self) -> usize {
        self.slots.lock().map(|r| r.slots.len()).unwrap_or(0)
    }
}
