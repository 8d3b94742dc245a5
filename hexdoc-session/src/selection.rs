//! Selection sync: which block each remote peer has selected.
//!
//! Borrows the presence channel through the [`ChannelBroker`] and owns the
//! single `sel:<self>` key on it. Teardown is registered as a broker cleanup
//! so it always runs before presence destroys the channel.

use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::broker::{ChannelBroker, CleanupId, SessionId};
use crate::document::PeerId;
use crate::ephemeral::{EphemeralError, EphemeralStore, SharedChannel};
use crate::presence::now_ms;

pub const SELECTION_PREFIX: &str = "sel:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionMode {
    #[default]
    Preview,
    Edit,
}

impl SelectionMode {
    /// Unknown modes read as `Preview`.
    pub fn parse(s: &str) -> Self {
        match s {
            "edit" => SelectionMode::Edit,
            _ => SelectionMode::Preview,
        }
    }
}

/// What this peer has selected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSelection {
    pub cid: String,
    pub mode: SelectionMode,
}

impl LocalSelection {
    pub fn new(cid: impl Into<String>, mode: SelectionMode) -> Self {
        Self {
            cid: cid.into(),
            mode,
        }
    }
}

/// What another peer has selected, as read from the channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSelection {
    pub cid: String,
    pub mode: SelectionMode,
    pub updated_at: u64,
}

pub type RemoteSelections = HashMap<PeerId, RemoteSelection>;

pub fn selection_key(peer: PeerId) -> String {
    format!("{SELECTION_PREFIX}{peer}")
}

/// Validate a selection payload. Requires a string `cid` and a numeric
/// `updatedAt`; `mode` falls back to preview.
pub fn parse_selection(value: &Value) -> Option<RemoteSelection> {
    let obj = value.as_object()?;
    let cid = obj.get("cid")?.as_str()?.to_string();
    let updated_at = obj
        .get("updatedAt")?
        .as_f64()
        .filter(|ts| ts.is_finite() && *ts >= 0.0)? as u64;
    let mode = obj
        .get("mode")
        .and_then(Value::as_str)
        .map(SelectionMode::parse)
        .unwrap_or_default();
    Some(RemoteSelection {
        cid,
        mode,
        updated_at,
    })
}

/// Selections of every peer but `self_id` with a valid payload.
pub fn remote_selections(entries: &[(String, Value)], self_id: PeerId) -> RemoteSelections {
    entries
        .iter()
        .filter_map(|(key, value)| {
            let peer: PeerId = key.strip_prefix(SELECTION_PREFIX)?.parse().ok()?;
            if peer == self_id {
                return None;
            }
            Some((peer, parse_selection(value)?))
        })
        .collect()
}

fn encode_local(selection: &LocalSelection) -> Value {
    serde_json::json!({
        "cid": selection.cid,
        "mode": selection.mode,
        "updatedAt": now_ms(),
    })
}

/// What attaching installed. Installed and torn out under one lock, so a
/// dispose either sees all of it or none.
#[derive(Default)]
struct Attachment {
    channel: Option<SharedChannel>,
    listener: Option<JoinHandle<()>>,
    cleanup: Option<CleanupId>,
}

/// Selection state for one session.
pub struct SelectionSync {
    broker: Arc<ChannelBroker>,
    session: SessionId,
    peer_id: PeerId,
    attachment: Mutex<Attachment>,
    local: Mutex<Option<LocalSelection>>,
    remote: Arc<watch::Sender<RemoteSelections>>,
    disposed: AtomicBool,
    closed: CancellationToken,
}

impl SelectionSync {
    /// Create an unattached sync. Local selections set before
    /// [`attach`](Self::attach) are written once the channel is available.
    pub fn new(broker: Arc<ChannelBroker>, session: SessionId, peer_id: PeerId) -> Arc<Self> {
        let (remote, _) = watch::channel(RemoteSelections::new());
        Arc::new(Self {
            broker,
            session,
            peer_id,
            attachment: Mutex::new(Attachment::default()),
            local: Mutex::new(None),
            remote: Arc::new(remote),
            disposed: AtomicBool::new(false),
            closed: CancellationToken::new(),
        })
    }

    /// Create and attach in one step.
    pub async fn start(broker: Arc<ChannelBroker>, session: SessionId, peer_id: PeerId) -> Arc<Self> {
        let sync = Self::new(broker, session, peer_id);
        sync.attach().await;
        sync
    }

    /// Wait for the shared channel. Returns `false` and stays inert if the
    /// channel was cleared or this sync was disposed meanwhile.
    pub async fn attach(self: &Arc<Self>) -> bool {
        let waited = tokio::select! {
            _ = self.closed.cancelled() => None,
            channel = self.broker.wait_for(self.session) => channel,
        };
        let Some(channel) = waited else {
            log::debug!("Selection sync inert: no channel for session {}", self.session);
            return false;
        };

        {
            let Ok(mut attachment) = self.attachment.lock() else {
                return false;
            };
            if self.disposed.load(Ordering::SeqCst) || attachment.channel.is_some() {
                return false;
            }
            let weak: Weak<Self> = Arc::downgrade(self);
            attachment.cleanup = Some(self.broker.add_cleanup(
                self.session,
                Arc::new(move || {
                    let weak = weak.clone();
                    async move {
                        if let Some(sync) = weak.upgrade() {
                            sync.dispose().await;
                        }
                        Ok::<(), EphemeralError>(())
                    }
                    .boxed()
                }),
            ));
            attachment.listener = Some(spawn_listener(
                channel.clone(),
                self.peer_id,
                self.remote.clone(),
            ));
            attachment.channel = Some(channel.clone());
        }

        let pending = self.local.lock().ok().and_then(|l| l.clone());
        if pending.is_some() {
            let _ = self.write(&channel, pending.as_ref()).await;
        }
        log::debug!("Selection sync attached for peer {}", self.peer_id);
        true
    }

    pub fn is_active(&self) -> bool {
        !self.disposed.load(Ordering::SeqCst) && self.current_channel().is_some()
    }

    pub fn subscribe(&self) -> watch::Receiver<RemoteSelections> {
        self.remote.subscribe()
    }

    pub fn remote(&self) -> RemoteSelections {
        self.remote.borrow().clone()
    }

    /// Publish (or clear, with `None`) the local selection.
    ///
    /// A stale remote cursor is harmless, so callers typically discard the
    /// error.
    #[must_use = "selection writes can fail; discard explicitly with `let _ =`"]
    pub async fn update_local_selection(
        &self,
        selection: Option<LocalSelection>,
    ) -> Result<(), EphemeralError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(EphemeralError::Destroyed);
        }
        if let Ok(mut local) = self.local.lock() {
            local.clone_from(&selection);
        }
        match self.current_channel() {
            Some(channel) => self.write(&channel, selection.as_ref()).await,
            None => Ok(()),
        }
    }

    /// Remove the own key and stop listening. Idempotent.
    pub async fn dispose(&self) {
        let attachment = {
            let mut attachment = self.attachment.lock().unwrap_or_else(|e| e.into_inner());
            if self.disposed.swap(true, Ordering::SeqCst) {
                return;
            }
            std::mem::take(&mut *attachment)
        };
        self.closed.cancel();

        let Attachment {
            channel,
            listener,
            cleanup,
        } = attachment;
        if let Some(listener) = listener {
            listener.abort();
        }
        if let Some(id) = cleanup {
            self.broker.remove_cleanup(self.session, id);
        }
        if let Some(channel) = channel {
            if let Err(e) = channel.delete(&selection_key(self.peer_id)).await {
                log::debug!("Selection key not removed: {e}");
            }
        }
        self.remote.send_replace(RemoteSelections::new());
    }

    fn current_channel(&self) -> Option<SharedChannel> {
        self.attachment.lock().ok().and_then(|a| a.channel.clone())
    }

    async fn write(
        &self,
        channel: &SharedChannel,
        selection: Option<&LocalSelection>,
    ) -> Result<(), EphemeralError> {
        let key = selection_key(self.peer_id);
        let written = match selection {
            Some(selection) => channel.set(&key, encode_local(selection)).await,
            None => channel.delete(&key).await,
        };
        // A dispose that ran during the write has already deleted the key.
        if selection.is_some() && self.disposed.load(Ordering::SeqCst) {
            let _ = channel.delete(&key).await;
        }
        written
    }
}

fn spawn_listener(
    channel: SharedChannel,
    peer_id: PeerId,
    remote: Arc<watch::Sender<RemoteSelections>>,
) -> JoinHandle<()> {
    let mut changes = channel.subscribe();
    let refresh = move |channel: &dyn EphemeralStore| {
        let next = remote_selections(&channel.entries(), peer_id);
        remote.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    };
    refresh(channel.as_ref());
    tokio::spawn(async move {
        loop {
            // Any change refreshes, so entries that expired drop out too.
            match changes.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => refresh(channel.as_ref()),
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
