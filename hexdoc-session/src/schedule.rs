//! Deferral helpers and the page lifecycle signal.

use std::time::Duration;
use tokio::sync::watch;

/// How non-urgent setup work is pushed off the critical path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deferral {
    /// Run when the executor is next idle.
    Idle,
    /// Fallback when idle scheduling is unsupported: run after a fixed delay.
    Timeout(Duration),
    /// Run immediately.
    None,
}

impl Default for Deferral {
    fn default() -> Self {
        Deferral::Idle
    }
}

impl Deferral {
    pub async fn wait(self) {
        match self {
            Deferral::Idle => tokio::task::yield_now().await,
            Deferral::Timeout(delay) => tokio::time::sleep(delay).await,
            Deferral::None => {}
        }
    }
}

/// Page/tab lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
    /// Suspended by the environment; held resources may be reassigned.
    Frozen,
}

/// Drives [`Visibility`] for everything that reacts to the page lifecycle.
pub struct Lifecycle {
    tx: watch::Sender<Visibility>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Visibility::Visible);
        Self { tx }
    }

    pub fn set(&self, visibility: Visibility) {
        self.tx.send_if_modified(|current| {
            if *current == visibility {
                return false;
            }
            log::debug!("Lifecycle {current:?} -> {visibility:?}");
            *current = visibility;
            true
        });
    }

    pub fn current(&self) -> Visibility {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Visibility> {
        self.tx.subscribe()
    }
}

/// Wait until the watched lifecycle changes into `Visible` from something else.
///
/// Returns `false` once the lifecycle source is gone.
pub async fn regained_visibility(rx: &mut watch::Receiver<Visibility>) -> bool {
    loop {
        let was = *rx.borrow_and_update();
        if rx.changed().await.is_err() {
            return false;
        }
        if was != Visibility::Visible && *rx.borrow() == Visibility::Visible {
            return true;
        }
    }
}
