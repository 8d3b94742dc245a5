//! End-to-end session scenarios against the in-memory relay.

mod common;

use common::{fresh_keys, init_logging, runtime, Behavior, FakeRelay, RecordingLocks, SharedRelay};
use hexdoc_session::{
    Advisory, ConnectionSession, ConnectionStatus, CryptoSupport, DocumentHandle,
    LocalReplicaLocks, PresenceState, SessionConfig, SessionIdentity, SessionPhase, SessionRuntime,
    StaticWelcome, StoreConfig, Visibility, WorkspaceKeys, YrsDocument,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

const RELAY: &str = "ws://relay.test";

fn config() -> SessionConfig {
    SessionConfig::for_testing(RELAY)
}

async fn wait_phase(handle: &hexdoc_session::SessionHandle, phase: SessionPhase) {
    let mut rx = handle.subscribe();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| s.phase == phase))
        .await
        .expect("phase reached in time")
        .expect("status channel open");
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

// ─── Happy path ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_session_converges_and_tears_down_in_order() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let relay = FakeRelay::new(Behavior::Healthy);
    let (runtime, locks) = runtime(&relay, &dir);
    let runtime = Arc::new(runtime);

    let keys = fresh_keys();
    let shouting = WorkspaceKeys {
        public_hex: format!("  {}", keys.public_hex.to_uppercase()),
        private_hex: keys.private_hex.to_uppercase(),
    };
    let doc = Arc::new(YrsDocument::new());
    let handle = ConnectionSession::open(runtime.clone(), shouting, doc.clone(), config());

    assert!(handle.wait_ready().await);
    assert!(handle.is_ready());
    assert_eq!(handle.status().status, ConnectionStatus::Connected);

    // Canonical identity comes from the key material, not the route text.
    match handle.identity() {
        SessionIdentity::Ready {
            keys: canonical,
            share_url,
            degraded,
        } => {
            assert_eq!(canonical, keys);
            assert!(!degraded);
            assert_eq!(
                share_url,
                format!("http://localhost:8080/{}#{}", keys.public_hex, keys.private_hex)
            );
        }
        other => panic!("unexpected identity {other:?}"),
    }

    let urls = relay.urls();
    assert_eq!(urls.len(), 1);
    let prefix = format!("{RELAY}/ws/{}?token=", keys.public_hex);
    assert!(urls[0].starts_with(&prefix));
    assert_eq!(urls[0].len(), prefix.len() + 128);

    assert!(handle.has_lease());
    assert_eq!(locks.held_count(&keys.public_hex), 1);
    assert!(handle.peer_id().is_some());

    let presence = handle.presence().expect("presence scheduled");
    assert!(eventually(|| presence.state() == PresenceState::Running).await);
    assert_eq!(presence.snapshot().total, 1);
    let selection = handle.selection().expect("selection started");
    assert!(eventually(|| selection.is_active()).await);

    handle.teardown().await;

    let client = relay.client(0);
    let room = client.room.lock().unwrap().clone().unwrap();
    assert!(room.left.load(Ordering::SeqCst));
    assert!(room.detached.load(Ordering::SeqCst));
    assert!(client.is_destroyed());
    assert_eq!(locks.held_count(&keys.public_hex), 0);
    assert!(!handle.has_lease());
    assert!(runtime.broker().is_cleared(handle.session_id()));
    assert_eq!(presence.state(), PresenceState::Disposed);
    assert_eq!(handle.status().phase, SessionPhase::TornDown);
    assert_eq!(handle.status().status, ConnectionStatus::Disconnected);

    // At most once.
    handle.teardown().await;
    assert_eq!(handle.status().phase, SessionPhase::TornDown);
}

#[tokio::test]
async fn test_status_follows_connection_drops() {
    let dir = tempfile::tempdir().unwrap();
    let relay = FakeRelay::new(Behavior::Healthy);
    let (runtime, _) = runtime(&relay, &dir);
    let handle = ConnectionSession::open(
        Arc::new(runtime),
        fresh_keys(),
        Arc::new(YrsDocument::new()),
        config(),
    );
    assert!(handle.wait_ready().await);

    // The post-convergence ping lands first.
    assert!(eventually(|| handle.status().latency == Some(Duration::from_millis(1))).await);

    let client = relay.client(0);
    client.report_latency(Duration::from_millis(42));
    assert!(eventually(|| handle.status().latency == Some(Duration::from_millis(42))).await);

    client.drop_connection();
    wait_phase(&handle, SessionPhase::Reconnecting).await;
    assert_eq!(handle.status().status, ConnectionStatus::Disconnected);
    // The client still holds its last sample; the session does not show it.
    assert_eq!(handle.status().latency, None);
    client.report_latency(Duration::from_millis(7));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handle.status().latency, None);

    client.restore_connection();
    wait_phase(&handle, SessionPhase::Converged).await;
    assert!(eventually(|| handle.status().latency == Some(Duration::from_millis(7))).await);
    // Converged again only after waiting on the re-joined room.
    let room = client.room.lock().unwrap().clone().unwrap();
    assert_eq!(room.convergence_waits.load(Ordering::SeqCst), 2);
    handle.teardown().await;
}

#[tokio::test]
async fn test_reconnect_waits_for_room_before_converging() {
    let dir = tempfile::tempdir().unwrap();
    let relay = FakeRelay::new(Behavior::Healthy);
    let (runtime, _) = runtime(&relay, &dir);
    let handle = ConnectionSession::open(
        Arc::new(runtime),
        fresh_keys(),
        Arc::new(YrsDocument::new()),
        config(),
    );
    assert!(handle.wait_ready().await);

    let client = relay.client(0);
    for _ in 0..3 {
        client.drop_connection();
        wait_phase(&handle, SessionPhase::Reconnecting).await;
        client.restore_connection();
        wait_phase(&handle, SessionPhase::Converged).await;
        assert_eq!(handle.status().status, ConnectionStatus::Connected);
    }
    let room = client.room.lock().unwrap().clone().unwrap();
    assert_eq!(room.convergence_waits.load(Ordering::SeqCst), 4);
    assert_eq!(client.joins(), 1);
    handle.teardown().await;
}

// ─── Degraded and failing paths ─────────────────────────────────────

#[tokio::test]
async fn test_missing_crypto_runs_offline_on_fallback_identity() {
    let dir = tempfile::tempdir().unwrap();
    let relay = FakeRelay::new(Behavior::Healthy);
    let (runtime, _) = runtime(&relay, &dir);
    let runtime = Arc::new(runtime.with_crypto(CryptoSupport::Unavailable));

    let handle = ConnectionSession::open(
        runtime.clone(),
        fresh_keys(),
        Arc::new(YrsDocument::new()),
        config(),
    );
    assert!(!handle.wait_ready().await);

    let status = handle.status();
    assert_eq!(status.phase, SessionPhase::Offline);
    assert_eq!(status.status, ConnectionStatus::Disconnected);
    assert_eq!(relay.created(), 0);
    assert!(relay.urls().is_empty());
    match handle.identity() {
        SessionIdentity::Ready { keys, degraded, .. } => {
            assert!(degraded);
            assert_eq!(keys.public_hex, WorkspaceKeys::fallback().public_hex);
        }
        other => panic!("unexpected identity {other:?}"),
    }
    assert!(runtime.advisories().active().contains(&Advisory::CryptoUnavailable));

    // Stays disconnected.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handle.status().status, ConnectionStatus::Disconnected);
    handle.teardown().await;
}

#[tokio::test]
async fn test_mismatched_keys_are_unusable() {
    let dir = tempfile::tempdir().unwrap();
    let relay = FakeRelay::new(Behavior::Healthy);
    let (runtime, locks) = runtime(&relay, &dir);
    let (a, b) = (fresh_keys(), fresh_keys());
    let mixed = WorkspaceKeys::new(&a.public_hex, &b.private_hex);

    let handle = ConnectionSession::open(
        Arc::new(runtime),
        mixed,
        Arc::new(YrsDocument::new()),
        config(),
    );
    assert!(!handle.wait_ready().await);
    assert_eq!(handle.identity(), SessionIdentity::Unusable);
    assert_eq!(relay.created(), 0);
    assert_eq!(locks.claims(), 0);
    handle.teardown().await;
}

#[tokio::test]
async fn test_refused_connection_goes_offline_and_keeps_persisting() {
    let dir = tempfile::tempdir().unwrap();
    let relay = FakeRelay::new(Behavior::RefuseConnect);
    let (runtime, locks) = runtime(&relay, &dir);
    let runtime = Arc::new(runtime);
    let keys = fresh_keys();
    let doc = Arc::new(YrsDocument::new());

    let handle = ConnectionSession::open(runtime.clone(), keys.clone(), doc.clone(), config());
    assert!(!handle.wait_ready().await);
    assert_eq!(handle.status().phase, SessionPhase::Offline);
    assert_eq!(handle.status().status, ConnectionStatus::Disconnected);
    assert_eq!(locks.held_count(&keys.public_hex), 0);

    doc.append_text("content", "offline edit");
    tokio::task::yield_now().await;
    handle.flush().await;
    let store = runtime.store().opened().expect("store opened");
    let saved = store.get_snapshot(&keys.public_hex).unwrap().expect("snapshot saved");
    let restored = YrsDocument::new();
    restored.import_snapshot(&saved).unwrap();
    assert_eq!(restored.text("content"), "offline edit");

    handle.teardown().await;
    assert!(relay.client(0).is_destroyed());
}

#[tokio::test]
async fn test_join_failure_goes_offline() {
    let dir = tempfile::tempdir().unwrap();
    let relay = FakeRelay::new(Behavior::FailJoin);
    let (runtime, locks) = runtime(&relay, &dir);
    let keys = fresh_keys();
    let handle = ConnectionSession::open(
        Arc::new(runtime),
        keys.clone(),
        Arc::new(YrsDocument::new()),
        config(),
    );
    assert!(!handle.wait_ready().await);
    assert_eq!(relay.client(0).joins(), 1);
    assert_eq!(locks.held_count(&keys.public_hex), 0);
    assert!(handle.presence().is_none());
    handle.teardown().await;
}

#[tokio::test]
async fn test_convergence_timeout_goes_offline() {
    let dir = tempfile::tempdir().unwrap();
    let relay = FakeRelay::new(Behavior::NeverConverge);
    let (runtime, _) = runtime(&relay, &dir);
    let handle = ConnectionSession::open(
        Arc::new(runtime),
        fresh_keys(),
        Arc::new(YrsDocument::new()),
        config(),
    );
    assert!(!handle.wait_ready().await);
    assert_eq!(handle.status().phase, SessionPhase::Offline);

    handle.teardown().await;
    let room = relay.client(0).room.lock().unwrap().clone().unwrap();
    assert!(room.detached.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_storage_failure_raises_advisory_and_session_continues() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("blocked");
    std::fs::write(&root, b"not a directory").unwrap();

    let relay = FakeRelay::new(Behavior::Healthy);
    let runtime = hexdoc_session::SessionRuntime::new(
        Arc::new(common::SharedRelay(relay.clone())),
        hexdoc_session::StoreConfig::for_testing(&root),
    );
    let runtime = Arc::new(runtime);
    let handle = ConnectionSession::open(
        runtime.clone(),
        fresh_keys(),
        Arc::new(YrsDocument::new()),
        config(),
    );
    assert!(handle.wait_ready().await);
    assert!(runtime.advisories().active().contains(&Advisory::StorageUnavailable));
    handle.teardown().await;
}

// ─── Cancellation and supersession ──────────────────────────────────

#[tokio::test]
async fn test_teardown_mid_connecting_releases_everything() {
    let dir = tempfile::tempdir().unwrap();
    let relay = FakeRelay::new(Behavior::HangConnect);
    let (runtime, locks) = runtime(&relay, &dir);
    let runtime = Arc::new(runtime);
    let keys = fresh_keys();

    let handle = ConnectionSession::open(
        runtime.clone(),
        keys.clone(),
        Arc::new(YrsDocument::new()),
        config(),
    );
    wait_phase(&handle, SessionPhase::Connecting).await;
    assert_eq!(locks.held_count(&keys.public_hex), 1);

    handle.teardown().await;
    assert_eq!(locks.held_count(&keys.public_hex), 0);
    assert!(runtime.broker().is_cleared(handle.session_id()));
    assert!(runtime.broker().current(handle.session_id()).is_none());
    assert!(relay.client(0).is_destroyed());
    assert_eq!(handle.status().phase, SessionPhase::TornDown);
}

#[tokio::test]
async fn test_teardown_steps_run_in_strict_order() {
    let dir = tempfile::tempdir().unwrap();
    let relay = FakeRelay::new(Behavior::Healthy);
    let locks = RecordingLocks::new(&relay);
    let runtime = Arc::new(
        SessionRuntime::new(
            Arc::new(SharedRelay(relay.clone())),
            StoreConfig::for_testing(dir.path()),
        )
        .with_locks(locks.clone()),
    );
    let keys = fresh_keys();
    let handle = ConnectionSession::open(
        runtime.clone(),
        keys.clone(),
        Arc::new(YrsDocument::new()),
        config(),
    );
    assert!(handle.wait_ready().await);
    assert!(handle.has_lease());
    assert!(relay.events().is_empty());

    relay.observe_session(handle.subscribe());
    handle.teardown().await;

    assert_eq!(
        relay.events(),
        vec![
            "lease released",
            "leave: listening",
            "detach: unsubscribed",
            "destroy: session Disconnected",
        ]
    );
    assert_eq!(relay.client(0).listeners(), 0);
    assert_eq!(locks.inner.held_count(&keys.public_hex), 0);
    assert_eq!(handle.status().phase, SessionPhase::TornDown);
}

#[tokio::test]
async fn test_concurrent_teardowns_wait_for_setup() {
    let dir = tempfile::tempdir().unwrap();
    let relay = FakeRelay::new(Behavior::Healthy);
    let locks = Arc::new(LocalReplicaLocks::with_claim_delay(Duration::from_millis(50)));
    let runtime = Arc::new(
        SessionRuntime::new(
            Arc::new(SharedRelay(relay.clone())),
            StoreConfig::for_testing(dir.path()),
        )
        .with_locks(locks.clone()),
    );
    let keys = fresh_keys();
    let handle = ConnectionSession::open(
        runtime.clone(),
        keys.clone(),
        Arc::new(YrsDocument::new()),
        config(),
    );
    wait_phase(&handle, SessionPhase::AcquiringLease).await;

    let (first, second) = (handle.clone(), handle.clone());
    tokio::join!(first.teardown(), second.teardown());

    // Neither call returned before setup stopped, so nothing it might
    // still have acquired is left behind.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(handle.status().phase, SessionPhase::TornDown);
    assert!(!handle.has_lease());
    assert_eq!(locks.held_count(&keys.public_hex), 0);
    assert_eq!(relay.created(), 0);
    assert!(runtime.broker().is_cleared(handle.session_id()));
}

#[tokio::test]
async fn test_repeated_sessions_leave_no_broker_state() {
    let dir = tempfile::tempdir().unwrap();
    let relay = FakeRelay::new(Behavior::Healthy);
    let (runtime, _) = runtime(&relay, &dir);
    let runtime = Arc::new(runtime);
    let keys = fresh_keys();

    for _ in 0..3 {
        let handle = ConnectionSession::open(
            runtime.clone(),
            keys.clone(),
            Arc::new(YrsDocument::new()),
            config(),
        );
        assert!(handle.wait_ready().await);
        let presence = handle.presence().unwrap();
        assert!(eventually(|| presence.state() == PresenceState::Running).await);
        handle.teardown().await;
        assert!(runtime.broker().is_cleared(handle.session_id()));
    }
    assert_eq!(runtime.broker().session_count(), 0);
}

#[tokio::test]
async fn test_teardown_before_setup_runs() {
    let dir = tempfile::tempdir().unwrap();
    let relay = FakeRelay::new(Behavior::Healthy);
    let (runtime, locks) = runtime(&relay, &dir);
    let keys = fresh_keys();
    let handle = ConnectionSession::open(
        Arc::new(runtime),
        keys.clone(),
        Arc::new(YrsDocument::new()),
        config(),
    );
    handle.teardown().await;
    assert_eq!(handle.status().phase, SessionPhase::TornDown);
    assert_eq!(locks.held_count(&keys.public_hex), 0);
    assert_eq!(relay.created(), 0);
}

#[tokio::test]
async fn test_newer_session_supersedes_older_setup() {
    let dir = tempfile::tempdir().unwrap();
    let relay = FakeRelay::new(Behavior::Healthy);
    let locks = Arc::new(LocalReplicaLocks::with_claim_delay(Duration::from_millis(100)));
    let runtime = Arc::new(
        hexdoc_session::SessionRuntime::new(
            Arc::new(common::SharedRelay(relay.clone())),
            hexdoc_session::StoreConfig::for_testing(dir.path()),
        )
        .with_locks(locks.clone()),
    );
    let keys = fresh_keys();

    let older = ConnectionSession::open(
        runtime.clone(),
        keys.clone(),
        Arc::new(YrsDocument::new()),
        config(),
    );
    wait_phase(&older, SessionPhase::AcquiringLease).await;

    let newer = ConnectionSession::open(
        runtime.clone(),
        keys.clone(),
        Arc::new(YrsDocument::new()),
        config(),
    );
    wait_phase(&older, SessionPhase::TornDown).await;
    assert!(!older.has_lease());

    assert!(newer.wait_ready().await);
    assert!(newer.has_lease());
    assert_eq!(locks.held_count(&keys.public_hex), 1);
    // Only the newer session reached the relay.
    assert_eq!(relay.created(), 1);

    older.teardown().await;
    newer.teardown().await;
    assert_eq!(locks.held_count(&keys.public_hex), 0);
}

#[tokio::test]
async fn test_freeze_and_resume_reacquires_lease() {
    let dir = tempfile::tempdir().unwrap();
    let relay = FakeRelay::new(Behavior::Healthy);
    let (runtime, locks) = runtime(&relay, &dir);
    let runtime = Arc::new(runtime);
    let keys = fresh_keys();
    let handle = ConnectionSession::open(
        runtime.clone(),
        keys.clone(),
        Arc::new(YrsDocument::new()),
        config(),
    );
    assert!(handle.wait_ready().await);

    runtime.lifecycle().set(Visibility::Frozen);
    assert!(eventually(|| locks.held_count(&keys.public_hex) == 0).await);
    runtime.lifecycle().set(Visibility::Visible);
    assert!(eventually(|| handle.has_lease()).await);

    handle.teardown().await;
}

// ─── Welcome document ───────────────────────────────────────────────

#[tokio::test]
async fn test_welcome_doc_seeded_once_and_reused() {
    let dir = tempfile::tempdir().unwrap();
    let relay = FakeRelay::new(Behavior::Healthy);
    let (runtime, _) = runtime(&relay, &dir);
    let starter = YrsDocument::new();
    starter.append_text("content", "Welcome to hexdoc");
    let runtime = Arc::new(runtime.with_welcome(Arc::new(StaticWelcome(starter.export_snapshot()))));
    let keys = fresh_keys();
    let mut config = config();
    config.bootstrap_welcome_doc = true;

    let first_doc = Arc::new(YrsDocument::new());
    let first = ConnectionSession::open(runtime.clone(), keys.clone(), first_doc.clone(), config.clone());
    assert!(first.wait_ready().await);
    assert_eq!(first_doc.text("content"), "Welcome to hexdoc");
    first.teardown().await;

    let second_doc = Arc::new(YrsDocument::new());
    let second = ConnectionSession::open(runtime.clone(), keys.clone(), second_doc.clone(), config.clone());
    assert!(second.wait_ready().await);
    assert_eq!(second_doc.text("content"), "Welcome to hexdoc");
    second.teardown().await;

    let welcome = runtime.welcome().unwrap();
    assert_eq!(welcome.fetches(), 1);

    // Another workspace's first visit reuses the cached snapshot.
    let other_doc = Arc::new(YrsDocument::new());
    let other = ConnectionSession::open(runtime.clone(), fresh_keys(), other_doc.clone(), config);
    assert!(other.wait_ready().await);
    assert_eq!(other_doc.text("content"), "Welcome to hexdoc");
    assert_eq!(welcome.fetches(), 1);
    other.teardown().await;
}

#[tokio::test]
async fn test_welcome_doc_not_seeded_unless_requested() {
    let dir = tempfile::tempdir().unwrap();
    let relay = FakeRelay::new(Behavior::Healthy);
    let (runtime, _) = runtime(&relay, &dir);
    let starter = YrsDocument::new();
    starter.append_text("content", "Welcome");
    let runtime = Arc::new(runtime.with_welcome(Arc::new(StaticWelcome(starter.export_snapshot()))));

    let doc = Arc::new(YrsDocument::new());
    let handle = ConnectionSession::open(runtime.clone(), fresh_keys(), doc.clone(), config());
    assert!(handle.wait_ready().await);
    assert!(doc.is_empty());
    assert_eq!(runtime.welcome().unwrap().fetches(), 0);
    handle.teardown().await;
}
