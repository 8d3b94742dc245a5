//! Persistence integration tests.
//!
//! Verifies:
//! - Debounced snapshots survive a store restart
//! - A session restores the snapshot written by an earlier session
//! - Workspace records are kept per workspace and listed by recency
//! - Isolated and default partitions hold separate data

mod common;

use common::{fresh_keys, init_logging, runtime, Behavior, FakeRelay};
use hexdoc_session::storage::{setup_persistence, LazyStore, PersistenceConfig};
use hexdoc_session::{
    ConnectionSession, Deferral, DocumentHandle, LocalStore, Partition, SessionConfig,
    SessionPhase, StoreConfig, WorkspaceRecord, YrsDocument,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn doc_with_text(content: &str) -> YrsDocument {
    let doc = YrsDocument::new();
    doc.append_text("content", content);
    doc
}

fn text_of(snapshot: &[u8]) -> String {
    let doc = YrsDocument::new();
    doc.import_snapshot(snapshot).unwrap();
    doc.text("content")
}

// ─── Debounced writes ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_debounced_snapshot_survives_restart() {
    init_logging();
    let dir = tempdir().unwrap();
    let config = StoreConfig::for_testing(dir.path());

    {
        let lazy = Arc::new(LazyStore::new(config.clone(), Deferral::None));
        let doc = Arc::new(YrsDocument::new());
        let handle = setup_persistence(doc.clone(), "aa11".into(), lazy, PersistenceConfig::for_testing(), None);

        for word in ["Data ", "that ", "must ", "survive"] {
            doc.append_text("content", word);
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(handle.saves(), 1);
        handle.stop().await;
        // Store dropped here, simulating a restart.
    }

    let store = LocalStore::open(config).unwrap();
    let snapshot = store.get_snapshot("aa11").unwrap().expect("snapshot persisted");
    assert_eq!(text_of(&snapshot), "Data that must survive");
}

#[tokio::test]
async fn test_writes_after_quiet_intervals_are_separate() {
    let dir = tempdir().unwrap();
    let lazy = Arc::new(LazyStore::new(StoreConfig::for_testing(dir.path()), Deferral::None));
    let doc = Arc::new(YrsDocument::new());
    let handle = setup_persistence(doc.clone(), "aa11".into(), lazy.clone(), PersistenceConfig::for_testing(), None);

    doc.append_text("content", "first");
    tokio::time::sleep(Duration::from_millis(200)).await;
    doc.append_text("content", " second");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(handle.saves(), 2);

    let store = lazy.opened().unwrap();
    assert_eq!(text_of(&store.get_snapshot("aa11").unwrap().unwrap()), "first second");
    handle.stop().await;
}

#[tokio::test]
async fn test_stop_flushes_pending_changes() {
    let dir = tempdir().unwrap();
    let lazy = Arc::new(LazyStore::new(StoreConfig::for_testing(dir.path()), Deferral::None));
    let doc = Arc::new(YrsDocument::new());
    let config = PersistenceConfig {
        debounce: Duration::from_secs(60),
    };
    let handle = setup_persistence(doc.clone(), "aa11".into(), lazy.clone(), config, None);

    doc.append_text("content", "pending");
    tokio::task::yield_now().await;
    handle.stop().await;
    assert_eq!(handle.saves(), 1);
    assert!(lazy.opened().unwrap().get_snapshot("aa11").unwrap().is_some());
}

// ─── Sessions over a shared store ────────────────────────────────────────────

#[tokio::test]
async fn test_session_restores_previous_session_snapshot() {
    let dir = tempdir().unwrap();
    let relay = FakeRelay::new(Behavior::Healthy);
    let (runtime, _) = runtime(&relay, &dir);
    let runtime = Arc::new(runtime);
    let keys = fresh_keys();
    let config = SessionConfig::for_testing("ws://relay.test");

    let first_doc = Arc::new(YrsDocument::new());
    let first = ConnectionSession::open(runtime.clone(), keys.clone(), first_doc.clone(), config.clone());
    assert!(first.wait_ready().await);
    first_doc.append_text("content", "edited in the first tab");
    tokio::task::yield_now().await;
    first.teardown().await;

    let second_doc = Arc::new(YrsDocument::new());
    let second = ConnectionSession::open(runtime.clone(), keys.clone(), second_doc.clone(), config);
    assert!(second.wait_ready().await);
    assert_eq!(second_doc.text("content"), "edited in the first tab");

    let store = runtime.store().opened().unwrap();
    let record = store.get_workspace(&keys.public_hex).unwrap().expect("record kept");
    assert_eq!(record.private_hex, keys.private_hex);
    assert!(record.last_used_at > record.created_at);
    second.teardown().await;
    assert_eq!(second.status().phase, SessionPhase::TornDown);
}

// ─── Workspace records ───────────────────────────────────────────────────────

#[test]
fn test_workspaces_listed_most_recent_first() {
    let dir = tempdir().unwrap();
    let store = LocalStore::open(StoreConfig::for_testing(dir.path())).unwrap();

    for (i, id) in ["aa", "bb", "cc"].iter().enumerate() {
        let mut record = WorkspaceRecord::new(*id, "00");
        record.last_used_at = 1_000 + i as u64;
        store.put_workspace(&record).unwrap();
    }
    store.touch_workspace("aa").unwrap();

    let order: Vec<String> = store.list_workspaces().unwrap().into_iter().map(|r| r.id).collect();
    assert_eq!(order, vec!["aa", "cc", "bb"]);
}

#[test]
fn test_multi_workspace_isolation() {
    let dir = tempdir().unwrap();
    let store = LocalStore::open(StoreConfig::for_testing(dir.path())).unwrap();

    let ids = ["a1", "b2", "c3"];
    for id in ids {
        let doc = doc_with_text(&format!("workspace {id}"));
        store.put_snapshot(id, &doc.export_snapshot()).unwrap();
        store.put_workspace(&WorkspaceRecord::new(id, "00")).unwrap();
    }
    store.forget_workspace("b2").unwrap();

    assert_eq!(text_of(&store.get_snapshot("a1").unwrap().unwrap()), "workspace a1");
    assert_eq!(text_of(&store.get_snapshot("c3").unwrap().unwrap()), "workspace c3");
    assert!(store.get_snapshot("b2").unwrap().is_none());
    assert!(store.get_workspace("b2").unwrap().is_none());
    assert_eq!(store.list_workspaces().unwrap().len(), 2);
}

#[test]
fn test_partitions_are_separate() {
    let dir = tempdir().unwrap();
    {
        let isolated = LocalStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        assert_eq!(isolated.partition(), Partition::Isolated);
        isolated.put_snapshot("aa", b"isolated").unwrap();
    }

    let fallback = LocalStore::open(StoreConfig {
        partition: None,
        ..StoreConfig::for_testing(dir.path())
    })
    .unwrap();
    assert_eq!(fallback.partition(), Partition::Default);
    assert!(fallback.get_snapshot("aa").unwrap().is_none());
}

#[test]
fn test_large_snapshot_roundtrip() {
    let dir = tempdir().unwrap();
    let store = LocalStore::open(StoreConfig::for_testing(dir.path())).unwrap();

    let doc = doc_with_text(&"The quick brown fox jumps over the lazy dog. ".repeat(20_000));
    let snapshot = doc.export_snapshot();
    assert!(snapshot.len() > 500_000);
    store.put_snapshot("big", &snapshot).unwrap();
    assert_eq!(store.get_snapshot("big").unwrap().unwrap(), snapshot);
}
