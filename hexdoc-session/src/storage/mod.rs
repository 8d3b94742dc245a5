//! Durable local storage for workspaces.
//!
//! ```text
//! ┌──────────────┐  debounced   ┌────────────┐   lazy open   ┌──────────────────┐
//! │ DocumentHandle│ ──────────► │ persist.rs │ ────────────► │ LocalStore       │
//! └──────────────┘   snapshots  └────────────┘               │ (RocksDB)        │
//!                                                            │ CF "documents"   │
//!                                                            │ CF "workspaces"  │
//!                                                            └──────────────────┘
//! ```

pub mod persist;
pub mod rocks;

pub use persist::{
    setup_persistence, DiskQuota, FailureHook, LazyStore, PersistenceConfig, PersistenceGrant,
    PersistenceGrantCache, PersistenceHandle, SnapshotSink, StorageQuota,
};
pub use rocks::{LocalStore, Partition, StoreConfig, StoreError, WorkspaceRecord, SCHEMA_VERSION};
