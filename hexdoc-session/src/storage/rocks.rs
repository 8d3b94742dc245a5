//! RocksDB-backed local workspace store.
//!
//! Column families:
//! - `documents`  — Exported document snapshots (LZ4 compressed), keyed by workspace id
//! - `workspaces` — [`WorkspaceRecord`]s (bincode), keyed by workspace id
//! - default      — `schema_version` (u32 big-endian)
//!
//! Layout on disk:
//! ```text
//! <path>/<partition>/   isolated partition, fsync on every write
//! <path>/default/       fallback partition
//! ```

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

const CF_DOCUMENTS: &str = "documents";
const CF_WORKSPACES: &str = "workspaces";
const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_WORKSPACES];

const SCHEMA_KEY: &[u8] = b"schema_version";
const DEFAULT_PARTITION: &str = "default";

/// Current on-disk layout. Version 1 stored snapshots uncompressed.
pub const SCHEMA_VERSION: u32 = 2;

type Db = DBWithThreadMode<SingleThreaded>;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Root directory holding the partitions.
    pub path: PathBuf,
    /// Isolated partition to prefer; `None` goes straight to the default one.
    pub partition: Option<String>,
    /// fsync every write to the isolated partition.
    pub strict_durability: bool,
    /// Block cache size in bytes (default: 32MB)
    pub block_cache_size: usize,
    pub max_open_files: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("hexdoc_data"),
            partition: Some("isolated".into()),
            strict_durability: true,
            block_cache_size: 32 * 1024 * 1024,
            max_open_files: 256,
        }
    }
}

impl StoreConfig {
    /// Small caches, rooted at `path`.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            max_open_files: 64,
            ..Self::default()
        }
    }
}

/// Metadata kept for every workspace this process has visited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceRecord {
    /// Lower-case public hex, as used for the relay connection.
    pub id: String,
    pub private_hex: String,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
    pub last_used_at: u64,
    pub name: Option<String>,
    pub label: Option<String>,
}

impl WorkspaceRecord {
    pub fn new(id: impl Into<String>, private_hex: impl Into<String>) -> Self {
        let now = epoch_ms();
        Self {
            id: id.into(),
            private_hex: private_hex.into(),
            created_at: now,
            last_used_at: now,
            name: None,
            label: None,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(record)
    }
}

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Store schema v{found} is newer than supported v{supported}")]
    SchemaTooNew { found: u32, supported: u32 },
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Which partition the store ended up in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partition {
    Isolated,
    Default,
}

/// Durable per-process workspace store.
pub struct LocalStore {
    db: Db,
    path: PathBuf,
    partition: Partition,
    sync_writes: bool,
}

impl LocalStore {
    /// Open the store, preferring the isolated partition.
    ///
    /// Any failure on the isolated partition falls back to the default one;
    /// a failed default open is retried once.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        if let Some(name) = &config.partition {
            let isolated = config.path.join(name);
            match Self::open_at(&isolated, &config) {
                Ok(db) => {
                    log::info!("Opened local store at {}", isolated.display());
                    return Ok(Self {
                        db,
                        path: isolated,
                        partition: Partition::Isolated,
                        sync_writes: config.strict_durability,
                    });
                }
                Err(e) => log::warn!(
                    "Isolated store partition {} unavailable, using default: {e}",
                    isolated.display()
                ),
            }
        }

        let fallback = config.path.join(DEFAULT_PARTITION);
        let db = match Self::open_at(&fallback, &config) {
            Ok(db) => db,
            Err(e @ StoreError::SchemaTooNew { .. }) => return Err(e),
            Err(e) => {
                log::warn!("Default store partition failed to open, retrying: {e}");
                Self::open_at(&fallback, &config)?
            }
        };
        log::info!("Opened local store at {}", fallback.display());
        Ok(Self {
            db,
            path: fallback,
            partition: Partition::Default,
            sync_writes: false,
        })
    }

    fn open_at(path: &Path, config: &StoreConfig) -> Result<Db, StoreError> {
        std::fs::create_dir_all(path).map_err(|e| StoreError::Io(e.to_string()))?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cache = Cache::new_lru_cache(config.block_cache_size);
        let descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &cache)))
            .collect();

        let db = Db::open_cf_descriptors(&db_opts, path, descriptors)?;
        Self::migrate(&db)?;
        Ok(db)
    }

    fn cf_options(name: &str, cache: &Cache) -> Options {
        let mut opts = Options::default();
        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_cache(cache);
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);

        match name {
            // Values are already LZ4 compressed.
            CF_DOCUMENTS => opts.set_compression_type(DBCompressionType::None),
            _ => opts.set_compression_type(DBCompressionType::Lz4),
        }
        opts
    }

    /// Bring an older layout up to [`SCHEMA_VERSION`].
    fn migrate(db: &Db) -> Result<(), StoreError> {
        let found = match db.get(SCHEMA_KEY)? {
            Some(bytes) => {
                let raw: [u8; 4] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| StoreError::Deserialization("schema version".into()))?;
                u32::from_be_bytes(raw)
            }
            None => {
                let docs = cf(db, CF_DOCUMENTS)?;
                let empty = db.iterator_cf(&docs, IteratorMode::Start).next().is_none();
                if empty {
                    db.put(SCHEMA_KEY, SCHEMA_VERSION.to_be_bytes())?;
                    return Ok(());
                }
                1
            }
        };

        if found > SCHEMA_VERSION {
            return Err(StoreError::SchemaTooNew {
                found,
                supported: SCHEMA_VERSION,
            });
        }
        if found == SCHEMA_VERSION {
            return Ok(());
        }

        let docs = cf(db, CF_DOCUMENTS)?;
        let mut batch = WriteBatch::default();
        let mut rewritten = 0usize;
        for item in db.iterator_cf(&docs, IteratorMode::Start) {
            let (key, raw) = item?;
            batch.put_cf(&docs, &key, lz4_flex::compress_prepend_size(&raw));
            rewritten += 1;
        }
        batch.put(SCHEMA_KEY, SCHEMA_VERSION.to_be_bytes());
        db.write(batch)?;
        log::info!("Upgraded local store v{found} -> v{SCHEMA_VERSION} ({rewritten} snapshots)");
        Ok(())
    }

    // ─── Snapshots ─────────────────────────────────────────────────────

    /// Overwrite the snapshot of `id` in a single put.
    pub fn put_snapshot(&self, id: &str, snapshot: &[u8]) -> Result<(), StoreError> {
        let docs = cf(&self.db, CF_DOCUMENTS)?;
        let compressed = lz4_flex::compress_prepend_size(snapshot);
        self.db
            .put_cf_opt(&docs, id.as_bytes(), compressed, &self.write_options())?;
        Ok(())
    }

    pub fn get_snapshot(&self, id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let docs = cf(&self.db, CF_DOCUMENTS)?;
        match self.db.get_cf(&docs, id.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map(Some)
                .map_err(|e| StoreError::Compression(e.to_string())),
            None => Ok(None),
        }
    }

    pub fn delete_snapshot(&self, id: &str) -> Result<(), StoreError> {
        let docs = cf(&self.db, CF_DOCUMENTS)?;
        self.db
            .delete_cf_opt(&docs, id.as_bytes(), &self.write_options())?;
        Ok(())
    }

    pub fn snapshot_ids(&self) -> Result<Vec<String>, StoreError> {
        let docs = cf(&self.db, CF_DOCUMENTS)?;
        self.db
            .iterator_cf(&docs, IteratorMode::Start)
            .map(|item| {
                let (key, _) = item?;
                String::from_utf8(key.to_vec()).map_err(|e| StoreError::Deserialization(e.to_string()))
            })
            .collect()
    }

    // ─── Workspaces ────────────────────────────────────────────────────

    pub fn put_workspace(&self, record: &WorkspaceRecord) -> Result<(), StoreError> {
        let workspaces = cf(&self.db, CF_WORKSPACES)?;
        self.db.put_cf_opt(
            &workspaces,
            record.id.as_bytes(),
            record.encode()?,
            &self.write_options(),
        )?;
        Ok(())
    }

    pub fn get_workspace(&self, id: &str) -> Result<Option<WorkspaceRecord>, StoreError> {
        let workspaces = cf(&self.db, CF_WORKSPACES)?;
        self.db
            .get_cf(&workspaces, id.as_bytes())?
            .map(|bytes| WorkspaceRecord::decode(&bytes))
            .transpose()
    }

    /// All records, most recently used first.
    pub fn list_workspaces(&self) -> Result<Vec<WorkspaceRecord>, StoreError> {
        let workspaces = cf(&self.db, CF_WORKSPACES)?;
        let mut records = self
            .db
            .iterator_cf(&workspaces, IteratorMode::Start)
            .map(|item| {
                let (_, value) = item?;
                WorkspaceRecord::decode(&value)
            })
            .collect::<Result<Vec<_>, _>>()?;
        records.sort_by(|a, b| b.last_used_at.cmp(&a.last_used_at));
        Ok(records)
    }

    pub fn delete_workspace(&self, id: &str) -> Result<(), StoreError> {
        let workspaces = cf(&self.db, CF_WORKSPACES)?;
        self.db
            .delete_cf_opt(&workspaces, id.as_bytes(), &self.write_options())?;
        Ok(())
    }

    /// Bump `last_used_at`. Returns the updated record, if any.
    pub fn touch_workspace(&self, id: &str) -> Result<Option<WorkspaceRecord>, StoreError> {
        self.update_workspace(id, |record| {
            record.last_used_at = epoch_ms().max(record.last_used_at + 1);
        })
    }

    pub fn rename_workspace(
        &self,
        id: &str,
        name: Option<String>,
    ) -> Result<Option<WorkspaceRecord>, StoreError> {
        self.update_workspace(id, |record| record.name = name)
    }

    /// Remove the record and the snapshot together.
    pub fn forget_workspace(&self, id: &str) -> Result<(), StoreError> {
        let docs = cf(&self.db, CF_DOCUMENTS)?;
        let workspaces = cf(&self.db, CF_WORKSPACES)?;
        let mut batch = WriteBatch::default();
        batch.delete_cf(&docs, id.as_bytes());
        batch.delete_cf(&workspaces, id.as_bytes());
        self.db.write_opt(batch, &self.write_options())?;
        log::info!("Forgot workspace {id}");
        Ok(())
    }

    fn update_workspace(
        &self,
        id: &str,
        edit: impl FnOnce(&mut WorkspaceRecord),
    ) -> Result<Option<WorkspaceRecord>, StoreError> {
        let Some(mut record) = self.get_workspace(id)? else {
            return Ok(None);
        };
        edit(&mut record);
        self.put_workspace(&record)?;
        Ok(Some(record))
    }

    // ─── Introspection ─────────────────────────────────────────────────

    pub fn partition(&self) -> Partition {
        self.partition
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn schema_version(&self) -> Result<u32, StoreError> {
        let bytes = self
            .db
            .get(SCHEMA_KEY)?
            .ok_or_else(|| StoreError::Deserialization("schema version missing".into()))?;
        let raw: [u8; 4] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| StoreError::Deserialization("schema version".into()))?;
        Ok(u32::from_be_bytes(raw))
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.sync_writes);
        opts
    }
}

fn cf<'a>(db: &'a Db, name: &str) -> Result<&'a rocksdb::ColumnFamily, StoreError> {
    db.cf_handle(name)
        .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
