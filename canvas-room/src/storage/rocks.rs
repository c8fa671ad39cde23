//! RocksDB-backed snapshot store.
//!
//! Column families:
//! - `values`:   Raw values keyed by storage key (snapshot blobs are
//!   already LZ4 compressed by the codec)
//! - `metadata`: Per-key metadata (bincode: size, write count, timestamps)
//!
//! Reference: Kleppmann, DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::{KvStore, StoreError};

/// Column family names.
const CF_VALUES: &str = "values";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_VALUES, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("canvas_data"),
            block_cache_size: 64 * 1024 * 1024, // 64MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024, // 32MB
        }
    }
}

impl StoreConfig {
    /// Config rooted at `path` with default tuning.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Create config for testing (small caches, temp directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024, // 8MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024, // 4MB
        }
    }
}

/// Metadata stored next to every value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    /// Value size in bytes
    pub size: u64,
    /// Number of puts to this key
    pub writes: u64,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last modified timestamp (seconds since epoch)
    pub updated_at: u64,
}

impl EntryMetadata {
    fn new() -> Self {
        let now = now_secs();
        Self {
            size: 0,
            writes: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Database(format!("metadata encoding: {e}")))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Database(format!("metadata decoding: {e}")))?;
        Ok(meta)
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// RocksDB-backed [`KvStore`].
///
/// - Bloom filters for fast point lookups
/// - Atomic write batches (value + metadata)
pub struct RocksStore {
    /// RocksDB instance (single-threaded mode, concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open the store at the configured path.
    ///
    /// Creates the database and column families if they don't exist.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened snapshot store at {}", config.path.display());
        Ok(Self { db, config })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024); // 16KB blocks
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);

        match name {
            CF_VALUES => {
                // Snapshot blobs arrive compressed
                opts.set_compression_type(DBCompressionType::None);
            }
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Metadata for `key`, `None` when the key was never written.
    pub fn metadata(&self, key: &str) -> Result<Option<EntryMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, key.as_bytes())? {
            Some(bytes) => EntryMetadata::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// All keys starting with `prefix`, in byte order.
    pub fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_VALUES)?;
        let mut keys = Vec::new();

        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix.as_bytes(), Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            let key = String::from_utf8(key.to_vec())
                .map_err(|_| StoreError::Database("non-UTF-8 key".into()))?;
            keys.push(key);
        }

        Ok(keys)
    }

    /// Delete a key and its metadata.
    pub fn delete(&self, key: &str) -> Result<(), StoreError> {
        let cf_values = self.cf(CF_VALUES)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(cf_values, key.as_bytes());
        batch.delete_cf(cf_meta, key.as_bytes());
        self.write(batch)
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }
}

impl KvStore for RocksStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_VALUES)?;
        Ok(self.db.get_cf(cf, key.as_bytes())?)
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let cf_values = self.cf(CF_VALUES)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut meta = self.metadata(key)?.unwrap_or_else(EntryMetadata::new);
        meta.size = value.len() as u64;
        meta.writes += 1;
        meta.updated_at = now_secs();

        // Atomic batch write: value + metadata
        let mut batch = WriteBatch::default();
        batch.put_cf(cf_values, key.as_bytes(), value);
        batch.put_cf(cf_meta, key.as_bytes(), meta.encode()?);
        self.write(batch)
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, RocksStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        (dir, store)
    }

    #[test]
    fn test_store_open() {
        let (_dir, store) = open_temp();
        assert!(store.path().exists());
    }

    #[test]
    fn test_put_get() {
        let (_dir, store) = open_temp();
        assert_eq!(store.get("rooms/a/snapshot").unwrap(), None);

        store.put("rooms/a/snapshot", b"first").unwrap();
        store.put("rooms/a/snapshot", b"second value").unwrap();

        assert_eq!(
            store.get("rooms/a/snapshot").unwrap(),
            Some(b"second value".to_vec())
        );
    }

    #[test]
    fn test_metadata_tracks_writes() {
        let (_dir, store) = open_temp();
        assert_eq!(store.metadata("k").unwrap(), None);

        store.put("k", b"abc").unwrap();
        store.put("k", b"abcdef").unwrap();

        let meta = store.metadata("k").unwrap().unwrap();
        assert_eq!(meta.writes, 2);
        assert_eq!(meta.size, 6);
        assert!(meta.updated_at >= meta.created_at);
    }

    #[test]
    fn test_keys_with_prefix() {
        let (_dir, store) = open_temp();
        store.put("rooms/a/snapshot", b"1").unwrap();
        store.put("rooms/b/snapshot", b"2").unwrap();
        store.put("uploads/x.png", b"3").unwrap();

        let keys = store.keys_with_prefix("rooms/").unwrap();
        assert_eq!(keys, vec!["rooms/a/snapshot", "rooms/b/snapshot"]);
        assert!(store.keys_with_prefix("none/").unwrap().is_empty());
    }

    #[test]
    fn test_delete() {
        let (_dir, store) = open_temp();
        store.put("k", b"v").unwrap();
        store.delete("k").unwrap();
        assert_eq!(store.get("k").unwrap(), None);
        assert_eq!(store.metadata("k").unwrap(), None);
    }

    #[test]
    fn test_reopen_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        {
            let store = RocksStore::open(StoreConfig::for_testing(&path)).unwrap();
            store.put("rooms/r/snapshot", b"durable").unwrap();
            store.sync().unwrap();
        }
        let store = RocksStore::open(StoreConfig::for_testing(&path)).unwrap();
        assert_eq!(
            store.get("rooms/r/snapshot").unwrap(),
            Some(b"durable".to_vec())
        );
        assert_eq!(store.metadata("rooms/r/snapshot").unwrap().unwrap().writes, 1);
    }

    #[test]
    fn test_config_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.path, PathBuf::from("canvas_data"));
        assert!(!config.sync_writes);
        assert_eq!(StoreConfig::at("/tmp/x").path, PathBuf::from("/tmp/x"));
    }
}
