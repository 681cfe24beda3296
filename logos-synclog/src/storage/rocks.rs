//! RocksDB-backed store for stream heads and update rows.
//!
//! Column families:
//! - `heads`   : one row per stream, keyed by `StreamId` (16 bytes).
//!   Bincode row with an LZ4-compressed snapshot.
//! - `updates` : append-only update rows, keyed by `StreamId ++ seq (BE)`.
//!   Bincode row with an LZ4-compressed update payload.
//!
//! All multi-row writes go through a [`WriteSet`] committed as a single
//! RocksDB `WriteBatch`, so a head change and its update row become visible
//! together or not at all.
//!
//! Head rows are unique per key, so a put is a native upsert. Writes that
//! must not clobber a concurrent head change use [`DocumentStore::commit_if_head`],
//! a compare-and-swap on the head's sequence number.
//!
//! Reference: Kleppmann, DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, ReadOptions, SingleThreaded, WriteBatch, WriteOptions,
};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;

use crate::error::StoreError;
use crate::stream::{StreamId, STREAM_ID_LEN};

/// Column family names.
pub(crate) const CF_HEADS: &str = "heads";
pub(crate) const CF_UPDATES: &str = "updates";

/// All column family names for initialization.
const COLUMN_FAMILIES: &[&str] = &[CF_HEADS, CF_UPDATES];

/// Number of head lock stripes.
const HEAD_LOCK_STRIPES: usize = 64;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 256MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every commit (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("logos_synclog"),
            block_cache_size: 256 * 1024 * 1024, // 256MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024, // 64MB
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches).
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

/// A set of staged writes committed atomically.
#[derive(Default)]
pub struct WriteSet {
    pub(crate) batch: WriteBatch,
}

impl WriteSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of staged operations.
    pub fn len(&self) -> usize {
        self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }
}

/// RocksDB-backed head and update store.
pub struct DocumentStore {
    /// RocksDB instance (single-threaded mode: column families are fixed at open)
    db: DBWithThreadMode<SingleThreaded>,
    /// Store configuration
    config: StoreConfig,
    /// Striped locks guarding head compare-and-swap
    head_locks: Vec<Mutex<()>>,
}

impl DocumentStore {
    /// Open the store at the configured path.
    ///
    /// Creates the database and column families if they don't exist.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.set_max_total_wal_size(128 * 1024 * 1024); // 128MB WAL limit
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

        log::info!("Opened sync log store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            head_locks: (0..HEAD_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        })
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

        // Payloads are already LZ4-compressed by the row codec
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_HEADS => {
                // Point lookups by stream id, rewritten on every submit
                opts.set_max_write_buffer_number(4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_UPDATES => {
                // Many small appends, range-scanned by stream id prefix
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(
                    STREAM_ID_LEN,
                ));
            }
            _ => {}
        }

        opts
    }

    // ─── Batches ──────────────────────────────────────────────────────

    /// Commit a write set atomically.
    pub fn commit(&self, writes: WriteSet) -> Result<(), StoreError> {
        if writes.is_empty() {
            return Ok(());
        }
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(writes.batch, &write_opts)?;
        Ok(())
    }

    /// Commit `writes` only if the stream's head sequence still equals
    /// `expected_seq` (`None` = no head yet). Returns `false` on conflict,
    /// in which case nothing was written.
    pub fn commit_if_head(
        &self,
        stream: StreamId,
        expected_seq: Option<u64>,
        writes: WriteSet,
    ) -> Result<bool, StoreError> {
        let _guard = self.lock_head(stream);
        let current = self.head_seq(stream)?;
        if current != expected_seq {
            log::debug!(
                "Head CAS conflict on {stream}: expected {expected_seq:?}, found {current:?}"
            );
            return Ok(false);
        }
        self.commit(writes)?;
        Ok(true)
    }

    /// Hold the head lock stripe for `stream`.
    pub(crate) fn lock_head(&self, stream: StreamId) -> MutexGuard<'_, ()> {
        let stripe = stream.as_bytes()[0] as usize % self.head_locks.len();
        // A poisoned stripe only means another writer panicked mid-call;
        // the guarded data is `()`, so keep going.
        self.head_locks[stripe]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ─── Stream lifecycle ─────────────────────────────────────────────

    /// Delete a stream's head and every update row.
    ///
    /// Used by workspace-lifecycle tooling; the sync service itself never
    /// deletes streams. Returns the number of update rows removed.
    pub fn delete_stream(&self, stream: StreamId) -> Result<u64, StoreError> {
        let cf_heads = self.cf(CF_HEADS)?;
        let cf_updates = self.cf(CF_UPDATES)?;

        let _guard = self.lock_head(stream);
        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_heads, stream.as_bytes());

        let mut count = 0u64;
        let start_key = stream.update_key(0);
        let iter = self.prefix_iter(IteratorMode::From(&start_key, rocksdb::Direction::Forward))?;
        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if !key.starts_with(stream.as_bytes()) {
                break;
            }
            batch.delete_cf(&cf_updates, &key);
            count += 1;
        }

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        log::info!("Deleted stream {stream} ({count} update rows)");
        Ok(count)
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush().map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    /// Get a column family handle.
    pub(crate) fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    pub(crate) fn db(&self) -> &DBWithThreadMode<SingleThreaded> {
        &self.db
    }

    /// Iterator over the `updates` column family confined to one stream's prefix.
    pub(crate) fn prefix_iter(
        &self,
        mode: IteratorMode<'_>,
    ) -> Result<rocksdb::DBIteratorWithThreadMode<'_, DBWithThreadMode<SingleThreaded>>, StoreError>
    {
        let cf = self.cf(CF_UPDATES)?;
        let mut read_opts = ReadOptions::default();
        read_opts.set_prefix_same_as_start(true);
        Ok(self.db.iterator_cf_opt(&cf, read_opts, mode))
    }
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Encode a row with bincode (standard config).
pub(crate) fn encode_row<T: serde::Serialize>(row: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(row, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Decode a row with bincode (standard config).
pub(crate) fn decode_row<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (row, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(row)
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
