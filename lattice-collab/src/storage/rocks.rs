//! RocksDB-backed snapshot store.
//!
//! Column families:
//! - `documents` — full layer-tree snapshots (bincode, LZ4 compressed)
//! - `metadata`  — per-document bookkeeping (version, sizes, timestamps)
//!
//! Keys are raw document UUIDs (16 bytes); pages and components share
//! the key space because their ids already do.

use lattice_core::Layer;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::SystemTime;
use uuid::Uuid;

const CF_DOCUMENTS: &str = "documents";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("lattice_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Config for tests: small caches, caller-provided temp directory.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10,
            max_open_files: 64,
            write_buffer_size: 1024 * 1024,
        }
    }
}

/// Bookkeeping stored alongside each snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub doc_id: Uuid,
    /// Bumped on every save.
    pub version: u64,
    /// Layer count in the stored tree.
    pub layer_count: u64,
    /// Uncompressed snapshot size in bytes.
    pub snapshot_size: u64,
    /// Compressed snapshot size in bytes.
    pub compressed_size: u64,
    /// Seconds since epoch.
    pub created_at: u64,
    pub updated_at: u64,
}

impl SnapshotMetadata {
    fn new(doc_id: Uuid) -> Self {
        let now = epoch_secs();
        Self {
            doc_id,
            version: 0,
            layer_count: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(meta)
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    Database(String),
    NotFound(Uuid),
    Serialization(String),
    Deserialization(String),
    Decompression(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Database(e) => write!(f, "database error: {e}"),
            StoreError::NotFound(id) => write!(f, "document not found: {id}"),
            StoreError::Serialization(e) => write!(f, "serialization error: {e}"),
            StoreError::Deserialization(e) => write!(f, "deserialization error: {e}"),
            StoreError::Decompression(e) => write!(f, "decompression error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// RocksDB-backed layer-tree snapshot store.
pub struct SnapshotStore {
    /// Single-threaded mode — concurrency is handled by tokio above us.
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl SnapshotStore {
    /// Open the store, creating the database and column families as
    /// needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(&config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(Self { db, config })
    }

    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        // Snapshots are already LZ4-compressed by us; skip RocksDB's own
        // pass so it doesn't recompress incompressible bytes.
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.optimize_for_point_lookup(config.block_cache_size as u64);
        opts
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("missing column family: {name}")))
    }

    /// Persist a document's layer tree, bumping its version.
    pub fn save_document(
        &self,
        doc_id: Uuid,
        layers: &[Layer],
    ) -> Result<SnapshotMetadata, StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let encoded = bincode::serde::encode_to_vec(layers, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&encoded);

        let mut meta = self
            .metadata(doc_id)
            .unwrap_or_else(|_| SnapshotMetadata::new(doc_id));
        meta.version += 1;
        meta.layer_count = lattice_core::tree::len(layers) as u64;
        meta.snapshot_size = encoded.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = epoch_secs();

        // Snapshot and metadata land atomically.
        let mut batch = WriteBatch::default();
        let key = doc_id.as_bytes().to_vec();
        batch.put_cf(&cf_docs, &key, &compressed);
        batch.put_cf(&cf_meta, &key, &meta.encode()?);
        self.db.write(batch)?;

        log::debug!(
            "saved snapshot for {doc_id}: v{} ({} → {} bytes)",
            meta.version,
            meta.snapshot_size,
            meta.compressed_size
        );
        Ok(meta)
    }

    /// Load a document's layer tree.
    pub fn load_document(&self, doc_id: Uuid) -> Result<Vec<Layer>, StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let compressed = self
            .db
            .get_cf(&cf_docs, doc_id.as_bytes())?
            .ok_or(StoreError::NotFound(doc_id))?;

        let encoded = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::Decompression(e.to_string()))?;
        let (layers, _) = bincode::serde::decode_from_slice(&encoded, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(layers)
    }

    /// Delete a document's snapshot and metadata.
    pub fn delete_document(&self, doc_id: Uuid) -> Result<(), StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_docs, doc_id.as_bytes());
        batch.delete_cf(&cf_meta, doc_id.as_bytes());
        self.db.write(batch)?;
        Ok(())
    }

    /// Metadata for one document.
    pub fn metadata(&self, doc_id: Uuid) -> Result<SnapshotMetadata, StoreError> {
        let cf_meta = self.cf(CF_METADATA)?;
        let bytes = self
            .db
            .get_cf(&cf_meta, doc_id.as_bytes())?
            .ok_or(StoreError::NotFound(doc_id))?;
        SnapshotMetadata::decode(&bytes)
    }

    /// Ids of every persisted document.
    pub fn list_documents(&self) -> Result<Vec<Uuid>, StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let mut ids = Vec::new();
        for entry in self.db.iterator_cf(&cf_docs, IteratorMode::Start) {
            let (key, _) = entry?;
            if key.len() == 16 {
                let mut buf = [0u8; 16];
                buf.copy_from_slice(&key);
                ids.push(Uuid::from_bytes(buf));
            }
        }
        Ok(ids)
    }

    pub fn document_count(&self) -> Result<usize, StoreError> {
        Ok(self.list_documents()?.len())
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }
}
