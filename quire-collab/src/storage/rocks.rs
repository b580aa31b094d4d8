//! RocksDB-backed project store.
//!
//! Column families:
//! - `projects`: bincode-encoded [`Project`]s, LZ4 compressed, keyed by project id
//! - `metadata`: [`ProjectMetadata`] (revision, sizes, timestamps), same key
//!
//! Project and metadata are always written in one atomic batch.

use async_trait::async_trait;
use quire_core::{now_secs, Project};
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::{ProjectStore, StoreError};

const CF_PROJECTS: &str = "projects";
const CF_METADATA: &str = "metadata";

/// All column family names for initialization.
const COLUMN_FAMILIES: &[&str] = &[CF_PROJECTS, CF_METADATA];

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
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("quire_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, temp directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Bookkeeping stored next to each project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectMetadata {
    pub project_id: Uuid,
    /// Incremented on every save
    pub revision: u64,
    pub file_count: u32,
    /// Encoded size before compression
    pub encoded_size: u64,
    pub compressed_size: u64,
    /// Last save (seconds since epoch)
    pub saved_at: u64,
}

impl ProjectMetadata {
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

/// Durable project store.
pub struct RocksProjectStore {
    /// RocksDB instance (single-threaded mode, concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksProjectStore {
    /// Open the store, creating the database and column families if missing.
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

        log::info!("Opened project store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_PROJECTS => {
                // Values are LZ4-compressed by us already
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(4);
            }
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    // ─── Projects ─────────────────────────────────────────────────────

    /// Write a project and its metadata atomically.
    pub fn save(&self, project: &Project) -> Result<ProjectMetadata, StoreError> {
        let cf_projects = self.cf(CF_PROJECTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let encoded = bincode::serde::encode_to_vec(project, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&encoded);

        let revision = self
            .load_metadata(project.id)?
            .map_or(1, |meta| meta.revision + 1);
        let meta = ProjectMetadata {
            project_id: project.id,
            revision,
            file_count: project.files().len() as u32,
            encoded_size: encoded.len() as u64,
            compressed_size: compressed.len() as u64,
            saved_at: now_secs(),
        };

        let key = project.id.as_bytes();
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_projects, key, &compressed);
        batch.put_cf(&cf_meta, key, &meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(meta)
    }

    pub fn load(&self, project_id: Uuid) -> Result<Option<Project>, StoreError> {
        let cf = self.cf(CF_PROJECTS)?;
        let Some(compressed) = self.db.get_cf(&cf, project_id.as_bytes())? else {
            return Ok(None);
        };

        let encoded = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        let (project, _) =
            bincode::serde::decode_from_slice(&encoded, bincode::config::standard())
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(Some(project))
    }

    /// Delete a project and its metadata. Returns whether it existed.
    pub fn delete(&self, project_id: Uuid) -> Result<bool, StoreError> {
        let cf_projects = self.cf(CF_PROJECTS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let key = project_id.as_bytes();

        if self.db.get_cf(&cf_meta, key)?.is_none() {
            return Ok(false);
        }

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_projects, key);
        batch.delete_cf(&cf_meta, key);
        self.db.write(batch)?;
        Ok(true)
    }

    pub fn list(&self) -> Result<Vec<Uuid>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut ids = Vec::new();

        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            let bytes: [u8; 16] = key
                .as_ref()
                .try_into()
                .map_err(|_| StoreError::Deserialization("invalid project key".into()))?;
            ids.push(Uuid::from_bytes(bytes));
        }

        Ok(ids)
    }

    // ─── Metadata ─────────────────────────────────────────────────────

    pub fn load_metadata(&self, project_id: Uuid) -> Result<Option<ProjectMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        self.db
            .get_cf(&cf, project_id.as_bytes())?
            .map(|bytes| ProjectMetadata::decode(&bytes))
            .transpose()
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        for name in COLUMN_FAMILIES {
            self.db.flush_cf(&self.cf(name)?)?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }
}

#[async_trait]
impl ProjectStore for RocksProjectStore {
    async fn get_project(&self, id: Uuid) -> Result<Option<Project>, StoreError> {
        self.load(id)
    }

    async fn save_project(&self, project: &Project) -> Result<(), StoreError> {
        let meta = self.save(project)?;
        log::trace!("Saved project {} at revision {}", project.id, meta.revision);
        Ok(())
    }

    async fn delete_project(&self, id: Uuid) -> Result<bool, StoreError> {
        self.delete(id)
    }

    async fn list_projects(&self) -> Result<Vec<Uuid>, StoreError> {
        self.list()
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
