//! RocksDB-backed version and share repository.
//!
//! Column families:
//! - `versions`      — version records keyed by version id (bincode, LZ4 snapshot)
//! - `version_index` — `<document_id>\0<version_number BE>` → version id
//! - `shares`        — share records keyed by share id (bincode)
//! - `owners`        — `<content_type>:<content_id>` → owner user id
//!
//! Version inserts check-and-put under one lock, so numbers stay unique per
//! document even with several writers on the same store.

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

use super::{ShareRepository, StoreError, VersionRepository};
use crate::protocol::UserId;
use crate::sharing::{ContentRef, Share};
use crate::versions::Version;

const CF_VERSIONS: &str = "versions";
const CF_VERSION_INDEX: &str = "version_index";
const CF_SHARES: &str = "shares";
const CF_OWNERS: &str = "owners";

const COLUMN_FAMILIES: &[&str] = &[CF_VERSIONS, CF_VERSION_INDEX, CF_SHARES, CF_OWNERS];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write
    pub sync_writes: bool,
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
            sync_writes: true,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, no fsync.
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

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes version-number allocation checks.
    version_lock: Mutex<()>,
}

impl RocksStore {
    /// Open (or create) the store at the configured path.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("Opened RocksDB store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            version_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            // Snapshots are already LZ4-compressed by us
            CF_VERSIONS => opts.set_compression_type(DBCompressionType::None),
            _ => opts.set_compression_type(DBCompressionType::Lz4),
        }
        opts
    }

    /// Record `owner` as the owner of `content`.
    pub fn register_owner(&self, content: &ContentRef, owner: &str) -> Result<(), StoreError> {
        let cf = self.cf(CF_OWNERS)?;
        self.db
            .put_cf_opt(&cf, content_key(content), owner.as_bytes(), &self.write_opts())?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn write_opts(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family '{name}' not found")))
    }

    fn load_version(&self, id: Uuid) -> Result<Option<Version>, StoreError> {
        let cf = self.cf(CF_VERSIONS)?;
        match self.db.get_cf(&cf, id.as_bytes())? {
            Some(bytes) => decode_version(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Version ids of `document_id`, ascending by number.
    fn index_scan(&self, document_id: &str) -> Result<Vec<(u64, Uuid)>, StoreError> {
        let cf = self.cf(CF_VERSION_INDEX)?;
        let prefix = index_prefix(document_id);
        let mut entries = Vec::new();

        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) || key.len() != prefix.len() + 8 {
                break;
            }
            let mut number = [0u8; 8];
            number.copy_from_slice(&key[prefix.len()..]);
            let id = Uuid::from_slice(&value)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            entries.push((u64::from_be_bytes(number), id));
        }
        Ok(entries)
    }

    fn all_shares(&self) -> Result<Vec<Share>, StoreError> {
        let cf = self.cf(CF_SHARES)?;
        let mut shares = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item?;
            shares.push(decode(&value)?);
        }
        shares.sort_by(|a: &Share, b: &Share| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(shares)
    }
}

#[async_trait]
impl VersionRepository for RocksStore {
    async fn insert_version(&self, version: &Version) -> Result<(), StoreError> {
        let cf_versions = self.cf(CF_VERSIONS)?;
        let cf_index = self.cf(CF_VERSION_INDEX)?;
        let index_key = index_key(&version.document_id, version.version_number);

        let _guard = self
            .version_lock
            .lock()
            .map_err(|_| StoreError::Database("version lock poisoned".into()))?;
        if self.db.get_cf(&cf_index, &index_key)?.is_some() {
            return Err(StoreError::Conflict(format!(
                "version {} of {} already exists",
                version.version_number, version.document_id
            )));
        }

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_versions, version.id.as_bytes(), encode_version(version)?);
        batch.put_cf(&cf_index, &index_key, version.id.as_bytes());
        self.db.write_opt(batch, &self.write_opts())?;
        Ok(())
    }

    async fn list_versions(&self, document_id: &str) -> Result<Vec<Version>, StoreError> {
        let mut versions = Vec::new();
        for (_, id) in self.index_scan(document_id)? {
            match self.load_version(id)? {
                Some(version) => versions.push(version),
                None => log::warn!("Version index points at missing version {id}"),
            }
        }
        Ok(versions)
    }

    async fn max_version_number(&self, document_id: &str) -> Result<Option<u64>, StoreError> {
        Ok(self
            .index_scan(document_id)?
            .last()
            .map(|(number, _)| *number))
    }

    async fn get_version(&self, id: Uuid) -> Result<Option<Version>, StoreError> {
        self.load_version(id)
    }
}

#[async_trait]
impl ShareRepository for RocksStore {
    async fn insert_share(&self, share: &Share) -> Result<(), StoreError> {
        let cf = self.cf(CF_SHARES)?;
        if self.db.get_cf(&cf, share.id.as_bytes())?.is_some() {
            return Err(StoreError::Conflict(format!("share {} already exists", share.id)));
        }
        self.db
            .put_cf_opt(&cf, share.id.as_bytes(), encode(share)?, &self.write_opts())?;
        Ok(())
    }

    async fn update_share(&self, share: &Share) -> Result<(), StoreError> {
        let cf = self.cf(CF_SHARES)?;
        if self.db.get_cf(&cf, share.id.as_bytes())?.is_none() {
            return Err(StoreError::NotFound(format!("share {}", share.id)));
        }
        self.db
            .put_cf_opt(&cf, share.id.as_bytes(), encode(share)?, &self.write_opts())?;
        Ok(())
    }

    async fn get_share(&self, id: Uuid) -> Result<Option<Share>, StoreError> {
        let cf = self.cf(CF_SHARES)?;
        match self.db.get_cf(&cf, id.as_bytes())? {
            Some(bytes) => decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    async fn shares_for_content(&self, content: &ContentRef) -> Result<Vec<Share>, StoreError> {
        Ok(self
            .all_shares()?
            .into_iter()
            .filter(|share| &share.content == content)
            .collect())
    }

    async fn shares_for_grantee(&self, email: &str) -> Result<Vec<Share>, StoreError> {
        Ok(self
            .all_shares()?
            .into_iter()
            .filter(|share| share.shared_with_email.eq_ignore_ascii_case(email))
            .collect())
    }

    async fn content_owner(&self, content: &ContentRef) -> Result<Option<UserId>, StoreError> {
        let cf = self.cf(CF_OWNERS)?;
        match self.db.get_cf(&cf, content_key(content))? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|e| StoreError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }
}

// ─── Encoding ─────────────────────────────────────────────────────────────

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(value)
}

fn encode_version(version: &Version) -> Result<Vec<u8>, StoreError> {
    let mut stored = version.clone();
    stored.snapshot = lz4_flex::compress_prepend_size(&version.snapshot);
    encode(&stored)
}

fn decode_version(bytes: &[u8]) -> Result<Version, StoreError> {
    let mut version: Version = decode(bytes)?;
    version.snapshot = lz4_flex::decompress_size_prepended(&version.snapshot)
        .map_err(|e| StoreError::Compression(e.to_string()))?;
    Ok(version)
}

fn index_prefix(document_id: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(document_id.len() + 1);
    prefix.extend_from_slice(document_id.as_bytes());
    prefix.push(0);
    prefix
}

/// `<document_id>\0<version_number BE>`; big-endian keeps numeric order.
fn index_key(document_id: &str, version_number: u64) -> Vec<u8> {
    let mut key = index_prefix(document_id);
    key.extend_from_slice(&version_number.to_be_bytes());
    key
}

fn content_key(content: &ContentRef) -> Vec<u8> {
    format!("{}:{}", content.content_type.as_str(), content.content_id).into_bytes()
}
