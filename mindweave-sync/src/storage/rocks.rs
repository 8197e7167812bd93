//! RocksDB-backed change log and access records.
//!
//! Column families:
//! - `documents`     : Document records (bincode), keyed by doc_id
//! - `changes`       : Changes keyed by `doc_id:16 ++ version:8 BE`, payload LZ4 compressed
//! - `collaborators` : Access-level records keyed by `doc_id:16 ++ user_id:16`
//! - `share_links`   : Share links keyed by link_id
//!
//! Big-endian version suffixes make a forward iterator over one document's
//! prefix yield changes in version order, so `read_since` is a plain range
//! scan that never takes the commit lock.
//!
//! Reference: Kleppmann, DDIA, Chapter 3 (LSM Trees, SSTables)

use parking_lot::Mutex;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, SliceTransform, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::{check_batch, decode, encode, AccessRecords, ChangeLog, StoreError};
use crate::model::{now_millis, Change, Collaborator, Document, ShareLink};

const CF_DOCUMENTS: &str = "documents";
const CF_CHANGES: &str = "changes";
const CF_COLLABORATORS: &str = "collaborators";
const CF_SHARE_LINKS: &str = "share_links";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_CHANGES, CF_COLLABORATORS, CF_SHARE_LINKS];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every commit (default: true)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("mindweave_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
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

/// On-disk form of a [`Change`]: payload LZ4 compressed.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredChange {
    id: Uuid,
    doc_id: Uuid,
    author: Uuid,
    timestamp: u64,
    version: u64,
    original_size: u32,
    compressed: Vec<u8>,
}

impl StoredChange {
    fn compress(change: &Change) -> Self {
        Self {
            id: change.id,
            doc_id: change.doc_id,
            author: change.author,
            timestamp: change.timestamp,
            version: change.version,
            original_size: change.payload.len() as u32,
            compressed: lz4_flex::compress_prepend_size(&change.payload),
        }
    }

    fn decompress(self) -> Result<Change, StoreError> {
        let payload = lz4_flex::decompress_size_prepended(&self.compressed)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        if payload.len() != self.original_size as usize {
            return Err(StoreError::Corrupt(format!(
                "change {} decompressed to {} bytes, expected {}",
                self.id,
                payload.len(),
                self.original_size
            )));
        }
        Ok(Change {
            id: self.id,
            doc_id: self.doc_id,
            author: self.author,
            timestamp: self.timestamp,
            version: self.version,
            payload,
        })
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// RocksDB-backed store.
pub struct RocksStore {
    /// RocksDB instance (single-threaded CF mode, column families fixed at open)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes every read-check-write of a document record.
    commit_lock: Mutex<()>,
}

impl RocksStore {
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

        log::info!("Opened change log at {}", config.path.display());

        Ok(Self {
            db,
            config,
            commit_lock: Mutex::new(()),
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
            CF_DOCUMENTS | CF_SHARE_LINKS => {
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_CHANGES | CF_COLLABORATORS => {
                // Prefix-scanned by doc_id
                opts.set_prefix_extractor(SliceTransform::create_fixed_prefix(16));
                // Payloads are already LZ4 compressed per change
                opts.set_compression_type(if name == CF_CHANGES {
                    DBCompressionType::None
                } else {
                    DBCompressionType::Lz4
                });
            }
            _ => {}
        }

        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    fn load_document(&self, doc_id: Uuid) -> Result<Option<Document>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(cf, doc_id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Key: doc_id (16 bytes) + version (8 bytes big-endian).
    fn change_key(doc_id: Uuid, version: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(doc_id.as_bytes());
        key.extend_from_slice(&version.to_be_bytes());
        key
    }

    /// Key: doc_id (16 bytes) + user_id (16 bytes).
    fn collaborator_key(doc_id: Uuid, user_id: Uuid) -> Vec<u8> {
        let mut key = Vec::with_capacity(32);
        key.extend_from_slice(doc_id.as_bytes());
        key.extend_from_slice(user_id.as_bytes());
        key
    }

    /// All values under a 16-byte document prefix.
    fn scan_prefix(&self, cf_name: &str, doc_id: Uuid) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>, StoreError> {
        let cf = self.cf(cf_name)?;
        let prefix = doc_id.as_bytes();
        let mut out = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward))
        {
            let (key, value) = item?;
            if key.len() < 16 || &key[..16] != prefix {
                break;
            }
            out.push((key, value));
        }
        Ok(out)
    }
}

impl ChangeLog for RocksStore {
    fn create_document(&self, doc: Document) -> Result<Document, StoreError> {
        let _guard = self.commit_lock.lock();
        if self.load_document(doc.id)?.is_some() {
            return Err(StoreError::AlreadyExists(doc.id));
        }
        let cf = self.cf(CF_DOCUMENTS)?;
        self.db
            .put_cf_opt(cf, doc.id.as_bytes(), encode(&doc)?, &self.write_options())?;
        Ok(doc)
    }

    fn document(&self, doc_id: Uuid) -> Result<Document, StoreError> {
        self.load_document(doc_id)?.ok_or(StoreError::NotFound(doc_id))
    }

    fn append_batch(&self, doc_id: Uuid, changes: Vec<Change>) -> Result<u64, StoreError> {
        let _guard = self.commit_lock.lock();
        let mut doc = self.load_document(doc_id)?.ok_or(StoreError::NotFound(doc_id))?;
        check_batch(doc_id, doc.version, &changes)?;

        let Some(last) = changes.last() else {
            return Ok(doc.version);
        };
        doc.version = last.version;
        doc.updated_at = now_millis();

        // Changes + new version in one atomic batch
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_changes = self.cf(CF_CHANGES)?;
        let mut batch = WriteBatch::default();
        for change in &changes {
            let stored = StoredChange::compress(change);
            batch.put_cf(cf_changes, Self::change_key(doc_id, change.version), encode(&stored)?);
        }
        batch.put_cf(cf_docs, doc_id.as_bytes(), encode(&doc)?);
        self.db.write_opt(batch, &self.write_options())?;

        log::debug!("Appended {} change(s) to {doc_id}, now at v{}", changes.len(), doc.version);
        Ok(doc.version)
    }

    fn read_since(&self, doc_id: Uuid, since: u64) -> Result<Vec<Change>, StoreError> {
        if self.load_document(doc_id)?.is_none() {
            return Err(StoreError::NotFound(doc_id));
        }
        let cf = self.cf(CF_CHANGES)?;
        let start = Self::change_key(doc_id, since.saturating_add(1));

        let mut changes = Vec::new();
        let mut expected = since + 1;
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Forward))
        {
            let (key, value) = item?;
            if key.len() != 24 || &key[..16] != doc_id.as_bytes() {
                break;
            }
            let stored: StoredChange = decode(&value)?;
            if stored.version != expected {
                return Err(StoreError::Corrupt(format!(
                    "document {doc_id}: expected version {expected}, found {}",
                    stored.version
                )));
            }
            changes.push(stored.decompress()?);
            expected += 1;
        }
        Ok(changes)
    }

    fn list_documents(&self) -> Result<Vec<Uuid>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let bytes: [u8; 16] = key
                .as_ref()
                .try_into()
                .map_err(|_| StoreError::Serialization("Invalid document key".into()))?;
            ids.push(Uuid::from_bytes(bytes));
        }
        Ok(ids)
    }
}

impl AccessRecords for RocksStore {
    fn collaborators(&self, doc_id: Uuid) -> Result<Vec<Collaborator>, StoreError> {
        let mut records = self
            .scan_prefix(CF_COLLABORATORS, doc_id)?
            .into_iter()
            .map(|(_, value)| decode::<Collaborator>(&value))
            .collect::<Result<Vec<_>, _>>()?;
        records.sort_by_key(|c| (c.added_at, c.user_id));
        Ok(records)
    }

    fn collaborator(&self, doc_id: Uuid, user_id: Uuid) -> Result<Option<Collaborator>, StoreError> {
        let cf = self.cf(CF_COLLABORATORS)?;
        match self.db.get_cf(cf, Self::collaborator_key(doc_id, user_id))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put_collaborator(&self, record: Collaborator) -> Result<(), StoreError> {
        let _guard = self.commit_lock.lock();
        let mut doc = self
            .load_document(record.doc_id)?
            .ok_or(StoreError::NotFound(record.doc_id))?;
        doc.collaborators.insert(record.user_id);

        let mut batch = WriteBatch::default();
        batch.put_cf(
            self.cf(CF_COLLABORATORS)?,
            Self::collaborator_key(record.doc_id, record.user_id),
            encode(&record)?,
        );
        batch.put_cf(self.cf(CF_DOCUMENTS)?, doc.id.as_bytes(), encode(&doc)?);
        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }

    fn remove_collaborator(&self, doc_id: Uuid, user_id: Uuid) -> Result<bool, StoreError> {
        let _guard = self.commit_lock.lock();
        let key = Self::collaborator_key(doc_id, user_id);
        let cf = self.cf(CF_COLLABORATORS)?;
        if self.db.get_cf(cf, &key)?.is_none() {
            return Ok(false);
        }

        let mut batch = WriteBatch::default();
        batch.delete_cf(cf, &key);
        if let Some(mut doc) = self.load_document(doc_id)? {
            doc.collaborators.remove(&user_id);
            batch.put_cf(self.cf(CF_DOCUMENTS)?, doc.id.as_bytes(), encode(&doc)?);
        }
        self.db.write_opt(batch, &self.write_options())?;
        Ok(true)
    }

    fn put_share_link(&self, link: ShareLink) -> Result<(), StoreError> {
        if self.load_document(link.doc_id)?.is_none() {
            return Err(StoreError::NotFound(link.doc_id));
        }
        let cf = self.cf(CF_SHARE_LINKS)?;
        self.db
            .put_cf_opt(cf, link.id.as_bytes(), encode(&link)?, &self.write_options())?;
        Ok(())
    }

    fn share_link(&self, link_id: Uuid) -> Result<Option<ShareLink>, StoreError> {
        let cf = self.cf(CF_SHARE_LINKS)?;
        match self.db.get_cf(cf, link_id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn share_links(&self, doc_id: Uuid) -> Result<Vec<ShareLink>, StoreError> {
        // Share links are keyed by their own id; a full scan is fine for the
        // handful of links a document carries.
        let cf = self.cf(CF_SHARE_LINKS)?;
        let mut links = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let link: ShareLink = decode(&value)?;
            if link.doc_id == doc_id {
                links.push(link);
            }
        }
        links.sort_by_key(|l| l.created_at);
        Ok(links)
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
