//! On-disk scored eviction cache.
//!
//! Layout under the cache directory:
//!
//! - `index/`: LMDB environment with two databases. `entries` maps the
//!   hex digest of a [`CacheKey`] to its [`IndexEntry`], which carries the
//!   full encoded key; `meta` holds the scorer state and the total cost of
//!   live entries. Keying by digest keeps index keys under LMDB's key size
//!   limit however long the resource path and parameters are.
//! - `data/<xx>/<digest>-<random>.bin`: immutable payload files.
//!
//! A payload is written to a fresh file before the index transaction that
//! references it commits, and replaced or evicted payload files are removed
//! only after their removal from the index commits. A reader therefore
//! either sees the old entry or the new one, never a partial file.
//!
//! LMDB admits a single write transaction at a time across every process
//! that opens the same directory, which serialises index mutation between
//! processes sharing the cache. Read transactions never block.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions, RoTxn, RwTxn};
use serde::{Deserialize, Serialize};
use strata_core::{
    CacheConfig, CacheError, CacheKey, CacheResult, ConfigError, Timestamp, DISK_HEADROOM_BYTES,
};
use tracing::{debug, info, warn};

use crate::scorer::{Rank, Ranking, Scorer};
use crate::traits::{Cache, CacheStats, CachedResource, PutOutcome, ResourceMetadata};

const INDEX_DIR: &str = "index";
const DATA_DIR: &str = "data";
const ENTRIES_DB: &str = "entries";
const META_DB: &str = "meta";
const META_KEY: &str = "state";

/// Index record for one cached payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    /// Encoded [`CacheKey`], compared on lookup.
    key: Vec<u8>,
    /// Payload path relative to the cache root.
    file: String,
    cost: u64,
    rank: Rank,
    metadata: ResourceMetadata,
    access_count: u64,
    last_access: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexMeta {
    scorer: Scorer,
    used: u64,
}

/// An index entry removed to make room; its file is deleted after commit.
struct Victim {
    key: Vec<u8>,
    file: String,
}

/// Index slot of `key`.
fn index_slot(key: &CacheKey) -> String {
    key.digest()
}

fn index_err(e: heed::Error) -> CacheError {
    CacheError::Index {
        reason: e.to_string(),
    }
}

fn serde_err(e: serde_json::Error) -> CacheError {
    CacheError::Serialization {
        reason: e.to_string(),
    }
}

/// Cache persisted in a directory and shareable between processes.
pub struct DiskCache {
    root: PathBuf,
    env: Env,
    entries: Database<Str, Bytes>,
    meta: Database<Str, Bytes>,
    capacity: u64,
    error_if_full: bool,
    halflife: f64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl DiskCache {
    /// Open (or create) the cache at `config.path`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `path` is not set or the configuration is invalid
    /// - the directory or the LMDB index cannot be created
    /// - free space cannot be determined and no `available_bytes` was given
    /// - existing entries exceed the budget and `cull_on_startup` is off
    pub fn open(config: &CacheConfig) -> CacheResult<Self> {
        config.validate()?;
        let root = config
            .path
            .clone()
            .ok_or_else(|| ConfigError::MissingRequired {
                field: "path".to_string(),
            })?;

        let index_dir = root.join(INDEX_DIR);
        fs::create_dir_all(&index_dir).map_err(|e| CacheError::io(index_dir.display(), e))?;
        let data_dir = root.join(DATA_DIR);
        fs::create_dir_all(&data_dir).map_err(|e| CacheError::io(data_dir.display(), e))?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(config.index_map_size)
                .max_dbs(2)
                .open(&index_dir)
        }
        .map_err(index_err)?;

        let mut wtxn = env.write_txn().map_err(index_err)?;
        let entries: Database<Str, Bytes> = env
            .create_database(&mut wtxn, Some(ENTRIES_DB))
            .map_err(index_err)?;
        let meta: Database<Str, Bytes> = env
            .create_database(&mut wtxn, Some(META_DB))
            .map_err(index_err)?;
        wtxn.commit().map_err(index_err)?;

        let mut cache = Self {
            root,
            env,
            entries,
            meta,
            capacity: 0,
            error_if_full: config.error_if_full,
            halflife: config.halflife,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        };

        cache.capacity = match config.available_bytes {
            Some(bytes) => bytes,
            None => {
                // Space the cache already occupies counts toward its budget.
                let used = cache.used_bytes()?;
                (free_space(&cache.root)? + used).saturating_sub(DISK_HEADROOM_BYTES)
            }
        };

        cache.enforce_budget(config.cull_on_startup)?;
        info!(
            path = %cache.root.display(),
            capacity = cache.capacity,
            "Opened disk cache"
        );
        Ok(cache)
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Total cost of live entries, as recorded in the index.
    pub fn used_bytes(&self) -> CacheResult<u64> {
        let rtxn = self.env.read_txn().map_err(index_err)?;
        Ok(self.read_meta(&rtxn)?.used)
    }

    pub fn contains(&self, key: &CacheKey) -> CacheResult<bool> {
        let rtxn = self.env.read_txn().map_err(index_err)?;
        Ok(self.read_entry(&rtxn, key)?.is_some())
    }

    fn read_meta(&self, txn: &RoTxn) -> CacheResult<IndexMeta> {
        match self.meta.get(txn, META_KEY).map_err(index_err)? {
            Some(bytes) => serde_json::from_slice(bytes).map_err(serde_err),
            None => Ok(IndexMeta {
                scorer: Scorer::new(self.halflife),
                used: 0,
            }),
        }
    }

    fn write_meta(&self, txn: &mut RwTxn, meta: &IndexMeta) -> CacheResult<()> {
        let bytes = serde_json::to_vec(meta).map_err(serde_err)?;
        self.meta.put(txn, META_KEY, &bytes).map_err(index_err)
    }

    /// Whatever entry occupies the slot of `key`, even one for another key.
    fn read_slot(&self, txn: &RoTxn, slot: &str) -> CacheResult<Option<IndexEntry>> {
        match self.entries.get(txn, slot).map_err(index_err)? {
            Some(bytes) => serde_json::from_slice(bytes).map(Some).map_err(serde_err),
            None => Ok(None),
        }
    }

    fn read_entry(&self, txn: &RoTxn, key: &CacheKey) -> CacheResult<Option<IndexEntry>> {
        let entry = self.read_slot(txn, &index_slot(key))?;
        Ok(entry.filter(|entry| entry.key == key.encode()))
    }

    fn write_entry(&self, txn: &mut RwTxn, slot: &str, entry: &IndexEntry) -> CacheResult<()> {
        let bytes = serde_json::to_vec(entry).map_err(serde_err)?;
        self.entries.put(txn, slot, &bytes).map_err(index_err)
    }

    fn all_entries(&self, txn: &RoTxn) -> CacheResult<Vec<(String, IndexEntry)>> {
        let mut out = Vec::new();
        for item in self.entries.iter(txn).map_err(index_err)? {
            let (slot, bytes) = item.map_err(index_err)?;
            let entry: IndexEntry = serde_json::from_slice(bytes).map_err(serde_err)?;
            out.push((slot.to_string(), entry));
        }
        Ok(out)
    }

    /// Remove lowest-ranked entries until `incoming` more bytes fit.
    fn evict_for(
        &self,
        txn: &mut RwTxn,
        meta: &mut IndexMeta,
        incoming: u64,
    ) -> CacheResult<Vec<Victim>> {
        if meta.used + incoming <= self.capacity {
            return Ok(Vec::new());
        }
        let mut ranking: Ranking<(String, IndexEntry)> = self
            .all_entries(txn)?
            .into_iter()
            .map(|(slot, entry)| (entry.rank, (slot, entry)))
            .collect();

        let mut victims = Vec::new();
        while meta.used + incoming > self.capacity {
            let Some((rank, (slot, IndexEntry { key, file, cost, .. }))) = ranking.pop_lowest()
            else {
                break;
            };
            self.entries.delete(txn, &slot).map_err(index_err)?;
            meta.used = meta.used.saturating_sub(cost);
            debug!(cost, score = rank.score, file = %file, "Evicted disk cache entry");
            victims.push(Victim { key, file });
        }
        self.evictions
            .fetch_add(victims.len() as u64, Ordering::Relaxed);
        Ok(victims)
    }

    fn maybe_rescale(&self, txn: &mut RwTxn, meta: &mut IndexMeta) -> CacheResult<()> {
        if !meta.scorer.needs_rescale() {
            return Ok(());
        }
        let factor = meta.scorer.rescale();
        for (slot, mut entry) in self.all_entries(txn)? {
            entry.rank.score /= factor;
            self.write_entry(txn, &slot, &entry)?;
        }
        Ok(())
    }

    fn enforce_budget(&self, cull: bool) -> CacheResult<()> {
        let mut wtxn = self.env.write_txn().map_err(index_err)?;
        let mut meta = self.read_meta(&wtxn)?;
        if meta.used <= self.capacity {
            return Ok(());
        }
        if !cull {
            return Err(CacheError::OverBudget {
                used: meta.used,
                capacity: self.capacity,
            });
        }
        let victims = self.evict_for(&mut wtxn, &mut meta, 0)?;
        self.write_meta(&mut wtxn, &meta)?;
        wtxn.commit().map_err(index_err)?;
        info!(
            culled = victims.len(),
            used = meta.used,
            capacity = self.capacity,
            "Culled over-budget disk cache at startup"
        );
        self.remove_files(victims.iter().map(|v| v.file.as_str()));
        Ok(())
    }

    fn write_payload(&self, key: &CacheKey, body: &[u8]) -> CacheResult<String> {
        let digest = key.digest();
        let dir = self.root.join(DATA_DIR).join(&digest[..2]);
        fs::create_dir_all(&dir).map_err(|e| CacheError::io(dir.display(), e))?;

        let mut file = tempfile::Builder::new()
            .prefix(&format!("{digest}-"))
            .suffix(".bin")
            .tempfile_in(&dir)
            .map_err(|e| CacheError::io(dir.display(), e))?;
        file.write_all(body)
            .map_err(|e| CacheError::io(file.path().display(), e))?;
        file.as_file()
            .sync_all()
            .map_err(|e| CacheError::io(file.path().display(), e))?;
        let (_, path) = file
            .keep()
            .map_err(|e| CacheError::io(dir.display(), e.error))?;

        let relative = path.strip_prefix(&self.root).unwrap_or(&path);
        Ok(relative.to_string_lossy().into_owned())
    }

    fn commit_put(
        &self,
        key: &CacheKey,
        file: String,
        cost: u64,
        metadata: ResourceMetadata,
    ) -> CacheResult<(PutOutcome, Vec<String>)> {
        let slot = index_slot(key);
        let encoded = key.encode();
        let mut wtxn = self.env.write_txn().map_err(index_err)?;
        let mut meta = self.read_meta(&wtxn)?;
        // A digest collision displaces the other key's entry.
        let previous = self.read_slot(&wtxn, &slot)?;
        let used_without = meta.used - previous.as_ref().map_or(0, |e| e.cost);

        if used_without + cost > self.capacity && self.error_if_full {
            return Err(CacheError::Full {
                key: key.to_string(),
                required: cost,
                free: self.capacity.saturating_sub(used_without),
                capacity: self.capacity,
            });
        }

        let mut stale_files = Vec::new();
        let (prior_score, order) = match previous {
            Some(old) => {
                self.entries.delete(&mut wtxn, &slot).map_err(index_err)?;
                meta.used = used_without;
                stale_files.push(old.file);
                if old.key == encoded {
                    (old.rank.score, old.rank.order)
                } else {
                    warn!(key = %key, "Cache key digest collision, replacing entry");
                    (0.0, meta.scorer.next_order())
                }
            }
            None => (0.0, meta.scorer.next_order()),
        };

        let victims = self.evict_for(&mut wtxn, &mut meta, cost)?;
        let evicted = victims
            .iter()
            .filter_map(|v| CacheKey::decode(&v.key))
            .collect();
        stale_files.extend(victims.into_iter().map(|v| v.file));

        let entry = IndexEntry {
            key: encoded,
            file,
            cost,
            rank: Rank::new(meta.scorer.touch(prior_score, cost), order),
            metadata,
            access_count: 0,
            last_access: Utc::now(),
        };
        self.write_entry(&mut wtxn, &slot, &entry)?;
        meta.used += cost;
        self.maybe_rescale(&mut wtxn, &mut meta)?;
        self.write_meta(&mut wtxn, &meta)?;
        wtxn.commit().map_err(index_err)?;

        Ok((PutOutcome::Stored { evicted }, stale_files))
    }

    /// Record a hit against `key` if it still points at `file`.
    fn touch(&self, key: &CacheKey, file: &str) -> CacheResult<()> {
        let mut wtxn = self.env.write_txn().map_err(index_err)?;
        let Some(mut entry) = self.read_entry(&wtxn, key)? else {
            return Ok(());
        };
        if entry.file != file {
            return Ok(());
        }
        let mut meta = self.read_meta(&wtxn)?;
        entry.rank.score = meta.scorer.touch(entry.rank.score, entry.cost);
        entry.access_count += 1;
        entry.last_access = Utc::now();
        self.write_entry(&mut wtxn, &index_slot(key), &entry)?;
        self.maybe_rescale(&mut wtxn, &mut meta)?;
        self.write_meta(&mut wtxn, &meta)?;
        wtxn.commit().map_err(index_err)
    }

    /// Drop an index entry whose payload file has disappeared.
    fn drop_stale(&self, key: &CacheKey, file: &str) -> CacheResult<()> {
        let mut wtxn = self.env.write_txn().map_err(index_err)?;
        let Some(entry) = self.read_entry(&wtxn, key)? else {
            return Ok(());
        };
        if entry.file != file {
            return Ok(());
        }
        let mut meta = self.read_meta(&wtxn)?;
        self.entries.delete(&mut wtxn, &index_slot(key)).map_err(index_err)?;
        meta.used = meta.used.saturating_sub(entry.cost);
        self.write_meta(&mut wtxn, &meta)?;
        wtxn.commit().map_err(index_err)
    }

    fn remove_files<'a>(&self, files: impl IntoIterator<Item = &'a str>) {
        for file in files {
            let path = self.root.join(file);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove cache payload"),
            }
        }
    }
}

impl Cache for DiskCache {
    fn get(&self, key: &CacheKey) -> CacheResult<Option<CachedResource>> {
        let entry = {
            let rtxn = self.env.read_txn().map_err(index_err)?;
            self.read_entry(&rtxn, key)?
        };
        let Some(entry) = entry else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        let path = self.root.join(&entry.file);
        let body = match fs::read(&path) {
            Ok(body) => body,
            Err(e) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                if e.kind() == ErrorKind::NotFound {
                    warn!(key = %key, path = %path.display(), "Cached payload missing, dropping index entry");
                    if let Err(err) = self.drop_stale(key, &entry.file) {
                        warn!(key = %key, error = %err, "Failed to drop stale index entry");
                    }
                } else {
                    warn!(key = %key, path = %path.display(), error = %e, "Failed to read cached payload, treating as miss");
                }
                return Ok(None);
            }
        };

        if let Err(e) = self.touch(key, &entry.file) {
            warn!(key = %key, error = %e, "Failed to update cache score");
        }
        self.hits.fetch_add(1, Ordering::Relaxed);
        Ok(Some(CachedResource::new(body, entry.metadata)))
    }

    fn put(&self, key: &CacheKey, resource: CachedResource, cost: u64) -> CacheResult<PutOutcome> {
        if cost > self.capacity {
            if self.error_if_full {
                return Err(CacheError::Full {
                    key: key.to_string(),
                    required: cost,
                    free: self.capacity.saturating_sub(self.used_bytes()?),
                    capacity: self.capacity,
                });
            }
            warn!(key = %key, cost, capacity = self.capacity, "Entry larger than cache budget, not cached");
            // The cached representation is outdated by this one.
            if let Err(e) = self.discard(key) {
                warn!(key = %key, error = %e, "Failed to drop outdated cache entry");
            }
            return Ok(PutOutcome::TooLarge);
        }

        let file = match self.write_payload(key, &resource.body) {
            Ok(file) => file,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to write cache payload, not cached");
                return Ok(PutOutcome::NotCached);
            }
        };

        match self.commit_put(key, file.clone(), cost, resource.metadata) {
            Ok((outcome, stale_files)) => {
                if !outcome.evicted().is_empty() {
                    debug!(key = %key, evicted = outcome.evicted().len(), "Made room in disk cache");
                }
                self.remove_files(stale_files.iter().map(String::as_str));
                Ok(outcome)
            }
            Err(e) => {
                self.remove_files([file.as_str()]);
                if matches!(e, CacheError::Full { .. }) {
                    return Err(e);
                }
                warn!(key = %key, error = %e, "Failed to index cache payload, not cached");
                Ok(PutOutcome::NotCached)
            }
        }
    }

    fn discard(&self, key: &CacheKey) -> CacheResult<()> {
        let mut wtxn = self.env.write_txn().map_err(index_err)?;
        let Some(entry) = self.read_entry(&wtxn, key)? else {
            return Ok(());
        };
        let mut meta = self.read_meta(&wtxn)?;
        self.entries.delete(&mut wtxn, &index_slot(key)).map_err(index_err)?;
        meta.used = meta.used.saturating_sub(entry.cost);
        self.write_meta(&mut wtxn, &meta)?;
        wtxn.commit().map_err(index_err)?;
        self.remove_files([entry.file.as_str()]);
        Ok(())
    }

    fn clear(&self) -> CacheResult<()> {
        let mut wtxn = self.env.write_txn().map_err(index_err)?;
        let files: Vec<String> = self
            .all_entries(&wtxn)?
            .into_iter()
            .map(|(_, entry)| entry.file)
            .collect();
        let mut meta = self.read_meta(&wtxn)?;
        self.entries.clear(&mut wtxn).map_err(index_err)?;
        meta.used = 0;
        self.write_meta(&mut wtxn, &meta)?;
        wtxn.commit().map_err(index_err)?;
        info!(removed = files.len(), "Cleared disk cache");
        self.remove_files(files.iter().map(String::as_str));
        Ok(())
    }

    fn stats(&self) -> CacheStats {
        let (entry_count, bytes_used) = match self.env.read_txn() {
            Ok(rtxn) => {
                let count = self.entries.len(&rtxn).unwrap_or(0);
                let used = self.read_meta(&rtxn).map(|m| m.used).unwrap_or(0);
                (count, used)
            }
            Err(e) => {
                warn!(error = %e, "Failed to read disk cache stats");
                (0, 0)
            }
        };
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count,
            bytes_used,
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }
}

// TODO: sweep payload files orphaned by a crash between payload write and
// index commit; they are never referenced and only cost disk space.

#[cfg(unix)]
fn free_space(path: &Path) -> CacheResult<u64> {
    let stat = nix::sys::statvfs::statvfs(path).map_err(|e| CacheError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    Ok((stat.blocks_available() as u64).saturating_mul(stat.fragment_size() as u64))
}

#[cfg(not(unix))]
fn free_space(path: &Path) -> CacheResult<u64> {
    Err(CacheError::Config(ConfigError::MissingRequired {
        field: format!("available_bytes (free space of {} is unknown)", path.display()),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn key(name: &str) -> CacheKey {
        CacheKey::new(name, "application/octet-stream")
    }

    fn resource(fill: u8, len: usize) -> CachedResource {
        CachedResource::new(vec![fill; len], ResourceMetadata::new(Some("\"v1\"".into()), None))
    }

    fn open(dir: &TempDir, budget: u64) -> DiskCache {
        DiskCache::open(&CacheConfig::on_disk(dir.path()).with_available_bytes(budget))
            .expect("open disk cache")
    }

    #[test]
    fn test_requires_path() {
        let err = DiskCache::open(&CacheConfig::default()).err();
        assert!(matches!(err, Some(CacheError::Config(_))));
    }

    #[test]
    fn test_put_and_get() {
        let dir = TempDir::new().expect("tempdir");
        let cache = open(&dir, 1024);
        cache.put(&key("a"), resource(1, 10), 10).expect("put");

        let hit = cache.get(&key("a")).expect("get").expect("hit");
        assert_eq!(&*hit.body, &[1u8; 10]);
        assert_eq!(hit.metadata.etag.as_deref(), Some("\"v1\""));
        assert!(cache.get(&key("b")).expect("get").is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entry_count, 1);
        assert_eq!(stats.bytes_used, 10);
    }

    #[test]
    fn test_overwrite_removes_old_payload() {
        let dir = TempDir::new().expect("tempdir");
        let cache = open(&dir, 1024);
        cache.put(&key("a"), resource(1, 10), 10).expect("put");
        cache.put(&key("a"), resource(2, 20), 20).expect("put");

        let hit = cache.get(&key("a")).expect("get").expect("hit");
        assert_eq!(&*hit.body, &[2u8; 20]);
        assert_eq!(cache.used_bytes().expect("used"), 20);

        let digest = key("a").digest();
        let files = fs::read_dir(dir.path().join(DATA_DIR).join(&digest[..2]))
            .expect("data dir")
            .count();
        assert_eq!(files, 1);
    }

    #[test]
    fn test_missing_payload_is_a_miss() {
        let dir = TempDir::new().expect("tempdir");
        let cache = open(&dir, 1024);
        cache.put(&key("a"), resource(1, 10), 10).expect("put");

        let digest = key("a").digest();
        let shard = dir.path().join(DATA_DIR).join(&digest[..2]);
        for file in fs::read_dir(&shard).expect("shard") {
            fs::remove_file(file.expect("entry").path()).expect("remove");
        }

        assert!(cache.get(&key("a")).expect("get").is_none());
        assert!(!cache.contains(&key("a")).expect("contains"));
        assert_eq!(cache.used_bytes().expect("used"), 0);
    }

    #[test]
    fn test_clear_removes_payloads() {
        let dir = TempDir::new().expect("tempdir");
        let cache = open(&dir, 1024);
        cache.put(&key("a"), resource(1, 10), 10).expect("put");
        cache.put(&key("b"), resource(2, 10), 10).expect("put");
        cache.clear().expect("clear");

        assert_eq!(cache.stats().entry_count, 0);
        assert!(cache.get(&key("a")).expect("get").is_none());
        for digest in [key("a").digest(), key("b").digest()] {
            let shard = dir.path().join(DATA_DIR).join(&digest[..2]);
            let remaining = fs::read_dir(&shard).map(|d| d.count()).unwrap_or(0);
            assert_eq!(remaining, 0);
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_default_budget_uses_free_space() {
        let dir = TempDir::new().expect("tempdir");
        let cache = DiskCache::open(&CacheConfig::on_disk(dir.path())).expect("open");
        let free = free_space(dir.path()).expect("statvfs");
        assert!(cache.capacity() <= free.saturating_sub(DISK_HEADROOM_BYTES) + free / 100);
    }
}
