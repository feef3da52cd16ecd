//! Sealed item store.
//!
//! Orchestrates the record pipeline over RocksDB: item payloads live in the
//! `items` column family as sealed [`StorageRecord`]s, per-item bookkeeping
//! lives in `meta`. Writes take a per-key lock so a transaction and a direct
//! store never interleave on the same item.

use crate::cache::PayloadCache;
use crate::db::{RocksDB, CF_ITEMS, CF_META};
use crate::record::StorageRecord;
use crate::types::{ItemMetadata, Receipt, StorageError, StoragePolicy, StorageStats};
use dashmap::DashMap;
use sanctum_keys::sealing::SealingCipher;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, Semaphore};
use tracing::{debug, warn};

/// Transient backend failures are retried with doubling backoff; integrity
/// and authentication failures never are.
const MAX_BACKEND_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_MS: u64 = 10;

/// How long a writer waits on a key lock before reporting a conflict.
const LOCK_WAIT_MS: u64 = 2_000;

#[derive(Debug, Clone)]
pub struct SealedStoreConfig {
    pub cache_budget_bytes: usize,
    pub max_open_transactions: usize,
}

impl Default for SealedStoreConfig {
    fn default() -> Self {
        Self {
            cache_budget_bytes: 8 * 1024 * 1024,
            max_open_transactions: 64,
        }
    }
}

pub struct SealedStore {
    pub(crate) db: RocksDB,
    pub(crate) cipher: SealingCipher,
    pub(crate) cache: PayloadCache,
    pub(crate) locks: DashMap<String, Arc<Mutex<()>>>,
    pub(crate) tx_permits: Arc<Semaphore>,
}

impl SealedStore {
    pub fn new(db: RocksDB, cipher: SealingCipher, config: SealedStoreConfig) -> Self {
        Self {
            db,
            cipher,
            cache: PayloadCache::new(config.cache_budget_bytes),
            locks: DashMap::new(),
            tx_permits: Arc::new(Semaphore::new(config.max_open_transactions)),
        }
    }

    /// Seal and persist an item, returning a receipt with the plaintext
    /// digest. Overwrites any existing item under the same key.
    pub async fn store(
        &self,
        key: &str,
        value: &[u8],
        policy: &StoragePolicy,
    ) -> Result<Receipt, StorageError> {
        let _guard = self.lock_key(key).await?;
        self.store_locked(key, value, policy).await
    }

    /// Write path shared with transactions; caller holds the key lock.
    pub(crate) async fn store_locked(
        &self,
        key: &str,
        value: &[u8],
        policy: &StoragePolicy,
    ) -> Result<Receipt, StorageError> {
        let now = now_secs();
        let record = StorageRecord::seal(key, value, policy, &self.cipher, now)?;
        let record_bytes = record.encode()?;

        let meta = ItemMetadata {
            key: key.to_string(),
            plaintext_size: value.len() as u64,
            stored_size: record_bytes.len() as u64,
            compressed: record.compressed,
            encrypted: record.encrypted,
            created_at: now,
            accessed_at: now,
            access_count: 0,
        };
        let meta_bytes = bincode::serialize(&meta)?;

        with_backend_retry(|| {
            let mut batch = self.db.batch();
            self.db
                .batch_put_cf(&mut batch, CF_ITEMS, key.as_bytes(), &record_bytes)
                .map_err(backend)?;
            self.db
                .batch_put_cf(&mut batch, CF_META, key.as_bytes(), &meta_bytes)
                .map_err(backend)?;
            self.db.write_batch(batch).map_err(backend)
        })
        .await?;

        self.cache.invalidate(key);
        debug!(key, stored_size = record_bytes.len(), "item sealed");

        Ok(Receipt {
            key: key.to_string(),
            digest: record.digest,
            stored_size: record_bytes.len() as u64,
            compressed: record.compressed,
        })
    }

    /// Unseal and return an item's plaintext. Expired items read as absent.
    pub async fn retrieve(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        if let Some(cached) = self.cache.get(key) {
            self.touch_meta(key)?;
            return Ok(cached.as_ref().clone());
        }

        let bytes =
            with_backend_retry(|| self.db.get_cf(CF_ITEMS, key.as_bytes()).map_err(backend))
                .await?
                .ok_or_else(|| StorageError::NotFound(key.to_string()))?;

        let record = StorageRecord::decode(&bytes)?;
        if record.is_expired(now_secs()) {
            return Err(StorageError::NotFound(key.to_string()));
        }

        let plaintext = record.open(key, &self.cipher)?;
        self.cache.put(key.to_string(), Arc::new(plaintext.clone()));
        self.touch_meta(key)?;
        Ok(plaintext)
    }

    /// Remove an item. Returns whether it existed.
    pub async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let _guard = self.lock_key(key).await?;
        self.delete_locked(key).await
    }

    pub(crate) async fn delete_locked(&self, key: &str) -> Result<bool, StorageError> {
        let existed =
            with_backend_retry(|| self.db.exists_cf(CF_ITEMS, key.as_bytes()).map_err(backend))
                .await?;

        with_backend_retry(|| {
            let mut batch = self.db.batch();
            self.db
                .batch_delete_cf(&mut batch, CF_ITEMS, key.as_bytes())
                .map_err(backend)?;
            self.db
                .batch_delete_cf(&mut batch, CF_META, key.as_bytes())
                .map_err(backend)?;
            self.db.write_batch(batch).map_err(backend)
        })
        .await?;

        self.cache.invalidate(key);
        Ok(existed)
    }

    pub fn exists(&self, key: &str) -> Result<bool, StorageError> {
        match self.db.get_cf(CF_ITEMS, key.as_bytes()).map_err(backend)? {
            Some(bytes) => Ok(!StorageRecord::decode(&bytes)?.is_expired(now_secs())),
            None => Ok(false),
        }
    }

    /// List live keys under a prefix, lexicographically ordered.
    pub fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let now = now_secs();
        let mut keys = Vec::new();
        for (k, v) in self
            .db
            .prefix_iter_cf(CF_ITEMS, prefix.as_bytes())
            .map_err(backend)?
        {
            if !k.starts_with(prefix.as_bytes()) {
                break;
            }
            if StorageRecord::decode(&v)?.is_expired(now) {
                continue;
            }
            match String::from_utf8(k.to_vec()) {
                Ok(s) => keys.push(s),
                Err(_) => warn!("skipping non-utf8 storage key"),
            }
        }
        keys.sort();
        Ok(keys)
    }

    pub fn metadata(&self, key: &str) -> Result<ItemMetadata, StorageError> {
        let bytes = self
            .db
            .get_cf(CF_META, key.as_bytes())
            .map_err(backend)?
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        Ok(bincode::deserialize(&bytes)?)
    }

    pub fn stats(&self) -> Result<StorageStats, StorageError> {
        let mut total_items = 0u64;
        let mut live_bytes = 0u64;
        let mut plaintext_bytes = 0u64;
        let now = now_secs();

        for (k, v) in self.db.iter_cf(CF_META).map_err(backend)? {
            let meta: ItemMetadata = bincode::deserialize(&v)?;
            let live = match self.db.get_cf(CF_ITEMS, &k).map_err(backend)? {
                Some(record_bytes) => !StorageRecord::decode(&record_bytes)?.is_expired(now),
                None => false,
            };
            if live {
                total_items += 1;
                live_bytes += meta.stored_size;
                plaintext_bytes += meta.plaintext_size;
            }
        }

        let fragmentation_ratio = if plaintext_bytes == 0 {
            0.0
        } else {
            live_bytes as f64 / plaintext_bytes as f64
        };

        Ok(StorageStats {
            total_items,
            live_bytes,
            plaintext_bytes,
            fragmentation_ratio,
        })
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush().map_err(backend)
    }

    /// Acquire the per-key write lock, giving up after a bounded wait.
    pub(crate) async fn lock_key(&self, key: &str) -> Result<OwnedMutexGuard<()>, StorageError> {
        let lock = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        tokio::time::timeout(Duration::from_millis(LOCK_WAIT_MS), lock.lock_owned())
            .await
            .map_err(|_| StorageError::TransactionConflict(key.to_string()))
    }

    fn touch_meta(&self, key: &str) -> Result<(), StorageError> {
        if let Some(bytes) = self.db.get_cf(CF_META, key.as_bytes()).map_err(backend)? {
            let mut meta: ItemMetadata = bincode::deserialize(&bytes)?;
            meta.accessed_at = now_secs();
            meta.access_count += 1;
            self.db
                .put_cf(CF_META, key.as_bytes(), &bincode::serialize(&meta)?)
                .map_err(backend)?;
        }
        Ok(())
    }

}

/// Retry transient backend failures with doubling backoff. The backoff
/// yields to the runtime instead of parking the worker thread.
pub(crate) async fn with_backend_retry<T>(
    mut op: impl FnMut() -> Result<T, StorageError>,
) -> Result<T, StorageError> {
    let mut attempt = 0;
    loop {
        match op() {
            Ok(v) => return Ok(v),
            Err(StorageError::Backend(msg)) if attempt + 1 < MAX_BACKEND_ATTEMPTS => {
                attempt += 1;
                warn!(attempt, %msg, "backend error, retrying");
                tokio::time::sleep(Duration::from_millis(BACKOFF_BASE_MS << attempt)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

pub(crate) fn backend(e: anyhow::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

pub(crate) fn now_secs() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}
