//! Write transactions over the sealed store.
//!
//! A transaction buffers puts and deletes, holding the per-key write lock
//! for every key it touches. Commit seals the buffered values and applies
//! them as a single RocksDB write batch; dropping the transaction releases
//! all locks with nothing applied. The number of open transactions is
//! bounded by a semaphore so a stalled caller cannot pin unbounded locks.

use crate::db::{CF_ITEMS, CF_META};
use crate::engine::{backend, now_secs, SealedStore};
use crate::record::StorageRecord;
use crate::types::{ItemMetadata, StorageError, StoragePolicy};
use std::collections::HashMap;
use tokio::sync::{OwnedMutexGuard, OwnedSemaphorePermit};
use tracing::debug;

enum TxOp {
    Put {
        key: String,
        value: Vec<u8>,
        policy: StoragePolicy,
    },
    Delete {
        key: String,
    },
}

pub struct Transaction<'a> {
    store: &'a SealedStore,
    _permit: OwnedSemaphorePermit,
    locks: HashMap<String, OwnedMutexGuard<()>>,
    ops: Vec<TxOp>,
}

impl SealedStore {
    /// Open a transaction. Fails immediately when the open-transaction
    /// bound is exhausted rather than queueing behind stalled writers.
    pub fn begin(&self) -> Result<Transaction<'_>, StorageError> {
        let permit = self
            .tx_permits
            .clone()
            .try_acquire_owned()
            .map_err(|_| StorageError::TransactionLimit)?;
        Ok(Transaction {
            store: self,
            _permit: permit,
            locks: HashMap::new(),
            ops: Vec::new(),
        })
    }
}

impl Transaction<'_> {
    pub async fn put(
        &mut self,
        key: &str,
        value: &[u8],
        policy: StoragePolicy,
    ) -> Result<(), StorageError> {
        self.acquire(key).await?;
        self.ops.push(TxOp::Put {
            key: key.to_string(),
            value: value.to_vec(),
            policy,
        });
        Ok(())
    }

    pub async fn delete(&mut self, key: &str) -> Result<(), StorageError> {
        self.acquire(key).await?;
        self.ops.push(TxOp::Delete {
            key: key.to_string(),
        });
        Ok(())
    }

    /// Read through the transaction's buffered state, falling back to the
    /// committed store for untouched keys.
    pub async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        for op in self.ops.iter().rev() {
            match op {
                TxOp::Put { key: k, value, .. } if k == key => return Ok(value.clone()),
                TxOp::Delete { key: k } if k == key => {
                    return Err(StorageError::NotFound(key.to_string()))
                }
                _ => {}
            }
        }
        self.store.retrieve(key).await
    }

    /// Seal and apply all buffered operations as one atomic batch.
    pub fn commit(self) -> Result<(), StorageError> {
        let now = now_secs();
        let mut batch = self.store.db.batch();
        let mut touched = Vec::with_capacity(self.ops.len());

        for op in &self.ops {
            match op {
                TxOp::Put { key, value, policy } => {
                    let record =
                        StorageRecord::seal(key, value, policy, &self.store.cipher, now)?;
                    let record_bytes = record.encode()?;
                    let meta = ItemMetadata {
                        key: key.clone(),
                        plaintext_size: value.len() as u64,
                        stored_size: record_bytes.len() as u64,
                        compressed: record.compressed,
                        encrypted: record.encrypted,
                        created_at: now,
                        accessed_at: now,
                        access_count: 0,
                    };
                    self.store
                        .db
                        .batch_put_cf(&mut batch, CF_ITEMS, key.as_bytes(), &record_bytes)
                        .map_err(backend)?;
                    self.store
                        .db
                        .batch_put_cf(
                            &mut batch,
                            CF_META,
                            key.as_bytes(),
                            &bincode::serialize(&meta)?,
                        )
                        .map_err(backend)?;
                    touched.push(key.clone());
                }
                TxOp::Delete { key } => {
                    self.store
                        .db
                        .batch_delete_cf(&mut batch, CF_ITEMS, key.as_bytes())
                        .map_err(backend)?;
                    self.store
                        .db
                        .batch_delete_cf(&mut batch, CF_META, key.as_bytes())
                        .map_err(backend)?;
                    touched.push(key.clone());
                }
            }
        }

        self.store.db.write_batch(batch).map_err(backend)?;
        for key in &touched {
            self.store.cache.invalidate(key);
        }
        debug!(ops = touched.len(), "transaction committed");
        Ok(())
    }

    /// Discard all buffered operations. Equivalent to dropping the
    /// transaction; spelled out for call sites that want the intent visible.
    pub fn rollback(self) {
        debug!(ops = self.ops.len(), "transaction rolled back");
    }

    async fn acquire(&mut self, key: &str) -> Result<(), StorageError> {
        if !self.locks.contains_key(key) {
            let guard = self.store.lock_key(key).await?;
            self.locks.insert(key.to_string(), guard);
        }
        Ok(())
    }
}
