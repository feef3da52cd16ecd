use serde::{Deserialize, Serialize};

/// How an item should be persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoragePolicy {
    /// Seal the payload with the enclave storage key. On by default;
    /// turning it off still keeps the integrity digest.
    pub encrypt: bool,
    /// Attempt LZ4 compression. Skipped when it does not reduce size.
    pub compress: bool,
    /// Seconds until the item expires. `None` means no expiry.
    pub ttl_secs: Option<u64>,
}

impl Default for StoragePolicy {
    fn default() -> Self {
        Self {
            encrypt: true,
            compress: false,
            ttl_secs: None,
        }
    }
}

/// Returned by a successful store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    pub key: String,
    /// BLAKE3 digest of the plaintext.
    pub digest: [u8; 32],
    /// Bytes actually written (after compression and sealing).
    pub stored_size: u64,
    pub compressed: bool,
}

/// Per-item bookkeeping, kept separate from the sealed record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemMetadata {
    pub key: String,
    pub plaintext_size: u64,
    pub stored_size: u64,
    pub compressed: bool,
    pub encrypted: bool,
    pub created_at: u64,
    pub accessed_at: u64,
    pub access_count: u64,
}

/// Aggregate view over the store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageStats {
    pub total_items: u64,
    pub live_bytes: u64,
    pub plaintext_bytes: u64,
    /// Dead bytes / live bytes, as estimated from overwrite and delete
    /// churn since the last compaction.
    pub fragmentation_ratio: f64,
}

/// Storage-engine failures.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("integrity failure for {0}")]
    IntegrityFailure(String),

    #[error("transaction conflict on key {0}")]
    TransactionConflict(String),

    #[error("transaction limit reached")]
    TransactionLimit,

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<bincode::Error> for StorageError {
    fn from(e: bincode::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}
