//! On-disk record format for sealed items.
//!
//! A record travels as a bincode-encoded [`StorageRecord`]. The payload is
//! transformed plaintext -> compress (lz4) -> encrypt (sealing cipher), and
//! the digest is a blake3 hash of the original plaintext so integrity is
//! checked after the full reverse pipeline, not just the AEAD tag.

use crate::types::{StorageError, StoragePolicy};
use sanctum_keys::sealing::SealingCipher;
use serde::{Deserialize, Serialize};

pub const RECORD_VERSION: u8 = 1;

/// Compression is skipped when lz4 fails to shrink the payload; small or
/// already-dense inputs routinely expand under framing overhead.
const COMPRESS_MIN_LEN: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageRecord {
    pub version: u8,
    pub compressed: bool,
    pub encrypted: bool,
    /// blake3 digest of the plaintext before any transformation.
    pub digest: [u8; 32],
    pub created_at: u64,
    /// Unix seconds after which the record is dead. Zero means no expiry.
    pub expires_at: u64,
    pub payload: Vec<u8>,
}

impl StorageRecord {
    /// Build a record from plaintext according to the item's policy.
    ///
    /// The logical key is bound into the AEAD as associated data, so a
    /// record copied under a different key fails authentication.
    pub fn seal(
        key: &str,
        plaintext: &[u8],
        policy: &StoragePolicy,
        cipher: &SealingCipher,
        now: u64,
    ) -> Result<Self, StorageError> {
        let digest = *blake3::hash(plaintext).as_bytes();

        let (payload, compressed) = if policy.compress && plaintext.len() >= COMPRESS_MIN_LEN {
            let packed = lz4_flex::compress_prepend_size(plaintext);
            if packed.len() < plaintext.len() {
                (packed, true)
            } else {
                (plaintext.to_vec(), false)
            }
        } else {
            (plaintext.to_vec(), false)
        };

        let (payload, encrypted) = if policy.encrypt {
            let sealed = cipher
                .seal(&payload, key.as_bytes())
                .map_err(|e| StorageError::Backend(format!("seal failed: {e}")))?;
            (sealed, true)
        } else {
            (payload, false)
        };

        let expires_at = match policy.ttl_secs {
            Some(ttl) => now.saturating_add(ttl),
            None => 0,
        };

        Ok(Self {
            version: RECORD_VERSION,
            compressed,
            encrypted,
            digest,
            created_at: now,
            expires_at,
            payload,
        })
    }

    /// Reverse the seal pipeline and verify the plaintext digest.
    pub fn open(&self, key: &str, cipher: &SealingCipher) -> Result<Vec<u8>, StorageError> {
        if self.version != RECORD_VERSION {
            return Err(StorageError::Serialization(format!(
                "unknown record version {}",
                self.version
            )));
        }

        let payload = if self.encrypted {
            cipher
                .open(&self.payload, key.as_bytes())
                .map_err(|_| StorageError::IntegrityFailure(key.to_string()))?
        } else {
            self.payload.clone()
        };

        let plaintext = if self.compressed {
            lz4_flex::decompress_size_prepended(&payload)
                .map_err(|_| StorageError::IntegrityFailure(key.to_string()))?
        } else {
            payload
        };

        if *blake3::hash(&plaintext).as_bytes() != self.digest {
            return Err(StorageError::IntegrityFailure(key.to_string()));
        }

        Ok(plaintext)
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at != 0 && now >= self.expires_at
    }

    pub fn encode(&self) -> Result<Vec<u8>, StorageError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        Ok(bincode::deserialize(bytes)?)
    }
}
