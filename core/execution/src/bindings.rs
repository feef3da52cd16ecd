//! Host capabilities exposed to scripts.
//!
//! The interpreter never touches the storage engine or key manager
//! directly; it calls through this trait so the sandbox boundary stays a
//! narrow, synchronous, byte-oriented surface. Gas for these calls is
//! charged by the interpreter before the call is made.

use sanctum_keys::{KeyManager, KeyStore};
use sanctum_storage::{SealedStore, StorageError, StoragePolicy};
use sha3::{Digest, Sha3_256};
use std::sync::Arc;

pub trait HostBindings: Send + Sync {
    fn storage_read(&self, key: &str) -> Result<Option<Vec<u8>>, String>;
    fn storage_write(&self, key: &str, value: &[u8]) -> Result<(), String>;
    fn storage_delete(&self, key: &str) -> Result<bool, String>;
    fn crypto_sign(&self, key_id: &str, data: &[u8]) -> Result<Vec<u8>, String>;
    fn crypto_verify(&self, key_id: &str, data: &[u8], signature: &[u8]) -> Result<bool, String>;

    fn crypto_hash(&self, data: &[u8]) -> [u8; 32] {
        Sha3_256::digest(data).into()
    }
}

/// Bindings with no storage or key backing; every capability call fails.
/// Used for pure computations and in tests.
#[derive(Default)]
pub struct NullBindings;

impl HostBindings for NullBindings {
    fn storage_read(&self, _key: &str) -> Result<Option<Vec<u8>>, String> {
        Err("storage is not available in this context".into())
    }

    fn storage_write(&self, _key: &str, _value: &[u8]) -> Result<(), String> {
        Err("storage is not available in this context".into())
    }

    fn storage_delete(&self, _key: &str) -> Result<bool, String> {
        Err("storage is not available in this context".into())
    }

    fn crypto_sign(&self, _key_id: &str, _data: &[u8]) -> Result<Vec<u8>, String> {
        Err("crypto keys are not available in this context".into())
    }

    fn crypto_verify(&self, _key_id: &str, _data: &[u8], _signature: &[u8]) -> Result<bool, String> {
        Err("crypto keys are not available in this context".into())
    }
}

/// Bindings wired to the sealed store and key manager.
///
/// Storage keys are namespaced with a caller-supplied prefix (user id and
/// function id), so scripts cannot reach outside their own slice of the
/// flat key namespace.
pub struct EnclaveBindings {
    store: Arc<SealedStore>,
    keys: Arc<KeyManager>,
    runtime: tokio::runtime::Handle,
    namespace: String,
}

impl EnclaveBindings {
    pub fn new(
        store: Arc<SealedStore>,
        keys: Arc<KeyManager>,
        runtime: tokio::runtime::Handle,
        namespace: String,
    ) -> Self {
        Self {
            store,
            keys,
            runtime,
            namespace,
        }
    }

    fn qualify(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }
}

impl HostBindings for EnclaveBindings {
    fn storage_read(&self, key: &str) -> Result<Option<Vec<u8>>, String> {
        let qualified = self.qualify(key);
        match self.runtime.block_on(self.store.retrieve(&qualified)) {
            Ok(data) => Ok(Some(data)),
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.to_string()),
        }
    }

    fn storage_write(&self, key: &str, value: &[u8]) -> Result<(), String> {
        let qualified = self.qualify(key);
        self.runtime
            .block_on(
                self.store
                    .store(&qualified, value, &StoragePolicy::default()),
            )
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    fn storage_delete(&self, key: &str) -> Result<bool, String> {
        let qualified = self.qualify(key);
        self.runtime
            .block_on(self.store.delete(&qualified))
            .map_err(|e| e.to_string())
    }

    fn crypto_sign(&self, key_id: &str, data: &[u8]) -> Result<Vec<u8>, String> {
        self.keys.sign(key_id, data).map_err(|e| e.to_string())
    }

    fn crypto_verify(&self, key_id: &str, data: &[u8], signature: &[u8]) -> Result<bool, String> {
        self.keys
            .verify(key_id, data, signature)
            .map_err(|e| e.to_string())
    }
}
