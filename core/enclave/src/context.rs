//! Component wiring for one enclave instance.
//!
//! All shared state lives here, owned by the lifecycle manager and handed
//! to operations by reference. There are no process-wide singletons.

use crate::config::EnclaveConfig;
use crate::types::LifecycleError;
use sanctum_attestation::{EnclaveIdentity, Measurement, SignerId, SimulatedAttestor};
use sanctum_execution::ExecutionEngine;
use sanctum_keys::KeyManager;
use sanctum_storage::{RocksDB, SealedStore, SealedStoreConfig, StorageError};
use sha3::{Digest, Sha3_256};
use std::sync::Arc;
use tracing::info;

pub struct EnclaveContext {
    pub identity: EnclaveIdentity,
    pub attestor: SimulatedAttestor,
    pub keys: Arc<KeyManager>,
    pub store: Arc<SealedStore>,
    pub execution: ExecutionEngine,
}

impl EnclaveContext {
    /// Load and measure the enclave image, then wire up the component
    /// stack bound to the resulting identity.
    pub fn build(config: &EnclaveConfig) -> Result<Self, LifecycleError> {
        if !config.simulation {
            return Err(LifecycleError::Initialization(
                "hardware attestation platform is not available; enable simulation mode".into(),
            ));
        }

        let image = std::fs::read(&config.image_path).map_err(|e| {
            LifecycleError::Initialization(format!(
                "cannot read enclave image {}: {e}",
                config.image_path.display()
            ))
        })?;
        if image.is_empty() {
            return Err(LifecycleError::Initialization(
                "enclave image is empty".into(),
            ));
        }

        let measurement = Measurement(Sha3_256::digest(&image).into());
        let signer = SignerId(Sha3_256::digest(config.signer_name.as_bytes()).into());
        let identity = EnclaveIdentity {
            measurement,
            signer,
        };

        let keys = Arc::new(KeyManager::new(identity));
        let db = RocksDB::open_with_parallelism(&config.storage_dir, config.max_threads)
            .map_err(|e| LifecycleError::Storage(StorageError::Backend(e.to_string())))?;
        let store = Arc::new(SealedStore::new(
            db,
            keys.sealing_cipher(b"storage"),
            SealedStoreConfig {
                cache_budget_bytes: config.cache_budget_bytes,
                max_open_transactions: config.max_open_transactions,
            },
        ));
        let execution =
            ExecutionEngine::new(config.max_concurrent_executions.min(config.max_threads.max(1)))
                .with_memory_limit(config.memory_limit_bytes);

        info!(measurement = %measurement, "enclave image measured");
        Ok(Self {
            identity,
            attestor: SimulatedAttestor::new(identity),
            keys,
            store,
            execution,
        })
    }
}
