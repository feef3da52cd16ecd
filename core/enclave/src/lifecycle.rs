//! Enclave lifecycle state machine and the host-facing operation surface.
//!
//! State machine per instance:
//! `Uninitialized → Created → Attested → Running → Terminated` (terminal).
//! Attestation is idempotent; any key/storage/execution operation requires
//! at least `Attested`. Termination is idempotent and releases every
//! component resource.

use crate::config::EnclaveConfig;
use crate::context::EnclaveContext;
use crate::types::{EnclaveHandle, EnclaveState, LifecycleError};
use dashmap::DashMap;
use parking_lot::RwLock;
use sanctum_attestation::{Attestable, AttestationQuote, Measurement, QuoteVerifier};
use sanctum_execution::{EnclaveBindings, ExecutionOutcome, ExecutionRequest};
use sanctum_keys::{KeyAlgorithm, KeyMetadata, KeyStore, KeyUsage};
use sanctum_storage::{ItemMetadata, Receipt, StoragePolicy, StorageStats};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

struct EnclaveInstance {
    config: EnclaveConfig,
    state: RwLock<EnclaveState>,
    ctx: EnclaveContext,
}

/// Owns every enclave instance and mediates all host access to them.
pub struct LifecycleManager {
    instances: DashMap<u64, Arc<EnclaveInstance>>,
    verifier: RwLock<QuoteVerifier>,
    next_handle: AtomicU64,
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleManager {
    pub fn new() -> Self {
        Self {
            instances: DashMap::new(),
            verifier: RwLock::new(QuoteVerifier::new(Vec::new())),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Load, measure, and wire up a new enclave instance.
    pub fn create_enclave(
        &self,
        config: EnclaveConfig,
    ) -> Result<EnclaveHandle, LifecycleError> {
        let ctx = EnclaveContext::build(&config)?;
        self.verifier.write().trust_root(ctx.attestor.root_public_key());

        let handle = EnclaveHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        let instance = Arc::new(EnclaveInstance {
            config,
            state: RwLock::new(EnclaveState::Created),
            ctx,
        });
        self.instances.insert(handle.0, instance);
        info!(%handle, "enclave created");
        Ok(handle)
    }

    /// Produce a quote binding `report_data` to the instance identity and
    /// move the instance to `Attested`. Repeated attestation is permitted.
    pub fn attest(
        &self,
        handle: EnclaveHandle,
        report_data: &[u8],
    ) -> Result<AttestationQuote, LifecycleError> {
        let instance = self.instance(handle)?;
        let quote = match instance.ctx.attestor.generate_quote(report_data) {
            Ok(quote) => quote,
            Err(e) => {
                // A failed attestation leaves the instance untrusted; tear
                // it down rather than letting callers retry against it.
                warn!(%handle, error = %e, "attestation failed, terminating instance");
                self.terminate(handle);
                return Err(e.into());
            }
        };

        let mut state = instance.state.write();
        if *state == EnclaveState::Created {
            *state = EnclaveState::Attested;
        }
        info!(%handle, "enclave attested");
        Ok(quote)
    }

    /// Verify a quote against the trusted roots and a measurement
    /// allow-list. Failure kinds are preserved so callers can tell an
    /// untrusted platform from an expired proof.
    pub fn verify_attestation(
        &self,
        quote: &AttestationQuote,
        expected_measurements: &[Measurement],
    ) -> Result<(), LifecycleError> {
        self.verifier
            .read()
            .verify(quote, expected_measurements)
            .map_err(LifecycleError::from)
    }

    /// Run a script in the enclave. Script storage access is namespaced by
    /// `user_id` and `function_id`.
    #[allow(clippy::too_many_arguments)]
    pub async fn execute_script(
        &self,
        handle: EnclaveHandle,
        code: &str,
        input: serde_json::Value,
        secrets: HashMap<String, String>,
        function_id: &str,
        user_id: &str,
        gas_limit: u64,
        expected_code_hash: Option<[u8; 32]>,
    ) -> Result<ExecutionOutcome, LifecycleError> {
        let instance = self.ready_instance(handle)?;

        let bindings = EnclaveBindings::new(
            Arc::clone(&instance.ctx.store),
            Arc::clone(&instance.ctx.keys),
            tokio::runtime::Handle::current(),
            format!("{user_id}:{function_id}"),
        );
        let request = ExecutionRequest {
            code: code.to_string(),
            expected_code_hash,
            input,
            secrets,
            gas_limit,
            timeout: instance.config.default_timeout,
        };

        let outcome = instance
            .ctx
            .execution
            .execute(request, Arc::new(bindings))
            .await?;
        Ok(outcome)
    }

    pub fn generate_key(
        &self,
        handle: EnclaveHandle,
        key_id: &str,
        algorithm: KeyAlgorithm,
        usage: Vec<KeyUsage>,
        exportable: bool,
    ) -> Result<KeyMetadata, LifecycleError> {
        let instance = self.ready_instance(handle)?;
        Ok(instance
            .ctx
            .keys
            .generate_key(key_id, algorithm, usage, exportable)?)
    }

    pub fn sign_data(
        &self,
        handle: EnclaveHandle,
        key_id: &str,
        data: &[u8],
    ) -> Result<Vec<u8>, LifecycleError> {
        let instance = self.ready_instance(handle)?;
        Ok(instance.ctx.keys.sign(key_id, data)?)
    }

    pub fn verify_signature(
        &self,
        handle: EnclaveHandle,
        key_id: &str,
        data: &[u8],
        signature: &[u8],
    ) -> Result<bool, LifecycleError> {
        let instance = self.ready_instance(handle)?;
        Ok(instance.ctx.keys.verify(key_id, data, signature)?)
    }

    pub fn list_keys(&self, handle: EnclaveHandle) -> Result<Vec<KeyMetadata>, LifecycleError> {
        let instance = self.ready_instance(handle)?;
        Ok(instance.ctx.keys.list_keys())
    }

    pub fn delete_key(&self, handle: EnclaveHandle, key_id: &str) -> Result<bool, LifecycleError> {
        let instance = self.ready_instance(handle)?;
        Ok(instance.ctx.keys.delete_key(key_id))
    }

    pub async fn store_data(
        &self,
        handle: EnclaveHandle,
        key: &str,
        data: &[u8],
        policy: &StoragePolicy,
    ) -> Result<Receipt, LifecycleError> {
        let instance = self.ready_instance(handle)?;
        Ok(instance.ctx.store.store(key, data, policy).await?)
    }

    pub async fn retrieve_data(
        &self,
        handle: EnclaveHandle,
        key: &str,
    ) -> Result<Vec<u8>, LifecycleError> {
        let instance = self.ready_instance(handle)?;
        Ok(instance.ctx.store.retrieve(key).await?)
    }

    pub async fn delete_data(
        &self,
        handle: EnclaveHandle,
        key: &str,
    ) -> Result<bool, LifecycleError> {
        let instance = self.ready_instance(handle)?;
        Ok(instance.ctx.store.delete(key).await?)
    }

    pub fn list_data_keys(
        &self,
        handle: EnclaveHandle,
        prefix: &str,
    ) -> Result<Vec<String>, LifecycleError> {
        let instance = self.ready_instance(handle)?;
        Ok(instance.ctx.store.list_keys(prefix)?)
    }

    pub fn data_metadata(
        &self,
        handle: EnclaveHandle,
        key: &str,
    ) -> Result<ItemMetadata, LifecycleError> {
        let instance = self.ready_instance(handle)?;
        Ok(instance.ctx.store.metadata(key)?)
    }

    pub fn storage_stats(&self, handle: EnclaveHandle) -> Result<StorageStats, LifecycleError> {
        let instance = self.ready_instance(handle)?;
        Ok(instance.ctx.store.stats()?)
    }

    pub fn state(&self, handle: EnclaveHandle) -> Result<EnclaveState, LifecycleError> {
        Ok(*self.instance(handle)?.state.read())
    }

    /// Tear an instance down: cancel in-flight executions, flush storage,
    /// destroy key material, mark terminated. Unknown or already-terminated
    /// handles return `false`.
    pub fn terminate(&self, handle: EnclaveHandle) -> bool {
        let Some((_, instance)) = self.instances.remove(&handle.0) else {
            return false;
        };

        *instance.state.write() = EnclaveState::Terminated;
        // Running scripts stop at their next checkpoint; new submissions
        // against a still-held Arc are refused outright.
        instance.ctx.execution.shutdown();
        if let Err(e) = instance.ctx.store.flush() {
            warn!(%handle, error = %e, "storage flush during termination failed");
        }
        let destroyed = instance.ctx.keys.destroy_all();
        info!(%handle, keys_destroyed = destroyed, "enclave terminated");
        true
    }

    /// Terminate every tracked instance; returns how many were torn down.
    pub fn terminate_all(&self) -> usize {
        let handles: Vec<u64> = self.instances.iter().map(|e| *e.key()).collect();
        handles
            .into_iter()
            .filter(|&h| self.terminate(EnclaveHandle(h)))
            .count()
    }

    fn instance(&self, handle: EnclaveHandle) -> Result<Arc<EnclaveInstance>, LifecycleError> {
        self.instances
            .get(&handle.0)
            .map(|e| Arc::clone(e.value()))
            .ok_or(LifecycleError::UnknownHandle(handle))
    }

    /// Fetch an instance that is at least attested, moving it to `Running`
    /// on first use.
    fn ready_instance(
        &self,
        handle: EnclaveHandle,
    ) -> Result<Arc<EnclaveInstance>, LifecycleError> {
        let instance = self.instance(handle)?;
        let mut state = instance.state.write();
        match *state {
            EnclaveState::Attested => {
                *state = EnclaveState::Running;
            }
            EnclaveState::Running => {}
            other => return Err(LifecycleError::NotReady { state: other }),
        }
        drop(state);
        Ok(instance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> EnclaveConfig {
        let image_path = dir.path().join("enclave.img");
        let mut f = std::fs::File::create(&image_path).unwrap();
        f.write_all(b"simulated enclave image v1").unwrap();
        EnclaveConfig::new(image_path, dir.path().join("db"))
    }

    #[test]
    fn test_create_and_state() {
        let dir = TempDir::new().unwrap();
        let manager = LifecycleManager::new();
        let handle = manager.create_enclave(test_config(&dir)).unwrap();
        assert_eq!(manager.state(handle).unwrap(), EnclaveState::Created);
    }

    #[test]
    fn test_missing_image_fails_initialization() {
        let dir = TempDir::new().unwrap();
        let manager = LifecycleManager::new();
        let config = EnclaveConfig::new(dir.path().join("absent.img"), dir.path().join("db"));
        assert!(matches!(
            manager.create_enclave(config),
            Err(LifecycleError::Initialization(_))
        ));
    }

    #[test]
    fn test_empty_image_fails_initialization() {
        let dir = TempDir::new().unwrap();
        let image_path = dir.path().join("empty.img");
        std::fs::File::create(&image_path).unwrap();
        let manager = LifecycleManager::new();
        let config = EnclaveConfig::new(image_path, dir.path().join("db"));
        assert!(matches!(
            manager.create_enclave(config),
            Err(LifecycleError::Initialization(_))
        ));
    }

    #[test]
    fn test_non_simulation_mode_unsupported() {
        let dir = TempDir::new().unwrap();
        let manager = LifecycleManager::new();
        let mut config = test_config(&dir);
        config.simulation = false;
        assert!(matches!(
            manager.create_enclave(config),
            Err(LifecycleError::Initialization(_))
        ));
    }

    #[test]
    fn test_operations_require_attestation() {
        let dir = TempDir::new().unwrap();
        let manager = LifecycleManager::new();
        let handle = manager.create_enclave(test_config(&dir)).unwrap();

        let err = manager
            .generate_key(
                handle,
                "k",
                KeyAlgorithm::Ed25519,
                vec![KeyUsage::Sign, KeyUsage::Verify],
                false,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::NotReady {
                state: EnclaveState::Created
            }
        ));
    }

    #[test]
    fn test_attest_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let manager = LifecycleManager::new();
        let handle = manager.create_enclave(test_config(&dir)).unwrap();

        manager.attest(handle, b"nonce-1").unwrap();
        assert_eq!(manager.state(handle).unwrap(), EnclaveState::Attested);
        manager.attest(handle, b"nonce-2").unwrap();
        assert_eq!(manager.state(handle).unwrap(), EnclaveState::Attested);
    }

    #[test]
    fn test_attest_and_verify() {
        let dir = TempDir::new().unwrap();
        let manager = LifecycleManager::new();
        let handle = manager.create_enclave(test_config(&dir)).unwrap();

        let quote = manager.attest(handle, b"verification-nonce").unwrap();
        manager
            .verify_attestation(&quote, &[quote.identity.measurement])
            .unwrap();

        // The same quote replayed is rejected.
        assert!(manager
            .verify_attestation(&quote, &[quote.identity.measurement])
            .is_err());
    }

    #[test]
    fn test_failed_attestation_tears_the_instance_down() {
        let dir = TempDir::new().unwrap();
        let manager = LifecycleManager::new();
        let handle = manager.create_enclave(test_config(&dir)).unwrap();

        // Report data over the 64-byte bound fails quote generation.
        let err = manager.attest(handle, &[0u8; 65]).unwrap_err();
        assert!(matches!(err, LifecycleError::Attestation(_)));
        assert!(matches!(
            manager.state(handle),
            Err(LifecycleError::UnknownHandle(_))
        ));
    }

    #[test]
    fn test_terminate_idempotent() {
        let dir = TempDir::new().unwrap();
        let manager = LifecycleManager::new();
        let handle = manager.create_enclave(test_config(&dir)).unwrap();

        assert!(manager.terminate(handle));
        assert!(!manager.terminate(handle));
        assert!(!manager.terminate(EnclaveHandle(999)));
        assert!(matches!(
            manager.state(handle),
            Err(LifecycleError::UnknownHandle(_))
        ));
    }

    #[test]
    fn test_terminate_all_reports_count() {
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();
        let manager = LifecycleManager::new();
        manager.create_enclave(test_config(&dir_a)).unwrap();
        manager.create_enclave(test_config(&dir_b)).unwrap();

        assert_eq!(manager.terminate_all(), 2);
        assert_eq!(manager.terminate_all(), 0);
    }
}
