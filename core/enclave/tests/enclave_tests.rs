//! End-to-end tests exercising the full host API surface.

use sanctum_enclave::{EnclaveConfig, EnclaveState, LifecycleManager, LifecycleError};
use sanctum_execution::ExecutionError;
use sanctum_keys::{KeyAlgorithm, KeyUsage};
use sanctum_storage::{StorageError, StoragePolicy};
use std::collections::HashMap;
use std::path::Path;

fn write_image(dir: &Path, name: &str, contents: &[u8]) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

fn config_in(dir: &Path) -> EnclaveConfig {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let image = write_image(dir, "enclave.img", b"simulated enclave image v1");
    EnclaveConfig::new(image, dir.join("db"))
}

#[tokio::test]
async fn key_scenario_sign_and_verify() {
    let dir = tempfile::TempDir::new().unwrap();
    let manager = LifecycleManager::new();
    let handle = manager.create_enclave(config_in(dir.path())).unwrap();
    manager.attest(handle, b"boot-nonce").unwrap();

    let meta = manager
        .generate_key(
            handle,
            "k1",
            KeyAlgorithm::EcdsaSecp256k1,
            vec![KeyUsage::Sign, KeyUsage::Verify],
            false,
        )
        .unwrap();
    assert!(!meta.exportable);

    let signature = manager.sign_data(handle, "k1", b"hello").unwrap();
    assert!(manager
        .verify_signature(handle, "k1", b"hello", &signature)
        .unwrap());
    assert!(!manager
        .verify_signature(handle, "k1", b"hello!", &signature)
        .unwrap());
}

#[tokio::test]
async fn storage_scenario_round_trip_and_delete() {
    let dir = tempfile::TempDir::new().unwrap();
    let manager = LifecycleManager::new();
    let handle = manager.create_enclave(config_in(dir.path())).unwrap();
    manager.attest(handle, b"boot-nonce").unwrap();

    manager
        .store_data(handle, "user:1", b"secret", &StoragePolicy::default())
        .await
        .unwrap();
    assert_eq!(
        manager.retrieve_data(handle, "user:1").await.unwrap(),
        b"secret"
    );

    assert!(manager.delete_data(handle, "user:1").await.unwrap());
    assert!(matches!(
        manager.retrieve_data(handle, "user:1").await,
        Err(LifecycleError::Storage(StorageError::NotFound(_)))
    ));
}

#[tokio::test]
async fn script_scenario_doubling_and_gas() {
    let dir = tempfile::TempDir::new().unwrap();
    let manager = LifecycleManager::new();
    let handle = manager.create_enclave(config_in(dir.path())).unwrap();
    manager.attest(handle, b"boot-nonce").unwrap();

    let code = "function main(input) { return input.value * 2; }";
    let outcome = manager
        .execute_script(
            handle,
            code,
            serde_json::json!({"value": 21}),
            HashMap::new(),
            "fn-1",
            "user-1",
            1_000_000,
            None,
        )
        .await
        .unwrap();
    assert_eq!(outcome.output, serde_json::json!(42));
    assert!(outcome.gas_used > 0);

    let starved = manager
        .execute_script(
            handle,
            code,
            serde_json::json!({"value": 21}),
            HashMap::new(),
            "fn-1",
            "user-1",
            1,
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(
        starved,
        LifecycleError::Execution(ExecutionError::ResourceExhausted { .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn script_storage_is_namespaced_per_caller() {
    let dir = tempfile::TempDir::new().unwrap();
    let manager = LifecycleManager::new();
    let handle = manager.create_enclave(config_in(dir.path())).unwrap();
    manager.attest(handle, b"boot-nonce").unwrap();

    let writer = r#"function main(input) { storage.set("shared", input.tag); return null; }"#;
    let reader = r#"function main(input) { return storage.get("shared"); }"#;

    manager
        .execute_script(
            handle,
            writer,
            serde_json::json!({"tag": "alpha"}),
            HashMap::new(),
            "fn-1",
            "alice",
            1_000_000,
            None,
        )
        .await
        .unwrap();

    // The same key read by another user sees nothing.
    let other = manager
        .execute_script(
            handle,
            reader,
            serde_json::json!(null),
            HashMap::new(),
            "fn-1",
            "bob",
            1_000_000,
            None,
        )
        .await
        .unwrap();
    assert_eq!(other.output, serde_json::json!(null));

    let own = manager
        .execute_script(
            handle,
            reader,
            serde_json::json!(null),
            HashMap::new(),
            "fn-1",
            "alice",
            1_000_000,
            None,
        )
        .await
        .unwrap();
    assert_eq!(own.output, serde_json::json!("alpha"));

    // Scripts write under the caller prefix in the flat namespace.
    let keys = manager.list_data_keys(handle, "alice:fn-1:").unwrap();
    assert_eq!(keys, vec!["alice:fn-1:shared"]);
}

#[tokio::test]
async fn sealing_binds_data_to_the_enclave_identity() {
    let dir = tempfile::TempDir::new().unwrap();
    let db_dir = dir.path().join("db");

    {
        let manager = LifecycleManager::new();
        let image = write_image(dir.path(), "first.img", b"image one");
        let handle = manager
            .create_enclave(EnclaveConfig::new(image, &db_dir))
            .unwrap();
        manager.attest(handle, b"n1").unwrap();
        manager
            .store_data(handle, "sealed-item", b"bound", &StoragePolicy::default())
            .await
            .unwrap();
        manager.terminate(handle);
    }

    // Same storage directory, different measurement.
    let manager = LifecycleManager::new();
    let image = write_image(dir.path(), "second.img", b"image two");
    let handle = manager
        .create_enclave(EnclaveConfig::new(image, &db_dir))
        .unwrap();
    manager.attest(handle, b"n2").unwrap();

    assert!(matches!(
        manager.retrieve_data(handle, "sealed-item").await,
        Err(LifecycleError::Storage(StorageError::IntegrityFailure(_)))
    ));
}

#[tokio::test]
async fn compliance_violations_surface_through_the_host_api() {
    let dir = tempfile::TempDir::new().unwrap();
    let manager = LifecycleManager::new();
    let handle = manager.create_enclave(config_in(dir.path())).unwrap();
    manager.attest(handle, b"boot-nonce").unwrap();

    let err = manager
        .execute_script(
            handle,
            "function main(input) { return eval(input.code); }",
            serde_json::json!({"code": "1"}),
            HashMap::new(),
            "fn-1",
            "user-1",
            1_000_000,
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::Execution(ExecutionError::Compliance(_))
    ));
}

#[tokio::test]
async fn lifecycle_states_progress_and_terminate() {
    let dir = tempfile::TempDir::new().unwrap();
    let manager = LifecycleManager::new();
    let handle = manager.create_enclave(config_in(dir.path())).unwrap();
    assert_eq!(manager.state(handle).unwrap(), EnclaveState::Created);

    // Not attested yet: storage access refused.
    assert!(matches!(
        manager.retrieve_data(handle, "x").await,
        Err(LifecycleError::NotReady { .. })
    ));

    manager.attest(handle, b"boot-nonce").unwrap();
    assert_eq!(manager.state(handle).unwrap(), EnclaveState::Attested);

    manager
        .store_data(handle, "x", b"1", &StoragePolicy::default())
        .await
        .unwrap();
    assert_eq!(manager.state(handle).unwrap(), EnclaveState::Running);

    assert!(manager.terminate(handle));
    assert!(!manager.terminate(handle));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn termination_cancels_running_scripts() {
    let dir = tempfile::TempDir::new().unwrap();
    let manager = std::sync::Arc::new(LifecycleManager::new());
    let mut config = config_in(dir.path());
    config.default_timeout = std::time::Duration::from_secs(60);
    let handle = manager.create_enclave(config).unwrap();
    manager.attest(handle, b"boot-nonce").unwrap();

    let spinning = {
        let manager = std::sync::Arc::clone(&manager);
        tokio::spawn(async move {
            manager
                .execute_script(
                    handle,
                    "function main(input) { while (true) { } }",
                    serde_json::json!(null),
                    HashMap::new(),
                    "fn-1",
                    "user-1",
                    u64::MAX,
                    None,
                )
                .await
        })
    };
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    assert!(manager.terminate(handle));
    let result = tokio::time::timeout(std::time::Duration::from_secs(5), spinning)
        .await
        .expect("script kept running after termination")
        .unwrap();
    assert!(matches!(
        result,
        Err(LifecycleError::Execution(ExecutionError::Cancelled))
    ));
}

#[tokio::test]
async fn script_memory_limit_comes_from_the_config() {
    let dir = tempfile::TempDir::new().unwrap();
    let manager = LifecycleManager::new();
    let mut config = config_in(dir.path());
    config.memory_limit_bytes = 64 * 1024;
    let handle = manager.create_enclave(config).unwrap();
    manager.attest(handle, b"boot-nonce").unwrap();

    let err = manager
        .execute_script(
            handle,
            r#"
                function main(input) {
                    let s = "xx";
                    for (let i = 0; i < 30; i++) { s = s + s; }
                    return s;
                }
            "#,
            serde_json::json!(null),
            HashMap::new(),
            "fn-1",
            "user-1",
            10_000_000,
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::Execution(ExecutionError::ResourceExhausted { .. })
    ));
}

#[tokio::test]
async fn keys_are_destroyed_on_termination() {
    let dir = tempfile::TempDir::new().unwrap();
    let manager = LifecycleManager::new();
    let handle = manager.create_enclave(config_in(dir.path())).unwrap();
    manager.attest(handle, b"boot-nonce").unwrap();

    manager
        .generate_key(
            handle,
            "signing",
            KeyAlgorithm::Ed25519,
            vec![KeyUsage::Sign, KeyUsage::Verify],
            false,
        )
        .unwrap();
    assert_eq!(manager.list_keys(handle).unwrap().len(), 1);

    manager.terminate(handle);
    // Handle is gone along with its key material.
    assert!(matches!(
        manager.list_keys(handle),
        Err(LifecycleError::UnknownHandle(_))
    ));
}
