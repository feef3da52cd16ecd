//! Integration tests for the sealed store.

use proptest::prelude::*;
use sanctum_attestation::{EnclaveIdentity, Measurement, SignerId};
use sanctum_keys::sealing::{derive_sealing_key, SealingCipher};
use sanctum_storage::{RocksDB, SealedStore, SealedStoreConfig, StoragePolicy};
use std::sync::Arc;
use tempfile::TempDir;

fn open_store(dir: &TempDir) -> SealedStore {
    let identity = EnclaveIdentity {
        measurement: Measurement([1u8; 32]),
        signer: SignerId([2u8; 32]),
    };
    let cipher = SealingCipher::new(derive_sealing_key(&identity, b"storage"));
    SealedStore::new(
        RocksDB::open(dir.path()).unwrap(),
        cipher,
        SealedStoreConfig::default(),
    )
}

#[tokio::test]
async fn persistence_across_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let store = open_store(&dir);
        store
            .store("durable", b"survives reopen", &StoragePolicy::default())
            .await
            .unwrap();
        store.flush().unwrap();
    }

    let store = open_store(&dir);
    assert_eq!(store.retrieve("durable").await.unwrap(), b"survives reopen");
}

#[tokio::test]
async fn concurrent_writers_distinct_keys() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(open_store(&dir));

    let mut handles = Vec::new();
    for i in 0..16 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            let key = format!("writer:{i}");
            let value = vec![i as u8; 256];
            store
                .store(&key, &value, &StoragePolicy::default())
                .await
                .unwrap();
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    for i in 0..16 {
        let value = store.retrieve(&format!("writer:{i}")).await.unwrap();
        assert_eq!(value, vec![i as u8; 256]);
    }
}

#[tokio::test]
async fn concurrent_writers_same_key_serialize() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(open_store(&dir));

    let mut handles = Vec::new();
    for i in 0..8u8 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            store
                .store("hot", &[i], &StoragePolicy::default())
                .await
                .unwrap();
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    // One of the writers won; the value is intact, not interleaved.
    let value = store.retrieve("hot").await.unwrap();
    assert_eq!(value.len(), 1);
    assert!(value[0] < 8);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn round_trip_arbitrary_payloads(value in proptest::collection::vec(any::<u8>(), 0..4096)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let dir = TempDir::new().unwrap();
            let store = open_store(&dir);
            store.store("k", &value, &StoragePolicy::default()).await.unwrap();
            prop_assert_eq!(store.retrieve("k").await.unwrap(), value);
            Ok(())
        })?;
    }

    #[test]
    fn round_trip_without_encryption(value in proptest::collection::vec(any::<u8>(), 0..4096)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let dir = TempDir::new().unwrap();
            let store = open_store(&dir);
            let policy = StoragePolicy { encrypt: false, compress: true, ttl_secs: None };
            store.store("k", &value, &policy).await.unwrap();
            prop_assert_eq!(store.retrieve("k").await.unwrap(), value);
            Ok(())
        })?;
    }
}
