use crate::sealing::{derive_sealing_key, SealingCipher, SealingKey};
use crate::types::{KeyAlgorithm, KeyError, KeyMetadata, KeyUsage};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use ed25519_dalek::Signer as _;
use k256::ecdsa::signature::Signer as _;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use sanctum_attestation::EnclaveIdentity;
use std::collections::HashMap;
use tracing::{debug, info, warn};
use zeroize::Zeroize;

/// Capability seam for components that need signing and AEAD without
/// holding the manager itself.
pub trait KeyStore: Send + Sync {
    fn sign(&self, key_id: &str, data: &[u8]) -> Result<Vec<u8>, KeyError>;
    fn verify(&self, key_id: &str, data: &[u8], signature: &[u8]) -> Result<bool, KeyError>;
    fn encrypt(&self, key_id: &str, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, KeyError>;
    fn decrypt(&self, key_id: &str, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, KeyError>;
    fn metadata(&self, key_id: &str) -> Result<KeyMetadata, KeyError>;
}

enum KeyMaterial {
    Aes([u8; 32]),
    Ecdsa(k256::ecdsa::SigningKey),
    Ed25519(ed25519_dalek::SigningKey),
}

struct KeyEntry {
    meta: KeyMetadata,
    material: KeyMaterial,
    /// Per-key AEAD nonce state: random prefix fixed at creation, counter
    /// incremented per encryption. Reuse is therefore impossible for a
    /// given key; overflow is surfaced as `NonceExhausted`.
    nonce_prefix: [u8; 4],
    nonce_counter: u64,
}

/// In-enclave key service. Key material never leaves this struct in
/// plaintext unless the key was created with `exportable = true`.
pub struct KeyManager {
    identity: EnclaveIdentity,
    keys: RwLock<HashMap<String, KeyEntry>>,
}

impl KeyManager {
    pub fn new(identity: EnclaveIdentity) -> Self {
        Self {
            identity,
            keys: RwLock::new(HashMap::new()),
        }
    }

    pub fn identity(&self) -> EnclaveIdentity {
        self.identity
    }

    /// Generate key material from the CSPRNG.
    pub fn generate_key(
        &self,
        key_id: &str,
        algorithm: KeyAlgorithm,
        usage: Vec<KeyUsage>,
        exportable: bool,
    ) -> Result<KeyMetadata, KeyError> {
        check_usage_consistency(algorithm, &usage)?;

        let material = match algorithm {
            KeyAlgorithm::Aes256Gcm => {
                let mut bytes = [0u8; 32];
                OsRng.fill_bytes(&mut bytes);
                KeyMaterial::Aes(bytes)
            }
            KeyAlgorithm::EcdsaSecp256k1 => {
                KeyMaterial::Ecdsa(k256::ecdsa::SigningKey::random(&mut OsRng))
            }
            KeyAlgorithm::Ed25519 => {
                KeyMaterial::Ed25519(ed25519_dalek::SigningKey::generate(&mut OsRng))
            }
        };

        self.insert(key_id, algorithm, usage, exportable, material)
    }

    /// Import externally supplied key material.
    pub fn import_key(
        &self,
        key_id: &str,
        algorithm: KeyAlgorithm,
        usage: Vec<KeyUsage>,
        exportable: bool,
        raw: &[u8],
    ) -> Result<KeyMetadata, KeyError> {
        check_usage_consistency(algorithm, &usage)?;

        let material = match algorithm {
            KeyAlgorithm::Aes256Gcm => {
                let bytes: [u8; 32] = raw
                    .try_into()
                    .map_err(|_| KeyError::InvalidInput("AES-256 key must be 32 bytes".into()))?;
                KeyMaterial::Aes(bytes)
            }
            KeyAlgorithm::EcdsaSecp256k1 => KeyMaterial::Ecdsa(
                k256::ecdsa::SigningKey::from_slice(raw)
                    .map_err(|e| KeyError::InvalidInput(e.to_string()))?,
            ),
            KeyAlgorithm::Ed25519 => {
                let seed: [u8; 32] = raw
                    .try_into()
                    .map_err(|_| KeyError::InvalidInput("Ed25519 seed must be 32 bytes".into()))?;
                KeyMaterial::Ed25519(ed25519_dalek::SigningKey::from_bytes(&seed))
            }
        };

        self.insert(key_id, algorithm, usage, exportable, material)
    }

    fn insert(
        &self,
        key_id: &str,
        algorithm: KeyAlgorithm,
        usage: Vec<KeyUsage>,
        exportable: bool,
        material: KeyMaterial,
    ) -> Result<KeyMetadata, KeyError> {
        let mut keys = self.keys.write();
        if keys.contains_key(key_id) {
            return Err(KeyError::DuplicateKeyId(key_id.to_string()));
        }

        let public_key = match &material {
            KeyMaterial::Aes(_) => None,
            KeyMaterial::Ecdsa(sk) => Some(
                sk.verifying_key()
                    .to_encoded_point(true)
                    .as_bytes()
                    .to_vec(),
            ),
            KeyMaterial::Ed25519(sk) => Some(sk.verifying_key().to_bytes().to_vec()),
        };

        let meta = KeyMetadata {
            key_id: key_id.to_string(),
            algorithm,
            usage,
            exportable,
            created_at: chrono::Utc::now().timestamp() as u64,
            public_key,
        };

        let mut nonce_prefix = [0u8; 4];
        OsRng.fill_bytes(&mut nonce_prefix);

        keys.insert(
            key_id.to_string(),
            KeyEntry {
                meta: meta.clone(),
                material,
                nonce_prefix,
                nonce_counter: 0,
            },
        );
        info!(key_id, %algorithm, exportable, "key created");
        Ok(meta)
    }

    /// Return raw key material. Only permitted for exportable keys.
    pub fn export_key(&self, key_id: &str) -> Result<Vec<u8>, KeyError> {
        let keys = self.keys.read();
        let entry = keys
            .get(key_id)
            .ok_or_else(|| KeyError::NotFound(key_id.to_string()))?;
        if !entry.meta.exportable {
            warn!(key_id, "export refused for non-exportable key");
            return Err(KeyError::NotExportable(key_id.to_string()));
        }
        Ok(match &entry.material {
            KeyMaterial::Aes(bytes) => bytes.to_vec(),
            KeyMaterial::Ecdsa(sk) => sk.to_bytes().to_vec(),
            KeyMaterial::Ed25519(sk) => sk.to_bytes().to_vec(),
        })
    }

    /// Zero key material and reclaim the slot. Idempotent: deleting a
    /// missing id reports `false` rather than erroring.
    pub fn delete_key(&self, key_id: &str) -> bool {
        let mut keys = self.keys.write();
        match keys.remove(key_id) {
            Some(mut entry) => {
                if let KeyMaterial::Aes(ref mut bytes) = entry.material {
                    bytes.zeroize();
                }
                // Asymmetric material zeroizes on drop (dalek / k256).
                debug!(key_id, "key deleted");
                true
            }
            None => false,
        }
    }

    pub fn list_keys(&self) -> Vec<KeyMetadata> {
        self.keys.read().values().map(|e| e.meta.clone()).collect()
    }

    /// Destroy all keys, zeroing material. Used at enclave termination.
    pub fn destroy_all(&self) -> usize {
        let mut keys = self.keys.write();
        let count = keys.len();
        for (_, mut entry) in keys.drain() {
            if let KeyMaterial::Aes(ref mut bytes) = entry.material {
                bytes.zeroize();
            }
        }
        count
    }

    /// Cipher over the identity-bound sealing key for the given context.
    pub fn sealing_cipher(&self, context: &[u8]) -> SealingCipher {
        SealingCipher::new(self.sealing_key(context))
    }

    pub fn sealing_key(&self, context: &[u8]) -> SealingKey {
        derive_sealing_key(&self.identity, context)
    }

    fn require_usage(entry: &KeyEntry, usage: KeyUsage) -> Result<(), KeyError> {
        if entry.meta.usage.contains(&usage) {
            Ok(())
        } else {
            Err(KeyError::UsageViolation {
                key_id: entry.meta.key_id.clone(),
                usage,
            })
        }
    }
}

impl KeyStore for KeyManager {
    fn sign(&self, key_id: &str, data: &[u8]) -> Result<Vec<u8>, KeyError> {
        let keys = self.keys.read();
        let entry = keys
            .get(key_id)
            .ok_or_else(|| KeyError::NotFound(key_id.to_string()))?;
        Self::require_usage(entry, KeyUsage::Sign)?;

        match &entry.material {
            KeyMaterial::Ecdsa(sk) => {
                let signature: k256::ecdsa::Signature = sk.sign(data);
                Ok(signature.to_bytes().to_vec())
            }
            KeyMaterial::Ed25519(sk) => Ok(sk.sign(data).to_bytes().to_vec()),
            KeyMaterial::Aes(_) => Err(KeyError::UsageViolation {
                key_id: key_id.to_string(),
                usage: KeyUsage::Sign,
            }),
        }
    }

    fn verify(&self, key_id: &str, data: &[u8], signature: &[u8]) -> Result<bool, KeyError> {
        let keys = self.keys.read();
        let entry = keys
            .get(key_id)
            .ok_or_else(|| KeyError::NotFound(key_id.to_string()))?;
        Self::require_usage(entry, KeyUsage::Verify)?;

        let verified = match &entry.material {
            KeyMaterial::Ecdsa(sk) => {
                use k256::ecdsa::signature::Verifier;
                match k256::ecdsa::Signature::from_slice(signature) {
                    Ok(sig) => sk.verifying_key().verify(data, &sig).is_ok(),
                    Err(_) => false,
                }
            }
            KeyMaterial::Ed25519(sk) => match ed25519_dalek::Signature::from_slice(signature) {
                Ok(sig) => sk.verifying_key().verify_strict(data, &sig).is_ok(),
                Err(_) => false,
            },
            KeyMaterial::Aes(_) => {
                return Err(KeyError::UsageViolation {
                    key_id: key_id.to_string(),
                    usage: KeyUsage::Verify,
                })
            }
        };
        Ok(verified)
    }

    fn encrypt(&self, key_id: &str, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, KeyError> {
        let mut keys = self.keys.write();
        let entry = keys
            .get_mut(key_id)
            .ok_or_else(|| KeyError::NotFound(key_id.to_string()))?;
        Self::require_usage(entry, KeyUsage::Encrypt)?;

        let mut key_bytes = match &entry.material {
            KeyMaterial::Aes(bytes) => *bytes,
            _ => {
                return Err(KeyError::UsageViolation {
                    key_id: key_id.to_string(),
                    usage: KeyUsage::Encrypt,
                })
            }
        };

        let counter = entry.nonce_counter;
        entry.nonce_counter = counter
            .checked_add(1)
            .ok_or_else(|| KeyError::NonceExhausted(key_id.to_string()))?;

        let mut nonce_bytes = [0u8; 12];
        nonce_bytes[..4].copy_from_slice(&entry.nonce_prefix);
        nonce_bytes[4..].copy_from_slice(&counter.to_be_bytes());

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
        let result = cipher.encrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: plaintext,
                aad,
            },
        );
        key_bytes.zeroize();
        let ciphertext = result.map_err(|_| KeyError::AuthenticationFailure)?;

        let mut out = Vec::with_capacity(12 + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, key_id: &str, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, KeyError> {
        let keys = self.keys.read();
        let entry = keys
            .get(key_id)
            .ok_or_else(|| KeyError::NotFound(key_id.to_string()))?;
        Self::require_usage(entry, KeyUsage::Decrypt)?;

        let KeyMaterial::Aes(key_bytes) = &entry.material else {
            return Err(KeyError::UsageViolation {
                key_id: key_id.to_string(),
                usage: KeyUsage::Decrypt,
            });
        };

        // Tag mismatch yields nothing: the AEAD either authenticates the
        // whole message or returns no plaintext at all.
        if ciphertext.len() < 12 + 16 {
            return Err(KeyError::AuthenticationFailure);
        }
        let (nonce_bytes, body) = ciphertext.split_at(12);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key_bytes));
        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), Payload { msg: body, aad })
            .map_err(|_| KeyError::AuthenticationFailure)
    }

    fn metadata(&self, key_id: &str) -> Result<KeyMetadata, KeyError> {
        self.keys
            .read()
            .get(key_id)
            .map(|e| e.meta.clone())
            .ok_or_else(|| KeyError::NotFound(key_id.to_string()))
    }
}

fn check_usage_consistency(algorithm: KeyAlgorithm, usage: &[KeyUsage]) -> Result<(), KeyError> {
    if usage.is_empty() {
        return Err(KeyError::InvalidInput("usage flags must not be empty".into()));
    }
    for u in usage {
        let ok = match u {
            KeyUsage::Sign | KeyUsage::Verify => algorithm.is_signing(),
            KeyUsage::Encrypt | KeyUsage::Decrypt => algorithm == KeyAlgorithm::Aes256Gcm,
        };
        if !ok {
            return Err(KeyError::InvalidInput(format!(
                "usage {} not valid for algorithm {}",
                u, algorithm
            )));
        }
    }
    Ok(())
}
