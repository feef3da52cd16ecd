use serde::{Deserialize, Serialize};

/// Supported key algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyAlgorithm {
    /// Symmetric AEAD (AES-256-GCM).
    Aes256Gcm,
    /// ECDSA over secp256k1, SHA-256 message digest.
    EcdsaSecp256k1,
    /// Ed25519 signatures.
    Ed25519,
}

impl KeyAlgorithm {
    pub fn is_signing(&self) -> bool {
        matches!(self, Self::EcdsaSecp256k1 | Self::Ed25519)
    }
}

impl std::fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Aes256Gcm => "aes-256-gcm",
            Self::EcdsaSecp256k1 => "ecdsa-secp256k1",
            Self::Ed25519 => "ed25519",
        };
        f.write_str(name)
    }
}

/// What a key is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyUsage {
    Sign,
    Verify,
    Encrypt,
    Decrypt,
}

impl std::fmt::Display for KeyUsage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            KeyUsage::Sign => "sign",
            KeyUsage::Verify => "verify",
            KeyUsage::Encrypt => "encrypt",
            KeyUsage::Decrypt => "decrypt",
        };
        f.write_str(name)
    }
}

/// Metadata describing a key. Never contains key material.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyMetadata {
    pub key_id: String,
    pub algorithm: KeyAlgorithm,
    pub usage: Vec<KeyUsage>,
    pub exportable: bool,
    pub created_at: u64,
    /// Public half for asymmetric keys; `None` for symmetric.
    pub public_key: Option<Vec<u8>>,
}

/// Key-service failures.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("key not found: {0}")]
    NotFound(String),

    #[error("duplicate key id: {0}")]
    DuplicateKeyId(String),

    #[error("key {key_id} does not permit {usage}")]
    UsageViolation { key_id: String, usage: KeyUsage },

    #[error("key {0} is not exportable")]
    NotExportable(String),

    #[error("authentication failure")]
    AuthenticationFailure,

    #[error("AEAD nonce space exhausted for key {0}")]
    NonceExhausted(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}
