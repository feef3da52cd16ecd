// sanctum/core/keys/src/lib.rs

// In-enclave key management: generation, use, and destruction of key
// material that never crosses the enclave boundary in plaintext.
pub mod manager;
pub mod sealing;
pub mod types;

pub use manager::{KeyManager, KeyStore};
pub use sealing::{derive_sealing_key, SealingCipher, SealingKey};
pub use types::{KeyAlgorithm, KeyError, KeyMetadata, KeyUsage};
