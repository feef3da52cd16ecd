use hmac::{Hmac, Mac};
use sanctum_attestation::EnclaveIdentity;
use sha3::Sha3_512;
use zeroize::Zeroize;

type HmacSha512 = Hmac<Sha3_512>;

/// 256-bit sealing key bound to an enclave identity. Zeroed on drop.
pub struct SealingKey(pub(crate) [u8; 32]);

impl SealingKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Drop for SealingKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// Derive a sealing key from the enclave identity and a caller context.
///
/// The derivation is keyed on measurement and signer, so data sealed by one
/// enclave identity cannot be unsealed by an instance with a different
/// measurement or signer. The key is never persisted.
pub fn derive_sealing_key(identity: &EnclaveIdentity, context: &[u8]) -> SealingKey {
    let mut mac = HmacSha512::new_from_slice(b"sanctum sealing v1")
        .expect("HMAC accepts any key length");
    mac.update(identity.measurement.as_bytes());
    mac.update(identity.signer.as_bytes());
    mac.update(context);
    let digest = mac.finalize().into_bytes();

    let mut key = [0u8; 32];
    key.copy_from_slice(&digest[..32]);
    SealingKey(key)
}

/// AEAD cipher over a sealing key. Used by the storage engine to seal data
/// at rest; the wire form is `nonce (12 bytes) ‖ ciphertext ‖ tag`.
pub struct SealingCipher {
    key: SealingKey,
}

impl SealingCipher {
    pub fn new(key: SealingKey) -> Self {
        Self { key }
    }

    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, crate::KeyError> {
        use aes_gcm::aead::{Aead, KeyInit, Payload};
        use aes_gcm::{Aes256Gcm, Key, Nonce};
        use rand::RngCore;

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(self.key.as_bytes()));
        let mut nonce_bytes = [0u8; 12];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, Payload { msg: plaintext, aad })
            .map_err(|_| crate::KeyError::AuthenticationFailure)?;

        let mut out = Vec::with_capacity(12 + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn open(&self, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>, crate::KeyError> {
        use aes_gcm::aead::{Aead, KeyInit, Payload};
        use aes_gcm::{Aes256Gcm, Key, Nonce};

        if sealed.len() < 12 + 16 {
            return Err(crate::KeyError::AuthenticationFailure);
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(12);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(self.key.as_bytes()));
        cipher
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| crate::KeyError::AuthenticationFailure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sanctum_attestation::{Measurement, SignerId};

    fn identity(m: u8, s: u8) -> EnclaveIdentity {
        EnclaveIdentity {
            measurement: Measurement([m; 32]),
            signer: SignerId([s; 32]),
        }
    }

    #[test]
    fn test_same_identity_same_key() {
        let a = derive_sealing_key(&identity(1, 2), b"storage");
        let b = derive_sealing_key(&identity(1, 2), b"storage");
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_different_measurement_different_key() {
        let a = derive_sealing_key(&identity(1, 2), b"storage");
        let b = derive_sealing_key(&identity(3, 2), b"storage");
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_different_signer_different_key() {
        let a = derive_sealing_key(&identity(1, 2), b"storage");
        let b = derive_sealing_key(&identity(1, 4), b"storage");
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_context_separates_keys() {
        let a = derive_sealing_key(&identity(1, 2), b"storage");
        let b = derive_sealing_key(&identity(1, 2), b"keys");
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_seal_open_round_trip() {
        let cipher = SealingCipher::new(derive_sealing_key(&identity(1, 2), b"storage"));
        let sealed = cipher.seal(b"secret payload", b"item:1").unwrap();
        assert_ne!(&sealed[12..], b"secret payload".as_slice());
        let opened = cipher.open(&sealed, b"item:1").unwrap();
        assert_eq!(opened, b"secret payload");
    }

    #[test]
    fn test_open_with_other_identity_fails() {
        let cipher_a = SealingCipher::new(derive_sealing_key(&identity(1, 2), b"storage"));
        let cipher_b = SealingCipher::new(derive_sealing_key(&identity(9, 2), b"storage"));
        let sealed = cipher_a.seal(b"secret", b"").unwrap();
        assert!(cipher_b.open(&sealed, b"").is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let cipher = SealingCipher::new(derive_sealing_key(&identity(1, 2), b"storage"));
        let mut sealed = cipher.seal(b"secret", b"aad").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(cipher.open(&sealed, b"aad").is_err());
    }

    #[test]
    fn test_wrong_aad_fails() {
        let cipher = SealingCipher::new(derive_sealing_key(&identity(1, 2), b"storage"));
        let sealed = cipher.seal(b"secret", b"aad-1").unwrap();
        assert!(cipher.open(&sealed, b"aad-2").is_err());
    }
}
