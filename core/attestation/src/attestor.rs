use crate::types::{
    AttestationError, AttestationQuote, EnclaveIdentity, REPORT_DATA_LEN,
};
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use tracing::debug;

/// Capability of proving an enclave identity to a remote verifier.
pub trait Attestable: Send + Sync {
    /// Bind caller-supplied report data (a nonce, a public key hash) to the
    /// enclave's measured identity.
    fn generate_quote(&self, report_data: &[u8]) -> Result<AttestationQuote, AttestationError>;

    /// Identity this attestor proves.
    fn identity(&self) -> EnclaveIdentity;
}

/// Software attestor standing in for the hardware root of trust.
///
/// A fresh ed25519 platform key is generated per instance; the quote's
/// certificate chain carries the single self-signed root. Verifiers in
/// simulation deployments learn the root out of band via
/// [`SimulatedAttestor::root_public_key`].
pub struct SimulatedAttestor {
    identity: EnclaveIdentity,
    platform_key: SigningKey,
}

impl SimulatedAttestor {
    pub fn new(identity: EnclaveIdentity) -> Self {
        let platform_key = SigningKey::generate(&mut OsRng);
        Self {
            identity,
            platform_key,
        }
    }

    /// Platform root public key that verifiers must trust.
    pub fn root_public_key(&self) -> [u8; 32] {
        self.platform_key.verifying_key().to_bytes()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.platform_key.verifying_key()
    }
}

impl Attestable for SimulatedAttestor {
    fn generate_quote(&self, report_data: &[u8]) -> Result<AttestationQuote, AttestationError> {
        if report_data.len() > REPORT_DATA_LEN {
            return Err(AttestationError::QuoteGeneration(format!(
                "report data exceeds {} bytes",
                REPORT_DATA_LEN
            )));
        }

        let mut padded = vec![0u8; REPORT_DATA_LEN];
        padded[..report_data.len()].copy_from_slice(report_data);

        let mut quote = AttestationQuote {
            identity: self.identity,
            report_data: padded,
            timestamp: chrono::Utc::now().timestamp() as u64,
            signature: Vec::new(),
            cert_chain: vec![self.root_public_key().to_vec()],
        };
        let signature = self.platform_key.sign(&quote.signed_payload());
        quote.signature = signature.to_bytes().to_vec();

        debug!(measurement = %quote.identity.measurement, "generated attestation quote");
        Ok(quote)
    }

    fn identity(&self) -> EnclaveIdentity {
        self.identity
    }
}
