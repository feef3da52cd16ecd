use crate::types::{AttestationError, AttestationQuote, Measurement};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Quotes older than this are considered stale.
pub const DEFAULT_FRESHNESS_WINDOW_SECS: u64 = 300;

/// Verifies attestation quotes against a set of trusted platform roots and
/// an allow-list of enclave measurements.
///
/// Each quote is single-use with respect to its report data: a second
/// verification of the same report data fails with
/// [`AttestationError::StaleOrReplayedNonce`].
pub struct QuoteVerifier {
    trusted_roots: Vec<[u8; 32]>,
    freshness_window_secs: u64,
    consumed: Mutex<HashMap<Vec<u8>, u64>>,
}

impl QuoteVerifier {
    pub fn new(trusted_roots: Vec<[u8; 32]>) -> Self {
        Self {
            trusted_roots,
            freshness_window_secs: DEFAULT_FRESHNESS_WINDOW_SECS,
            consumed: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_freshness_window(mut self, secs: u64) -> Self {
        self.freshness_window_secs = secs;
        self
    }

    /// Add a platform root after construction, e.g. when a new simulated
    /// enclave comes up.
    pub fn trust_root(&mut self, root: [u8; 32]) {
        if !self.trusted_roots.contains(&root) {
            self.trusted_roots.push(root);
        }
    }

    /// Validate the signature chain, the measurement allow-list, and the
    /// freshness of the embedded report data.
    pub fn verify(
        &self,
        quote: &AttestationQuote,
        expected_measurements: &[Measurement],
    ) -> Result<(), AttestationError> {
        self.verify_chain(quote)?;

        if !expected_measurements.contains(&quote.identity.measurement) {
            warn!(got = %quote.identity.measurement, "measurement not in allow-list");
            return Err(AttestationError::MeasurementMismatch {
                got: quote.identity.measurement,
            });
        }

        self.check_freshness(quote)?;

        debug!(measurement = %quote.identity.measurement, "quote verified");
        Ok(())
    }

    fn verify_chain(&self, quote: &AttestationQuote) -> Result<(), AttestationError> {
        let root = quote
            .cert_chain
            .last()
            .ok_or_else(|| AttestationError::CertificateChainInvalid("empty chain".into()))?;
        let root: [u8; 32] = root.as_slice().try_into().map_err(|_| {
            AttestationError::CertificateChainInvalid("root key must be 32 bytes".into())
        })?;

        if !self.trusted_roots.contains(&root) {
            return Err(AttestationError::CertificateChainInvalid(
                "root key not trusted".into(),
            ));
        }

        // The quote signature is produced by the leaf; in the simulated
        // chain the leaf is the root itself.
        let leaf = quote
            .cert_chain
            .first()
            .ok_or_else(|| AttestationError::CertificateChainInvalid("empty chain".into()))?;
        let leaf: [u8; 32] = leaf.as_slice().try_into().map_err(|_| {
            AttestationError::CertificateChainInvalid("leaf key must be 32 bytes".into())
        })?;
        let verifying_key = VerifyingKey::from_bytes(&leaf)
            .map_err(|e| AttestationError::CertificateChainInvalid(e.to_string()))?;

        let signature = Signature::from_slice(&quote.signature)
            .map_err(|e| AttestationError::CertificateChainInvalid(e.to_string()))?;
        verifying_key
            .verify(&quote.signed_payload(), &signature)
            .map_err(|_| {
                AttestationError::CertificateChainInvalid("quote signature invalid".into())
            })
    }

    fn check_freshness(&self, quote: &AttestationQuote) -> Result<(), AttestationError> {
        let now = chrono::Utc::now().timestamp() as u64;
        if quote.timestamp + self.freshness_window_secs < now {
            return Err(AttestationError::StaleOrReplayedNonce);
        }

        let mut consumed = self.consumed.lock();
        // Drop entries past the window so the register stays bounded.
        let window = self.freshness_window_secs;
        consumed.retain(|_, seen_at| *seen_at + window >= now);

        if consumed.contains_key(&quote.report_data) {
            return Err(AttestationError::StaleOrReplayedNonce);
        }
        consumed.insert(quote.report_data.clone(), now);
        Ok(())
    }
}
