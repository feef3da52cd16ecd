use serde::{Deserialize, Serialize};

/// Measurement of the loaded enclave image (MRENCLAVE-equivalent).
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct Measurement(pub [u8; 32]);

impl Measurement {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn zero() -> Self {
        Measurement([0u8; 32])
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }
}

impl std::fmt::Display for Measurement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

/// Identity of the entity that signed the enclave image (MRSIGNER-equivalent).
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SignerId(pub [u8; 32]);

impl SignerId {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Display for SignerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

/// Immutable identity of a loaded enclave instance.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct EnclaveIdentity {
    pub measurement: Measurement,
    pub signer: SignerId,
}

/// Fixed width of the report-data field bound into a quote.
pub const REPORT_DATA_LEN: usize = 64;

/// Attestation quote: enclave identity plus caller-supplied report data,
/// signed by the platform root of trust.
///
/// Immutable once issued. `report_data` is always exactly
/// [`REPORT_DATA_LEN`] bytes (caller input zero-padded).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttestationQuote {
    pub identity: EnclaveIdentity,
    pub report_data: Vec<u8>,
    pub timestamp: u64,
    pub signature: Vec<u8>,
    /// Leaf-first chain of signing public keys up to the platform root.
    pub cert_chain: Vec<Vec<u8>>,
}

impl AttestationQuote {
    /// Byte string covered by the quote signature.
    pub fn signed_payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(32 + 32 + REPORT_DATA_LEN + 8);
        payload.extend_from_slice(self.identity.measurement.as_bytes());
        payload.extend_from_slice(self.identity.signer.as_bytes());
        payload.extend_from_slice(&self.report_data);
        payload.extend_from_slice(&self.timestamp.to_le_bytes());
        payload
    }

    /// Serialize to the compact binary wire form.
    pub fn to_bytes(&self) -> Result<Vec<u8>, AttestationError> {
        bincode::serialize(self).map_err(|e| AttestationError::MalformedQuote(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AttestationError> {
        let quote: AttestationQuote = bincode::deserialize(bytes)
            .map_err(|e| AttestationError::MalformedQuote(e.to_string()))?;
        quote.check_shape()?;
        Ok(quote)
    }

    /// Serialize to the self-describing JSON envelope for transport over
    /// ordinary network channels.
    pub fn to_json(&self) -> Result<String, AttestationError> {
        let envelope = QuoteEnvelope {
            version: ENVELOPE_VERSION,
            measurement: hex::encode(self.identity.measurement.as_bytes()),
            signer: hex::encode(self.identity.signer.as_bytes()),
            report_data: hex::encode(&self.report_data),
            timestamp: self.timestamp,
            signature: hex::encode(&self.signature),
            cert_chain: self.cert_chain.iter().map(hex::encode).collect(),
        };
        serde_json::to_string(&envelope).map_err(|e| AttestationError::MalformedQuote(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, AttestationError> {
        let envelope: QuoteEnvelope = serde_json::from_str(json)
            .map_err(|e| AttestationError::MalformedQuote(e.to_string()))?;
        if envelope.version != ENVELOPE_VERSION {
            return Err(AttestationError::MalformedQuote(format!(
                "unsupported envelope version {}",
                envelope.version
            )));
        }
        let decode = |field: &str, s: &str| {
            hex::decode(s)
                .map_err(|e| AttestationError::MalformedQuote(format!("{}: {}", field, e)))
        };
        let measurement: [u8; 32] = decode("measurement", &envelope.measurement)?
            .try_into()
            .map_err(|_| AttestationError::MalformedQuote("measurement length".into()))?;
        let signer: [u8; 32] = decode("signer", &envelope.signer)?
            .try_into()
            .map_err(|_| AttestationError::MalformedQuote("signer length".into()))?;
        let quote = AttestationQuote {
            identity: EnclaveIdentity {
                measurement: Measurement(measurement),
                signer: SignerId(signer),
            },
            report_data: decode("report_data", &envelope.report_data)?,
            timestamp: envelope.timestamp,
            signature: decode("signature", &envelope.signature)?,
            cert_chain: envelope
                .cert_chain
                .iter()
                .map(|c| decode("cert_chain", c))
                .collect::<Result<_, _>>()?,
        };
        quote.check_shape()?;
        Ok(quote)
    }

    fn check_shape(&self) -> Result<(), AttestationError> {
        if self.report_data.len() != REPORT_DATA_LEN {
            return Err(AttestationError::MalformedQuote(format!(
                "report data must be {} bytes, got {}",
                REPORT_DATA_LEN,
                self.report_data.len()
            )));
        }
        if self.cert_chain.is_empty() {
            return Err(AttestationError::MalformedQuote(
                "empty certificate chain".into(),
            ));
        }
        Ok(())
    }
}

const ENVELOPE_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct QuoteEnvelope {
    version: u32,
    measurement: String,
    signer: String,
    report_data: String,
    timestamp: u64,
    signature: String,
    cert_chain: Vec<String>,
}

/// Attestation failures, reported distinctly so callers can tell an
/// untrusted platform from an expired proof.
#[derive(Debug, thiserror::Error)]
pub enum AttestationError {
    #[error("quote generation failed: {0}")]
    QuoteGeneration(String),

    #[error("certificate chain invalid: {0}")]
    CertificateChainInvalid(String),

    #[error("measurement mismatch: quote reports {got}")]
    MeasurementMismatch { got: Measurement },

    #[error("stale or replayed nonce")]
    StaleOrReplayedNonce,

    #[error("malformed quote: {0}")]
    MalformedQuote(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_quote() -> AttestationQuote {
        AttestationQuote {
            identity: EnclaveIdentity {
                measurement: Measurement([7u8; 32]),
                signer: SignerId([9u8; 32]),
            },
            report_data: vec![1u8; REPORT_DATA_LEN],
            timestamp: 1_700_000_000,
            signature: vec![0xAB; 64],
            cert_chain: vec![vec![0xCD; 32]],
        }
    }

    #[test]
    fn test_json_envelope_round_trip() {
        let quote = sample_quote();
        let json = quote.to_json().unwrap();
        let parsed = AttestationQuote::from_json(&json).unwrap();
        assert_eq!(parsed, quote);
    }

    #[test]
    fn test_binary_round_trip() {
        let quote = sample_quote();
        let bytes = quote.to_bytes().unwrap();
        let parsed = AttestationQuote::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, quote);
    }

    #[test]
    fn test_rejects_short_report_data() {
        let mut quote = sample_quote();
        quote.report_data = vec![0u8; 16];
        let bytes = bincode::serialize(&quote).unwrap();
        assert!(matches!(
            AttestationQuote::from_bytes(&bytes),
            Err(AttestationError::MalformedQuote(_))
        ));
    }

    #[test]
    fn test_rejects_empty_chain() {
        let mut quote = sample_quote();
        quote.cert_chain.clear();
        let bytes = bincode::serialize(&quote).unwrap();
        assert!(AttestationQuote::from_bytes(&bytes).is_err());
    }
}
