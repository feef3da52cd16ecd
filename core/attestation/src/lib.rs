// sanctum/core/attestation/src/lib.rs

// Enclave identity, quote generation, and remote verification.
pub mod attestor;
pub mod types;
pub mod verifier;

pub use attestor::{Attestable, SimulatedAttestor};
pub use types::{
    AttestationError, AttestationQuote, EnclaveIdentity, Measurement, SignerId, REPORT_DATA_LEN,
};
pub use verifier::{QuoteVerifier, DEFAULT_FRESHNESS_WINDOW_SECS};
