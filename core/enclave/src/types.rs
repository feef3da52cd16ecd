use sanctum_attestation::AttestationError;
use sanctum_execution::ExecutionError;
use sanctum_keys::KeyError;
use sanctum_storage::StorageError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle states, ordered. Operations on keys, storage, and execution
/// require at least [`EnclaveState::Attested`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EnclaveState {
    Uninitialized,
    Created,
    Attested,
    Running,
    Terminated,
}

impl std::fmt::Display for EnclaveState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EnclaveState::Uninitialized => "uninitialized",
            EnclaveState::Created => "created",
            EnclaveState::Attested => "attested",
            EnclaveState::Running => "running",
            EnclaveState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Opaque handle identifying a live enclave instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnclaveHandle(pub u64);

impl std::fmt::Display for EnclaveHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "enclave#{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("enclave initialization failed: {0}")]
    Initialization(String),

    #[error("operation requires an attested enclave (state: {state})")]
    NotReady { state: EnclaveState },

    #[error("unknown enclave handle {0}")]
    UnknownHandle(EnclaveHandle),

    #[error(transparent)]
    Attestation(#[from] AttestationError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_ordering() {
        assert!(EnclaveState::Created < EnclaveState::Attested);
        assert!(EnclaveState::Attested < EnclaveState::Running);
        assert!(EnclaveState::Running < EnclaveState::Terminated);
    }
}
