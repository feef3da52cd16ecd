pub mod config;
pub mod context;
pub mod lifecycle;
pub mod types;

pub use config::EnclaveConfig;
pub use context::EnclaveContext;
pub use lifecycle::LifecycleManager;
pub use types::{EnclaveHandle, EnclaveState, LifecycleError};
