pub mod ast;
pub mod bindings;
pub mod engine;
pub mod gas;
pub mod interpreter;
pub mod lexer;
pub mod parser;
pub mod validator;
pub mod value;

mod types;

pub use bindings::{EnclaveBindings, HostBindings, NullBindings};
pub use engine::{code_hash, ExecutionEngine};
pub use gas::{GasMeter, GasOp, GasSchedule};
pub use types::{ComplianceViolation, ExecutionError, ExecutionOutcome, ExecutionRequest};
pub use validator::ComplianceChecker;
