use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// A single finding from the static compliance scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceViolation {
    pub identifier: String,
    pub line: u32,
}

impl std::fmt::Display for ComplianceViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "prohibited identifier `{}` at line {}", self.identifier, self.line)
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExecutionError {
    #[error("syntax error at {line}:{column}: {message}")]
    Syntax {
        line: u32,
        column: u32,
        message: String,
    },

    #[error("runtime error: {message}")]
    Runtime {
        message: String,
        /// Innermost frame first.
        stack: Vec<String>,
    },

    /// Gas, memory, or wall-clock limit exceeded. Carries the gas counter
    /// at the point execution was cut off.
    #[error("resource exhausted after {gas_used} gas")]
    ResourceExhausted { gas_used: u64 },

    /// The host shut the engine down while the script was running.
    #[error("execution cancelled by the host")]
    Cancelled,

    #[error("compliance scan rejected code ({} violations)", .0.len())]
    Compliance(Vec<ComplianceViolation>),

    #[error("code hash does not match expected hash")]
    CodeIntegrityMismatch,

    #[error("engine fault: {0}")]
    System(String),
}

/// One script execution request.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub code: String,
    /// When set, execution refuses to start unless the SHA3-256 of `code`
    /// matches.
    pub expected_code_hash: Option<[u8; 32]>,
    pub input: serde_json::Value,
    /// Secrets visible to the script through the `secrets` host object.
    pub secrets: HashMap<String, String>,
    pub gas_limit: u64,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub output: serde_json::Value,
    pub gas_used: u64,
    /// SHA3-256 over the source text.
    pub code_hash: [u8; 32],
    pub duration_ms: u64,
}
