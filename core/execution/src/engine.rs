//! Execution engine: validates, hashes, and runs scripts on a bounded
//! worker pool.

use crate::bindings::HostBindings;
use crate::gas::GasSchedule;
use crate::interpreter::{run_program, RunBudget};
use crate::parser::parse;
use crate::types::{ExecutionError, ExecutionOutcome, ExecutionRequest};
use crate::validator::ComplianceChecker;
use sha3::{Digest, Sha3_256};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// SHA3-256 over the source text.
pub fn code_hash(code: &str) -> [u8; 32] {
    Sha3_256::digest(code.as_bytes()).into()
}

pub struct ExecutionEngine {
    schedule: GasSchedule,
    checker: ComplianceChecker,
    workers: Arc<Semaphore>,
    memory_limit: u64,
    cancelled: Arc<AtomicBool>,
}

impl ExecutionEngine {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            schedule: GasSchedule::default(),
            checker: ComplianceChecker::new(),
            workers: Arc::new(Semaphore::new(max_concurrent)),
            memory_limit: u64::MAX,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_schedule(mut self, schedule: GasSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    /// Bound cumulative script allocation in bytes per execution.
    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit = bytes;
        self
    }

    /// Refuse new submissions and signal every in-flight interpreter to
    /// stop at its next checkpoint.
    pub fn shutdown(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.workers.close();
    }

    /// Validate and run one script. Requests beyond the pool bound queue
    /// here until a worker frees up.
    pub async fn execute(
        &self,
        request: ExecutionRequest,
        bindings: Arc<dyn HostBindings>,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        let _permit = self
            .workers
            .acquire()
            .await
            .map_err(|_| ExecutionError::System("worker pool is shut down".into()))?;

        let hash = code_hash(&request.code);
        if let Some(expected) = request.expected_code_hash {
            if expected != hash {
                warn!("code hash mismatch, refusing to execute");
                return Err(ExecutionError::CodeIntegrityMismatch);
            }
        }

        let input_bytes = serde_json::to_vec(&request.input)
            .map_err(|e| ExecutionError::System(format!("input is not serializable: {e}")))?
            .len();
        self.checker.check(&request.code, input_bytes)?;

        debug!(
            code_hash = %hex::encode(&hash[..8]),
            gas_limit = request.gas_limit,
            "starting script execution"
        );

        let schedule = self.schedule.clone();
        let started = Instant::now();
        let budget = RunBudget {
            gas_limit: request.gas_limit,
            memory_limit: self.memory_limit,
            deadline: started + request.timeout,
            cancel: Arc::clone(&self.cancelled),
        };

        // The interpreter is synchronous; run it off the async threads. The
        // deadline and the cancellation flag are checked cooperatively
        // inside the interpreter.
        let handle = tokio::task::spawn_blocking(move || {
            let program = parse(&request.code)?;
            run_program(
                &program,
                &request.input,
                &request.secrets,
                bindings.as_ref(),
                schedule,
                budget,
                request.code.len(),
            )
        });

        let (output, gas_used) = handle
            .await
            .map_err(|e| ExecutionError::System(format!("execution task failed: {e}")))??;

        let duration_ms = started.elapsed().as_millis() as u64;
        info!(
            code_hash = %hex::encode(&hash[..8]),
            gas_used,
            duration_ms,
            "script execution complete"
        );

        Ok(ExecutionOutcome {
            output,
            gas_used,
            code_hash: hash,
            duration_ms,
        })
    }
}
