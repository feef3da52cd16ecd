use std::path::PathBuf;
use std::time::Duration;

/// Configuration passed in by the host at enclave creation. Parsing
/// configuration files is the host's problem; this is the already-decoded
/// form.
#[derive(Debug, Clone)]
pub struct EnclaveConfig {
    /// Enclave image to load and measure.
    pub image_path: PathBuf,
    /// Simulated attestation root instead of a hardware platform.
    pub simulation: bool,
    /// Name of the image signer; hashed into the signer identity.
    pub signer_name: String,
    /// Cumulative allocation bound per script execution.
    pub memory_limit_bytes: u64,
    /// Caps storage background threads and execution worker concurrency.
    pub max_threads: usize,
    pub default_timeout: Duration,
    pub max_concurrent_executions: usize,
    pub max_open_transactions: usize,
    pub storage_dir: PathBuf,
    pub cache_budget_bytes: usize,
}

impl EnclaveConfig {
    pub fn new(image_path: impl Into<PathBuf>, storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            image_path: image_path.into(),
            simulation: true,
            signer_name: "sanctum-dev".to_string(),
            memory_limit_bytes: 256 * 1024 * 1024,
            max_threads: 8,
            default_timeout: Duration::from_secs(30),
            max_concurrent_executions: 4,
            max_open_transactions: 64,
            storage_dir: storage_dir.into(),
            cache_budget_bytes: 8 * 1024 * 1024,
        }
    }

    pub fn with_signer(mut self, name: impl Into<String>) -> Self {
        self.signer_name = name.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }
}
