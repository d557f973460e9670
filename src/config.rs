//! Configuration types for checkpoint storage.

use crate::error::{Error, Result};
use crate::types::{CleanupPolicy, JobId};
use std::path::PathBuf;
use std::time::Duration;

/// Default maximum size of a single state in the memory backend (5 MiB).
pub const DEFAULT_PER_STATE_MAX_BYTES: u64 = 5 * 1024 * 1024;

/// Default maximum inline bytes of one checkpoint (64 MiB).
pub const DEFAULT_AGGREGATE_MAX_BYTES: u64 = 64 * 1024 * 1024;

/// Default control-plane frame ceiling for one acknowledgement (10 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: u64 = 10 * 1024 * 1024;

/// Default size up to which filesystem writes are inlined (20 KiB).
pub const DEFAULT_FILE_SIZE_THRESHOLD: u64 = 20 * 1024;

/// Largest accepted inlining threshold (1 MiB).
pub const MAX_FILE_SIZE_THRESHOLD: u64 = 1024 * 1024;

/// Default write buffer of filesystem streams (4 KiB).
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 4 * 1024;

/// Main configuration for checkpoint storage.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Job whose checkpoints are stored.
    pub job_id: JobId,

    /// Backend variant and its limits.
    pub backend: BackendConfig,

    /// What to do with retained checkpoints when the job is cancelled.
    pub cleanup_policy: CleanupPolicy,

    /// Number of completed checkpoints kept before older ones are subsumed.
    pub max_retained_checkpoints: usize,

    /// How often the cleanup loop retries failed deletions.
    pub cleanup_interval: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            job_id: JobId::new(),
            backend: BackendConfig::Memory(MemoryBackendConfig::default()),
            cleanup_policy: CleanupPolicy::default(),
            max_retained_checkpoints: 1,
            cleanup_interval: Duration::from_secs(30),
        }
    }
}

impl StorageConfig {
    /// Create a configuration for the filesystem backend rooted at `base_path`.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            backend: BackendConfig::FileSystem(FsBackendConfig::new(base_path)),
            ..Default::default()
        }
    }

    /// Create a configuration for the in-process memory backend.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Set the job id.
    pub fn with_job_id(mut self, job_id: JobId) -> Self {
        self.job_id = job_id;
        self
    }

    /// Set the backend configuration.
    pub fn with_backend(mut self, backend: BackendConfig) -> Self {
        self.backend = backend;
        self
    }

    /// Set the cleanup policy.
    pub fn with_cleanup_policy(mut self, policy: CleanupPolicy) -> Self {
        self.cleanup_policy = policy;
        self
    }

    /// Set the number of retained checkpoints.
    pub fn with_max_retained_checkpoints(mut self, max: usize) -> Self {
        self.max_retained_checkpoints = max;
        self
    }

    /// Set the cleanup retry interval.
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.max_retained_checkpoints == 0 {
            return Err(Error::Config(
                "max_retained_checkpoints must be at least 1".into(),
            ));
        }
        if self.cleanup_interval.is_zero() {
            return Err(Error::Config("cleanup_interval must be non-zero".into()));
        }
        match &self.backend {
            BackendConfig::Memory(memory) => memory.validate(),
            BackendConfig::FileSystem(fs) => fs.validate(),
        }
    }
}

/// Backend variants.
#[derive(Debug, Clone)]
pub enum BackendConfig {
    /// State bytes are inlined into handles held by the coordinator.
    Memory(MemoryBackendConfig),
    /// State bytes are written to files under a base directory.
    FileSystem(FsBackendConfig),
}

/// Limits of the in-process memory backend.
#[derive(Debug, Clone)]
pub struct MemoryBackendConfig {
    /// Maximum size of one state stream.
    pub per_state_max_bytes: u64,

    /// Maximum inline bytes written for one checkpoint.
    pub aggregate_max_bytes: u64,

    /// Ceiling on the encoded size of one acknowledgement.
    pub max_frame_size: u64,

    /// Optional budget shared by every open location of the backend.
    pub total_memory_budget: Option<u64>,

    /// Whether to LZ4-compress metadata.
    pub compress_metadata: bool,
}

impl Default for MemoryBackendConfig {
    fn default() -> Self {
        Self {
            per_state_max_bytes: DEFAULT_PER_STATE_MAX_BYTES,
            aggregate_max_bytes: DEFAULT_AGGREGATE_MAX_BYTES,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            total_memory_budget: None,
            compress_metadata: false,
        }
    }
}

impl MemoryBackendConfig {
    /// Set the per-state limit.
    pub fn with_per_state_max_bytes(mut self, max: u64) -> Self {
        self.per_state_max_bytes = max;
        self
    }

    /// Set the per-checkpoint aggregate limit.
    pub fn with_aggregate_max_bytes(mut self, max: u64) -> Self {
        self.aggregate_max_bytes = max;
        self
    }

    /// Set the transport frame ceiling.
    pub fn with_max_frame_size(mut self, max: u64) -> Self {
        self.max_frame_size = max;
        self
    }

    /// Set the backend-wide memory budget.
    pub fn with_total_memory_budget(mut self, budget: u64) -> Self {
        self.total_memory_budget = Some(budget);
        self
    }

    /// Set metadata compression.
    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress_metadata = compress;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.per_state_max_bytes == 0 {
            return Err(Error::Config("per_state_max_bytes must be non-zero".into()));
        }
        if self.per_state_max_bytes > self.aggregate_max_bytes {
            return Err(Error::Config(format!(
                "per_state_max_bytes ({}) exceeds aggregate_max_bytes ({})",
                self.per_state_max_bytes, self.aggregate_max_bytes
            )));
        }
        if self.max_frame_size == 0 {
            return Err(Error::Config("max_frame_size must be non-zero".into()));
        }
        Ok(())
    }
}

/// Settings of the durable filesystem backend.
#[derive(Debug, Clone)]
pub struct FsBackendConfig {
    /// Root directory; each job gets `{base_path}/{job_id}`.
    pub base_path: PathBuf,

    /// Streams whose total size stays at or below this are inlined.
    pub file_size_threshold: u64,

    /// Bytes buffered before a stream spills to its file.
    pub write_buffer_size: usize,

    /// Maximum inline bytes written for one checkpoint.
    pub aggregate_max_bytes: u64,

    /// Whether to LZ4-compress metadata.
    pub compress_metadata: bool,
}

impl FsBackendConfig {
    /// Create a configuration rooted at `base_path`.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            file_size_threshold: DEFAULT_FILE_SIZE_THRESHOLD,
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            aggregate_max_bytes: DEFAULT_AGGREGATE_MAX_BYTES,
            compress_metadata: true,
        }
    }

    /// Set the inlining threshold.
    pub fn with_file_size_threshold(mut self, threshold: u64) -> Self {
        self.file_size_threshold = threshold;
        self
    }

    /// Set the write buffer size.
    pub fn with_write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size;
        self
    }

    /// Set the per-checkpoint inline aggregate limit.
    pub fn with_aggregate_max_bytes(mut self, max: u64) -> Self {
        self.aggregate_max_bytes = max;
        self
    }

    /// Set metadata compression.
    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress_metadata = compress;
        self
    }

    /// Effective buffer size: never smaller than the inlining threshold, so
    /// a stream below the threshold never touches the filesystem.
    pub fn effective_write_buffer_size(&self) -> usize {
        self.write_buffer_size.max(self.file_size_threshold as usize)
    }

    fn validate(&self) -> Result<()> {
        if self.base_path.as_os_str().is_empty() {
            return Err(Error::Config("base_path must not be empty".into()));
        }
        if self.file_size_threshold > MAX_FILE_SIZE_THRESHOLD {
            return Err(Error::Config(format!(
                "file_size_threshold ({}) exceeds maximum of {}",
                self.file_size_threshold, MAX_FILE_SIZE_THRESHOLD
            )));
        }
        if self.write_buffer_size == 0 {
            return Err(Error::Config("write_buffer_size must be non-zero".into()));
        }
        Ok(())
    }
}

impl StorageConfig {
    /// Set the filesystem inlining threshold (filesystem backend only).
    pub fn with_file_size_threshold(mut self, threshold: u64) -> Self {
        if let BackendConfig::FileSystem(fs) = &mut self.backend {
            fs.file_size_threshold = threshold;
        }
        self
    }

    /// Set the per-state limit (memory backend only).
    pub fn with_per_state_max_bytes(mut self, max: u64) -> Self {
        if let BackendConfig::Memory(memory) = &mut self.backend {
            memory.per_state_max_bytes = max;
        }
        self
    }

    /// Set the per-checkpoint inline aggregate limit.
    pub fn with_aggregate_max_bytes(mut self, max: u64) -> Self {
        match &mut self.backend {
            BackendConfig::Memory(memory) => memory.aggregate_max_bytes = max,
            BackendConfig::FileSystem(fs) => fs.aggregate_max_bytes = max,
        }
        self
    }
}
