//! Checkpoint storage for distributed stream processing.
//!
//! This crate persists the state snapshots of a running job and decides when
//! they may be deleted:
//!
//! - **Locations**: one per checkpoint, handing out output streams to tasks
//! - **Scopes**: exclusive, shared (reused across checkpoints) and
//!   task-owned state
//! - **Backends**: inline in-memory storage or a filesystem layout
//! - **Retention**: reference-counted shared state, subsumption and
//!   cancellation policies
//!
//! # Example
//!
//! ```rust,no_run
//! use chkstore::{
//!     CheckpointStorageCoordinator, OperatorId, PendingCheckpoint, StateScope, StorageConfig,
//!     TaskAcknowledgement,
//! };
//!
//! fn main() -> chkstore::Result<()> {
//!     let config = StorageConfig::new("/var/lib/checkpoints")
//!         .with_max_retained_checkpoints(2);
//!     let coordinator = CheckpointStorageCoordinator::new(config)?;
//!
//!     // The coordinator creates a location for checkpoint 1...
//!     let location = coordinator.create_checkpoint_location(1)?;
//!
//!     // ...every task writes its state through a stream...
//!     let mut stream = location.open_output_stream(StateScope::Exclusive)?;
//!     stream.write_bytes(b"window contents")?;
//!     let handle = stream.close_and_get_handle()?;
//!
//!     // ...and acknowledges the handles it produced.
//!     let mut pending = PendingCheckpoint::new(1, [OperatorId::new("window")]);
//!     pending.acknowledge(TaskAcknowledgement::new(1, "window", vec![handle]));
//!
//!     let completed = coordinator.finalize(&location, pending)?;
//!     println!("restore from {}", completed.external_pointer());
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │       CheckpointStorageCoordinator          │
//! │  • create_checkpoint_location(id)           │
//! │  • finalize / abort / subsume               │
//! │  • restore_checkpoint(pointer)              │
//! │  • shutdown(status)                         │
//! └─────────────────────────────────────────────┘
//!                     │
//!     ┌───────────────┼───────────────┐
//!     ▼               ▼               ▼
//! ┌──────────┐  ┌───────────┐  ┌────────────┐
//! │ Storage  │  │ Retention │  │ Checkpoint │
//! │ backends │  │ manager   │  │ metadata   │
//! └──────────┘  └───────────┘  └────────────┘
//! ```
//!
//! # Cleanup Policies
//!
//! - `DeleteOnCancellation` (default): a cancelled job leaves nothing behind
//! - `RetainOnCancellation`: retained checkpoints survive cancellation
//!
//! Failed and suspended jobs always keep their retained checkpoints so they
//! can be restored.

pub mod checkpoint;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod handle;
pub mod metrics;
pub mod retention;
pub mod storage;
pub mod testing;
pub mod types;

pub use config::{
    BackendConfig, FsBackendConfig, MemoryBackendConfig, StorageConfig,
    DEFAULT_AGGREGATE_MAX_BYTES, DEFAULT_FILE_SIZE_THRESHOLD, DEFAULT_MAX_FRAME_SIZE,
    DEFAULT_PER_STATE_MAX_BYTES, DEFAULT_WRITE_BUFFER_SIZE, MAX_FILE_SIZE_THRESHOLD,
};
pub use coordinator::CheckpointStorageCoordinator;
pub use error::{CapacityLimit, Error, Result};
pub use handle::{DiscardToken, StateHandle, StateHandleId, StateLocator};
pub use types::{
    CheckpointId, CleanupPolicy, JobId, JobStatus, LocationState, OperatorId, StateScope,
};

// Re-export checkpoint types
pub use checkpoint::{
    CheckpointMetadata, CompletedCheckpoint, FormatError, MetadataFileInfo, MetadataReader,
    MetadataWriter, PendingCheckpoint, TaskAcknowledgement,
};

// Re-export storage types
pub use storage::{
    CheckpointStateOutputStream, CheckpointStorage, CheckpointStorageLocation,
    FsCheckpointStorage, InlineBudget, LocationDirs, LocationDisposal, MemoryBudget,
    MemoryCheckpointStorage, METADATA_FILE_NAME,
};

// Re-export retention types
pub use retention::{RetentionManager, RetentionRecord, SharedStateEntry, SharedStateRegistry};

// Re-export metrics types
pub use metrics::{
    Counter, Gauge, Histogram, HistogramSnapshot, LabeledCounter, MetricsSnapshot,
    StorageMetrics, DURATION_BUCKETS, SIZE_BUCKETS,
};

// Re-export testing types
pub use testing::{FaultyStorage, StorageFaults};
