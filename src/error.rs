//! Error types for checkpoint storage.

use crate::types::{CheckpointId, LocationState, OperatorId};
use std::fmt;
use std::io;
use thiserror::Error;

/// Result type alias for checkpoint storage operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for checkpoint storage.
///
/// Every error is reported to the checkpoint coordinator; the coordinator
/// alone decides whether to retry a checkpoint or fail the job. See
/// [`Error::is_retryable`].
#[derive(Error, Debug)]
pub enum Error {
    /// The storage medium (filesystem, memory budget) cannot be reached.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A per-state, per-checkpoint or transport size limit was hit.
    #[error(
        "{limit} exceeded: {size} bytes requested, limit is {max} bytes \
         (raise the limit or use the filesystem backend)"
    )]
    CapacityExceeded {
        limit: CapacityLimit,
        size: u64,
        max: u64,
    },

    /// Finalize was called before every required task acknowledged.
    #[error("checkpoint {checkpoint_id} incomplete, missing acknowledgements from {missing:?}")]
    IncompleteCheckpoint {
        checkpoint_id: CheckpointId,
        missing: Vec<OperatorId>,
    },

    /// Checkpoint metadata exists but its byte layout is invalid.
    #[error("corrupt checkpoint metadata at {pointer}: {reason}")]
    CorruptMetadata { pointer: String, reason: String },

    /// State bytes do not match the checksum recorded in their handle.
    #[error("corrupt state {handle}: {reason}")]
    CorruptState { handle: String, reason: String },

    /// A restore pointer or state handle does not resolve.
    #[error("not found: {0}")]
    NotFound(String),

    /// Write or close on a stream that was already sealed.
    #[error("stream already closed")]
    StreamAlreadyClosed,

    /// A live location already exists for this checkpoint id.
    #[error("location for checkpoint {0} already exists")]
    LocationExists(CheckpointId),

    /// The location no longer accepts streams or finalization.
    #[error("location for checkpoint {checkpoint_id} is {state}")]
    LocationNotOpen {
        checkpoint_id: CheckpointId,
        state: LocationState,
    },

    /// Acknowledgements for one checkpoint were offered to another.
    #[error("acknowledgements for checkpoint {actual} offered to location {expected}")]
    CheckpointMismatch {
        expected: CheckpointId,
        actual: CheckpointId,
    },

    /// The checkpoint is already registered with the retention manager.
    #[error("checkpoint {0} is already registered")]
    AlreadyRegistered(CheckpointId),

    /// The checkpoint is not known to the retention manager.
    #[error("unknown checkpoint: {0}")]
    UnknownCheckpoint(CheckpointId),

    /// A task tried to release state it does not own.
    #[error("state {0} is not task-owned")]
    NotTaskOwned(String),

    /// Subsumption requested while no strictly newer checkpoint completed.
    #[error("checkpoint {0} cannot be subsumed: no newer completed checkpoint")]
    NotSubsumable(CheckpointId),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether the coordinator may retry the checkpoint on its next schedule.
    ///
    /// Capacity, restore and contract errors are final: retrying with the
    /// same data or the same pointer cannot succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::StorageUnavailable(_) | Error::IncompleteCheckpoint { .. } | Error::Io(_)
        )
    }

    /// Short label used when counting errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::StorageUnavailable(_) => "storage_unavailable",
            Error::CapacityExceeded { .. } => "capacity_exceeded",
            Error::IncompleteCheckpoint { .. } => "incomplete_checkpoint",
            Error::CorruptMetadata { .. } => "corrupt_metadata",
            Error::CorruptState { .. } => "corrupt_state",
            Error::NotFound(_) => "not_found",
            Error::StreamAlreadyClosed => "stream_already_closed",
            Error::LocationExists(_) => "location_exists",
            Error::LocationNotOpen { .. } => "location_not_open",
            Error::CheckpointMismatch { .. } => "checkpoint_mismatch",
            Error::AlreadyRegistered(_) => "already_registered",
            Error::UnknownCheckpoint(_) => "unknown_checkpoint",
            Error::NotTaskOwned(_) => "not_task_owned",
            Error::NotSubsumable(_) => "not_subsumable",
            Error::Config(_) => "config",
            Error::Serialization(_) => "serialization",
            Error::Io(_) => "io",
        }
    }

    pub(crate) fn capacity(limit: CapacityLimit, size: u64, max: u64) -> Self {
        Error::CapacityExceeded { limit, size, max }
    }
}

/// Which size limit a [`Error::CapacityExceeded`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityLimit {
    /// Size of a single state stream (memory backend).
    PerState,
    /// Total inline bytes of one checkpoint.
    CheckpointAggregate,
    /// Backend-wide memory shared by all open locations.
    MemoryBudget,
    /// Encoded acknowledgement larger than the transport frame.
    FrameSize,
}

impl fmt::Display for CapacityLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CapacityLimit::PerState => "per-state size limit",
            CapacityLimit::CheckpointAggregate => "checkpoint aggregate size limit",
            CapacityLimit::MemoryBudget => "backend memory budget",
            CapacityLimit::FrameSize => "transport frame size",
        };
        f.write_str(name)
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
