//! Core types used throughout checkpoint storage.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Monotonically increasing checkpoint identifier assigned by the coordinator.
pub type CheckpointId = u64;

/// Identifier of the job whose checkpoints are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    /// Create a random job id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing uuid.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying uuid.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Identifier of an operator whose state a task snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperatorId(String);

impl OperatorId {
    /// Create an operator id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OperatorId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Ownership scope of a piece of checkpointed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateScope {
    /// Referenced only by the checkpoint that wrote it.
    Exclusive,
    /// May be referenced by several checkpoints; reference counted.
    Shared,
    /// Owned by the writing task; never deleted by the coordinator on its own.
    TaskOwned,
}

impl fmt::Display for StateScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateScope::Exclusive => write!(f, "exclusive"),
            StateScope::Shared => write!(f, "shared"),
            StateScope::TaskOwned => write!(f, "task-owned"),
        }
    }
}

/// What happens to retained checkpoints when the job is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CleanupPolicy {
    /// Keep retained checkpoints so an operator can resume from them later.
    RetainOnCancellation,
    /// Tear everything down.
    #[default]
    DeleteOnCancellation,
}

/// Terminal (or suspending) status the job reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// The job ran to completion.
    Finished,
    /// The job was cancelled by a user.
    Cancelled,
    /// The job failed; retained checkpoints are kept for recovery.
    Failed,
    /// The job was suspended and will be resumed elsewhere.
    Suspended,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Finished => write!(f, "finished"),
            JobStatus::Cancelled => write!(f, "cancelled"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Suspended => write!(f, "suspended"),
        }
    }
}

/// Lifecycle state of a checkpoint storage location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationState {
    /// Tasks may open and close streams.
    Open,
    /// Metadata has been written; the location is immutable.
    Finalized,
    /// Artifacts have been released.
    Disposed,
}

impl fmt::Display for LocationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocationState::Open => write!(f, "open"),
            LocationState::Finalized => write!(f, "finalized"),
            LocationState::Disposed => write!(f, "disposed"),
        }
    }
}
