use crate::checkpoint::{CompletedCheckpoint, PendingCheckpoint, TaskAcknowledgement};
use crate::handle::StateHandle;
use crate::storage::CheckpointStorageLocation;
use crate::types::{CheckpointId, OperatorId, StateScope};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Operator acknowledging in single-operator test checkpoints.
pub(crate) const TEST_OPERATOR: &str = "task";

/// Write `bytes` into a new stream of `scope` and close it.
pub(crate) fn write_state(
    location: &Arc<CheckpointStorageLocation>,
    scope: StateScope,
    bytes: &[u8],
) -> StateHandle {
    let mut stream = location.open_output_stream(scope).unwrap();
    stream.write_all(bytes).unwrap();
    stream.close_and_get_handle().unwrap()
}

/// A pending checkpoint fully acknowledged by [`TEST_OPERATOR`].
pub(crate) fn pending_for(checkpoint_id: CheckpointId, handles: Vec<StateHandle>) -> PendingCheckpoint {
    let mut pending = PendingCheckpoint::new(checkpoint_id, [OperatorId::new(TEST_OPERATOR)]);
    pending.acknowledge(TaskAcknowledgement::new(checkpoint_id, TEST_OPERATOR, handles));
    pending
}

/// Finalize `location` with `handles` acknowledged.
pub(crate) fn complete_checkpoint(
    location: &Arc<CheckpointStorageLocation>,
    handles: Vec<StateHandle>,
) -> CompletedCheckpoint {
    location
        .finalize_location(pending_for(location.checkpoint_id(), handles))
        .unwrap()
}

/// Every file below `dir`, recursively. Empty if `dir` does not exist.
pub(crate) fn files_under(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return files;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            files.extend(files_under(&path));
        } else {
            files.push(path);
        }
    }
    files
}
