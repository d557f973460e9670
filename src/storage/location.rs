//! Per-checkpoint storage location.

use crate::checkpoint::{CompletedCheckpoint, PendingCheckpoint};
use crate::error::{Error, Result};
use crate::handle::{DiscardToken, StateHandle, StateHandleId};
use crate::storage::budget::{InlineBudget, MemoryBudget};
use crate::storage::stream::CheckpointStateOutputStream;
use crate::storage::{CheckpointStorage, LocationClaim};
use crate::types::{CheckpointId, LocationState, StateScope};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Directories a filesystem location writes into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationDirs {
    /// `{base}/{job}`
    pub base: PathBuf,
    /// `{base}/{job}/chk-<id>`
    pub exclusive: PathBuf,
    /// `{base}/{job}/shared`
    pub shared: PathBuf,
    /// `{base}/{job}/taskowned`
    pub task_owned: PathBuf,
}

impl LocationDirs {
    /// Directory for state of the given scope.
    pub fn for_scope(&self, scope: StateScope) -> &Path {
        match scope {
            StateScope::Exclusive => &self.exclusive,
            StateScope::Shared => &self.shared,
            StateScope::TaskOwned => &self.task_owned,
        }
    }
}

/// How streams of a location store their bytes.
#[derive(Debug, Clone)]
pub(crate) enum StreamTarget {
    /// Everything is inlined into the handle.
    Memory {
        per_state_max: u64,
        max_frame_size: u64,
        memory_budget: Option<Arc<MemoryBudget>>,
    },
    /// Small streams are inlined, the rest spill into files.
    File {
        dirs: LocationDirs,
        file_size_threshold: u64,
        write_buffer_size: usize,
    },
}

/// What disposing an open location left for the caller to handle.
#[derive(Debug, Clone, Default)]
pub struct LocationDisposal {
    /// Shared handles written to the location; delete only if unreferenced.
    pub shared_candidates: Vec<StateHandle>,
    /// Deletions that failed and should be retried.
    pub failed: Vec<DiscardToken>,
}

impl LocationDisposal {
    pub fn is_empty(&self) -> bool {
        self.shared_candidates.is_empty() && self.failed.is_empty()
    }
}

/// The place tasks write the state of one checkpoint into.
///
/// A location starts `Open`, accepts streams from any number of tasks, and
/// ends either `Finalized` (its metadata was persisted) or `Disposed`.
#[derive(Debug)]
pub struct CheckpointStorageLocation {
    checkpoint_id: CheckpointId,

    storage: Arc<dyn CheckpointStorage>,

    target: StreamTarget,

    /// Inline bytes of this checkpoint
    aggregate: InlineBudget,

    state: RwLock<LocationState>,

    /// Handles of closed streams, in close order
    closed: Mutex<Vec<StateHandle>>,

    /// Result of an internal dispose, handed out once
    disposal: Mutex<Option<LocationDisposal>>,

    /// Held while the location is open
    claim: Mutex<Option<LocationClaim>>,

    bytes_written: AtomicU64,
}

impl CheckpointStorageLocation {
    pub(crate) fn new(
        checkpoint_id: CheckpointId,
        storage: Arc<dyn CheckpointStorage>,
        target: StreamTarget,
        aggregate_max_bytes: u64,
        claim: LocationClaim,
    ) -> Arc<Self> {
        Arc::new(Self {
            checkpoint_id,
            storage,
            target,
            aggregate: InlineBudget::new(aggregate_max_bytes),
            state: RwLock::new(LocationState::Open),
            closed: Mutex::new(Vec::new()),
            disposal: Mutex::new(None),
            claim: Mutex::new(Some(claim)),
            bytes_written: AtomicU64::new(0),
        })
    }

    pub fn checkpoint_id(&self) -> CheckpointId {
        self.checkpoint_id
    }

    pub fn state(&self) -> LocationState {
        *self.state.read()
    }

    pub fn is_open(&self) -> bool {
        self.state() == LocationState::Open
    }

    /// Directories of a filesystem location; `None` for the memory backend.
    pub fn dirs(&self) -> Option<&LocationDirs> {
        match &self.target {
            StreamTarget::File { dirs, .. } => Some(dirs),
            StreamTarget::Memory { .. } => None,
        }
    }

    /// Inline bytes reserved by this checkpoint so far.
    pub fn inline_bytes_used(&self) -> u64 {
        self.aggregate.used()
    }

    /// Bytes of all streams closed into this location.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// Number of streams closed into this location.
    pub fn closed_stream_count(&self) -> usize {
        self.closed.lock().len()
    }

    pub(crate) fn target(&self) -> &StreamTarget {
        &self.target
    }

    pub(crate) fn aggregate(&self) -> &InlineBudget {
        &self.aggregate
    }

    pub(crate) fn storage(&self) -> &Arc<dyn CheckpointStorage> {
        &self.storage
    }

    /// Open a stream for state of the given scope.
    pub fn open_output_stream(
        self: &Arc<Self>,
        scope: StateScope,
    ) -> Result<CheckpointStateOutputStream> {
        let state = self.state();
        if state != LocationState::Open {
            return Err(Error::LocationNotOpen {
                checkpoint_id: self.checkpoint_id,
                state,
            });
        }
        Ok(CheckpointStateOutputStream::new(self.clone(), scope))
    }

    /// Record the handle of a closed stream.
    ///
    /// If the location stopped accepting state while the stream was being
    /// written, the artifact is deleted and `LocationNotOpen` returned.
    pub(crate) fn register_closed(&self, handle: StateHandle) -> Result<StateHandle> {
        {
            let state = self.state.read();
            if *state == LocationState::Open {
                self.bytes_written
                    .fetch_add(handle.size_bytes(), Ordering::Relaxed);
                self.closed.lock().push(handle.clone());
                return Ok(handle);
            }
        }

        let state = self.state();
        debug!(
            checkpoint_id = self.checkpoint_id,
            handle = %handle.id(),
            %state,
            "Discarding state closed after location stopped accepting streams"
        );
        if let Err(e) = self
            .storage
            .discard_state(&DiscardToken::job_teardown(&handle))
        {
            warn!(handle = %handle.id(), error = %e, "Failed to discard late state");
        }
        Err(Error::LocationNotOpen {
            checkpoint_id: self.checkpoint_id,
            state,
        })
    }

    /// Turn the acknowledgements of `pending` into a completed checkpoint.
    ///
    /// The metadata is persisted through the backend and the location becomes
    /// immutable. If acknowledgements are missing or the metadata cannot be
    /// written, the location is disposed before the error is returned.
    pub fn finalize_location(&self, pending: PendingCheckpoint) -> Result<CompletedCheckpoint> {
        let mut state = self.state.write();
        if *state != LocationState::Open {
            return Err(Error::LocationNotOpen {
                checkpoint_id: self.checkpoint_id,
                state: *state,
            });
        }
        if pending.checkpoint_id() != self.checkpoint_id {
            return Err(Error::CheckpointMismatch {
                expected: self.checkpoint_id,
                actual: pending.checkpoint_id(),
            });
        }

        if !pending.is_fully_acknowledged() {
            let missing = pending.missing();
            warn!(
                checkpoint_id = self.checkpoint_id,
                missing = missing.len(),
                "Finalizing incomplete checkpoint, disposing location"
            );
            let disposal = self.dispose_locked(&mut state, false);
            *self.disposal.lock() = Some(disposal);
            return Err(Error::IncompleteCheckpoint {
                checkpoint_id: self.checkpoint_id,
                missing,
            });
        }

        let duration = pending.elapsed();
        let pointer = self.storage.metadata_pointer(self.checkpoint_id);
        let metadata = pending.into_metadata(pointer);

        let info = match self.storage.persist_metadata(&metadata) {
            Ok(info) => info,
            Err(e) => {
                warn!(
                    checkpoint_id = self.checkpoint_id,
                    error = %e,
                    "Failed to persist metadata, disposing location"
                );
                let disposal = self.dispose_locked(&mut state, false);
                *self.disposal.lock() = Some(disposal);
                return Err(e);
            }
        };

        *state = LocationState::Finalized;
        self.claim.lock().take();

        let closed = std::mem::take(&mut *self.closed.lock());
        let referenced: HashSet<&StateHandleId> = metadata.handles().map(|h| h.id()).collect();
        let orphaned: Vec<StateHandle> = closed
            .into_iter()
            .filter(|h| h.scope() != StateScope::TaskOwned && !referenced.contains(h.id()))
            .collect();

        let total_size = metadata.total_size();
        info!(
            checkpoint_id = self.checkpoint_id,
            operators = info.operator_count,
            total_size,
            metadata_size = info.file_size,
            orphaned = orphaned.len(),
            pointer = %metadata.external_pointer,
            "Checkpoint location finalized"
        );

        Ok(CompletedCheckpoint {
            metadata,
            duration,
            total_size,
            orphaned,
        })
    }

    /// Release everything written to this location.
    ///
    /// Exclusive artifacts are deleted; shared handles are returned so the
    /// caller can delete the ones no retained checkpoint references.
    /// Task-owned state is left to its task. Disposing twice is a no-op; a
    /// finalized location is only marked disposed since its artifacts now
    /// belong to retention.
    pub fn dispose(&self) -> LocationDisposal {
        self.dispose_with(false)
    }

    /// Dispose, optionally deleting task-owned state as well (job teardown).
    pub(crate) fn dispose_with(&self, include_task_owned: bool) -> LocationDisposal {
        let mut state = self.state.write();
        self.dispose_locked(&mut state, include_task_owned)
    }

    fn dispose_locked(
        &self,
        state: &mut LocationState,
        include_task_owned: bool,
    ) -> LocationDisposal {
        match *state {
            LocationState::Disposed => return self.disposal.lock().take().unwrap_or_default(),
            LocationState::Finalized => {
                *state = LocationState::Disposed;
                return LocationDisposal::default();
            }
            LocationState::Open => {}
        }
        *state = LocationState::Disposed;

        let closed = std::mem::take(&mut *self.closed.lock());
        let mut disposal = LocationDisposal::default();
        let mut deleted = 0usize;

        for handle in closed {
            let token = match handle.scope() {
                StateScope::Shared => {
                    disposal.shared_candidates.push(handle);
                    continue;
                }
                StateScope::Exclusive => DiscardToken::coordinator_owned(&handle),
                StateScope::TaskOwned if include_task_owned => {
                    Some(DiscardToken::job_teardown(&handle))
                }
                StateScope::TaskOwned => None,
            };
            let Some(token) = token else { continue };

            match self.storage.discard_state(&token) {
                Ok(()) => deleted += 1,
                Err(e) => {
                    warn!(
                        checkpoint_id = self.checkpoint_id,
                        handle = %handle.id(),
                        error = %e,
                        "Failed to discard state of disposed location"
                    );
                    disposal.failed.push(token);
                }
            }
        }

        if let Err(e) = self.storage.discard_metadata(self.checkpoint_id) {
            warn!(
                checkpoint_id = self.checkpoint_id,
                error = %e,
                "Failed to remove checkpoint directory"
            );
        }
        self.claim.lock().take();

        info!(
            checkpoint_id = self.checkpoint_id,
            deleted,
            shared_candidates = disposal.shared_candidates.len(),
            failed = disposal.failed.len(),
            "Checkpoint location disposed"
        );
        disposal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::TaskAcknowledgement;
    use crate::config::{FsBackendConfig, MemoryBackendConfig};
    use crate::storage::{FsCheckpointStorage, MemoryCheckpointStorage};
    use crate::types::{JobId, OperatorId};
    use std::io::Write;
    use tempfile::tempdir;

    fn write_state(
        location: &Arc<CheckpointStorageLocation>,
        scope: StateScope,
        bytes: &[u8],
    ) -> StateHandle {
        let mut stream = location.open_output_stream(scope).unwrap();
        stream.write_all(bytes).unwrap();
        stream.close_and_get_handle().unwrap()
    }

    fn pending(checkpoint_id: CheckpointId, operators: &[&str]) -> PendingCheckpoint {
        PendingCheckpoint::new(checkpoint_id, operators.iter().map(|o| OperatorId::new(*o)))
    }

    #[test]
    fn test_finalize_persists_metadata() {
        let storage = MemoryCheckpointStorage::new(JobId::new(), MemoryBackendConfig::default());
        let location = storage.create_checkpoint_location(1).unwrap();

        let handle = write_state(&location, StateScope::Exclusive, b"counter=7");
        let mut pending = pending(1, &["map"]);
        pending.acknowledge(TaskAcknowledgement::new(1, "map", vec![handle.clone()]));

        let completed = location.finalize_location(pending).unwrap();
        assert_eq!(location.state(), LocationState::Finalized);
        assert_eq!(completed.total_size, 9);
        assert!(completed.orphaned.is_empty());

        let restored = storage
            .resolve_checkpoint_pointer(completed.external_pointer())
            .unwrap();
        assert_eq!(restored.operator_states[&OperatorId::new("map")], vec![handle]);
    }

    #[test]
    fn test_no_streams_after_finalize() {
        let storage = MemoryCheckpointStorage::new(JobId::new(), MemoryBackendConfig::default());
        let location = storage.create_checkpoint_location(1).unwrap();
        let mut late = location.open_output_stream(StateScope::Exclusive).unwrap();
        late.write_all(b"late").unwrap();

        location.finalize_location(pending(1, &[])).unwrap();

        assert!(matches!(
            location.open_output_stream(StateScope::Exclusive),
            Err(Error::LocationNotOpen { .. })
        ));
        assert!(matches!(
            late.close_and_get_handle(),
            Err(Error::LocationNotOpen { .. })
        ));
        assert!(matches!(
            location.finalize_location(pending(1, &[])),
            Err(Error::LocationNotOpen { .. })
        ));
    }

    #[test]
    fn test_incomplete_checkpoint_disposes_location() {
        let dir = tempdir().unwrap();
        let config = FsBackendConfig::new(dir.path()).with_file_size_threshold(0);
        let storage = FsCheckpointStorage::new(JobId::new(), config).unwrap();
        let location = storage.create_checkpoint_location(3).unwrap();

        let exclusive = write_state(&location, StateScope::Exclusive, b"exclusive bytes");
        let shared = write_state(&location, StateScope::Shared, b"shared bytes");
        assert!(exclusive.file_path().unwrap().exists());

        let mut pending = pending(3, &["source", "sink"]);
        pending.acknowledge(TaskAcknowledgement::new(3, "source", vec![exclusive.clone()]));

        match location.finalize_location(pending) {
            Err(Error::IncompleteCheckpoint { missing, .. }) => {
                assert_eq!(missing, vec![OperatorId::new("sink")]);
            }
            other => panic!("expected IncompleteCheckpoint, got {:?}", other),
        }
        assert_eq!(location.state(), LocationState::Disposed);
        assert!(!exclusive.file_path().unwrap().exists());

        // The internal disposal is handed out once, then dispose is a no-op.
        let disposal = location.dispose();
        assert_eq!(disposal.shared_candidates, vec![shared]);
        assert!(location.dispose().is_empty());
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let dir = tempdir().unwrap();
        let config = FsBackendConfig::new(dir.path()).with_file_size_threshold(0);
        let storage = FsCheckpointStorage::new(JobId::new(), config).unwrap();
        let location = storage.create_checkpoint_location(5).unwrap();
        let exclusive = write_state(&location, StateScope::Exclusive, b"partial");
        let owned = write_state(&location, StateScope::TaskOwned, b"offsets");

        let first = location.dispose();
        assert!(first.failed.is_empty());
        assert!(!exclusive.file_path().unwrap().exists());
        assert!(owned.file_path().unwrap().exists());
        assert!(!location.dirs().unwrap().exclusive.exists());

        let second = location.dispose();
        assert!(second.is_empty());
        assert_eq!(location.state(), LocationState::Disposed);
    }

    #[test]
    fn test_teardown_dispose_removes_task_owned() {
        let dir = tempdir().unwrap();
        let config = FsBackendConfig::new(dir.path()).with_file_size_threshold(0);
        let storage = FsCheckpointStorage::new(JobId::new(), config).unwrap();
        let location = storage.create_checkpoint_location(5).unwrap();
        let owned = write_state(&location, StateScope::TaskOwned, b"offsets");

        location.dispose_with(true);
        assert!(!owned.file_path().unwrap().exists());
    }

    #[test]
    fn test_orphans_are_reported_on_finalize() {
        let storage = MemoryCheckpointStorage::new(JobId::new(), MemoryBackendConfig::default());
        let location = storage.create_checkpoint_location(2).unwrap();

        let used = write_state(&location, StateScope::Exclusive, b"used");
        let unused = write_state(&location, StateScope::Exclusive, b"unused");
        let unused_shared = write_state(&location, StateScope::Shared, b"unused shared");
        write_state(&location, StateScope::TaskOwned, b"task keeps this");

        let mut pending = pending(2, &["op"]);
        pending.acknowledge(TaskAcknowledgement::new(2, "op", vec![used]));
        let completed = location.finalize_location(pending).unwrap();

        assert_eq!(completed.orphaned, vec![unused, unused_shared]);
    }

    #[test]
    fn test_mismatched_acknowledgements_rejected() {
        let storage = MemoryCheckpointStorage::new(JobId::new(), MemoryBackendConfig::default());
        let location = storage.create_checkpoint_location(2).unwrap();

        assert!(matches!(
            location.finalize_location(pending(3, &[])),
            Err(Error::CheckpointMismatch {
                expected: 2,
                actual: 3
            })
        ));
        assert!(location.is_open());
    }

    #[test]
    fn test_dirs_per_scope() {
        let dirs = LocationDirs {
            base: PathBuf::from("/b/j"),
            exclusive: PathBuf::from("/b/j/chk-1"),
            shared: PathBuf::from("/b/j/shared"),
            task_owned: PathBuf::from("/b/j/taskowned"),
        };
        assert_eq!(dirs.for_scope(StateScope::Exclusive), Path::new("/b/j/chk-1"));
        assert_eq!(dirs.for_scope(StateScope::Shared), Path::new("/b/j/shared"));
        assert_eq!(dirs.for_scope(StateScope::TaskOwned), Path::new("/b/j/taskowned"));
    }
}
