//! Coordinator-facing entry point of checkpoint storage.
//!
//! [`CheckpointStorageCoordinator`] ties a backend to a retention manager:
//!
//! 1. `create_checkpoint_location` hands a location to the tasks of one
//!    checkpoint.
//! 2. `finalize` turns the collected acknowledgements into a completed
//!    checkpoint and registers it, subsuming older ones.
//! 3. `abort` releases whatever a failed or timed out checkpoint wrote.
//! 4. `shutdown` applies the cleanup policy once the job stops.
//!
//! Every error is returned to the caller; deciding between retrying a
//! checkpoint and failing the job is left to the caller.

use crate::checkpoint::{CheckpointMetadata, CompletedCheckpoint, PendingCheckpoint};
use crate::config::{BackendConfig, StorageConfig};
use crate::error::{Error, Result};
use crate::handle::{DiscardToken, StateHandle};
use crate::metrics::StorageMetrics;
use crate::retention::RetentionManager;
use crate::storage::{
    CheckpointStorage, CheckpointStorageLocation, FsCheckpointStorage, LocationDisposal,
    MemoryCheckpointStorage,
};
use crate::types::{CheckpointId, CleanupPolicy, JobStatus, LocationState};
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Checkpoint storage as seen by the checkpoint coordinator of one job.
pub struct CheckpointStorageCoordinator {
    config: StorageConfig,

    storage: Arc<dyn CheckpointStorage>,

    retention: RetentionManager,

    /// Locations handed out and not yet finalized or aborted
    locations: DashMap<CheckpointId, Arc<CheckpointStorageLocation>>,

    metrics: Arc<StorageMetrics>,
}

impl CheckpointStorageCoordinator {
    /// Build the backend described by `config`.
    pub fn new(config: StorageConfig) -> Result<Self> {
        config.validate()?;

        let storage: Arc<dyn CheckpointStorage> = match &config.backend {
            BackendConfig::Memory(memory) => Arc::new(MemoryCheckpointStorage::new(
                config.job_id,
                memory.clone(),
            )),
            BackendConfig::FileSystem(fs) => {
                Arc::new(FsCheckpointStorage::new(config.job_id, fs.clone())?)
            }
        };

        Ok(Self::with_storage(config, storage))
    }

    /// Use an already constructed backend.
    pub fn with_storage(config: StorageConfig, storage: Arc<dyn CheckpointStorage>) -> Self {
        let metrics = Arc::new(StorageMetrics::new());
        let retention = RetentionManager::new(
            storage.clone(),
            config.cleanup_policy,
            config.max_retained_checkpoints,
            metrics.clone(),
        );

        info!(
            job_id = %storage.job_id(),
            policy = ?config.cleanup_policy,
            max_retained = config.max_retained_checkpoints,
            "Checkpoint storage coordinator started"
        );

        Self {
            config,
            storage,
            retention,
            locations: DashMap::new(),
            metrics,
        }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn CheckpointStorage> {
        &self.storage
    }

    pub fn retention(&self) -> &RetentionManager {
        &self.retention
    }

    pub fn metrics(&self) -> &Arc<StorageMetrics> {
        &self.metrics
    }

    /// Create the location the tasks of `checkpoint_id` write into.
    pub fn create_checkpoint_location(
        &self,
        checkpoint_id: CheckpointId,
    ) -> Result<Arc<CheckpointStorageLocation>> {
        let location = self
            .storage
            .create_checkpoint_location(checkpoint_id)
            .map_err(|e| self.report(e))?;

        self.locations.insert(checkpoint_id, location.clone());
        self.metrics.locations_created.inc();
        self.metrics.open_locations.set_count(self.locations.len());

        info!(checkpoint_id, "Created checkpoint location");
        Ok(location)
    }

    /// Location currently open for `checkpoint_id`.
    pub fn location(&self, checkpoint_id: CheckpointId) -> Option<Arc<CheckpointStorageLocation>> {
        self.locations.get(&checkpoint_id).map(|l| l.value().clone())
    }

    pub fn open_locations(&self) -> usize {
        self.locations.len()
    }

    /// Finalize `location` and register the completed checkpoint.
    ///
    /// When finalize fails because acknowledgements are missing or the
    /// metadata cannot be written, the location has already been disposed;
    /// its shared state is released here before the error is returned.
    pub fn finalize(
        &self,
        location: &Arc<CheckpointStorageLocation>,
        pending: PendingCheckpoint,
    ) -> Result<CompletedCheckpoint> {
        let checkpoint_id = location.checkpoint_id();

        let mut completed = match location.finalize_location(pending) {
            Ok(completed) => completed,
            Err(e) => {
                if location.state() == LocationState::Disposed {
                    let tracked = self.forget(location);
                    self.release(location.dispose());
                    if tracked {
                        self.metrics.checkpoints_aborted.inc();
                    }
                }
                return Err(self.report(e));
            }
        };
        self.forget(location);

        let orphaned = std::mem::take(&mut completed.orphaned);
        let registered = CompletedCheckpoint {
            orphaned,
            ..completed.clone()
        };
        let subsumed = self
            .retention
            .register_completed(registered)
            .map_err(|e| self.report(e))?;

        self.metrics
            .record_finalize(completed.duration, completed.total_size);
        info!(
            checkpoint_id,
            total_size = completed.total_size,
            duration_ms = completed.duration.as_millis() as u64,
            subsumed = ?subsumed,
            "Checkpoint completed"
        );
        Ok(completed)
    }

    /// Abort `location`, deleting what it wrote. Idempotent.
    pub fn abort(&self, location: &Arc<CheckpointStorageLocation>) {
        let tracked = self.forget(location);
        self.release(location.dispose());

        if tracked {
            self.metrics.checkpoints_aborted.inc();
            info!(checkpoint_id = location.checkpoint_id(), "Checkpoint aborted");
        }
    }

    /// Abort the open location of `checkpoint_id`, if any.
    pub fn abort_checkpoint(&self, checkpoint_id: CheckpointId) -> bool {
        match self.location(checkpoint_id) {
            Some(location) => {
                self.abort(&location);
                true
            }
            None => false,
        }
    }

    /// Subsume a retained checkpoint made obsolete by a newer one.
    pub fn subsume(&self, checkpoint_id: CheckpointId) -> Result<()> {
        self.retention
            .subsume(checkpoint_id)
            .map_err(|e| self.report(e))
    }

    /// Delete one retained checkpoint on request.
    pub fn discard_checkpoint(&self, checkpoint_id: CheckpointId) -> Result<()> {
        self.retention
            .discard_checkpoint(checkpoint_id)
            .map_err(|e| self.report(e))
    }

    /// Resolve a restore pointer. Retention is left untouched.
    pub fn resolve_pointer(&self, pointer: &str) -> Result<CheckpointMetadata> {
        self.storage
            .resolve_checkpoint_pointer(pointer)
            .map_err(|e| self.report(e))
    }

    /// Resolve a restore pointer and keep its checkpoint alive.
    pub fn restore_checkpoint(&self, pointer: &str) -> Result<CheckpointMetadata> {
        let metadata = self.resolve_pointer(pointer)?;
        self.retention
            .register_restored(metadata.clone())
            .map_err(|e| self.report(e))?;

        self.metrics.checkpoints_restored.inc();
        info!(
            checkpoint_id = metadata.checkpoint_id,
            pointer,
            "Restored checkpoint"
        );
        Ok(metadata)
    }

    /// Read the payload behind a restored handle.
    pub fn read_state(&self, handle: &StateHandle) -> Result<Bytes> {
        self.storage.read_state(handle).map_err(|e| self.report(e))
    }

    /// Release task-owned state on behalf of the task that wrote it.
    ///
    /// Retention never deletes task-owned state before job teardown, so a
    /// task that no longer needs it calls this. Releasing the same handle
    /// again is a no-op.
    pub fn discard_task_owned(&self, handle: &StateHandle) -> Result<()> {
        let token = DiscardToken::task_owned(handle)
            .ok_or_else(|| self.report(Error::NotTaskOwned(handle.id().to_string())))?;
        self.storage
            .discard_state(&token)
            .map_err(|e| self.report(e))?;
        debug!(handle = %handle.id(), "Task released owned state");
        Ok(())
    }

    /// Metadata of the newest retained checkpoint.
    pub fn latest_checkpoint(&self) -> Option<CheckpointMetadata> {
        self.retention.latest()
    }

    pub fn retained_checkpoints(&self) -> Vec<CheckpointId> {
        self.retention.retained_checkpoint_ids()
    }

    /// Apply the cleanup policy for a job that reached `status`.
    ///
    /// Open locations are aborted first. Returns the checkpoints that stay
    /// retained.
    pub fn shutdown(&self, status: JobStatus) -> Result<Vec<CheckpointId>> {
        let teardown = match status {
            JobStatus::Finished => true,
            JobStatus::Cancelled => {
                self.config.cleanup_policy == CleanupPolicy::DeleteOnCancellation
            }
            JobStatus::Failed | JobStatus::Suspended => false,
        };

        let open: Vec<Arc<CheckpointStorageLocation>> =
            self.locations.iter().map(|l| l.value().clone()).collect();
        for location in &open {
            let tracked = self.forget(location);
            self.release(location.dispose_with(teardown));
            if tracked {
                self.metrics.checkpoints_aborted.inc();
            }
        }

        let retained = self
            .retention
            .shutdown(status)
            .map_err(|e| self.report(e))?;

        info!(
            %status,
            aborted = open.len(),
            retained = ?retained,
            "Checkpoint storage shut down"
        );
        Ok(retained)
    }

    /// Retry failed deletions every `cleanup_interval` until `shutdown_rx`
    /// fires.
    pub async fn run_cleanup_loop(self: Arc<Self>, mut shutdown_rx: mpsc::Receiver<()>) {
        let mut interval = tokio::time::interval(self.config.cleanup_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let pending = self.retention.pending_discards();
                    if pending > 0 {
                        let completed = self.retention.retry_pending_discards();
                        debug!(pending, completed, "Cleanup pass finished");
                        if completed == 0 {
                            error!(pending, "Pending discards still failing");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Checkpoint cleanup loop shutting down");
                    break;
                }
            }
        }
    }

    /// Stop tracking `location`; false if it was not tracked.
    fn forget(&self, location: &Arc<CheckpointStorageLocation>) -> bool {
        let removed = self
            .locations
            .remove_if(&location.checkpoint_id(), |_, l| Arc::ptr_eq(l, location))
            .is_some();
        self.metrics.open_locations.set_count(self.locations.len());
        removed
    }

    fn release(&self, disposal: LocationDisposal) {
        if disposal.is_empty() {
            return;
        }
        let LocationDisposal {
            shared_candidates,
            failed,
        } = disposal;
        let deleted = self.retention.discard_unreferenced(shared_candidates);
        debug!(deleted, failed = failed.len(), "Released disposed location");
        self.retention.park_failed(failed);
    }

    fn report(&self, e: Error) -> Error {
        self.metrics.record_error(&e);
        e
    }
}

impl std::fmt::Debug for CheckpointStorageCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointStorageCoordinator")
            .field("job_id", &self.storage.job_id())
            .field("open_locations", &self.locations.len())
            .field("retained", &self.retention.retained_checkpoint_ids())
            .field("policy", &self.config.cleanup_policy)
            .finish()
    }
}
