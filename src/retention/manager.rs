//! Retention of completed checkpoints.

use crate::checkpoint::{CheckpointMetadata, CompletedCheckpoint};
use crate::error::{Error, Result};
use crate::handle::{DiscardToken, StateHandle, StateHandleId};
use crate::metrics::StorageMetrics;
use crate::retention::registry::SharedStateRegistry;
use crate::storage::CheckpointStorage;
use crate::types::{CheckpointId, CleanupPolicy, JobStatus, StateScope};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What retention keeps for one completed checkpoint.
#[derive(Debug, Clone)]
pub struct RetentionRecord {
    checkpoint_id: CheckpointId,
    cleanup_policy: CleanupPolicy,
    /// Distinct shared handles, one reference each
    shared: Vec<StateHandle>,
    exclusive: Vec<StateHandle>,
    task_owned: Vec<StateHandle>,
    metadata: CheckpointMetadata,
}

impl RetentionRecord {
    fn new(metadata: CheckpointMetadata, cleanup_policy: CleanupPolicy) -> Self {
        let mut seen = HashSet::new();
        let mut shared = Vec::new();
        let mut exclusive = Vec::new();
        let mut task_owned = Vec::new();

        for handle in metadata.handles() {
            if !seen.insert(handle.id().clone()) {
                continue;
            }
            match handle.scope() {
                StateScope::Shared => shared.push(handle.clone()),
                StateScope::Exclusive => exclusive.push(handle.clone()),
                StateScope::TaskOwned => task_owned.push(handle.clone()),
            }
        }

        Self {
            checkpoint_id: metadata.checkpoint_id,
            cleanup_policy,
            shared,
            exclusive,
            task_owned,
            metadata,
        }
    }

    pub fn checkpoint_id(&self) -> CheckpointId {
        self.checkpoint_id
    }

    /// Policy in force when the checkpoint was registered.
    pub fn cleanup_policy(&self) -> CleanupPolicy {
        self.cleanup_policy
    }

    pub fn metadata(&self) -> &CheckpointMetadata {
        &self.metadata
    }

    pub fn shared_ids(&self) -> impl Iterator<Item = &StateHandleId> {
        self.shared.iter().map(|h| h.id())
    }

    pub fn exclusive_handles(&self) -> &[StateHandle] {
        &self.exclusive
    }

    pub fn task_owned_handles(&self) -> &[StateHandle] {
        &self.task_owned
    }
}

/// A deletion that failed and waits for the next retry.
#[derive(Debug)]
enum PendingDiscard {
    /// One handle outside of any checkpoint (orphans, aborted locations).
    State(DiscardToken),
    /// The metadata could not be retired; no reference was dropped yet.
    Record {
        record: RetentionRecord,
        include_task_owned: bool,
    },
    /// Metadata retired, some data still undeleted. The metadata is deleted
    /// once `remaining` is empty.
    Checkpoint {
        checkpoint_id: CheckpointId,
        remaining: Vec<DiscardToken>,
    },
}

/// Keeps completed checkpoints alive and deletes them once subsumed.
///
/// Shared handles are reference counted across retained checkpoints through
/// a [`SharedStateRegistry`]; they are deleted only when the last retained
/// checkpoint referencing them goes away. For every discarded checkpoint the
/// metadata is first made unresolvable, then data is deleted, then the
/// metadata itself.
#[derive(Debug)]
pub struct RetentionManager {
    storage: Arc<dyn CheckpointStorage>,

    registry: SharedStateRegistry,

    /// Retained checkpoints, oldest first
    records: RwLock<BTreeMap<CheckpointId, RetentionRecord>>,

    policy: CleanupPolicy,

    max_retained: usize,

    pending: Mutex<Vec<PendingDiscard>>,

    metrics: Arc<StorageMetrics>,
}

impl RetentionManager {
    pub fn new(
        storage: Arc<dyn CheckpointStorage>,
        policy: CleanupPolicy,
        max_retained: usize,
        metrics: Arc<StorageMetrics>,
    ) -> Self {
        Self {
            storage,
            registry: SharedStateRegistry::new(),
            records: RwLock::new(BTreeMap::new()),
            policy,
            max_retained: max_retained.max(1),
            pending: Mutex::new(Vec::new()),
            metrics,
        }
    }

    pub fn policy(&self) -> CleanupPolicy {
        self.policy
    }

    pub fn registry(&self) -> &SharedStateRegistry {
        &self.registry
    }

    /// Register a freshly completed checkpoint.
    ///
    /// Returns the ids of older checkpoints subsumed because more than
    /// `max_retained` are now retained. Handles the location wrote but the
    /// metadata does not reference are released afterwards.
    pub fn register_completed(&self, completed: CompletedCheckpoint) -> Result<Vec<CheckpointId>> {
        let CompletedCheckpoint {
            metadata, orphaned, ..
        } = completed;
        let subsumed = self.register(metadata)?;
        self.release_orphans(orphaned);
        Ok(subsumed)
    }

    /// Register a checkpoint resolved from a restore pointer as live.
    pub fn register_restored(&self, metadata: CheckpointMetadata) -> Result<Vec<CheckpointId>> {
        let checkpoint_id = metadata.checkpoint_id;
        let subsumed = self.register(metadata)?;
        info!(checkpoint_id, "Registered restored checkpoint");
        Ok(subsumed)
    }

    fn register(&self, metadata: CheckpointMetadata) -> Result<Vec<CheckpointId>> {
        let checkpoint_id = metadata.checkpoint_id;
        let record = RetentionRecord::new(metadata, self.policy);

        let subsumed: Vec<RetentionRecord> = {
            let mut records = self.records.write();
            if records.contains_key(&checkpoint_id) {
                return Err(Error::AlreadyRegistered(checkpoint_id));
            }
            for handle in &record.shared {
                let count = self.registry.register(handle, checkpoint_id);
                debug!(checkpoint_id, handle = %handle.id(), count, "Referenced shared state");
            }
            records.insert(checkpoint_id, record);

            // Only checkpoints older than the new one are made obsolete by it.
            let mut subsumed = Vec::new();
            while records.len() > self.max_retained {
                match records.first_key_value() {
                    Some((&oldest, _)) if oldest < checkpoint_id => {
                        if let Some((_, old)) = records.pop_first() {
                            subsumed.push(old);
                        }
                    }
                    _ => break,
                }
            }
            subsumed
        };

        let ids: Vec<CheckpointId> = subsumed.iter().map(|r| r.checkpoint_id).collect();
        info!(
            checkpoint_id,
            subsumed = ?ids,
            retained = self.num_retained(),
            "Registered completed checkpoint"
        );
        for record in subsumed {
            self.metrics.checkpoints_subsumed.inc();
            self.discard_record(record, false);
        }
        self.update_gauges();
        Ok(ids)
    }

    /// Subsume `checkpoint_id`; a strictly newer checkpoint must be retained.
    pub fn subsume(&self, checkpoint_id: CheckpointId) -> Result<()> {
        let record = {
            let mut records = self.records.write();
            let newest = records.last_key_value().map(|(&id, _)| id);
            if !records.contains_key(&checkpoint_id) {
                return Err(Error::UnknownCheckpoint(checkpoint_id));
            }
            if newest.map_or(true, |newest| newest <= checkpoint_id) {
                return Err(Error::NotSubsumable(checkpoint_id));
            }
            records
                .remove(&checkpoint_id)
                .ok_or(Error::UnknownCheckpoint(checkpoint_id))?
        };

        info!(checkpoint_id, "Subsuming checkpoint");
        self.metrics.checkpoints_subsumed.inc();
        self.discard_record(record, false);
        self.update_gauges();
        Ok(())
    }

    /// Delete one retained checkpoint, even the latest.
    ///
    /// Shared state still referenced by other retained checkpoints survives.
    pub fn discard_checkpoint(&self, checkpoint_id: CheckpointId) -> Result<()> {
        let record = self
            .records
            .write()
            .remove(&checkpoint_id)
            .ok_or(Error::UnknownCheckpoint(checkpoint_id))?;

        info!(checkpoint_id, "Discarding checkpoint on request");
        self.discard_record(record, false);
        self.update_gauges();
        Ok(())
    }

    /// Delete the shared handles among `candidates` that no retained
    /// checkpoint references. Returns the number deleted.
    pub fn discard_unreferenced(&self, candidates: Vec<StateHandle>) -> usize {
        let tokens: Vec<DiscardToken> = candidates
            .iter()
            .filter(|h| !self.registry.contains(h.id()))
            .filter_map(DiscardToken::coordinator_owned)
            .collect();
        let requested = tokens.len();
        let failed = self.discard_tokens(tokens);
        let deleted = requested - failed.len();
        self.park_failed(failed);
        deleted
    }

    /// Park deletions that failed elsewhere for the next retry.
    pub(crate) fn park_failed(&self, tokens: Vec<DiscardToken>) {
        if tokens.is_empty() {
            return;
        }
        self.pending
            .lock()
            .extend(tokens.into_iter().map(PendingDiscard::State));
        self.update_gauges();
    }

    /// Retry every parked deletion. Returns the number that completed.
    pub fn retry_pending_discards(&self) -> usize {
        let pending = std::mem::take(&mut *self.pending.lock());
        if pending.is_empty() {
            return 0;
        }

        let attempted = pending.len();
        let mut completed = 0;
        for item in pending {
            let done = match item {
                PendingDiscard::State(token) => {
                    let failed = self.discard_tokens(vec![token]);
                    let done = failed.is_empty();
                    self.pending
                        .lock()
                        .extend(failed.into_iter().map(PendingDiscard::State));
                    done
                }
                PendingDiscard::Record {
                    record,
                    include_task_owned,
                } => self.discard_record(record, include_task_owned),
                PendingDiscard::Checkpoint {
                    checkpoint_id,
                    remaining,
                } => {
                    let remaining = self.discard_tokens(remaining);
                    self.finish_checkpoint(checkpoint_id, remaining)
                }
            };
            if done {
                completed += 1;
            }
        }

        info!(attempted, completed, "Retried pending discards");
        self.update_gauges();
        completed
    }

    /// React to the job reaching `status`. Returns the checkpoints still
    /// retained afterwards.
    pub fn shutdown(&self, status: JobStatus) -> Result<Vec<CheckpointId>> {
        match status {
            JobStatus::Failed | JobStatus::Suspended => {
                info!(
                    %status,
                    retained = self.num_retained(),
                    "Keeping retained checkpoints for recovery"
                );
            }
            JobStatus::Cancelled if self.policy == CleanupPolicy::RetainOnCancellation => {
                // Only finish deleting what was subsumed before the cancel
                self.retry_pending_discards();
                info!(
                    %status,
                    retained = ?self.retained_checkpoint_ids(),
                    "Retained checkpoints on cancellation"
                );
            }
            JobStatus::Cancelled | JobStatus::Finished => self.teardown(status)?,
        }

        self.update_gauges();
        Ok(self.retained_checkpoint_ids())
    }

    /// Delete every retained checkpoint including task-owned state.
    fn teardown(&self, status: JobStatus) -> Result<()> {
        let records = std::mem::take(&mut *self.records.write());
        let checkpoints = records.len();
        for record in records.into_values() {
            self.discard_record(record, true);
        }

        let leftovers = self.registry.drain();
        if !leftovers.is_empty() {
            warn!(
                count = leftovers.len(),
                "Shared state still referenced after teardown, deleting"
            );
            let tokens = leftovers
                .iter()
                .filter_map(DiscardToken::coordinator_owned)
                .collect();
            let failed = self.discard_tokens(tokens);
            self.park_failed(failed);
        }

        self.retry_pending_discards();
        self.storage.discard_job_directories()?;

        info!(
            %status,
            checkpoints,
            pending = self.pending_discards(),
            "Checkpoint storage torn down"
        );
        Ok(())
    }

    /// Release the references of `record` and delete what nobody needs.
    ///
    /// Returns whether everything was deleted; failures are parked.
    fn discard_record(&self, record: RetentionRecord, include_task_owned: bool) -> bool {
        let checkpoint_id = record.checkpoint_id;

        if let Err(e) = self.storage.retire_metadata(checkpoint_id) {
            warn!(
                checkpoint_id,
                error = %e,
                "Failed to retire checkpoint metadata, parking for retry"
            );
            self.metrics.failed_discards.inc();
            self.pending.lock().push(PendingDiscard::Record {
                record,
                include_task_owned,
            });
            return false;
        }

        let mut tokens: Vec<DiscardToken> = record
            .exclusive
            .iter()
            .filter_map(DiscardToken::coordinator_owned)
            .collect();

        let mut shared_released = 0usize;
        for handle in &record.shared {
            if let Some(released) = self.registry.unregister(handle.id()) {
                shared_released += 1;
                tokens.extend(DiscardToken::coordinator_owned(&released));
            }
        }

        if include_task_owned {
            tokens.extend(record.task_owned.iter().map(DiscardToken::job_teardown));
        }

        let remaining = self.discard_tokens(tokens);
        info!(
            checkpoint_id,
            exclusive = record.exclusive.len(),
            shared_released,
            shared_kept = record.shared.len() - shared_released,
            failed = remaining.len(),
            "Discarded checkpoint"
        );
        self.finish_checkpoint(checkpoint_id, remaining)
    }

    /// Delete the metadata once no data of the checkpoint is left.
    fn finish_checkpoint(&self, checkpoint_id: CheckpointId, remaining: Vec<DiscardToken>) -> bool {
        if !remaining.is_empty() {
            self.pending.lock().push(PendingDiscard::Checkpoint {
                checkpoint_id,
                remaining,
            });
            return false;
        }

        match self.storage.discard_metadata(checkpoint_id) {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    checkpoint_id,
                    error = %e,
                    "Failed to delete checkpoint metadata, parking for retry"
                );
                self.metrics.failed_discards.inc();
                self.pending.lock().push(PendingDiscard::Checkpoint {
                    checkpoint_id,
                    remaining,
                });
                false
            }
        }
    }

    /// Delete the handles behind `tokens`; returns the ones that failed.
    fn discard_tokens(&self, tokens: Vec<DiscardToken>) -> Vec<DiscardToken> {
        let mut failed = Vec::new();
        for token in tokens {
            match self.storage.discard_state(&token) {
                Ok(()) => {
                    self.metrics.handles_discarded.inc();
                }
                Err(e) => {
                    warn!(
                        handle = %token.handle().id(),
                        scope = %token.handle().scope(),
                        error = %e,
                        "Failed to discard state, parking for retry"
                    );
                    self.metrics.failed_discards.inc();
                    failed.push(token);
                }
            }
        }
        failed
    }

    fn release_orphans(&self, orphaned: Vec<StateHandle>) {
        if orphaned.is_empty() {
            return;
        }
        let (shared, exclusive): (Vec<StateHandle>, Vec<StateHandle>) = orphaned
            .into_iter()
            .partition(|h| h.scope() == StateScope::Shared);

        let tokens = exclusive
            .iter()
            .filter_map(DiscardToken::coordinator_owned)
            .collect();
        let failed = self.discard_tokens(tokens);
        self.park_failed(failed);

        let deleted = self.discard_unreferenced(shared);
        debug!(exclusive = exclusive.len(), shared_deleted = deleted, "Released orphaned state");
    }

    fn update_gauges(&self) {
        self.metrics.retained_checkpoints.set_count(self.num_retained());
        self.metrics.shared_handles.set_count(self.registry.len());
        self.metrics.pending_discards.set_count(self.pending_discards());
    }

    pub fn latest_checkpoint_id(&self) -> Option<CheckpointId> {
        self.records.read().last_key_value().map(|(&id, _)| id)
    }

    /// Metadata of the newest retained checkpoint.
    pub fn latest(&self) -> Option<CheckpointMetadata> {
        self.records
            .read()
            .last_key_value()
            .map(|(_, r)| r.metadata.clone())
    }

    /// Copy of the record of one retained checkpoint.
    pub fn record(&self, checkpoint_id: CheckpointId) -> Option<RetentionRecord> {
        self.records.read().get(&checkpoint_id).cloned()
    }

    /// Retained checkpoint ids, oldest first.
    pub fn retained_checkpoint_ids(&self) -> Vec<CheckpointId> {
        self.records.read().keys().copied().collect()
    }

    pub fn num_retained(&self) -> usize {
        self.records.read().len()
    }

    /// Number of parked deletions.
    pub fn pending_discards(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FsBackendConfig, MemoryBackendConfig};
    use crate::storage::{FsCheckpointStorage, MemoryCheckpointStorage};
    use crate::testing::{complete_checkpoint, write_state, FaultyStorage};
    use crate::types::JobId;
    use bytes::Bytes;
    use tempfile::tempdir;

    fn fs_storage(base: &std::path::Path) -> Arc<dyn CheckpointStorage> {
        let config = FsBackendConfig::new(base).with_file_size_threshold(0);
        Arc::new(FsCheckpointStorage::new(JobId::new(), config).unwrap())
    }

    fn manager(storage: Arc<dyn CheckpointStorage>, max_retained: usize) -> RetentionManager {
        RetentionManager::new(
            storage,
            CleanupPolicy::DeleteOnCancellation,
            max_retained,
            Arc::new(StorageMetrics::new()),
        )
    }

    #[test]
    fn test_record_deduplicates_handles() {
        let shared = StateHandle::inline(StateScope::Shared, Bytes::from_static(b"sst"));
        let exclusive = StateHandle::inline(StateScope::Exclusive, Bytes::from_static(b"x"));
        let mut metadata = CheckpointMetadata {
            checkpoint_id: 1,
            timestamp: 0,
            operator_states: BTreeMap::new(),
            external_pointer: String::new(),
        };
        metadata
            .operator_states
            .insert("a".into(), vec![shared.clone(), exclusive.clone()]);
        metadata.operator_states.insert("b".into(), vec![shared.clone()]);

        let record = RetentionRecord::new(metadata, CleanupPolicy::default());
        assert_eq!(record.shared_ids().count(), 1);
        assert_eq!(record.exclusive_handles(), &[exclusive]);
        assert!(record.task_owned_handles().is_empty());
    }

    #[test]
    fn test_automatic_subsumption() {
        let dir = tempdir().unwrap();
        let storage = fs_storage(dir.path());
        let retention = manager(storage.clone(), 2);

        let mut exclusives = Vec::new();
        for id in 1..=3 {
            let location = storage.create_checkpoint_location(id).unwrap();
            let handle = write_state(&location, StateScope::Exclusive, b"window state");
            exclusives.push(handle.clone());
            let completed = complete_checkpoint(&location, vec![handle]);
            let subsumed = retention.register_completed(completed).unwrap();
            if id == 3 {
                assert_eq!(subsumed, vec![1]);
            } else {
                assert!(subsumed.is_empty());
            }
        }

        assert_eq!(retention.retained_checkpoint_ids(), vec![2, 3]);
        assert!(!exclusives[0].file_path().unwrap().exists());
        assert!(exclusives[1].file_path().unwrap().exists());
        assert_eq!(storage.list_checkpoints().unwrap(), vec![2, 3]);
    }

    #[test]
    fn test_late_completion_does_not_subsume_newer() {
        let storage: Arc<dyn CheckpointStorage> = Arc::new(MemoryCheckpointStorage::new(
            JobId::new(),
            MemoryBackendConfig::default(),
        ));
        let retention = manager(storage.clone(), 1);

        let late = storage.create_checkpoint_location(4).unwrap();
        let newer = storage.create_checkpoint_location(5).unwrap();
        retention
            .register_completed(complete_checkpoint(&newer, vec![]))
            .unwrap();
        let subsumed = retention
            .register_completed(complete_checkpoint(&late, vec![]))
            .unwrap();

        assert!(subsumed.is_empty());
        assert_eq!(retention.retained_checkpoint_ids(), vec![4, 5]);
        assert_eq!(retention.latest_checkpoint_id(), Some(5));
    }

    #[test]
    fn test_subsume_requires_newer_checkpoint() {
        let storage: Arc<dyn CheckpointStorage> = Arc::new(MemoryCheckpointStorage::new(
            JobId::new(),
            MemoryBackendConfig::default(),
        ));
        let retention = manager(storage.clone(), 5);

        let location = storage.create_checkpoint_location(1).unwrap();
        retention
            .register_completed(complete_checkpoint(&location, vec![]))
            .unwrap();

        assert!(matches!(retention.subsume(1), Err(Error::NotSubsumable(1))));
        assert!(matches!(retention.subsume(9), Err(Error::UnknownCheckpoint(9))));

        let location = storage.create_checkpoint_location(2).unwrap();
        retention
            .register_completed(complete_checkpoint(&location, vec![]))
            .unwrap();
        retention.subsume(1).unwrap();
        assert_eq!(retention.retained_checkpoint_ids(), vec![2]);
    }

    #[test]
    fn test_register_twice_fails() {
        let storage: Arc<dyn CheckpointStorage> = Arc::new(MemoryCheckpointStorage::new(
            JobId::new(),
            MemoryBackendConfig::default(),
        ));
        let retention = manager(storage.clone(), 1);
        let location = storage.create_checkpoint_location(1).unwrap();
        let completed = complete_checkpoint(&location, vec![]);

        retention
            .register_restored(completed.metadata.clone())
            .unwrap();
        assert!(matches!(
            retention.register_completed(completed),
            Err(Error::AlreadyRegistered(1))
        ));
    }

    #[test]
    fn test_discard_latest_keeps_shared_state_of_others() {
        let dir = tempdir().unwrap();
        let storage = fs_storage(dir.path());
        let retention = manager(storage.clone(), 3);

        let first = storage.create_checkpoint_location(1).unwrap();
        let shared = write_state(&first, StateScope::Shared, b"sst-0001");
        retention
            .register_completed(complete_checkpoint(&first, vec![shared.clone()]))
            .unwrap();

        let second = storage.create_checkpoint_location(2).unwrap();
        retention
            .register_completed(complete_checkpoint(&second, vec![shared.clone()]))
            .unwrap();
        assert_eq!(retention.registry().ref_count(shared.id()), 2);

        retention.discard_checkpoint(2).unwrap();
        assert!(shared.file_path().unwrap().exists());
        assert_eq!(retention.registry().ref_count(shared.id()), 1);

        retention.discard_checkpoint(1).unwrap();
        assert!(!shared.file_path().unwrap().exists());
        assert!(retention.registry().is_empty());
    }

    #[test]
    fn test_orphans_are_released_unless_referenced() {
        let dir = tempdir().unwrap();
        let storage = fs_storage(dir.path());
        let retention = manager(storage.clone(), 2);

        let first = storage.create_checkpoint_location(1).unwrap();
        let kept = write_state(&first, StateScope::Shared, b"kept");
        retention
            .register_completed(complete_checkpoint(&first, vec![kept.clone()]))
            .unwrap();

        // A task of checkpoint 2 writes state that never gets acknowledged.
        let second = storage.create_checkpoint_location(2).unwrap();
        let unacked_shared = write_state(&second, StateScope::Shared, b"unacked");
        let unacked_exclusive = write_state(&second, StateScope::Exclusive, b"unacked");
        retention
            .register_completed(complete_checkpoint(&second, vec![kept.clone()]))
            .unwrap();

        assert!(kept.file_path().unwrap().exists());
        assert!(!unacked_shared.file_path().unwrap().exists());
        assert!(!unacked_exclusive.file_path().unwrap().exists());
    }

    #[test]
    fn test_failed_deletions_are_retried() {
        let dir = tempdir().unwrap();
        let faulty = Arc::new(FaultyStorage::new(fs_storage(dir.path())));
        let storage: Arc<dyn CheckpointStorage> = faulty.clone();
        let retention = manager(storage.clone(), 1);

        let first = storage.create_checkpoint_location(1).unwrap();
        let exclusive = write_state(&first, StateScope::Exclusive, b"old");
        retention
            .register_completed(complete_checkpoint(&first, vec![exclusive.clone()]))
            .unwrap();

        faulty.faults().fail_discard_state(true);
        let second = storage.create_checkpoint_location(2).unwrap();
        retention
            .register_completed(complete_checkpoint(&second, vec![]))
            .unwrap();

        assert_eq!(retention.pending_discards(), 1);
        assert!(exclusive.file_path().unwrap().exists());
        // Retired before any data was touched.
        assert_eq!(storage.list_checkpoints().unwrap(), vec![2]);
        assert_eq!(retention.retry_pending_discards(), 0);

        faulty.faults().fail_discard_state(false);
        assert_eq!(retention.retry_pending_discards(), 1);
        assert_eq!(retention.pending_discards(), 0);
        assert!(!exclusive.file_path().unwrap().exists());
        assert!(!dir.path().join(storage.job_id().to_string()).join("chk-1").exists());
    }

    #[test]
    fn test_failed_retire_keeps_references() {
        let storage: Arc<dyn CheckpointStorage> = Arc::new(MemoryCheckpointStorage::new(
            JobId::new(),
            MemoryBackendConfig::default(),
        ));
        let faulty = Arc::new(FaultyStorage::new(storage));
        let storage: Arc<dyn CheckpointStorage> = faulty.clone();
        let retention = manager(storage.clone(), 1);

        let first = storage.create_checkpoint_location(1).unwrap();
        let shared = write_state(&first, StateScope::Shared, b"sst");
        retention
            .register_completed(complete_checkpoint(&first, vec![shared.clone()]))
            .unwrap();

        faulty.faults().fail_retire_metadata(true);
        let second = storage.create_checkpoint_location(2).unwrap();
        retention
            .register_completed(complete_checkpoint(&second, vec![]))
            .unwrap();
        assert_eq!(retention.registry().ref_count(shared.id()), 1);
        assert_eq!(retention.pending_discards(), 1);

        faulty.faults().fail_retire_metadata(false);
        assert_eq!(retention.retry_pending_discards(), 1);
        assert!(retention.registry().is_empty());
        assert_eq!(storage.list_checkpoints().unwrap(), vec![2]);
    }

    #[test]
    fn test_shutdown_failed_keeps_everything() {
        let dir = tempdir().unwrap();
        let storage = fs_storage(dir.path());
        let retention = manager(storage.clone(), 2);

        for id in 1..=2 {
            let location = storage.create_checkpoint_location(id).unwrap();
            let handle = write_state(&location, StateScope::Shared, b"sst");
            retention
                .register_completed(complete_checkpoint(&location, vec![handle]))
                .unwrap();
        }

        assert_eq!(retention.shutdown(JobStatus::Failed).unwrap(), vec![1, 2]);
        assert_eq!(retention.shutdown(JobStatus::Suspended).unwrap(), vec![1, 2]);
        assert_eq!(storage.list_checkpoints().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_shutdown_finished_tears_down() {
        let dir = tempdir().unwrap();
        let storage = fs_storage(dir.path());
        let retention = manager(storage.clone(), 1);

        let location = storage.create_checkpoint_location(1).unwrap();
        let owned = write_state(&location, StateScope::TaskOwned, b"offsets");
        let shared = write_state(&location, StateScope::Shared, b"sst");
        retention
            .register_completed(complete_checkpoint(&location, vec![owned.clone(), shared]))
            .unwrap();

        assert!(retention.shutdown(JobStatus::Finished).unwrap().is_empty());
        assert!(!owned.file_path().unwrap().exists());
        assert!(!dir.path().join(storage.job_id().to_string()).exists());
    }
}
