//! Failure injection for checkpoint storage.
//!
//! [`FaultyStorage`] wraps a backend and fails selected operations while the
//! matching switch in [`StorageFaults`] is on. Locations are still created by
//! the wrapped backend, so only calls made through the wrapper (retention
//! and coordinator paths) see the injected failures.

use crate::checkpoint::{CheckpointMetadata, MetadataFileInfo};
use crate::error::{Error, Result};
use crate::handle::{DiscardToken, StateHandle};
use crate::storage::{CheckpointStorage, CheckpointStorageLocation};
use crate::types::{CheckpointId, JobId};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Switches for the operations a [`FaultyStorage`] fails.
#[derive(Debug, Default)]
pub struct StorageFaults {
    discard_state: AtomicBool,
    retire_metadata: AtomicBool,
    discard_metadata: AtomicBool,
    read_state: AtomicBool,
    injected: AtomicU64,
}

impl StorageFaults {
    pub fn fail_discard_state(&self, fail: bool) {
        self.discard_state.store(fail, Ordering::SeqCst);
    }

    pub fn fail_retire_metadata(&self, fail: bool) {
        self.retire_metadata.store(fail, Ordering::SeqCst);
    }

    pub fn fail_discard_metadata(&self, fail: bool) {
        self.discard_metadata.store(fail, Ordering::SeqCst);
    }

    pub fn fail_read_state(&self, fail: bool) {
        self.read_state.store(fail, Ordering::SeqCst);
    }

    /// Turn every switch off.
    pub fn heal(&self) {
        for switch in [
            &self.discard_state,
            &self.retire_metadata,
            &self.discard_metadata,
            &self.read_state,
        ] {
            switch.store(false, Ordering::SeqCst);
        }
    }

    /// Number of failures injected so far.
    pub fn injected(&self) -> u64 {
        self.injected.load(Ordering::Relaxed)
    }

    fn check(&self, switch: &AtomicBool, operation: &str) -> Result<()> {
        if switch.load(Ordering::SeqCst) {
            self.injected.fetch_add(1, Ordering::Relaxed);
            debug!(operation, "Injecting storage failure");
            return Err(Error::StorageUnavailable(format!(
                "injected failure in {}",
                operation
            )));
        }
        Ok(())
    }
}

/// A backend wrapper that fails operations on demand.
#[derive(Debug)]
pub struct FaultyStorage {
    inner: Arc<dyn CheckpointStorage>,
    faults: Arc<StorageFaults>,
}

impl FaultyStorage {
    pub fn new(inner: Arc<dyn CheckpointStorage>) -> Self {
        Self {
            inner,
            faults: Arc::new(StorageFaults::default()),
        }
    }

    pub fn faults(&self) -> &Arc<StorageFaults> {
        &self.faults
    }

    pub fn inner(&self) -> &Arc<dyn CheckpointStorage> {
        &self.inner
    }
}

impl CheckpointStorage for FaultyStorage {
    fn job_id(&self) -> JobId {
        self.inner.job_id()
    }

    fn create_checkpoint_location(
        &self,
        checkpoint_id: CheckpointId,
    ) -> Result<Arc<CheckpointStorageLocation>> {
        self.inner.create_checkpoint_location(checkpoint_id)
    }

    fn metadata_pointer(&self, checkpoint_id: CheckpointId) -> String {
        self.inner.metadata_pointer(checkpoint_id)
    }

    fn resolve_checkpoint_pointer(&self, pointer: &str) -> Result<CheckpointMetadata> {
        self.inner.resolve_checkpoint_pointer(pointer)
    }

    fn persist_metadata(&self, metadata: &CheckpointMetadata) -> Result<MetadataFileInfo> {
        self.inner.persist_metadata(metadata)
    }

    fn read_state(&self, handle: &StateHandle) -> Result<Bytes> {
        self.faults.check(&self.faults.read_state, "read_state")?;
        self.inner.read_state(handle)
    }

    fn discard_state(&self, token: &DiscardToken) -> Result<()> {
        self.faults.check(&self.faults.discard_state, "discard_state")?;
        self.inner.discard_state(token)
    }

    fn retire_metadata(&self, checkpoint_id: CheckpointId) -> Result<()> {
        self.faults
            .check(&self.faults.retire_metadata, "retire_metadata")?;
        self.inner.retire_metadata(checkpoint_id)
    }

    fn discard_metadata(&self, checkpoint_id: CheckpointId) -> Result<()> {
        self.faults
            .check(&self.faults.discard_metadata, "discard_metadata")?;
        self.inner.discard_metadata(checkpoint_id)
    }

    fn list_checkpoints(&self) -> Result<Vec<CheckpointId>> {
        self.inner.list_checkpoints()
    }

    fn discard_job_directories(&self) -> Result<()> {
        self.inner.discard_job_directories()
    }
}
