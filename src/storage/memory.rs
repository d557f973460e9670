//! In-process checkpoint storage.
//!
//! State bytes are inlined into their handles and travel to the coordinator
//! with the acknowledgement; metadata is kept in a map keyed by checkpoint
//! id. Nothing survives the process, so this backend suits tests and small
//! jobs only.

use crate::checkpoint::{CheckpointMetadata, MetadataFileInfo, MetadataReader, MetadataWriter};
use crate::config::MemoryBackendConfig;
use crate::error::{Error, Result};
use crate::handle::{DiscardToken, StateHandle};
use crate::storage::budget::MemoryBudget;
use crate::storage::location::{CheckpointStorageLocation, StreamTarget};
use crate::storage::{read_handle_bytes, remove_file_if_exists, CheckpointStorage, LiveLocations};
use crate::types::{CheckpointId, JobId};
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};

const POINTER_SCHEME: &str = "memory://";

/// Checkpoint storage that keeps everything in memory.
#[derive(Debug, Clone)]
pub struct MemoryCheckpointStorage {
    inner: Arc<MemoryInner>,
}

#[derive(Debug)]
struct MemoryInner {
    job_id: JobId,
    config: MemoryBackendConfig,

    /// Encoded metadata of completed checkpoints
    metadata: DashMap<CheckpointId, Bytes>,

    /// Metadata taken out of resolution while its checkpoint is discarded
    retired: DashMap<CheckpointId, Bytes>,

    live: LiveLocations,

    /// Bytes held by inline handles of all locations
    memory_budget: Option<Arc<MemoryBudget>>,
}

impl MemoryCheckpointStorage {
    /// Create a memory backend for `job_id`.
    pub fn new(job_id: JobId, config: MemoryBackendConfig) -> Self {
        let memory_budget = config
            .total_memory_budget
            .map(|limit| Arc::new(MemoryBudget::new(limit)));

        info!(
            %job_id,
            per_state_max = config.per_state_max_bytes,
            aggregate_max = config.aggregate_max_bytes,
            budget = ?config.total_memory_budget,
            "Created memory checkpoint storage"
        );

        Self {
            inner: Arc::new(MemoryInner {
                job_id,
                config,
                metadata: DashMap::new(),
                retired: DashMap::new(),
                live: LiveLocations::default(),
                memory_budget,
            }),
        }
    }

    /// Bytes currently held against the backend memory budget.
    pub fn memory_used(&self) -> u64 {
        self.inner.memory_budget.as_ref().map_or(0, |b| b.used())
    }

    /// Parse `memory://<job>/chk-<id>`; `None` if the pointer is not ours.
    fn parse_pointer(&self, pointer: &str) -> Option<CheckpointId> {
        let rest = pointer.strip_prefix(POINTER_SCHEME)?;
        let (job, checkpoint) = rest.split_once('/')?;
        if job != self.inner.job_id.to_string() {
            return None;
        }
        checkpoint.strip_prefix("chk-")?.parse().ok()
    }
}

impl CheckpointStorage for MemoryCheckpointStorage {
    fn job_id(&self) -> JobId {
        self.inner.job_id
    }

    fn create_checkpoint_location(
        &self,
        checkpoint_id: CheckpointId,
    ) -> Result<Arc<CheckpointStorageLocation>> {
        if let Some(budget) = &self.inner.memory_budget {
            if budget.is_exhausted() {
                return Err(Error::StorageUnavailable(format!(
                    "memory budget of {} bytes exhausted",
                    budget.limit()
                )));
            }
        }
        if self.inner.metadata.contains_key(&checkpoint_id) {
            return Err(Error::LocationExists(checkpoint_id));
        }
        let claim = self
            .inner
            .live
            .claim(checkpoint_id)
            .ok_or(Error::LocationExists(checkpoint_id))?;

        let config = &self.inner.config;
        let target = StreamTarget::Memory {
            per_state_max: config.per_state_max_bytes,
            max_frame_size: config.max_frame_size,
            memory_budget: self.inner.memory_budget.clone(),
        };

        debug!(checkpoint_id, "Created memory checkpoint location");
        Ok(CheckpointStorageLocation::new(
            checkpoint_id,
            Arc::new(self.clone()),
            target,
            config.aggregate_max_bytes,
            claim,
        ))
    }

    fn metadata_pointer(&self, checkpoint_id: CheckpointId) -> String {
        format!("{}{}/chk-{}", POINTER_SCHEME, self.inner.job_id, checkpoint_id)
    }

    fn resolve_checkpoint_pointer(&self, pointer: &str) -> Result<CheckpointMetadata> {
        let checkpoint_id = self
            .parse_pointer(pointer)
            .ok_or_else(|| Error::NotFound(pointer.to_string()))?;
        let bytes = self
            .inner
            .metadata
            .get(&checkpoint_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::NotFound(pointer.to_string()))?;

        let mut reader =
            MetadataReader::from_bytes(&bytes).map_err(|e| e.into_storage_error(pointer))?;
        if reader.header().checkpoint_id != checkpoint_id {
            return Err(Error::CorruptMetadata {
                pointer: pointer.to_string(),
                reason: format!(
                    "metadata belongs to checkpoint {}",
                    reader.header().checkpoint_id
                ),
            });
        }
        CheckpointMetadata::read_from(&mut reader, pointer.to_string())
            .map_err(|e| e.into_storage_error(pointer))
    }

    fn persist_metadata(&self, metadata: &CheckpointMetadata) -> Result<MetadataFileInfo> {
        let pointer = &metadata.external_pointer;
        let mut writer = MetadataWriter::in_memory(
            metadata.checkpoint_id,
            metadata.timestamp,
            self.inner.config.compress_metadata,
        )
        .map_err(|e| e.into_storage_error(pointer))?;
        metadata
            .write_to(&mut writer)
            .map_err(|e| e.into_storage_error(pointer))?;
        let (bytes, info) = writer
            .into_bytes()
            .map_err(|e| e.into_storage_error(pointer))?;

        self.inner
            .metadata
            .insert(metadata.checkpoint_id, Bytes::from(bytes));
        Ok(info)
    }

    fn read_state(&self, handle: &StateHandle) -> Result<Bytes> {
        read_handle_bytes(handle)
    }

    fn discard_state(&self, token: &DiscardToken) -> Result<()> {
        let handle = token.handle();
        if let Some(path) = handle.file_path() {
            remove_file_if_exists(path)?;
        } else if let Some(budget) = &self.inner.memory_budget {
            budget.release_handle(handle.id());
        }
        debug!(handle = %handle.id(), scope = %handle.scope(), "Discarded state");
        Ok(())
    }

    fn retire_metadata(&self, checkpoint_id: CheckpointId) -> Result<()> {
        if let Some((id, bytes)) = self.inner.metadata.remove(&checkpoint_id) {
            self.inner.retired.insert(id, bytes);
        }
        Ok(())
    }

    fn discard_metadata(&self, checkpoint_id: CheckpointId) -> Result<()> {
        self.inner.retired.remove(&checkpoint_id);
        self.inner.metadata.remove(&checkpoint_id);
        Ok(())
    }

    fn list_checkpoints(&self) -> Result<Vec<CheckpointId>> {
        let mut ids: Vec<CheckpointId> = self.inner.metadata.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn discard_job_directories(&self) -> Result<()> {
        self.inner.retired.clear();
        Ok(())
    }
}
