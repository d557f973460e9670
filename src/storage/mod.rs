//! Checkpoint storage backends.
//!
//! A backend hands out one [`CheckpointStorageLocation`] per checkpoint,
//! persists the metadata a location is finalized into, resolves restore
//! pointers and physically deletes state when retention releases it.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 dyn CheckpointStorage                        │
//! │  ┌──────────────────────┐     ┌──────────────────────────┐  │
//! │  │ MemoryCheckpoint-    │     │ FsCheckpointStorage      │  │
//! │  │ Storage (inline)     │     │ {base}/{job}/chk-<id>/   │  │
//! │  └──────────┬───────────┘     └────────────┬─────────────┘  │
//! │             └──────────────┬───────────────┘                │
//! │                            ▼                                 │
//! │              CheckpointStorageLocation                       │
//! │        (one per checkpoint id, Open → Finalized)            │
//! │                            │ open_output_stream              │
//! │                            ▼                                 │
//! │              CheckpointStateOutputStream                     │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod budget;
mod fs;
mod location;
mod memory;
mod stream;

pub use budget::{InlineBudget, MemoryBudget};
pub use fs::{FsCheckpointStorage, METADATA_FILE_NAME};
pub use location::{CheckpointStorageLocation, LocationDirs, LocationDisposal};
pub use memory::MemoryCheckpointStorage;
pub use stream::CheckpointStateOutputStream;

use crate::checkpoint::{checksum, CheckpointMetadata, MetadataFileInfo};
use crate::error::{Error, Result};
use crate::handle::{DiscardToken, StateHandle, StateLocator};
use crate::types::{CheckpointId, JobId};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// A checkpoint storage backend.
pub trait CheckpointStorage: Send + Sync + fmt::Debug {
    /// Job whose checkpoints this backend stores.
    fn job_id(&self) -> JobId;

    /// Create the location tasks write the state of `checkpoint_id` into.
    ///
    /// Fails with `LocationExists` while another location for the id is
    /// open or after its metadata was persisted.
    fn create_checkpoint_location(
        &self,
        checkpoint_id: CheckpointId,
    ) -> Result<Arc<CheckpointStorageLocation>>;

    /// External pointer under which the metadata of `checkpoint_id` lives.
    fn metadata_pointer(&self, checkpoint_id: CheckpointId) -> String;

    /// Resolve an external pointer back into checkpoint metadata.
    fn resolve_checkpoint_pointer(&self, pointer: &str) -> Result<CheckpointMetadata>;

    /// Durably write checkpoint metadata.
    fn persist_metadata(&self, metadata: &CheckpointMetadata) -> Result<MetadataFileInfo>;

    /// Read the payload behind a handle.
    fn read_state(&self, handle: &StateHandle) -> Result<Bytes>;

    /// Physically delete the bytes behind a handle.
    ///
    /// Deleting something already gone succeeds.
    fn discard_state(&self, token: &DiscardToken) -> Result<()>;

    /// Make the metadata of a checkpoint unresolvable without deleting it.
    ///
    /// Called before any data of the checkpoint is deleted so a racing
    /// restore sees `NotFound` instead of dangling handles.
    fn retire_metadata(&self, checkpoint_id: CheckpointId) -> Result<()>;

    /// Delete the (retired) metadata and the checkpoint directory.
    fn discard_metadata(&self, checkpoint_id: CheckpointId) -> Result<()>;

    /// Checkpoints whose metadata is currently resolvable, ascending.
    fn list_checkpoints(&self) -> Result<Vec<CheckpointId>>;

    /// Remove the job-level directories after a full teardown.
    fn discard_job_directories(&self) -> Result<()>;
}

/// Set of checkpoint ids with an open location.
#[derive(Debug, Clone, Default)]
pub(crate) struct LiveLocations {
    ids: Arc<Mutex<HashSet<CheckpointId>>>,
}

impl LiveLocations {
    /// Claim `checkpoint_id`; `None` if it is already claimed.
    pub(crate) fn claim(&self, checkpoint_id: CheckpointId) -> Option<LocationClaim> {
        if !self.ids.lock().insert(checkpoint_id) {
            return None;
        }
        Some(LocationClaim {
            ids: self.ids.clone(),
            checkpoint_id,
        })
    }

    pub(crate) fn contains(&self, checkpoint_id: CheckpointId) -> bool {
        self.ids.lock().contains(&checkpoint_id)
    }
}

/// Exclusive claim on a checkpoint id, released on drop.
#[derive(Debug)]
pub(crate) struct LocationClaim {
    ids: Arc<Mutex<HashSet<CheckpointId>>>,
    checkpoint_id: CheckpointId,
}

impl Drop for LocationClaim {
    fn drop(&mut self) {
        self.ids.lock().remove(&self.checkpoint_id);
    }
}

/// Remove a file, treating an already missing file as success.
pub(crate) fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "Removed file");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Read and verify the payload behind a handle.
pub(crate) fn read_handle_bytes(handle: &StateHandle) -> Result<Bytes> {
    let bytes = match handle.locator() {
        StateLocator::Inline => handle
            .inline_bytes()
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("inline payload of {}", handle.id())))?,
        StateLocator::File {
            path,
            offset,
            length,
        } => {
            let mut file = File::open(path).map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => Error::NotFound(path.display().to_string()),
                _ => Error::Io(e),
            })?;
            let available = file.metadata()?.len().saturating_sub(*offset);
            file.seek(SeekFrom::Start(*offset))?;

            let mut buf = Vec::with_capacity((*length).min(available) as usize);
            file.take(*length).read_to_end(&mut buf)?;
            if buf.len() as u64 != *length {
                return Err(Error::CorruptState {
                    handle: handle.id().to_string(),
                    reason: format!("expected {} bytes, found {}", length, buf.len()),
                });
            }
            Bytes::from(buf)
        }
    };

    if let Some(expected) = handle.checksum() {
        let actual = checksum(&bytes);
        if actual != expected {
            return Err(Error::CorruptState {
                handle: handle.id().to_string(),
                reason: format!("checksum mismatch: expected {}, got {}", expected, actual),
            });
        }
    }

    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StateScope;
    use tempfile::tempdir;

    #[test]
    fn test_claims_are_exclusive_until_dropped() {
        let live = LiveLocations::default();

        let claim = live.claim(1).unwrap();
        assert!(live.claim(1).is_none());
        assert!(live.contains(1));
        assert!(live.claim(2).is_some());

        drop(claim);
        assert!(!live.contains(1));
        assert!(live.claim(1).is_some());
    }

    #[test]
    fn test_read_file_range() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state");
        std::fs::write(&path, b"headerPAYLOADtrailer").unwrap();

        let handle = StateHandle::file_range(
            StateScope::Exclusive,
            path,
            6,
            7,
            Some(checksum(b"PAYLOAD")),
        );
        assert_eq!(read_handle_bytes(&handle).unwrap().as_ref(), b"PAYLOAD");
    }

    #[test]
    fn test_read_detects_bad_checksum() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state");
        std::fs::write(&path, b"payload").unwrap();

        let handle = StateHandle::file(StateScope::Shared, path, 7, Some(42));
        assert!(matches!(
            read_handle_bytes(&handle),
            Err(Error::CorruptState { .. })
        ));
    }

    #[test]
    fn test_read_missing_file() {
        let dir = tempdir().unwrap();
        let handle = StateHandle::file(StateScope::Shared, dir.path().join("gone"), 7, None);
        assert!(matches!(read_handle_bytes(&handle), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_remove_missing_file_is_ok() {
        let dir = tempdir().unwrap();
        remove_file_if_exists(&dir.path().join("gone")).unwrap();
    }
}
