//! Durable checkpoint storage on a (possibly shared) filesystem.
//!
//! # Layout
//!
//! ```text
//! {base}/{job}/
//!   shared/<uuid>          state referenced by several checkpoints
//!   taskowned/<uuid>       state owned by the writing task
//!   chk-<id>/<uuid>        exclusive state of one checkpoint
//!   chk-<id>/_metadata     the file a restore pointer names
//! ```
//!
//! Metadata is written to `_metadata.tmp`, synced, then renamed into place,
//! so a `_metadata` file is either complete or absent.

use crate::checkpoint::{CheckpointMetadata, MetadataFileInfo, MetadataReader, MetadataWriter};
use crate::config::FsBackendConfig;
use crate::error::{Error, Result};
use crate::handle::{DiscardToken, StateHandle};
use crate::storage::location::{CheckpointStorageLocation, LocationDirs, StreamTarget};
use crate::storage::{read_handle_bytes, remove_file_if_exists, CheckpointStorage, LiveLocations};
use crate::types::{CheckpointId, JobId};
use bytes::Bytes;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Name of the metadata file inside a checkpoint directory.
pub const METADATA_FILE_NAME: &str = "_metadata";

const METADATA_TMP_FILE_NAME: &str = "_metadata.tmp";
const METADATA_RETIRED_FILE_NAME: &str = "_metadata.discarding";
const CHECKPOINT_DIR_PREFIX: &str = "chk-";
const SHARED_DIR: &str = "shared";
const TASK_OWNED_DIR: &str = "taskowned";

/// Checkpoint storage writing state and metadata as files.
#[derive(Debug, Clone)]
pub struct FsCheckpointStorage {
    inner: Arc<FsInner>,
}

#[derive(Debug)]
struct FsInner {
    job_id: JobId,
    config: FsBackendConfig,
    job_dir: PathBuf,
    shared_dir: PathBuf,
    task_owned_dir: PathBuf,
    live: LiveLocations,
}

impl FsCheckpointStorage {
    /// Create the backend and its job-level directories.
    pub fn new(job_id: JobId, config: FsBackendConfig) -> Result<Self> {
        let job_dir = config.base_path.join(job_id.to_string());
        let shared_dir = job_dir.join(SHARED_DIR);
        let task_owned_dir = job_dir.join(TASK_OWNED_DIR);

        for dir in [&shared_dir, &task_owned_dir] {
            fs::create_dir_all(dir).map_err(|e| {
                Error::StorageUnavailable(format!("cannot create {}: {}", dir.display(), e))
            })?;
        }

        Self::cleanup_temp_files(&job_dir)?;

        info!(
            %job_id,
            path = %job_dir.display(),
            threshold = config.file_size_threshold,
            "Created filesystem checkpoint storage"
        );

        Ok(Self {
            inner: Arc::new(FsInner {
                job_id,
                config,
                job_dir,
                shared_dir,
                task_owned_dir,
                live: LiveLocations::default(),
            }),
        })
    }

    /// Remove metadata temp files left by an interrupted finalize.
    fn cleanup_temp_files(job_dir: &Path) -> Result<()> {
        for (_, dir) in Self::scan_checkpoint_dirs(job_dir)? {
            let tmp = dir.join(METADATA_TMP_FILE_NAME);
            if tmp.is_file() {
                debug!(path = %tmp.display(), "Removing orphaned temp file");
                if let Err(e) = fs::remove_file(&tmp) {
                    warn!(path = %tmp.display(), error = %e, "Failed to remove temp file");
                }
            }
        }
        Ok(())
    }

    /// All `chk-<id>` directories under `job_dir`.
    fn scan_checkpoint_dirs(job_dir: &Path) -> Result<Vec<(CheckpointId, PathBuf)>> {
        let mut dirs = Vec::new();

        for entry in fs::read_dir(job_dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }

            let checkpoint_id = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix(CHECKPOINT_DIR_PREFIX))
                .and_then(|n| n.parse::<CheckpointId>().ok());
            if let Some(checkpoint_id) = checkpoint_id {
                dirs.push((checkpoint_id, path));
            }
        }

        dirs.sort_by_key(|(id, _)| *id);
        Ok(dirs)
    }

    /// `{base}/{job}`
    pub fn job_dir(&self) -> &Path {
        &self.inner.job_dir
    }

    /// `{base}/{job}/shared`
    pub fn shared_dir(&self) -> &Path {
        &self.inner.shared_dir
    }

    /// `{base}/{job}/taskowned`
    pub fn task_owned_dir(&self) -> &Path {
        &self.inner.task_owned_dir
    }

    /// `{base}/{job}/chk-<id>`
    pub fn checkpoint_dir(&self, checkpoint_id: CheckpointId) -> PathBuf {
        self.inner
            .job_dir
            .join(format!("{}{}", CHECKPOINT_DIR_PREFIX, checkpoint_id))
    }

    fn metadata_path(&self, checkpoint_id: CheckpointId) -> PathBuf {
        self.checkpoint_dir(checkpoint_id).join(METADATA_FILE_NAME)
    }
}

impl CheckpointStorage for FsCheckpointStorage {
    fn job_id(&self) -> JobId {
        self.inner.job_id
    }

    fn create_checkpoint_location(
        &self,
        checkpoint_id: CheckpointId,
    ) -> Result<Arc<CheckpointStorageLocation>> {
        if self.metadata_path(checkpoint_id).exists() {
            return Err(Error::LocationExists(checkpoint_id));
        }
        let claim = self
            .inner
            .live
            .claim(checkpoint_id)
            .ok_or(Error::LocationExists(checkpoint_id))?;

        let exclusive = self.checkpoint_dir(checkpoint_id);
        fs::create_dir_all(&exclusive).map_err(|e| {
            Error::StorageUnavailable(format!("cannot create {}: {}", exclusive.display(), e))
        })?;

        let config = &self.inner.config;
        let target = StreamTarget::File {
            dirs: LocationDirs {
                base: self.inner.job_dir.clone(),
                exclusive,
                shared: self.inner.shared_dir.clone(),
                task_owned: self.inner.task_owned_dir.clone(),
            },
            file_size_threshold: config.file_size_threshold,
            write_buffer_size: config.effective_write_buffer_size(),
        };

        debug!(checkpoint_id, "Created filesystem checkpoint location");
        Ok(CheckpointStorageLocation::new(
            checkpoint_id,
            Arc::new(self.clone()),
            target,
            config.aggregate_max_bytes,
            claim,
        ))
    }

    fn metadata_pointer(&self, checkpoint_id: CheckpointId) -> String {
        self.metadata_path(checkpoint_id).display().to_string()
    }

    fn resolve_checkpoint_pointer(&self, pointer: &str) -> Result<CheckpointMetadata> {
        let mut path = PathBuf::from(pointer);
        if path.is_dir() {
            path.push(METADATA_FILE_NAME);
        }

        let mut reader = MetadataReader::open(&path).map_err(|e| e.into_storage_error(pointer))?;
        let dir_id = path
            .parent()
            .and_then(|dir| dir.file_name())
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix(CHECKPOINT_DIR_PREFIX))
            .and_then(|n| n.parse::<CheckpointId>().ok());
        if let Some(dir_id) = dir_id {
            if reader.header().checkpoint_id != dir_id {
                return Err(Error::CorruptMetadata {
                    pointer: pointer.to_string(),
                    reason: format!(
                        "metadata of checkpoint {} found in {}{}",
                        reader.header().checkpoint_id,
                        CHECKPOINT_DIR_PREFIX,
                        dir_id
                    ),
                });
            }
        }
        CheckpointMetadata::read_from(&mut reader, path.display().to_string())
            .map_err(|e| e.into_storage_error(pointer))
    }

    fn persist_metadata(&self, metadata: &CheckpointMetadata) -> Result<MetadataFileInfo> {
        let dir = self.checkpoint_dir(metadata.checkpoint_id);
        let tmp = dir.join(METADATA_TMP_FILE_NAME);
        let path = dir.join(METADATA_FILE_NAME);

        let written = MetadataWriter::create(
            &tmp,
            metadata.checkpoint_id,
            metadata.timestamp,
            self.inner.config.compress_metadata,
        )
        .and_then(|mut writer| {
            metadata.write_to(&mut writer)?;
            writer.finalize_file()
        });

        let info = match written {
            Ok(info) => info,
            Err(e) => {
                remove_temp_file(&tmp);
                return Err(Error::StorageUnavailable(format!(
                    "cannot write {}: {}",
                    tmp.display(),
                    e
                )));
            }
        };

        // Atomic rename: a _metadata file is never partial
        fs::rename(&tmp, &path).map_err(|e| {
            remove_temp_file(&tmp);
            Error::StorageUnavailable(format!("cannot rename {}: {}", tmp.display(), e))
        })?;

        debug!(
            checkpoint_id = metadata.checkpoint_id,
            path = %path.display(),
            file_size = info.file_size,
            "Persisted checkpoint metadata"
        );
        Ok(info)
    }

    fn read_state(&self, handle: &StateHandle) -> Result<Bytes> {
        read_handle_bytes(handle)
    }

    fn discard_state(&self, token: &DiscardToken) -> Result<()> {
        let handle = token.handle();
        if let Some(path) = handle.file_path() {
            remove_file_if_exists(path)?;
        }
        debug!(handle = %handle.id(), scope = %handle.scope(), "Discarded state");
        Ok(())
    }

    fn retire_metadata(&self, checkpoint_id: CheckpointId) -> Result<()> {
        let dir = self.checkpoint_dir(checkpoint_id);
        match fs::rename(
            dir.join(METADATA_FILE_NAME),
            dir.join(METADATA_RETIRED_FILE_NAME),
        ) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn discard_metadata(&self, checkpoint_id: CheckpointId) -> Result<()> {
        let dir = self.checkpoint_dir(checkpoint_id);
        remove_file_if_exists(&dir.join(METADATA_RETIRED_FILE_NAME))?;
        remove_file_if_exists(&dir.join(METADATA_FILE_NAME))?;

        match fs::remove_dir(&dir) {
            Ok(()) => debug!(path = %dir.display(), "Removed checkpoint directory"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %dir.display(), error = %e, "Checkpoint directory left in place");
            }
        }
        Ok(())
    }

    fn list_checkpoints(&self) -> Result<Vec<CheckpointId>> {
        Ok(Self::scan_checkpoint_dirs(&self.inner.job_dir)?
            .into_iter()
            .filter(|(_, dir)| dir.join(METADATA_FILE_NAME).is_file())
            .map(|(id, _)| id)
            .collect())
    }

    fn discard_job_directories(&self) -> Result<()> {
        let inner = &self.inner;

        remove_dir_all_if_exists(&inner.task_owned_dir)?;
        for (checkpoint_id, dir) in Self::scan_checkpoint_dirs(&inner.job_dir)? {
            if inner.live.contains(checkpoint_id) {
                continue;
            }
            remove_dir_all_if_exists(&dir)?;
        }

        for dir in [&inner.shared_dir, &inner.job_dir] {
            match fs::remove_dir(dir) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    let remaining = fs::read_dir(dir).map(|d| d.count()).unwrap_or(0);
                    warn!(
                        path = %dir.display(),
                        remaining,
                        error = %e,
                        "Directory not removed, still has entries"
                    );
                }
            }
        }

        info!(path = %inner.job_dir.display(), "Discarded job directories");
        Ok(())
    }
}

fn remove_temp_file(tmp: &Path) {
    if let Err(e) = remove_file_if_exists(tmp) {
        warn!(path = %tmp.display(), error = %e, "Failed to remove temp file");
    }
}

fn remove_dir_all_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
