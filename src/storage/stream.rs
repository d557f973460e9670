//! Output stream a task writes one piece of state through.

use crate::checkpoint::CrcWriter;
use crate::error::{CapacityLimit, Error, Result};
use crate::handle::StateHandle;
use crate::storage::budget::MemoryBudget;
use crate::storage::location::{CheckpointStorageLocation, StreamTarget};
use crate::storage::remove_file_if_exists;
use crate::types::{CheckpointId, StateScope};
use bytes::Bytes;
use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Where the bytes of an open stream go.
enum Sink {
    Memory {
        per_state_max: u64,
        max_frame_size: u64,
        memory_budget: Option<Arc<MemoryBudget>>,
        buffer: Vec<u8>,
        /// Bytes reserved against the location's aggregate budget
        reserved_aggregate: u64,
        /// Bytes reserved against the backend memory budget
        reserved_memory: u64,
    },
    File {
        dir: PathBuf,
        file_size_threshold: u64,
        write_buffer_size: usize,
        /// Bytes held back until the stream is known to exceed the threshold
        buffer: Vec<u8>,
        spill: Option<SpillFile>,
    },
}

struct SpillFile {
    path: PathBuf,
    writer: CrcWriter<BufWriter<File>>,
}

impl SpillFile {
    fn create(dir: &Path, buffer_size: usize) -> Result<Self> {
        let path = dir.join(Uuid::new_v4().simple().to_string());
        let file = File::create(&path).map_err(|e| {
            Error::StorageUnavailable(format!("cannot create {}: {}", path.display(), e))
        })?;
        debug!(path = %path.display(), "Spilling state stream to file");

        Ok(Self {
            path,
            writer: CrcWriter::new(BufWriter::with_capacity(buffer_size, file)),
        })
    }

    /// Flush and sync; returns the CRC32 of everything written.
    fn finish(self) -> Result<(PathBuf, u32)> {
        let (buf_writer, crc) = self.writer.finalize_crc();
        let file = buf_writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok((self.path, crc))
    }
}

/// Stream for one piece of checkpointed state.
///
/// Owned by a single task; writes take no locks. Once
/// [`close_and_get_handle`](Self::close_and_get_handle) returned, or a write
/// failed, every further call fails with `StreamAlreadyClosed`. Dropping an
/// unclosed stream removes whatever it wrote and returns its reservations.
pub struct CheckpointStateOutputStream {
    location: Arc<CheckpointStorageLocation>,
    scope: StateScope,
    sink: Sink,
    pos: u64,
    closed: bool,
}

impl CheckpointStateOutputStream {
    pub(crate) fn new(location: Arc<CheckpointStorageLocation>, scope: StateScope) -> Self {
        let sink = match location.target() {
            StreamTarget::Memory {
                per_state_max,
                max_frame_size,
                memory_budget,
            } => Sink::Memory {
                per_state_max: *per_state_max,
                max_frame_size: *max_frame_size,
                memory_budget: memory_budget.clone(),
                buffer: Vec::new(),
                reserved_aggregate: 0,
                reserved_memory: 0,
            },
            StreamTarget::File {
                dirs,
                file_size_threshold,
                write_buffer_size,
            } => Sink::File {
                dir: dirs.for_scope(scope).to_path_buf(),
                file_size_threshold: *file_size_threshold,
                write_buffer_size: *write_buffer_size,
                buffer: Vec::new(),
                spill: None,
            },
        };

        Self {
            location,
            scope,
            sink,
            pos: 0,
            closed: false,
        }
    }

    pub fn checkpoint_id(&self) -> CheckpointId {
        self.location.checkpoint_id()
    }

    pub fn scope(&self) -> StateScope {
        self.scope
    }

    /// Bytes written so far.
    pub fn pos(&self) -> u64 {
        self.pos
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Append bytes to the stream.
    pub fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        if self.closed {
            return Err(Error::StreamAlreadyClosed);
        }
        if data.is_empty() {
            return Ok(());
        }

        match self.append(data) {
            Ok(()) => {
                self.pos += data.len() as u64;
                Ok(())
            }
            Err(e) => {
                debug!(
                    checkpoint_id = self.checkpoint_id(),
                    scope = %self.scope,
                    error = %e,
                    "State stream write failed, closing stream"
                );
                self.closed = true;
                self.discard_partial();
                Err(e)
            }
        }
    }

    /// Seal the stream and return the handle to its bytes.
    pub fn close_and_get_handle(&mut self) -> Result<StateHandle> {
        if self.closed {
            return Err(Error::StreamAlreadyClosed);
        }
        self.closed = true;

        match self.seal() {
            Ok(handle) => {
                debug!(
                    checkpoint_id = self.checkpoint_id(),
                    scope = %self.scope,
                    handle = %handle.id(),
                    size = handle.size_bytes(),
                    inline = handle.is_inline(),
                    "State stream closed"
                );
                self.location.register_closed(handle)
            }
            Err(e) => {
                self.discard_partial();
                Err(e)
            }
        }
    }

    fn append(&mut self, data: &[u8]) -> Result<()> {
        let len = data.len() as u64;
        let aggregate = self.location.aggregate();

        match &mut self.sink {
            Sink::Memory {
                per_state_max,
                memory_budget,
                buffer,
                reserved_aggregate,
                reserved_memory,
                ..
            } => {
                let total = buffer.len() as u64 + len;
                if total > *per_state_max {
                    return Err(Error::capacity(
                        CapacityLimit::PerState,
                        total,
                        *per_state_max,
                    ));
                }
                if !aggregate.try_reserve(len) {
                    return Err(Error::capacity(
                        CapacityLimit::CheckpointAggregate,
                        aggregate.used().saturating_add(len),
                        aggregate.limit(),
                    ));
                }
                *reserved_aggregate += len;

                if let Some(budget) = memory_budget {
                    if !budget.try_reserve(len) {
                        return Err(Error::capacity(
                            CapacityLimit::MemoryBudget,
                            budget.used().saturating_add(len),
                            budget.limit(),
                        ));
                    }
                    *reserved_memory += len;
                }

                buffer.extend_from_slice(data);
                Ok(())
            }
            Sink::File {
                dir,
                write_buffer_size,
                buffer,
                spill,
                ..
            } => {
                if spill.is_none() && buffer.len() + data.len() <= *write_buffer_size {
                    buffer.extend_from_slice(data);
                    return Ok(());
                }

                if spill.is_none() {
                    let file = spill.insert(SpillFile::create(dir, *write_buffer_size)?);
                    file.writer.write_all(buffer)?;
                    buffer.clear();
                }
                if let Some(file) = spill {
                    file.writer.write_all(data)?;
                }
                Ok(())
            }
        }
    }

    fn seal(&mut self) -> Result<StateHandle> {
        let scope = self.scope;
        let pos = self.pos;
        let aggregate = self.location.aggregate();

        match &mut self.sink {
            Sink::Memory {
                max_frame_size,
                memory_budget,
                buffer,
                reserved_aggregate,
                reserved_memory,
                ..
            } => {
                let handle = StateHandle::inline(scope, Bytes::from(std::mem::take(buffer)));

                let encoded = bincode::serialized_size(&handle)?;
                if encoded > *max_frame_size {
                    return Err(Error::capacity(
                        CapacityLimit::FrameSize,
                        encoded,
                        *max_frame_size,
                    ));
                }

                // Reservations now belong to the handle.
                if let Some(budget) = memory_budget {
                    budget.hold(handle.id().clone(), std::mem::take(reserved_memory));
                }
                *reserved_aggregate = 0;
                *reserved_memory = 0;
                Ok(handle)
            }
            Sink::File {
                dir,
                file_size_threshold,
                write_buffer_size,
                buffer,
                spill,
            } => {
                if spill.is_none() && pos <= *file_size_threshold {
                    if !aggregate.try_reserve(pos) {
                        return Err(Error::capacity(
                            CapacityLimit::CheckpointAggregate,
                            aggregate.used().saturating_add(pos),
                            aggregate.limit(),
                        ));
                    }
                    let bytes = Bytes::from(std::mem::take(buffer));
                    return Ok(StateHandle::inline(scope, bytes));
                }

                if spill.is_none() {
                    let file = spill.insert(SpillFile::create(dir, *write_buffer_size)?);
                    file.writer.write_all(buffer)?;
                    buffer.clear();
                }

                let Some(file) = spill.take() else {
                    return Err(Error::StreamAlreadyClosed);
                };
                let path = file.path.clone();
                match file.finish() {
                    Ok((path, crc)) => Ok(StateHandle::file(scope, path, pos, Some(crc))),
                    Err(e) => {
                        if let Err(remove) = remove_file_if_exists(&path) {
                            warn!(path = %path.display(), error = %remove, "Failed to remove partial state file");
                        }
                        Err(e)
                    }
                }
            }
        }
    }

    /// Drop buffered bytes, partial files and reservations.
    fn discard_partial(&mut self) {
        let aggregate = self.location.aggregate();

        match &mut self.sink {
            Sink::Memory {
                memory_budget,
                buffer,
                reserved_aggregate,
                reserved_memory,
                ..
            } => {
                aggregate.release(std::mem::take(reserved_aggregate));
                if let Some(budget) = memory_budget {
                    budget.release(std::mem::take(reserved_memory));
                }
                buffer.clear();
            }
            Sink::File { buffer, spill, .. } => {
                buffer.clear();
                if let Some(file) = spill.take() {
                    let SpillFile { path, writer } = file;
                    drop(writer);
                    if let Err(e) = remove_file_if_exists(&path) {
                        warn!(path = %path.display(), error = %e, "Failed to remove partial state file");
                    }
                }
            }
        }
    }
}

impl Write for CheckpointStateOutputStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_bytes(buf).map_err(into_io_error)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.closed {
            return Err(into_io_error(Error::StreamAlreadyClosed));
        }
        if let Sink::File {
            spill: Some(file), ..
        } = &mut self.sink
        {
            file.writer.flush()?;
        }
        Ok(())
    }
}

fn into_io_error(e: Error) -> io::Error {
    match e {
        Error::Io(e) => e,
        other => io::Error::other(other),
    }
}

impl Drop for CheckpointStateOutputStream {
    fn drop(&mut self) {
        if !self.closed {
            debug!(
                checkpoint_id = self.checkpoint_id(),
                scope = %self.scope,
                written = self.pos,
                "Discarding unclosed state stream"
            );
            self.discard_partial();
        }
    }
}

impl fmt::Debug for CheckpointStateOutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckpointStateOutputStream")
            .field("checkpoint_id", &self.checkpoint_id())
            .field("scope", &self.scope)
            .field("pos", &self.pos)
            .field("closed", &self.closed)
            .finish()
    }
}
