//! State handles: immutable references to checkpointed bytes.
//!
//! A handle either carries its payload inline (memory backend, or small
//! filesystem writes below the inlining threshold) or points at a byte range
//! of a file. Handles are cheap to clone; inline payloads are reference
//! counted [`Bytes`].
//!
//! Deleting the bytes behind a handle needs a [`DiscardToken`]. Tokens for
//! exclusive and shared state can be minted by anyone holding the handle;
//! task-owned state only yields a token during a full job teardown, so the
//! ordinary subsumption and abort paths cannot delete it by construction.

use crate::checkpoint::checksum;
use crate::types::StateScope;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Stable identifier of a state handle.
///
/// A checkpoint that reuses shared state unchanged reports the same id again,
/// which is what the shared-state registry counts references by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateHandleId(String);

impl StateHandleId {
    /// Create a fresh random id.
    pub fn random() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Create an id from an existing string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StateHandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where the bytes of a handle live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateLocator {
    /// Payload is carried in the handle itself.
    Inline,
    /// Payload is a byte range of a file.
    File {
        path: PathBuf,
        offset: u64,
        length: u64,
    },
}

/// Immutable reference to a byte range in checkpoint storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateHandle {
    id: StateHandleId,
    size_bytes: u64,
    locator: StateLocator,
    scope: StateScope,
    inline_bytes: Option<Bytes>,
    checksum: Option<u32>,
}

impl StateHandle {
    /// Create a handle carrying its payload inline.
    pub fn inline(scope: StateScope, bytes: Bytes) -> Self {
        Self {
            id: StateHandleId::random(),
            size_bytes: bytes.len() as u64,
            locator: StateLocator::Inline,
            scope,
            checksum: Some(checksum(&bytes)),
            inline_bytes: Some(bytes),
        }
    }

    /// Create a handle for a whole file.
    pub fn file(scope: StateScope, path: PathBuf, length: u64, checksum: Option<u32>) -> Self {
        Self::file_range(scope, path, 0, length, checksum)
    }

    /// Create a handle for a byte range of a file.
    pub fn file_range(
        scope: StateScope,
        path: PathBuf,
        offset: u64,
        length: u64,
        checksum: Option<u32>,
    ) -> Self {
        Self {
            id: StateHandleId::random(),
            size_bytes: length,
            locator: StateLocator::File {
                path,
                offset,
                length,
            },
            scope,
            inline_bytes: None,
            checksum,
        }
    }

    /// Get the handle id.
    pub fn id(&self) -> &StateHandleId {
        &self.id
    }

    /// Payload size in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Where the payload lives.
    pub fn locator(&self) -> &StateLocator {
        &self.locator
    }

    /// Ownership scope.
    pub fn scope(&self) -> StateScope {
        self.scope
    }

    /// Inline payload, if any.
    pub fn inline_bytes(&self) -> Option<&Bytes> {
        self.inline_bytes.as_ref()
    }

    /// CRC32 of the payload, if recorded.
    pub fn checksum(&self) -> Option<u32> {
        self.checksum
    }

    /// Whether the payload is carried inline.
    pub fn is_inline(&self) -> bool {
        self.inline_bytes.is_some()
    }

    /// Path of the backing file, if the payload lives in one.
    pub fn file_path(&self) -> Option<&Path> {
        match &self.locator {
            StateLocator::File { path, .. } => Some(path),
            StateLocator::Inline => None,
        }
    }

    /// Bytes held in memory by this handle.
    pub fn inline_size(&self) -> u64 {
        self.inline_bytes.as_ref().map_or(0, |b| b.len() as u64)
    }
}

/// Permission to physically delete the bytes behind one handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscardToken {
    handle: StateHandle,
}

impl DiscardToken {
    /// Token for state the coordinator owns.
    ///
    /// Returns `None` for task-owned state.
    pub fn coordinator_owned(handle: &StateHandle) -> Option<Self> {
        match handle.scope() {
            StateScope::Exclusive | StateScope::Shared => Some(Self {
                handle: handle.clone(),
            }),
            StateScope::TaskOwned => None,
        }
    }

    /// Token the owning task uses to release its own state.
    ///
    /// Returns `None` for state the coordinator owns.
    pub fn task_owned(handle: &StateHandle) -> Option<Self> {
        match handle.scope() {
            StateScope::TaskOwned => Some(Self {
                handle: handle.clone(),
            }),
            StateScope::Exclusive | StateScope::Shared => None,
        }
    }

    /// Token for any state during a full teardown of the job.
    pub(crate) fn job_teardown(handle: &StateHandle) -> Self {
        Self {
            handle: handle.clone(),
        }
    }

    /// The handle this token allows deleting.
    pub fn handle(&self) -> &StateHandle {
        &self.handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inline_handle() {
        let handle = StateHandle::inline(StateScope::Exclusive, Bytes::from_static(b"abc"));

        assert!(handle.is_inline());
        assert_eq!(handle.size_bytes(), 3);
        assert_eq!(handle.inline_size(), 3);
        assert_eq!(handle.locator(), &StateLocator::Inline);
        assert_eq!(handle.checksum(), Some(checksum(b"abc")));
        assert!(handle.file_path().is_none());
    }

    #[test]
    fn test_file_handle() {
        let handle = StateHandle::file(StateScope::Shared, PathBuf::from("/tmp/x"), 2048, None);

        assert!(!handle.is_inline());
        assert_eq!(handle.size_bytes(), 2048);
        assert_eq!(handle.inline_size(), 0);
        assert_eq!(handle.file_path(), Some(Path::new("/tmp/x")));
    }

    #[test]
    fn test_handle_ids_are_unique() {
        let a = StateHandle::inline(StateScope::Shared, Bytes::from_static(b"x"));
        let b = StateHandle::inline(StateScope::Shared, Bytes::from_static(b"x"));
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_task_owned_state_has_no_coordinator_token() {
        let owned = StateHandle::inline(StateScope::TaskOwned, Bytes::from_static(b"offsets"));
        let shared = StateHandle::inline(StateScope::Shared, Bytes::from_static(b"sst"));

        assert!(DiscardToken::coordinator_owned(&owned).is_none());
        assert!(DiscardToken::coordinator_owned(&shared).is_some());
        assert_eq!(DiscardToken::job_teardown(&owned).handle(), &owned);
    }

    #[test]
    fn test_task_token_only_for_task_owned_state() {
        let owned = StateHandle::inline(StateScope::TaskOwned, Bytes::from_static(b"offsets"));
        let exclusive = StateHandle::inline(StateScope::Exclusive, Bytes::from_static(b"window"));

        assert_eq!(DiscardToken::task_owned(&owned).unwrap().handle(), &owned);
        assert!(DiscardToken::task_owned(&exclusive).is_none());
    }
}
