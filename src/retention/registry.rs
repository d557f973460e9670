//! Reference counts of shared state.

use crate::handle::{StateHandle, StateHandleId};
use crate::types::CheckpointId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

/// One shared handle and the number of retained checkpoints referencing it.
#[derive(Debug, Clone)]
pub struct SharedStateEntry {
    pub handle: StateHandle,
    pub ref_count: u32,
    /// Newest checkpoint that registered a reference
    pub last_used_checkpoint: CheckpointId,
}

/// Registry of shared state keyed by handle id.
///
/// Every mutation of one id goes through its map entry, so concurrent
/// register/unregister calls for the same handle are serialized.
#[derive(Debug, Default)]
pub struct SharedStateRegistry {
    entries: DashMap<StateHandleId, SharedStateEntry>,
}

impl SharedStateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one reference from `checkpoint_id`. Returns the new count.
    pub fn register(&self, handle: &StateHandle, checkpoint_id: CheckpointId) -> u32 {
        match self.entries.entry(handle.id().clone()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.ref_count += 1;
                entry.last_used_checkpoint = entry.last_used_checkpoint.max(checkpoint_id);
                entry.ref_count
            }
            Entry::Vacant(vacant) => {
                vacant.insert(SharedStateEntry {
                    handle: handle.clone(),
                    ref_count: 1,
                    last_used_checkpoint: checkpoint_id,
                });
                1
            }
        }
    }

    /// Drop one reference.
    ///
    /// Returns the handle once its count reaches zero; the caller is then
    /// responsible for deleting it.
    pub fn unregister(&self, id: &StateHandleId) -> Option<StateHandle> {
        match self.entries.entry(id.clone()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.ref_count = entry.ref_count.saturating_sub(1);
                if entry.ref_count == 0 {
                    let (_, entry) = occupied.remove_entry();
                    debug!(handle = %id, "Shared state no longer referenced");
                    Some(entry.handle)
                } else {
                    None
                }
            }
            Entry::Vacant(_) => {
                debug!(handle = %id, "Unregistering unknown shared state");
                None
            }
        }
    }

    /// Current reference count, 0 if unknown.
    pub fn ref_count(&self, id: &StateHandleId) -> u32 {
        self.entries.get(id).map_or(0, |e| e.ref_count)
    }

    pub fn contains(&self, id: &StateHandleId) -> bool {
        self.entries.contains_key(id)
    }

    /// Number of distinct shared handles referenced.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copy of one entry.
    pub fn get(&self, id: &StateHandleId) -> Option<SharedStateEntry> {
        self.entries.get(id).map(|e| e.value().clone())
    }

    /// Forget every entry and return their handles.
    pub(crate) fn drain(&self) -> Vec<StateHandle> {
        let ids: Vec<StateHandleId> = self.entries.iter().map(|e| e.key().clone()).collect();
        ids.into_iter()
            .filter_map(|id| self.entries.remove(&id).map(|(_, e)| e.handle))
            .collect()
    }
}
