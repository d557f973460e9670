//! Checkpoint metadata and the acknowledgement bookkeeping that produces it.

use crate::checkpoint::format::{now_millis, FormatError};
use crate::checkpoint::reader::MetadataReader;
use crate::checkpoint::writer::MetadataWriter;
use crate::handle::StateHandle;
use crate::types::{CheckpointId, OperatorId, StateScope};
use std::collections::{BTreeMap, BTreeSet};
use std::io::{Seek, Write};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Everything needed to restore a checkpoint: the handles of every operator.
///
/// Immutable once the location it came from is finalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointMetadata {
    pub checkpoint_id: CheckpointId,
    /// Unix timestamp in milliseconds when the checkpoint was triggered.
    pub timestamp: u64,
    pub operator_states: BTreeMap<OperatorId, Vec<StateHandle>>,
    /// Pointer that resolves back to this metadata.
    pub external_pointer: String,
}

impl CheckpointMetadata {
    /// Iterate over all handles of all operators.
    pub fn handles(&self) -> impl Iterator<Item = &StateHandle> {
        self.operator_states.values().flatten()
    }

    /// Iterate over handles of one scope.
    pub fn handles_in_scope(&self, scope: StateScope) -> impl Iterator<Item = &StateHandle> {
        self.handles().filter(move |h| h.scope() == scope)
    }

    /// Total payload size referenced by this checkpoint.
    pub fn total_size(&self) -> u64 {
        self.handles().map(StateHandle::size_bytes).sum()
    }

    /// Total inline payload size carried by this checkpoint.
    pub fn inline_size(&self) -> u64 {
        self.handles().map(StateHandle::inline_size).sum()
    }

    /// Stream the operator states into a metadata writer.
    pub(crate) fn write_to<W: Write + Seek>(
        &self,
        writer: &mut MetadataWriter<W>,
    ) -> Result<(), FormatError> {
        for (operator_id, handles) in &self.operator_states {
            writer.write_operator(operator_id, handles)?;
        }
        Ok(())
    }

    /// Rebuild metadata from a reader.
    pub(crate) fn read_from(
        reader: &mut MetadataReader,
        external_pointer: String,
    ) -> Result<Self, FormatError> {
        let checkpoint_id = reader.header().checkpoint_id;
        let timestamp = reader.header().timestamp;

        let mut operator_states = BTreeMap::new();
        for entry in reader.read_all()? {
            operator_states.insert(entry.operator_id, entry.handles);
        }

        Ok(Self {
            checkpoint_id,
            timestamp,
            operator_states,
            external_pointer,
        })
    }
}

/// Acknowledgement from a task that its snapshot is written.
#[derive(Debug, Clone)]
pub struct TaskAcknowledgement {
    pub checkpoint_id: CheckpointId,
    pub operator_id: OperatorId,
    pub handles: Vec<StateHandle>,
}

impl TaskAcknowledgement {
    /// Create an acknowledgement.
    pub fn new(
        checkpoint_id: CheckpointId,
        operator_id: impl Into<OperatorId>,
        handles: Vec<StateHandle>,
    ) -> Self {
        Self {
            checkpoint_id,
            operator_id: operator_id.into(),
            handles,
        }
    }
}

/// A checkpoint that is collecting acknowledgements.
#[derive(Debug)]
pub struct PendingCheckpoint {
    checkpoint_id: CheckpointId,
    timestamp: u64,
    start_time: Instant,
    /// Operators that must acknowledge before finalize
    required: BTreeSet<OperatorId>,
    /// State handles from acknowledged operators
    acknowledged: BTreeMap<OperatorId, Vec<StateHandle>>,
}

impl PendingCheckpoint {
    /// Start collecting acknowledgements for `checkpoint_id`.
    pub fn new(
        checkpoint_id: CheckpointId,
        required: impl IntoIterator<Item = OperatorId>,
    ) -> Self {
        Self {
            checkpoint_id,
            timestamp: now_millis(),
            start_time: Instant::now(),
            required: required.into_iter().collect(),
            acknowledged: BTreeMap::new(),
        }
    }

    pub fn checkpoint_id(&self) -> CheckpointId {
        self.checkpoint_id
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Time since the checkpoint started collecting acknowledgements.
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Record an acknowledgement.
    ///
    /// Returns `false` if it was ignored: wrong checkpoint, an operator that
    /// is not required, or a duplicate.
    pub fn acknowledge(&mut self, ack: TaskAcknowledgement) -> bool {
        if ack.checkpoint_id != self.checkpoint_id {
            debug!(
                expected = self.checkpoint_id,
                received = ack.checkpoint_id,
                "Received ack for wrong checkpoint"
            );
            return false;
        }

        if !self.required.contains(&ack.operator_id) {
            warn!(
                checkpoint_id = self.checkpoint_id,
                operator_id = %ack.operator_id,
                "Received ack from operator that is not part of the checkpoint"
            );
            return false;
        }

        if self.acknowledged.contains_key(&ack.operator_id) {
            debug!(
                checkpoint_id = self.checkpoint_id,
                operator_id = %ack.operator_id,
                "Ignoring duplicate ack"
            );
            return false;
        }

        self.acknowledged.insert(ack.operator_id, ack.handles);
        true
    }

    /// Operators that have not acknowledged yet.
    pub fn missing(&self) -> Vec<OperatorId> {
        self.required
            .iter()
            .filter(|op| !self.acknowledged.contains_key(*op))
            .cloned()
            .collect()
    }

    pub fn is_fully_acknowledged(&self) -> bool {
        self.acknowledged.len() == self.required.len()
    }

    /// Turn the acknowledgements into metadata.
    pub(crate) fn into_metadata(self, external_pointer: String) -> CheckpointMetadata {
        CheckpointMetadata {
            checkpoint_id: self.checkpoint_id,
            timestamp: self.timestamp,
            operator_states: self.acknowledged,
            external_pointer,
        }
    }
}

/// A successfully finalized checkpoint.
#[derive(Debug, Clone)]
pub struct CompletedCheckpoint {
    pub metadata: CheckpointMetadata,
    /// Time from the first acknowledgement collection to finalize.
    pub duration: Duration,
    pub total_size: u64,
    /// Exclusive and shared handles written to the location but absent from
    /// the metadata. Released once the checkpoint is registered.
    pub(crate) orphaned: Vec<StateHandle>,
}

impl CompletedCheckpoint {
    pub fn checkpoint_id(&self) -> CheckpointId {
        self.metadata.checkpoint_id
    }

    pub fn external_pointer(&self) -> &str {
        &self.metadata.external_pointer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn ops(names: &[&str]) -> Vec<OperatorId> {
        names.iter().map(|n| OperatorId::new(*n)).collect()
    }

    fn handle() -> StateHandle {
        StateHandle::inline(StateScope::Exclusive, Bytes::from_static(b"s"))
    }

    #[test]
    fn test_pending_checkpoint_tracks_missing() {
        let mut pending = PendingCheckpoint::new(4, ops(&["source", "map", "sink"]));
        assert_eq!(pending.missing().len(), 3);

        assert!(pending.acknowledge(TaskAcknowledgement::new(4, "map", vec![handle()])));
        assert!(pending.acknowledge(TaskAcknowledgement::new(4, "source", vec![handle()])));

        assert!(!pending.is_fully_acknowledged());
        assert_eq!(pending.missing(), ops(&["sink"]));

        assert!(pending.acknowledge(TaskAcknowledgement::new(4, "sink", vec![])));
        assert!(pending.is_fully_acknowledged());
        assert!(pending.missing().is_empty());
    }

    #[test]
    fn test_pending_checkpoint_ignores_foreign_acks() {
        let mut pending = PendingCheckpoint::new(4, ops(&["map"]));

        assert!(!pending.acknowledge(TaskAcknowledgement::new(3, "map", vec![handle()])));
        assert!(!pending.acknowledge(TaskAcknowledgement::new(4, "filter", vec![handle()])));
        assert!(pending.acknowledge(TaskAcknowledgement::new(4, "map", vec![handle()])));
        assert!(!pending.acknowledge(TaskAcknowledgement::new(4, "map", vec![])));

        let metadata = pending.into_metadata("memory://job/chk-4".into());
        assert_eq!(metadata.operator_states[&OperatorId::new("map")].len(), 1);
    }

    #[test]
    fn test_metadata_sizes_by_scope() {
        let mut pending = PendingCheckpoint::new(1, ops(&["a"]));
        let shared = StateHandle::inline(StateScope::Shared, Bytes::from_static(b"1234"));
        pending.acknowledge(TaskAcknowledgement::new(1, "a", vec![handle(), shared]));

        let metadata = pending.into_metadata(String::new());
        assert_eq!(metadata.total_size(), 5);
        assert_eq!(metadata.inline_size(), 5);
        assert_eq!(metadata.handles_in_scope(StateScope::Shared).count(), 1);
    }
}
