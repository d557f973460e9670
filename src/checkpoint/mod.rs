//! Checkpoint metadata: the single "meta file" a restore resolves.
//!
//! This module provides the data model of a completed checkpoint and the
//! on-disk (or in-memory) encoding of its metadata. Key features include:
//!
//! - LZ4 compression for large operator graphs
//! - CRC32 checksums per operator entry and over the whole data block
//! - Acknowledgement bookkeeping for checkpoints still being collected
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  PendingCheckpoint (acks)                    │
//! │                            │ finalize                        │
//! │                            ▼                                 │
//! │                    CheckpointMetadata                        │
//! │  ┌─────────────────┐                  ┌─────────────────┐   │
//! │  │ MetadataWriter  │                  │ MetadataReader  │   │
//! │  │ (compression)   │                  │ (verification)  │   │
//! │  └────────┬────────┘                  └────────┬────────┘   │
//! │           ▼                                    ▼            │
//! │  ┌─────────────────────────────────────────────────────┐   │
//! │  │                  File Format                         │   │
//! │  │  Header (64B) + Data Block (LZ4) + CRC32 (4B)       │   │
//! │  └─────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod format;
mod metadata;
mod reader;
mod writer;

pub use format::{
    FormatError, MetadataHeader, OperatorStateEntry, FLAG_COMPRESSED, HEADER_SIZE, MAGIC,
    TRAILER_SIZE, VERSION,
};
pub use metadata::{CheckpointMetadata, CompletedCheckpoint, PendingCheckpoint, TaskAcknowledgement};
pub use reader::MetadataReader;
pub use writer::{MetadataFileInfo, MetadataWriter};

pub(crate) use format::{checksum, now_millis};
pub(crate) use writer::CrcWriter;
