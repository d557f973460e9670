//! Testing utilities for checkpoint storage.
//!
//! This module provides:
//! - [`FaultyStorage`], a backend wrapper that injects deletion and read
//!   failures so retry paths can be exercised
//! - Scenario tests covering shared state reuse, cancellation policies,
//!   capacity limits, concurrent writers and restore
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                CheckpointStorageCoordinator                     │
//! │                             │                                   │
//! │                             ▼                                   │
//! │  ┌───────────────────────────────────────────────────────────┐ │
//! │  │                    FaultyStorage                           │ │
//! │  │  - discard_state / retire_metadata failures               │ │
//! │  │  - discard_metadata failures                              │ │
//! │  │  - read_state failures                                    │ │
//! │  └───────────────────────────────────────────────────────────┘ │
//! │                             │                                   │
//! │                             ▼                                   │
//! │              Memory or filesystem backend                       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use chkstore::{
//!     CheckpointStorageCoordinator, FaultyStorage, MemoryBackendConfig, MemoryCheckpointStorage,
//!     StorageConfig,
//! };
//! use std::sync::Arc;
//!
//! let config = StorageConfig::in_memory();
//! let inner = Arc::new(MemoryCheckpointStorage::new(config.job_id, MemoryBackendConfig::default()));
//! let storage = Arc::new(FaultyStorage::new(inner));
//! let coordinator = CheckpointStorageCoordinator::with_storage(config, storage.clone());
//!
//! // Deletions now fail until healed; retention parks them for retry.
//! storage.faults().fail_discard_state(true);
//! ```

mod faults;

#[cfg(test)]
mod utils;

mod restore_tests;

pub use faults::{FaultyStorage, StorageFaults};

#[cfg(test)]
pub(crate) use utils::{complete_checkpoint, pending_for, write_state};
