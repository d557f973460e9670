//! Retention and physical deletion of checkpoint state.
//!
//! Completed checkpoints are registered with the [`RetentionManager`], which
//! decides when their state may be deleted:
//!
//! - Exclusive state goes with its checkpoint
//! - Shared state is reference counted in the [`SharedStateRegistry`] and
//!   deleted when the last retained checkpoint referencing it is gone
//! - Task-owned state is only deleted on job teardown
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     RetentionManager                         │
//! │  ┌───────────────────────┐   ┌──────────────────────────┐   │
//! │  │ retained checkpoints  │   │ SharedStateRegistry      │   │
//! │  │ (ordered by id)       │──▶│ handle id → ref count    │   │
//! │  └───────────┬───────────┘   └──────────────────────────┘   │
//! │              │ subsume / discard / shutdown                  │
//! │              ▼                                               │
//! │  ┌──────────────────────────────────────────────────────┐   │
//! │  │ retire metadata → delete data → delete metadata      │   │
//! │  │ failures parked in the pending discard queue         │   │
//! │  └──────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod manager;
mod registry;

pub use manager::{RetentionManager, RetentionRecord};
pub use registry::{SharedStateEntry, SharedStateRegistry};
