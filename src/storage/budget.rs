//! Byte budgets for inline state.

use crate::handle::StateHandleId;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// A shared byte budget with lock-free reservations.
///
/// Used twice: once per location (aggregate inline bytes of one checkpoint)
/// and once per memory backend (bytes held by all open locations).
#[derive(Debug)]
pub struct InlineBudget {
    limit: u64,
    used: AtomicU64,
}

impl InlineBudget {
    /// Create a budget of `limit` bytes.
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            used: AtomicU64::new(0),
        }
    }

    /// Create a budget that never refuses a reservation.
    pub fn unbounded() -> Self {
        Self::new(u64::MAX)
    }

    /// Try to reserve `bytes`. Returns `false` without reserving anything if
    /// the reservation would exceed the limit.
    pub fn try_reserve(&self, bytes: u64) -> bool {
        let mut current = self.used.load(Ordering::Relaxed);
        loop {
            let next = match current.checked_add(bytes) {
                Some(next) if next <= self.limit => next,
                _ => return false,
            };
            match self.used.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Return `bytes` to the budget.
    pub fn release(&self, bytes: u64) {
        let mut current = self.used.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(bytes);
            match self.used.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Bytes currently reserved.
    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    /// Configured limit.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Bytes still available.
    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.used())
    }

    /// Whether no further byte can be reserved.
    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }
}

/// Backend-wide memory budget that knows which handle holds which bytes.
///
/// Streams reserve while writing; once a stream is sealed its reservation is
/// held by the handle until the handle is discarded. Releasing a handle
/// twice, or one this backend never charged, returns nothing.
#[derive(Debug)]
pub struct MemoryBudget {
    bytes: InlineBudget,
    held: DashMap<StateHandleId, u64>,
}

impl MemoryBudget {
    pub fn new(limit: u64) -> Self {
        Self {
            bytes: InlineBudget::new(limit),
            held: DashMap::new(),
        }
    }

    pub fn try_reserve(&self, bytes: u64) -> bool {
        self.bytes.try_reserve(bytes)
    }

    /// Return a reservation no handle holds yet.
    pub fn release(&self, bytes: u64) {
        self.bytes.release(bytes);
    }

    /// Attach a reservation to the handle it now belongs to.
    pub fn hold(&self, id: StateHandleId, bytes: u64) {
        if bytes > 0 {
            self.held.insert(id, bytes);
        }
    }

    /// Return the bytes held by `id`, if any.
    pub fn release_handle(&self, id: &StateHandleId) -> u64 {
        match self.held.remove(id) {
            Some((_, bytes)) => {
                self.bytes.release(bytes);
                bytes
            }
            None => 0,
        }
    }

    pub fn used(&self) -> u64 {
        self.bytes.used()
    }

    pub fn limit(&self) -> u64 {
        self.bytes.limit()
    }

    pub fn is_exhausted(&self) -> bool {
        self.bytes.is_exhausted()
    }

    /// Number of handles currently holding bytes.
    pub fn held_handles(&self) -> usize {
        self.held.len()
    }
}
