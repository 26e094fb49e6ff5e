//! Shared memory budget for all shard stores.
//!
//! One `BlockCache` instance is created at startup and handed to every
//! store, so the configured cap bounds the whole table rather than each
//! shard individually. Stores charge it on insert and release on
//! delete; a write that would exceed the cap fails with an
//! out-of-memory error instead of silently growing.
//!
//! Accounting is byte-level and explicit — no scanning, no sampling.

use std::sync::atomic::{AtomicU64, Ordering};

/// A shared byte budget with lock-free charge/release accounting.
#[derive(Debug)]
pub struct BlockCache {
    capacity: u64,
    used: AtomicU64,
}

impl BlockCache {
    /// Creates a budget of `capacity` bytes. Zero disables enforcement.
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            used: AtomicU64::new(0),
        }
    }

    /// Creates a budget from a MiB count (the config knob's unit).
    pub fn with_mb(mb: u64) -> Self {
        Self::new(mb * 1024 * 1024)
    }

    /// Returns the configured capacity in bytes.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Returns the currently charged bytes.
    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    /// Attempts to charge `bytes` against the budget.
    ///
    /// Returns `false` (charging nothing) if the budget would be
    /// exceeded. A CAS loop keeps concurrent chargers from jointly
    /// overshooting the cap.
    pub fn try_charge(&self, bytes: u64) -> bool {
        if self.capacity == 0 {
            return true;
        }
        let mut current = self.used.load(Ordering::Relaxed);
        loop {
            let next = match current.checked_add(bytes) {
                Some(n) if n <= self.capacity => n,
                _ => return false,
            };
            match self.used.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Charges `bytes` unconditionally, allowing the budget to
    /// overshoot. Used when replaying existing data at boot — old data
    /// is never turned away, only new writes are.
    pub fn charge(&self, bytes: u64) {
        if self.capacity == 0 {
            return;
        }
        self.used.fetch_add(bytes, Ordering::AcqRel);
    }

    /// Releases previously charged bytes.
    pub fn release(&self, bytes: u64) {
        if self.capacity == 0 {
            return;
        }
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
                Err(observed) => current = observed,
            }
        }
    }
}
