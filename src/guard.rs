//! Allocation guard.
//!
//! Serializes the "find first free address, claim it" sequence. The lock is
//! global per orchestrator rather than per subnet and has no timeout: a
//! caller waits until the current allocation finishes.

use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Mutual exclusion for the allocation path.
#[derive(Debug, Default)]
pub struct AllocationGuard {
    lock: Mutex<()>,
}

/// Proof that the holder owns the allocation path. Released on drop.
#[derive(Debug)]
pub struct AllocationPermit<'a> {
    _held: MutexGuard<'a, ()>,
}

impl AllocationGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until no other allocation is in progress.
    pub async fn acquire(&self) -> AllocationPermit<'_> {
        let held = self.lock.lock().await;
        debug!("Allocation guard acquired");
        AllocationPermit { _held: held }
    }

    /// Returns true while some caller holds a permit.
    pub fn is_held(&self) -> bool {
        self.lock.try_lock().is_err()
    }
}

impl Drop for AllocationPermit<'_> {
    fn drop(&mut self) {
        debug!("Allocation guard released");
    }
}
