//! Single-process leader election for platform registry sync.
//!
//! A real deployment takes a cross-process advisory lock in the database;
//! here that's abstracted as a trait so the `executor` binary's in-process
//! demo can use a simple `AtomicBool` while a future database-backed
//! implementation can satisfy the same contract.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub trait LeaderElection: Send + Sync {
    /// Attempts to acquire leadership without blocking; returns whether it
    /// succeeded.
    fn try_acquire(&self) -> bool;
    fn release(&self);
}

#[derive(Default)]
pub struct InProcessLeaderElection {
    held: AtomicBool,
}

impl InProcessLeaderElection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl LeaderElection for InProcessLeaderElection {
    fn try_acquire(&self) -> bool {
        self.held
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn release(&self) {
        self.held.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_one_caller_acquires_leadership() {
        let election = InProcessLeaderElection::new();
        assert!(election.try_acquire());
        assert!(!election.try_acquire());
        election.release();
        assert!(election.try_acquire());
    }
}
