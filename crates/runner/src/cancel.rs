//! Cooperative cancellation signal shared across a single run invocation
//! (spec §5: "the runner accepts an externally cancellable execution
//! context"). Checked between modules and between commands; an in-flight
//! child process is asked to shut down gracefully via
//! [`crate::children::ManagedChild::graceful_shutdown`] rather than killed
//! outright.
//!
//! A plain `AtomicBool` behind an `Arc`, polled rather than awaited: the
//! workspace doesn't otherwise depend on `tokio-util`, and polling on the
//! same cadence as `ManagedChild`'s own shutdown loop keeps the two in step.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_uncancelled_and_latches() {
        let c = Cancellation::new();
        assert!(!c.is_cancelled());
        c.cancel();
        assert!(c.is_cancelled());
        c.cancel();
        assert!(c.is_cancelled());
    }

    #[test]
    fn clones_share_state() {
        let c = Cancellation::new();
        let c2 = c.clone();
        c2.cancel();
        assert!(c.is_cancelled());
    }
}
