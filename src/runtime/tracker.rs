//! In-flight invocation accounting.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Counts step invocations that have been dispatched but not yet completed.
/// The run can only finish once this reaches zero.
#[derive(Debug, Default)]
pub(crate) struct ExecutionTracker {
    in_flight: AtomicUsize,
}

impl ExecutionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    pub fn decrement(&self) {
        let prev = self.in_flight.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "in-flight counter underflow");
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn is_quiescent(&self) -> bool {
        self.in_flight() == 0
    }
}
