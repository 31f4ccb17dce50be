//! Catch-up mode
//!
//! After startup the application replays historical messages; while that
//! runs, side effects that would break replayed pre-key messages are
//! gated: used one-time pre keys are retained, signed pre key rotation is
//! deferred, and staleness responses plus passive-session completions are
//! queued instead of sent. The state starts active on load and is flipped
//! by explicit application signals.

use std::sync::atomic::{AtomicBool, Ordering};

/// The process-wide catch-up flag
pub struct CatchUpState {
    active: AtomicBool,
}

impl CatchUpState {
    /// Catch-up starts active on load
    pub fn new() -> Self {
        Self {
            active: AtomicBool::new(true),
        }
    }

    /// Whether catch-up is currently active
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Enter catch-up mode
    pub fn begin(&self) {
        self.active.store(true, Ordering::Release);
    }

    /// Leave catch-up mode; returns whether the state actually changed
    pub fn finish(&self) -> bool {
        self.active.swap(false, Ordering::AcqRel)
    }
}

impl Default for CatchUpState {
    fn default() -> Self {
        Self::new()
    }
}
