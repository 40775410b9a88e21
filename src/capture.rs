//! Capture gate - the tracker-wide on/off switch.
//!
//! The tracker never decides for itself whether a session is running; it asks
//! this predicate on every hook. Marker *texts* are recorded regardless of the
//! answer (nesting depth must stay correct across toggles), but slot
//! allocation, timestamp writes and submission records only happen while the
//! gate is open.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Answers "is a capture session running right now?".
pub trait CaptureGate: Send + Sync {
    fn is_capturing(&self) -> bool;
}

/// Shared atomic toggle, flipped by whatever owns the session lifecycle
/// (a control connection, a lock file watcher, a test).
#[derive(Debug, Clone, Default)]
pub struct CaptureFlag {
    capturing: Arc<AtomicBool>,
}

impl CaptureFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_capturing(&self, capturing: bool) {
        self.capturing.store(capturing, Ordering::Relaxed);
    }
}

impl CaptureGate for CaptureFlag {
    fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_toggles() {
        let flag = CaptureFlag::new();
        assert!(!flag.is_capturing());
        flag.set_capturing(true);
        assert!(flag.is_capturing());
        let shared = flag.clone();
        shared.set_capturing(false);
        assert!(!flag.is_capturing());
    }
}
