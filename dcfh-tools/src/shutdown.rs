//! Broadcast-once shutdown signal.
//!
//! Every potentially blocking stage of a workflow polls such a signal and
//! returns early once it fired. Cloning is cheap, all clones observe the
//! same flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct ShutdownSignal {
    fired: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the signal. Idempotent, never blocks.
    pub fn fire(&self) {
        self.fired.store(true, Ordering::SeqCst);
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn clones_observe_fire() {
        let signal = ShutdownSignal::new();
        let other = signal.clone();
        assert!(!other.is_fired());
        signal.fire();
        assert!(other.is_fired());
        signal.fire();
        assert!(signal.is_fired());
    }
}
