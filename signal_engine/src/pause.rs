//! Global signal-emission pause.
//!
//! Two states only: ACTIVE (`None`) and PAUSED (`Some(reason)`). The anomaly
//! detector writes, every symbol task reads. One instance is shared through
//! an `Arc` by whoever owns the scanner, so independent scanners never see
//! each other's pause.

use std::sync::RwLock;

use tracing::{info, warn};

#[derive(Debug, Default)]
pub struct PauseState {
    reason: RwLock<Option<String>>,
}

impl PauseState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter PAUSED. Re-pausing replaces the reason with the newest one.
    pub fn pause(&self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(%reason, "signal emission paused");
        *self.reason.write().unwrap_or_else(|e| e.into_inner()) = Some(reason);
    }

    /// Return to ACTIVE. Returns whether the state actually changed.
    pub fn resume(&self) -> bool {
        let previous = self
            .reason
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(reason) = &previous {
            info!(previous_reason = %reason, "signal emission resumed");
        }
        previous.is_some()
    }

    pub fn is_paused(&self) -> bool {
        self.reason
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn pause_and_resume_cycle() {
        let state = PauseState::new();
        assert!(!state.is_paused());
        assert!(!state.resume());

        state.pause("BTC shock 9.1%");
        assert!(state.is_paused());
        assert_eq!(state.reason().as_deref(), Some("BTC shock 9.1%"));

        state.pause("breadth collapse");
        assert_eq!(state.reason().as_deref(), Some("breadth collapse"));

        assert!(state.resume());
        assert!(!state.is_paused());
        assert_eq!(state.reason(), None);
    }

    #[test]
    fn instances_are_independent() {
        let a = Arc::new(PauseState::new());
        let b = Arc::new(PauseState::new());
        a.pause("test");
        assert!(a.is_paused());
        assert!(!b.is_paused());
    }

    #[test]
    fn concurrent_writer_is_visible_to_readers() {
        let state = Arc::new(PauseState::new());
        let writer = {
            let state = Arc::clone(&state);
            std::thread::spawn(move || state.pause("critical"))
        };
        writer.join().unwrap();
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let state = Arc::clone(&state);
                std::thread::spawn(move || state.is_paused())
            })
            .collect();
        for r in readers {
            assert!(r.join().unwrap());
        }
    }
}
