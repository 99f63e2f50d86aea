//! Process-wide control signals.
//!
//! Two signals cross stage boundaries:
//! - `StopSignal`: asserted once at shutdown, observed by every stage loop.
//! - `RecognitionWindow`: asserted by the validation gateway for the duration of
//!   one validation request, observed by the capture and recognition stages.
//!
//! Both are cheap to clone and are handed to each component at construction.
//! Nothing in the crate reaches for process-global state.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Cooperative shutdown flag shared by all stages.
#[derive(Clone, Debug, Default)]
pub struct StopSignal {
    stopped: Arc<AtomicBool>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct WindowState {
    active: AtomicBool,
    gate_position: Mutex<Option<String>>,
    activations: AtomicU64,
    deactivations: AtomicU64,
}

/// The recognition window: an on/off flag plus the gate position it concerns.
///
/// Single writer (the gateway), many readers. The gate position slot holds the
/// most recently published value; `None` until the first request.
#[derive(Clone, Debug, Default)]
pub struct RecognitionWindow {
    state: Arc<WindowState>,
}

impl RecognitionWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.state.active.load(Ordering::SeqCst)
    }

    pub fn gate_position(&self) -> Option<String> {
        self.state
            .gate_position
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn set_gate_position(&self, gate_position: Option<&str>) {
        let mut slot = self
            .state
            .gate_position
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = gate_position.map(str::to_string);
    }

    /// Publish the gate position, assert the window, and return a guard that
    /// de-asserts it when dropped.
    ///
    /// The guard de-asserts exactly once, including on early return or panic
    /// inside the polling loop.
    pub fn activate(&self, gate_position: Option<&str>) -> ActivationGuard {
        if gate_position.is_some() {
            self.set_gate_position(gate_position);
        }
        self.state.activations.fetch_add(1, Ordering::SeqCst);
        self.state.active.store(true, Ordering::SeqCst);
        ActivationGuard {
            window: self.clone(),
        }
    }

    /// Number of times the window has been asserted since process start.
    pub fn activations(&self) -> u64 {
        self.state.activations.load(Ordering::SeqCst)
    }

    /// Number of times the window has been de-asserted since process start.
    pub fn deactivations(&self) -> u64 {
        self.state.deactivations.load(Ordering::SeqCst)
    }

    fn deactivate(&self) {
        self.state.active.store(false, Ordering::SeqCst);
        self.state.deactivations.fetch_add(1, Ordering::SeqCst);
    }
}

/// Keeps the recognition window asserted while alive.
#[must_use = "dropping the guard immediately closes the recognition window"]
#[derive(Debug)]
pub struct ActivationGuard {
    window: RecognitionWindow,
}

impl Drop for ActivationGuard {
    fn drop(&mut self) {
        self.window.deactivate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_signal_is_shared_between_clones() {
        let stop = StopSignal::new();
        let observer = stop.clone();
        assert!(!observer.is_stopped());
        stop.stop();
        assert!(observer.is_stopped());
    }

    #[test]
    fn guard_deasserts_exactly_once() {
        let window = RecognitionWindow::new();
        assert!(!window.is_active());
        assert_eq!(window.gate_position(), None);

        {
            let _guard = window.activate(Some("north"));
            assert!(window.is_active());
            assert_eq!(window.gate_position().as_deref(), Some("north"));
        }

        assert!(!window.is_active());
        assert_eq!(window.activations(), 1);
        assert_eq!(window.deactivations(), 1);
        // Gate position is left in place for observers after the window closes.
        assert_eq!(window.gate_position().as_deref(), Some("north"));
    }

    #[test]
    fn guard_deasserts_on_panic() {
        let window = RecognitionWindow::new();
        let observer = window.clone();
        let result = std::panic::catch_unwind(move || {
            let _guard = window.activate(Some("south"));
            panic!("poll loop failure");
        });
        assert!(result.is_err());
        assert!(!observer.is_active());
        assert_eq!(observer.activations(), observer.deactivations());
    }
}
