//! Interrupt handling for the service (SIGINT/SIGTERM)
//!
//! On the first signal the registry is torn down with exit code 130 and the
//! socket server stops, exactly as if a producer had sent
//! `inform_teardown(130)`. A second signal exits the process immediately.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

/// Exit code used when the service is interrupted
pub const EXIT_CODE_INTERRUPTED: i32 = 130;

/// Signal handler state
#[derive(Debug, Default)]
pub struct SignalState {
    /// First signal received (teardown initiated)
    shutdown_requested: AtomicBool,
    /// Second signal received (immediate exit requested)
    immediate_exit: AtomicBool,
    signal_count: AtomicU8,
}

impl SignalState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Check if immediate exit has been requested (double-SIGINT)
    pub fn is_immediate_exit(&self) -> bool {
        self.immediate_exit.load(Ordering::SeqCst)
    }

    pub fn signal_count(&self) -> u8 {
        self.signal_count.load(Ordering::SeqCst)
    }

    /// Record a signal and return the action to take.
    pub fn handle_signal(&self) -> SignalAction {
        let count = self.signal_count.fetch_add(1, Ordering::SeqCst);

        match count {
            0 => {
                self.shutdown_requested.store(true, Ordering::SeqCst);
                SignalAction::Shutdown
            }
            1 => {
                self.immediate_exit.store(true, Ordering::SeqCst);
                SignalAction::ImmediateExit
            }
            _ => SignalAction::Ignore,
        }
    }
}

/// Action to take after receiving a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// First signal: tear down and stop serving
    Shutdown,
    /// Second signal: exit without waiting
    ImmediateExit,
    /// Third+ signal
    Ignore,
}

/// Installs the process signal handler
#[derive(Debug, Default)]
pub struct SignalHandler {
    state: Arc<SignalState>,
}

impl SignalHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> Arc<SignalState> {
        Arc::clone(&self.state)
    }

    /// Install the handler. `on_shutdown` runs on the first signal.
    ///
    /// Must be called at most once per process.
    pub fn install<F>(&self, on_shutdown: F) -> Result<(), ctrlc::Error>
    where
        F: Fn() + Send + 'static,
    {
        let state = Arc::clone(&self.state);
        ctrlc::set_handler(move || match state.handle_signal() {
            SignalAction::Shutdown => {
                tracing::warn!("received interrupt, shutting down");
                on_shutdown();
            }
            SignalAction::ImmediateExit => {
                eprintln!("\nReceived second interrupt, exiting immediately...");
                std::process::exit(EXIT_CODE_INTERRUPTED);
            }
            SignalAction::Ignore => {}
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_state_initial() {
        let state = SignalState::new();
        assert!(!state.is_shutdown_requested());
        assert!(!state.is_immediate_exit());
        assert_eq!(state.signal_count(), 0);
    }

    #[test]
    fn test_first_signal_requests_shutdown() {
        let state = SignalState::new();
        let action = state.handle_signal();

        assert_eq!(action, SignalAction::Shutdown);
        assert!(state.is_shutdown_requested());
        assert!(!state.is_immediate_exit());
    }

    #[test]
    fn test_second_signal_requests_immediate_exit() {
        let state = SignalState::new();

        state.handle_signal();
        let action = state.handle_signal();

        assert_eq!(action, SignalAction::ImmediateExit);
        assert!(state.is_immediate_exit());
        assert_eq!(state.signal_count(), 2);
    }

    #[test]
    fn test_third_signal_ignored() {
        let state = SignalState::new();

        state.handle_signal();
        state.handle_signal();

        assert_eq!(state.handle_signal(), SignalAction::Ignore);
        assert_eq!(state.signal_count(), 3);
    }
}
