//! SIGINT/SIGTERM handling for the engine.
//!
//! On the first signal every running pipeline is force killed and no new
//! pipelines are admitted; the engine then drains and exits with
//! [`EXIT_CODE_KILLED`]. A second signal exits immediately. The status file
//! is rewritten on every state change, so nothing is left to persist.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;

/// Exit code when the engine was stopped by a signal
pub const EXIT_CODE_KILLED: i32 = 80;

/// Signal handler state
#[derive(Debug, Default)]
pub struct SignalState {
    kill_requested: AtomicBool,
    immediate_exit: AtomicBool,
    signal_count: AtomicU8,
}

impl SignalState {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once the first signal has arrived
    pub fn is_kill_requested(&self) -> bool {
        self.kill_requested.load(Ordering::SeqCst)
    }

    pub fn is_immediate_exit(&self) -> bool {
        self.immediate_exit.load(Ordering::SeqCst)
    }

    pub fn signal_count(&self) -> u8 {
        self.signal_count.load(Ordering::SeqCst)
    }

    /// Record a signal and decide what it means.
    pub fn handle_signal(&self) -> SignalAction {
        let count = self.signal_count.fetch_add(1, Ordering::SeqCst);
        match count {
            0 => {
                self.kill_requested.store(true, Ordering::SeqCst);
                SignalAction::KillAll
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
    /// Kill every running pipeline and stop admitting new ones
    KillAll,
    /// Exit the process now
    ImmediateExit,
    Ignore,
}

pub struct SignalHandler {
    state: Arc<SignalState>,
}

impl SignalHandler {
    pub fn new() -> Self {
        Self {
            state: Arc::new(SignalState::new()),
        }
    }

    pub fn state(&self) -> Arc<SignalState> {
        Arc::clone(&self.state)
    }

    /// Install the process-wide handler. `on_kill` runs once, on its own
    /// thread, so that a second signal is still seen while it blocks.
    ///
    /// Must be called at most once per process.
    pub fn install<F>(&self, on_kill: F) -> Result<(), ctrlc::Error>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let state = Arc::clone(&self.state);
        let on_kill = Arc::new(on_kill);
        ctrlc::set_handler(move || match state.handle_signal() {
            SignalAction::KillAll => {
                tracing::warn!("received termination signal, killing all pipelines");
                let task = Arc::clone(&on_kill);
                let spawned = thread::Builder::new()
                    .name("savanna-kill-all".to_string())
                    .spawn(move || task());
                if let Err(e) = spawned {
                    tracing::error!(error = %e, "could not start kill thread, killing inline");
                    (*on_kill)();
                }
            }
            SignalAction::ImmediateExit => {
                tracing::error!("received second termination signal, exiting immediately");
                std::process::exit(EXIT_CODE_KILLED);
            }
            SignalAction::Ignore => {}
        })
    }
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let state = SignalState::new();
        assert!(!state.is_kill_requested());
        assert!(!state.is_immediate_exit());
        assert_eq!(state.signal_count(), 0);
    }

    #[test]
    fn test_signal_sequence() {
        let state = SignalState::new();

        assert_eq!(state.handle_signal(), SignalAction::KillAll);
        assert!(state.is_kill_requested());
        assert!(!state.is_immediate_exit());

        assert_eq!(state.handle_signal(), SignalAction::ImmediateExit);
        assert!(state.is_immediate_exit());

        assert_eq!(state.handle_signal(), SignalAction::Ignore);
        assert_eq!(state.signal_count(), 3);
    }

    #[test]
    fn test_handler_shares_state() {
        let handler = SignalHandler::new();
        handler.state().handle_signal();
        assert!(handler.state().is_kill_requested());
    }
}
