//! Shared listening-session state
//!
//! Flags are atomics so the event pump, timers and the host can read them
//! without coordination; text fields sit behind small mutexes.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;

/// Point-in-time view of the session for hosts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionState {
    pub is_listening: bool,
    /// Fixed at startup from the backend's capability check
    pub is_supported: bool,
    /// Latest partial or final text, cleared on stop
    pub transcript: String,
    /// Pattern of the last command that fired
    pub last_command: Option<String>,
    pub error: Option<String>,
}

/// Live session state - shared by the controller, its pump task and timers
pub struct RuntimeState {
    // ========================================================================
    // Session flags
    // ========================================================================
    listening: AtomicBool,
    supported: AtomicBool,
    /// Auto-restart is wanted; cleared by `stop()` and fatal errors
    restart_wanted: AtomicBool,
    /// Bumped on every start and stop; late callbacks compare against it
    epoch: AtomicU64,

    // ========================================================================
    // Display state
    // ========================================================================
    transcript: Mutex<String>,
    error: Mutex<Option<String>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl RuntimeState {
    pub fn new(supported: bool) -> Arc<Self> {
        Arc::new(Self {
            listening: AtomicBool::new(false),
            supported: AtomicBool::new(supported),
            restart_wanted: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            transcript: Mutex::new(String::new()),
            error: Mutex::new(None),
        })
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    pub fn is_supported(&self) -> bool {
        self.supported.load(Ordering::SeqCst)
    }

    pub fn restart_wanted(&self) -> bool {
        self.restart_wanted.load(Ordering::SeqCst)
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Enter listening; returns the new epoch
    pub fn begin(&self) -> u64 {
        self.restart_wanted.store(true, Ordering::SeqCst);
        self.listening.store(true, Ordering::SeqCst);
        lock(&self.error).take();
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Leave listening and clear the transcript; returns false if already idle
    pub fn end(&self) -> bool {
        self.restart_wanted.store(false, Ordering::SeqCst);
        let was_listening = self.listening.swap(false, Ordering::SeqCst);
        self.epoch.fetch_add(1, Ordering::SeqCst);
        lock(&self.transcript).clear();
        was_listening
    }

    /// Still listening in the session identified by `epoch`
    pub fn is_current(&self, epoch: u64) -> bool {
        self.is_listening() && self.epoch() == epoch
    }

    pub fn set_transcript(&self, text: &str) {
        let mut transcript = lock(&self.transcript);
        transcript.clear();
        transcript.push_str(text);
    }

    pub fn transcript(&self) -> String {
        lock(&self.transcript).clone()
    }

    pub fn set_error(&self, error: impl Into<String>) {
        *lock(&self.error) = Some(error.into());
    }

    pub fn error(&self) -> Option<String> {
        lock(&self.error).clone()
    }

    pub fn snapshot(&self, last_command: Option<String>) -> SessionState {
        SessionState {
            is_listening: self.is_listening(),
            is_supported: self.is_supported(),
            transcript: self.transcript(),
            last_command,
            error: self.error(),
        }
    }
}

impl fmt::Debug for RuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeState")
            .field("listening", &self.is_listening())
            .field("supported", &self.is_supported())
            .field("restart_wanted", &self.restart_wanted())
            .field("epoch", &self.epoch())
            .field("error", &self.error())
            .finish()
    }
}

/// Type alias for shared state
pub type SharedState = Arc<RuntimeState>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_end_cycle() {
        let state = RuntimeState::new(true);
        state.set_error("old failure");
        let epoch = state.begin();
        assert!(state.is_current(epoch));
        assert!(state.restart_wanted());
        assert_eq!(state.error(), None);

        state.set_transcript("ver cami");
        assert!(state.end());
        assert!(!state.is_current(epoch));
        assert!(!state.restart_wanted());
        assert_eq!(state.transcript(), "");
        assert!(!state.end());
    }

    #[test]
    fn test_snapshot_serializes() {
        let state = RuntimeState::new(false);
        let json = serde_json::to_value(state.snapshot(Some("camisetas".into()))).unwrap();
        assert_eq!(json["is_supported"], false);
        assert_eq!(json["last_command"], "camisetas");
    }
}
