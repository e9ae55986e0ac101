//! Voice command dispatch for the fitting-room app
//!
//! Spoken phrases come in from a recognition backend, are normalized and
//! fuzzily matched against the commands the current screen registered, and
//! the best match runs once.

pub mod capture;
pub mod command;
pub mod config;
pub mod error;
pub mod fuzzy;
pub mod recognition;
pub mod registry;
pub mod session;
pub mod state;
pub mod stats;
pub mod transcriber;
pub mod tts;

pub use command::{CommandDispatcher, CommandMatch, DispatchOutcome};
pub use config::Config;
pub use error::{VoiceError, VoiceResult};
pub use registry::{CommandAction, CommandDefinition, CommandRegistry, CommandScope};
pub use session::{ListeningSession, SessionEvent};
pub use state::SessionState;
