//! Speech recognition backends
//!
//! A session drives exactly one backend, picked at startup:
//! - `StreamingBackend`: a continuous recognizer reporting partial and final
//!   results, ending its run now and then (the session restarts it)
//! - `ChunkedBackend`: fixed-length recordings sent to a transcription
//!   service, one final result per chunk
//!
//! Backends report through a `flume` channel of `RecognitionEvent`s.

pub mod chunked;
pub mod streaming;

pub use chunked::ChunkedBackend;
pub use streaming::{LineEngine, SpeechResult, StreamingBackend, StreamingEngine};

use std::fmt;

use async_trait::async_trait;

use crate::error::{VoiceError, VoiceResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecognitionMode {
    Continuous,
    Chunked,
}

/// Recognizer error categories
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecognitionErrorKind {
    NoSpeech,
    Aborted,
    Network,
    Grammar,
    AudioCapture,
    NotAllowed,
    ServiceNotAllowed,
}

impl RecognitionErrorKind {
    /// Fatal kinds stop the session; the rest are logged and recognition goes on
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            RecognitionErrorKind::AudioCapture
                | RecognitionErrorKind::NotAllowed
                | RecognitionErrorKind::ServiceNotAllowed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RecognitionErrorKind::NoSpeech => "no-speech",
            RecognitionErrorKind::Aborted => "aborted",
            RecognitionErrorKind::Network => "network",
            RecognitionErrorKind::Grammar => "bad-grammar",
            RecognitionErrorKind::AudioCapture => "audio-capture",
            RecognitionErrorKind::NotAllowed => "not-allowed",
            RecognitionErrorKind::ServiceNotAllowed => "service-not-allowed",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "no-speech" => RecognitionErrorKind::NoSpeech,
            "aborted" => RecognitionErrorKind::Aborted,
            "network" => RecognitionErrorKind::Network,
            "bad-grammar" => RecognitionErrorKind::Grammar,
            "audio-capture" => RecognitionErrorKind::AudioCapture,
            "not-allowed" => RecognitionErrorKind::NotAllowed,
            "service-not-allowed" => RecognitionErrorKind::ServiceNotAllowed,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecognitionError {
    pub kind: RecognitionErrorKind,
    pub message: String,
}

impl RecognitionError {
    pub fn new(kind: RecognitionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind.is_fatal()
    }
}

impl fmt::Display for RecognitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            f.write_str(self.kind.as_str())
        } else {
            write!(f, "{}: {}", self.kind.as_str(), self.message)
        }
    }
}

impl From<VoiceError> for RecognitionError {
    fn from(e: VoiceError) -> Self {
        let kind = match &e {
            VoiceError::PermissionDenied(_) => RecognitionErrorKind::NotAllowed,
            VoiceError::NoInputDevice | VoiceError::AudioCapture(_) => {
                RecognitionErrorKind::AudioCapture
            }
            VoiceError::Unsupported | VoiceError::ServiceUnavailable(_) | VoiceError::Config(_) => {
                RecognitionErrorKind::ServiceNotAllowed
            }
            VoiceError::Network(_) | VoiceError::Timeout(_) => RecognitionErrorKind::Network,
            VoiceError::Transcription(_) => RecognitionErrorKind::NoSpeech,
        };
        Self::new(kind, e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionEvent {
    /// Interim text, display only
    Partial(String),
    /// Finished utterance, ready for dispatch
    Final(String),
    Error(RecognitionError),
    /// The recognizer stopped on its own
    Ended,
}

#[async_trait]
pub trait RecognitionBackend: Send + Sync {
    fn mode(&self) -> RecognitionMode;

    /// Checked once when the session is built
    fn is_supported(&self) -> bool;

    /// Ask for microphone access before the first start
    async fn request_permission(&self) -> VoiceResult<()>;

    /// Begin recognizing; events flow until `stop` or the backend ends itself
    async fn start(&self, events: flume::Sender<RecognitionEvent>) -> VoiceResult<()>;

    /// Stop recognizing. Must not block on in-flight work.
    async fn stop(&self);
}
