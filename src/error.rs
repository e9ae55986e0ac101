//! Error taxonomy for the listening session and its collaborators

use thiserror::Error;

/// Errors surfaced by recognition backends, recorders and transcribers
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VoiceError {
    /// Speech recognition is not available on this platform
    #[error("speech recognition is not supported on this platform")]
    Unsupported,

    /// The user declined microphone access
    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),

    /// No audio input hardware
    #[error("no audio input device available")]
    NoInputDevice,

    /// Capture failed after the device was opened
    #[error("audio capture failed: {0}")]
    AudioCapture(String),

    /// The recognition or transcription service refused to serve us
    #[error("recognition service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("transcription timed out after {0} ms")]
    Timeout(u64),

    /// The transcription endpoint answered with something we could not use
    #[error("transcription failed: {0}")]
    Transcription(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl VoiceError {
    /// Fatal errors end the session and suppress auto-restart
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            VoiceError::Unsupported
                | VoiceError::PermissionDenied(_)
                | VoiceError::NoInputDevice
                | VoiceError::AudioCapture(_)
                | VoiceError::ServiceUnavailable(_)
                | VoiceError::Config(_)
        )
    }
}

impl From<reqwest::Error> for VoiceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            VoiceError::Timeout(0)
        } else if e.is_decode() {
            VoiceError::Transcription(e.to_string())
        } else {
            VoiceError::Network(e.to_string())
        }
    }
}

pub type VoiceResult<T> = Result<T, VoiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(VoiceError::PermissionDenied("denied".into()).is_fatal());
        assert!(VoiceError::NoInputDevice.is_fatal());
        assert!(VoiceError::ServiceUnavailable("503".into()).is_fatal());
        assert!(!VoiceError::Network("reset".into()).is_fatal());
        assert!(!VoiceError::Timeout(15000).is_fatal());
        assert!(!VoiceError::Transcription("bad json".into()).is_fatal());
    }
}
