use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use tracing::debug;

use crate::capture::Recording;
use crate::config::TranscriptionConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::stats::{SharedStats, StatKind, Timer};

/// Turns one recorded chunk into text
///
/// `Ok(None)` means the service heard no speech.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, recording: Recording) -> VoiceResult<Option<String>>;
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    #[serde(default)]
    text: Option<String>,
}

/// Client for an OpenAI-compatible `/audio/transcriptions` endpoint
pub struct HttpTranscriber {
    client: reqwest::Client,
    config: TranscriptionConfig,
    stats: Option<SharedStats>,
}

impl HttpTranscriber {
    pub fn new(config: TranscriptionConfig) -> Self {
        Self::with_stats(config, None)
    }

    pub fn with_stats(config: TranscriptionConfig, stats: Option<SharedStats>) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            stats,
        }
    }

    fn form(&self, recording: Recording) -> VoiceResult<Form> {
        let file = Part::bytes(recording.wav)
            .file_name("chunk.wav")
            .mime_str("audio/wav")
            .map_err(|e| VoiceError::Transcription(e.to_string()))?;
        let mut form = Form::new()
            .part("file", file)
            .text("model", self.config.model.clone());
        if !self.config.language.is_empty() {
            form = form.text("language", self.config.language.clone());
        }
        Ok(form)
    }
}

fn status_error(status: StatusCode, body: &str) -> VoiceError {
    let detail = format!("{} {}", status, body.trim());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => VoiceError::ServiceUnavailable(detail),
        _ => VoiceError::Transcription(detail),
    }
}

/// Missing, blank or whitespace-only text all mean silence
fn spoken_text(response: TranscriptionResponse) -> Option<String> {
    response
        .text
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

#[async_trait]
impl Transcriber for HttpTranscriber {
    async fn transcribe(&self, recording: Recording) -> VoiceResult<Option<String>> {
        let timer = self
            .stats
            .as_ref()
            .map(|s| Timer::new(s, StatKind::Transcription, recording.len()));

        let mut request = self
            .client
            .post(&self.config.endpoint)
            .multipart(self.form(recording)?);
        if let Some(key) = self.config.api_key.as_deref().filter(|k| !k.is_empty()) {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        let text = spoken_text(response.json::<TranscriptionResponse>().await?);
        debug!("Transcribed chunk: {:?}", text);
        if let Some(t) = timer {
            t.finish(text.as_ref().map_or(0, |s| s.len()));
        }
        Ok(text)
    }
}
