use anyhow::Context;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "probador.toml";

#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub transcription: TranscriptionConfig,
    #[serde(default)]
    pub speech: SpeechConfig,
    /// Commands registered by the command-line demo
    #[serde(default)]
    pub commands: Vec<CommandConfig>,
}

// ============================================================================
// Dispatch Config
// ============================================================================

#[derive(Debug, Deserialize, Clone)]
pub struct DispatchConfig {
    /// Normalized utterances shorter than this are discarded
    #[serde(default = "default_min_length")]
    pub min_length: usize,

    /// Identical utterances within this window are processed once
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,

    /// A match must score strictly above this to fire
    #[serde(default = "default_min_score")]
    pub min_score: f64,

    /// Delay between the spoken acknowledgment and the action
    #[serde(default = "default_action_delay_ms")]
    pub action_delay_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            min_length: default_min_length(),
            cooldown_ms: default_cooldown_ms(),
            min_score: default_min_score(),
            action_delay_ms: default_action_delay_ms(),
        }
    }
}

impl DispatchConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn action_delay(&self) -> Duration {
        Duration::from_millis(self.action_delay_ms)
    }
}

fn default_min_length() -> usize {
    2
}

fn default_cooldown_ms() -> u64 {
    6000
}

fn default_min_score() -> f64 {
    30.0
}

fn default_action_delay_ms() -> u64 {
    100
}

// ============================================================================
// Session Config
// ============================================================================

#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    /// Pause before restarting a recognizer that ended on its own
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,

    /// Length of each recording in chunked mode
    #[serde(default = "default_chunk_ms")]
    pub chunk_ms: u64,

    /// Upper bound on one chunk's transcription request
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Spoken when listening starts; empty disables it
    #[serde(default = "default_listening_ack")]
    pub listening_ack: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            restart_delay_ms: default_restart_delay_ms(),
            chunk_ms: default_chunk_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            listening_ack: default_listening_ack(),
        }
    }
}

impl SessionConfig {
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn chunk_duration(&self) -> Duration {
        Duration::from_millis(self.chunk_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn default_restart_delay_ms() -> u64 {
    300
}

fn default_chunk_ms() -> u64 {
    3000
}

fn default_request_timeout_ms() -> u64 {
    15000
}

fn default_listening_ack() -> String {
    "Escuchando".into()
}

// ============================================================================
// Transcription Config
// ============================================================================

#[derive(Debug, Deserialize, Clone)]
pub struct TranscriptionConfig {
    /// OpenAI-compatible `/audio/transcriptions` URL
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Bearer token (supports ${ENV_VAR} syntax)
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_language")]
    pub language: String,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            api_key: None,
            model: default_model(),
            language: default_language(),
        }
    }
}

fn default_endpoint() -> String {
    "http://localhost:8000/v1/audio/transcriptions".into()
}

fn default_model() -> String {
    "whisper-1".into()
}

fn default_language() -> String {
    "es".into()
}

// ============================================================================
// Speech Config
// ============================================================================

#[derive(Debug, Deserialize, Clone)]
pub struct SpeechConfig {
    #[serde(default = "default_speech_enabled")]
    pub enabled: bool,

    /// Text-to-speech program invoked per utterance
    #[serde(default = "default_program")]
    pub program: String,

    #[serde(default = "default_voice")]
    pub voice: String,

    /// Speaking rate multiplier (1.0 = normal)
    #[serde(default = "default_rate")]
    pub rate: f32,

    /// Pitch multiplier (1.0 = normal)
    #[serde(default = "default_pitch")]
    pub pitch: f32,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            enabled: default_speech_enabled(),
            program: default_program(),
            voice: default_voice(),
            rate: default_rate(),
            pitch: default_pitch(),
        }
    }
}

fn default_speech_enabled() -> bool {
    true
}

fn default_program() -> String {
    "espeak-ng".into()
}

fn default_voice() -> String {
    "es".into()
}

fn default_rate() -> f32 {
    1.0
}

fn default_pitch() -> f32 {
    1.0
}

// ============================================================================
// Commands Config
// ============================================================================

#[derive(Debug, Deserialize, Clone)]
pub struct CommandConfig {
    pub id: String,
    pub patterns: Vec<String>,
    #[serde(default)]
    pub acknowledgment: Option<String>,
    /// Printed when the command fires
    #[serde(default)]
    pub reply: Option<String>,
}

/// Expand ${VAR} to environment variable values
fn expand_env_vars(s: &str) -> String {
    let mut result = s.to_string();

    while let Some(start) = result.find("${") {
        if let Some(end) = result[start..].find('}') {
            let var_name = &result[start + 2..start + end];
            let value = std::env::var(var_name).unwrap_or_else(|_| {
                tracing::warn!("Environment variable '{}' not found", var_name);
                String::new()
            });
            result.replace_range(start..start + end + 1, &value);
        } else {
            break;
        }
    }

    result
}

impl Config {
    /// Load from `path`; a missing file yields the defaults
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let text = fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            Self::parse(&text).with_context(|| format!("parsing {}", path.display()))?
        } else {
            tracing::info!("No config at {}, using defaults", path.display());
            Config::default()
        };

        config.resolve_env();
        Ok(config)
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if !(0.0..=100.0).contains(&self.dispatch.min_score) {
            anyhow::bail!("dispatch.min_score must be within 0-100");
        }
        if self.session.chunk_ms == 0 {
            anyhow::bail!("session.chunk_ms must be positive");
        }
        for cmd in &self.commands {
            if cmd.id.trim().is_empty() {
                anyhow::bail!("command ids must not be empty");
            }
        }
        Ok(())
    }

    fn resolve_env(&mut self) {
        if let Some(key) = &mut self.transcription.api_key {
            *key = expand_env_vars(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.dispatch.min_length, 2);
        assert_eq!(config.dispatch.cooldown(), Duration::from_secs(6));
        assert_eq!(config.dispatch.min_score, 30.0);
        assert_eq!(config.dispatch.action_delay(), Duration::from_millis(100));
        assert_eq!(config.session.restart_delay(), Duration::from_millis(300));
        assert_eq!(config.session.chunk_duration(), Duration::from_secs(3));
        assert_eq!(config.session.request_timeout(), Duration::from_secs(15));
        assert_eq!(config.speech.voice, "es");
        assert_eq!(config.transcription.language, "es");
    }

    #[test]
    fn test_partial_file() {
        let config = Config::parse(
            r#"
            [dispatch]
            cooldown_ms = 2000

            [[commands]]
            id = "catalog.shirts"
            patterns = ["camisetas", "ver camisetas"]
            acknowledgment = "Mostrando camisetas"
            "#,
        )
        .unwrap();
        assert_eq!(config.dispatch.cooldown_ms, 2000);
        assert_eq!(config.dispatch.min_score, 30.0);
        assert_eq!(config.commands.len(), 1);
        assert_eq!(config.commands[0].patterns[1], "ver camisetas");
        assert!(config.commands[0].reply.is_none());
    }

    #[test]
    fn test_invalid_score_rejected() {
        assert!(Config::parse("[dispatch]\nmin_score = 140.0\n").is_err());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path().join("absent.toml")).unwrap();
        assert!(config.commands.is_empty());
    }

    #[test]
    fn test_env_expansion() {
        // SAFETY: single test touching this variable
        unsafe { std::env::set_var("PROBADOR_TEST_KEY", "secret") };
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[transcription]\napi_key = \"${{PROBADOR_TEST_KEY}}\"").unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.transcription.api_key.as_deref(), Some("secret"));
    }

    #[test]
    fn test_malformed_file_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[dispatch\ncooldown_ms = ").unwrap();
        assert!(Config::load(file.path()).is_err());
    }
}
