use std::process::{Command, Stdio};
use std::thread;

use anyhow::Context;
use tracing::{debug, info, warn};

use crate::config::SpeechConfig;

/// Fire-and-forget text-to-speech output
///
/// `speak` must return quickly; playback happens in the background.
pub trait SpeechSink: Send + Sync {
    fn speak(&self, text: &str) -> anyhow::Result<()>;
}

/// Speak `text`, logging instead of failing
pub fn speak_logged(sink: &dyn SpeechSink, text: &str) {
    if let Err(e) = sink.speak(text) {
        warn!("Speech output failed: {:#}", e);
    }
}

// ============================================================================
// Log-only sink
// ============================================================================

/// Sink for hosts without audio output; the text only goes to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSpeech;

impl SpeechSink for LogSpeech {
    fn speak(&self, text: &str) -> anyhow::Result<()> {
        info!("🔈 {}", text);
        Ok(())
    }
}

// ============================================================================
// External program sink
// ============================================================================

/// Words per minute at rate 1.0
const BASE_WPM: f32 = 175.0;
/// Program pitch at pitch 1.0 (range 0-99)
const BASE_PITCH: f32 = 50.0;

/// Speaks through a system TTS program such as `espeak-ng`
///
/// Each utterance spawns one process; a reaper thread waits for it so
/// failures show up in the log without blocking the caller.
#[derive(Debug, Clone)]
pub struct CommandSpeech {
    program: String,
    voice: String,
    rate: f32,
    pitch: f32,
}

impl CommandSpeech {
    pub fn new(config: &SpeechConfig) -> Self {
        Self {
            program: config.program.clone(),
            voice: config.voice.clone(),
            rate: config.rate,
            pitch: config.pitch,
        }
    }

    fn args(&self, text: &str) -> Vec<String> {
        let wpm = (BASE_WPM * self.rate).round().max(80.0) as u32;
        let pitch = (BASE_PITCH * self.pitch).round().clamp(0.0, 99.0) as u32;
        vec![
            "-v".to_string(),
            self.voice.clone(),
            "-s".to_string(),
            wpm.to_string(),
            "-p".to_string(),
            pitch.to_string(),
            text.to_string(),
        ]
    }
}

impl SpeechSink for CommandSpeech {
    fn speak(&self, text: &str) -> anyhow::Result<()> {
        debug!("Speaking via {}: {}", self.program, text);
        let mut child = Command::new(&self.program)
            .args(self.args(text))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("spawning {}", self.program))?;

        let program = self.program.clone();
        thread::spawn(move || match child.wait() {
            Ok(status) if !status.success() => warn!("{} exited with {}", program, status),
            Ok(_) => {}
            Err(e) => warn!("Waiting for {} failed: {}", program, e),
        });
        Ok(())
    }
}

/// Build the sink described by the config
pub fn from_config(config: &SpeechConfig) -> Box<dyn SpeechSink> {
    if config.enabled {
        Box::new(CommandSpeech::new(config))
    } else {
        Box::new(LogSpeech)
    }
}
