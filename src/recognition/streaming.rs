//! Continuous recognition on top of a streaming speech engine

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::LinesStream;
use tracing::debug;

use super::{
    RecognitionBackend, RecognitionError, RecognitionErrorKind, RecognitionEvent, RecognitionMode,
};
use crate::error::{VoiceError, VoiceResult};

/// One recognizer result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeechResult {
    pub text: String,
    pub is_final: bool,
}

impl SpeechResult {
    pub fn partial(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: false,
        }
    }

    pub fn complete(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: true,
        }
    }

    fn into_event(self) -> RecognitionEvent {
        if self.is_final {
            RecognitionEvent::Final(self.text)
        } else {
            RecognitionEvent::Partial(self.text)
        }
    }
}

/// A host speech recognizer
///
/// `recognize` is one recognition run: it pushes results until the engine
/// decides to stop and then returns. Dropping the future cancels the run.
#[async_trait]
pub trait StreamingEngine: Send + Sync {
    fn is_available(&self) -> bool {
        true
    }

    async fn request_permission(&self) -> VoiceResult<()> {
        Ok(())
    }

    async fn recognize(&self, results: flume::Sender<SpeechResult>) -> Result<(), RecognitionError>;
}

/// Continuous-mode backend. Every run reports its end, so the session can
/// decide whether to restart it.
pub struct StreamingBackend {
    engine: Arc<dyn StreamingEngine>,
    run: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl StreamingBackend {
    pub fn new(engine: Arc<dyn StreamingEngine>) -> Self {
        Self {
            engine,
            run: Mutex::new(None),
        }
    }
}

#[async_trait]
impl RecognitionBackend for StreamingBackend {
    fn mode(&self) -> RecognitionMode {
        RecognitionMode::Continuous
    }

    fn is_supported(&self) -> bool {
        self.engine.is_available()
    }

    async fn request_permission(&self) -> VoiceResult<()> {
        self.engine.request_permission().await
    }

    async fn start(&self, events: flume::Sender<RecognitionEvent>) -> VoiceResult<()> {
        if !self.engine.is_available() {
            return Err(VoiceError::Unsupported);
        }

        let engine = Arc::clone(&self.engine);
        let task = tokio::spawn(async move {
            let (tx, rx) = flume::unbounded::<SpeechResult>();
            let forward = async {
                while let Ok(result) = rx.recv_async().await {
                    if events.send(result.into_event()).is_err() {
                        break;
                    }
                }
            };
            let (outcome, ()) = tokio::join!(engine.recognize(tx), forward);
            if let Err(e) = outcome {
                let _ = events.send(RecognitionEvent::Error(e));
            }
            let _ = events.send(RecognitionEvent::Ended);
        });

        if let Some(previous) = lock(&self.run).replace(task) {
            previous.abort();
        }
        Ok(())
    }

    async fn stop(&self) {
        if let Some(task) = lock(&self.run).take() {
            task.abort();
        }
    }
}

// ============================================================================
// Line engine
// ============================================================================

/// Treats each line of a text stream as something the user said
///
/// - `text` is a final result, `~text` a partial one
/// - `!kind [message]` reports a recognizer error (`!no-speech`, `!network`..)
///   and ends the run
/// - a blank line ends the run without error
///
/// End of input is reported as an `audio-capture` error, which ends the
/// session.
pub struct LineEngine<R> {
    lines: tokio::sync::Mutex<LinesStream<BufReader<R>>>,
    closed: AtomicBool,
}

impl<R: AsyncRead + Unpin + Send + 'static> LineEngine<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: tokio::sync::Mutex::new(LinesStream::new(BufReader::new(reader).lines())),
            closed: AtomicBool::new(false),
        }
    }
}

impl LineEngine<tokio::io::Stdin> {
    pub fn stdin() -> Self {
        Self::new(tokio::io::stdin())
    }
}

enum Line {
    Result(SpeechResult),
    Failure(RecognitionError),
}

fn parse_line(line: &str) -> Line {
    if let Some(partial) = line.strip_prefix('~') {
        return Line::Result(SpeechResult::partial(partial.trim()));
    }
    if let Some(rest) = line.strip_prefix('!') {
        let (name, message) = rest.split_once(' ').unwrap_or((rest, ""));
        if let Some(kind) = RecognitionErrorKind::parse(name) {
            return Line::Failure(RecognitionError::new(kind, message.trim()));
        }
    }
    Line::Result(SpeechResult::complete(line))
}

fn input_closed() -> RecognitionError {
    RecognitionError::new(RecognitionErrorKind::AudioCapture, "input closed")
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send + 'static> StreamingEngine for LineEngine<R> {
    async fn recognize(&self, results: flume::Sender<SpeechResult>) -> Result<(), RecognitionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(input_closed());
        }

        let mut lines = self.lines.lock().await;
        while let Some(line) = lines.next().await {
            let line = line
                .map_err(|e| RecognitionError::new(RecognitionErrorKind::AudioCapture, e.to_string()))?;
            let line = line.trim();
            if line.is_empty() {
                debug!("Line engine: end of run");
                return Ok(());
            }
            match parse_line(line) {
                Line::Result(result) => {
                    if results.send(result).is_err() {
                        return Ok(());
                    }
                }
                Line::Failure(e) => return Err(e),
            }
        }

        self.closed.store(true, Ordering::SeqCst);
        Err(input_closed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect_run(backend: &StreamingBackend) -> Vec<RecognitionEvent> {
        let (tx, rx) = flume::unbounded();
        backend.start(tx).await.unwrap();
        let mut events = Vec::new();
        while let Ok(event) = rx.recv_async().await {
            let ended = event == RecognitionEvent::Ended;
            events.push(event);
            if ended {
                break;
            }
        }
        events
    }

    fn backend(input: &'static str) -> StreamingBackend {
        StreamingBackend::new(Arc::new(LineEngine::new(input.as_bytes())))
    }

    #[tokio::test]
    async fn test_runs_split_on_blank_lines() {
        let backend = backend("~ver cami\nver camisetas\n\nmostrar pantalones\n");

        assert_eq!(
            collect_run(&backend).await,
            vec![
                RecognitionEvent::Partial("ver cami".into()),
                RecognitionEvent::Final("ver camisetas".into()),
                RecognitionEvent::Ended,
            ]
        );

        let second = collect_run(&backend).await;
        assert_eq!(second[0], RecognitionEvent::Final("mostrar pantalones".into()));
        assert!(matches!(&second[1], RecognitionEvent::Error(e) if e.is_fatal()));
        assert_eq!(second[2], RecognitionEvent::Ended);
    }

    #[tokio::test]
    async fn test_error_lines() {
        let backend = backend("!no-speech\n!not-allowed blocked by user\n");

        let first = collect_run(&backend).await;
        assert!(matches!(&first[0], RecognitionEvent::Error(e) if e.kind == RecognitionErrorKind::NoSpeech));

        let second = collect_run(&backend).await;
        match &second[0] {
            RecognitionEvent::Error(e) => {
                assert_eq!(e.kind, RecognitionErrorKind::NotAllowed);
                assert_eq!(e.message, "blocked by user");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_bang_is_speech() {
        match parse_line("!hola") {
            Line::Result(r) => assert_eq!(r, SpeechResult::complete("!hola")),
            Line::Failure(_) => panic!("not an error kind"),
        }
    }
}
