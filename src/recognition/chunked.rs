//! Chunked recognition: record a few seconds, transcribe, repeat

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{debug, error, warn};

use super::{RecognitionBackend, RecognitionError, RecognitionEvent, RecognitionMode};
use crate::capture::AudioRecorder;
use crate::config::SessionConfig;
use crate::error::VoiceResult;
use crate::stats::{self, SharedStats};
use crate::transcriber::Transcriber;

/// One chunk loop; `running` goes false on stop and `wake` cuts the
/// current recording short
struct ChunkRun {
    running: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl ChunkRun {
    fn halt(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.wake.notify_one();
    }
}

/// Backend for hosts without a streaming recognizer
///
/// A transcription in flight when the session stops is left to finish; its
/// text is dropped because the run flag is checked before sending.
pub struct ChunkedBackend {
    recorder: Arc<dyn AudioRecorder>,
    transcriber: Arc<dyn Transcriber>,
    chunk: Duration,
    timeout: Duration,
    stats: Option<SharedStats>,
    run: Mutex<Option<ChunkRun>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl ChunkedBackend {
    pub fn new(
        recorder: Arc<dyn AudioRecorder>,
        transcriber: Arc<dyn Transcriber>,
        config: &SessionConfig,
    ) -> Self {
        Self {
            recorder,
            transcriber,
            chunk: config.chunk_duration(),
            timeout: config.request_timeout(),
            stats: None,
            run: Mutex::new(None),
        }
    }

    pub fn with_stats(mut self, stats: SharedStats) -> Self {
        self.stats = Some(stats);
        self
    }
}

struct ChunkLoop {
    recorder: Arc<dyn AudioRecorder>,
    transcriber: Arc<dyn Transcriber>,
    chunk: Duration,
    timeout: Duration,
    stats: Option<SharedStats>,
    running: Arc<AtomicBool>,
    wake: Arc<Notify>,
    events: flume::Sender<RecognitionEvent>,
}

impl ChunkLoop {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn chunk_failed(&self) {
        if let Some(stats) = &self.stats {
            stats::record_failed_chunk(stats);
        }
    }

    /// Sleep for one chunk, or less if the run is halted
    async fn wait_chunk(&self) {
        tokio::select! {
            _ = tokio::time::sleep(self.chunk) => {}
            _ = self.wake.notified() => {}
        }
    }

    async fn run(self) {
        while self.is_running() {
            if let Err(e) = self.recorder.begin() {
                let e = RecognitionError::from(e);
                if e.is_fatal() {
                    error!("Could not start recording: {}", e);
                    let _ = self.events.send(RecognitionEvent::Error(e));
                    break;
                }
                // skip this cycle, try again after one chunk's worth of time
                warn!("Chunk recording failed to start: {}", e);
                self.chunk_failed();
                self.wait_chunk().await;
                continue;
            }

            self.wait_chunk().await;
            if !self.is_running() {
                self.recorder.discard();
                break;
            }

            let recording = match self.recorder.finish() {
                Ok(r) if r.is_empty() => {
                    debug!("Empty chunk, skipping");
                    continue;
                }
                Ok(r) => r,
                Err(e) => {
                    warn!("Chunk recording failed: {}", e);
                    self.chunk_failed();
                    continue;
                }
            };

            match tokio::time::timeout(self.timeout, self.transcriber.transcribe(recording)).await {
                Ok(Ok(Some(text))) => {
                    if self.is_running() {
                        if self.events.send(RecognitionEvent::Final(text)).is_err() {
                            break;
                        }
                    } else {
                        debug!("Session stopped, dropping chunk text {:?}", text);
                    }
                }
                Ok(Ok(None)) => debug!("No speech in chunk"),
                Ok(Err(e)) => {
                    warn!("Chunk transcription failed: {}", e);
                    self.chunk_failed();
                }
                Err(_) => {
                    warn!("Chunk transcription timed out after {:?}", self.timeout);
                    self.chunk_failed();
                }
            }
        }
        debug!("Chunk loop finished");
    }
}

#[async_trait]
impl RecognitionBackend for ChunkedBackend {
    fn mode(&self) -> RecognitionMode {
        RecognitionMode::Chunked
    }

    fn is_supported(&self) -> bool {
        true
    }

    async fn request_permission(&self) -> VoiceResult<()> {
        self.recorder.check_permission()
    }

    async fn start(&self, events: flume::Sender<RecognitionEvent>) -> VoiceResult<()> {
        let running = Arc::new(AtomicBool::new(true));
        let wake = Arc::new(Notify::new());

        let previous = lock(&self.run).replace(ChunkRun {
            running: Arc::clone(&running),
            wake: Arc::clone(&wake),
        });
        if let Some(previous) = previous {
            previous.halt();
        }

        let chunk_loop = ChunkLoop {
            recorder: Arc::clone(&self.recorder),
            transcriber: Arc::clone(&self.transcriber),
            chunk: self.chunk,
            timeout: self.timeout,
            stats: self.stats.clone(),
            running,
            wake,
            events,
        };
        tokio::spawn(chunk_loop.run());
        Ok(())
    }

    async fn stop(&self) {
        if let Some(run) = lock(&self.run).take() {
            run.halt();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::Recording;
    use crate::error::VoiceError;
    use std::sync::atomic::AtomicUsize;

    struct SilentRecorder;

    impl AudioRecorder for SilentRecorder {
        fn check_permission(&self) -> VoiceResult<()> {
            Ok(())
        }
        fn begin(&self) -> VoiceResult<()> {
            Ok(())
        }
        fn finish(&self) -> VoiceResult<Recording> {
            Ok(Recording::from_samples(&[0.0; 16], 16000))
        }
        fn discard(&self) {}
    }

    /// Fails every other chunk, otherwise hears the chunk number
    struct FlakyTranscriber {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Transcriber for FlakyTranscriber {
        async fn transcribe(&self, _recording: Recording) -> VoiceResult<Option<String>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n % 2 == 0 {
                Err(VoiceError::Network("connection reset".into()))
            } else {
                Ok(Some(format!("chunk {}", n)))
            }
        }
    }

    /// Second `begin` fails, every other one succeeds
    struct HiccupRecorder {
        begins: AtomicUsize,
        failure: VoiceError,
    }

    impl AudioRecorder for HiccupRecorder {
        fn check_permission(&self) -> VoiceResult<()> {
            Ok(())
        }
        fn begin(&self) -> VoiceResult<()> {
            if self.begins.fetch_add(1, Ordering::SeqCst) == 1 {
                Err(self.failure.clone())
            } else {
                Ok(())
            }
        }
        fn finish(&self) -> VoiceResult<Recording> {
            Ok(Recording::from_samples(&[0.0; 16], 16000))
        }
        fn discard(&self) {}
    }

    struct EchoTranscriber;

    #[async_trait]
    impl Transcriber for EchoTranscriber {
        async fn transcribe(&self, _recording: Recording) -> VoiceResult<Option<String>> {
            Ok(Some("hola".into()))
        }
    }

    fn hiccup_backend(failure: VoiceError) -> (ChunkedBackend, Arc<HiccupRecorder>, SharedStats) {
        let recorder = Arc::new(HiccupRecorder {
            begins: AtomicUsize::new(0),
            failure,
        });
        let stats = stats::new_shared();
        let backend = ChunkedBackend::new(
            recorder.clone(),
            Arc::new(EchoTranscriber),
            &SessionConfig::default(),
        )
        .with_stats(Arc::clone(&stats));
        (backend, recorder, stats)
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_begin_failure_skips_one_cycle() {
        let (backend, recorder, stats) = hiccup_backend(VoiceError::Network("route lost".into()));
        let (tx, rx) = flume::unbounded();
        backend.start(tx).await.unwrap();

        assert_eq!(rx.recv_async().await.unwrap(), RecognitionEvent::Final("hola".into()));
        assert_eq!(rx.recv_async().await.unwrap(), RecognitionEvent::Final("hola".into()));
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(recorder.begins.load(Ordering::SeqCst) > 5);
        assert_eq!(stats.lock().unwrap().failed_chunks, 1);
        backend.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_begin_failure_ends_the_loop() {
        let (backend, recorder, _) = hiccup_backend(VoiceError::NoInputDevice);
        let (tx, rx) = flume::unbounded();
        backend.start(tx).await.unwrap();

        assert_eq!(rx.recv_async().await.unwrap(), RecognitionEvent::Final("hola".into()));
        match rx.recv_async().await.unwrap() {
            RecognitionEvent::Error(e) => assert!(e.is_fatal()),
            other => panic!("unexpected {:?}", other),
        }
        assert!(rx.recv_async().await.is_err());
        assert_eq!(recorder.begins.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_chunks_do_not_stop_the_loop() {
        let stats = stats::new_shared();
        let backend = ChunkedBackend::new(
            Arc::new(SilentRecorder),
            Arc::new(FlakyTranscriber {
                calls: AtomicUsize::new(0),
            }),
            &SessionConfig::default(),
        )
        .with_stats(Arc::clone(&stats));

        let (tx, rx) = flume::unbounded();
        backend.start(tx).await.unwrap();

        assert_eq!(rx.recv_async().await.unwrap(), RecognitionEvent::Final("chunk 1".into()));
        assert_eq!(rx.recv_async().await.unwrap(), RecognitionEvent::Final("chunk 3".into()));
        backend.stop().await;

        assert!(stats.lock().unwrap().failed_chunks >= 2);
    }
}
