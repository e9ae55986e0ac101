//! Listening session - owns the recognition backend and feeds the dispatcher
//!
//! Idle --start()--> Listening --stop()/fatal error--> Idle
//!
//! While listening, a pump task drains the backend's events: partial text
//! only updates the transcript, final text goes to the dispatcher. When a
//! continuous backend ends on its own, the session restarts it after a short
//! delay unless `stop()` was called in the meantime.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::command::{CommandDispatcher, CommandMatch, DispatchOutcome};
use crate::config::SessionConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::recognition::{RecognitionBackend, RecognitionEvent, RecognitionMode};
use crate::state::{RuntimeState, SessionState, SharedState};
use crate::tts::speak_logged;

#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    Started,
    Stopped,
    Partial(String),
    Final(String),
    CommandMatched(CommandMatch),
    /// User-facing failure; fatal ones have already stopped the session
    Error { message: String, fatal: bool },
    NotSupported,
    /// The backend ended on its own and will be restarted
    Restarting,
}

#[derive(Default)]
struct Tasks {
    pump: Option<JoinHandle<()>>,
    restart: Option<JoinHandle<()>>,
    /// Feeds the current pump; restarts hand a clone to the backend
    events: Option<flume::Sender<RecognitionEvent>>,
}

struct Inner {
    backend: Arc<dyn RecognitionBackend>,
    dispatcher: Arc<CommandDispatcher>,
    config: SessionConfig,
    state: SharedState,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
    tasks: Mutex<Tasks>,
}

/// Handle to the listening session; clones share the same session
#[derive(Clone)]
pub struct ListeningSession {
    inner: Arc<Inner>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl ListeningSession {
    pub fn new(
        backend: Arc<dyn RecognitionBackend>,
        dispatcher: Arc<CommandDispatcher>,
        config: SessionConfig,
        event_tx: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let state = RuntimeState::new(backend.is_supported());
        Self {
            inner: Arc::new(Inner {
                backend,
                dispatcher,
                config,
                state,
                event_tx,
                tasks: Mutex::new(Tasks::default()),
            }),
        }
    }

    pub fn is_listening(&self) -> bool {
        self.inner.state.is_listening()
    }

    pub fn is_supported(&self) -> bool {
        self.inner.state.is_supported()
    }

    pub fn mode(&self) -> RecognitionMode {
        self.inner.backend.mode()
    }

    pub fn dispatcher(&self) -> &Arc<CommandDispatcher> {
        &self.inner.dispatcher
    }

    pub fn snapshot(&self) -> SessionState {
        self.inner.state.snapshot(self.inner.dispatcher.last_command())
    }

    /// Start listening. Already listening is a no-op, and a `stop()` that
    /// lands while this is still starting wins.
    ///
    /// Returns the error that kept the session idle: `Unsupported`, a denied
    /// permission, or a backend that refused to start.
    pub async fn start(&self) -> VoiceResult<()> {
        let inner = &self.inner;
        if inner.state.is_listening() {
            debug!("Already listening");
            return Ok(());
        }
        if !inner.state.is_supported() {
            warn!("Speech recognition not supported");
            inner.state.set_error(VoiceError::Unsupported.to_string());
            inner.emit(SessionEvent::NotSupported);
            return Err(VoiceError::Unsupported);
        }

        let asked_at = inner.state.epoch();
        if let Err(e) = inner.backend.request_permission().await {
            warn!("Microphone permission: {}", e);
            inner.state.set_error(e.to_string());
            inner.emit(SessionEvent::Error {
                message: e.to_string(),
                fatal: true,
            });
            return Err(e);
        }
        if inner.state.is_listening() {
            return Ok(());
        }
        if inner.state.epoch() != asked_at {
            debug!("Stopped while asking for permission, not starting");
            return Ok(());
        }

        let epoch = inner.state.begin();
        if !inner.config.listening_ack.trim().is_empty() {
            speak_logged(inner.dispatcher.speech(), &inner.config.listening_ack);
        }

        let (tx, rx) = flume::unbounded();
        lock(&inner.tasks).events = Some(tx.clone());
        if let Err(e) = inner.backend.start(tx).await {
            error!("Recognition failed to start: {}", e);
            inner.state.end();
            inner.state.set_error(e.to_string());
            lock(&inner.tasks).events = None;
            inner.emit(SessionEvent::Error {
                message: e.to_string(),
                fatal: true,
            });
            return Err(e);
        }
        if !inner.state.is_current(epoch) {
            debug!("Stopped while recognition was starting");
            inner.backend.stop().await;
            return Ok(());
        }

        let pump = tokio::spawn(Arc::clone(inner).pump(epoch, rx));
        if let Some(old) = lock(&inner.tasks).pump.replace(pump) {
            old.abort();
        }

        info!("Listening ({:?})", inner.backend.mode());
        inner.emit(SessionEvent::Started);
        Ok(())
    }

    /// Stop listening. Idle is a no-op.
    ///
    /// `is_listening()` is false as soon as this is called; a chunk still
    /// being transcribed is allowed to finish but its text is dropped.
    pub async fn stop(&self) {
        let inner = &self.inner;
        if !inner.state.end() {
            return;
        }

        let tasks = std::mem::take(&mut *lock(&inner.tasks));
        if let Some(restart) = tasks.restart {
            restart.abort();
        }
        if let Some(pump) = tasks.pump {
            pump.abort();
        }
        inner.backend.stop().await;

        info!("Stopped listening");
        inner.emit(SessionEvent::Stopped);
    }
}

impl Inner {
    fn emit(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event);
    }

    async fn pump(self: Arc<Self>, epoch: u64, events: flume::Receiver<RecognitionEvent>) {
        while let Ok(event) = events.recv_async().await {
            if !self.state.is_current(epoch) {
                debug!("Dropping {:?} from a finished session", event);
                break;
            }

            match event {
                RecognitionEvent::Partial(text) => {
                    self.state.set_transcript(&text);
                    self.emit(SessionEvent::Partial(text));
                }
                RecognitionEvent::Final(text) => {
                    self.state.set_transcript(&text);
                    self.emit(SessionEvent::Final(text.clone()));
                    if let DispatchOutcome::Matched(found) =
                        self.dispatcher.process_transcript(&text)
                    {
                        self.emit(SessionEvent::CommandMatched(found));
                    }
                }
                RecognitionEvent::Error(e) if e.is_fatal() => {
                    error!("Recognition error: {}", e);
                    if let Some(restart) = lock(&self.tasks).restart.take() {
                        restart.abort();
                    }
                    self.fail(e.to_string()).await;
                    break;
                }
                RecognitionEvent::Error(e) => {
                    warn!("Recognition error: {}", e);
                }
                RecognitionEvent::Ended => self.schedule_restart(epoch),
            }
        }
    }

    fn schedule_restart(self: &Arc<Self>, epoch: u64) {
        if !self.state.is_current(epoch) || !self.state.restart_wanted() {
            return;
        }

        let delay = self.config.restart_delay();
        debug!("Recognition ended, restarting in {:?}", delay);
        self.emit(SessionEvent::Restarting);

        let inner = Arc::clone(self);
        let restart = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !inner.state.is_current(epoch) || !inner.state.restart_wanted() {
                return;
            }
            let Some(events) = lock(&inner.tasks).events.clone() else {
                return;
            };
            if let Err(e) = inner.backend.start(events).await {
                error!("Recognition failed to restart: {}", e);
                inner.fail(e.to_string()).await;
            }
        });

        if let Some(old) = lock(&self.tasks).restart.replace(restart) {
            old.abort();
        }
    }

    /// Fatal error: go idle, remember why and never restart
    async fn fail(&self, message: String) {
        if !self.state.end() {
            return;
        }
        self.state.set_error(message.clone());
        lock(&self.tasks).events = None;
        self.backend.stop().await;

        self.emit(SessionEvent::Error {
            message,
            fatal: true,
        });
        self.emit(SessionEvent::Stopped);
    }
}
