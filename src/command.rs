//! Command dispatch - turns a finished utterance into at most one action
//!
//! Every utterance is normalized, checked against the duplicate window and
//! scored against every pattern of every registered command:
//! 1. Exact match - score 100, scanning stops
//! 2. Fuzzy similarity (containment, word overlap)
//! 3. Pattern embedded in a longer sentence
//!
//! The best score wins if it is strictly above the threshold. Its
//! acknowledgment is spoken first and the action runs on a spawned task
//! after a short delay.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::FutureExt;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::DispatchConfig;
use crate::fuzzy::{EXACT_SCORE, embedded_score, normalize, similarity_normalized};
use crate::registry::{CommandDefinition, CommandRegistry};
use crate::stats::{self, SharedStats, StatKind, Timer};
use crate::tts::{SpeechSink, speak_logged};

/// The command a phrase resolved to
#[derive(Debug, Clone, PartialEq)]
pub struct CommandMatch {
    pub id: String,
    /// Pattern as registered, before normalization
    pub pattern: String,
    pub score: f64,
}

/// What `process_transcript` decided
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Empty or too short after normalization
    Discarded,
    /// Same text already processed within the cooldown window
    Duplicate,
    /// Nothing scored above the threshold; `best` is the runner-up if any
    NoMatch { best: Option<CommandMatch> },
    /// A command fired
    Matched(CommandMatch),
}

impl DispatchOutcome {
    pub fn matched(&self) -> Option<&CommandMatch> {
        match self {
            DispatchOutcome::Matched(m) => Some(m),
            _ => None,
        }
    }
}

struct Candidate {
    found: CommandMatch,
    definition: Arc<CommandDefinition>,
}

/// Matches utterances against the registry and runs the winning action
pub struct CommandDispatcher {
    registry: CommandRegistry,
    speech: Arc<dyn SpeechSink>,
    config: DispatchConfig,
    /// Last normalized utterance and when it was processed
    last_processed: Mutex<Option<(String, Instant)>>,
    last_command: Mutex<Option<String>>,
    stats: Option<SharedStats>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl CommandDispatcher {
    pub fn new(registry: CommandRegistry, speech: Arc<dyn SpeechSink>, config: DispatchConfig) -> Self {
        Self {
            registry,
            speech,
            config,
            last_processed: Mutex::new(None),
            last_command: Mutex::new(None),
            stats: None,
        }
    }

    pub fn with_stats(mut self, stats: SharedStats) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    pub(crate) fn speech(&self) -> &dyn SpeechSink {
        self.speech.as_ref()
    }

    /// Pattern of the most recent command that fired
    pub fn last_command(&self) -> Option<String> {
        lock(&self.last_command).clone()
    }

    /// Forget the duplicate-suppression baseline
    pub fn reset(&self) {
        *lock(&self.last_processed) = None;
    }

    /// Handle one final utterance
    ///
    /// Must be called from inside a Tokio runtime: the matched action is
    /// spawned onto it and this call never waits for the action.
    #[hotpath::measure]
    pub fn process_transcript(&self, raw: &str) -> DispatchOutcome {
        let text = normalize(raw);
        if text.chars().count() < self.config.min_length {
            debug!("Discarding short utterance {:?}", raw);
            return DispatchOutcome::Discarded;
        }

        let now = Instant::now();
        {
            let mut last = lock(&self.last_processed);
            if let Some((prev, at)) = last.as_ref() {
                if *prev == text && now.duration_since(*at) < self.config.cooldown() {
                    debug!("Ignoring repeated utterance {:?}", text);
                    return DispatchOutcome::Duplicate;
                }
            }
            // recorded even when nothing matches, so repeats of noise are dropped too
            *last = Some((text.clone(), now));
        }

        let timer = self
            .stats
            .as_ref()
            .map(|s| Timer::new(s, StatKind::Dispatch, text.len()));
        let (best, scanned) = self.scan(&text);
        if let Some(t) = timer {
            t.finish(scanned);
        }

        match best {
            Some(candidate) if candidate.found.score > self.config.min_score => {
                self.fire(&candidate);
                DispatchOutcome::Matched(candidate.found)
            }
            best => {
                let best = best.map(|c| c.found);
                debug!(
                    "No command for {:?} (best: {:?})",
                    text,
                    best.as_ref().map(|b| (&b.id, b.score))
                );
                DispatchOutcome::NoMatch { best }
            }
        }
    }

    /// Best command for `raw` without dedup, speech or actions
    pub fn best_match(&self, raw: &str) -> Option<CommandMatch> {
        let text = normalize(raw);
        if text.is_empty() {
            return None;
        }
        self.scan(&text).0.map(|c| c.found)
    }

    /// Score every pattern of every command; returns the best candidate and
    /// the number of commands scanned. A pattern scoring zero is never a
    /// candidate. Runs under the registry lock.
    fn scan(&self, utterance: &str) -> (Option<Candidate>, usize) {
        self.registry.with_entries(|entries| {
            // (entry index, pattern index, score)
            let mut best: Option<(usize, usize, f64)> = None;
            let mut scanned = 0;

            'commands: for (ei, entry) in entries.iter().enumerate() {
                scanned += 1;
                for (pi, pattern) in entry.definition.normalized_patterns().iter().enumerate() {
                    if pattern == utterance {
                        best = Some((ei, pi, EXACT_SCORE));
                        break 'commands;
                    }
                    let score = similarity_normalized(utterance, pattern)
                        .max(embedded_score(pattern, utterance));
                    if score > 0.0 && best.is_none_or(|(_, _, b)| score > b) {
                        best = Some((ei, pi, score));
                    }
                }
            }

            let candidate = best.map(|(ei, pi, score)| {
                let entry = &entries[ei];
                Candidate {
                    found: CommandMatch {
                        id: entry.id.clone(),
                        pattern: entry.definition.patterns()[pi].clone(),
                        score,
                    },
                    definition: Arc::clone(&entry.definition),
                }
            });
            (candidate, scanned)
        })
    }

    /// Speak the acknowledgment, then run the action after the configured delay
    fn fire(&self, candidate: &Candidate) {
        let CommandMatch { id, pattern, score } = &candidate.found;
        info!("Voice command {} matched {:?} (score {:.1})", id, pattern, score);

        if let Some(ack) = candidate.definition.acknowledgment() {
            speak_logged(self.speech.as_ref(), ack);
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            error!("Voice command {} dropped: no async runtime", id);
            return;
        };

        let action = candidate.definition.action().clone();
        let delay = self.config.action_delay();
        let id = id.clone();
        runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            match AssertUnwindSafe(async { action.invoke().await })
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => debug!("Voice command {} finished", id),
                Ok(Err(e)) => warn!("Voice command {} failed: {:#}", id, e),
                Err(_) => error!("Voice command {} panicked", id),
            }
        });

        *lock(&self.last_command) = Some(pattern.clone());
        if let Some(stats) = &self.stats {
            stats::record_match(stats);
        }
    }
}
