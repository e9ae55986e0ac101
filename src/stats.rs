//! Timing stats for transcription chunks and command dispatch

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Samples kept per kind; older ones fall off the front
pub const MAX_SAMPLES: usize = 1000;

#[derive(Clone, Default)]
pub struct VoiceStats {
    pub transcription: VecDeque<Sample>,
    pub dispatch: VecDeque<Sample>,
    /// Chunk cycles whose transcription failed or timed out
    pub failed_chunks: usize,
    /// Utterances that fired a command
    pub matched: usize,
}

#[derive(Clone)]
pub struct Sample {
    pub duration: Duration,
    pub input_size: usize,  // audio bytes for transcription, chars for dispatch
    pub output_size: usize, // chars for transcription, commands scanned for dispatch
}

impl VoiceStats {
    pub fn summary(&self) -> String {
        let mut out = String::new();

        if !self.transcription.is_empty() {
            let (avg, min, max, total) = Self::calc(&self.transcription);
            let avg_kb: f64 = self
                .transcription
                .iter()
                .map(|s| s.input_size as f64 / 1024.0)
                .sum::<f64>()
                / self.transcription.len() as f64;
            out.push_str(&format!(
                "Transcription (n={}): avg={:.0}ms min={:.0}ms max={:.0}ms total={:.1}s avg_upload={:.1}KB failed={}\n",
                self.transcription.len(),
                avg.as_millis(),
                min.as_millis(),
                max.as_millis(),
                total.as_secs_f64(),
                avg_kb,
                self.failed_chunks
            ));
        } else if self.failed_chunks > 0 {
            out.push_str(&format!("Transcription: failed={}\n", self.failed_chunks));
        }

        if !self.dispatch.is_empty() {
            let (avg, min, max, _) = Self::calc(&self.dispatch);
            out.push_str(&format!(
                "Dispatch (n={}): avg={}us min={}us max={}us matched={}\n",
                self.dispatch.len(),
                avg.as_micros(),
                min.as_micros(),
                max.as_micros(),
                self.matched
            ));
        }

        if out.is_empty() {
            out.push_str("No stats recorded yet.\n");
        }
        out
    }

    fn calc(samples: &VecDeque<Sample>) -> (Duration, Duration, Duration, Duration) {
        let total: Duration = samples.iter().map(|s| s.duration).sum();
        let avg = total / samples.len() as u32;
        let min = samples.iter().map(|s| s.duration).min().unwrap_or_default();
        let max = samples.iter().map(|s| s.duration).max().unwrap_or_default();
        (avg, min, max, total)
    }
}

pub type SharedStats = Arc<Mutex<VoiceStats>>;

pub fn new_shared() -> SharedStats {
    Arc::new(Mutex::new(VoiceStats::default()))
}

fn with_stats(stats: &SharedStats, f: impl FnOnce(&mut VoiceStats)) {
    let mut guard = stats.lock().unwrap_or_else(|e| e.into_inner());
    f(&mut guard);
}

pub fn record_failed_chunk(stats: &SharedStats) {
    with_stats(stats, |s| s.failed_chunks += 1);
}

pub fn record_match(stats: &SharedStats) {
    with_stats(stats, |s| s.matched += 1);
}

/// Timer helper that records when finished
pub struct Timer<'a> {
    start: Instant,
    stats: &'a SharedStats,
    kind: StatKind,
    input_size: usize,
}

pub enum StatKind {
    Transcription,
    Dispatch,
}

impl<'a> Timer<'a> {
    pub fn new(stats: &'a SharedStats, kind: StatKind, input_size: usize) -> Self {
        Self {
            start: Instant::now(),
            stats,
            kind,
            input_size,
        }
    }

    pub fn finish(self, output_size: usize) {
        let sample = Sample {
            duration: self.start.elapsed(),
            input_size: self.input_size,
            output_size,
        };
        with_stats(self.stats, |stats| {
            let samples = match self.kind {
                StatKind::Transcription => &mut stats.transcription,
                StatKind::Dispatch => &mut stats.dispatch,
            };
            if samples.len() == MAX_SAMPLES {
                samples.pop_front();
            }
            samples.push_back(sample);
        });
    }
}
