use std::time::Duration;

use crate::error::VoiceResult;

pub const TARGET_RATE: usize = 16000;

/// One finished audio chunk, encoded as 16-bit mono WAV
#[derive(Debug, Clone, PartialEq)]
pub struct Recording {
    pub wav: Vec<u8>,
    pub duration: Duration,
}

impl Recording {
    pub fn from_samples(samples: &[f32], sample_rate: usize) -> Self {
        let duration = Duration::from_secs_f64(samples.len() as f64 / sample_rate.max(1) as f64);
        Self {
            wav: encode_wav(samples, sample_rate as u32),
            duration,
        }
    }

    pub fn len(&self) -> usize {
        self.wav.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wav.len() <= WAV_HEADER_LEN
    }
}

/// Fixed-length recorder driven by the chunked recognition loop
///
/// `begin` starts a new recording, `finish` stops it and hands back the
/// audio, `discard` stops it and throws the audio away.
pub trait AudioRecorder: Send + Sync {
    /// Fails with `PermissionDenied` or `NoInputDevice` when capture is impossible
    fn check_permission(&self) -> VoiceResult<()>;
    fn begin(&self) -> VoiceResult<()>;
    fn finish(&self) -> VoiceResult<Recording>;
    fn discard(&self);
}

pub fn resample(samples: &[f32], from_rate: usize, to_rate: usize) -> Vec<f32> {
    if from_rate == to_rate {
        return samples.to_vec();
    }
    let ratio = to_rate as f64 / from_rate as f64;
    let new_len = (samples.len() as f64 * ratio) as usize;
    (0..new_len)
        .map(|i| {
            let src_idx = i as f64 / ratio;
            let idx = src_idx as usize;
            let frac = src_idx - idx as f64;
            if idx + 1 < samples.len() {
                samples[idx] * (1.0 - frac as f32) + samples[idx + 1] * frac as f32
            } else {
                samples.get(idx).copied().unwrap_or(0.0)
            }
        })
        .collect()
}

const WAV_HEADER_LEN: usize = 44;

/// 16-bit PCM mono WAV
pub fn encode_wav(samples: &[f32], sample_rate: u32) -> Vec<u8> {
    let data_size = (samples.len() * 2) as u32;
    let mut out = Vec::with_capacity(WAV_HEADER_LEN + data_size as usize);

    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_size).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes()); // PCM
    out.extend_from_slice(&1u16.to_le_bytes()); // mono
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&(sample_rate * 2).to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_size.to_le_bytes());

    for &s in samples {
        let v = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

// ============================================================================
// Microphone recorder (cpal)
// ============================================================================

#[cfg(feature = "mic")]
pub use mic::MicRecorder;

#[cfg(feature = "mic")]
mod mic {
    use super::{AudioRecorder, Recording, TARGET_RATE, resample};
    use crate::error::{VoiceError, VoiceResult};
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use std::sync::{Arc, Mutex, MutexGuard};
    use std::thread::{self, JoinHandle};
    use tracing::{debug, warn};

    struct ActiveCapture {
        stop_tx: flume::Sender<()>,
        handle: JoinHandle<()>,
        samples: Arc<Mutex<Vec<f32>>>,
        sample_rate: usize,
    }

    /// Records the default input device, one chunk at a time
    ///
    /// cpal streams cannot move between threads, so each chunk owns a capture
    /// thread that holds the stream until told to stop.
    #[derive(Default)]
    pub struct MicRecorder {
        active: Mutex<Option<ActiveCapture>>,
    }

    fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
        m.lock().unwrap_or_else(|e| e.into_inner())
    }

    impl MicRecorder {
        pub fn new() -> Self {
            Self::default()
        }

        fn stop_active(&self) -> Option<(Vec<f32>, usize)> {
            let active = lock(&self.active).take()?;
            let _ = active.stop_tx.send(());
            if active.handle.join().is_err() {
                warn!("Mic capture thread panicked");
            }
            let samples = std::mem::take(&mut *lock(&active.samples));
            Some((samples, active.sample_rate))
        }
    }

    fn open_input(
        buffer: Arc<Mutex<Vec<f32>>>,
    ) -> VoiceResult<(cpal::Stream, usize)> {
        let host = cpal::default_host();
        let device = host.default_input_device().ok_or(VoiceError::NoInputDevice)?;
        let supported = device
            .default_input_config()
            .map_err(|e| VoiceError::AudioCapture(e.to_string()))?;
        let sample_rate = u32::from(supported.sample_rate()) as usize;
        let channels = supported.channels() as usize;

        debug!("Mic: {}Hz {}ch", sample_rate, channels);

        let stream = device
            .build_input_stream(
                &supported.config(),
                move |data: &[f32], _| {
                    let mut buf = lock(&buffer);
                    if channels == 1 {
                        buf.extend_from_slice(data);
                    } else {
                        buf.extend(
                            data.chunks(channels)
                                .map(|c| c.iter().sum::<f32>() / channels as f32),
                        );
                    }
                },
                |e| warn!("Mic error: {}", e),
                None,
            )
            .map_err(|e| match e {
                cpal::BuildStreamError::DeviceNotAvailable => VoiceError::NoInputDevice,
                other => VoiceError::AudioCapture(other.to_string()),
            })?;
        stream
            .play()
            .map_err(|e| VoiceError::AudioCapture(e.to_string()))?;
        Ok((stream, sample_rate))
    }

    impl AudioRecorder for MicRecorder {
        fn check_permission(&self) -> VoiceResult<()> {
            cpal::default_host()
                .default_input_device()
                .map(|_| ())
                .ok_or(VoiceError::NoInputDevice)
        }

        fn begin(&self) -> VoiceResult<()> {
            self.discard();

            let samples = Arc::new(Mutex::new(Vec::new()));
            let (stop_tx, stop_rx) = flume::bounded::<()>(1);
            let (ready_tx, ready_rx) = flume::bounded::<VoiceResult<usize>>(1);
            let buffer = Arc::clone(&samples);

            let handle = thread::spawn(move || {
                let stream = match open_input(buffer) {
                    Ok((stream, rate)) => {
                        let _ = ready_tx.send(Ok(rate));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = stop_rx.recv();
                drop(stream);
            });

            let sample_rate = ready_rx
                .recv()
                .map_err(|_| VoiceError::AudioCapture("capture thread exited".into()))??;

            *lock(&self.active) = Some(ActiveCapture {
                stop_tx,
                handle,
                samples,
                sample_rate,
            });
            Ok(())
        }

        fn finish(&self) -> VoiceResult<Recording> {
            let (samples, rate) = self
                .stop_active()
                .ok_or_else(|| VoiceError::AudioCapture("no recording in progress".into()))?;
            let resampled = resample(&samples, rate, TARGET_RATE);
            Ok(Recording::from_samples(&resampled, TARGET_RATE))
        }

        fn discard(&self) {
            let _ = self.stop_active();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wav_header() {
        let wav = encode_wav(&[0.0, 1.0, -1.0], 16000);
        assert_eq!(wav.len(), 44 + 6);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(u32::from_le_bytes(wav[24..28].try_into().unwrap()), 16000);
        assert_eq!(u32::from_le_bytes(wav[40..44].try_into().unwrap()), 6);
        assert_eq!(i16::from_le_bytes([wav[46], wav[47]]), i16::MAX);
        assert_eq!(i16::from_le_bytes([wav[48], wav[49]]), -i16::MAX);
    }

    #[test]
    fn test_recording_duration() {
        let rec = Recording::from_samples(&vec![0.0; 48000], TARGET_RATE);
        assert_eq!(rec.duration, Duration::from_secs(3));
        assert!(!rec.is_empty());
        assert!(Recording::from_samples(&[], TARGET_RATE).is_empty());
    }

    #[test]
    fn test_resample_halves() {
        let out = resample(&[0.0, 1.0, 2.0, 3.0], 32000, 16000);
        assert_eq!(out, vec![0.0, 2.0]);
    }
}
