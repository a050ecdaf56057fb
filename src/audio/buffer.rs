//! # Sample Ring
//!
//! Bounded ring of the most recent raw samples of one audio path (the raw
//! microphone capture or the speaker/playback output).
//!
//! ## Key Features:
//! - **Bounded**: old samples are discarded once `capacity` is reached
//! - **Shared read-only**: level monitors copy the newest window on each tick
//! - **Closable**: closing the ring is how a source handle is "cleared"; monitors
//!   reading a closed ring stop on their own
//!
//! The microphone ring is fed before any transmit mute is applied, so waveform
//! feedback keeps working while outgoing audio is muted.

use crate::audio::pcm;
use crate::error::VoiceResult;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

pub struct SampleRing {
    /// Normalised samples in [-1.0, 1.0]
    samples: Mutex<VecDeque<f32>>,

    /// Maximum number of samples kept
    capacity: usize,

    sample_rate: u32,

    closed: AtomicBool,
}

impl SampleRing {
    /// Create a ring holding at most `capacity` samples.
    pub fn new(sample_rate: u32, capacity: usize) -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            sample_rate,
            closed: AtomicBool::new(false),
        }
    }

    /// Create a ring sized to hold `duration_ms` of audio.
    pub fn with_duration(sample_rate: u32, duration_ms: u32) -> Self {
        let capacity = (duration_ms as usize * sample_rate as usize) / 1000;
        Self::new(sample_rate, capacity)
    }

    /// Append raw 16-bit little-endian PCM bytes.
    pub fn append_pcm_data(&self, data: &[u8]) -> VoiceResult<()> {
        let samples = pcm::decode_pcm16_le(data)?;
        self.push_pcm(&samples);
        Ok(())
    }

    pub fn push_pcm(&self, samples: &[i16]) {
        self.extend(pcm::pcm_to_float(samples).into_iter());
    }

    pub fn push_samples(&self, samples: &[f32]) {
        self.extend(samples.iter().copied());
    }

    fn extend(&self, samples: impl Iterator<Item = f32>) {
        if self.is_closed() {
            return;
        }
        let mut buffer = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
        for sample in samples {
            buffer.push_back(sample);
            if buffer.len() > self.capacity {
                buffer.pop_front();
            }
        }
    }

    /// Copy the newest `out.len()` samples into `out`, oldest first.
    ///
    /// When fewer samples are available the front of `out` is zero-filled.
    /// Returns `false` once the ring has been closed.
    pub fn latest_window(&self, out: &mut [f32]) -> bool {
        if self.is_closed() {
            return false;
        }
        let buffer = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
        let available = buffer.len().min(out.len());
        let pad = out.len() - available;
        out[..pad].fill(0.0);
        for (slot, sample) in out[pad..].iter_mut().zip(buffer.iter().skip(buffer.len() - available)) {
            *slot = *sample;
        }
        true
    }

    pub fn len(&self) -> usize {
        self.samples.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Seconds of audio currently held.
    pub fn duration_seconds(&self) -> f64 {
        self.len() as f64 / self.sample_rate as f64
    }

    pub fn clear(&self) {
        self.samples.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// Release the source. Readers observe `false` from then on.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for SampleRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleRing")
            .field("capacity", &self.capacity)
            .field("sample_rate", &self.sample_rate)
            .field("closed", &self.is_closed())
            .finish()
    }
}
