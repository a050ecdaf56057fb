//! # Audio Level Monitoring
//!
//! Turns a live sample source into a smoothed 0-100 activity level.
//!
//! ## Analysis (per tick):
//! 1. Copy the newest `window_size` samples from the source ring
//! 2. Apply a Blackman window and run a forward FFT
//! 3. Smooth each bin's magnitude against the previous frame (constant 0.8)
//! 4. Map each bin from [-100 dB, -30 dB] onto 0-255
//! 5. Average all bins and clamp to 100
//!
//! The monitor runs as long as its source ring is open. A closed ring stops it
//! for good; restarting is up to the caller (for example after a reconnect).

use crate::audio::buffer::SampleRing;
use crate::config::MonitorConfig;
use crate::error::{VoiceError, VoiceResult};
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

const MIN_DECIBELS: f32 = -100.0;
const MAX_DECIBELS: f32 = -30.0;

/// Which audio path a level was measured on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LevelSource {
    Microphone,
    Speaker,
}

impl fmt::Display for LevelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LevelSource::Microphone => f.write_str("microphone"),
            LevelSource::Speaker => f.write_str("speaker"),
        }
    }
}

/// One published reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AudioLevelSample {
    pub level: f32,
    pub source: LevelSource,
}

/// Frequency-domain level estimator with per-bin temporal smoothing.
pub struct LevelAnalyzer {
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    smoothed: Vec<f32>,
    smoothing: f32,
    scratch: Vec<Complex<f32>>,
}

impl LevelAnalyzer {
    pub fn new(window_size: usize, smoothing: f32) -> Self {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(window_size);

        let n = window_size as f32;
        let window = (0..window_size)
            .map(|i| {
                let x = 2.0 * std::f32::consts::PI * i as f32 / n;
                0.42 - 0.5 * x.cos() + 0.08 * (2.0 * x).cos()
            })
            .collect();

        Self {
            fft,
            window,
            smoothed: vec![0.0; window_size / 2],
            smoothing,
            scratch: vec![Complex::new(0.0, 0.0); window_size],
        }
    }

    pub fn window_size(&self) -> usize {
        self.window.len()
    }

    /// Analyse one window of samples and return the 0-100 level.
    ///
    /// `samples` shorter than the window are zero-padded.
    pub fn analyze(&mut self, samples: &[f32]) -> f32 {
        if self.smoothed.is_empty() {
            return 0.0;
        }
        let size = self.window.len();
        for (i, slot) in self.scratch.iter_mut().enumerate() {
            let sample = samples.get(i).copied().unwrap_or(0.0);
            *slot = Complex::new(sample * self.window[i], 0.0);
        }
        self.fft.process(&mut self.scratch);

        let mut total = 0.0;
        for (bin, smoothed) in self.smoothed.iter_mut().enumerate() {
            let magnitude = self.scratch[bin].norm() / size as f32;
            *smoothed = self.smoothing * *smoothed + (1.0 - self.smoothing) * magnitude;

            let decibels = 20.0 * smoothed.max(1e-12).log10();
            let scaled = 255.0 * (decibels - MIN_DECIBELS) / (MAX_DECIBELS - MIN_DECIBELS);
            total += scaled.clamp(0.0, 255.0).floor();
        }

        (total / self.smoothed.len() as f32).min(100.0)
    }

    /// Forget smoothing history.
    pub fn reset(&mut self) {
        self.smoothed.fill(0.0);
    }
}

/// Background task publishing the level of one source.
pub struct AudioLevelMonitor {
    source: LevelSource,
    level_rx: watch::Receiver<f32>,
    task: JoinHandle<()>,
}

impl AudioLevelMonitor {
    /// Start monitoring `ring`.
    ///
    /// Fails once, without retrying, if the source is not available.
    pub fn start(ring: Arc<SampleRing>, source: LevelSource, config: &MonitorConfig) -> VoiceResult<Self> {
        if ring.is_closed() {
            return Err(VoiceError::Media(format!("{} source is not available", source)));
        }

        let (level_tx, level_rx) = watch::channel(0.0f32);
        let mut analyzer = LevelAnalyzer::new(config.window_size, config.smoothing);
        let tick = Duration::from_millis(config.tick_ms.max(1));

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut window = vec![0.0f32; analyzer.window_size()];

            loop {
                interval.tick().await;
                if !ring.latest_window(&mut window) {
                    let _ = level_tx.send(0.0);
                    debug!(source = %source, "Level source released, monitor stopped");
                    break;
                }
                let level = analyzer.analyze(&window);
                if level_tx.send(level).is_err() {
                    break;
                }
            }
        });

        info!(source = %source, "Level monitor started");
        Ok(Self {
            source,
            level_rx,
            task,
        })
    }

    pub fn source(&self) -> LevelSource {
        self.source
    }

    /// Most recent level.
    pub fn level(&self) -> f32 {
        *self.level_rx.borrow()
    }

    pub fn sample(&self) -> AudioLevelSample {
        AudioLevelSample {
            level: self.level(),
            source: self.source,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<f32> {
        self.level_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for AudioLevelMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl fmt::Debug for AudioLevelMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioLevelMonitor")
            .field("source", &self.source)
            .field("level", &self.level())
            .field("running", &self.is_running())
            .finish()
    }
}
