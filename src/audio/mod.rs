//! # Audio Module
//!
//! Everything the engine does with raw audio: holding the newest samples of a
//! capture or playback path, converting between PCM byte formats, and turning
//! a source into a smoothed activity level.
//!
//! ## Audio Format Requirements:
//! - **Sample Rate**: 16kHz capture (playback rate is whatever the synthesis engine emits)
//! - **Bit Depth**: 16-bit PCM
//! - **Channels**: Mono (1 channel)
//! - **Encoding**: Little-endian signed integers

pub mod buffer; // Bounded ring of recent samples
pub mod level; // Level analysis and monitoring
pub mod pcm; // PCM / base64 conversions

pub use buffer::SampleRing;
pub use level::{AudioLevelMonitor, AudioLevelSample, LevelAnalyzer, LevelSource};
pub use pcm::AudioFormat;
