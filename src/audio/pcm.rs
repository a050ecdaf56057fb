//! # PCM Helpers
//!
//! Conversions between the byte formats the channels carry and sample
//! buffers: 16-bit little-endian PCM, base64 synthesis chunks (raw PCM or
//! WAV), and the silence frames used for keep-alive and push-to-talk settling.

use crate::error::{VoiceError, VoiceResult};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// Audio format of a capture or playback path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u8,
    pub bit_depth: u8,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
            bit_depth: 16,
        }
    }
}

impl AudioFormat {
    /// Bytes needed for `samples` samples of this format.
    pub fn bytes_for(&self, samples: usize) -> usize {
        samples * self.channels as usize * (self.bit_depth as usize / 8)
    }
}

/// Decode 16-bit little-endian PCM.
pub fn decode_pcm16_le(data: &[u8]) -> VoiceResult<Vec<i16>> {
    if data.len() % 2 != 0 {
        return Err(VoiceError::Playback(
            "Audio data length must be even for 16-bit samples".to_string(),
        ));
    }

    let mut cursor = Cursor::new(data);
    let mut samples = Vec::with_capacity(data.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample);
    }
    Ok(samples)
}

/// Encode samples as 16-bit little-endian PCM.
pub fn encode_pcm16_le(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        // Writing into a Vec cannot fail.
        let _ = out.write_i16::<LittleEndian>(sample);
    }
    out
}

/// Decode a base64 synthesis chunk into samples.
///
/// Chunks that arrive as WAV files are parsed with `hound` and must be
/// 16-bit mono integer PCM; anything else is raw 16-bit little-endian PCM.
pub fn decode_base64_chunk(encoded: &str) -> VoiceResult<Vec<i16>> {
    let bytes = STANDARD.decode(encoded.trim())?;
    if bytes.is_empty() {
        return Err(VoiceError::Playback("empty audio chunk".to_string()));
    }

    if bytes.starts_with(b"RIFF") {
        decode_wav(bytes)
    } else {
        decode_pcm16_le(&bytes)
    }
}

fn decode_wav(bytes: Vec<u8>) -> VoiceResult<Vec<i16>> {
    let mut reader = hound::WavReader::new(Cursor::new(bytes))
        .map_err(|e| VoiceError::Playback(format!("Invalid WAV chunk: {}", e)))?;
    let spec = reader.spec();
    if spec.sample_format != hound::SampleFormat::Int || spec.bits_per_sample != 16 || spec.channels != 1 {
        return Err(VoiceError::Playback(format!(
            "Unsupported WAV chunk: {} channel(s), {}-bit {:?}",
            spec.channels, spec.bits_per_sample, spec.sample_format
        )));
    }

    reader
        .samples::<i16>()
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| VoiceError::Playback(format!("Truncated WAV chunk: {}", e)))
}

/// A frame of digital silence, `samples` long.
pub fn silence_frame(format: &AudioFormat, samples: usize) -> Vec<u8> {
    vec![0u8; format.bytes_for(samples)]
}

/// Scale 16-bit samples into [-1.0, 1.0].
pub fn pcm_to_float(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&sample| sample as f32 / 32768.0).collect()
}
