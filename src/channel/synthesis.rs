//! Speech-synthesis channel: URL parameters, text requests and inbound audio
//! chunks.

use crate::channel::recognition::bool_param;
use crate::channel::socket::Frame;
use crate::config::SynthesisSettings;
use crate::error::VoiceResult;
use serde::Deserialize;
use serde_json::json;
use url::Url;

/// Build the channel URL. Which parameters are sent depends on the engine.
pub fn build_url(settings: &SynthesisSettings) -> VoiceResult<Url> {
    let engine = settings.engine;
    let mut url = Url::parse(&settings.endpoint)?;
    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("engine", engine.as_str())
            .append_pair("voice_id", &settings.voice);
        if engine.requires_language() {
            query.append_pair("language", &settings.language);
        }
        if engine.supports_voice_tuning() {
            query
                .append_pair("stability", &settings.stability.to_string())
                .append_pair("similarity_boost", &settings.similarity_boost.to_string())
                .append_pair("style", &settings.style.to_string())
                .append_pair("speed", &settings.speed.to_string())
                .append_pair("use_speaker_boost", bool_param(settings.use_speaker_boost));
        }
        if engine.supports_ssml() {
            query.append_pair("enable_ssml", bool_param(settings.enable_ssml));
        }
        if engine.supports_text_normalization() {
            query.append_pair("text_normalization", settings.text_normalization.as_str());
        }
    }
    Ok(url)
}

/// A request to speak `text`.
pub fn request_frame(text: &str) -> Frame {
    Frame::Text(json!({ "text": text }).to_string())
}

/// Keep-alive payload: a request with nothing to say, sent even mid-playback.
pub fn keep_alive_frame() -> Frame {
    request_frame(" ")
}

/// One inbound synthesis message.
///
/// A message may carry audio, the completion marker, or both.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SynthesisChunk {
    /// Base64 audio payload
    #[serde(default)]
    pub audio: Option<String>,
    #[serde(default, rename = "isFinal")]
    pub is_final: bool,
}

pub fn parse_message(text: &str) -> VoiceResult<SynthesisChunk> {
    let mut chunk: SynthesisChunk = serde_json::from_str(text)?;
    if chunk.audio.as_deref().is_some_and(|audio| audio.trim().is_empty()) {
        chunk.audio = None;
    }
    Ok(chunk)
}
