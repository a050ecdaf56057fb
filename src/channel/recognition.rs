//! Speech-recognition channel: URL parameters, inbound results and the
//! silence frames used as keep-alive.

use crate::audio::pcm::{self, AudioFormat};
use crate::channel::socket::Frame;
use crate::config::RecognitionSettings;
use crate::error::VoiceResult;
use serde::Deserialize;
use url::Url;

/// 100 ms of 16 kHz mono silence.
const KEEP_ALIVE_SILENCE_SAMPLES: usize = 1600;

/// Build the channel URL from the configured endpoint and parameters.
pub fn build_url(settings: &RecognitionSettings) -> VoiceResult<Url> {
    let mut url = Url::parse(&settings.endpoint)?;
    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("engine", settings.engine.as_str())
            .append_pair("language", &settings.language);
        if let Some(model) = &settings.model {
            query.append_pair("model", model);
        }
        query
            .append_pair("smart_format", bool_param(settings.smart_format))
            .append_pair("profanity_filter", bool_param(settings.profanity_filter));
        if let Some(ms) = settings.utterance_end_ms {
            query.append_pair("utterance_end_ms", &ms.to_string());
        }
        if settings.engine.supports_keywords() && !settings.keywords.is_empty() {
            query.append_pair("keywords", &settings.keywords.join(","));
        }
    }
    Ok(url)
}

pub(crate) fn bool_param(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

/// Keep-alive payload: silence, but never while real audio is flowing.
pub fn keep_alive_frame(transmitting: bool) -> Option<Frame> {
    if transmitting {
        return None;
    }
    Some(Frame::Binary(pcm::silence_frame(
        &AudioFormat::default(),
        KEEP_ALIVE_SILENCE_SAMPLES,
    )))
}

#[derive(Debug, Deserialize)]
struct RecognitionMessage {
    #[serde(default)]
    results: Vec<RecognitionResult>,
}

#[derive(Debug, Deserialize)]
struct RecognitionResult {
    #[serde(default)]
    alternatives: Vec<Alternative>,
    #[serde(default, rename = "isPartial")]
    is_partial: bool,
}

#[derive(Debug, Deserialize)]
struct Alternative {
    #[serde(default)]
    transcript: String,
}

/// One recognized fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recognized {
    pub text: String,
    pub is_final: bool,
}

/// Extract the best transcript of every result in an inbound message.
///
/// Results without a non-blank transcript are skipped.
pub fn parse_message(text: &str) -> VoiceResult<Vec<Recognized>> {
    let message: RecognitionMessage = serde_json::from_str(text)?;
    Ok(message
        .results
        .into_iter()
        .filter_map(|result| {
            let best = result.alternatives.into_iter().next()?;
            let transcript = best.transcript.trim();
            (!transcript.is_empty()).then(|| Recognized {
                text: transcript.to_string(),
                is_final: !result.is_partial,
            })
        })
        .collect())
}
