//! # Engine Catalog
//!
//! Closed catalog of the speech engines the duplex channels can talk to.
//! Each recognition engine lists the models it offers and the languages each
//! model accepts; each synthesis engine lists its voices and their languages.
//!
//! Configuration is checked against this table when it is loaded, so a stored
//! model/language pair that the selected engine does not offer is corrected to
//! the engine's first valid option instead of failing at connect time.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One recognition model and the languages it accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: &'static str,
    pub languages: &'static [&'static str],
}

/// One synthesis voice and the languages it can speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoiceSpec {
    pub id: &'static str,
    pub languages: &'static [&'static str],
}

const DEEPGRAM_MODELS: &[ModelSpec] = &[
    ModelSpec {
        name: "nova-3",
        languages: &["en-US", "en-GB", "es", "fr", "de"],
    },
    ModelSpec {
        name: "nova-2",
        languages: &["en-US", "en-GB", "en-AU", "es", "fr", "de", "ja", "pt-BR"],
    },
    ModelSpec {
        name: "nova-2-phonecall",
        languages: &["en-US"],
    },
];

const AWS_TRANSCRIBE_MODELS: &[ModelSpec] = &[ModelSpec {
    name: "default",
    languages: &["en-US", "en-GB", "es-US", "fr-CA", "de-DE"],
}];

const GOOGLE_STT_MODELS: &[ModelSpec] = &[
    ModelSpec {
        name: "latest_long",
        languages: &["en-US", "en-GB", "es-ES", "fr-FR", "de-DE", "ja-JP"],
    },
    ModelSpec {
        name: "telephony",
        languages: &["en-US", "es-ES"],
    },
];

const ELEVENLABS_VOICES: &[VoiceSpec] = &[
    VoiceSpec {
        id: "21m00Tcm4TlvDq8ikWAM",
        languages: &["en", "es", "fr", "de", "ja"],
    },
    VoiceSpec {
        id: "EXAVITQu4vr4xnSDxMaL",
        languages: &["en", "es", "fr", "de"],
    },
];

const POLLY_VOICES: &[VoiceSpec] = &[
    VoiceSpec {
        id: "Joanna",
        languages: &["en-US"],
    },
    VoiceSpec {
        id: "Amy",
        languages: &["en-GB"],
    },
    VoiceSpec {
        id: "Lupe",
        languages: &["es-US"],
    },
];

const GOOGLE_TTS_VOICES: &[VoiceSpec] = &[
    VoiceSpec {
        id: "en-US-Neural2-F",
        languages: &["en-US"],
    },
    VoiceSpec {
        id: "en-GB-Neural2-B",
        languages: &["en-GB"],
    },
];

/// Speech-to-text engines reachable through the recognition channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecognitionEngine {
    Deepgram,
    Aws,
    Google,
}

impl RecognitionEngine {
    pub const ALL: [RecognitionEngine; 3] = [
        RecognitionEngine::Deepgram,
        RecognitionEngine::Aws,
        RecognitionEngine::Google,
    ];

    /// Engine name as sent in the channel URL.
    pub fn as_str(&self) -> &'static str {
        match self {
            RecognitionEngine::Deepgram => "deepgram",
            RecognitionEngine::Aws => "aws",
            RecognitionEngine::Google => "google",
        }
    }

    pub fn models(&self) -> &'static [ModelSpec] {
        match self {
            RecognitionEngine::Deepgram => DEEPGRAM_MODELS,
            RecognitionEngine::Aws => AWS_TRANSCRIBE_MODELS,
            RecognitionEngine::Google => GOOGLE_STT_MODELS,
        }
    }

    /// Whether the engine accepts a model name in the URL at all.
    pub fn selects_model(&self) -> bool {
        !matches!(self, RecognitionEngine::Aws)
    }

    /// Keyword boosting is only understood by Deepgram.
    pub fn supports_keywords(&self) -> bool {
        matches!(self, RecognitionEngine::Deepgram)
    }

    pub fn model(&self, name: &str) -> Option<&'static ModelSpec> {
        self.models().iter().find(|m| m.name == name)
    }

    /// Correct a (model, language) pair so that it is valid for this engine.
    ///
    /// Returns the coherent pair and whether anything had to change.
    pub fn coerce(&self, model: Option<&str>, language: &str) -> (Option<String>, String, bool) {
        let models = self.models();
        let (spec, model_changed) = if self.selects_model() {
            match model.and_then(|m| self.model(m)) {
                Some(spec) => (spec, false),
                None => (&models[0], true),
            }
        } else {
            // The model slot is meaningless here; a stored value is dropped.
            (&models[0], model.is_some())
        };

        let (language, language_changed) = if spec.languages.contains(&language) {
            (language.to_string(), false)
        } else {
            (spec.languages[0].to_string(), true)
        };

        let model = self.selects_model().then(|| spec.name.to_string());
        (model, language, model_changed || language_changed)
    }
}

impl std::str::FromStr for RecognitionEngine {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "deepgram" => Ok(RecognitionEngine::Deepgram),
            "aws" => Ok(RecognitionEngine::Aws),
            "google" => Ok(RecognitionEngine::Google),
            _ => Err(anyhow!("Unknown recognition engine: {}", s)),
        }
    }
}

impl fmt::Display for RecognitionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Text-to-speech engines reachable through the synthesis channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SynthesisEngine {
    ElevenLabs,
    Aws,
    Google,
}

impl SynthesisEngine {
    pub const ALL: [SynthesisEngine; 3] = [
        SynthesisEngine::ElevenLabs,
        SynthesisEngine::Aws,
        SynthesisEngine::Google,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SynthesisEngine::ElevenLabs => "elevenlabs",
            SynthesisEngine::Aws => "aws",
            SynthesisEngine::Google => "google",
        }
    }

    pub fn voices(&self) -> &'static [VoiceSpec] {
        match self {
            SynthesisEngine::ElevenLabs => ELEVENLABS_VOICES,
            SynthesisEngine::Aws => POLLY_VOICES,
            SynthesisEngine::Google => GOOGLE_TTS_VOICES,
        }
    }

    pub fn voice(&self, id: &str) -> Option<&'static VoiceSpec> {
        self.voices().iter().find(|v| v.id == id)
    }

    /// Stability, similarity boost, style, speed and speaker boost.
    pub fn supports_voice_tuning(&self) -> bool {
        matches!(self, SynthesisEngine::ElevenLabs)
    }

    pub fn supports_ssml(&self) -> bool {
        matches!(self, SynthesisEngine::Aws | SynthesisEngine::Google)
    }

    pub fn supports_text_normalization(&self) -> bool {
        matches!(self, SynthesisEngine::ElevenLabs)
    }

    /// Engines that need the language code spelled out next to the voice.
    pub fn requires_language(&self) -> bool {
        !matches!(self, SynthesisEngine::ElevenLabs)
    }

    /// Correct a (voice, language) pair so that it is valid for this engine.
    pub fn coerce(&self, voice: &str, language: &str) -> (String, String, bool) {
        let voices = self.voices();
        let spec = self.voice(voice).unwrap_or(&voices[0]);
        let mut changed = spec.id != voice;

        let language = if spec.languages.contains(&language) {
            language.to_string()
        } else {
            changed = true;
            spec.languages[0].to_string()
        };

        (spec.id.to_string(), language, changed)
    }
}

impl std::str::FromStr for SynthesisEngine {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "elevenlabs" => Ok(SynthesisEngine::ElevenLabs),
            "aws" => Ok(SynthesisEngine::Aws),
            "google" => Ok(SynthesisEngine::Google),
            _ => Err(anyhow!("Unknown synthesis engine: {}", s)),
        }
    }
}

impl fmt::Display for SynthesisEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
