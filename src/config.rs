//! # Configuration Management
//!
//! Loads the engine configuration from multiple sources:
//! - Default values (built into the code)
//! - An optional TOML file (`voice.toml`)
//! - Environment variables (with `VOICE_` prefix, `__` between sections)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (`VOICE_CHANNELS__KEEP_ALIVE_MS=5000`, ...)
//! 2. Configuration file
//! 3. Default values (defined in the Default impls)
//!
//! ## Stored settings:
//! Detection thresholds and engine/voice choices are also persisted by the
//! host as a flat record. [`EngineConfig::apply_stored`] overlays such a record
//! leniently: missing or invalid values keep their current value, and the
//! engine/model/language combination is re-checked against the catalog.

use crate::catalog::{RecognitionEngine, SynthesisEngine};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Which interaction model the orchestrator runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionMode {
    /// Continuous microphone with level-based turn detection over a media room
    OpenMic,
    /// Explicit press/release over the recognition and synthesis channels
    PushToTalk,
}

impl std::str::FromStr for InteractionMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "open_mic" | "openmic" => Ok(InteractionMode::OpenMic),
            "push_to_talk" | "pushtotalk" | "ptt" => Ok(InteractionMode::PushToTalk),
            _ => Err(anyhow::anyhow!("Unknown interaction mode: {}", s)),
        }
    }
}

/// Main engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub session: SessionConfig,
    pub detection: DetectionProfiles,
    pub channels: ChannelsConfig,
    pub transcript: TranscriptConfig,
    pub push_to_talk: PushToTalkConfig,
    pub monitor: MonitorConfig,
}

/// Identifiers handed to the session backend during the handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub agent_id: String,
    pub instance_id: String,
    pub version_id: String,
    pub mode: InteractionMode,
}

/// Activity detection tuning for one interaction mode.
///
/// ## Fields:
/// - `mic_threshold` / `speaker_threshold`: level (0-100) above which a source counts as active
/// - `priority_multiplier`: microphone must beat speaker x multiplier to count as user speech
/// - `state_lock_ms`: minimum dwell before a presence state may be left
/// - `user_silence_ms`: agent audio stays muted this long after the last user speech
/// - `playback_silence_level`: speaker level regarded as silent for end-of-speech
/// - `playback_poll_ms`: how long silence must hold before playback counts as over
/// - `fallback_silence_ms`: silence needed to finish playback without a completion marker
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectionConfig {
    pub mic_threshold: f32,
    pub speaker_threshold: f32,
    pub priority_multiplier: f32,
    pub state_lock_ms: u64,
    pub user_silence_ms: u64,
    pub playback_silence_level: f32,
    pub playback_poll_ms: u64,
    pub fallback_silence_ms: u64,
}

impl DetectionConfig {
    pub fn open_mic() -> Self {
        Self {
            mic_threshold: 5.0,
            speaker_threshold: 8.0,
            ..Self::shared_defaults()
        }
    }

    pub fn push_to_talk() -> Self {
        Self {
            mic_threshold: 1.0,
            speaker_threshold: 3.0,
            ..Self::shared_defaults()
        }
    }

    fn shared_defaults() -> Self {
        Self {
            mic_threshold: 5.0,
            speaker_threshold: 8.0,
            priority_multiplier: 1.2,
            state_lock_ms: 1200,
            user_silence_ms: 500,
            playback_silence_level: 2.0,
            playback_poll_ms: 200,
            fallback_silence_ms: 1500,
        }
    }

    pub fn state_lock(&self) -> Duration {
        Duration::from_millis(self.state_lock_ms)
    }

    pub fn user_silence(&self) -> Duration {
        Duration::from_millis(self.user_silence_ms)
    }

    pub fn playback_poll(&self) -> Duration {
        Duration::from_millis(self.playback_poll_ms)
    }

    pub fn fallback_silence(&self) -> Duration {
        Duration::from_millis(self.fallback_silence_ms)
    }

    fn validate(&self, label: &str) -> Result<()> {
        let levels = [
            ("mic_threshold", self.mic_threshold),
            ("speaker_threshold", self.speaker_threshold),
            ("playback_silence_level", self.playback_silence_level),
        ];
        for (name, value) in levels {
            if !(0.0..=100.0).contains(&value) {
                return Err(anyhow::anyhow!("{}.{} must be within 0-100, got {}", label, name, value));
            }
        }
        if !self.priority_multiplier.is_finite() || self.priority_multiplier <= 0.0 {
            return Err(anyhow::anyhow!("{}.priority_multiplier must be positive", label));
        }
        if self.playback_poll_ms == 0 {
            return Err(anyhow::anyhow!("{}.playback_poll_ms must be greater than 0", label));
        }
        Ok(())
    }
}

/// Detection tuning for both interaction modes; the two are kept apart on purpose.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionProfiles {
    pub open_mic: DetectionConfig,
    pub push_to_talk: DetectionConfig,
}

/// Settings shared by both duplex channels plus each channel's own parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelsConfig {
    pub recognition: RecognitionSettings,
    pub synthesis: SynthesisSettings,
    pub keep_alive_ms: u64,
    pub reconnect_delay_ms: u64,
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub delay_ms: u64,
}

/// Parameters of the speech-recognition (input) channel URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionSettings {
    pub endpoint: String,
    pub engine: RecognitionEngine,
    pub language: String,
    pub model: Option<String>,
    pub smart_format: bool,
    pub profanity_filter: bool,
    pub utterance_end_ms: Option<u32>,
    pub keywords: Vec<String>,
}

/// How the synthesis engine normalises numbers, dates and the like.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextNormalization {
    Auto,
    On,
    Off,
}

impl TextNormalization {
    pub fn as_str(&self) -> &'static str {
        match self {
            TextNormalization::Auto => "auto",
            TextNormalization::On => "on",
            TextNormalization::Off => "off",
        }
    }
}

/// Parameters of the speech-synthesis (output) channel URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisSettings {
    pub endpoint: String,
    pub engine: SynthesisEngine,
    pub voice: String,
    pub language: String,
    pub stability: f32,
    pub similarity_boost: f32,
    pub style: f32,
    pub speed: f32,
    pub use_speaker_boost: bool,
    pub enable_ssml: bool,
    pub text_normalization: TextNormalization,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TranscriptConfig {
    /// Number of finalized entries retained for display
    pub history_limit: usize,
}

/// Timing of the push-to-talk release sequence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PushToTalkConfig {
    pub sample_rate: u32,
    pub settle_ms: u64,
    pub frame_ms: u64,
    pub submit_delay_ms: u64,
}

impl PushToTalkConfig {
    /// Samples in one silence frame of the settle window.
    pub fn frame_samples(&self) -> usize {
        (self.sample_rate as u64 * self.frame_ms / 1000) as usize
    }

    pub fn settle_frames(&self) -> u64 {
        if self.frame_ms == 0 {
            return 0;
        }
        self.settle_ms.div_ceil(self.frame_ms)
    }
}

/// Level monitor cadence and analysis window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub tick_ms: u64,
    pub window_size: usize,
    pub smoothing: f32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig {
                agent_id: String::new(),
                instance_id: String::new(),
                version_id: String::new(),
                mode: InteractionMode::OpenMic,
            },
            detection: DetectionProfiles {
                open_mic: DetectionConfig::open_mic(),
                push_to_talk: DetectionConfig::push_to_talk(),
            },
            channels: ChannelsConfig {
                recognition: RecognitionSettings {
                    endpoint: "wss://localhost:8443/stt".to_string(),
                    engine: RecognitionEngine::Deepgram,
                    language: "en-US".to_string(),
                    model: Some("nova-3".to_string()),
                    smart_format: true,
                    profanity_filter: false,
                    utterance_end_ms: Some(1000),
                    keywords: Vec::new(),
                },
                synthesis: SynthesisSettings {
                    endpoint: "wss://localhost:8443/tts".to_string(),
                    engine: SynthesisEngine::ElevenLabs,
                    voice: "21m00Tcm4TlvDq8ikWAM".to_string(),
                    language: "en".to_string(),
                    stability: 0.5,
                    similarity_boost: 0.75,
                    style: 0.0,
                    speed: 1.0,
                    use_speaker_boost: true,
                    enable_ssml: false,
                    text_normalization: TextNormalization::Auto,
                },
                keep_alive_ms: 3000,
                reconnect_delay_ms: 500,
                retry: RetryConfig {
                    max_attempts: 3,
                    delay_ms: 1000,
                },
            },
            transcript: TranscriptConfig { history_limit: 10 },
            push_to_talk: PushToTalkConfig {
                sample_rate: 16000,
                settle_ms: 500,
                frame_ms: 100,
                submit_delay_ms: 300,
            },
            monitor: MonitorConfig {
                tick_ms: 16,
                window_size: 256,
                smoothing: 0.8,
            },
        }
    }
}

impl EngineConfig {
    /// Load configuration from defaults, `voice.toml` and `VOICE_*` variables.
    pub fn load() -> Result<Self> {
        Self::load_from("voice")
    }

    /// Same as [`EngineConfig::load`] with an explicit file stem or path.
    pub fn load_from(file: impl AsRef<Path>) -> Result<Self> {
        let name = file.as_ref().to_string_lossy().to_string();
        let settings = config::Config::builder()
            .add_source(config::Config::try_from(&EngineConfig::default())?)
            .add_source(config::File::with_name(&name).required(false))
            .add_source(
                config::Environment::with_prefix("VOICE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        let mut config: EngineConfig = settings.build()?.try_deserialize()?;
        for correction in config.normalize_catalog() {
            warn!(correction = %correction, "Adjusted engine configuration");
        }
        Ok(config)
    }

    /// Write the full configuration as TOML, readable by [`EngineConfig::load_from`].
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let rendered = toml::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), rendered)?;
        Ok(())
    }

    /// Detection profile used by the configured interaction mode.
    pub fn detection_for(&self, mode: InteractionMode) -> &DetectionConfig {
        match mode {
            InteractionMode::OpenMic => &self.detection.open_mic,
            InteractionMode::PushToTalk => &self.detection.push_to_talk,
        }
    }

    fn detection_for_mut(&mut self, mode: InteractionMode) -> &mut DetectionConfig {
        match mode {
            InteractionMode::OpenMic => &mut self.detection.open_mic,
            InteractionMode::PushToTalk => &mut self.detection.push_to_talk,
        }
    }

    /// Check that values make sense before a session is started.
    pub fn validate(&self) -> Result<()> {
        self.detection.open_mic.validate("detection.open_mic")?;
        self.detection.push_to_talk.validate("detection.push_to_talk")?;

        if self.channels.retry.max_attempts == 0 {
            return Err(anyhow::anyhow!("channels.retry.max_attempts must be greater than 0"));
        }
        if self.channels.keep_alive_ms == 0 {
            return Err(anyhow::anyhow!("channels.keep_alive_ms must be greater than 0"));
        }
        if self.transcript.history_limit == 0 {
            return Err(anyhow::anyhow!("transcript.history_limit must be greater than 0"));
        }
        if self.push_to_talk.frame_ms == 0 || self.push_to_talk.sample_rate == 0 {
            return Err(anyhow::anyhow!("push_to_talk frame size must be greater than 0"));
        }
        if self.monitor.tick_ms == 0 {
            return Err(anyhow::anyhow!("monitor.tick_ms must be greater than 0"));
        }
        if !self.monitor.window_size.is_power_of_two() || self.monitor.window_size < 32 {
            return Err(anyhow::anyhow!("monitor.window_size must be a power of two >= 32"));
        }
        if !(0.0..1.0).contains(&self.monitor.smoothing) {
            return Err(anyhow::anyhow!("monitor.smoothing must be within [0, 1)"));
        }

        let recognition = &self.channels.recognition;
        let (_, _, changed) = recognition
            .engine
            .coerce(recognition.model.as_deref(), &recognition.language);
        if changed {
            return Err(anyhow::anyhow!(
                "recognition model {:?} / language {} not offered by {}",
                recognition.model,
                recognition.language,
                recognition.engine
            ));
        }

        let synthesis = &self.channels.synthesis;
        if synthesis.engine.voice(&synthesis.voice).is_none() {
            return Err(anyhow::anyhow!(
                "voice {} not offered by {}",
                synthesis.voice,
                synthesis.engine
            ));
        }

        Ok(())
    }

    /// Bring engine, model, language and voice back in line with the catalog.
    ///
    /// Returns a description of every correction made.
    pub fn normalize_catalog(&mut self) -> Vec<String> {
        let mut corrections = Vec::new();

        let recognition = &mut self.channels.recognition;
        let (model, language, changed) = recognition
            .engine
            .coerce(recognition.model.as_deref(), &recognition.language);
        if changed {
            corrections.push(format!(
                "recognition {:?}/{} -> {:?}/{} for {}",
                recognition.model, recognition.language, model, language, recognition.engine
            ));
            recognition.model = model;
            recognition.language = language;
        }
        if !recognition.engine.supports_keywords() && !recognition.keywords.is_empty() {
            corrections.push(format!("keywords dropped for {}", recognition.engine));
            recognition.keywords.clear();
        }

        let synthesis = &mut self.channels.synthesis;
        let (voice, language, changed) = synthesis.engine.coerce(&synthesis.voice, &synthesis.language);
        if changed {
            corrections.push(format!(
                "synthesis {}/{} -> {}/{} for {}",
                synthesis.voice, synthesis.language, voice, language, synthesis.engine
            ));
            synthesis.voice = voice;
            synthesis.language = language;
        }

        corrections
    }

    /// Update configuration from a JSON string (runtime partial updates).
    ///
    /// Unlike [`EngineConfig::apply_stored`] this is strict: the result must
    /// pass [`EngineConfig::validate`].
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial: Value = serde_json::from_str(json_str)?;
        let mut current = serde_json::to_value(&*self)?;
        merge_json(&mut current, &partial);
        let updated: EngineConfig = serde_json::from_value(current)?;
        updated.validate()?;
        *self = updated;
        Ok(())
    }

    /// Overlay a persisted flat settings record.
    ///
    /// Values that are missing, of the wrong type or out of range keep their
    /// current value. Catalog coherence is re-established afterwards. Returns
    /// the keys that were rejected together with catalog corrections.
    pub fn apply_stored(&mut self, record: &Value) -> Vec<String> {
        let mut rejected = Vec::new();
        let Some(record) = record.as_object() else {
            return vec!["stored settings are not an object".to_string()];
        };

        if let Some(mode) = take_parsed::<InteractionMode>(record, "mode", &mut rejected) {
            self.session.mode = mode;
        }

        let mode = self.session.mode;
        let detection = self.detection_for_mut(mode);
        if let Some(v) = take_f32(record, "micThreshold", 0.0, 100.0, &mut rejected) {
            detection.mic_threshold = v;
        }
        if let Some(v) = take_f32(record, "speakerThreshold", 0.0, 100.0, &mut rejected) {
            detection.speaker_threshold = v;
        }
        if let Some(v) = take_f32(record, "priorityMultiplier", 0.1, 10.0, &mut rejected) {
            detection.priority_multiplier = v;
        }
        if let Some(v) = take_u64(record, "stateLockMs", 0, 10_000, &mut rejected) {
            detection.state_lock_ms = v;
        }
        if let Some(v) = take_u64(record, "userSilenceMs", 0, 10_000, &mut rejected) {
            detection.user_silence_ms = v;
        }

        let recognition = &mut self.channels.recognition;
        if let Some(engine) = take_parsed::<RecognitionEngine>(record, "recognitionEngine", &mut rejected) {
            recognition.engine = engine;
        }
        if let Some(model) = take_string(record, "recognitionModel", &mut rejected) {
            recognition.model = Some(model);
        }
        if let Some(language) = take_string(record, "recognitionLanguage", &mut rejected) {
            recognition.language = language;
        }
        if let Some(v) = take_bool(record, "smartFormat", &mut rejected) {
            recognition.smart_format = v;
        }
        if let Some(v) = take_bool(record, "profanityFilter", &mut rejected) {
            recognition.profanity_filter = v;
        }
        if record.get("utteranceEndMs").is_some_and(Value::is_null) {
            recognition.utterance_end_ms = None;
        } else if let Some(v) = take_u64(record, "utteranceEndMs", 0, 60_000, &mut rejected) {
            recognition.utterance_end_ms = Some(v as u32);
        }
        if let Some(keywords) = record.get("keywords") {
            match keywords.as_array() {
                Some(items) => {
                    recognition.keywords = items
                        .iter()
                        .filter_map(|k| k.as_str())
                        .map(str::trim)
                        .filter(|k| !k.is_empty())
                        .map(str::to_string)
                        .collect();
                }
                None => rejected.push("keywords".to_string()),
            }
        }

        let synthesis = &mut self.channels.synthesis;
        if let Some(engine) = take_parsed::<SynthesisEngine>(record, "synthesisEngine", &mut rejected) {
            synthesis.engine = engine;
        }
        if let Some(voice) = take_string(record, "voice", &mut rejected) {
            synthesis.voice = voice;
        }
        if let Some(language) = take_string(record, "synthesisLanguage", &mut rejected) {
            synthesis.language = language;
        }
        if let Some(v) = take_f32(record, "stability", 0.0, 1.0, &mut rejected) {
            synthesis.stability = v;
        }
        if let Some(v) = take_f32(record, "similarityBoost", 0.0, 1.0, &mut rejected) {
            synthesis.similarity_boost = v;
        }
        if let Some(v) = take_f32(record, "style", 0.0, 1.0, &mut rejected) {
            synthesis.style = v;
        }
        if let Some(v) = take_f32(record, "speed", 0.5, 2.0, &mut rejected) {
            synthesis.speed = v;
        }
        if let Some(v) = take_bool(record, "speakerBoost", &mut rejected) {
            synthesis.use_speaker_boost = v;
        }
        if let Some(v) = take_bool(record, "enableSsml", &mut rejected) {
            synthesis.enable_ssml = v;
        }
        if let Some(v) = take_string(record, "textNormalization", &mut rejected) {
            match v.as_str() {
                "auto" => synthesis.text_normalization = TextNormalization::Auto,
                "on" => synthesis.text_normalization = TextNormalization::On,
                "off" => synthesis.text_normalization = TextNormalization::Off,
                _ => rejected.push("textNormalization".to_string()),
            }
        }

        let mut report: Vec<String> = rejected.into_iter().map(|k| format!("rejected {}", k)).collect();
        report.extend(self.normalize_catalog());
        report
    }

    /// The flat record the host persists on confirm.
    pub fn to_stored_record(&self) -> Value {
        let detection = self.detection_for(self.session.mode);
        let recognition = &self.channels.recognition;
        let synthesis = &self.channels.synthesis;
        let mode = match self.session.mode {
            InteractionMode::OpenMic => "open_mic",
            InteractionMode::PushToTalk => "push_to_talk",
        };

        json!({
            "mode": mode,
            "micThreshold": detection.mic_threshold,
            "speakerThreshold": detection.speaker_threshold,
            "priorityMultiplier": detection.priority_multiplier,
            "stateLockMs": detection.state_lock_ms,
            "userSilenceMs": detection.user_silence_ms,
            "recognitionEngine": recognition.engine.as_str(),
            "recognitionModel": recognition.model,
            "recognitionLanguage": recognition.language,
            "smartFormat": recognition.smart_format,
            "profanityFilter": recognition.profanity_filter,
            "utteranceEndMs": recognition.utterance_end_ms,
            "keywords": recognition.keywords,
            "synthesisEngine": synthesis.engine.as_str(),
            "voice": synthesis.voice,
            "synthesisLanguage": synthesis.language,
            "stability": synthesis.stability,
            "similarityBoost": synthesis.similarity_boost,
            "style": synthesis.style,
            "speed": synthesis.speed,
            "speakerBoost": synthesis.use_speaker_boost,
            "enableSsml": synthesis.enable_ssml,
            "textNormalization": synthesis.text_normalization.as_str(),
        })
    }
}

fn merge_json(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                merge_json(target.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

fn take_f32(record: &Map<String, Value>, key: &str, min: f32, max: f32, rejected: &mut Vec<String>) -> Option<f32> {
    let value = record.get(key).filter(|v| !v.is_null())?;
    // Hosts frequently persist numbers as strings.
    let parsed = value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse::<f64>().ok()))
        .map(|v| v as f32)
        .filter(|v| v.is_finite() && (min..=max).contains(v));
    if parsed.is_none() {
        rejected.push(key.to_string());
    }
    parsed
}

fn take_u64(record: &Map<String, Value>, key: &str, min: u64, max: u64, rejected: &mut Vec<String>) -> Option<u64> {
    let value = record.get(key).filter(|v| !v.is_null())?;
    let parsed = value
        .as_u64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse::<u64>().ok()))
        .filter(|v| (min..=max).contains(v));
    if parsed.is_none() {
        rejected.push(key.to_string());
    }
    parsed
}

fn take_bool(record: &Map<String, Value>, key: &str, rejected: &mut Vec<String>) -> Option<bool> {
    let value = record.get(key).filter(|v| !v.is_null())?;
    let parsed = value.as_bool().or_else(|| match value.as_str() {
        Some("true") => Some(true),
        Some("false") => Some(false),
        _ => None,
    });
    if parsed.is_none() {
        rejected.push(key.to_string());
    }
    parsed
}

fn take_string(record: &Map<String, Value>, key: &str, rejected: &mut Vec<String>) -> Option<String> {
    let value = record.get(key).filter(|v| !v.is_null())?;
    let parsed = value
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    if parsed.is_none() {
        rejected.push(key.to_string());
    }
    parsed
}

fn take_parsed<T: std::str::FromStr>(record: &Map<String, Value>, key: &str, rejected: &mut Vec<String>) -> Option<T> {
    let raw = take_string(record, key, rejected)?;
    let parsed = raw.parse::<T>().ok();
    if parsed.is_none() {
        rejected.push(key.to_string());
    }
    parsed
}
