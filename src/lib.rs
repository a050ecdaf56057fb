//! # Voice Session Engine
//!
//! Client-side orchestration of real-time voice conversations with a remote
//! conversational agent.
//!
//! ## Architecture:
//! - **audio**: sample rings, PCM conversions and the level monitor
//! - **channel**: duplex streaming channels to speech recognition and
//!   synthesis, with keep-alive, retries and reconnection
//! - **transcript**: the rolling conversation transcript
//! - **session**: presence detection, playback completion, push-to-talk and
//!   the orchestrator that ties them together
//! - **config**: layered configuration (defaults, TOML file, environment)
//! - **catalog**: what each speech engine supports
//! - **status**: the user-visible status line
//! - **error**: the engine error type

pub mod audio;
pub mod catalog;
pub mod channel;
pub mod config;
pub mod error;
pub mod session;
pub mod status;
pub mod transcript;

pub use config::{EngineConfig, InteractionMode};
pub use error::{HandshakeStep, VoiceError, VoiceResult};
pub use session::{
    ConnectionState, OrchestratorHandle, PresenceState, SessionEvent, VoiceSessionOrchestrator,
};
pub use status::{StatusBoard, StatusReport};
pub use transcript::{Speaker, TranscriptBuffer, TranscriptEntry};
