//! # Voice Session
//!
//! Session identity plus the state machines the orchestrator drives.
//!
//! ## Components:
//! - **presence**: level-driven presence with dwell-time locking
//! - **playback**: end-of-speech detection for synthesized audio
//! - **push_to_talk**: timed release sequence of the push-to-talk mode
//! - **backend**: traits for the remote session service and local media
//! - **orchestrator**: the top-level state machine tying it all together

pub mod backend;
pub mod orchestrator;
pub mod playback;
pub mod presence;
pub mod push_to_talk;

#[cfg(test)]
pub(crate) mod fake;

pub use backend::{
    AgentMessage, AgentReply, CaptureStream, MediaEngine, MediaRoom, PlaybackEvent, PlaybackHandles,
    PlaybackSink, RoomConnection, RoomEvent, SessionBackend, TransportGrant,
};
pub use orchestrator::{OrchestratorHandle, SessionEvent, VoiceSessionOrchestrator};
pub use playback::PlaybackTracker;
pub use presence::PresenceMachine;
pub use push_to_talk::PushToTalk;

use serde::Serialize;
use std::fmt;

/// Transport-level state of the session, shared with channel tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Conversational state shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceState {
    Idle,
    Connecting,
    Connected,
    Listening,
    Speaking,
    Muted,
}

impl PresenceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceState::Idle => "idle",
            PresenceState::Connecting => "connecting",
            PresenceState::Connected => "connected",
            PresenceState::Listening => "listening",
            PresenceState::Speaking => "speaking",
            PresenceState::Muted => "muted",
        }
    }

    /// States in which a session is live.
    pub fn is_live(&self) -> bool {
        !matches!(self, PresenceState::Idle | PresenceState::Connecting)
    }
}

impl fmt::Display for PresenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One live conversation with the agent.
///
/// Created when the handshake completes and dropped on disconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub session_id: String,
    sequence_number: u64,
    pub muted_by_user: bool,
    /// Set by the first agent utterance, never cleared within the session
    pub has_had_first_exchange: bool,
}

impl Session {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            sequence_number: 0,
            muted_by_user: false,
            has_had_first_exchange: false,
        }
    }

    /// Sequence id for the next outbound agent message (1 for the first).
    pub fn next_sequence(&mut self) -> u64 {
        self.sequence_number += 1;
        self.sequence_number
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }
}
