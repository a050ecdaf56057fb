//! # External Collaborators
//!
//! Everything the orchestrator needs from the outside world, behind traits:
//!
//! - [`SessionBackend`]: the remote agent service (credential bootstrap,
//!   session create/join, agent messages)
//! - [`MediaEngine`]: local microphone and playback plus the real-time media
//!   room used by the open-mic mode
//!
//! ## Audio Ownership:
//! A [`CaptureStream`] carries two views of the microphone. The ring is fed
//! with raw samples before any transmit mute and is only read by the level
//! monitor. The frame receiver is what gets transmitted.

use crate::audio::SampleRing;
use crate::error::VoiceResult;
use crate::transcript::Speaker;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Where and how to join the media transport of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportGrant {
    pub url: String,
    pub token: String,
}

/// Outbound text message to the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMessage {
    pub session_id: String,
    pub message_text: String,
    pub sequence_id: u64,
}

/// One message returned by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentReply {
    pub message: String,
}

#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// Exchange agent and instance identifiers for a bearer credential.
    async fn bootstrap(&self, agent_id: &str, instance_id: &str) -> VoiceResult<String>;

    /// Returns the new session id.
    async fn create_session(&self, credential: &str, agent_id: &str, version_id: &str) -> VoiceResult<String>;

    async fn join_session(&self, credential: &str, session_id: &str) -> VoiceResult<TransportGrant>;

    /// Replies come back in order; the last one is the agent's answer.
    async fn send_message(&self, credential: &str, message: &AgentMessage) -> VoiceResult<Vec<AgentReply>>;
}

/// Open microphone.
#[derive(Debug)]
pub struct CaptureStream {
    pub ring: Arc<SampleRing>,
    pub frames: mpsc::UnboundedReceiver<Vec<i16>>,
}

/// Something the media room reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomEvent {
    Transcript {
        speaker: Speaker,
        text: String,
        is_final: bool,
    },
    Disconnected {
        reason: String,
    },
}

/// A joined real-time media room.
#[async_trait]
pub trait MediaRoom: Send {
    /// Publish the outbound microphone track.
    async fn publish_microphone(&mut self, frames: mpsc::UnboundedReceiver<Vec<i16>>) -> VoiceResult<()>;

    /// Stop (or resume) transmitting without releasing the microphone.
    fn set_publish_muted(&mut self, muted: bool);

    /// Volume of the agent's inbound audio, 0.0 to 1.0.
    fn set_output_volume(&mut self, volume: f32);

    /// Inbound agent audio as it is played.
    fn speaker_ring(&self) -> Arc<SampleRing>;

    async fn disconnect(&mut self);
}

pub struct RoomConnection {
    pub room: Box<dyn MediaRoom>,
    pub events: mpsc::UnboundedReceiver<RoomEvent>,
}

/// Completion report for a queued chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEvent {
    Finished { chunk_id: u64 },
    Failed { chunk_id: u64, error: String },
}

/// Local audio output for synthesized speech.
pub trait PlaybackSink: Send {
    /// Queue samples; completion arrives as a [`PlaybackEvent`].
    fn play(&mut self, chunk_id: u64, samples: Vec<i16>) -> VoiceResult<()>;

    fn set_volume(&mut self, volume: f32);

    /// Drop everything queued and release the device.
    fn stop(&mut self);
}

pub struct PlaybackHandles {
    pub sink: Box<dyn PlaybackSink>,
    pub events: mpsc::UnboundedReceiver<PlaybackEvent>,
    /// Samples as they are played, for level monitoring
    pub ring: Arc<SampleRing>,
}

#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Fails with a media error when there is no device or permission.
    async fn open_microphone(&self) -> VoiceResult<CaptureStream>;

    async fn connect_room(&self, grant: &TransportGrant) -> VoiceResult<RoomConnection>;

    async fn open_playback(&self) -> VoiceResult<PlaybackHandles>;
}
