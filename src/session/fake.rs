//! In-memory backend and media engine used by orchestrator tests.

use super::backend::{
    AgentMessage, AgentReply, CaptureStream, MediaEngine, MediaRoom, PlaybackEvent, PlaybackHandles,
    PlaybackSink, RoomConnection, RoomEvent, SessionBackend, TransportGrant,
};
use crate::audio::SampleRing;
use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

const RING_RATE: u32 = 16000;
const RING_MS: u32 = 1000;

#[derive(Default)]
pub(crate) struct FakeBackend {
    fail_bootstrap: bool,
    create_failures: Mutex<u32>,
    calls: Mutex<Vec<String>>,
    messages: Mutex<Vec<AgentMessage>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_bootstrap(mut self) -> Self {
        self.fail_bootstrap = true;
        self
    }

    /// The first `count` session creations fail.
    pub fn failing_create(self, count: u32) -> Self {
        *self.create_failures.lock().unwrap() = count;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn messages(&self) -> Vec<AgentMessage> {
        self.messages.lock().unwrap().clone()
    }

    fn record(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
    }
}

#[async_trait]
impl SessionBackend for FakeBackend {
    async fn bootstrap(&self, agent_id: &str, _instance_id: &str) -> VoiceResult<String> {
        self.record("bootstrap");
        if self.fail_bootstrap {
            return Err(VoiceError::Transport("401 unauthorized".to_string()));
        }
        Ok(format!("cred-{}", agent_id))
    }

    async fn create_session(&self, _credential: &str, _agent_id: &str, _version_id: &str) -> VoiceResult<String> {
        self.record("create_session");
        let mut failures = self.create_failures.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return Err(VoiceError::Transport("503 service unavailable".to_string()));
        }
        Ok("sess-1".to_string())
    }

    async fn join_session(&self, _credential: &str, session_id: &str) -> VoiceResult<TransportGrant> {
        self.record("join_session");
        Ok(TransportGrant {
            url: "wss://media.test/room".to_string(),
            token: format!("grant-for-{}", session_id),
        })
    }

    async fn send_message(&self, _credential: &str, message: &AgentMessage) -> VoiceResult<Vec<AgentReply>> {
        self.record("send_message");
        self.messages.lock().unwrap().push(message.clone());
        Ok(vec![
            AgentReply {
                message: "One moment".to_string(),
            },
            AgentReply {
                message: format!("Reply to: {}", message.message_text),
            },
        ])
    }
}

/// What happened to the fake media room.
#[derive(Debug, Clone, Default)]
pub(crate) struct RoomLog {
    pub grant_tokens: Vec<String>,
    pub published: bool,
    pub publish_muted: bool,
    pub volume: f32,
    pub disconnected: bool,
}

/// What happened to the fake playback sink.
#[derive(Debug, Clone, Default)]
pub(crate) struct SinkLog {
    pub played: Vec<u64>,
    pub volume: f32,
    pub stopped: bool,
}

struct FakeRoom {
    log: Arc<Mutex<RoomLog>>,
    speaker_ring: Arc<SampleRing>,
}

#[async_trait]
impl MediaRoom for FakeRoom {
    async fn publish_microphone(&mut self, _frames: mpsc::UnboundedReceiver<Vec<i16>>) -> VoiceResult<()> {
        self.log.lock().unwrap().published = true;
        Ok(())
    }

    fn set_publish_muted(&mut self, muted: bool) {
        self.log.lock().unwrap().publish_muted = muted;
    }

    fn set_output_volume(&mut self, volume: f32) {
        self.log.lock().unwrap().volume = volume;
    }

    fn speaker_ring(&self) -> Arc<SampleRing> {
        Arc::clone(&self.speaker_ring)
    }

    async fn disconnect(&mut self) {
        self.log.lock().unwrap().disconnected = true;
    }
}

struct FakeSink {
    log: Arc<Mutex<SinkLog>>,
}

impl PlaybackSink for FakeSink {
    fn play(&mut self, chunk_id: u64, _samples: Vec<i16>) -> VoiceResult<()> {
        self.log.lock().unwrap().played.push(chunk_id);
        Ok(())
    }

    fn set_volume(&mut self, volume: f32) {
        self.log.lock().unwrap().volume = volume;
    }

    fn stop(&mut self) {
        self.log.lock().unwrap().stopped = true;
    }
}

#[derive(Default)]
pub(crate) struct FakeMedia {
    deny_microphone: bool,
    room_log: Arc<Mutex<RoomLog>>,
    sink_log: Arc<Mutex<SinkLog>>,
    capture_ring: Mutex<Option<Arc<SampleRing>>>,
    frames: Mutex<Option<mpsc::UnboundedSender<Vec<i16>>>>,
    room_events: Mutex<Option<mpsc::UnboundedSender<RoomEvent>>>,
    playback_events: Mutex<Option<mpsc::UnboundedSender<PlaybackEvent>>>,
}

impl FakeMedia {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn denying_microphone(mut self) -> Self {
        self.deny_microphone = true;
        self
    }

    pub fn room_log(&self) -> RoomLog {
        self.room_log.lock().unwrap().clone()
    }

    pub fn sink_log(&self) -> SinkLog {
        self.sink_log.lock().unwrap().clone()
    }

    pub fn capture_ring(&self) -> Option<Arc<SampleRing>> {
        self.capture_ring.lock().unwrap().clone()
    }

    /// Deliver one captured frame as if the microphone produced it.
    pub fn capture_frame(&self, samples: Vec<i16>) {
        if let Some(ring) = self.capture_ring() {
            ring.push_pcm(&samples);
        }
        if let Some(frames) = self.frames.lock().unwrap().as_ref() {
            let _ = frames.send(samples);
        }
    }

    pub fn room_event(&self, event: RoomEvent) {
        if let Some(events) = self.room_events.lock().unwrap().as_ref() {
            let _ = events.send(event);
        }
    }
}

#[async_trait]
impl MediaEngine for FakeMedia {
    async fn open_microphone(&self) -> VoiceResult<CaptureStream> {
        if self.deny_microphone {
            return Err(VoiceError::Media("microphone permission denied".to_string()));
        }
        let ring = Arc::new(SampleRing::with_duration(RING_RATE, RING_MS));
        let (frames_tx, frames) = mpsc::unbounded_channel();
        *self.capture_ring.lock().unwrap() = Some(Arc::clone(&ring));
        *self.frames.lock().unwrap() = Some(frames_tx);
        Ok(CaptureStream { ring, frames })
    }

    async fn connect_room(&self, grant: &TransportGrant) -> VoiceResult<RoomConnection> {
        self.room_log.lock().unwrap().grant_tokens.push(grant.token.clone());
        let (events_tx, events) = mpsc::unbounded_channel();
        *self.room_events.lock().unwrap() = Some(events_tx);
        Ok(RoomConnection {
            room: Box::new(FakeRoom {
                log: Arc::clone(&self.room_log),
                speaker_ring: Arc::new(SampleRing::with_duration(RING_RATE, RING_MS)),
            }),
            events,
        })
    }

    async fn open_playback(&self) -> VoiceResult<PlaybackHandles> {
        let (events_tx, events) = mpsc::unbounded_channel();
        *self.playback_events.lock().unwrap() = Some(events_tx);
        Ok(PlaybackHandles {
            sink: Box::new(FakeSink {
                log: Arc::clone(&self.sink_log),
            }),
            events,
            ring: Arc::new(SampleRing::with_duration(RING_RATE, RING_MS)),
        })
    }
}
