//! # Voice Session Orchestrator
//!
//! The top-level state machine of a voice conversation.
//!
//! ## Connect Handshake (strictly sequential):
//! 1. **Bootstrap**: exchange agent/instance ids for a credential (no retry)
//! 2. **Create session**: retried per the retry policy
//! 3. **Join transport**: open-mic joins the session and connects the media
//!    room (one retried step); push-to-talk opens the recognition and
//!    synthesis channels (each with its own retries)
//! 4. **Local media**: open the microphone, publish it (open-mic) or open the
//!    playback sink (push-to-talk), start both level monitors
//!
//! A failure at any step releases everything acquired so far and leaves the
//! orchestrator `Idle` with a status naming the step.
//!
//! ## Event Loop:
//! [`VoiceSessionOrchestrator::run`] owns the orchestrator exclusively and
//! selects over commands, channel/room/playback events, captured audio, the
//! level tick, the playback poll and push-to-talk deadlines. Callers talk to
//! it through a cloneable [`OrchestratorHandle`].
//!
//! ## Cancellation:
//! Each connect cycle gets a fresh `CancellationToken`. The handle cancels it
//! before queueing a disconnect, so a handshake stuck in a retry loop gives up
//! at once. Channel managers hold child tokens.

use super::backend::{
    AgentMessage, CaptureStream, MediaEngine, MediaRoom, PlaybackEvent, PlaybackSink, RoomEvent,
    SessionBackend,
};
use super::playback::PlaybackTracker;
use super::presence::{self, PresenceMachine};
use super::push_to_talk::{PushToTalk, PushToTalkAction};
use super::{ConnectionState, PresenceState, Session};
use crate::audio::pcm::{self, AudioFormat};
use crate::audio::{AudioLevelMonitor, LevelSource, SampleRing};
use crate::channel::{
    recognition, synthesis, with_retry, ChannelConnector, ChannelContext, ChannelEvent, ChannelParams,
    ChannelRole, ChannelTiming, DuplexChannelManager, Frame, RetryPolicy, NORMAL_CLOSURE,
};
use crate::config::{DetectionConfig, EngineConfig, InteractionMode, MonitorConfig};
use crate::error::{HandshakeStep, VoiceError, VoiceResult};
use crate::status::StatusBoard;
use crate::transcript::{Speaker, TranscriptBuffer, TranscriptEntry};
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

const EVENT_CAPACITY: usize = 256;
const COMMAND_CAPACITY: usize = 32;

/// Updates published to observers (a UI, a logger, tests).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Connection { state: ConnectionState },
    Presence { state: PresenceState },
    Transcript { entries: Vec<TranscriptEntry> },
    AgentVolume { volume: f32 },
    AgentReply { text: String },
    SpeechFinished,
}

enum Command {
    Connect(oneshot::Sender<VoiceResult<()>>),
    Disconnect(oneshot::Sender<()>),
    ToggleMute(oneshot::Sender<VoiceResult<bool>>),
    PressToTalk(oneshot::Sender<VoiceResult<()>>),
    ReleaseToTalk(oneshot::Sender<VoiceResult<()>>),
    Shutdown,
}

/// Everything acquired for a live session. Released as a unit.
#[derive(Default)]
struct LiveMedia {
    credential: String,
    capture_ring: Option<Arc<SampleRing>>,
    frames: Option<mpsc::UnboundedReceiver<Vec<i16>>>,
    mic_monitor: Option<AudioLevelMonitor>,
    speaker_monitor: Option<AudioLevelMonitor>,
    speaker_level: Option<watch::Receiver<f32>>,
    room: Option<Box<dyn MediaRoom>>,
    room_events: Option<mpsc::UnboundedReceiver<RoomEvent>>,
    playback: Option<Box<dyn PlaybackSink>>,
    playback_ring: Option<Arc<SampleRing>>,
    playback_events: Option<mpsc::UnboundedReceiver<PlaybackEvent>>,
    recognition: Option<DuplexChannelManager>,
    synthesis: Option<DuplexChannelManager>,
}

impl LiveMedia {
    async fn release(mut self) {
        if let Some(channel) = self.recognition.take() {
            channel.close();
        }
        if let Some(channel) = self.synthesis.take() {
            channel.close();
        }
        if let Some(monitor) = self.mic_monitor.take() {
            monitor.stop();
        }
        if let Some(monitor) = self.speaker_monitor.take() {
            monitor.stop();
        }
        if let Some(ring) = self.capture_ring.take() {
            ring.close();
        }
        if let Some(mut sink) = self.playback.take() {
            sink.stop();
        }
        if let Some(ring) = self.playback_ring.take() {
            ring.close();
        }
        if let Some(mut room) = self.room.take() {
            room.disconnect().await;
        }
    }
}

pub struct VoiceSessionOrchestrator {
    config: EngineConfig,
    mode: InteractionMode,
    detection: DetectionConfig,
    backend: Arc<dyn SessionBackend>,
    media: Arc<dyn MediaEngine>,
    connector: Arc<dyn ChannelConnector>,
    status: StatusBoard,
    events: broadcast::Sender<SessionEvent>,
    connection: watch::Sender<ConnectionState>,
    cancel: Arc<Mutex<CancellationToken>>,
    channel_events_tx: mpsc::UnboundedSender<ChannelEvent>,
    channel_events_rx: mpsc::UnboundedReceiver<ChannelEvent>,
    session: Option<Session>,
    live: Option<LiveMedia>,
    presence: PresenceMachine,
    transcript: TranscriptBuffer,
    playback: PlaybackTracker,
    push_to_talk: PushToTalk,
    silence_frame: Vec<u8>,
    mic_level: f32,
    speaker_level: f32,
    output_volume: f32,
}

impl VoiceSessionOrchestrator {
    pub fn new(
        config: EngineConfig,
        backend: Arc<dyn SessionBackend>,
        media: Arc<dyn MediaEngine>,
        connector: Arc<dyn ChannelConnector>,
    ) -> VoiceResult<Self> {
        config.validate()?;
        let mode = config.session.mode;
        let detection = *config.detection_for(mode);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (connection, _) = watch::channel(ConnectionState::Disconnected);
        let (channel_events_tx, channel_events_rx) = mpsc::unbounded_channel();
        let ptt = config.push_to_talk;
        let silence_frame = pcm::silence_frame(
            &AudioFormat {
                sample_rate: ptt.sample_rate,
                ..AudioFormat::default()
            },
            ptt.frame_samples(),
        );

        Ok(Self {
            transcript: TranscriptBuffer::new(config.transcript.history_limit),
            push_to_talk: PushToTalk::new(&ptt),
            config,
            mode,
            detection,
            backend,
            media,
            connector,
            status: StatusBoard::new(),
            events,
            connection,
            cancel: Arc::new(Mutex::new(CancellationToken::new())),
            channel_events_tx,
            channel_events_rx,
            session: None,
            live: None,
            presence: PresenceMachine::new(Instant::now()),
            playback: PlaybackTracker::new(),
            silence_frame,
            mic_level: 0.0,
            speaker_level: 0.0,
            output_volume: 1.0,
        })
    }

    pub fn mode(&self) -> InteractionMode {
        self.mode
    }

    pub fn presence(&self) -> PresenceState {
        self.presence.state()
    }

    pub fn presence_machine(&self) -> &PresenceMachine {
        &self.presence
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.connection.borrow()
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn transcript(&self) -> &TranscriptBuffer {
        &self.transcript
    }

    /// Last (microphone, speaker) levels fed into presence detection.
    pub fn levels(&self) -> (f32, f32) {
        (self.mic_level, self.speaker_level)
    }

    pub fn output_volume(&self) -> f32 {
        self.output_volume
    }

    pub fn status(&self) -> &StatusBoard {
        &self.status
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SessionEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    fn emit_transcript(&self) {
        self.emit(SessionEvent::Transcript {
            entries: self.transcript.display_messages(),
        });
    }

    fn cancel_token(&self) -> CancellationToken {
        self.cancel.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set_connection(&self, state: ConnectionState) {
        let previous = self.connection.send_replace(state);
        if previous != state {
            self.emit(SessionEvent::Connection { state });
        }
    }

    fn set_presence(&mut self, state: PresenceState) {
        if self.presence.force(state, Instant::now()) {
            debug!(state = %state, "Presence set");
            self.emit(SessionEvent::Presence { state });
        }
    }

    fn ready_detail(&self) -> &'static str {
        match self.mode {
            InteractionMode::OpenMic => "Speak any time",
            InteractionMode::PushToTalk => "Hold to talk",
        }
    }

    fn recognition(&self) -> Option<DuplexChannelManager> {
        self.live.as_ref().and_then(|live| live.recognition.clone())
    }

    fn synthesis(&self) -> Option<DuplexChannelManager> {
        self.live.as_ref().and_then(|live| live.synthesis.clone())
    }

    /// Run the connect handshake. A no-op when a session is already active.
    pub async fn connect(&mut self) -> VoiceResult<()> {
        if self.connection_state() != ConnectionState::Disconnected {
            debug!("Connect ignored, session already active");
            return Ok(());
        }

        let cancel = CancellationToken::new();
        *self.cancel.lock().unwrap_or_else(PoisonError::into_inner) = cancel.clone();
        self.set_connection(ConnectionState::Connecting);
        self.set_presence(PresenceState::Connecting);
        self.status.set("Connecting", None);
        info!(mode = ?self.mode, agent_id = %self.config.session.agent_id, "Starting voice session");

        match self.handshake(&cancel).await {
            Ok(session) => {
                info!(session_id = %session.session_id, "Voice session connected");
                self.session = Some(session);
                self.presence.reset_speech_timing(Instant::now());
                self.set_connection(ConnectionState::Connected);
                self.set_presence(PresenceState::Connected);
                self.status.set("Connected", Some(self.ready_detail().to_string()));
                Ok(())
            }
            Err(VoiceError::Cancelled) => {
                info!("Connect cancelled");
                self.teardown().await;
                self.status.set("Disconnected", None);
                Err(VoiceError::Cancelled)
            }
            Err(e) => {
                error!(error = %e, "Voice session failed to connect");
                self.teardown().await;
                self.status.set("Connection failed", Some(e.to_string()));
                Err(e)
            }
        }
    }

    async fn handshake(&mut self, cancel: &CancellationToken) -> VoiceResult<Session> {
        let backend_handle = Arc::clone(&self.backend);
        let media_handle = Arc::clone(&self.media);
        let backend: &dyn SessionBackend = backend_handle.as_ref();
        let media: &dyn MediaEngine = media_handle.as_ref();
        let policy = RetryPolicy::from(&self.config.channels.retry);
        let monitor_config = self.config.monitor;
        let status = self.status.clone();
        let session_config = self.config.session.clone();

        // 1. Credential
        status.set("Connecting", Some("Authenticating".to_string()));
        let credential = cancellable(
            cancel,
            backend.bootstrap(&session_config.agent_id, &session_config.instance_id),
        )
        .await
        .map_err(|e| e.at_step(HandshakeStep::Bootstrap))?;
        self.live = Some(LiveMedia {
            credential: credential.clone(),
            ..LiveMedia::default()
        });

        // 2. Remote session
        let credential_ref = credential.as_str();
        let agent_id = session_config.agent_id.as_str();
        let version_id = session_config.version_id.as_str();
        let session_id = with_retry(&policy, "session", &status, cancel, move |_| {
            backend.create_session(credential_ref, agent_id, version_id)
        })
        .await
        .map_err(|e| e.at_step(HandshakeStep::CreateSession))?;
        debug!(session_id = %session_id, "Remote session created");

        // 3. Transport
        match self.mode {
            InteractionMode::OpenMic => {
                let session_ref = session_id.as_str();
                let connection = with_retry(&policy, "media transport", &status, cancel, move |_| async move {
                    let grant = backend.join_session(credential_ref, session_ref).await?;
                    media.connect_room(&grant).await
                })
                .await
                .map_err(|e| e.at_step(HandshakeStep::JoinTransport))?;

                let live = self.live.get_or_insert_with(LiveMedia::default);
                live.room = Some(connection.room);
                live.room_events = Some(connection.events);
            }
            InteractionMode::PushToTalk => {
                let recognition = self.open_channel(
                    ChannelParams::Recognition(self.config.channels.recognition.clone()),
                    cancel,
                );
                let synthesis = self.open_channel(
                    ChannelParams::Synthesis(self.config.channels.synthesis.clone()),
                    cancel,
                );
                let live = self.live.get_or_insert_with(LiveMedia::default);
                live.recognition = Some(recognition.clone());
                live.synthesis = Some(synthesis.clone());

                recognition
                    .connect(credential_ref)
                    .await
                    .map_err(|e| e.at_step(HandshakeStep::JoinTransport))?;
                synthesis
                    .connect(credential_ref)
                    .await
                    .map_err(|e| e.at_step(HandshakeStep::JoinTransport))?;
            }
        }

        // 4. Local media
        status.set("Connecting", Some("Starting microphone".to_string()));
        let CaptureStream { ring, frames } = cancellable(cancel, media.open_microphone())
            .await
            .map_err(|e| e.at_step(HandshakeStep::LocalMedia))?;

        let live = self.live.get_or_insert_with(LiveMedia::default);
        live.mic_monitor = start_monitor(Arc::clone(&ring), LevelSource::Microphone, &monitor_config);
        live.capture_ring = Some(ring);

        match self.mode {
            InteractionMode::OpenMic => {
                let room = live
                    .room
                    .as_mut()
                    .ok_or_else(|| VoiceError::Media("media room missing".to_string()))
                    .map_err(|e| e.at_step(HandshakeStep::LocalMedia))?;
                cancellable(cancel, room.publish_microphone(frames))
                    .await
                    .map_err(|e| e.at_step(HandshakeStep::LocalMedia))?;

                let monitor = start_monitor(room.speaker_ring(), LevelSource::Speaker, &monitor_config);
                live.speaker_level = monitor.as_ref().map(AudioLevelMonitor::subscribe);
                live.speaker_monitor = monitor;
            }
            InteractionMode::PushToTalk => {
                let handles = cancellable(cancel, media.open_playback())
                    .await
                    .map_err(|e| e.at_step(HandshakeStep::LocalMedia))?;

                let monitor = start_monitor(Arc::clone(&handles.ring), LevelSource::Speaker, &monitor_config);
                live.speaker_level = monitor.as_ref().map(AudioLevelMonitor::subscribe);
                if let (Some(monitor), Some(synthesis)) = (monitor, live.synthesis.as_ref()) {
                    synthesis.attach_monitor(monitor);
                }
                live.playback = Some(handles.sink);
                live.playback_events = Some(handles.events);
                live.playback_ring = Some(handles.ring);
                live.frames = Some(frames);
            }
        }

        Ok(Session::new(session_id))
    }

    fn open_channel(&self, params: ChannelParams, cancel: &CancellationToken) -> DuplexChannelManager {
        DuplexChannelManager::new(
            params,
            Arc::clone(&self.connector),
            ChannelTiming::from(&self.config.channels),
            ChannelContext {
                status: self.status.clone(),
                events: self.channel_events_tx.clone(),
                session_state: self.connection.subscribe(),
                cancel: cancel.child_token(),
            },
        )
    }

    /// Release everything and return to `Idle`. The status line is left alone.
    async fn teardown(&mut self) {
        self.cancel_token().cancel();
        self.set_connection(ConnectionState::Disconnected);
        if let Some(live) = self.live.take() {
            live.release().await;
        }
        self.session = None;
        self.transcript.clear();
        self.playback.reset();
        self.push_to_talk.reset();
        self.mic_level = 0.0;
        self.speaker_level = 0.0;
        self.output_volume = 1.0;
        self.set_presence(PresenceState::Idle);
        self.emit_transcript();
    }

    /// End the session. Safe to call in any state, any number of times.
    pub async fn disconnect(&mut self) {
        let was_active = self.live.is_some() || self.session.is_some();
        self.teardown().await;
        self.status.set("Disconnected", None);
        if was_active {
            info!("Voice session disconnected");
        }
    }

    /// Flip the user mute. Returns the new mute state.
    pub fn toggle_mute(&mut self) -> VoiceResult<bool> {
        let now = Instant::now();
        let session = self.session.as_mut().ok_or(VoiceError::NotConnected)?;
        session.muted_by_user = !session.muted_by_user;
        let muted = session.muted_by_user;

        if let Some(live) = self.live.as_mut() {
            if let Some(room) = live.room.as_mut() {
                room.set_publish_muted(muted);
            }
            if muted {
                if let Some(recognition) = &live.recognition {
                    recognition.set_transmitting(false);
                }
            }
        }

        if muted {
            self.push_to_talk.reset();
            self.set_presence(PresenceState::Muted);
        } else {
            // Start over as if freshly connected so stale timing cannot
            // read as ongoing speech.
            self.presence.reset_speech_timing(now);
            self.mic_level = 0.0;
            self.speaker_level = 0.0;
            self.set_presence(PresenceState::Connected);
        }
        self.apply_output_volume(now);

        info!(muted, "Microphone mute toggled");
        Ok(muted)
    }

    /// Start transmitting captured audio (push-to-talk mode).
    pub fn press_to_talk(&mut self) -> VoiceResult<()> {
        if self.mode != InteractionMode::PushToTalk {
            return Err(VoiceError::Validation("push-to-talk is not enabled".to_string()));
        }
        let session = self.session.as_ref().ok_or(VoiceError::NotConnected)?;
        if session.muted_by_user {
            return Err(VoiceError::Validation("microphone is muted".to_string()));
        }
        let recognition = self.recognition().ok_or(VoiceError::NotConnected)?;
        if !recognition.is_open() {
            return Err(VoiceError::Transport(format!("{} channel is not open", ChannelRole::Recognition)));
        }
        if !self.push_to_talk.press() {
            return Ok(());
        }

        if self.playback.is_active() {
            debug!("Talking over the agent, dropping queued audio");
            if let Some(sink) = self.live.as_mut().and_then(|live| live.playback.as_mut()) {
                sink.stop();
            }
            self.playback.reset();
        }

        recognition.set_transmitting(true);
        self.set_presence(PresenceState::Listening);
        Ok(())
    }

    /// Begin the release sequence; the utterance is submitted once it ends.
    pub fn release_to_talk(&mut self) -> VoiceResult<()> {
        if self.session.is_none() {
            return Err(VoiceError::NotConnected);
        }
        if self.push_to_talk.release(Instant::now()) {
            debug!("Push-to-talk released, settling");
        }
        Ok(())
    }

    /// Carry out whatever the push-to-talk sequence has due at `now`.
    pub async fn poll_push_to_talk(&mut self, now: Instant) {
        while let Some(action) = self.push_to_talk.poll(now) {
            match action {
                PushToTalkAction::SendSilence => {
                    if let Some(recognition) = self.recognition() {
                        if let Err(e) = recognition.send(Frame::Binary(self.silence_frame.clone())) {
                            warn!(error = %e, "Failed to send settle frame");
                        }
                    }
                }
                PushToTalkAction::StopTransmitting => {
                    if let Some(recognition) = self.recognition() {
                        recognition.set_transmitting(false);
                    }
                }
                PushToTalkAction::Submit(text) => self.submit_utterance(&text).await,
            }
        }
    }

    async fn submit_utterance(&mut self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            debug!("Nothing recognized, not contacting the agent");
            self.set_presence(PresenceState::Connected);
            return;
        }
        let (Some(session), Some(live)) = (self.session.as_mut(), self.live.as_ref()) else {
            return;
        };

        let message = AgentMessage {
            session_id: session.session_id.clone(),
            message_text: text.to_string(),
            sequence_id: session.next_sequence(),
        };
        let credential = live.credential.clone();
        self.set_presence(PresenceState::Connected);

        let cancel = self.cancel_token();
        let backend = Arc::clone(&self.backend);
        info!(sequence_id = message.sequence_id, chars = text.len(), "Sending utterance to agent");
        match cancellable(&cancel, backend.send_message(&credential, &message)).await {
            Ok(replies) => match replies.last() {
                Some(reply) => self.handle_agent_reply(&reply.message),
                None => warn!(sequence_id = message.sequence_id, "Agent returned no messages"),
            },
            Err(VoiceError::Cancelled) => debug!("Agent message abandoned"),
            Err(e) => {
                error!(error = %e, "Agent message failed");
                self.status.set("Connected", Some(format!("Agent did not respond: {}", e)));
            }
        }
    }

    fn handle_agent_reply(&mut self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        if let Some(session) = self.session.as_mut() {
            session.has_had_first_exchange = true;
        }
        self.transcript.add_message(text, Speaker::Agent, true);
        self.emit_transcript();
        self.emit(SessionEvent::AgentReply {
            text: text.to_string(),
        });

        self.playback.reset();
        match self.synthesis() {
            Some(channel) => {
                if let Err(e) = channel.send(synthesis::request_frame(text)) {
                    warn!(error = %e, "Could not request speech synthesis");
                }
            }
            None => warn!("No synthesis channel for agent reply"),
        }
    }

    /// React to a duplex channel notification.
    pub async fn handle_channel_event(&mut self, event: ChannelEvent) {
        if self.session.is_none() {
            trace!(?event, "Ignoring channel event without a session");
            return;
        }
        match event {
            ChannelEvent::Message {
                role: ChannelRole::Recognition,
                frame: Frame::Text(text),
            } => self.on_recognition(&text),
            ChannelEvent::Message {
                role: ChannelRole::Synthesis,
                frame: Frame::Text(text),
            } => self.on_synthesis(&text),
            ChannelEvent::Message { role, frame } => {
                trace!(role = %role, bytes = frame.len(), "Ignoring binary frame");
            }
            ChannelEvent::Closed { role, code, reason } if code == NORMAL_CLOSURE => {
                // A normal close is never retried, so the session cannot continue.
                warn!(role = %role, reason = %reason, "Channel closed by server, ending session");
                self.teardown().await;
                self.status
                    .set("Connection issue", Some(format!("{} channel closed by server", role)));
            }
            ChannelEvent::Closed { role, code, .. } => debug!(role = %role, code, "Channel closed, reconnecting"),
            ChannelEvent::Reconnected { role } => info!(role = %role, "Channel recovered"),
            ChannelEvent::ReconnectFailed { role, error } => {
                error!(role = %role, error = %error, "Channel lost, ending session");
                // The channel already put up "Connection issue"; keep it.
                self.teardown().await;
            }
        }
    }

    fn on_recognition(&mut self, text: &str) {
        let results = match recognition::parse_message(text) {
            Ok(results) => results,
            Err(e) => {
                warn!(error = %e, "Unreadable recognition message");
                return;
            }
        };
        if results.is_empty() {
            return;
        }
        for result in results {
            self.transcript.add_message(&result.text, Speaker::User, result.is_final);
            if result.is_final {
                self.push_to_talk.on_final(&result.text);
            }
        }
        self.emit_transcript();
    }

    fn on_synthesis(&mut self, text: &str) {
        let chunk = match synthesis::parse_message(text) {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(error = %e, "Unreadable synthesis message");
                return;
            }
        };
        if let Some(audio) = chunk.audio {
            self.play_chunk(&audio);
        }
        if chunk.is_final {
            debug!("Synthesis complete marker received");
            self.playback.mark_complete();
        }
    }

    fn play_chunk(&mut self, encoded: &str) {
        let chunk_id = self.playback.chunk_started();
        self.set_presence(PresenceState::Speaking);

        let sink = self.live.as_mut().and_then(|live| live.playback.as_mut());
        let result = pcm::decode_base64_chunk(encoded).and_then(|samples| match sink {
            Some(sink) => sink.play(chunk_id, samples),
            None => Err(VoiceError::Playback("no playback device".to_string())),
        });
        if let Err(e) = result {
            // Count it as done or end-of-speech would wait forever.
            warn!(chunk_id, error = %e, "Dropping audio chunk");
            self.playback.chunk_finished(chunk_id);
        }
    }

    /// React to a media room notification.
    pub async fn handle_room_event(&mut self, event: RoomEvent) {
        if self.session.is_none() {
            return;
        }
        match event {
            RoomEvent::Transcript {
                speaker,
                text,
                is_final,
            } => {
                if speaker == Speaker::Agent {
                    if let Some(session) = self.session.as_mut() {
                        session.has_had_first_exchange = true;
                    }
                }
                self.transcript.add_message(&text, speaker, is_final);
                self.emit_transcript();
            }
            RoomEvent::Disconnected { reason } => {
                error!(reason = %reason, "Media room lost, ending session");
                self.teardown().await;
                self.status.set("Connection issue", Some(reason));
            }
        }
    }

    pub fn handle_playback_event(&mut self, event: PlaybackEvent) {
        let chunk_id = match event {
            PlaybackEvent::Finished { chunk_id } => {
                trace!(chunk_id, "Chunk played");
                chunk_id
            }
            PlaybackEvent::Failed { chunk_id, error } => {
                warn!(chunk_id, error = %error, "Chunk playback failed");
                chunk_id
            }
        };
        self.playback.chunk_finished(chunk_id);
    }

    fn forward_capture(&mut self, samples: Vec<i16>) {
        if !self.push_to_talk.is_pressed() {
            return;
        }
        if let Some(recognition) = self.recognition() {
            if let Err(e) = recognition.send(Frame::Binary(pcm::encode_pcm16_le(&samples))) {
                debug!(error = %e, "Dropping captured frame");
            }
        }
    }

    /// Frame-cadence update: read both monitors and feed presence detection.
    pub fn tick(&mut self, now: Instant) {
        let Some(live) = self.live.as_ref() else {
            return;
        };
        let mic = live.mic_monitor.as_ref().map(AudioLevelMonitor::level).unwrap_or(0.0);
        let speaker = live.speaker_level.as_ref().map(|level| *level.borrow()).unwrap_or(0.0);
        self.observe_levels(mic, speaker, now);
    }

    /// Feed one pair of levels into presence detection and the
    /// interruption-prevention policy.
    pub fn observe_levels(&mut self, mic: f32, speaker: f32, now: Instant) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let muted = session.muted_by_user;
        self.mic_level = mic;
        self.speaker_level = speaker;

        // Push-to-talk presence follows press/playback events instead.
        let drive_state = self.mode == InteractionMode::OpenMic;
        if let Some(state) = self
            .presence
            .observe(mic, speaker, muted, &self.detection, drive_state, now)
        {
            debug!(state = %state, mic, speaker, "Presence changed");
            self.emit(SessionEvent::Presence { state });
        }
        self.apply_output_volume(now);
    }

    fn apply_output_volume(&mut self, now: Instant) {
        let (first_exchange, muted) = self
            .session
            .as_ref()
            .map(|s| (s.has_had_first_exchange, s.muted_by_user))
            .unwrap_or((false, false));
        let volume = presence::agent_output_volume(
            first_exchange,
            muted,
            self.presence.last_user_speech_at(),
            now,
            self.detection.user_silence(),
        );
        if volume == self.output_volume {
            return;
        }

        self.output_volume = volume;
        if let Some(live) = self.live.as_mut() {
            if let Some(room) = live.room.as_mut() {
                room.set_output_volume(volume);
            }
            if let Some(sink) = live.playback.as_mut() {
                sink.set_volume(volume);
            }
        }
        debug!(volume, "Agent output volume changed");
        self.emit(SessionEvent::AgentVolume { volume });
    }

    /// Playback-poll update: detect the end of agent speech.
    pub fn poll_playback(&mut self, now: Instant) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let muted = session.muted_by_user;
        if !self.playback.poll(self.speaker_level, &self.detection, now) {
            return;
        }

        info!("Agent finished speaking");
        if self.presence.state() == PresenceState::Speaking {
            self.set_presence(if muted {
                PresenceState::Muted
            } else {
                PresenceState::Connected
            });
        }
        self.emit(SessionEvent::SpeechFinished);
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect(reply) => {
                let result = self.connect().await;
                let _ = reply.send(result);
            }
            Command::Disconnect(reply) => {
                self.disconnect().await;
                let _ = reply.send(());
            }
            Command::ToggleMute(reply) => {
                let _ = reply.send(self.toggle_mute());
            }
            Command::PressToTalk(reply) => {
                let _ = reply.send(self.press_to_talk());
            }
            Command::ReleaseToTalk(reply) => {
                let _ = reply.send(self.release_to_talk());
            }
            Command::Shutdown => {}
        }
    }

    /// Move the orchestrator onto its own task.
    pub fn spawn(self) -> (OrchestratorHandle, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
        let handle = OrchestratorHandle {
            commands: commands_tx,
            cancel: Arc::clone(&self.cancel),
            events: self.events.clone(),
            status: self.status.clone(),
        };
        let task = tokio::spawn(self.run(commands_rx));
        (handle, task)
    }

    /// Event loop. Ends (after disconnecting) on shutdown or when every
    /// handle is gone.
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut frame_tick = tokio::time::interval(Duration::from_millis(self.config.monitor.tick_ms.max(1)));
        frame_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut poll_tick = tokio::time::interval(self.detection.playback_poll());
        poll_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(mode = ?self.mode, "Orchestrator running");
        loop {
            let deadline = self.push_to_talk.next_deadline();
            let wake = {
                let (room_rx, playback_rx, capture_rx) = match self.live.as_mut() {
                    Some(live) => (
                        live.room_events.as_mut(),
                        live.playback_events.as_mut(),
                        live.frames.as_mut(),
                    ),
                    None => (None, None, None),
                };
                tokio::select! {
                    command = commands.recv() => Wake::Command(command),
                    Some(event) = self.channel_events_rx.recv() => Wake::Channel(event),
                    event = recv_optional(room_rx) => Wake::Room(event),
                    event = recv_optional(playback_rx) => Wake::Playback(event),
                    samples = recv_optional(capture_rx) => Wake::Capture(samples),
                    _ = sleep_until_optional(deadline) => Wake::PushToTalk,
                    _ = poll_tick.tick() => Wake::Poll,
                    _ = frame_tick.tick() => Wake::Frame,
                }
            };

            match wake {
                Wake::Command(None) | Wake::Command(Some(Command::Shutdown)) => {
                    self.disconnect().await;
                    break;
                }
                Wake::Command(Some(command)) => self.handle_command(command).await,
                Wake::Channel(event) => self.handle_channel_event(event).await,
                Wake::Room(Some(event)) => self.handle_room_event(event).await,
                Wake::Room(None) => {
                    if let Some(live) = self.live.as_mut() {
                        live.room_events = None;
                    }
                }
                Wake::Playback(Some(event)) => self.handle_playback_event(event),
                Wake::Playback(None) => {
                    if let Some(live) = self.live.as_mut() {
                        live.playback_events = None;
                    }
                }
                Wake::Capture(Some(samples)) => self.forward_capture(samples),
                Wake::Capture(None) => {
                    if let Some(live) = self.live.as_mut() {
                        live.frames = None;
                    }
                }
                Wake::PushToTalk => self.poll_push_to_talk(Instant::now()).await,
                Wake::Poll => self.poll_playback(Instant::now()),
                Wake::Frame => self.tick(Instant::now()),
            }
        }
        info!("Orchestrator stopped");
    }

    #[cfg(test)]
    pub(crate) async fn drain_channel_events(&mut self) {
        while let Ok(event) = self.channel_events_rx.try_recv() {
            self.handle_channel_event(event).await;
        }
    }
}

enum Wake {
    Command(Option<Command>),
    Channel(ChannelEvent),
    Room(Option<RoomEvent>),
    Playback(Option<PlaybackEvent>),
    Capture(Option<Vec<i16>>),
    PushToTalk,
    Poll,
    Frame,
}

async fn recv_optional<T>(rx: Option<&mut mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_optional(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn cancellable<T>(cancel: &CancellationToken, operation: impl Future<Output = VoiceResult<T>>) -> VoiceResult<T> {
    tokio::select! {
        _ = cancel.cancelled() => Err(VoiceError::Cancelled),
        result = operation => result,
    }
}

fn start_monitor(ring: Arc<SampleRing>, source: LevelSource, config: &MonitorConfig) -> Option<AudioLevelMonitor> {
    match AudioLevelMonitor::start(ring, source, config) {
        Ok(monitor) => Some(monitor),
        Err(e) => {
            warn!(source = %source, error = %e, "Level monitoring unavailable");
            None
        }
    }
}

/// Cloneable front door to a spawned orchestrator.
#[derive(Clone)]
pub struct OrchestratorHandle {
    commands: mpsc::Sender<Command>,
    cancel: Arc<Mutex<CancellationToken>>,
    events: broadcast::Sender<SessionEvent>,
    status: StatusBoard,
}

impl OrchestratorHandle {
    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> VoiceResult<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(command(reply_tx))
            .await
            .map_err(|_| VoiceError::Cancelled)?;
        reply_rx.await.map_err(|_| VoiceError::Cancelled)
    }

    pub async fn connect(&self) -> VoiceResult<()> {
        self.request(Command::Connect).await?
    }

    /// Cancels any in-flight handshake immediately, then tears down.
    pub async fn disconnect(&self) {
        self.cancel.lock().unwrap_or_else(PoisonError::into_inner).cancel();
        let _ = self.request(Command::Disconnect).await;
    }

    pub async fn toggle_mute(&self) -> VoiceResult<bool> {
        self.request(Command::ToggleMute).await?
    }

    pub async fn press_to_talk(&self) -> VoiceResult<()> {
        self.request(Command::PressToTalk).await?
    }

    pub async fn release_to_talk(&self) -> VoiceResult<()> {
        self.request(Command::ReleaseToTalk).await?
    }

    /// Disconnect and stop the event loop.
    pub async fn shutdown(&self) {
        self.cancel.lock().unwrap_or_else(PoisonError::into_inner).cancel();
        let _ = self.commands.send(Command::Shutdown).await;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> &StatusBoard {
        &self.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::fake::FakeConnector;
    use crate::session::fake::{FakeBackend, FakeMedia};
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    struct Rig {
        orchestrator: VoiceSessionOrchestrator,
        backend: Arc<FakeBackend>,
        media: Arc<FakeMedia>,
        connector: Arc<FakeConnector>,
    }

    fn rig_with(mode: InteractionMode, backend: FakeBackend, media: FakeMedia, connector: Arc<FakeConnector>) -> Rig {
        let mut config = EngineConfig::default();
        config.session.agent_id = "agent-1".to_string();
        config.session.instance_id = "org-1".to_string();
        config.session.version_id = "v1".to_string();
        config.session.mode = mode;

        let backend = Arc::new(backend);
        let media = Arc::new(media);
        let orchestrator =
            VoiceSessionOrchestrator::new(config, backend.clone(), media.clone(), connector.clone()).unwrap();
        Rig {
            orchestrator,
            backend,
            media,
            connector,
        }
    }

    fn rig(mode: InteractionMode) -> Rig {
        rig_with(mode, FakeBackend::new(), FakeMedia::new(), FakeConnector::new())
    }

    async fn connected(mode: InteractionMode) -> Rig {
        let mut rig = rig(mode);
        rig.orchestrator.connect().await.unwrap();
        rig
    }

    /// Let channel driver tasks run, then handle what they forwarded.
    async fn settle(rig: &mut Rig) {
        tokio::time::sleep(Duration::from_millis(5)).await;
        rig.orchestrator.drain_channel_events().await;
    }

    /// Advance time in 50 ms steps, running the push-to-talk sequence.
    async fn run_push_to_talk(rig: &mut Rig, total_ms: u64) {
        for _ in 0..=(total_ms / 50) {
            rig.orchestrator.poll_push_to_talk(Instant::now()).await;
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    fn recognition_final(text: &str) -> String {
        serde_json::json!({
            "results": [{ "alternatives": [{ "transcript": text }], "isPartial": false }]
        })
        .to_string()
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let mut config = EngineConfig::default();
        config.monitor.window_size = 1;
        let result = VoiceSessionOrchestrator::new(
            config,
            Arc::new(FakeBackend::new()),
            Arc::new(FakeMedia::new()),
            FakeConnector::new(),
        );
        assert!(matches!(result, Err(VoiceError::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_mic_handshake_runs_in_order() {
        let rig = connected(InteractionMode::OpenMic).await;
        let orchestrator = &rig.orchestrator;

        assert_eq!(rig.backend.calls(), vec!["bootstrap", "create_session", "join_session"]);
        assert_eq!(orchestrator.connection_state(), ConnectionState::Connected);
        assert_eq!(orchestrator.presence(), PresenceState::Connected);
        assert_eq!(orchestrator.session().unwrap().session_id, "sess-1");
        assert_eq!(orchestrator.status().current().text, "Connected");

        let room = rig.media.room_log();
        assert!(room.published);
        assert_eq!(room.grant_tokens, vec!["grant-for-sess-1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_bootstrap_leaves_idle() {
        let mut rig = rig_with(
            InteractionMode::OpenMic,
            FakeBackend::new().failing_bootstrap(),
            FakeMedia::new(),
            FakeConnector::new(),
        );

        let result = rig.orchestrator.connect().await;
        assert!(matches!(
            result,
            Err(VoiceError::Handshake {
                step: HandshakeStep::Bootstrap,
                ..
            })
        ));
        assert_eq!(rig.backend.calls(), vec!["bootstrap"]);
        assert_eq!(rig.orchestrator.presence(), PresenceState::Idle);
        assert_eq!(rig.orchestrator.connection_state(), ConnectionState::Disconnected);

        let status = rig.orchestrator.status().current();
        assert_eq!(status.text, "Connection failed");
        assert!(status.detail.unwrap().contains("bootstrap"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_session_retries_then_fails() {
        let mut rig = rig_with(
            InteractionMode::OpenMic,
            FakeBackend::new().failing_create(5),
            FakeMedia::new(),
            FakeConnector::new(),
        );
        let started = Instant::now();

        let result = rig.orchestrator.connect().await;
        assert!(matches!(
            result,
            Err(VoiceError::Handshake {
                step: HandshakeStep::CreateSession,
                ..
            })
        ));
        let creates = rig.backend.calls().iter().filter(|c| *c == "create_session").count();
        assert_eq!(creates, 3);
        assert_eq!(started.elapsed(), Duration::from_secs(2));
        assert_eq!(rig.orchestrator.presence(), PresenceState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_microphone_failure_releases_transport() {
        let mut rig = rig_with(
            InteractionMode::OpenMic,
            FakeBackend::new(),
            FakeMedia::new().denying_microphone(),
            FakeConnector::new(),
        );

        let result = rig.orchestrator.connect().await;
        assert!(matches!(
            result,
            Err(VoiceError::Handshake {
                step: HandshakeStep::LocalMedia,
                ..
            })
        ));
        assert!(rig.media.room_log().disconnected);
        assert!(rig.orchestrator.session().is_none());
        assert_eq!(rig.orchestrator.presence(), PresenceState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_path_into_listening() {
        let mut rig = connected(InteractionMode::OpenMic).await;
        let now = Instant::now();

        rig.orchestrator.observe_levels(12.0, 2.0, now);
        assert_eq!(rig.orchestrator.presence(), PresenceState::Listening);
    }

    #[tokio::test(start_paused = true)]
    async fn test_speaking_is_held_during_state_lock() {
        let mut rig = connected(InteractionMode::OpenMic).await;
        let t0 = Instant::now();

        rig.orchestrator.observe_levels(0.0, 20.0, t0);
        assert_eq!(rig.orchestrator.presence(), PresenceState::Speaking);

        rig.orchestrator.observe_levels(12.0, 2.0, t0 + Duration::from_millis(400));
        assert_eq!(rig.orchestrator.presence(), PresenceState::Speaking);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmute_resets_speech_timing() {
        let mut rig = connected(InteractionMode::OpenMic).await;
        rig.orchestrator.observe_levels(12.0, 2.0, Instant::now());
        assert!(rig.orchestrator.presence_machine().last_user_speech_at().is_some());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(rig.orchestrator.toggle_mute(), Ok(true));
        assert_eq!(rig.orchestrator.presence(), PresenceState::Muted);
        assert!(rig.media.room_log().publish_muted);

        assert_eq!(rig.orchestrator.toggle_mute(), Ok(false));
        assert!(!rig.media.room_log().publish_muted);
        assert_eq!(rig.orchestrator.presence_machine().last_user_speech_at(), None);
        assert_eq!(rig.orchestrator.levels(), (0.0, 0.0));
        assert_eq!(rig.orchestrator.presence(), PresenceState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_agent_is_silenced_while_user_speaks() {
        let mut rig = connected(InteractionMode::OpenMic).await;
        let t0 = Instant::now();

        // Before the first agent utterance the agent is never silenced.
        rig.orchestrator.observe_levels(12.0, 0.0, t0);
        assert_eq!(rig.orchestrator.output_volume(), 1.0);

        rig.orchestrator
            .handle_room_event(RoomEvent::Transcript {
                speaker: Speaker::Agent,
                text: "Hi, how can I help?".to_string(),
                is_final: true,
            })
            .await;
        rig.orchestrator.observe_levels(12.0, 0.0, t0 + Duration::from_millis(100));
        assert_eq!(rig.orchestrator.output_volume(), 0.0);
        assert_eq!(rig.media.room_log().volume, 0.0);

        rig.orchestrator.observe_levels(0.0, 0.0, t0 + Duration::from_millis(700));
        assert_eq!(rig.orchestrator.output_volume(), 1.0);
        assert_eq!(rig.media.room_log().volume, 1.0);

        // Muted: held at full volume regardless of speech timing.
        rig.orchestrator.toggle_mute().unwrap();
        rig.orchestrator.observe_levels(30.0, 0.0, t0 + Duration::from_millis(800));
        assert_eq!(rig.orchestrator.output_volume(), 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_is_idempotent() {
        let mut rig = connected(InteractionMode::OpenMic).await;
        rig.orchestrator
            .handle_room_event(RoomEvent::Transcript {
                speaker: Speaker::User,
                text: "hello".to_string(),
                is_final: true,
            })
            .await;
        assert!(!rig.orchestrator.transcript().is_empty());

        rig.orchestrator.disconnect().await;
        rig.orchestrator.disconnect().await;

        assert_eq!(rig.orchestrator.presence(), PresenceState::Idle);
        assert_eq!(rig.orchestrator.connection_state(), ConnectionState::Disconnected);
        assert!(rig.orchestrator.transcript().is_empty());
        assert!(rig.media.room_log().disconnected);
        assert!(rig.media.capture_ring().unwrap().is_closed());
        assert_eq!(rig.orchestrator.toggle_mute(), Err(VoiceError::NotConnected));
        assert_eq!(rig.orchestrator.status().current().text, "Disconnected");
    }

    #[tokio::test(start_paused = true)]
    async fn test_room_loss_ends_session() {
        let mut rig = connected(InteractionMode::OpenMic).await;
        rig.orchestrator
            .handle_room_event(RoomEvent::Disconnected {
                reason: "server shutdown".to_string(),
            })
            .await;

        assert_eq!(rig.orchestrator.presence(), PresenceState::Idle);
        assert_eq!(rig.orchestrator.status().current().text, "Connection issue");
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_to_talk_connect_opens_both_channels() {
        let rig = connected(InteractionMode::PushToTalk).await;

        assert_eq!(rig.backend.calls(), vec!["bootstrap", "create_session"]);
        let opened = rig.connector.opened();
        assert_eq!(opened.len(), 2);
        assert!(opened[0].url.as_str().contains("/stt"));
        assert!(opened[1].url.as_str().contains("/tts"));
        assert_eq!(opened[0].protocols, vec!["wss", "cred-agent-1", "agentforce"]);
        assert_eq!(rig.orchestrator.presence(), PresenceState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_to_talk_turns_carry_increasing_sequence_ids() {
        let mut rig = connected(InteractionMode::PushToTalk).await;
        let recognition = rig.connector.remote(0);
        let synthesis = rig.connector.remote(1);

        for (turn, utterance) in ["where is my order", "and the refund"].iter().enumerate() {
            rig.orchestrator.press_to_talk().unwrap();
            assert_eq!(rig.orchestrator.presence(), PresenceState::Listening);

            rig.media.capture_frame(vec![100; 1600]);
            tokio::time::sleep(Duration::from_millis(5)).await;
            let mut pending = Vec::new();
            if let Some(frames) = rig.orchestrator.live.as_mut().and_then(|l| l.frames.as_mut()) {
                while let Ok(frame) = frames.try_recv() {
                    pending.push(frame);
                }
            }
            for frame in pending {
                rig.orchestrator.forward_capture(frame);
            }

            recognition.push_text(&recognition_final(utterance));
            settle(&mut rig).await;

            rig.orchestrator.release_to_talk().unwrap();
            run_push_to_talk(&mut rig, 1000).await;

            let messages = rig.backend.messages();
            assert_eq!(messages.len(), turn + 1);
            assert_eq!(messages[turn].sequence_id, turn as u64 + 1);
            assert_eq!(messages[turn].message_text, *utterance);
            assert_eq!(messages[turn].session_id, "sess-1");
        }

        let silence_frames = recognition
            .sent()
            .into_iter()
            .filter(|f| matches!(f, Frame::Binary(data) if data.len() == 3200 && data.iter().all(|b| *b == 0)))
            .count();
        assert_eq!(silence_frames, 10);

        let requests = synthesis.sent_text();
        assert!(requests.iter().any(|r| r.contains("Reply to: where is my order")));
        assert!(requests.iter().any(|r| r.contains("Reply to: and the refund")));
        assert!(rig.orchestrator.session().unwrap().has_had_first_exchange);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_utterance_is_not_sent() {
        let mut rig = connected(InteractionMode::PushToTalk).await;
        rig.orchestrator.press_to_talk().unwrap();
        rig.orchestrator.release_to_talk().unwrap();
        run_push_to_talk(&mut rig, 1000).await;

        assert!(rig.backend.messages().is_empty());
        assert_eq!(rig.orchestrator.presence(), PresenceState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_press_requires_push_to_talk_mode() {
        let mut rig = connected(InteractionMode::OpenMic).await;
        assert!(matches!(rig.orchestrator.press_to_talk(), Err(VoiceError::Validation(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_synthesis_playback_completes_after_marker_and_silence() {
        let mut rig = connected(InteractionMode::PushToTalk).await;
        let synthesis = rig.connector.remote(1);
        let audio = STANDARD.encode(pcm::encode_pcm16_le(&[500; 160]));

        synthesis.push_text(&serde_json::json!({ "audio": audio }).to_string());
        synthesis.push_text(r#"{"isFinal":true}"#);
        settle(&mut rig).await;

        assert_eq!(rig.orchestrator.presence(), PresenceState::Speaking);
        assert_eq!(rig.media.sink_log().played, vec![0]);

        let t0 = Instant::now();
        rig.orchestrator.poll_playback(t0);
        rig.orchestrator.poll_playback(t0 + Duration::from_millis(400));
        assert_eq!(rig.orchestrator.presence(), PresenceState::Speaking);

        let mut events = rig.orchestrator.subscribe();
        rig.orchestrator.handle_playback_event(PlaybackEvent::Finished { chunk_id: 0 });
        rig.orchestrator.poll_playback(t0 + Duration::from_millis(600));
        rig.orchestrator.poll_playback(t0 + Duration::from_millis(800));

        assert_eq!(rig.orchestrator.presence(), PresenceState::Connected);
        let mut finished = false;
        while let Ok(event) = events.try_recv() {
            finished |= event == SessionEvent::SpeechFinished;
        }
        assert!(finished);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_chunk_does_not_stall_completion() {
        let mut rig = connected(InteractionMode::PushToTalk).await;
        let synthesis = rig.connector.remote(1);

        synthesis.push_text(r#"{"audio":"%%%","isFinal":true}"#);
        settle(&mut rig).await;
        assert!(rig.media.sink_log().played.is_empty());

        let t0 = Instant::now();
        rig.orchestrator.poll_playback(t0);
        rig.orchestrator.poll_playback(t0 + Duration::from_millis(200));
        assert_eq!(rig.orchestrator.presence(), PresenceState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_failure_returns_to_idle() {
        let mut rig = rig_with(
            InteractionMode::PushToTalk,
            FakeBackend::new(),
            FakeMedia::new(),
            FakeConnector::scripted(&[true, true, false, false, false]),
        );
        rig.orchestrator.connect().await.unwrap();

        rig.connector.remote(0).close(1006);
        for _ in 0..40 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            rig.orchestrator.drain_channel_events().await;
            if rig.orchestrator.presence() == PresenceState::Idle {
                break;
            }
        }

        assert_eq!(rig.orchestrator.presence(), PresenceState::Idle);
        assert_eq!(rig.orchestrator.connection_state(), ConnectionState::Disconnected);
        assert_eq!(rig.orchestrator.status().current().text, "Connection issue");
        assert_eq!(rig.connector.opened().len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_normal_remote_close_ends_session() {
        let mut rig = connected(InteractionMode::PushToTalk).await;
        let synthesis = rig.connector.remote(1);

        rig.connector.remote(0).close(1000);
        settle(&mut rig).await;

        assert_eq!(rig.orchestrator.presence(), PresenceState::Idle);
        assert_eq!(rig.orchestrator.connection_state(), ConnectionState::Disconnected);
        let status = rig.orchestrator.status().current();
        assert_eq!(status.text, "Connection issue");
        assert_eq!(status.detail.as_deref(), Some("speech recognition channel closed by server"));

        tokio::time::sleep(Duration::from_secs(4)).await;
        rig.orchestrator.drain_channel_events().await;
        assert_eq!(synthesis.closed_with(), Some(1000));
        assert_eq!(rig.connector.opened().len(), 2);
        assert_eq!(rig.orchestrator.status().current().text, "Connection issue");
        assert_eq!(rig.orchestrator.press_to_talk(), Err(VoiceError::NotConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_disconnect_cancels_handshake() {
        let rig = rig_with(
            InteractionMode::OpenMic,
            FakeBackend::new().failing_create(10),
            FakeMedia::new(),
            FakeConnector::new(),
        );
        let backend = rig.backend.clone();
        let (handle, task) = rig.orchestrator.spawn();

        let connecting = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.connect().await })
        };
        tokio::time::sleep(Duration::from_millis(1500)).await;
        handle.disconnect().await;

        assert_eq!(connecting.await.unwrap(), Err(VoiceError::Cancelled));
        let creates = backend.calls().iter().filter(|c| *c == "create_session").count();
        assert_eq!(creates, 2);
        assert_eq!(handle.status().current().text, "Disconnected");

        handle.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_press_interrupts_agent_playback() {
        let mut rig = connected(InteractionMode::PushToTalk).await;
        let synthesis = rig.connector.remote(1);
        let audio = STANDARD.encode(pcm::encode_pcm16_le(&[500; 160]));
        rig.orchestrator.handle_agent_reply("Your order shipped yesterday.");
        synthesis.push_text(&serde_json::json!({ "audio": audio }).to_string());
        settle(&mut rig).await;
        assert_eq!(rig.orchestrator.presence(), PresenceState::Speaking);

        rig.orchestrator.press_to_talk().unwrap();
        assert!(rig.media.sink_log().stopped);
        assert_eq!(rig.orchestrator.presence(), PresenceState::Listening);

        rig.orchestrator.observe_levels(12.0, 0.0, Instant::now());
        assert_eq!(rig.orchestrator.output_volume(), 0.0);
        assert_eq!(rig.media.sink_log().volume, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_completion_from_interrupted_reply_is_ignored() {
        let mut rig = connected(InteractionMode::PushToTalk).await;
        let synthesis = rig.connector.remote(1);
        let chunk = serde_json::json!({ "audio": STANDARD.encode(pcm::encode_pcm16_le(&[500; 160])) }).to_string();

        synthesis.push_text(&chunk);
        settle(&mut rig).await;
        rig.orchestrator.press_to_talk().unwrap();
        assert_eq!(rig.orchestrator.playback.in_flight(), 0);

        synthesis.push_text(&chunk);
        settle(&mut rig).await;
        assert_eq!(rig.media.sink_log().played, vec![0, 1]);

        rig.orchestrator.handle_playback_event(PlaybackEvent::Finished { chunk_id: 0 });
        assert_eq!(rig.orchestrator.playback.in_flight(), 1);
        rig.orchestrator.handle_playback_event(PlaybackEvent::Finished { chunk_id: 1 });
        assert_eq!(rig.orchestrator.playback.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_loop_publishes_room_transcripts() {
        let rig = rig(InteractionMode::OpenMic);
        let media = rig.media.clone();
        let (handle, task) = rig.orchestrator.spawn();
        let mut events = handle.subscribe();

        handle.connect().await.unwrap();
        media.room_event(RoomEvent::Transcript {
            speaker: Speaker::Agent,
            text: "Hello there".to_string(),
            is_final: true,
        });

        let entries = loop {
            match events.recv().await.unwrap() {
                SessionEvent::Transcript { entries } if !entries.is_empty() => break entries,
                _ => continue,
            }
        };
        assert_eq!(entries[0].text, "Hello there");
        assert_eq!(entries[0].speaker, Speaker::Agent);

        assert_eq!(handle.toggle_mute().await, Ok(true));
        handle.shutdown().await;
        task.await.unwrap();
        assert!(media.room_log().disconnected);
    }
}
