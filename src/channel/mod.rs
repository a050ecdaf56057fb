//! # Duplex Channels
//!
//! A [`DuplexChannelManager`] owns one streaming socket: the speech-recognition
//! input channel or the speech-synthesis output channel.
//!
//! ## Channel Lifecycle:
//! ```text
//! Idle -> Connecting -> Open -> Closing -> Closed
//!             ^                              |
//!             +------ auto-reconnect --------+   (unexpected close only)
//! ```
//!
//! ## Responsibilities:
//! - **Connect**: build the URL, open through a [`ChannelConnector`], retry up
//!   to the policy's budget
//! - **Keep-alive**: periodic innocuous traffic so the remote does not time out
//! - **Auto-reconnect**: when the socket drops while the session is connected,
//!   wait briefly and run the retrying connect again, once
//! - **Teardown**: stop keep-alive, stop the attached level monitor, close the
//!   socket, release handles; safe to repeat
//!
//! ## Task Layout:
//! Each open socket is moved into a driver task that multiplexes outbound
//! frames and inbound events. The manager only keeps the sender half plus the
//! keep-alive task handle. Background tasks hold a `Weak` reference so a
//! dropped manager winds down on its own.

pub mod recognition;
pub mod retry;
pub mod socket;
pub mod synthesis;

#[cfg(test)]
pub(crate) mod fake;

pub use retry::{with_retry, RetryPolicy};
pub use socket::{ChannelConnector, ChannelSocket, Frame, SocketEvent, WebSocketConnector, NORMAL_CLOSURE};

use crate::audio::AudioLevelMonitor;
use crate::config::{ChannelsConfig, RecognitionSettings, SynthesisSettings};
use crate::error::{VoiceError, VoiceResult};
use crate::session::ConnectionState;
use crate::status::StatusBoard;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelRole {
    Recognition,
    Synthesis,
}

impl ChannelRole {
    pub fn label(&self) -> &'static str {
        match self {
            ChannelRole::Recognition => "speech recognition",
            ChannelRole::Synthesis => "speech synthesis",
        }
    }
}

impl fmt::Display for ChannelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Notifications sent to the channel's owner.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Message { role: ChannelRole, frame: Frame },
    Closed { role: ChannelRole, code: u16, reason: String },
    Reconnected { role: ChannelRole },
    /// Automatic recovery gave up; a fresh user-initiated connect is needed
    ReconnectFailed { role: ChannelRole, error: VoiceError },
}

/// Role-specific parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelParams {
    Recognition(RecognitionSettings),
    Synthesis(SynthesisSettings),
}

impl ChannelParams {
    pub fn role(&self) -> ChannelRole {
        match self {
            ChannelParams::Recognition(_) => ChannelRole::Recognition,
            ChannelParams::Synthesis(_) => ChannelRole::Synthesis,
        }
    }

    pub fn build_url(&self) -> VoiceResult<Url> {
        match self {
            ChannelParams::Recognition(settings) => recognition::build_url(settings),
            ChannelParams::Synthesis(settings) => synthesis::build_url(settings),
        }
    }

    fn keep_alive_frame(&self, transmitting: bool) -> Option<Frame> {
        match self {
            ChannelParams::Recognition(_) => recognition::keep_alive_frame(transmitting),
            ChannelParams::Synthesis(_) => Some(synthesis::keep_alive_frame()),
        }
    }
}

/// Timers shared by both channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelTiming {
    pub keep_alive: Duration,
    pub reconnect_delay: Duration,
    pub retry: RetryPolicy,
}

impl From<&ChannelsConfig> for ChannelTiming {
    fn from(config: &ChannelsConfig) -> Self {
        Self {
            keep_alive: Duration::from_millis(config.keep_alive_ms.max(1)),
            reconnect_delay: Duration::from_millis(config.reconnect_delay_ms),
            retry: RetryPolicy::from(&config.retry),
        }
    }
}

/// What a manager needs from the session that owns it.
#[derive(Debug, Clone)]
pub struct ChannelContext {
    pub status: StatusBoard,
    pub events: mpsc::UnboundedSender<ChannelEvent>,
    /// Auto-reconnect only runs while this reads `Connected`
    pub session_state: watch::Receiver<ConnectionState>,
    pub cancel: CancellationToken,
}

enum Outbound {
    Frame(Frame),
    Close,
}

struct LiveSocket {
    generation: u64,
    outbound: mpsc::UnboundedSender<Outbound>,
    keep_alive: JoinHandle<()>,
}

struct Slot {
    state: ChannelState,
    live: Option<LiveSocket>,
    monitor: Option<AudioLevelMonitor>,
    credential: Option<String>,
}

struct Inner {
    params: ChannelParams,
    connector: Arc<dyn ChannelConnector>,
    timing: ChannelTiming,
    status: StatusBoard,
    events: mpsc::UnboundedSender<ChannelEvent>,
    session_state: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
    transmitting: AtomicBool,
    generation: AtomicU64,
    slot: Mutex<Slot>,
}

/// Owner of one duplex channel. Cheap to clone; clones share the channel.
#[derive(Clone)]
pub struct DuplexChannelManager {
    inner: Arc<Inner>,
}

impl DuplexChannelManager {
    pub fn new(
        params: ChannelParams,
        connector: Arc<dyn ChannelConnector>,
        timing: ChannelTiming,
        context: ChannelContext,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                params,
                connector,
                timing,
                status: context.status,
                events: context.events,
                session_state: context.session_state,
                cancel: context.cancel,
                transmitting: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                slot: Mutex::new(Slot {
                    state: ChannelState::Idle,
                    live: None,
                    monitor: None,
                    credential: None,
                }),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.inner.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn role(&self) -> ChannelRole {
        self.inner.params.role()
    }

    pub fn state(&self) -> ChannelState {
        self.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// Open the channel, retrying per the configured policy.
    pub async fn connect(&self, credential: &str) -> VoiceResult<()> {
        self.lock().credential = Some(credential.to_string());
        let policy = self.inner.timing.retry;
        with_retry(
            &policy,
            self.role().label(),
            &self.inner.status,
            &self.inner.cancel,
            move |_| self.connect_once(credential),
        )
        .await
    }

    /// A single open attempt. Any previous socket is released first.
    pub async fn connect_once(&self, credential: &str) -> VoiceResult<()> {
        let role = self.role();
        self.release_socket();
        if self.inner.cancel.is_cancelled() {
            return Err(VoiceError::Cancelled);
        }

        let url = self.inner.params.build_url()?;
        let protocols = socket::subprotocols(credential);
        self.set_state(ChannelState::Connecting);
        debug!(role = %role, endpoint = %url.path(), "Opening channel");

        let mut socket = match self.inner.connector.open(&url, &protocols).await {
            Ok(socket) => socket,
            Err(e) => {
                self.set_state(ChannelState::Closed);
                return Err(e);
            }
        };

        if self.inner.cancel.is_cancelled() {
            socket.close(NORMAL_CLOSURE, "session ended").await;
            self.set_state(ChannelState::Closed);
            return Err(VoiceError::Cancelled);
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let keep_alive = tokio::spawn(keep_alive_loop(
            Arc::downgrade(&self.inner),
            outbound.clone(),
            self.inner.timing.keep_alive,
        ));
        {
            let mut slot = self.lock();
            slot.live = Some(LiveSocket {
                generation,
                outbound,
                keep_alive,
            });
            slot.state = ChannelState::Open;
        }
        tokio::spawn(drive_socket(
            Arc::downgrade(&self.inner),
            socket,
            outbound_rx,
            generation,
        ));

        info!(role = %role, generation, "Channel open");
        Ok(())
    }

    /// Queue a frame for sending.
    pub fn send(&self, frame: Frame) -> VoiceResult<()> {
        let slot = self.lock();
        match &slot.live {
            Some(live) if slot.state == ChannelState::Open => live
                .outbound
                .send(Outbound::Frame(frame))
                .map_err(|_| VoiceError::Transport(format!("{} channel is closed", self.role()))),
            _ => Err(VoiceError::Transport(format!("{} channel is not open", self.role()))),
        }
    }

    /// Mark whether real audio is flowing; suppresses recognition keep-alive.
    pub fn set_transmitting(&self, transmitting: bool) {
        self.inner.transmitting.store(transmitting, Ordering::SeqCst);
    }

    pub fn is_transmitting(&self) -> bool {
        self.inner.transmitting.load(Ordering::SeqCst)
    }

    /// Tie a level monitor's lifetime to this channel.
    pub fn attach_monitor(&self, monitor: AudioLevelMonitor) {
        if let Some(previous) = self.lock().monitor.replace(monitor) {
            previous.stop();
        }
    }

    /// Tear the channel down for good.
    ///
    /// Unconditional and idempotent; pending retries and reconnects are
    /// cancelled too.
    pub fn close(&self) {
        let role = self.role();
        self.inner.cancel.cancel();

        let mut slot = self.lock();
        if slot.state != ChannelState::Closed {
            slot.state = ChannelState::Closing;
        }
        let live = slot.live.take();
        if let Some(live) = &live {
            live.keep_alive.abort();
        }
        if let Some(monitor) = slot.monitor.take() {
            monitor.stop();
        }
        if let Some(live) = live {
            let _ = live.outbound.send(Outbound::Close);
        }
        slot.credential = None;
        slot.state = ChannelState::Closed;
        drop(slot);

        self.inner.transmitting.store(false, Ordering::SeqCst);
        debug!(role = %role, "Channel torn down");
    }

    fn set_state(&self, state: ChannelState) {
        self.lock().state = state;
    }

    fn release_socket(&self) {
        let mut slot = self.lock();
        if let Some(live) = slot.live.take() {
            live.keep_alive.abort();
            let _ = live.outbound.send(Outbound::Close);
            debug!(role = %self.role(), generation = live.generation, "Released previous socket");
        }
    }

    fn should_reconnect(&self) -> bool {
        !self.inner.cancel.is_cancelled()
            && *self.inner.session_state.borrow() == ConnectionState::Connected
    }

    fn on_remote_close(&self, generation: u64, code: u16, reason: String) {
        let role = self.role();
        {
            let mut slot = self.lock();
            if slot.live.as_ref().map(|live| live.generation) != Some(generation) {
                trace!(role = %role, generation, "Ignoring close of a released socket");
                return;
            }
            if let Some(live) = slot.live.take() {
                live.keep_alive.abort();
            }
            slot.state = ChannelState::Closed;
        }

        warn!(role = %role, code, reason = %reason, "Channel closed by remote");
        let _ = self.inner.events.send(ChannelEvent::Closed {
            role,
            code,
            reason,
        });

        if code == NORMAL_CLOSURE {
            info!(role = %role, "Normal closure, not reconnecting");
            return;
        }
        if !self.should_reconnect() {
            debug!(role = %role, "Session not connected, not reconnecting");
            return;
        }

        let manager = self.clone();
        tokio::spawn(async move { manager.reconnect().await });
    }

    async fn reconnect(&self) {
        let role = self.role();
        tokio::select! {
            _ = self.inner.cancel.cancelled() => return,
            _ = tokio::time::sleep(self.inner.timing.reconnect_delay) => {}
        }
        if !self.should_reconnect() {
            debug!(role = %role, "Session moved on, skipping reconnect");
            return;
        }
        let Some(credential) = self.lock().credential.clone() else {
            warn!(role = %role, "No credential to reconnect with");
            return;
        };

        let saved = self.inner.status.current();
        info!(role = %role, "Reconnecting channel");
        match self.connect(&credential).await {
            Ok(()) => {
                self.inner.status.restore(saved);
                info!(role = %role, "Channel reconnected");
                let _ = self.inner.events.send(ChannelEvent::Reconnected { role });
            }
            Err(VoiceError::Cancelled) => debug!(role = %role, "Reconnect cancelled"),
            Err(e) => {
                error!(role = %role, error = %e, "Reconnect failed");
                self.inner
                    .status
                    .set("Connection issue", Some(format!("{} unavailable: {}", role, e)));
                let _ = self
                    .inner
                    .events
                    .send(ChannelEvent::ReconnectFailed { role, error: e });
            }
        }
    }
}

impl fmt::Debug for DuplexChannelManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DuplexChannelManager")
            .field("role", &self.role())
            .field("state", &self.state())
            .field("transmitting", &self.is_transmitting())
            .finish()
    }
}

async fn keep_alive_loop(inner: Weak<Inner>, outbound: mpsc::UnboundedSender<Outbound>, period: Duration) {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        interval.tick().await;
        let Some(inner) = inner.upgrade() else { break };
        let transmitting = inner.transmitting.load(Ordering::SeqCst);
        if let Some(frame) = inner.params.keep_alive_frame(transmitting) {
            trace!(role = %inner.params.role(), bytes = frame.len(), "Keep-alive");
            if outbound.send(Outbound::Frame(frame)).is_err() {
                break;
            }
        }
    }
}

async fn drive_socket(
    inner: Weak<Inner>,
    mut socket: Box<dyn ChannelSocket>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    generation: u64,
) {
    loop {
        tokio::select! {
            command = outbound.recv() => match command {
                Some(Outbound::Frame(frame)) => {
                    if let Err(e) = socket.send(frame).await {
                        warn!(generation, error = %e, "Failed to send frame");
                    }
                }
                Some(Outbound::Close) | None => {
                    socket.close(NORMAL_CLOSURE, "client closing").await;
                    return;
                }
            },
            event = socket.next_event() => match event {
                SocketEvent::Frame(frame) => {
                    let Some(inner) = inner.upgrade() else { return };
                    let role = inner.params.role();
                    let _ = inner.events.send(ChannelEvent::Message { role, frame });
                }
                SocketEvent::Closed { code, reason } => {
                    if let Some(inner) = inner.upgrade() {
                        DuplexChannelManager { inner }.on_remote_close(generation, code, reason);
                    }
                    return;
                }
            }
        }
    }
}
