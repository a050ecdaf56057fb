//! # Voice Probe
//!
//! Command-line smoke test for the streaming speech channels. Opens the
//! recognition and synthesis channels with the configured settings, logs
//! everything they deliver and optionally asks for one line to be spoken.
//!
//! ## Usage:
//! ```text
//! VOICE_PROBE_TOKEN=... voice-probe ["text to speak"]
//! ```
//!
//! ## Environment Variables:
//! - `VOICE_PROBE_TOKEN`: bearer credential passed as a WebSocket subprotocol
//! - `VOICE__...`: configuration overrides (see [`EngineConfig::load`])
//! - `RUST_LOG`: log filter, defaults to `voice_session_engine=debug,voice_probe=debug`

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use voice_session_engine::channel::{
    recognition, synthesis, ChannelContext, ChannelEvent, ChannelParams, ChannelRole, ChannelTiming,
    DuplexChannelManager, Frame, WebSocketConnector,
};
use voice_session_engine::{ConnectionState, EngineConfig, StatusBoard};

/// Set once SIGINT or SIGTERM arrives.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = EngineConfig::load()?;
    config.validate()?;
    let credential = std::env::var("VOICE_PROBE_TOKEN").context("VOICE_PROBE_TOKEN must be set")?;
    let say = std::env::args().nth(1);

    info!("Starting voice-probe v{}", env!("CARGO_PKG_VERSION"));
    info!(
        recognition = %config.channels.recognition.endpoint,
        synthesis = %config.channels.synthesis.endpoint,
        "Channel endpoints"
    );

    let status = StatusBoard::new();
    let (events_tx, mut events) = mpsc::unbounded_channel();
    // The probe counts as a connected session so dropped channels recover.
    let (_session_tx, session_state) = watch::channel(ConnectionState::Connected);
    let cancel = CancellationToken::new();
    let connector = Arc::new(WebSocketConnector);
    let timing = ChannelTiming::from(&config.channels);

    let context = ChannelContext {
        status: status.clone(),
        events: events_tx,
        session_state,
        cancel: cancel.clone(),
    };
    let recognition = DuplexChannelManager::new(
        ChannelParams::Recognition(config.channels.recognition.clone()),
        connector.clone(),
        timing,
        context.clone(),
    );
    let synthesis = DuplexChannelManager::new(
        ChannelParams::Synthesis(config.channels.synthesis.clone()),
        connector,
        timing,
        context,
    );

    recognition.connect(&credential).await?;
    synthesis.connect(&credential).await?;
    info!("Both channels open");

    if let Some(text) = say.as_deref() {
        synthesis.send(synthesis::request_frame(text))?;
        info!(text, "Requested speech");
    }

    setup_signal_handlers();
    loop {
        tokio::select! {
            Some(event) = events.recv() => log_event(event),
            _ = wait_for_shutdown() => {
                info!("Shutdown signal received, closing channels...");
                break;
            }
        }
    }

    cancel.cancel();
    recognition.close();
    synthesis.close();
    info!(status = %status.current().text, "voice-probe stopped");
    Ok(())
}

fn log_event(event: ChannelEvent) {
    match event {
        ChannelEvent::Message {
            role: ChannelRole::Recognition,
            frame: Frame::Text(text),
        } => match recognition::parse_message(&text) {
            Ok(results) => {
                for result in results {
                    info!(text = %result.text, is_final = result.is_final, "Recognized");
                }
            }
            Err(e) => warn!(error = %e, "Unreadable recognition message"),
        },
        ChannelEvent::Message {
            role: ChannelRole::Synthesis,
            frame: Frame::Text(text),
        } => match synthesis::parse_message(&text) {
            Ok(chunk) => info!(
                audio_chars = chunk.audio.as_deref().map(str::len).unwrap_or(0),
                is_final = chunk.is_final,
                "Synthesis chunk"
            ),
            Err(e) => warn!(error = %e, "Unreadable synthesis message"),
        },
        ChannelEvent::Message { role, frame } => info!(role = %role, bytes = frame.len(), "Binary frame"),
        ChannelEvent::Closed { role, code, reason } => warn!(role = %role, code, reason = %reason, "Channel closed"),
        ChannelEvent::Reconnected { role } => info!(role = %role, "Channel reconnected"),
        ChannelEvent::ReconnectFailed { role, error } => error!(role = %role, error = %error, "Channel gave up"),
    }
}

/// Registry + `EnvFilter` + fmt layer, filter taken from `RUST_LOG` when set.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_session_engine=debug,voice_probe=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Flip [`SHUTDOWN_SIGNAL`] on SIGTERM or SIGINT.
fn setup_signal_handlers() {
    tokio::spawn(async {
        let signals = (
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()),
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()),
        );
        let (mut sigterm, mut sigint) = match signals {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            (Err(e), _) | (_, Err(e)) => {
                error!(error = %e, "Failed to install signal handlers");
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

/// Poll the shutdown flag every 100ms.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
