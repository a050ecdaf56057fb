//! # Error Handling
//!
//! Custom error types for the voice session engine and the conversions that
//! let `?` lift lower-level failures (socket, JSON, config, decoding) into them.
//!
//! ## Error Categories:
//! - **Handshake**: one of the connect steps failed after its retry budget
//! - **RetriesExhausted**: a retried operation failed on every attempt
//! - **Transport**: a duplex channel or media room failed mid-session
//! - **Media**: microphone / playback device unavailable (never retried)
//! - **Playback**: a single audio chunk could not be decoded
//! - **Protocol**: the remote side sent something we could not understand
//! - **Config / Validation**: configuration problems
//! - **Cancelled**: the session was disconnected while the operation was in flight

use std::fmt;

/// Identifies which connect step failed, so the status line can say so.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStep {
    Bootstrap,
    CreateSession,
    JoinTransport,
    LocalMedia,
}

impl HandshakeStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandshakeStep::Bootstrap => "bootstrap",
            HandshakeStep::CreateSession => "create session",
            HandshakeStep::JoinTransport => "join transport",
            HandshakeStep::LocalMedia => "local media",
        }
    }
}

impl fmt::Display for HandshakeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced by the engine.
///
/// ## Usage Example:
/// ```rust,ignore
/// return Err(VoiceError::NotConnected);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum VoiceError {
    /// A handshake step failed; terminal for the connect attempt
    Handshake { step: HandshakeStep, message: String },

    /// Every attempt of a retried operation failed
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last_error: String,
    },

    /// Socket or media transport failure
    Transport(String),

    /// Microphone, permission or playback device failure
    Media(String),

    /// Malformed audio chunk
    Playback(String),

    /// Unexpected payload from a remote endpoint
    Protocol(String),

    /// Configuration could not be loaded
    Config(String),

    /// Configuration or input failed validation rules
    Validation(String),

    /// Operation abandoned because the session was torn down
    Cancelled,

    /// Operation requires a live session
    NotConnected,
}

impl fmt::Display for VoiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoiceError::Handshake { step, message } => {
                write!(f, "Handshake failed at {}: {}", step, message)
            }
            VoiceError::RetriesExhausted {
                operation,
                attempts,
                last_error,
            } => write!(
                f,
                "{} failed after {} attempts: {}",
                operation, attempts, last_error
            ),
            VoiceError::Transport(msg) => write!(f, "Transport error: {}", msg),
            VoiceError::Media(msg) => write!(f, "Media error: {}", msg),
            VoiceError::Playback(msg) => write!(f, "Playback error: {}", msg),
            VoiceError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            VoiceError::Config(msg) => write!(f, "Configuration error: {}", msg),
            VoiceError::Validation(msg) => write!(f, "Validation error: {}", msg),
            VoiceError::Cancelled => write!(f, "Operation cancelled by disconnect"),
            VoiceError::NotConnected => write!(f, "No active voice session"),
        }
    }
}

impl std::error::Error for VoiceError {}

impl VoiceError {
    /// Wrap any error as a failure of the given handshake step.
    ///
    /// Cancellation passes through untouched so callers can tell a user
    /// disconnect apart from a real failure.
    pub fn at_step(self, step: HandshakeStep) -> Self {
        match self {
            VoiceError::Cancelled => VoiceError::Cancelled,
            VoiceError::Handshake { .. } => self,
            other => VoiceError::Handshake {
                step,
                message: other.to_string(),
            },
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for VoiceError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        VoiceError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for VoiceError {
    fn from(err: serde_json::Error) -> Self {
        VoiceError::Protocol(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for VoiceError {
    fn from(err: config::ConfigError) -> Self {
        VoiceError::Config(err.to_string())
    }
}

impl From<base64::DecodeError> for VoiceError {
    fn from(err: base64::DecodeError) -> Self {
        VoiceError::Playback(format!("invalid base64 audio chunk: {}", err))
    }
}

impl From<url::ParseError> for VoiceError {
    fn from(err: url::ParseError) -> Self {
        VoiceError::Config(format!("invalid channel endpoint: {}", err))
    }
}

impl From<anyhow::Error> for VoiceError {
    fn from(err: anyhow::Error) -> Self {
        VoiceError::Config(err.to_string())
    }
}

/// Shorthand for results carrying a [`VoiceError`].
pub type VoiceResult<T> = Result<T, VoiceError>;
