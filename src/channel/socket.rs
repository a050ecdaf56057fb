//! # Channel Sockets
//!
//! The seam between a [`DuplexChannelManager`](super::DuplexChannelManager)
//! and the wire. The manager only sees [`ChannelConnector`] and
//! [`ChannelSocket`]; [`WebSocketConnector`] is the tokio-tungstenite
//! implementation used outside of tests.
//!
//! ## Protocol:
//! 1. **Open**: the URL carries the channel parameters, the credential rides in
//!    `Sec-WebSocket-Protocol` next to two fixed markers
//! 2. **Streaming**: text frames carry JSON, binary frames carry PCM
//! 3. **Close**: the close frame's code and reason are reported once; a
//!    connection that drops without a close frame reports 1006

use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};
use url::Url;

/// Normal closure; never triggers an automatic reconnect.
pub const NORMAL_CLOSURE: u16 = 1000;

/// Connection lost without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// A payload travelling over a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Frame::Text(text) => Some(text),
            Frame::Binary(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What a socket produced.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    Frame(Frame),
    /// Terminal; the socket yields nothing after this
    Closed { code: u16, reason: String },
}

/// The subprotocol list offered on every channel open.
pub fn subprotocols(credential: &str) -> Vec<String> {
    vec!["wss".to_string(), credential.to_string(), "agentforce".to_string()]
}

/// One open, bidirectional connection.
#[async_trait]
pub trait ChannelSocket: Send {
    async fn send(&mut self, frame: Frame) -> VoiceResult<()>;

    /// Wait for the next inbound event.
    ///
    /// Must be cancel-safe: the driver polls it inside `tokio::select!`.
    async fn next_event(&mut self) -> SocketEvent;

    async fn close(&mut self, code: u16, reason: &str);
}

/// Opens sockets. Resolves only once the connection is open.
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn open(&self, url: &Url, protocols: &[String]) -> VoiceResult<Box<dyn ChannelSocket>>;
}

/// [`ChannelConnector`] backed by tokio-tungstenite.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl ChannelConnector for WebSocketConnector {
    async fn open(&self, url: &Url, protocols: &[String]) -> VoiceResult<Box<dyn ChannelSocket>> {
        let mut request = url.as_str().into_client_request()?;
        let protocol_header = HeaderValue::from_str(&protocols.join(", "))
            .map_err(|e| VoiceError::Transport(format!("invalid subprotocol header: {}", e)))?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", protocol_header);

        let (stream, response) = connect_async(request).await?;
        debug!(
            host = url.host_str().unwrap_or_default(),
            status = %response.status(),
            "WebSocket handshake completed"
        );

        Ok(Box::new(WebSocketChannel { stream }))
    }
}

struct WebSocketChannel {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl ChannelSocket for WebSocketChannel {
    async fn send(&mut self, frame: Frame) -> VoiceResult<()> {
        let message = match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(data) => Message::Binary(data),
        };
        self.stream.send(message).await?;
        Ok(())
    }

    async fn next_event(&mut self) -> SocketEvent {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return SocketEvent::Frame(Frame::Text(text)),
                Some(Ok(Message::Binary(data))) => return SocketEvent::Frame(Frame::Binary(data)),
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.to_string()))
                        .unwrap_or((ABNORMAL_CLOSURE, String::new()));
                    return SocketEvent::Closed { code, reason };
                }
                // Ping/pong are answered by tungstenite itself.
                Some(Ok(other)) => trace!(kind = ?other, "Ignoring control frame"),
                Some(Err(e)) => {
                    return SocketEvent::Closed {
                        code: ABNORMAL_CLOSURE,
                        reason: e.to_string(),
                    }
                }
                None => {
                    return SocketEvent::Closed {
                        code: ABNORMAL_CLOSURE,
                        reason: "connection dropped".to_string(),
                    }
                }
            }
        }
    }

    async fn close(&mut self, code: u16, reason: &str) {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        if let Err(e) = self.stream.close(Some(frame)).await {
            debug!(error = %e, "Close handshake did not complete");
        }
    }
}
