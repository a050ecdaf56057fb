//! Scripted in-memory connector used by channel and orchestrator tests.

use super::socket::{ChannelConnector, ChannelSocket, Frame, SocketEvent};
use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::Instant;
use url::Url;

#[derive(Debug, Clone)]
pub(crate) struct OpenRecord {
    pub url: Url,
    pub protocols: Vec<String>,
    pub at: Instant,
}

/// The far end of a fake socket.
#[derive(Clone)]
pub(crate) struct FakeRemote {
    inbound: mpsc::UnboundedSender<SocketEvent>,
    sent: Arc<Mutex<Vec<Frame>>>,
    closed_with: Arc<Mutex<Option<u16>>>,
}

impl FakeRemote {
    pub fn push_text(&self, text: &str) {
        let _ = self.inbound.send(SocketEvent::Frame(Frame::Text(text.to_string())));
    }

    pub fn close(&self, code: u16) {
        let _ = self.inbound.send(SocketEvent::Closed {
            code,
            reason: String::new(),
        });
    }

    pub fn sent(&self) -> Vec<Frame> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_text(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|frame| frame.as_text().map(str::to_string))
            .collect()
    }

    pub fn closed_with(&self) -> Option<u16> {
        *self.closed_with.lock().unwrap()
    }
}

struct FakeSocket {
    inbound: mpsc::UnboundedReceiver<SocketEvent>,
    sent: Arc<Mutex<Vec<Frame>>>,
    closed_with: Arc<Mutex<Option<u16>>>,
}

#[async_trait]
impl ChannelSocket for FakeSocket {
    async fn send(&mut self, frame: Frame) -> VoiceResult<()> {
        self.sent.lock().unwrap().push(frame);
        Ok(())
    }

    async fn next_event(&mut self) -> SocketEvent {
        match self.inbound.recv().await {
            Some(event) => event,
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self, code: u16, _reason: &str) {
        *self.closed_with.lock().unwrap() = Some(code);
    }
}

/// Opens fake sockets; each open consumes one scripted outcome
/// (`true` = success). Once the script runs out every open succeeds.
#[derive(Default)]
pub(crate) struct FakeConnector {
    outcomes: Mutex<VecDeque<bool>>,
    opened: Mutex<Vec<OpenRecord>>,
    remotes: Mutex<Vec<FakeRemote>>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn scripted(outcomes: &[bool]) -> Arc<Self> {
        let connector = Self::default();
        connector.outcomes.lock().unwrap().extend(outcomes.iter().copied());
        Arc::new(connector)
    }

    pub fn opened(&self) -> Vec<OpenRecord> {
        self.opened.lock().unwrap().clone()
    }

    /// Remote end of the `index`-th successfully opened socket.
    pub fn remote(&self, index: usize) -> FakeRemote {
        self.remotes.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl ChannelConnector for FakeConnector {
    async fn open(&self, url: &Url, protocols: &[String]) -> VoiceResult<Box<dyn ChannelSocket>> {
        self.opened.lock().unwrap().push(OpenRecord {
            url: url.clone(),
            protocols: protocols.to_vec(),
            at: Instant::now(),
        });
        let succeed = self.outcomes.lock().unwrap().pop_front().unwrap_or(true);
        if !succeed {
            return Err(VoiceError::Transport("connection refused".to_string()));
        }

        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let closed_with = Arc::new(Mutex::new(None));
        self.remotes.lock().unwrap().push(FakeRemote {
            inbound: inbound_tx,
            sent: sent.clone(),
            closed_with: closed_with.clone(),
        });

        Ok(Box::new(FakeSocket {
            inbound,
            sent,
            closed_with,
        }))
    }
}
