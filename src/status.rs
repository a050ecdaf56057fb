//! # Status Board
//!
//! The user-visible status line (a short text plus optional detail) shared by
//! the orchestrator and both channel managers.
//!
//! ## Thread Safety Pattern:
//! The current report lives behind `Arc<Mutex<...>>` so keep-alive and
//! reconnect tasks can update it; every change is also broadcast so a UI (or
//! a test) can follow along. Critical sections never span an `.await`.
//!
//! ## Save / Restore:
//! An auto-reconnect overwrites the status with "Reconnecting ...". On success
//! the previously displayed report is put back with [`StatusBoard::restore`].

use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::debug;

const STATUS_BROADCAST_CAPACITY: usize = 64;

/// What the user currently sees.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub text: String,
    pub detail: Option<String>,
}

impl StatusReport {
    pub fn new(text: impl Into<String>, detail: Option<String>) -> Self {
        Self {
            text: text.into(),
            detail,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StatusBoard {
    current: Arc<Mutex<StatusReport>>,
    updates: broadcast::Sender<StatusReport>,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBoard {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(STATUS_BROADCAST_CAPACITY);
        Self {
            current: Arc::new(Mutex::new(StatusReport::new("Disconnected", None))),
            updates,
        }
    }

    /// Replace the displayed status.
    pub fn set(&self, text: impl Into<String>, detail: Option<String>) {
        self.restore(StatusReport::new(text, detail));
    }

    /// Snapshot of the displayed status, used to restore it later.
    pub fn current(&self) -> StatusReport {
        self.current.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Put back a previously saved report.
    pub fn restore(&self, report: StatusReport) {
        debug!(text = %report.text, detail = ?report.detail, "Status changed");
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = report.clone();
        // No subscribers is fine.
        let _ = self.updates.send(report);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusReport> {
        self.updates.subscribe()
    }
}
