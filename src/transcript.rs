//! # Conversation Transcript
//!
//! Accumulates what the user and the agent said.
//!
//! ## Rules:
//! - At most one interim (not yet final) entry is held; each interim replaces it
//! - Any final entry discards the held interim
//! - A final entry from the same speaker as the last retained entry is merged
//!   into it (texts joined with a space) instead of starting a new entry
//! - Only the last `history_limit` final entries are retained

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Speaker {
    User,
    Agent,
}

impl fmt::Display for Speaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Speaker::User => f.write_str("user"),
            Speaker::Agent => f.write_str("agent"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptEntry {
    pub id: Uuid,
    pub text: String,
    pub speaker: Speaker,
    pub timestamp: DateTime<Utc>,
    pub is_interim: bool,
}

impl TranscriptEntry {
    fn new(text: &str, speaker: Speaker, is_interim: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            text: text.to_string(),
            speaker,
            timestamp: Utc::now(),
            is_interim,
        }
    }
}

/// Ordered, bounded transcript with a single interim slot.
#[derive(Debug, Clone)]
pub struct TranscriptBuffer {
    finals: VecDeque<TranscriptEntry>,
    interim: Option<TranscriptEntry>,
    history_limit: usize,
}

impl TranscriptBuffer {
    pub fn new(history_limit: usize) -> Self {
        Self {
            finals: VecDeque::with_capacity(history_limit),
            interim: None,
            history_limit: history_limit.max(1),
        }
    }

    /// Add an utterance fragment. Blank text is ignored.
    pub fn add_message(&mut self, text: &str, speaker: Speaker, is_final: bool) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }

        if !is_final {
            self.interim = Some(TranscriptEntry::new(text, speaker, true));
            return;
        }

        self.interim = None;

        match self.finals.back_mut() {
            Some(last) if last.speaker == speaker => {
                last.text.push(' ');
                last.text.push_str(text);
                last.timestamp = Utc::now();
            }
            _ => self.finals.push_back(TranscriptEntry::new(text, speaker, false)),
        }

        while self.finals.len() > self.history_limit {
            self.finals.pop_front();
        }
    }

    /// Retained finals in order, followed by the interim entry if any.
    pub fn display_messages(&self) -> Vec<TranscriptEntry> {
        self.finals.iter().chain(self.interim.iter()).cloned().collect()
    }

    pub fn interim(&self) -> Option<&TranscriptEntry> {
        self.interim.as_ref()
    }

    /// Text of the newest retained final entry if it belongs to `speaker`.
    pub fn latest_final(&self, speaker: Speaker) -> Option<&str> {
        self.finals
            .back()
            .filter(|entry| entry.speaker == speaker)
            .map(|entry| entry.text.as_str())
    }

    pub fn len(&self) -> usize {
        self.finals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.finals.is_empty() && self.interim.is_none()
    }

    pub fn clear(&mut self) {
        self.finals.clear();
        self.interim = None;
    }
}
