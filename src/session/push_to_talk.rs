//! # Push-to-Talk
//!
//! Timing of the press/release interaction.
//!
//! ## Release Sequence:
//! 1. Send silence frames for the settle window so the recognizer can
//!    finalize (500 ms in 100 ms frames by default)
//! 2. Stop transmitting
//! 3. Wait the submit delay (300 ms), then submit what was recognized
//!
//! The sequence is a small state machine polled with the current time, so
//! recognition results keep flowing into the utterance while it runs.

use crate::config::PushToTalkConfig;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushToTalkPhase {
    Idle,
    Pressed,
    Settling { frames_left: u64, next_frame_at: Instant },
    AwaitingSubmit { submit_at: Instant },
}

/// What the orchestrator has to do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushToTalkAction {
    SendSilence,
    StopTransmitting,
    /// Submit the accumulated utterance (may be empty)
    Submit(String),
}

#[derive(Debug, Clone)]
pub struct PushToTalk {
    phase: PushToTalkPhase,
    utterance: Vec<String>,
    frame: Duration,
    settle_frames: u64,
    submit_delay: Duration,
}

impl PushToTalk {
    pub fn new(config: &PushToTalkConfig) -> Self {
        Self {
            phase: PushToTalkPhase::Idle,
            utterance: Vec::new(),
            frame: Duration::from_millis(config.frame_ms),
            settle_frames: config.settle_frames(),
            submit_delay: Duration::from_millis(config.submit_delay_ms),
        }
    }

    pub fn phase(&self) -> PushToTalkPhase {
        self.phase
    }

    /// Whether captured audio should go out on the recognition channel.
    pub fn is_pressed(&self) -> bool {
        self.phase == PushToTalkPhase::Pressed
    }

    pub fn is_idle(&self) -> bool {
        self.phase == PushToTalkPhase::Idle
    }

    /// Start a press. A press during the release sequence continues the same
    /// utterance. Returns `false` if already pressed.
    pub fn press(&mut self) -> bool {
        match self.phase {
            PushToTalkPhase::Pressed => false,
            PushToTalkPhase::Idle => {
                self.utterance.clear();
                self.phase = PushToTalkPhase::Pressed;
                true
            }
            _ => {
                self.phase = PushToTalkPhase::Pressed;
                true
            }
        }
    }

    /// Begin the release sequence. Returns `false` if not pressed.
    pub fn release(&mut self, now: Instant) -> bool {
        if self.phase != PushToTalkPhase::Pressed {
            return false;
        }
        self.phase = PushToTalkPhase::Settling {
            frames_left: self.settle_frames,
            next_frame_at: now,
        };
        true
    }

    /// Record a final recognition result of the current press cycle.
    pub fn on_final(&mut self, text: &str) {
        let text = text.trim();
        if self.phase != PushToTalkPhase::Idle && !text.is_empty() {
            self.utterance.push(text.to_string());
        }
    }

    /// When [`PushToTalk::poll`] next has something to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        match self.phase {
            PushToTalkPhase::Settling { next_frame_at, .. } => Some(next_frame_at),
            PushToTalkPhase::AwaitingSubmit { submit_at } => Some(submit_at),
            _ => None,
        }
    }

    /// Next due action, if any. Call repeatedly until it returns `None`.
    pub fn poll(&mut self, now: Instant) -> Option<PushToTalkAction> {
        match self.phase {
            PushToTalkPhase::Settling {
                frames_left,
                next_frame_at,
            } if now >= next_frame_at => {
                if frames_left > 0 {
                    self.phase = PushToTalkPhase::Settling {
                        frames_left: frames_left - 1,
                        next_frame_at: next_frame_at + self.frame,
                    };
                    Some(PushToTalkAction::SendSilence)
                } else {
                    self.phase = PushToTalkPhase::AwaitingSubmit {
                        submit_at: next_frame_at + self.submit_delay,
                    };
                    Some(PushToTalkAction::StopTransmitting)
                }
            }
            PushToTalkPhase::AwaitingSubmit { submit_at } if now >= submit_at => {
                self.phase = PushToTalkPhase::Idle;
                let text = self.utterance.drain(..).collect::<Vec<_>>().join(" ");
                Some(PushToTalkAction::Submit(text))
            }
            _ => None,
        }
    }

    /// Abandon any press or release in progress.
    pub fn reset(&mut self) {
        self.phase = PushToTalkPhase::Idle;
        self.utterance.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PushToTalkConfig {
        PushToTalkConfig {
            sample_rate: 16000,
            settle_ms: 500,
            frame_ms: 100,
            submit_delay_ms: 300,
        }
    }

    /// Poll every 50 ms for `total`, collecting (offset in ms, action).
    fn drive(ptt: &mut PushToTalk, start: Instant, total_ms: u64) -> Vec<(u64, PushToTalkAction)> {
        let mut actions = Vec::new();
        for offset in (0..=total_ms).step_by(50) {
            while let Some(action) = ptt.poll(start + Duration::from_millis(offset)) {
                actions.push((offset, action));
            }
        }
        actions
    }

    #[test]
    fn test_release_sequence_timing() {
        let t0 = Instant::now();
        let mut ptt = PushToTalk::new(&config());
        assert!(ptt.press());
        ptt.on_final("where is");
        ptt.on_final("my order");
        assert!(ptt.release(t0));
        ptt.on_final("please");

        let actions = drive(&mut ptt, t0, 1000);
        assert_eq!(
            actions,
            vec![
                (0, PushToTalkAction::SendSilence),
                (100, PushToTalkAction::SendSilence),
                (200, PushToTalkAction::SendSilence),
                (300, PushToTalkAction::SendSilence),
                (400, PushToTalkAction::SendSilence),
                (500, PushToTalkAction::StopTransmitting),
                (800, PushToTalkAction::Submit("where is my order please".to_string())),
            ]
        );
        assert!(ptt.is_idle());
    }

    #[test]
    fn test_empty_utterance_submits_empty_text() {
        let t0 = Instant::now();
        let mut ptt = PushToTalk::new(&config());
        ptt.press();
        ptt.release(t0);

        let actions = drive(&mut ptt, t0, 1000);
        assert_eq!(actions.last(), Some(&(800, PushToTalkAction::Submit(String::new()))));
    }

    #[test]
    fn test_press_during_release_continues_utterance() {
        let t0 = Instant::now();
        let mut ptt = PushToTalk::new(&config());
        ptt.press();
        ptt.on_final("first part");
        ptt.release(t0);
        assert!(ptt.press());
        assert!(ptt.is_pressed());
        assert_eq!(ptt.next_deadline(), None);

        ptt.on_final("second part");
        ptt.release(t0);
        let actions = drive(&mut ptt, t0, 1000);
        assert_eq!(
            actions.last().map(|(_, a)| a.clone()),
            Some(PushToTalkAction::Submit("first part second part".to_string()))
        );
    }

    #[test]
    fn test_release_without_press_and_finals_while_idle() {
        let mut ptt = PushToTalk::new(&config());
        assert!(!ptt.release(Instant::now()));
        ptt.on_final("stray");
        ptt.press();
        assert!(!ptt.press());
        ptt.reset();
        assert!(ptt.is_idle());
        assert_eq!(ptt.poll(Instant::now()), None);
    }
}
