//! # Presence Detection
//!
//! Derives the presence state from microphone and speaker levels.
//!
//! ## Classification:
//! - **User speech**: mic level above the mic threshold AND above
//!   `speaker level * priority multiplier` (agent audio bleeding into the
//!   microphone must not count as the user)
//! - **Agent speech**: speaker level above the speaker threshold
//! - **Muted**: only agent speech is detected
//!
//! ## Rate Limiting:
//! Leaving a state requires `state_lock` of dwell time, except escalation from
//! `Connected` straight into `Listening` or `Speaking`, which is always allowed.
//!
//! The free functions are pure; [`PresenceMachine`] only adds the timestamps.

use super::PresenceState;
use crate::config::DetectionConfig;
use std::time::Duration;
use tokio::time::Instant;

/// Whether a transition from `current` to `desired` may happen after
/// `elapsed` in the current state.
pub fn can_transition(current: PresenceState, desired: PresenceState, elapsed: Duration, lock: Duration) -> bool {
    if elapsed >= lock {
        return true;
    }
    current == PresenceState::Connected
        && matches!(desired, PresenceState::Listening | PresenceState::Speaking)
}

pub fn user_is_speaking(mic: f32, speaker: f32, config: &DetectionConfig) -> bool {
    mic > config.mic_threshold && mic > speaker * config.priority_multiplier
}

pub fn agent_is_speaking(speaker: f32, config: &DetectionConfig) -> bool {
    speaker > config.speaker_threshold
}

/// The state the levels ask for, before rate limiting.
pub fn desired_state(mic: f32, speaker: f32, muted: bool, config: &DetectionConfig) -> PresenceState {
    if muted {
        return if agent_is_speaking(speaker, config) {
            PresenceState::Speaking
        } else {
            PresenceState::Muted
        };
    }

    if user_is_speaking(mic, speaker, config) {
        PresenceState::Listening
    } else if agent_is_speaking(speaker, config) {
        PresenceState::Speaking
    } else {
        PresenceState::Connected
    }
}

/// Volume for agent audio under the interruption-prevention policy.
///
/// Held at 1 while muted or before the agent's first utterance. Otherwise 0
/// while the user spoke less than `user_silence` ago.
pub fn agent_output_volume(
    has_had_first_exchange: bool,
    muted: bool,
    last_user_speech_at: Option<Instant>,
    now: Instant,
    user_silence: Duration,
) -> f32 {
    if muted || !has_had_first_exchange {
        return 1.0;
    }
    match last_user_speech_at {
        Some(at) if now.saturating_duration_since(at) < user_silence => 0.0,
        _ => 1.0,
    }
}

/// Presence state plus the timing it depends on.
#[derive(Debug, Clone)]
pub struct PresenceMachine {
    state: PresenceState,
    entered_at: Instant,
    last_activity_at: Instant,
    /// `None` until the user is first heard (and again after unmute)
    last_user_speech_at: Option<Instant>,
}

impl PresenceMachine {
    pub fn new(now: Instant) -> Self {
        Self {
            state: PresenceState::Idle,
            entered_at: now,
            last_activity_at: now,
            last_user_speech_at: None,
        }
    }

    pub fn state(&self) -> PresenceState {
        self.state
    }

    pub fn entered_at(&self) -> Instant {
        self.entered_at
    }

    pub fn last_activity_at(&self) -> Instant {
        self.last_activity_at
    }

    pub fn last_user_speech_at(&self) -> Option<Instant> {
        self.last_user_speech_at
    }

    /// Explicit transition (connect, mute toggle, disconnect); bypasses the lock.
    pub fn force(&mut self, state: PresenceState, now: Instant) -> bool {
        if self.state == state {
            return false;
        }
        self.state = state;
        self.entered_at = now;
        true
    }

    /// Forget speech timing, as if the session had just started.
    pub fn reset_speech_timing(&mut self, now: Instant) {
        self.last_user_speech_at = None;
        self.last_activity_at = now;
    }

    /// Feed one pair of levels.
    ///
    /// Speech timing is always updated. When `drive_state` is set and the
    /// session is live, the state follows the levels subject to the lock;
    /// the new state is returned if it changed.
    pub fn observe(
        &mut self,
        mic: f32,
        speaker: f32,
        muted: bool,
        config: &DetectionConfig,
        drive_state: bool,
        now: Instant,
    ) -> Option<PresenceState> {
        let user = !muted && user_is_speaking(mic, speaker, config);
        if user {
            self.last_user_speech_at = Some(now);
        }
        if user || agent_is_speaking(speaker, config) {
            self.last_activity_at = now;
        }

        if !drive_state || !self.state.is_live() {
            return None;
        }

        let desired = desired_state(mic, speaker, muted, config);
        if desired == self.state {
            return None;
        }
        let elapsed = now.saturating_duration_since(self.entered_at);
        if !can_transition(self.state, desired, elapsed, config.state_lock()) {
            return None;
        }

        self.state = desired;
        self.entered_at = now;
        Some(desired)
    }
}
