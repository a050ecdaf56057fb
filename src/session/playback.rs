//! # Playback Completion
//!
//! Decides when the agent has really finished speaking. No single signal is
//! trusted on its own: the synthesis-complete marker can arrive before the
//! audio has played out, and chunk completions can arrive in any order.
//!
//! ## End-of-speech fires when ALL hold:
//! - no chunk is in flight (the counter is the only source of truth)
//! - the speaker level has stayed below the silence level for a poll interval
//!   since the last chunk finished
//! - the completion marker was seen, OR at least one chunk played and the
//!   silence has lasted the longer fallback window
//!
//! Chunk ids are handed out here and keep increasing across responses.
//! Completions for ids below the current response's first id belong to a
//! response that was cut off and are ignored.

use crate::config::DetectionConfig;
use tokio::time::Instant;
use tracing::{debug, trace};

#[derive(Debug, Clone, Default)]
pub struct PlaybackTracker {
    active: bool,
    in_flight: u32,
    chunks_played: u32,
    marker_seen: bool,
    silent_since: Option<Instant>,
    first_chunk: u64,
    next_chunk: u64,
}

impl PlaybackTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an agent response is being played.
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight
    }

    /// Count a chunk as in flight and return its id.
    pub fn chunk_started(&mut self) -> u64 {
        self.active = true;
        self.in_flight += 1;
        let chunk_id = self.next_chunk;
        self.next_chunk += 1;
        chunk_id
    }

    /// Also called for chunks that failed to decode or play. Returns `false`
    /// when the chunk belongs to an earlier response.
    pub fn chunk_finished(&mut self, chunk_id: u64) -> bool {
        if chunk_id < self.first_chunk {
            trace!(chunk_id, first = self.first_chunk, "Ignoring completion from a cancelled response");
            return false;
        }
        self.in_flight = self.in_flight.saturating_sub(1);
        self.chunks_played += 1;
        true
    }

    pub fn mark_complete(&mut self) {
        self.active = true;
        self.marker_seen = true;
    }

    /// Forget the current response. Chunks started before this are stale.
    pub fn reset(&mut self) {
        *self = Self {
            first_chunk: self.next_chunk,
            next_chunk: self.next_chunk,
            ..Self::default()
        };
    }

    /// Feed one speaker-level sample. Returns `true` exactly once per response,
    /// when end of speech is detected.
    pub fn poll(&mut self, speaker_level: f32, config: &DetectionConfig, now: Instant) -> bool {
        if !self.active {
            return false;
        }
        if self.in_flight > 0 || speaker_level >= config.playback_silence_level {
            self.silent_since = None;
            return false;
        }

        let since = *self.silent_since.get_or_insert(now);
        let silent_for = now.saturating_duration_since(since);
        if silent_for < config.playback_poll() {
            return false;
        }

        let fallback = self.chunks_played > 0 && silent_for >= config.fallback_silence();
        if !self.marker_seen && !fallback {
            return false;
        }

        debug!(
            chunks = self.chunks_played,
            marker = self.marker_seen,
            silent_ms = silent_for.as_millis() as u64,
            "Agent speech finished"
        );
        self.reset();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> DetectionConfig {
        DetectionConfig::push_to_talk()
    }

    /// Poll every 200 ms with `level` for `total`, returning the offset of the
    /// first detection.
    fn run(tracker: &mut PlaybackTracker, level: f32, start: Instant, total: Duration) -> Option<Duration> {
        let step = Duration::from_millis(200);
        let mut offset = Duration::ZERO;
        while offset <= total {
            if tracker.poll(level, &config(), start + offset) {
                return Some(offset);
            }
            offset += step;
        }
        None
    }

    #[test]
    fn test_marker_and_silence_fire() {
        let t0 = Instant::now();
        let mut tracker = PlaybackTracker::new();
        let chunk = tracker.chunk_started();
        tracker.chunk_finished(chunk);
        tracker.mark_complete();

        assert_eq!(run(&mut tracker, 0.5, t0, Duration::from_secs(1)), Some(Duration::from_millis(200)));
        assert!(!tracker.is_active());
    }

    #[test]
    fn test_never_fires_with_chunks_in_flight() {
        let t0 = Instant::now();
        let mut tracker = PlaybackTracker::new();
        tracker.chunk_started();
        let chunk = tracker.chunk_started();
        tracker.chunk_finished(chunk);
        tracker.mark_complete();

        assert_eq!(run(&mut tracker, 0.0, t0, Duration::from_secs(10)), None);
    }

    #[test]
    fn test_marker_alone_is_not_enough_while_loud() {
        let t0 = Instant::now();
        let mut tracker = PlaybackTracker::new();
        let chunk = tracker.chunk_started();
        tracker.chunk_finished(chunk);
        tracker.mark_complete();

        assert_eq!(run(&mut tracker, 5.0, t0, Duration::from_secs(10)), None);
    }

    #[test]
    fn test_fallback_without_marker() {
        let t0 = Instant::now();
        let mut tracker = PlaybackTracker::new();
        let chunk = tracker.chunk_started();
        tracker.chunk_finished(chunk);

        assert_eq!(run(&mut tracker, 0.0, t0, Duration::from_secs(5)), Some(Duration::from_millis(1600)));
    }

    #[test]
    fn test_no_fallback_before_any_chunk_played() {
        let t0 = Instant::now();
        let mut tracker = PlaybackTracker::new();
        tracker.chunk_started();

        assert_eq!(run(&mut tracker, 0.0, t0, Duration::from_secs(5)), None);
    }

    #[test]
    fn test_completion_counter_is_floored() {
        let mut tracker = PlaybackTracker::new();
        tracker.chunk_finished(0);
        tracker.chunk_finished(0);
        assert_eq!(tracker.in_flight(), 0);
        tracker.chunk_started();
        assert_eq!(tracker.in_flight(), 1);
    }

    #[test]
    fn test_noise_restarts_silence_window() {
        let t0 = Instant::now();
        let mut tracker = PlaybackTracker::new();
        let chunk = tracker.chunk_started();
        tracker.chunk_finished(chunk);
        tracker.mark_complete();

        assert!(!tracker.poll(0.0, &config(), t0));
        assert!(!tracker.poll(3.0, &config(), t0 + Duration::from_millis(100)));
        assert!(!tracker.poll(0.0, &config(), t0 + Duration::from_millis(200)));
        assert!(tracker.poll(0.0, &config(), t0 + Duration::from_millis(400)));
    }

    #[test]
    fn test_inactive_tracker_never_fires() {
        let mut tracker = PlaybackTracker::new();
        assert_eq!(run(&mut tracker, 0.0, Instant::now(), Duration::from_secs(5)), None);
    }

    #[test]
    fn test_completions_from_cancelled_response_are_ignored() {
        let t0 = Instant::now();
        let mut tracker = PlaybackTracker::new();
        let old_a = tracker.chunk_started();
        let old_b = tracker.chunk_started();
        tracker.reset();

        let new = tracker.chunk_started();
        assert!(new > old_b);
        tracker.mark_complete();
        assert!(!tracker.chunk_finished(old_a));
        assert!(!tracker.chunk_finished(old_b));
        assert_eq!(tracker.in_flight(), 1);
        assert_eq!(run(&mut tracker, 0.0, t0, Duration::from_secs(5)), None);

        assert!(tracker.chunk_finished(new));
        assert_eq!(tracker.in_flight(), 0);
        assert!(!tracker.poll(0.0, &config(), t0 + Duration::from_secs(6)));
        assert!(tracker.poll(0.0, &config(), t0 + Duration::from_millis(6200)));
    }
}
