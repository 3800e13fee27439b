//! Silence-based turn detection for manual voice-activity mode.
//!
//! When the speech service's own end-of-speech detection is disabled, the
//! orchestrator decides when the caller has finished speaking: every
//! inbound audio chunk stamps a timestamp and arms a pending-commit flag;
//! a fixed-interval poll commits the input buffer once silence has lasted
//! long enough. The silence threshold is the one deliberate source of
//! turn-taking latency in the relay.

use std::time::{Duration, Instant};

/// Tracks inbound-audio timing and decides when to end a caller turn.
///
/// Clock-injected: callers pass `Instant::now()`, tests pass synthetic
/// instants. Firing is idempotent per silence episode.
#[derive(Debug)]
pub struct TurnDetector {
    silence_threshold: Duration,
    last_audio: Option<Instant>,
    pending_commit: bool,
}

impl TurnDetector {
    pub fn new(silence_threshold: Duration) -> Self {
        Self {
            silence_threshold,
            last_audio: None,
            pending_commit: false,
        }
    }

    /// Record one inbound audio chunk and arm the pending commit.
    pub fn note_audio(&mut self, now: Instant) {
        self.last_audio = Some(now);
        self.pending_commit = true;
    }

    /// Poll for an elapsed silence gap.
    ///
    /// Returns `true` at most once per gap: when armed and the time since
    /// the last chunk has reached the threshold, both the timestamp and
    /// the flag are cleared until the next chunk arrives.
    pub fn should_commit(&mut self, now: Instant) -> bool {
        if !self.pending_commit {
            return false;
        }
        match self.last_audio {
            Some(last) if now.duration_since(last) >= self.silence_threshold => {
                self.pending_commit = false;
                self.last_audio = None;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    const THRESHOLD: Duration = Duration::from_millis(1500);

    fn ms(base: Instant, offset: u64) -> Instant {
        base + Duration::from_millis(offset)
    }

    #[test]
    fn fires_exactly_once_after_silence_gap() {
        let base = Instant::now();
        let mut detector = TurnDetector::new(THRESHOLD);

        // Three chunks 200ms apart, then 2s of silence.
        detector.note_audio(ms(base, 0));
        detector.note_audio(ms(base, 200));
        detector.note_audio(ms(base, 400));

        // Polls during speech stay quiet.
        assert!(!detector.should_commit(ms(base, 500)));
        assert!(!detector.should_commit(ms(base, 1000)));

        // First poll past the threshold fires.
        assert!(detector.should_commit(ms(base, 2400)));

        // Subsequent polls in the same gap must not fire again.
        assert!(!detector.should_commit(ms(base, 2900)));
        assert!(!detector.should_commit(ms(base, 10_000)));
    }

    #[test]
    fn does_not_fire_without_audio() {
        let base = Instant::now();
        let mut detector = TurnDetector::new(THRESHOLD);
        assert!(!detector.should_commit(ms(base, 5000)));
    }

    #[test]
    fn new_audio_rearms_for_the_next_gap() {
        let base = Instant::now();
        let mut detector = TurnDetector::new(THRESHOLD);

        detector.note_audio(ms(base, 0));
        assert!(detector.should_commit(ms(base, 1500)));

        // Next caller turn.
        detector.note_audio(ms(base, 3000));
        assert!(!detector.should_commit(ms(base, 3500)));
        assert!(detector.should_commit(ms(base, 4500)));
    }

    #[test]
    fn continued_speech_defers_the_commit() {
        let base = Instant::now();
        let mut detector = TurnDetector::new(THRESHOLD);

        detector.note_audio(ms(base, 0));
        // Caller keeps talking just under the threshold each time.
        detector.note_audio(ms(base, 1400));
        assert!(!detector.should_commit(ms(base, 2000)));
        detector.note_audio(ms(base, 2800));
        assert!(!detector.should_commit(ms(base, 3000)));
        // Silence finally elapses relative to the last chunk.
        assert!(detector.should_commit(ms(base, 4300)));
    }

    #[test]
    fn threshold_boundary_is_inclusive() {
        let base = Instant::now();
        let mut detector = TurnDetector::new(THRESHOLD);
        detector.note_audio(base);
        assert!(!detector.should_commit(ms(base, 1499)));
        assert!(detector.should_commit(ms(base, 1500)));
    }
}
