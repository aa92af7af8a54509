//! Session state for one active connection.
//!
//! # Key Types
//! - [`Session`] - Classifier + counters + per-session inferred parameters
//! - [`classifier::SequenceClassifier`] - Raw sequence number classification
//! - [`stats::SessionStats`] - Loss and anomaly totals

pub mod classifier;
pub mod stats;

pub use classifier::{Classification, HUGE_GAP_THRESHOLD, SeqEvent, SequenceClassifier};
pub use stats::SessionStats;

use tracing::{info, warn};

use crate::audio::conceal::MAX_CONCEAL_FRAMES;

/// Everything the ingestion path tracks for one connection. Created on
/// the first accepted frame's session, dropped at disconnect.
#[derive(Debug, Default)]
pub struct Session {
    classifier: SequenceClassifier,
    pub stats: SessionStats,
    /// Samples per frame, inferred once from the first valid payload and
    /// immutable afterwards.
    frame_samples: Option<usize>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frame_samples(&self) -> Option<usize> {
        self.frame_samples
    }

    pub fn expected_sequence(&self) -> Option<u32> {
        self.classifier.last_sequence().map(|s| s.wrapping_add(1))
    }

    /// Classify an arriving frame, update counters, and report how many
    /// concealment frames (if any) should be synthesized before it.
    pub fn observe(&mut self, sequence: u32, payload_len: usize) -> Observation {
        self.stats.total_frames += 1;
        self.infer_frame_samples(payload_len);

        let classification = self.classifier.classify(sequence);
        let mut conceal = 0;
        match classification.event {
            SeqEvent::Start => {
                info!(sequence, "stream started");
            }
            SeqEvent::Continue => {}
            SeqEvent::Duplicate => {
                self.stats.duplicates += 1;
            }
            SeqEvent::Gap => {
                self.stats.record_gap(classification.gap as u64);
                conceal = classification.gap.min(MAX_CONCEAL_FRAMES);
                if classification.gap < 10 {
                    warn!(
                        gap = classification.gap,
                        expected = classification.expected,
                        got = sequence,
                        "sequence gap"
                    );
                } else {
                    warn!(
                        gap = classification.gap,
                        expected = classification.expected,
                        got = sequence,
                        "sequence gap burst"
                    );
                }
            }
            SeqEvent::Reorder => {
                self.stats.reordered += 1;
                warn!(got = sequence, "out-of-order frame");
            }
            SeqEvent::Reset => {
                self.stats.resets += 1;
                warn!(
                    expected = classification.expected,
                    got = sequence,
                    "sequence reset, not counting as loss"
                );
            }
        }

        Observation {
            classification,
            conceal,
        }
    }

    fn infer_frame_samples(&mut self, payload_len: usize) {
        if self.frame_samples.is_none() && payload_len >= 2 && payload_len % 2 == 0 {
            let samples = payload_len / 2;
            info!(samples, "inferred frame size from first payload");
            self.frame_samples = Some(samples);
        }
    }
}

/// Outcome of classifying one frame at the session level.
#[derive(Debug, Clone, Copy)]
pub struct Observation {
    pub classification: Classification,
    /// Concealment frames to synthesize, already capped.
    pub conceal: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gap_schedules_capped_concealment() {
        let mut session = Session::new();
        session.observe(0, 40);
        let obs = session.observe(4, 40);
        assert_eq!(obs.classification.event, SeqEvent::Gap);
        assert_eq!(obs.conceal, 3);
        assert_eq!(session.stats.lost_frames, 3);

        let obs = session.observe(100, 40);
        assert_eq!(obs.classification.event, SeqEvent::Gap);
        assert_eq!(obs.conceal, MAX_CONCEAL_FRAMES);
        assert_eq!(session.stats.lost_frames, 3 + 95);
    }

    #[test]
    fn test_reset_does_not_count_loss() {
        let mut session = Session::new();
        session.observe(0, 40);
        let obs = session.observe(HUGE_GAP_THRESHOLD + 5, 40);
        assert_eq!(obs.classification.event, SeqEvent::Reset);
        assert_eq!(obs.conceal, 0);
        assert_eq!(session.stats.lost_frames, 0);
        assert_eq!(session.stats.resets, 1);
    }

    #[test]
    fn test_frame_samples_inferred_once() {
        let mut session = Session::new();
        session.observe(0, 240);
        assert_eq!(session.frame_samples(), Some(120));
        session.observe(1, 480);
        assert_eq!(session.frame_samples(), Some(120));
    }

    #[test]
    fn test_end_to_end_gap_scenario() {
        // Sequences 0,1,2,3,7,8,9 with 20-byte payloads.
        let mut session = Session::new();
        let events: Vec<_> = [0u32, 1, 2, 3, 7, 8, 9]
            .iter()
            .map(|&seq| session.observe(seq, 20))
            .collect();

        assert_eq!(events[0].classification.event, SeqEvent::Start);
        for obs in &events[1..4] {
            assert_eq!(obs.classification.event, SeqEvent::Continue);
        }
        assert_eq!(events[4].classification.event, SeqEvent::Gap);
        assert_eq!(events[4].classification.gap, 3);
        assert_eq!(events[4].conceal, 3);
        assert_eq!(events[5].classification.event, SeqEvent::Continue);
        assert_eq!(events[6].classification.event, SeqEvent::Continue);
        assert_eq!(session.stats.lost_frames, 3);
        assert_eq!(session.stats.total_frames, 7);
    }
}
