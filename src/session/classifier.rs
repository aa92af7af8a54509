//! Sequence number classification.
//!
//! The classifier is a loss detector, not a reorder buffer: it compares
//! each arriving sequence number against the last accepted one, emits an
//! event, and always adopts the newest number ("latest wins"). Actual
//! reordering is absorbed downstream by the jitter buffer.

use std::fmt;

/// Gaps at or above this size are treated as a counter reset instead of
/// real loss, so a sender restart is not booked as millions of lost
/// frames.
pub const HUGE_GAP_THRESHOLD: u32 = 100_000;

/// How one frame's sequence number relates to the stream so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqEvent {
    /// First frame of the session.
    Start,
    /// Exactly the expected next sequence.
    Continue,
    /// Same sequence as the previous frame.
    Duplicate,
    /// Forward jump; the skipped frames are presumed lost.
    Gap,
    /// A stale frame arrived after a newer one.
    Reorder,
    /// Implausibly large jump, treated as a stream restart.
    Reset,
}

impl fmt::Display for SeqEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SeqEvent::Start => "START",
            SeqEvent::Continue => "CONT",
            SeqEvent::Duplicate => "DUP",
            SeqEvent::Gap => "GAP",
            SeqEvent::Reorder => "REORDER",
            SeqEvent::Reset => "RESET",
        };
        f.write_str(name)
    }
}

/// Result of classifying one sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub event: SeqEvent,
    /// Number of frames presumed lost. Non-zero only for [`SeqEvent::Gap`].
    pub gap: u32,
    /// What the classifier expected to see.
    pub expected: u32,
}

/// Tracks the last accepted sequence number and classifies new arrivals.
#[derive(Debug, Default)]
pub struct SequenceClassifier {
    last_sequence: Option<u32>,
}

impl SequenceClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_sequence(&self) -> Option<u32> {
        self.last_sequence
    }

    /// Classify `sequence` against the stream so far.
    ///
    /// The last accepted sequence is updated on every call regardless of
    /// the event, including duplicates and reorders.
    pub fn classify(&mut self, sequence: u32) -> Classification {
        let result = match self.last_sequence {
            None => Classification {
                event: SeqEvent::Start,
                gap: 0,
                expected: sequence,
            },
            Some(last) => {
                let expected = last.wrapping_add(1);
                if sequence == last {
                    Classification {
                        event: SeqEvent::Duplicate,
                        gap: 0,
                        expected,
                    }
                } else if sequence == expected {
                    Classification {
                        event: SeqEvent::Continue,
                        gap: 0,
                        expected,
                    }
                } else {
                    let forward_gap = sequence.wrapping_sub(expected);
                    if forward_gap > 0 && forward_gap < HUGE_GAP_THRESHOLD {
                        Classification {
                            event: SeqEvent::Gap,
                            gap: forward_gap,
                            expected,
                        }
                    } else if sequence < last {
                        Classification {
                            event: SeqEvent::Reorder,
                            gap: 0,
                            expected,
                        }
                    } else {
                        Classification {
                            event: SeqEvent::Reset,
                            gap: 0,
                            expected,
                        }
                    }
                }
            }
        };
        self.last_sequence = Some(sequence);
        result
    }
}
