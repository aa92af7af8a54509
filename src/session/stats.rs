//! Per-session counters.
//!
//! One record, owned by the ingestion path and updated only by the
//! sequence classifier. The jitter buffer keeps its own shared counters
//! (drops, underruns) because those are touched from the playback side.

/// Loss and anomaly totals for a single session.
#[derive(Debug, Default, Clone, Copy)]
pub struct SessionStats {
    /// Frames accepted off the wire.
    pub total_frames: u64,
    /// Frames presumed lost to forward sequence gaps.
    pub lost_frames: u64,
    /// Exact repeats of the previous sequence number.
    pub duplicates: u64,
    /// Stale frames that arrived after a newer one.
    pub reordered: u64,
    /// Number of distinct gap events (a burst of N lost frames is one event).
    pub gap_events: u64,
    /// Largest single gap observed.
    pub max_gap: u64,
    /// Sequence resets (gaps too large to be believable loss).
    pub resets: u64,
    /// Synthetic concealment frames inserted into the jitter buffer.
    pub concealed: u64,
    /// Concealment frames that could not be queued.
    pub conceal_dropped: u64,
}

impl SessionStats {
    pub fn record_gap(&mut self, gap: u64) {
        self.lost_frames += gap;
        self.gap_events += 1;
        self.max_gap = self.max_gap.max(gap);
    }
}
