//! Adaptive jitter buffer between ingestion and playback.
//!
//! A bounded single-producer/single-consumer queue of fixed-duration PCM
//! frames, plus a watermark state machine driven by the buffered
//! duration:
//!
//! - `FILLING`: playback is gated until `prebuffer_ms` of audio has
//!   accumulated;
//! - `STEADY`: normal drain, one frame at a time;
//! - `STARVED`: below `min_buffer_ms`, drain pauses so the buffer can
//!   recover; counted as an underrun once playback has started;
//! - `OVERFULL`: above `max_buffer_ms`, drain speeds up to pull latency
//!   back toward the target.
//!
//! States are re-evaluated on every push and on every playback tick.
//! Push never blocks: a full queue drops the incoming frame and counts
//! it. Pop blocks up to a short timeout, never forever.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use tracing::{debug, info};

use super::frame::PcmFrame;

/// Default buffered duration required before playback starts.
pub const DEFAULT_PREBUFFER_MS: u64 = 300;
/// Default low watermark; below this the drain pauses.
pub const DEFAULT_MIN_BUFFER_MS: u64 = 40;
/// Default high watermark; above this the drain speeds up.
pub const DEFAULT_MAX_BUFFER_MS: u64 = 160;
/// Default queue capacity in frames (~1.8 s of 7.5 ms frames).
pub const DEFAULT_CAPACITY: usize = 240;

/// Watermark configuration for one session's buffer.
#[derive(Debug, Clone, Copy)]
pub struct JitterConfig {
    pub prebuffer_ms: u64,
    pub min_buffer_ms: u64,
    pub max_buffer_ms: u64,
    pub capacity: usize,
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self {
            prebuffer_ms: DEFAULT_PREBUFFER_MS,
            min_buffer_ms: DEFAULT_MIN_BUFFER_MS,
            max_buffer_ms: DEFAULT_MAX_BUFFER_MS,
            capacity: DEFAULT_CAPACITY,
        }
    }
}

/// Pacing state derived from the buffered duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    Filling,
    Steady,
    Starved,
    Overfull,
}

impl std::fmt::Display for BufferState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BufferState::Filling => "FILLING",
            BufferState::Steady => "STEADY",
            BufferState::Starved => "STARVED",
            BufferState::Overfull => "OVERFULL",
        };
        f.write_str(name)
    }
}

struct JitterShared {
    config: JitterConfig,
    /// Duration of one frame in microseconds, recorded from the first
    /// pushed frame and immutable afterwards.
    frame_duration_us: AtomicU64,
    play_started: AtomicBool,
    dropped: AtomicU64,
    underruns: AtomicU64,
}

impl JitterShared {
    fn record_frame_duration(&self, samples: usize, sample_rate: u32) {
        if sample_rate == 0 || samples == 0 {
            return;
        }
        let us = samples as u64 * 1_000_000 / sample_rate as u64;
        if self
            .frame_duration_us
            .compare_exchange(0, us, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            info!(
                frame_ms = us as f64 / 1000.0,
                "jitter buffer frame duration fixed"
            );
        }
    }

    fn frame_duration_ms(&self) -> f64 {
        self.frame_duration_us.load(Ordering::Acquire) as f64 / 1000.0
    }

    fn buffered_ms(&self, queued: usize) -> f64 {
        queued as f64 * self.frame_duration_ms()
    }

    /// Re-evaluate the watermark state. Flips the one-way playback gate
    /// when the prebuffer target is first reached.
    fn evaluate(&self, queued: usize) -> BufferState {
        let buffered = self.buffered_ms(queued);

        if !self.play_started.load(Ordering::Acquire) {
            if buffered < self.config.prebuffer_ms as f64 {
                return BufferState::Filling;
            }
            if self
                .play_started
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                info!(buffered_ms = buffered, "prebuffer reached, playback open");
            }
        }

        if buffered < self.config.min_buffer_ms as f64 {
            BufferState::Starved
        } else if buffered > self.config.max_buffer_ms as f64 {
            BufferState::Overfull
        } else {
            BufferState::Steady
        }
    }
}

/// Counter snapshot for stats reporting.
#[derive(Debug, Clone, Copy, Default)]
pub struct JitterCounters {
    /// Frames dropped because the queue was full.
    pub dropped: u64,
    /// Starvation episodes after playback had started.
    pub underruns: u64,
}

/// Create a connected producer/consumer pair over a bounded queue.
pub fn jitter_buffer(config: JitterConfig) -> (JitterProducer, JitterConsumer) {
    let (tx, rx) = bounded(config.capacity);
    let shared = Arc::new(JitterShared {
        config,
        frame_duration_us: AtomicU64::new(0),
        play_started: AtomicBool::new(false),
        dropped: AtomicU64::new(0),
        underruns: AtomicU64::new(0),
    });
    (
        JitterProducer {
            tx,
            shared: shared.clone(),
        },
        JitterConsumer {
            rx,
            shared,
            starved_latch: false,
        },
    )
}

/// Result of a fail-fast push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Push {
    Queued,
    /// Queue full; the frame was dropped and counted.
    Full,
    /// The consumer is gone; the playback side has shut down.
    Disconnected,
}

/// Ingestion-side handle. Push is fail-fast and never blocks.
pub struct JitterProducer {
    tx: Sender<PcmFrame>,
    shared: Arc<JitterShared>,
}

impl JitterProducer {
    /// Enqueue a frame. A full queue drops and counts the frame; a
    /// disconnected queue means the consumer exited and the session
    /// cannot play anything further.
    pub fn push(&self, frame: PcmFrame, sample_rate: u32) -> Push {
        self.shared.record_frame_duration(frame.len(), sample_rate);
        match self.tx.try_send(frame) {
            Ok(()) => {
                self.shared.evaluate(self.tx.len());
                Push::Queued
            }
            Err(TrySendError::Full(_)) => {
                self.shared.dropped.fetch_add(1, Ordering::AcqRel);
                Push::Full
            }
            Err(TrySendError::Disconnected(_)) => Push::Disconnected,
        }
    }

    pub fn buffered_ms(&self) -> f64 {
        self.shared.buffered_ms(self.tx.len())
    }

    pub fn queued(&self) -> usize {
        self.tx.len()
    }

    pub fn counters(&self) -> JitterCounters {
        JitterCounters {
            dropped: self.shared.dropped.load(Ordering::Acquire),
            underruns: self.shared.underruns.load(Ordering::Acquire),
        }
    }

    /// True when playback has started but the buffer is currently below
    /// the low watermark. Used for the per-frame diagnostic log.
    pub fn underrun_pending(&self) -> bool {
        self.shared.play_started.load(Ordering::Acquire)
            && self.shared.evaluate(self.tx.len()) == BufferState::Starved
    }
}

/// Result of a blocking pop.
#[derive(Debug, PartialEq, Eq)]
pub enum Pop {
    Frame(PcmFrame),
    /// Nothing arrived within the timeout.
    Empty,
    /// The producer went away; the session is over.
    Disconnected,
}

/// Playback-side handle. Pop blocks up to a timeout, never forever.
pub struct JitterConsumer {
    rx: Receiver<PcmFrame>,
    shared: Arc<JitterShared>,
    /// Set while inside a starvation episode so each episode counts one
    /// underrun, not one per tick.
    starved_latch: bool,
}

impl JitterConsumer {
    pub fn pop(&self, timeout: Duration) -> Pop {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Pop::Frame(frame),
            Err(RecvTimeoutError::Timeout) => Pop::Empty,
            Err(RecvTimeoutError::Disconnected) => Pop::Disconnected,
        }
    }

    pub fn buffered_ms(&self) -> f64 {
        self.shared.buffered_ms(self.rx.len())
    }

    pub fn queued(&self) -> usize {
        self.rx.len()
    }

    /// Re-evaluate the state on a playback tick, counting underruns on
    /// the transition into starvation.
    pub fn tick_state(&mut self) -> BufferState {
        let state = self.shared.evaluate(self.rx.len());
        if state == BufferState::Starved {
            if !self.starved_latch {
                self.starved_latch = true;
                let total = self.shared.underruns.fetch_add(1, Ordering::AcqRel) + 1;
                debug!(underruns = total, "buffer starved, pausing drain");
            }
        } else {
            self.starved_latch = false;
        }
        state
    }

    /// Whole frames the feeder should withdraw this tick.
    pub fn drain_quota(&mut self, tick: Duration) -> usize {
        let frame_ms = self.shared.frame_duration_ms();
        if frame_ms <= 0.0 {
            return 0;
        }
        let base = (tick.as_secs_f64() * 1000.0 / frame_ms).ceil().max(1.0) as usize;
        match self.tick_state() {
            BufferState::Filling | BufferState::Starved => 0,
            BufferState::Steady => base,
            // Fast drain: withdraw double until latency is back in range.
            BufferState::Overfull => base * 2,
        }
    }

    pub fn counters(&self) -> JitterCounters {
        JitterCounters {
            dropped: self.shared.dropped.load(Ordering::Acquire),
            underruns: self.shared.underruns.load(Ordering::Acquire),
        }
    }
}
