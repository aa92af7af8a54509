//! Per-frame diagnostics: CSV packet log, arrival-delay smoothing, and
//! waveform edge continuity checks.
//!
//! None of this influences the data path; it exists so a capture can be
//! analyzed offline when the stream misbehaves.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::audio::PcmFrame;
use crate::session::SeqEvent;

/// Flush the log every this many rows.
const FLUSH_INTERVAL: u64 = 100;

/// Sample delta between adjacent frames that counts as a discontinuity.
const EDGE_JUMP_THRESHOLD: i32 = 1500;

/// Smoothing factor for the inter-arrival average.
const ARRIVAL_EMA_ALPHA: f64 = 0.1;
/// An arrival delta this many times above the average is logged.
const ARRIVAL_SPIKE_FACTOR: f64 = 2.5;
const ARRIVAL_SPIKE_MIN_MS: f64 = 5.0;

/// One row of the packet log.
#[derive(Debug, Clone, Copy)]
pub struct FrameRecord {
    pub sequence: u32,
    pub expected: u32,
    pub gap: u32,
    pub event: SeqEvent,
    pub lost_total: u64,
    pub dup_total: u64,
    pub reorder_total: u64,
    pub delta_ms: f64,
    pub queue_depth: usize,
    pub underrun: bool,
    pub mean: i32,
    pub edge_jump: i32,
    pub conceal_total: u64,
}

/// CSV writer for per-frame records, one row per classified frame.
pub struct FrameLog {
    writer: BufWriter<File>,
    started: Instant,
    rows: u64,
}

impl FrameLog {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("failed to create packet log {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        writeln!(
            writer,
            "time_s,seq,expected,gap,event,lost_total,dup_total,reorder_total,\
             delta_ms,qsize,underrun,mean,edge_jump,conceal_ins"
        )?;
        info!(path = %path.display(), "packet log open");
        Ok(Self {
            writer,
            started: Instant::now(),
            rows: 0,
        })
    }

    pub fn record(&mut self, r: &FrameRecord) -> Result<()> {
        writeln!(
            self.writer,
            "{:.6},{},{},{},{},{},{},{},{:.3},{},{},{},{},{}",
            self.started.elapsed().as_secs_f64(),
            r.sequence,
            r.expected,
            r.gap,
            r.event,
            r.lost_total,
            r.dup_total,
            r.reorder_total,
            r.delta_ms,
            r.queue_depth,
            r.underrun as u8,
            r.mean,
            r.edge_jump,
            r.conceal_total,
        )?;
        self.rows += 1;
        if self.rows % FLUSH_INTERVAL == 0 {
            self.writer.flush()?;
        }
        Ok(())
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush().context("failed to flush packet log")
    }
}

/// Exponentially smoothed inter-arrival delta with spike detection.
#[derive(Debug, Default)]
pub struct ArrivalTracker {
    prev: Option<Instant>,
    avg_delta_ms: f64,
}

impl ArrivalTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn average_ms(&self) -> f64 {
        self.avg_delta_ms
    }

    /// Record an arrival and return the delta to the previous one.
    pub fn observe(&mut self, now: Instant, sequence: u32) -> f64 {
        let delta_ms = match self.prev {
            None => 0.0,
            Some(prev) => now.duration_since(prev).as_secs_f64() * 1000.0,
        };
        if self.prev.is_some() {
            if self.avg_delta_ms == 0.0 {
                self.avg_delta_ms = delta_ms;
            } else {
                self.avg_delta_ms =
                    (1.0 - ARRIVAL_EMA_ALPHA) * self.avg_delta_ms + ARRIVAL_EMA_ALPHA * delta_ms;
            }
            if self.avg_delta_ms > 0.0
                && delta_ms > self.avg_delta_ms * ARRIVAL_SPIKE_FACTOR
                && delta_ms > ARRIVAL_SPIKE_MIN_MS
            {
                warn!(
                    delta_ms = format!("{delta_ms:.2}"),
                    avg_ms = format!("{:.2}", self.avg_delta_ms),
                    sequence,
                    "inter-arrival spike"
                );
            }
        }
        self.prev = Some(now);
        delta_ms
    }
}

/// Detects amplitude discontinuities between adjacent frames.
#[derive(Debug, Default)]
pub struct EdgeTracker {
    prev_last_sample: Option<i16>,
}

impl EdgeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compare the frame's first sample to the previous frame's last one.
    pub fn observe(&mut self, frame: &PcmFrame) -> i32 {
        let jump = match (self.prev_last_sample, frame.first_sample()) {
            (Some(prev), Some(first)) => (first as i32 - prev as i32).abs(),
            _ => 0,
        };
        if jump > EDGE_JUMP_THRESHOLD {
            warn!(jump, sequence = frame.sequence, "waveform edge jump");
        }
        if let Some(last) = frame.last_sample() {
            self.prev_last_sample = Some(last);
        }
        jump
    }
}
