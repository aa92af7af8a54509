//! Rolling WAV segment capture.
//!
//! Received PCM is accumulated and flushed to `segment_<unix>.wav` files
//! every few seconds, giving an on-disk record of the session. Stale
//! segment files from previous runs are removed at startup.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{info, warn};

/// Default segment length.
pub const DEFAULT_SEGMENT_SECS: u64 = 5;

/// Accumulates PCM and writes one WAV file per elapsed segment window.
pub struct SegmentWriter {
    dir: PathBuf,
    sample_rate: u32,
    segment_len: Duration,
    started: Instant,
    /// Wall-clock start of the current window; names the segment file so
    /// the filename reflects when its audio began, not when it was
    /// flushed.
    window_start: i64,
    samples: Vec<i16>,
}

impl SegmentWriter {
    pub fn new(dir: impl Into<PathBuf>, sample_rate: u32, segment_secs: u64) -> Self {
        Self {
            dir: dir.into(),
            sample_rate,
            segment_len: Duration::from_secs(segment_secs),
            started: Instant::now(),
            window_start: chrono::Utc::now().timestamp(),
            samples: Vec::new(),
        }
    }

    /// Remove `segment_*.wav` leftovers from a previous run.
    pub fn clean_stale(dir: &Path) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with("segment_") && name.ends_with(".wav") {
                if let Err(e) = std::fs::remove_file(entry.path()) {
                    warn!("failed to remove stale {name}: {e}");
                }
            }
        }
    }

    /// Switch rate mid-session: flush what we have at the old rate first.
    pub fn set_sample_rate(&mut self, sample_rate: u32) -> Result<()> {
        if sample_rate != self.sample_rate {
            self.flush()?;
            self.sample_rate = sample_rate;
        }
        Ok(())
    }

    pub fn push_samples(&mut self, samples: &[i16]) {
        self.samples.extend_from_slice(samples);
    }

    /// Write the current segment if its window has elapsed.
    pub fn flush_if_due(&mut self) -> Result<()> {
        if self.started.elapsed() >= self.segment_len && !self.samples.is_empty() {
            self.flush()?;
        }
        Ok(())
    }

    /// Write whatever is buffered, regardless of elapsed time.
    pub fn flush(&mut self) -> Result<()> {
        if self.samples.is_empty() {
            self.reset_window();
            return Ok(());
        }

        let filename = format!("segment_{}.wav", self.window_start);
        let path = self.dir.join(&filename);
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer =
            hound::WavWriter::create(&path, spec).context("failed to create segment file")?;
        for &sample in &self.samples {
            writer.write_sample(sample)?;
        }
        writer.finalize().context("failed to finalize segment")?;

        let duration = self.samples.len() as f64 / self.sample_rate as f64;
        info!(file = %filename, seconds = format!("{duration:.1}"), "saved segment");

        self.samples.clear();
        self.reset_window();
        Ok(())
    }

    fn reset_window(&mut self) {
        self.started = Instant::now();
        self.window_start = chrono::Utc::now().timestamp();
    }
}
