//! Packet-loss concealment.
//!
//! When the classifier reports a gap, the hole is filled with synthetic
//! frames built from the last good frame: the samples are replayed with
//! a linear fade toward 30% amplitude and a little noise mixed in, which
//! masks the repeat better than silence or an unfaded copy would. With
//! no reference material the generator degrades to pure silence.
//!
//! Concealment never blocks and never starves the playback path; a full
//! jitter buffer simply drops the synthetic frame.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::frame::PcmFrame;

/// Upper bound on synthetic frames per gap, no matter how large the real
/// gap was.
pub const MAX_CONCEAL_FRAMES: u32 = 20;

/// Amplitude factor at the end of the fade.
const FADE_FLOOR: f64 = 0.3;
/// Peak-to-peak bound of the additive noise.
const NOISE_AMPLITUDE: i16 = 64;

/// Synthesizes replacement audio for lost frames.
pub struct ConcealmentGenerator {
    rng: StdRng,
}

impl ConcealmentGenerator {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Produce `min(count, MAX_CONCEAL_FRAMES)` synthetic frames covering
    /// sequences `start_seq..`.
    ///
    /// `frame_samples` sizes the silence fallback when no good frame has
    /// been seen yet.
    pub fn conceal(
        &mut self,
        count: u32,
        start_seq: u32,
        frame_samples: usize,
        last_good: Option<&PcmFrame>,
    ) -> Vec<PcmFrame> {
        let count = count.min(MAX_CONCEAL_FRAMES);
        (0..count)
            .map(|i| {
                let seq = start_seq.wrapping_add(i);
                match last_good {
                    Some(reference) => self.faded_replay(seq, reference),
                    None => PcmFrame::silence(seq, frame_samples),
                }
            })
            .collect()
    }

    fn faded_replay(&mut self, sequence: u32, reference: &PcmFrame) -> PcmFrame {
        let len = reference.len();
        if len == 0 {
            return PcmFrame::silence(sequence, 0);
        }
        let samples = reference
            .samples
            .iter()
            .enumerate()
            .map(|(i, &sample)| {
                let fade = 1.0 - (1.0 - FADE_FLOOR) * (i as f64 / len as f64);
                let noise: i16 = self.rng.gen_range(-NOISE_AMPLITUDE..=NOISE_AMPLITUDE);
                let value = (sample as f64 * fade) as i64 + noise as i64;
                value.clamp(i16::MIN as i64, i16::MAX as i64) as i16
            })
            .collect();
        PcmFrame::new(sequence, samples)
    }
}

impl Default for ConcealmentGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_reference_yields_silence() {
        let mut generator = ConcealmentGenerator::new();
        let frames = generator.conceal(3, 10, 60, None);
        assert_eq!(frames.len(), 3);
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame.sequence, 10 + i as u32);
            assert_eq!(frame.len(), 60);
            assert!(frame.samples.iter().all(|&s| s == 0));
        }
    }

    #[test]
    fn test_count_is_capped() {
        let mut generator = ConcealmentGenerator::new();
        let frames = generator.conceal(5000, 0, 60, None);
        assert_eq!(frames.len(), MAX_CONCEAL_FRAMES as usize);
    }

    #[test]
    fn test_replay_fades_toward_floor() {
        let mut generator = ConcealmentGenerator::new();
        let reference = PcmFrame::new(0, vec![20_000; 400]);
        let frames = generator.conceal(1, 1, 400, Some(&reference));
        assert_eq!(frames.len(), 1);
        let synth = &frames[0];
        assert_eq!(synth.len(), 400);

        // Early samples stay near full amplitude, late ones near the floor.
        let head = synth.samples[0] as f64;
        let tail = synth.samples[399] as f64;
        assert!(head > 20_000.0 * 0.95 - NOISE_AMPLITUDE as f64);
        assert!(tail < 20_000.0 * (FADE_FLOOR + 0.05) + NOISE_AMPLITUDE as f64);
        assert!(tail > 20_000.0 * (FADE_FLOOR - 0.05) - NOISE_AMPLITUDE as f64);
    }

    #[test]
    fn test_replay_never_clips_past_i16() {
        let mut generator = ConcealmentGenerator::new();
        let reference = PcmFrame::new(0, vec![i16::MAX; 100]);
        let frames = generator.conceal(1, 1, 100, Some(&reference));
        // At the head the fade is ~1.0, so MAX plus positive noise must
        // have been clamped rather than wrapped.
        assert!(frames[0].samples[0] >= i16::MAX - 2 * NOISE_AMPLITUDE);
    }

    #[test]
    fn test_zero_count_yields_nothing() {
        let mut generator = ConcealmentGenerator::new();
        assert!(generator.conceal(0, 0, 60, None).is_empty());
    }
}
