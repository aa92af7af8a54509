//! Decoded PCM audio frames.

use bytes::Bytes;

/// One frame of signed 16-bit mono PCM, the unit moved between the
/// ingestion path and the playback path.
///
/// Frames are transferred by move from stage to stage; nothing past the
/// synchronizer holds references into the receive buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcmFrame {
    /// Wire sequence number, or the synthesized one for concealment frames.
    pub sequence: u32,
    /// Interleaved little-endian mono samples.
    pub samples: Vec<i16>,
}

impl PcmFrame {
    pub fn new(sequence: u32, samples: Vec<i16>) -> Self {
        Self { sequence, samples }
    }

    /// Decode a raw s16le payload. A trailing odd byte is ignored.
    pub fn from_payload(sequence: u32, payload: &Bytes) -> Self {
        let samples = payload
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        Self { sequence, samples }
    }

    /// A frame of pure silence.
    pub fn silence(sequence: u32, sample_count: usize) -> Self {
        Self {
            sequence,
            samples: vec![0; sample_count],
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Frame duration in milliseconds at the given playback rate.
    pub fn duration_ms(&self, sample_rate: u32) -> f64 {
        self.samples.len() as f64 * 1000.0 / sample_rate as f64
    }

    /// Mean sample value, used for per-frame diagnostics.
    pub fn mean(&self) -> i32 {
        if self.samples.is_empty() {
            return 0;
        }
        let sum: i64 = self.samples.iter().map(|&s| s as i64).sum();
        (sum / self.samples.len() as i64) as i32
    }

    pub fn first_sample(&self) -> Option<i16> {
        self.samples.first().copied()
    }

    pub fn last_sample(&self) -> Option<i16> {
        self.samples.last().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_decode_little_endian() {
        let payload = Bytes::from_static(&[0x01, 0x00, 0xFF, 0xFF, 0x00, 0x80]);
        let frame = PcmFrame::from_payload(3, &payload);
        assert_eq!(frame.sequence, 3);
        assert_eq!(frame.samples, vec![1, -1, i16::MIN]);
    }

    #[test]
    fn test_silence_is_all_zero() {
        let frame = PcmFrame::silence(0, 60);
        assert_eq!(frame.len(), 60);
        assert!(frame.samples.iter().all(|&s| s == 0));
    }

    #[test]
    fn test_duration() {
        let frame = PcmFrame::silence(0, 60);
        assert_eq!(frame.duration_ms(8000), 7.5);
        assert_eq!(frame.duration_ms(16000), 3.75);
    }

    #[test]
    fn test_mean_and_edges() {
        let frame = PcmFrame::new(0, vec![10, 20, 30]);
        assert_eq!(frame.mean(), 20);
        assert_eq!(frame.first_sample(), Some(10));
        assert_eq!(frame.last_sample(), Some(30));
    }
}
