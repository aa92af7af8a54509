//! Wire format for the sensor audio stream.
//!
//! Every frame is a fixed 20-byte little-endian header followed by a raw
//! PCM payload:
//!
//! ```text
//! magic        u32   0x48445541 ("AUDH") or legacy 0x41554448
//! sequence     u32   wraps mod 2^32
//! timestamp    u64   capture time in microseconds, advisory only
//! payload_len  u16   1..=4096
//! codec        u16   1 -> 8000 Hz, 2 -> 16000 Hz
//! ```
//!
//! The payload is always signed 16-bit little-endian mono PCM; the codec
//! tag only selects the playback rate.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Current frame marker ("AUDH" in little-endian byte order).
pub const MAGIC_CURRENT: u32 = 0x4844_5541;
/// Legacy frame marker, accepted only until the current one is first seen.
pub const MAGIC_LEGACY: u32 = 0x4155_4448;

/// Fixed header size in bytes.
pub const HEADER_SIZE: usize = 20;

/// Largest payload a valid frame may carry.
pub const MAX_PAYLOAD_LEN: usize = 4096;

/// Codec tag for the 8 kHz rate family.
pub const CODEC_CVSD: u16 = 1;
/// Codec tag for the 16 kHz rate family.
pub const CODEC_MSBC: u16 = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("unrecognized magic 0x{0:08x}")]
    BadMagic(u32),
    #[error("implausible payload length {0}")]
    BadLength(u16),
}

/// Parsed frame header. Field layout mirrors the wire exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: u32,
    pub sequence: u32,
    pub timestamp_us: u64,
    pub payload_len: u16,
    pub codec: u16,
}

impl FrameHeader {
    /// Decode a header from the first [`HEADER_SIZE`] bytes of `buf`.
    ///
    /// Panics if `buf` is shorter than [`HEADER_SIZE`]; callers check
    /// length before peeking.
    pub fn decode(mut buf: &[u8]) -> Self {
        debug_assert!(buf.len() >= HEADER_SIZE);
        Self {
            magic: buf.get_u32_le(),
            sequence: buf.get_u32_le(),
            timestamp_us: buf.get_u64_le(),
            payload_len: buf.get_u16_le(),
            codec: buf.get_u16_le(),
        }
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.magic);
        buf.put_u32_le(self.sequence);
        buf.put_u64_le(self.timestamp_us);
        buf.put_u16_le(self.payload_len);
        buf.put_u16_le(self.codec);
    }

    /// Validate magic and payload length against the current session rules.
    pub fn check(&self, legacy_allowed: bool) -> Result<(), WireError> {
        let magic_ok =
            self.magic == MAGIC_CURRENT || (legacy_allowed && self.magic == MAGIC_LEGACY);
        if !magic_ok {
            return Err(WireError::BadMagic(self.magic));
        }
        if self.payload_len == 0 || self.payload_len as usize > MAX_PAYLOAD_LEN {
            return Err(WireError::BadLength(self.payload_len));
        }
        Ok(())
    }

    /// Playback rate selected by the codec tag.
    pub fn sample_rate(&self) -> u32 {
        codec_sample_rate(self.codec)
    }
}

/// Map a codec tag to its rate family. Unknown tags fall back to 8 kHz,
/// matching the sender's CVSD default.
pub fn codec_sample_rate(codec: u16) -> u32 {
    if codec == CODEC_MSBC { 16000 } else { 8000 }
}

/// One complete header + payload unit extracted from the byte stream.
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    /// Encode the frame for transmission. Used by test senders.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        self.header.encode_into(&mut buf);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(seq: u32) -> FrameHeader {
        FrameHeader {
            magic: MAGIC_CURRENT,
            sequence: seq,
            timestamp_us: 1_000_000,
            payload_len: 120,
            codec: CODEC_CVSD,
        }
    }

    #[test]
    fn test_header_roundtrip() {
        let h = header(42);
        let mut buf = BytesMut::new();
        h.encode_into(&mut buf);
        assert_eq!(buf.len(), HEADER_SIZE);
        assert_eq!(FrameHeader::decode(&buf), h);
    }

    #[test]
    fn test_check_rejects_unknown_magic() {
        let mut h = header(0);
        h.magic = 0xdead_beef;
        assert_eq!(h.check(true), Err(WireError::BadMagic(0xdead_beef)));
    }

    #[test]
    fn test_check_legacy_lock() {
        let mut h = header(0);
        h.magic = MAGIC_LEGACY;
        assert!(h.check(true).is_ok());
        assert_eq!(h.check(false), Err(WireError::BadMagic(MAGIC_LEGACY)));
    }

    #[test]
    fn test_check_rejects_bad_lengths() {
        let mut h = header(0);
        h.payload_len = 0;
        assert_eq!(h.check(true), Err(WireError::BadLength(0)));
        h.payload_len = 5000;
        assert_eq!(h.check(true), Err(WireError::BadLength(5000)));
        h.payload_len = 4096;
        assert!(h.check(true).is_ok());
    }

    #[test]
    fn test_codec_rates() {
        assert_eq!(codec_sample_rate(CODEC_CVSD), 8000);
        assert_eq!(codec_sample_rate(CODEC_MSBC), 16000);
        assert_eq!(codec_sample_rate(7), 8000);
    }
}
