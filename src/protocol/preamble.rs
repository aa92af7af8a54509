//! Optional ASCII session preamble.
//!
//! Before the first binary frame a sender may transmit a short text
//! block starting with `AUDIO_STREAM`, one `key=value` per line,
//! terminated by a blank line:
//!
//! ```text
//! AUDIO_STREAM
//! sample_rate=16000
//! channels=1
//! bits_per_sample=16
//! codec=MSBC
//!
//! ```
//!
//! The block is plain configuration text, not a frame. It is consumed
//! at most once per session.

use bytes::BytesMut;

const PREAMBLE_TAG: &[u8] = b"AUDIO_STREAM";

/// Bytes to accumulate before giving up on a preamble and treating the
/// stream as binary-only.
const PREAMBLE_WAIT_LIMIT: usize = 2048;

/// Stream parameters carried by the preamble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamParams {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl Default for StreamParams {
    fn default() -> Self {
        Self {
            sample_rate: 8000,
            channels: 1,
            bits_per_sample: 16,
        }
    }
}

/// Outcome of one preamble poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreambleStatus {
    /// Not enough bytes yet to decide either way.
    Pending,
    /// The stream does not start with a preamble; nothing was consumed.
    Absent,
    /// A preamble was consumed from the buffer.
    Parsed(StreamParams),
}

/// Try to consume a leading preamble from `buf`.
///
/// Only a buffer that actually begins with the `AUDIO_STREAM` tag is
/// treated as having a preamble; anything else is reported
/// [`PreambleStatus::Absent`] without consuming, so binary data
/// containing a stray blank line is never eaten.
pub fn take_preamble(buf: &mut BytesMut) -> PreambleStatus {
    if buf.len() < PREAMBLE_TAG.len() {
        // Could still be the start of a tag.
        if PREAMBLE_TAG.starts_with(&buf[..]) {
            return PreambleStatus::Pending;
        }
        return PreambleStatus::Absent;
    }

    if !buf.starts_with(PREAMBLE_TAG) {
        return PreambleStatus::Absent;
    }

    match find_blank_line(buf) {
        Some(end) => {
            let text = buf.split_to(end);
            PreambleStatus::Parsed(parse_params(&text))
        }
        None if buf.len() > PREAMBLE_WAIT_LIMIT => {
            // Terminator never arrived; fall back to binary sync.
            PreambleStatus::Absent
        }
        None => PreambleStatus::Pending,
    }
}

fn find_blank_line(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n").map(|p| p + 2)
}

fn parse_params(text: &[u8]) -> StreamParams {
    let mut params = StreamParams::default();
    let text = String::from_utf8_lossy(text);
    for line in text.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let (key, value) = (key.trim(), value.trim());
        match key {
            "sample_rate" => {
                if let Ok(rate) = value.parse() {
                    params.sample_rate = rate;
                }
            }
            "channels" => {
                if let Ok(ch) = value.parse() {
                    params.channels = ch;
                }
            }
            "bits_per_sample" => {
                if let Ok(bits) = value.parse() {
                    params.bits_per_sample = bits;
                }
            }
            "codec" => {
                params.sample_rate = if value.eq_ignore_ascii_case("MSBC") {
                    16000
                } else {
                    8000
                };
            }
            _ => {}
        }
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_preamble() {
        let mut buf = BytesMut::from(
            &b"AUDIO_STREAM\nsample_rate=16000\nchannels=1\nbits_per_sample=16\ncodec=MSBC\n\nBINARY"[..],
        );
        let status = take_preamble(&mut buf);
        assert_eq!(
            status,
            PreambleStatus::Parsed(StreamParams {
                sample_rate: 16000,
                channels: 1,
                bits_per_sample: 16,
            })
        );
        assert_eq!(&buf[..], b"BINARY");
    }

    #[test]
    fn test_codec_overrides_rate() {
        let mut buf = BytesMut::from(&b"AUDIO_STREAM\nsample_rate=44100\ncodec=CVSD\n\n"[..]);
        match take_preamble(&mut buf) {
            PreambleStatus::Parsed(p) => assert_eq!(p.sample_rate, 8000),
            other => panic!("unexpected status {other:?}"),
        }
    }

    #[test]
    fn test_binary_stream_is_absent() {
        let mut buf = BytesMut::from(&[0x41u8, 0x55, 0x44, 0x48, 0x00, 0x01][..]);
        assert_eq!(take_preamble(&mut buf), PreambleStatus::Absent);
        assert_eq!(buf.len(), 6);
    }

    #[test]
    fn test_partial_tag_is_pending() {
        let mut buf = BytesMut::from(&b"AUDIO_ST"[..]);
        assert_eq!(take_preamble(&mut buf), PreambleStatus::Pending);
    }

    #[test]
    fn test_missing_terminator_falls_back() {
        let mut data = b"AUDIO_STREAM\nsample_rate=8000\n".to_vec();
        data.resize(4096, b'x');
        let mut buf = BytesMut::from(&data[..]);
        assert_eq!(take_preamble(&mut buf), PreambleStatus::Absent);
    }
}
