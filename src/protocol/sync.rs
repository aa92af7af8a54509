//! Frame synchronization over an unaligned byte stream.
//!
//! The transport gives us arbitrary chunks with no framing guarantees, so
//! this module owns the receive buffer and recovers frame alignment:
//!
//! - before the first frame, scan for the earliest accepted magic marker
//!   and discard everything in front of it;
//! - once synchronized, reject corrupt headers by dropping exactly one
//!   leading byte and retrying, which bounds recovery to one pass over
//!   the buffered data;
//! - cap the pre-sync buffer so a stream that never synchronizes cannot
//!   grow memory without bound.

use bytes::{Bytes, BytesMut};
use tracing::{debug, info, warn};

use super::frame::{Frame, FrameHeader, HEADER_SIZE, MAGIC_CURRENT, MAGIC_LEGACY};
use super::preamble::{PreambleStatus, StreamParams, take_preamble};

/// Pre-sync buffer cap. Beyond this, stale leading bytes are discarded.
const UNSYNCED_BUFFER_CAP: usize = 8192;
/// How much of the tail survives a pre-sync discard.
const UNSYNCED_BUFFER_KEEP: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Waiting to learn whether the stream opens with an ASCII preamble.
    Preamble,
    /// Scanning for the first magic marker.
    Searching,
    /// Aligned; headers are expected at the buffer head.
    Synced,
}

/// Incremental frame extractor over an internal receive buffer.
///
/// Feed raw chunks with [`extend`](Self::extend) and drain frames with
/// [`next_frame`](Self::next_frame) until it returns `None` ("need more
/// bytes"). The synchronizer never blocks and holds only bounded memory.
pub struct FrameSynchronizer {
    buf: BytesMut,
    phase: Phase,
    /// Legacy magic is accepted until the current magic is first seen,
    /// then rejected for the rest of the session. One-way lock, kept for
    /// wire compatibility with old sender firmware.
    legacy_allowed: bool,
    params: Option<StreamParams>,
    resync_drops: u64,
}

impl FrameSynchronizer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(UNSYNCED_BUFFER_CAP),
            phase: Phase::Preamble,
            legacy_allowed: true,
            params: None,
            resync_drops: 0,
        }
    }

    /// Append a received chunk to the internal buffer.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Parameters parsed from the session preamble, if one was present.
    pub fn params(&self) -> Option<&StreamParams> {
        self.params.as_ref()
    }

    /// Whether the legacy magic is still accepted in this session.
    pub fn legacy_allowed(&self) -> bool {
        self.legacy_allowed
    }

    /// Total bytes dropped by single-byte resync since session start.
    pub fn resync_drops(&self) -> u64 {
        self.resync_drops
    }

    /// Extract the next complete frame, or `None` if more bytes are
    /// needed. Corrupt data in front of a valid frame is consumed.
    pub fn next_frame(&mut self) -> Option<Frame> {
        if self.phase == Phase::Preamble {
            match take_preamble(&mut self.buf) {
                PreambleStatus::Pending => return None,
                PreambleStatus::Absent => {
                    self.phase = Phase::Searching;
                }
                PreambleStatus::Parsed(params) => {
                    info!(
                        sample_rate = params.sample_rate,
                        channels = params.channels,
                        bits = params.bits_per_sample,
                        "session preamble received"
                    );
                    self.params = Some(params);
                    self.phase = Phase::Searching;
                }
            }
        }

        if self.phase == Phase::Searching && !self.seek_magic() {
            return None;
        }

        self.consume_frame()
    }

    /// Scan for the earliest accepted magic and align the buffer to it.
    /// Returns false when no marker is in the buffer yet.
    fn seek_magic(&mut self) -> bool {
        let pos_current = find_subslice(&self.buf, &MAGIC_CURRENT.to_le_bytes());
        let pos_legacy = if self.legacy_allowed {
            find_subslice(&self.buf, &MAGIC_LEGACY.to_le_bytes())
        } else {
            None
        };

        // Current magic wins a tie: a session that speaks the current
        // format must not be locked to the legacy one by accident.
        let chosen = match (pos_current, pos_legacy) {
            (Some(c), Some(l)) if c <= l => Some((c, MAGIC_CURRENT)),
            (Some(c), None) => Some((c, MAGIC_CURRENT)),
            (_, Some(l)) => Some((l, MAGIC_LEGACY)),
            (None, None) => None,
        };

        let Some((pos, magic)) = chosen else {
            if self.buf.len() > UNSYNCED_BUFFER_CAP {
                let discard = self.buf.len() - UNSYNCED_BUFFER_KEEP;
                let _ = self.buf.split_to(discard);
                debug!(discard, "no magic in oversized pre-sync buffer, trimming");
            }
            return false;
        };

        if pos > 0 {
            let _ = self.buf.split_to(pos);
            debug!(skipped = pos, "skipped leading garbage to reach magic");
        }
        if magic == MAGIC_CURRENT {
            if self.legacy_allowed {
                info!("synced to current magic, legacy magic now disabled");
            }
            self.legacy_allowed = false;
        } else {
            warn!("synced to legacy magic");
        }
        self.phase = Phase::Synced;
        true
    }

    /// Consume complete frames from the buffer head, dropping one byte at
    /// a time past anything that fails header validation.
    fn consume_frame(&mut self) -> Option<Frame> {
        while self.buf.len() >= HEADER_SIZE {
            let header = FrameHeader::decode(&self.buf);
            if let Err(err) = header.check(self.legacy_allowed) {
                // Magic bytes can appear inside payload, so a matched
                // magic with a bad length is still treated as garbage.
                let _ = self.buf.split_to(1);
                self.resync_drops += 1;
                if self.resync_drops % 1024 == 1 {
                    warn!(%err, drops = self.resync_drops, "resync: dropped leading byte");
                }
                continue;
            }

            let total = HEADER_SIZE + header.payload_len as usize;
            if self.buf.len() < total {
                return None;
            }

            if header.magic == MAGIC_CURRENT && self.legacy_allowed {
                info!("current magic observed, legacy magic now disabled");
                self.legacy_allowed = false;
            }

            let _ = self.buf.split_to(HEADER_SIZE);
            let payload: Bytes = self.buf.split_to(header.payload_len as usize).freeze();
            return Some(Frame { header, payload });
        }
        None
    }
}

impl Default for FrameSynchronizer {
    fn default() -> Self {
        Self::new()
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::{CODEC_CVSD, MAX_PAYLOAD_LEN};

    fn frame_bytes(magic: u32, seq: u32, payload_len: u16) -> Vec<u8> {
        let header = FrameHeader {
            magic,
            sequence: seq,
            timestamp_us: 0,
            payload_len,
            codec: CODEC_CVSD,
        };
        let payload = vec![0x22u8; payload_len as usize];
        let frame = Frame {
            header,
            payload: payload.into(),
        };
        frame.encode().to_vec()
    }

    #[test]
    fn test_clean_stream_yields_frames_in_order() {
        let mut sync = FrameSynchronizer::new();
        for seq in 0..5 {
            sync.extend(&frame_bytes(MAGIC_CURRENT, seq, 40));
        }
        for seq in 0..5 {
            let frame = sync.next_frame().expect("frame available");
            assert_eq!(frame.header.sequence, seq);
            assert_eq!(frame.payload.len(), 40);
        }
        assert!(sync.next_frame().is_none());
    }

    #[test]
    fn test_garbage_before_first_frame_is_consumed() {
        let mut sync = FrameSynchronizer::new();
        sync.extend(&[0xAB; 300]);
        sync.extend(&frame_bytes(MAGIC_CURRENT, 7, 40));
        let frame = sync.next_frame().expect("recovered frame");
        assert_eq!(frame.header.sequence, 7);
        assert!(sync.next_frame().is_none());
    }

    #[test]
    fn test_incomplete_frame_waits_for_more_bytes() {
        let mut sync = FrameSynchronizer::new();
        let bytes = frame_bytes(MAGIC_CURRENT, 0, 100);
        sync.extend(&bytes[..HEADER_SIZE + 10]);
        assert!(sync.next_frame().is_none());
        sync.extend(&bytes[HEADER_SIZE + 10..]);
        assert!(sync.next_frame().is_some());
    }

    #[test]
    fn test_invalid_length_resyncs_one_byte_at_a_time() {
        let mut sync = FrameSynchronizer::new();
        // Valid magic but zero-length payload: corrupt, not a frame.
        let mut corrupt = frame_bytes(MAGIC_CURRENT, 0, 40);
        corrupt[16] = 0;
        corrupt[17] = 0;
        sync.extend(&corrupt);
        sync.extend(&frame_bytes(MAGIC_CURRENT, 1, 40));
        let frame = sync.next_frame().expect("recovered after corrupt header");
        assert_eq!(frame.header.sequence, 1);
        // The entire corrupt frame was walked byte by byte.
        assert_eq!(sync.resync_drops(), corrupt.len() as u64);
    }

    #[test]
    fn test_oversize_length_rejected() {
        let mut sync = FrameSynchronizer::new();
        let mut corrupt = frame_bytes(MAGIC_CURRENT, 0, 40);
        let bad_len = (MAX_PAYLOAD_LEN as u16 + 904).to_le_bytes();
        corrupt[16] = bad_len[0];
        corrupt[17] = bad_len[1];
        sync.extend(&corrupt);
        sync.extend(&frame_bytes(MAGIC_CURRENT, 1, 40));
        let frame = sync.next_frame().expect("recovered after oversize length");
        assert_eq!(frame.header.sequence, 1);
    }

    #[test]
    fn test_legacy_magic_locks_out_after_current_seen() {
        let mut sync = FrameSynchronizer::new();
        sync.extend(&frame_bytes(MAGIC_LEGACY, 0, 40));
        assert!(sync.next_frame().is_some());
        assert!(sync.legacy_allowed());

        sync.extend(&frame_bytes(MAGIC_CURRENT, 1, 40));
        assert!(sync.next_frame().is_some());
        assert!(!sync.legacy_allowed());

        // Legacy frames are now garbage and get walked past.
        sync.extend(&frame_bytes(MAGIC_LEGACY, 2, 40));
        sync.extend(&frame_bytes(MAGIC_CURRENT, 3, 40));
        let frame = sync.next_frame().expect("current frame after legacy junk");
        assert_eq!(frame.header.sequence, 3);
    }

    #[test]
    fn test_legacy_earlier_in_stream_syncs_first() {
        let mut sync = FrameSynchronizer::new();
        let mut stream = frame_bytes(MAGIC_LEGACY, 0, 40);
        stream.extend_from_slice(&frame_bytes(MAGIC_CURRENT, 1, 40));
        sync.extend(&stream);
        // Legacy comes first in the byte stream, so sync lands on it.
        let frame = sync.next_frame().expect("legacy frame");
        assert_eq!(frame.header.magic, MAGIC_LEGACY);
        // But the following current frame flips the lock.
        let frame = sync.next_frame().expect("current frame");
        assert_eq!(frame.header.magic, MAGIC_CURRENT);
        assert!(!sync.legacy_allowed());
    }

    #[test]
    fn test_presync_buffer_is_bounded() {
        let mut sync = FrameSynchronizer::new();
        sync.extend(&[0xAB; 3 * UNSYNCED_BUFFER_CAP]);
        assert!(sync.next_frame().is_none());
        assert!(sync.buf.len() <= UNSYNCED_BUFFER_CAP);
    }

    #[test]
    fn test_preamble_then_frames() {
        let mut sync = FrameSynchronizer::new();
        sync.extend(b"AUDIO_STREAM\nsample_rate=16000\ncodec=MSBC\n\n");
        assert!(sync.next_frame().is_none());
        sync.extend(&frame_bytes(MAGIC_CURRENT, 0, 40));
        assert!(sync.next_frame().is_some());
        assert_eq!(sync.params().unwrap().sample_rate, 16000);
    }
}
