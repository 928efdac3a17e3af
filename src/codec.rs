//! Framing of serialized envelopes for the byte-oriented link:
//!
//! ```ascii
//! 0: sync marker 0xAA 0x55
//! 2: payload length (u32)
//! 6: payload (serialized envelope)
//! *: CRC-16/IBM-3740 over length and payload (u16)
//! ```
//!
//! Frames are self-delimiting: a decoder that has lost synchronization recovers by
//!  scanning forward for the next marker whose length and checksum add up.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::Crc;
use tracing::warn;

use crate::error::EncodeError;
use crate::packet::Envelope;

pub const SYNC_MARKER: [u8; 2] = [0xAA, 0x55];
pub const LENGTH_FIELD_LEN: usize = 4;
pub const CHECKSUM_LEN: usize = 2;
/// marker + length field + checksum
pub const FRAME_OVERHEAD: usize = SYNC_MARKER.len() + LENGTH_FIELD_LEN + CHECKSUM_LEN;

const HEADER_LEN: usize = SYNC_MARKER.len() + LENGTH_FIELD_LEN;

const CRC16: Crc<u16> = Crc::<u16>::new(&crc::CRC_16_IBM_3740);


/// Wraps a serialized envelope in a frame. Deterministic - the only failure is a payload
///  exceeding the configured maximum, which is rejected before anything reaches the link.
pub fn encode_frame(payload: &[u8], max_payload: usize) -> Result<Bytes, EncodeError> {
    if payload.len() > max_payload {
        return Err(EncodeError::PayloadTooLarge {
            len: payload.len(),
            max: max_payload,
        });
    }

    let mut buf = BytesMut::with_capacity(FRAME_OVERHEAD + payload.len());
    buf.put_slice(&SYNC_MARKER);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);

    let checksum = CRC16.checksum(&buf[SYNC_MARKER.len()..]);
    buf.put_u16(checksum);

    Ok(buf.freeze())
}

/// Counters for non-fatal decode anomalies. None of these is surfaced to callers - they
///  are resolved by resynchronization and tracked here for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeStats {
    pub checksum_mismatches: u64,
    pub malformed_envelopes: u64,
    pub oversize_frames: u64,
}

/// Streaming frame decoder. Feed raw chunks from the link with [FrameDecoder::push], then
///  drain decoded envelopes with [FrameDecoder::next_envelope].
///
/// The decoder makes forward progress of at least one byte per failed frame candidate, so
///  it never stalls on a corrupted byte run, and it buffers at most one incomplete frame
///  plus one trailing marker prefix.
pub struct FrameDecoder {
    buf: BytesMut,
    max_payload: usize,
    stats: DecodeStats,
}

impl FrameDecoder {
    pub fn new(max_payload: usize) -> FrameDecoder {
        FrameDecoder {
            buf: BytesMut::new(),
            max_payload,
            stats: DecodeStats::default(),
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// discards buffered bytes, e.g. after the link was re-established
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    pub fn stats(&self) -> DecodeStats {
        self.stats
    }

    pub fn next_envelope(&mut self) -> Option<Envelope> {
        loop {
            let start = match find_marker(&self.buf) {
                Some(start) => start,
                None => {
                    self.discard_all_but_marker_prefix();
                    return None;
                }
            };
            if start > 0 {
                // garbage before the marker can never become part of a valid frame
                self.buf.advance(start);
            }

            if self.buf.len() < HEADER_LEN {
                return None;
            }

            let declared_len = u32::from_be_bytes([self.buf[2], self.buf[3], self.buf[4], self.buf[5]]) as usize;
            if declared_len > self.max_payload {
                warn!("declared payload length {} exceeds maximum {} - treating as desynchronization", declared_len, self.max_payload);
                self.stats.oversize_frames += 1;
                self.buf.advance(1);
                continue;
            }

            let frame_len = FRAME_OVERHEAD + declared_len;
            if self.buf.len() < frame_len {
                // wait for more data - frames are never emitted partially
                return None;
            }

            let checksum_offset = HEADER_LEN + declared_len;
            let actual = CRC16.checksum(&self.buf[SYNC_MARKER.len()..checksum_offset]);
            let declared = u16::from_be_bytes([self.buf[checksum_offset], self.buf[checksum_offset + 1]]);
            if actual != declared {
                warn!("frame checksum mismatch (expected {:04x}, found {:04x}) - resynchronizing", actual, declared);
                self.stats.checksum_mismatches += 1;
                self.buf.advance(1);
                continue;
            }

            let result = Envelope::deser(&self.buf[HEADER_LEN..checksum_offset]);
            self.buf.advance(frame_len);
            match result {
                Ok(envelope) => return Some(envelope),
                Err(e) => {
                    // framing was intact (the checksum matched), so skipping the whole
                    //  frame keeps the decoder aligned
                    warn!("discarding frame with malformed envelope: {}", e);
                    self.stats.malformed_envelopes += 1;
                }
            }
        }
    }

    fn discard_all_but_marker_prefix(&mut self) {
        let keep = if self.buf.last() == Some(&SYNC_MARKER[0]) { 1 } else { 0 };
        let len = self.buf.len();
        self.buf.advance(len - keep);
    }
}

fn find_marker(buf: &[u8]) -> Option<usize> {
    buf.windows(SYNC_MARKER.len()).position(|w| w == SYNC_MARKER)
}
