//! Length-prefixed packet framing with partial-frame cursors.
//!
//! Every frame is a big-endian `i32` length followed by that many bytes of
//! serialized packet. The decoder tolerates frames split across arbitrary read
//! boundaries; the encoder drains one frame at a time into a bounded output
//! window so a large packet never needs a window of its own size.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::protocol::packet::{Packet, PacketSerializer, PACKET_HEADER_SIZE};
use crate::protocol::{ProtocolError, ProtocolResult, DEFAULT_MAX_PACKET_SIZE};

/// Size of the frame length prefix.
pub const FRAME_LENGTH_SIZE: usize = 4;

/// Check a declared frame length against the current size policy.
///
/// # Errors
/// Returns [`ProtocolError::InvalidPacketSize`] for lengths too small to hold a
/// packet envelope and [`ProtocolError::PacketTooLarge`] above `max_packet_size`.
pub fn validate_frame_length(length: i32, max_packet_size: usize) -> ProtocolResult<usize> {
    let size = usize::try_from(length).map_err(|_| ProtocolError::InvalidPacketSize { size: length })?;
    if size < PACKET_HEADER_SIZE {
        return Err(ProtocolError::InvalidPacketSize { size: length });
    }
    if size > max_packet_size {
        return Err(ProtocolError::PacketTooLarge { actual: size, max: max_packet_size });
    }
    Ok(size)
}

/// Serialize a packet into one complete frame.
///
/// # Errors
/// Returns an error if serialization fails or the frame exceeds `max_packet_size`.
pub fn encode_frame(packet: &Packet, max_packet_size: usize) -> ProtocolResult<Bytes> {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_i32(0);
    PacketSerializer::serialize(packet, &mut buf)?;
    let size = buf.len() - FRAME_LENGTH_SIZE;
    if size > max_packet_size {
        return Err(ProtocolError::PacketTooLarge { actual: size, max: max_packet_size });
    }
    let length = i32::try_from(size).map_err(|_| ProtocolError::encoding("frame length overflow"))?;
    buf[..FRAME_LENGTH_SIZE].copy_from_slice(&length.to_be_bytes());
    Ok(buf.freeze())
}

/// Encoder statistics for monitoring.
#[derive(Debug, Default, Clone, Copy)]
pub struct EncoderStats {
    /// Frames fully handed to the output window
    pub packets_encoded: u64,
    /// Bytes copied into the output window
    pub bytes_written: u64,
}

/// Outbound cursor: one frame in flight, drained into a bounded window.
#[derive(Debug)]
pub struct PacketEncoder {
    /// Remainder of the frame being written
    pending: Bytes,
    max_packet_size: usize,
    stats: EncoderStats,
}

impl PacketEncoder {
    /// Create an encoder with the default packet size limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_packet_size(DEFAULT_MAX_PACKET_SIZE)
    }

    /// Create an encoder with an explicit packet size limit.
    #[must_use]
    pub fn with_max_packet_size(max_packet_size: usize) -> Self {
        Self { pending: Bytes::new(), max_packet_size, stats: EncoderStats::default() }
    }

    /// Whether a frame is still partially unwritten.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Start writing a new frame.
    ///
    /// # Errors
    /// Returns an error if the previous frame has not been fully drained or if
    /// the packet cannot be encoded.
    pub fn load(&mut self, packet: &Packet) -> ProtocolResult<()> {
        if self.has_pending() {
            return Err(ProtocolError::encoding("previous frame not fully written"));
        }
        self.pending = encode_frame(packet, self.max_packet_size)?;
        Ok(())
    }

    /// Copy as much of the pending frame as fits below `capacity` bytes of
    /// `window`. Returns the number of bytes copied.
    pub fn fill(&mut self, window: &mut BytesMut, capacity: usize) -> usize {
        let room = capacity.saturating_sub(window.len());
        let count = room.min(self.pending.len());
        if count == 0 {
            return 0;
        }
        window.put_slice(&self.pending[..count]);
        self.pending.advance(count);
        self.stats.bytes_written += count as u64;
        if self.pending.is_empty() {
            self.stats.packets_encoded += 1;
        }
        count
    }

    /// Encoder statistics.
    #[must_use]
    pub const fn stats(&self) -> &EncoderStats {
        &self.stats
    }
}

impl Default for PacketEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Decoder statistics for monitoring.
#[derive(Debug, Default, Clone, Copy)]
pub struct DecoderStats {
    /// Packets successfully decoded
    pub packets_decoded: u64,
    /// Bytes consumed from the input window
    pub bytes_consumed: u64,
    /// Decode calls that stopped on an incomplete frame
    pub incomplete_frames: u64,
}

/// Inbound cursor over a growing input window.
#[derive(Debug)]
pub struct PacketDecoder {
    /// Length of the frame whose prefix was already consumed
    expected: Option<usize>,
    max_packet_size: usize,
    stats: DecoderStats,
}

impl PacketDecoder {
    /// Create a decoder with the given size limit.
    #[must_use]
    pub fn new(max_packet_size: usize) -> Self {
        Self { expected: None, max_packet_size, stats: DecoderStats::default() }
    }

    /// Change the size limit applied to the next frame prefix.
    pub const fn set_max_packet_size(&mut self, size: usize) {
        self.max_packet_size = size;
    }

    /// Current size limit.
    #[must_use]
    pub const fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// Decode the next packet from the front of `input`.
    ///
    /// Returns `Ok(None)` when `input` holds only part of a frame; the consumed
    /// prefix is remembered and decoding resumes on the next call.
    ///
    /// # Errors
    /// Returns an error on size violations or malformed packets. The stream is
    /// unusable afterwards.
    pub fn decode(&mut self, input: &mut BytesMut) -> ProtocolResult<Option<Packet>> {
        let size = match self.expected {
            Some(size) => size,
            None => {
                if input.len() < FRAME_LENGTH_SIZE {
                    self.stats.incomplete_frames += 1;
                    return Ok(None);
                }
                let size = validate_frame_length(input.get_i32(), self.max_packet_size)?;
                self.stats.bytes_consumed += FRAME_LENGTH_SIZE as u64;
                self.expected = Some(size);
                size
            },
        };

        if input.len() < size {
            self.stats.incomplete_frames += 1;
            return Ok(None);
        }

        self.expected = None;
        let body = input.split_to(size).freeze();
        self.stats.bytes_consumed += size as u64;
        let packet = PacketSerializer::unserialize(body)?;
        self.stats.packets_decoded += 1;
        Ok(Some(packet))
    }

    /// Whether a frame prefix has been consumed without its body.
    #[must_use]
    pub const fn is_mid_frame(&self) -> bool {
        self.expected.is_some()
    }

    /// Body size of the frame being accumulated, if its prefix was read.
    #[must_use]
    pub const fn expected_size(&self) -> Option<usize> {
        self.expected
    }

    /// Decoder statistics.
    #[must_use]
    pub const fn stats(&self) -> &DecoderStats {
        &self.stats
    }
}

impl Default for PacketDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PACKET_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::DestinationRef;
    use crate::protocol::queries::{CommitQuery, PingQuery, QueueSizeQuery};
    use crate::protocol::responses::QueueSizeResponse;
    use crate::protocol::{PacketKind, DEFAULT_MAX_UNTRUSTED_PACKET_SIZE};

    #[test]
    fn test_frame_length_prefix() {
        let frame = encode_frame(&Packet::new(PingQuery), DEFAULT_MAX_PACKET_SIZE).unwrap();
        assert_eq!(frame.len(), FRAME_LENGTH_SIZE + PACKET_HEADER_SIZE);
        assert_eq!(&frame[..4], &(PACKET_HEADER_SIZE as i32).to_be_bytes());
    }

    #[test]
    fn test_two_pipelined_packets() {
        let mut input = BytesMut::new();
        input.extend_from_slice(&encode_frame(&Packet::new(CommitQuery { session_id: 1 }), 1024).unwrap());
        input.extend_from_slice(&encode_frame(&Packet::new(CommitQuery { session_id: 2 }), 1024).unwrap());

        let mut decoder = PacketDecoder::default();
        let first = decoder.decode(&mut input).unwrap().unwrap();
        let second = decoder.decode(&mut input).unwrap().unwrap();
        assert_eq!(first.kind, PacketKind::CommitQuery(CommitQuery { session_id: 1 }));
        assert_eq!(second.kind, PacketKind::CommitQuery(CommitQuery { session_id: 2 }));
        assert!(decoder.decode(&mut input).unwrap().is_none());
        assert_eq!(decoder.stats().packets_decoded, 2);
    }

    #[test]
    fn test_byte_by_byte_feed() {
        let packet = Packet::with_routing(4, 11, QueueSizeQuery { destination: DestinationRef::queue("q1") });
        let frame = encode_frame(&packet, 1024).unwrap();

        let mut decoder = PacketDecoder::default();
        let mut input = BytesMut::new();
        let mut decoded = None;
        for byte in frame.iter() {
            input.put_u8(*byte);
            if let Some(p) = decoder.decode(&mut input).unwrap() {
                decoded = Some(p);
            }
        }
        assert_eq!(decoded, Some(packet));
        assert!(!decoder.is_mid_frame());
    }

    #[test]
    fn test_untrusted_limit_then_trusted() {
        let mut decoder = PacketDecoder::new(DEFAULT_MAX_UNTRUSTED_PACKET_SIZE);
        let mut input = BytesMut::new();
        input.put_i32(i32::try_from(DEFAULT_MAX_UNTRUSTED_PACKET_SIZE + 1).unwrap());
        assert!(matches!(decoder.decode(&mut input), Err(ProtocolError::PacketTooLarge { .. })));

        decoder = PacketDecoder::new(DEFAULT_MAX_UNTRUSTED_PACKET_SIZE);
        decoder.set_max_packet_size(DEFAULT_MAX_PACKET_SIZE);
        let mut input = BytesMut::new();
        input.put_i32(i32::try_from(DEFAULT_MAX_UNTRUSTED_PACKET_SIZE + 1).unwrap());
        assert!(decoder.decode(&mut input).unwrap().is_none());
        assert!(decoder.is_mid_frame());
    }

    #[test]
    fn test_negative_length_rejected() {
        let mut decoder = PacketDecoder::default();
        let mut input = BytesMut::new();
        input.put_i32(-5);
        assert!(matches!(decoder.decode(&mut input), Err(ProtocolError::InvalidPacketSize { size: -5 })));
    }

    #[test]
    fn test_encoder_drains_into_small_window() {
        let packet = Packet::new(QueueSizeResponse { size: 12 });
        let mut encoder = PacketEncoder::new();
        encoder.load(&packet).unwrap();
        assert!(encoder.load(&packet).is_err());

        let mut wire = BytesMut::new();
        while encoder.has_pending() {
            let mut window = BytesMut::with_capacity(3);
            assert!(encoder.fill(&mut window, 3) > 0);
            wire.extend_from_slice(&window);
        }
        assert_eq!(encoder.stats().packets_encoded, 1);

        let mut decoder = PacketDecoder::default();
        assert_eq!(decoder.decode(&mut wire).unwrap(), Some(packet));
    }

    #[test]
    fn test_encoder_respects_full_window() {
        let mut encoder = PacketEncoder::new();
        encoder.load(&Packet::new(PingQuery)).unwrap();
        let mut window = BytesMut::from(&[0u8; 8][..]);
        assert_eq!(encoder.fill(&mut window, 8), 0);
        assert!(encoder.has_pending());
    }
}
