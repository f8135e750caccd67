//! Binary packet protocol spoken between clients and the broker.
//!
//! ## Frame Structure
//!
//! ```text
//! +--------+--------+--------+--------+
//! | Frame length (i32, big-endian)    |
//! +--------+--------+--------+--------+--------+--------+--------+--------+--------+
//! | Type   | Endpoint id                       | Correlation id                    |
//! +--------+--------+--------+--------+--------+--------+--------+--------+--------+
//! | Type specific fields (variable length)                                          |
//! +--------+--------+--------+--------+--------+--------+--------+--------+--------+
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use bytes::BytesMut;
//! use vireo_core::protocol::{encode_frame, Packet, PacketDecoder, DEFAULT_MAX_PACKET_SIZE};
//! use vireo_core::protocol::queries::CommitQuery;
//!
//! let packet = Packet::with_routing(1, 7, CommitQuery { session_id: 3 });
//! let frame = encode_frame(&packet, DEFAULT_MAX_PACKET_SIZE).unwrap();
//!
//! let mut input = BytesMut::from(&frame[..]);
//! let mut decoder = PacketDecoder::default();
//! assert_eq!(decoder.decode(&mut input).unwrap(), Some(packet));
//! ```

pub mod codec;
pub mod error;
pub mod notifications;
pub mod packet;
pub mod queries;
pub mod responses;
pub mod wire;

pub use codec::{
    encode_frame, validate_frame_length, DecoderStats, EncoderStats, PacketDecoder, PacketEncoder,
    FRAME_LENGTH_SIZE,
};
pub use error::{ProtocolError, ProtocolResult};
pub use packet::{Packet, PacketBody, PacketKind, PacketSerializer, PacketType, PACKET_HEADER_SIZE};
pub use responses::PROTOCOL_VERSION;

/// Maximum packet size once the peer is trusted (4 MiB).
pub const DEFAULT_MAX_PACKET_SIZE: usize = 4 * 1024 * 1024;

/// Maximum packet size accepted before the peer has authenticated (16 KiB).
pub const DEFAULT_MAX_UNTRUSTED_PACKET_SIZE: usize = 16 * 1024;
