//! Packet transport contract.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use vireo_core::protocol::Packet;

use crate::error::TransportResult;
use crate::network::connection::{TransportId, TransportState, TransportStats};

/// Receives the events of one transport.
///
/// Callbacks for one transport never run concurrently with each other.
pub trait PacketTransportListener: Send + Sync {
    /// A complete packet arrived. Return `true` once the peer is trusted,
    /// which raises the maximum accepted packet size for later frames.
    fn packet_received(&self, packet: Packet) -> bool;

    /// A packet was written to the socket.
    fn packet_sent(&self, _packet: &Packet) {}

    /// The transport stopped. `link_failed` is set when it stopped because of
    /// a socket error, a framing violation or a keep-alive timeout rather
    /// than a local [`PacketTransport::close`].
    fn transport_closed(&self, link_failed: bool);
}

/// Bidirectional, ordered packet channel to one peer.
pub trait PacketTransport: Send + Sync + fmt::Debug {
    /// Transport identifier.
    fn id(&self) -> TransportId;

    /// Address of the peer, if connected.
    fn remote_address(&self) -> Option<SocketAddr>;

    /// Start I/O, delivering events to `listener`.
    ///
    /// # Errors
    /// Returns [`TransportError::InvalidState`](crate::TransportError::InvalidState)
    /// unless the transport is `Created`, or an error if I/O cannot be started.
    fn start(&self, listener: Arc<dyn PacketTransportListener>) -> TransportResult<()>;

    /// Queue `packet` for sending. Packets leave in queue order.
    ///
    /// Never blocks; callers must respect [`needs_throttling`](Self::needs_throttling).
    ///
    /// # Errors
    /// Returns [`TransportError::Closed`](crate::TransportError::Closed) once
    /// the transport is closing.
    fn send(&self, packet: Packet) -> TransportResult<()>;

    /// Whether the send queue reached its configured maximum.
    fn needs_throttling(&self) -> bool;

    /// Close the transport. The listener sees `transport_closed(false)`.
    fn close(&self);

    /// Tear the link down as failed. The listener sees `transport_closed(true)`.
    fn fail(&self, reason: &str);

    /// Current lifecycle state.
    fn state(&self) -> TransportState;

    /// Counter snapshot.
    fn stats(&self) -> TransportStats;
}
