//! Packet transports and the TCP server.
//!
//! ## Key Components
//! - [`PacketTransport`] / [`PacketTransportListener`]: the transport contract
//! - [`BlockingTransport`]: one sender and one receiver thread per connection
//! - [`Multiplexer`] / [`MultiplexedTransport`]: many connections on one selector thread
//! - [`PacketServer`]: accepts clients and serves them with the broker engine
//!
//! Keep-alive pings are scheduled by a shared
//! [`ActivityWatchdog`](vireo_core::ActivityWatchdog) rather than one timer
//! per connection.

pub mod blocking;
pub mod connection;
mod keepalive;
pub mod multiplexer;
pub mod server;
pub mod transport;

pub use blocking::{BlockingTransport, PIPELINE_DEPTH};
pub use connection::{TransportId, TransportState, TransportStats};
pub use multiplexer::{InterestSet, LinkState, MultiplexedTransport, Multiplexer};
pub use server::{PacketServer, ServerMode};
pub use transport::{PacketTransport, PacketTransportListener};

use socket2::SockRef;
use vireo_core::TransportSettings;

use crate::error::{TransportError, TransportResult};

/// Apply the socket options of `settings`. Zero buffer sizes keep the system
/// defaults.
pub(crate) fn configure_socket(socket: SockRef<'_>, settings: &TransportSettings) -> TransportResult<()> {
    socket.set_nodelay(settings.tcp_no_delay).map_err(|e| TransportError::io("set TCP_NODELAY", e))?;
    if settings.socket_send_buffer_size > 0 {
        socket
            .set_send_buffer_size(settings.socket_send_buffer_size)
            .map_err(|e| TransportError::io("set SO_SNDBUF", e))?;
    }
    if settings.socket_recv_buffer_size > 0 {
        socket
            .set_recv_buffer_size(settings.socket_recv_buffer_size)
            .map_err(|e| TransportError::io("set SO_RCVBUF", e))?;
    }
    Ok(())
}
