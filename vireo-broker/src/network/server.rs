//! TCP server feeding accepted connections to the broker engine.
//!
//! In blocking mode a dedicated acceptor thread hands every connection to a
//! [`BlockingTransport`]; in multiplexed mode the [`Multiplexer`] accepts and
//! drives all connections from its selector thread.

use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use vireo_core::config::NetworkConfig;
use vireo_core::TransportSettings;

use crate::broker::Broker;
use crate::error::{TransportError, TransportResult};
use crate::network::{BlockingTransport, Multiplexer, PacketTransport, TransportId};
use crate::processor::ClientProcessor;

const ACCEPT_POLL: Duration = Duration::from_millis(50);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// How accepted connections are driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerMode {
    /// Two threads per connection
    Blocking,
    /// One selector thread for every connection
    Multiplexed,
}

impl ServerMode {
    /// Mode selected by `settings.use_multiplexer`.
    #[must_use]
    pub const fn from_settings(settings: &TransportSettings) -> Self {
        if settings.use_multiplexer {
            Self::Multiplexed
        } else {
            Self::Blocking
        }
    }
}

/// Live connections of a server and the broker serving them.
struct ConnectionTable {
    broker: Arc<Broker>,
    connections: DashMap<TransportId, Arc<dyn PacketTransport>>,
    max_connections: usize,
}

impl ConnectionTable {
    fn serve(self: &Arc<Self>, transport: Arc<dyn PacketTransport>) {
        let id = transport.id();
        if self.connections.len() >= self.max_connections {
            warn!(
                address = ?transport.remote_address(),
                max_connections = self.max_connections,
                "Rejecting connection - at maximum capacity"
            );
            transport.close();
            return;
        }
        self.connections.insert(id, Arc::clone(&transport));

        let processor = ClientProcessor::new(Arc::clone(&self.broker), Arc::clone(&transport));
        let table = Arc::downgrade(self);
        processor.on_closed(move |id| {
            if let Some(table) = table.upgrade() {
                table.connections.remove(&id);
            }
        });
        if let Err(e) = processor.start() {
            warn!(transport = %id, error = %e, "Cannot start client transport");
            self.connections.remove(&id);
            transport.close();
        }
    }

    fn close_all(&self) {
        let transports: Vec<Arc<dyn PacketTransport>> =
            self.connections.iter().map(|e| Arc::clone(e.value())).collect();
        for transport in transports {
            transport.close();
        }
    }
}

/// TCP server for broker clients.
pub struct PacketServer {
    mode: ServerMode,
    local_address: SocketAddr,
    table: Arc<ConnectionTable>,
    shutdown: Arc<AtomicBool>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
    multiplexer: Option<Arc<Multiplexer>>,
}

impl fmt::Debug for PacketServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketServer")
            .field("mode", &self.mode)
            .field("local_address", &self.local_address)
            .field("connections", &self.table.connections.len())
            .finish()
    }
}

impl PacketServer {
    /// Bind `network.bind_address` and start accepting clients.
    ///
    /// # Errors
    /// Returns [`TransportError::Io`] if the address cannot be bound, or the
    /// multiplexer's start error.
    pub fn bind(network: &NetworkConfig, settings: &TransportSettings, broker: Arc<Broker>) -> TransportResult<Self> {
        if network.max_connections == 0 {
            return Err(TransportError::InvalidState { message: "maximum connections must be greater than 0".into() });
        }
        let listener = TcpListener::bind(network.bind_address).map_err(|e| TransportError::io("bind", e))?;
        let local_address = listener.local_addr().map_err(|e| TransportError::io("local address", e))?;
        let table = Arc::new(ConnectionTable {
            broker,
            connections: DashMap::new(),
            max_connections: network.max_connections,
        });
        let shutdown = Arc::new(AtomicBool::new(false));
        let mode = ServerMode::from_settings(settings);

        let mut server =
            Self { mode, local_address, table, shutdown, acceptor: Mutex::new(None), multiplexer: None };
        match mode {
            ServerMode::Blocking => {
                listener.set_nonblocking(true).map_err(|e| TransportError::io("set non-blocking", e))?;
                let table = Arc::clone(&server.table);
                let shutdown = Arc::clone(&server.shutdown);
                let settings = settings.clone();
                let handle = thread::Builder::new()
                    .name("vireo-acceptor".into())
                    .spawn(move || run_acceptor(&listener, &table, &settings, &shutdown))
                    .map_err(|e| TransportError::io("spawn acceptor", e))?;
                *server.acceptor.lock() = Some(handle);
            },
            ServerMode::Multiplexed => {
                let multiplexer = Multiplexer::start(settings.clone(), None)?;
                let table = Arc::clone(&server.table);
                multiplexer.accept(listener, Arc::new(move |transport| table.serve(Arc::new(transport))))?;
                server.multiplexer = Some(multiplexer);
            },
        }
        info!(
            address = %local_address,
            ?mode,
            max_connections = network.max_connections,
            "Packet server started"
        );
        Ok(server)
    }

    /// Address the server listens on.
    #[must_use]
    pub const fn local_address(&self) -> SocketAddr {
        self.local_address
    }

    /// How connections are driven.
    #[must_use]
    pub const fn mode(&self) -> ServerMode {
        self.mode
    }

    /// Clients currently connected.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.table.connections.len()
    }

    /// Stop accepting, close every client connection and wait for the I/O
    /// threads. Idempotent.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.acceptor.lock().take() {
            if handle.join().is_err() {
                error!("Acceptor thread panicked");
            }
        }
        self.table.close_all();
        if let Some(multiplexer) = &self.multiplexer {
            multiplexer.shutdown();
        }
        info!(address = %self.local_address, "Packet server stopped");
    }
}

impl Drop for PacketServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_acceptor(listener: &TcpListener, table: &Arc<ConnectionTable>, settings: &TransportSettings, shutdown: &AtomicBool) {
    while !shutdown.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, address)) => match BlockingTransport::from_stream(stream, settings) {
                Ok(transport) => {
                    debug!(%address, transport = %transport.id(), "Accepted connection");
                    table.serve(Arc::new(transport));
                },
                Err(e) => warn!(%address, error = %e, "Cannot set up accepted connection"),
            },
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                error!(error = %e, "Error accepting connection");
                // Brief delay to prevent tight error loop
                thread::sleep(ACCEPT_BACKOFF);
            },
        }
    }
    debug!("Acceptor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream;
    use tempfile::TempDir;
    use vireo_core::DestinationDescriptor;

    fn broker(dir: &TempDir) -> Arc<Broker> {
        let descriptor = DestinationDescriptor {
            block_size: 64,
            initial_block_count: 8,
            ..DestinationDescriptor::new("q", dir.path().join("q"))
        };
        Arc::new(Broker::with_destinations([descriptor]).unwrap())
    }

    fn network(max_connections: usize) -> NetworkConfig {
        NetworkConfig { bind_address: "127.0.0.1:0".parse().unwrap(), max_connections }
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_mode_from_settings() {
        let mut settings = TransportSettings::default();
        settings.use_multiplexer = false;
        assert_eq!(ServerMode::from_settings(&settings), ServerMode::Blocking);
        settings.use_multiplexer = true;
        assert_eq!(ServerMode::from_settings(&settings), ServerMode::Multiplexed);
    }

    #[test]
    fn test_zero_connections_rejected() {
        let dir = TempDir::new().unwrap();
        let err = PacketServer::bind(&network(0), &TransportSettings::default(), broker(&dir)).unwrap_err();
        assert!(matches!(err, TransportError::InvalidState { .. }));
    }

    #[test]
    fn test_blocking_server_tracks_connections() {
        let dir = TempDir::new().unwrap();
        let settings = TransportSettings { use_multiplexer: false, ..TransportSettings::default() };
        let server = PacketServer::bind(&network(4), &settings, broker(&dir)).unwrap();
        assert_eq!(server.mode(), ServerMode::Blocking);

        let client = TcpStream::connect(server.local_address()).unwrap();
        assert!(wait_for(|| server.connection_count() == 1));
        drop(client);
        assert!(wait_for(|| server.connection_count() == 0));
        server.shutdown();
    }

    #[test]
    fn test_connections_over_limit_are_closed() {
        let dir = TempDir::new().unwrap();
        let settings = TransportSettings { use_multiplexer: true, ..TransportSettings::default() };
        let server = PacketServer::bind(&network(1), &settings, broker(&dir)).unwrap();

        let _first = TcpStream::connect(server.local_address()).unwrap();
        assert!(wait_for(|| server.connection_count() == 1));
        let _second = TcpStream::connect(server.local_address()).unwrap();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(server.connection_count(), 1);
        server.shutdown();
        assert_eq!(server.connection_count(), 0);
    }
}
