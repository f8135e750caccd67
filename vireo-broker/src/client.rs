//! Client side connection setup.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};
use vireo_core::protocol::queries::OpenConnectionQuery;
use vireo_core::protocol::PacketKind;
use vireo_core::{ActivityWatchdog, TransportSettings};

use crate::error::{TransportError, TransportResult};
use crate::hub::{TransportEndpoint, TransportHub};
use crate::network::{BlockingTransport, Multiplexer, PacketTransport};

/// Default bound on one request/response exchange.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Opens connections to a broker.
///
/// Connections use a [`Multiplexer`] when one is attached and a
/// [`BlockingTransport`] otherwise. With a watchdog attached they keep the
/// link alive with pings.
#[derive(Debug, Clone)]
pub struct Connector {
    settings: TransportSettings,
    watchdog: Option<Arc<ActivityWatchdog>>,
    multiplexer: Option<Arc<Multiplexer>>,
    credentials: OpenConnectionQuery,
    request_timeout: Duration,
}

impl Connector {
    /// Connector using `settings`, without keep-alive.
    #[must_use]
    pub fn new(settings: TransportSettings) -> Self {
        Self {
            settings,
            watchdog: None,
            multiplexer: None,
            credentials: OpenConnectionQuery::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Schedule keep-alive pings on `watchdog`.
    #[must_use]
    pub fn with_watchdog(mut self, watchdog: Arc<ActivityWatchdog>) -> Self {
        self.watchdog = Some(watchdog);
        self
    }

    /// Drive connections from `multiplexer`'s selector thread.
    #[must_use]
    pub fn with_multiplexer(mut self, multiplexer: Arc<Multiplexer>) -> Self {
        self.multiplexer = Some(multiplexer);
        self
    }

    /// Identify as `user_name` with `password`.
    #[must_use]
    pub fn with_credentials(mut self, user_name: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials.user_name = Some(user_name.into());
        self.credentials.password = Some(password.into());
        self
    }

    /// Announce `client_id` to the broker.
    #[must_use]
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.credentials.client_id = Some(client_id.into());
        self
    }

    /// Bound every handshake request by `timeout`.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Connect to `address` and open the connection.
    ///
    /// # Errors
    /// Returns the connect error, [`TransportError::Remote`] if the broker
    /// refused the connection, or [`TransportError::Timeout`].
    pub fn connect(&self, address: SocketAddr) -> TransportResult<ClientConnection> {
        let transport: Arc<dyn PacketTransport> = match &self.multiplexer {
            Some(multiplexer) => Arc::new(multiplexer.connect(address)),
            None => Arc::new(BlockingTransport::connect(address, &self.settings, self.watchdog.clone())?),
        };
        let hub = TransportHub::new(transport)?;
        match self.open(&hub) {
            Ok(protocol_version) => {
                info!(%address, protocol_version, "Connection opened");
                Ok(ClientConnection { hub, protocol_version })
            },
            Err(e) => {
                debug!(%address, error = %e, "Handshake failed");
                hub.close();
                Err(e)
            },
        }
    }

    fn open(&self, hub: &TransportHub) -> TransportResult<i32> {
        let endpoint = hub.create_endpoint();
        let response = endpoint.blocking_request(self.credentials.clone(), self.request_timeout)?;
        match response.kind {
            PacketKind::OpenConnectionResponse(response) => Ok(response.protocol_version),
            other => Err(TransportError::InvalidState {
                message: format!("unexpected {} to connection request", other.packet_type().name()),
            }),
        }
    }
}

/// An opened broker connection.
#[derive(Debug)]
pub struct ClientConnection {
    hub: TransportHub,
    protocol_version: i32,
}

impl ClientConnection {
    /// Protocol revision announced by the broker.
    #[must_use]
    pub const fn protocol_version(&self) -> i32 {
        self.protocol_version
    }

    /// Hub routing this connection's packets.
    #[must_use]
    pub const fn hub(&self) -> &TransportHub {
        &self.hub
    }

    /// New endpoint on this connection.
    #[must_use]
    pub fn create_endpoint(&self) -> TransportEndpoint {
        self.hub.create_endpoint()
    }

    /// Close the connection.
    pub fn close(&self) {
        self.hub.close();
    }
}
