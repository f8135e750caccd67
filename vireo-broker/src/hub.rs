//! Request/response correlation over one transport.
//!
//! A [`TransportHub`] owns a transport and hands out [`TransportEndpoint`]s.
//! Every packet carries the id of the endpoint it belongs to and, for
//! requests, a correlation id chosen by that endpoint. Responses are routed
//! back to the waiting caller; notifications go to the endpoint's handler.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};
use vireo_core::protocol::{Packet, PacketKind};

use crate::error::{TransportError, TransportResult};
use crate::network::{PacketTransport, PacketTransportListener, TransportId};

/// Callback receiving the notifications addressed to one endpoint.
pub type NotificationHandler = Box<dyn Fn(Packet) + Send + Sync>;

type Reply = TransportResult<Packet>;

struct EndpointState {
    id: i32,
    next_correlation: AtomicI32,
    pending: DashMap<i32, Sender<Reply>>,
    notifications: Mutex<Option<NotificationHandler>>,
}

impl EndpointState {
    fn fail_pending(&self, transport: TransportId) {
        let correlations: Vec<i32> = self.pending.iter().map(|e| *e.key()).collect();
        for correlation in correlations {
            if let Some((_, waiter)) = self.pending.remove(&correlation) {
                let _ = waiter.send(Err(TransportError::closed(transport)));
            }
        }
    }
}

struct HubInner {
    transport: Arc<dyn PacketTransport>,
    endpoints: DashMap<i32, Arc<EndpointState>>,
    next_endpoint: AtomicI32,
    closed: AtomicBool,
}

impl HubInner {
    fn route_response(&self, packet: Packet) {
        let Some(endpoint) = self.endpoints.get(&packet.endpoint_id).map(|e| Arc::clone(e.value())) else {
            debug!(endpoint = packet.endpoint_id, "Response for unknown endpoint dropped");
            return;
        };
        match endpoint.pending.remove(&packet.correlation_id) {
            Some((_, waiter)) => {
                let _ = waiter.send(Ok(packet));
            },
            None => trace!(
                endpoint = packet.endpoint_id,
                correlation = packet.correlation_id,
                packet_type = packet.packet_type().name(),
                "Unsolicited response dropped"
            ),
        }
    }

    fn route_notification(&self, packet: Packet) {
        let Some(endpoint) = self.endpoints.get(&packet.endpoint_id).map(|e| Arc::clone(e.value())) else {
            debug!(endpoint = packet.endpoint_id, "Notification for unknown endpoint dropped");
            return;
        };
        let handler = endpoint.notifications.lock();
        match handler.as_ref() {
            Some(handler) => handler(packet),
            None => trace!(endpoint = endpoint.id, "Notification without handler dropped"),
        }
    }
}

impl PacketTransportListener for HubInner {
    fn packet_received(&self, packet: Packet) -> bool {
        let packet_type = packet.packet_type();
        if packet_type.is_response() {
            self.route_response(packet);
        } else if packet_type.is_notification() {
            self.route_notification(packet);
        } else {
            warn!(packet_type = packet_type.name(), "Client hub received a query, ignoring");
        }
        // The broker is trusted from its first packet on.
        true
    }

    fn transport_closed(&self, link_failed: bool) {
        self.closed.store(true, Ordering::Release);
        let transport = self.transport.id();
        debug!(%transport, link_failed, "Hub transport closed, failing pending requests");
        let endpoints: Vec<Arc<EndpointState>> = self.endpoints.iter().map(|e| Arc::clone(e.value())).collect();
        for endpoint in endpoints {
            endpoint.fail_pending(transport);
        }
    }
}

/// Owner of one transport, routing packets between it and endpoints.
#[derive(Clone)]
pub struct TransportHub {
    inner: Arc<HubInner>,
}

impl fmt::Debug for TransportHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportHub")
            .field("transport", &self.inner.transport)
            .field("endpoints", &self.inner.endpoints.len())
            .finish()
    }
}

impl TransportHub {
    /// Take ownership of an unstarted transport and start it.
    ///
    /// # Errors
    /// Returns the transport's start error.
    pub fn new(transport: Arc<dyn PacketTransport>) -> TransportResult<Self> {
        let inner = Arc::new(HubInner {
            transport,
            endpoints: DashMap::new(),
            next_endpoint: AtomicI32::new(1),
            closed: AtomicBool::new(false),
        });
        let listener: Arc<dyn PacketTransportListener> = inner.clone();
        inner.transport.start(listener)?;
        Ok(Self { inner })
    }

    /// Create a new endpoint with a fresh id.
    #[must_use]
    pub fn create_endpoint(&self) -> TransportEndpoint {
        let id = self.inner.next_endpoint.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(EndpointState {
            id,
            next_correlation: AtomicI32::new(1),
            pending: DashMap::new(),
            notifications: Mutex::new(None),
        });
        self.inner.endpoints.insert(id, Arc::clone(&state));
        TransportEndpoint { hub: Arc::clone(&self.inner), state }
    }

    /// Underlying transport.
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn PacketTransport> {
        &self.inner.transport
    }

    /// Live endpoints.
    #[must_use]
    pub fn endpoint_count(&self) -> usize {
        self.inner.endpoints.len()
    }

    /// Whether the transport has closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Close the transport. Pending requests fail with `TRANSPORT_CLOSED`.
    pub fn close(&self) {
        self.inner.transport.close();
    }
}

/// One logical channel multiplexed over a hub's transport.
pub struct TransportEndpoint {
    hub: Arc<HubInner>,
    state: Arc<EndpointState>,
}

impl fmt::Debug for TransportEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportEndpoint")
            .field("id", &self.state.id)
            .field("pending", &self.state.pending.len())
            .finish()
    }
}

impl TransportEndpoint {
    /// Endpoint id carried by every packet of this endpoint.
    #[must_use]
    pub fn id(&self) -> i32 {
        self.state.id
    }

    /// Send a query and wait at most `timeout` for its response.
    ///
    /// # Errors
    /// - [`TransportError::Remote`] if the peer answered with an `ErrorResponse`
    /// - [`TransportError::Timeout`] if no response arrived in time
    /// - [`TransportError::Closed`] if the transport closed first
    pub fn blocking_request(&self, query: impl Into<PacketKind>, timeout: Duration) -> TransportResult<Packet> {
        let transport = self.hub.transport.id();
        if self.hub.closed.load(Ordering::Acquire) {
            return Err(TransportError::closed(transport));
        }
        let correlation = self.state.next_correlation.fetch_add(1, Ordering::Relaxed);
        let packet = Packet::with_routing(self.state.id, correlation, query);
        let operation = packet.packet_type().name();

        let (waiter, reply) = channel::bounded(1);
        self.state.pending.insert(correlation, waiter);
        // Closed between the check above and the registration.
        if self.hub.closed.load(Ordering::Acquire) {
            self.state.pending.remove(&correlation);
            return Err(TransportError::closed(transport));
        }
        if let Err(e) = self.hub.transport.send(packet) {
            self.state.pending.remove(&correlation);
            return Err(e);
        }

        match reply.recv_timeout(timeout) {
            Ok(Ok(response)) => match response.kind {
                PacketKind::ErrorResponse(error) => Err(TransportError::Remote { code: error.code, message: error.message }),
                _ => Ok(response),
            },
            Ok(Err(e)) => Err(e),
            Err(RecvTimeoutError::Timeout) => {
                self.state.pending.remove(&correlation);
                Err(TransportError::Timeout {
                    operation: operation.to_owned(),
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                })
            },
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::closed(transport)),
        }
    }

    /// Send a packet without waiting for anything.
    ///
    /// # Errors
    /// Returns [`TransportError::Closed`] if the transport is closed.
    pub fn send_async(&self, packet: impl Into<PacketKind>) -> TransportResult<()> {
        self.hub.transport.send(Packet::with_routing(self.state.id, 0, packet))
    }

    /// Install the handler receiving this endpoint's notifications.
    pub fn set_notification_handler(&self, handler: impl Fn(Packet) + Send + Sync + 'static) {
        *self.state.notifications.lock() = Some(Box::new(handler));
    }

    /// Requests still waiting for a response.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.state.pending.len()
    }
}

impl Drop for TransportEndpoint {
    fn drop(&mut self) {
        self.hub.endpoints.remove(&self.state.id);
    }
}
