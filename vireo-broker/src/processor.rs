//! Server side handling of one client connection.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};
use vireo_core::protocol::responses::{
    AcknowledgeResponse, BrowserFetchResponse, CloseBrowserResponse, CloseSessionResponse, CommitResponse,
    CreateBrowserResponse, CreateSessionResponse, ErrorResponse, GetResponse, OpenConnectionResponse, PingResponse,
    PutResponse, QueueSizeResponse, RollbackResponse,
};
use vireo_core::protocol::{Packet, PacketKind};

use crate::broker::Broker;
use crate::error::{BrokerError, BrokerResult, TransportResult};
use crate::network::{PacketTransport, PacketTransportListener, TransportId};
use crate::session::Session;

/// Hook run once the connection is gone.
pub type CloseHook = Box<dyn Fn(TransportId) + Send + Sync>;

/// Executes the queries of one client against the broker.
///
/// Packets of one transport arrive one at a time, so a processor never runs
/// two queries concurrently; the session table lock is only contended by
/// `transport_closed`.
pub struct ClientProcessor {
    broker: Arc<Broker>,
    transport: Arc<dyn PacketTransport>,
    sessions: Mutex<HashMap<i32, Session>>,
    opened: AtomicBool,
    on_closed: Mutex<Option<CloseHook>>,
}

impl fmt::Debug for ClientProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientProcessor")
            .field("transport", &self.transport.id())
            .field("sessions", &self.sessions.lock().len())
            .field("opened", &self.opened.load(Ordering::Relaxed))
            .finish()
    }
}

impl ClientProcessor {
    /// Processor serving `transport`, which must not be started yet.
    #[must_use]
    pub fn new(broker: Arc<Broker>, transport: Arc<dyn PacketTransport>) -> Arc<Self> {
        Arc::new(Self {
            broker,
            transport,
            sessions: Mutex::new(HashMap::new()),
            opened: AtomicBool::new(false),
            on_closed: Mutex::new(None),
        })
    }

    /// Run `hook` once the transport has closed.
    pub fn on_closed(&self, hook: impl Fn(TransportId) + Send + Sync + 'static) {
        *self.on_closed.lock() = Some(Box::new(hook));
    }

    /// Start the transport with this processor as its listener.
    ///
    /// # Errors
    /// Returns the transport's start error.
    pub fn start(self: &Arc<Self>) -> TransportResult<()> {
        self.broker.connection_opened();
        let listener: Arc<dyn PacketTransportListener> = self.clone();
        let started = self.transport.start(listener);
        if started.is_err() {
            self.broker.connection_closed();
        }
        started
    }

    /// Sessions currently open.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    fn with_session<T>(&self, session_id: i32, f: impl FnOnce(&mut Session) -> BrokerResult<T>) -> BrokerResult<T> {
        let mut sessions = self.sessions.lock();
        let session = sessions.get_mut(&session_id).ok_or(BrokerError::UnknownSession { session_id })?;
        f(session)
    }

    fn handle(&self, packet: &Packet) -> BrokerResult<Option<PacketKind>> {
        let broker = &*self.broker;
        let opened = self.opened.load(Ordering::Acquire);
        let response: PacketKind = match &packet.kind {
            PacketKind::OpenConnectionQuery(query) => {
                if opened {
                    return Err(BrokerError::invalid_state("connection already opened"));
                }
                self.opened.store(true, Ordering::Release);
                info!(
                    transport = %self.transport.id(),
                    client = query.client_id.as_deref().unwrap_or("-"),
                    user = query.user_name.as_deref().unwrap_or("-"),
                    "Client connected"
                );
                OpenConnectionResponse::default().into()
            },
            PacketKind::PingQuery(_) => PingResponse.into(),
            _ if !opened => return Err(BrokerError::invalid_state("connection not opened")),
            PacketKind::CreateSessionQuery(query) => {
                let mut sessions = self.sessions.lock();
                if sessions.contains_key(&query.session_id) {
                    return Err(BrokerError::invalid_state(format!("session {} already exists", query.session_id)));
                }
                sessions.insert(query.session_id, Session::new(query.session_id, query.transacted, query.acknowledge_mode));
                broker.session_opened();
                debug!(session = query.session_id, transacted = query.transacted, "Session created");
                CreateSessionResponse.into()
            },
            PacketKind::CloseSessionQuery(query) => {
                let mut session = self
                    .sessions
                    .lock()
                    .remove(&query.session_id)
                    .ok_or(BrokerError::UnknownSession { session_id: query.session_id })?;
                broker.session_closed();
                session.close(broker)?;
                CloseSessionResponse.into()
            },
            PacketKind::PutQuery(query) => {
                self.with_session(query.session_id, |s| s.put(broker, query.message.clone()))?;
                PutResponse.into()
            },
            PacketKind::GetQuery(query) => {
                let message = self.with_session(query.session_id, |s| s.get(broker, &query.destination))?;
                GetResponse { message }.into()
            },
            PacketKind::AcknowledgeQuery(query) => {
                self.with_session(query.session_id, |s| s.acknowledge(broker, &query.destination, &query.message_ids))?;
                AcknowledgeResponse.into()
            },
            PacketKind::CommitQuery(query) => {
                self.with_session(query.session_id, |s| s.commit(broker))?;
                CommitResponse.into()
            },
            PacketKind::RollbackQuery(query) => {
                self.with_session(query.session_id, |s| s.rollback(broker))?;
                RollbackResponse.into()
            },
            PacketKind::RollbackMessageQuery(query) => {
                self.with_session(query.session_id, |s| {
                    s.rollback_message(broker, &query.destination, &query.message_id)
                })?;
                return Ok(None);
            },
            PacketKind::CreateBrowserQuery(query) => {
                self.with_session(query.session_id, |s| s.create_browser(broker, query.browser_id, &query.destination))?;
                CreateBrowserResponse.into()
            },
            PacketKind::BrowserFetchQuery(query) => {
                let message = self.with_session(query.session_id, |s| s.browser_fetch(query.browser_id))?;
                BrowserFetchResponse { message }.into()
            },
            PacketKind::CloseBrowserQuery(query) => {
                self.with_session(query.session_id, |s| s.close_browser(query.browser_id))?;
                CloseBrowserResponse.into()
            },
            PacketKind::QueueSizeQuery(query) => {
                let size = broker.queue_size(&query.destination)?;
                QueueSizeResponse { size: i32::try_from(size).unwrap_or(i32::MAX) }.into()
            },
            other => {
                warn!(packet_type = other.packet_type().name(), "Unexpected packet from client, ignoring");
                return Ok(None);
            },
        };
        Ok(Some(response))
    }
}

impl PacketTransportListener for ClientProcessor {
    fn packet_received(&self, packet: Packet) -> bool {
        trace!(
            transport = %self.transport.id(),
            packet_type = packet.packet_type().name(),
            endpoint = packet.endpoint_id,
            correlation = packet.correlation_id,
            "Processing packet"
        );
        let response = match self.handle(&packet) {
            Ok(Some(kind)) => packet.response(kind),
            Ok(None) => return self.opened.load(Ordering::Acquire),
            Err(e) if !packet.is_response_expected() => {
                warn!(packet_type = packet.packet_type().name(), error = %e, "Query failed");
                return self.opened.load(Ordering::Acquire);
            },
            Err(e) => {
                debug!(packet_type = packet.packet_type().name(), error = %e, "Query failed, reporting to client");
                packet.response(ErrorResponse::new(e.code(), e.to_string()))
            },
        };
        if let Err(e) = self.transport.send(response) {
            debug!(transport = %self.transport.id(), error = %e, "Cannot send response");
        }
        self.opened.load(Ordering::Acquire)
    }

    fn transport_closed(&self, link_failed: bool) {
        let sessions: Vec<Session> = self.sessions.lock().drain().map(|(_, s)| s).collect();
        let count = sessions.len();
        for mut session in sessions {
            self.broker.session_closed();
            if let Err(e) = session.close(&self.broker) {
                warn!(session = session.id(), error = %e, "Failed to roll back session on disconnect");
            }
        }
        self.broker.connection_closed();
        info!(transport = %self.transport.id(), link_failed, sessions = count, "Client disconnected");
        let hook = self.on_closed.lock().take();
        if let Some(hook) = hook {
            hook(self.transport.id());
        }
    }
}
