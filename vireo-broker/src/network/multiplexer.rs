//! Many connections served by one selector thread.
//!
//! The thread runs a current-thread tokio runtime. Every connection is a
//! state machine (`Connecting -> Established -> Closing -> Closed`) with a
//! bounded input window and output window. On each wake-up the connection
//! derives the readiness it waits for from its state and buffer occupancy
//! alone, then waits for that readiness or for a local event (packet
//! queued, close requested). A failing socket drops only its own
//! connection.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use dashmap::DashMap;
use parking_lot::Mutex;
use socket2::SockRef;
use tokio::io::Interest;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, error, info, trace, warn};
use vireo_core::protocol::queries::PingQuery;
use vireo_core::protocol::{Packet, PacketDecoder, PacketEncoder};
use vireo_core::{ActivityWatchdog, Clock, SystemClock, TransportSettings};

use crate::error::{TransportError, TransportResult};
use crate::network::configure_socket;
use crate::network::connection::{LinkActivity, TransportId, TransportMetrics, TransportState, TransportStats};
use crate::network::keepalive::{KeepAliveLink, KeepAliveRegistration};
use crate::network::transport::{PacketTransport, PacketTransportListener};

const MIN_WINDOW: usize = 1024;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Socket level state of a multiplexed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// TCP handshake in progress
    Connecting,
    /// Exchanging frames
    Established,
    /// Close requested, socket still registered
    Closing,
    /// Socket released
    Closed,
}

/// Readiness a connection waits for on one selector iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InterestSet {
    /// Handshake completion
    pub connect: bool,
    /// Bytes to read
    pub read: bool,
    /// Room to write
    pub write: bool,
}

impl InterestSet {
    /// Derive the interest of a connection.
    ///
    /// Read interest only while the input window has room, write interest
    /// only while output is pending, connect interest only mid-handshake.
    #[must_use]
    pub const fn compute(state: LinkState, input_room: usize, output_pending: bool) -> Self {
        match state {
            LinkState::Connecting => Self { connect: true, read: false, write: false },
            LinkState::Established => Self { connect: false, read: input_room > 0, write: output_pending },
            LinkState::Closing | LinkState::Closed => Self { connect: false, read: false, write: false },
        }
    }

    /// Whether nothing is of interest.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        !(self.connect || self.read || self.write)
    }

    fn readiness(self) -> Option<Interest> {
        match (self.read, self.write || self.connect) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

/// Selector thread owning a set of multiplexed connections.
pub struct Multiplexer {
    runtime: Handle,
    settings: TransportSettings,
    watchdog: Option<Arc<ActivityWatchdog>>,
    connections: DashMap<TransportId, Arc<MuxConnection>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    acceptors: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    shutdown: Mutex<Option<oneshot::Sender<Vec<tokio::task::JoinHandle<()>>>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multiplexer").field("connections", &self.connections.len()).finish_non_exhaustive()
    }
}

impl Multiplexer {
    /// Start the selector thread.
    ///
    /// Client connections opened through [`connect`](Self::connect) are kept
    /// alive through `watchdog` when the ping interval is non-zero.
    ///
    /// # Errors
    /// Returns an error if the thread or its runtime cannot be created.
    pub fn start(settings: TransportSettings, watchdog: Option<Arc<ActivityWatchdog>>) -> TransportResult<Arc<Self>> {
        let (handle_tx, handle_rx) = crossbeam::channel::bounded(1);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<Vec<tokio::task::JoinHandle<()>>>();
        let thread = thread::Builder::new()
            .name("vireo-multiplexer".to_owned())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = handle_tx.send(Err(e));
                        return;
                    },
                };
                let _ = handle_tx.send(Ok(runtime.handle().clone()));
                runtime.block_on(async move {
                    if let Ok(tasks) = shutdown_rx.await {
                        futures::future::join_all(tasks).await;
                    }
                });
                trace!("Selector thread exiting");
            })
            .map_err(|e| TransportError::Internal { message: format!("cannot spawn selector thread: {e}") })?;

        let runtime = handle_rx
            .recv()
            .map_err(|_| TransportError::Internal { message: "selector thread died during startup".into() })?
            .map_err(|e| TransportError::Internal { message: format!("cannot build selector runtime: {e}") })?;

        info!("Multiplexer started");
        Ok(Arc::new(Self {
            runtime,
            settings,
            watchdog,
            connections: DashMap::new(),
            tasks: Mutex::new(Vec::new()),
            acceptors: Mutex::new(Vec::new()),
            shutdown: Mutex::new(Some(shutdown_tx)),
            thread: Mutex::new(Some(thread)),
        }))
    }

    /// Transport settings applied to every connection.
    #[must_use]
    pub const fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    /// Registered connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Open a client connection. The handshake runs on the selector thread
    /// once the transport is started, bounded by the connect timeout.
    #[must_use]
    pub fn connect(self: &Arc<Self>, address: SocketAddr) -> MultiplexedTransport {
        self.register(PendingIo::Connect(address), self.watchdog.clone())
    }

    /// Adopt an accepted socket.
    ///
    /// # Errors
    /// Returns an I/O error if the socket cannot be switched to non-blocking
    /// mode or registered with the runtime.
    pub fn adopt(self: &Arc<Self>, stream: std::net::TcpStream) -> TransportResult<MultiplexedTransport> {
        stream.set_nonblocking(true).map_err(|e| TransportError::io("set non-blocking", e))?;
        let _guard = self.runtime.enter();
        let stream = TcpStream::from_std(stream).map_err(|e| TransportError::io("register socket", e))?;
        self.adopt_async(stream)
    }

    fn adopt_async(self: &Arc<Self>, stream: TcpStream) -> TransportResult<MultiplexedTransport> {
        configure_socket(SockRef::from(&stream), &self.settings)?;
        let transport = self.register(PendingIo::Accepted(stream), None);
        Ok(transport)
    }

    fn register(self: &Arc<Self>, io: PendingIo, watchdog: Option<Arc<ActivityWatchdog>>) -> MultiplexedTransport {
        let clock: Arc<dyn Clock> = watchdog.as_ref().map_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>, |w| w.clock());
        let remote = match &io {
            PendingIo::Connect(address) => Some(*address),
            PendingIo::Accepted(stream) => stream.peer_addr().ok(),
        };
        let link = match &io {
            PendingIo::Connect(_) => LinkState::Connecting,
            PendingIo::Accepted(_) => LinkState::Established,
        };
        let conn = Arc::new(MuxConnection {
            id: TransportId::new(),
            settings: self.settings.clone(),
            remote: Mutex::new(remote),
            state: Mutex::new(TransportState::Created),
            link: Mutex::new(link),
            queue: Mutex::new(VecDeque::new()),
            wakeup: Notify::new(),
            close_request: Mutex::new(None),
            listener: Mutex::new(None),
            pending: Mutex::new(Some(io)),
            activity: Arc::new(LinkActivity::new(clock)),
            watchdog,
            keepalive: Mutex::new(None),
            metrics: TransportMetrics::default(),
            multiplexer: Arc::downgrade(self),
        });
        self.connections.insert(conn.id, Arc::clone(&conn));
        MultiplexedTransport { conn }
    }

    /// Accept connections from `listener` on the selector thread, handing
    /// each new transport to `on_accept` unstarted.
    ///
    /// # Errors
    /// Returns an I/O error if the listener cannot be registered.
    pub fn accept(
        self: &Arc<Self>,
        listener: std::net::TcpListener,
        on_accept: Arc<dyn Fn(MultiplexedTransport) + Send + Sync>,
    ) -> TransportResult<()> {
        listener.set_nonblocking(true).map_err(|e| TransportError::io("set non-blocking", e))?;
        let listener = {
            let _guard = self.runtime.enter();
            TcpListener::from_std(listener).map_err(|e| TransportError::io("register listener", e))?
        };
        let multiplexer = Arc::downgrade(self);
        let task = self.runtime.spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, address)) => {
                        let Some(multiplexer) = multiplexer.upgrade() else { break };
                        match multiplexer.adopt_async(stream) {
                            Ok(transport) => {
                                debug!(%address, transport = %transport.id(), "Accepted multiplexed connection");
                                on_accept(transport);
                            },
                            Err(e) => warn!(%address, error = %e, "Cannot adopt accepted connection"),
                        }
                    },
                    Err(e) => {
                        error!(error = %e, "Error accepting connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    },
                }
            }
        });
        self.acceptors.lock().push(task);
        Ok(())
    }

    fn spawn_connection(&self, conn: Arc<MuxConnection>, io: PendingIo) {
        let task = self.runtime.spawn(conn.drive(io));
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    /// Close every connection, stop accepting and stop the selector thread.
    pub fn shutdown(&self) {
        let Some(shutdown) = self.shutdown.lock().take() else {
            return;
        };
        for task in self.acceptors.lock().drain(..) {
            task.abort();
        }
        let connections: Vec<Arc<MuxConnection>> = self.connections.iter().map(|e| Arc::clone(e.value())).collect();
        for conn in connections {
            conn.request_close(false);
        }
        let tasks = std::mem::take(&mut *self.tasks.lock());
        let _ = shutdown.send(tasks);

        if let Some(handle) = self.thread.lock().take() {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!("Selector thread panicked");
            }
        }
        info!("Multiplexer stopped");
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

enum PendingIo {
    Connect(SocketAddr),
    Accepted(TcpStream),
}

struct MuxConnection {
    id: TransportId,
    settings: TransportSettings,
    remote: Mutex<Option<SocketAddr>>,
    state: Mutex<TransportState>,
    link: Mutex<LinkState>,
    queue: Mutex<VecDeque<Packet>>,
    wakeup: Notify,
    /// `Some(link_failed)` once a close was requested
    close_request: Mutex<Option<bool>>,
    listener: Mutex<Option<Arc<dyn PacketTransportListener>>>,
    pending: Mutex<Option<PendingIo>>,
    activity: Arc<LinkActivity>,
    watchdog: Option<Arc<ActivityWatchdog>>,
    keepalive: Mutex<Option<KeepAliveRegistration>>,
    metrics: TransportMetrics,
    multiplexer: Weak<Multiplexer>,
}

impl MuxConnection {
    fn enqueue(&self, packet: Packet) -> TransportResult<()> {
        if !self.state.lock().is_open() {
            return Err(TransportError::closed(self.id));
        }
        let mut queue = self.queue.lock();
        if queue.len() >= self.settings.send_queue_max_size {
            self.metrics.record_over_limit();
        }
        queue.push_back(packet);
        drop(queue);
        self.wakeup.notify_one();
        Ok(())
    }

    fn listener(&self) -> Option<Arc<dyn PacketTransportListener>> {
        self.listener.lock().clone()
    }

    fn close_requested(&self) -> bool {
        self.close_request.lock().is_some()
    }

    fn request_close(&self, link_failed: bool) {
        let mut state = self.state.lock();
        match *state {
            TransportState::Created => {
                *state = TransportState::Closing;
                drop(state);
                self.finish(link_failed);
            },
            TransportState::Started => {
                *state = TransportState::Closing;
                drop(state);
                *self.link.lock() = LinkState::Closing;
                *self.close_request.lock() = Some(link_failed);
                self.wakeup.notify_one();
            },
            TransportState::Closing | TransportState::Closed => {},
        }
    }

    async fn drive(self: Arc<Self>, io: PendingIo) {
        let link_failed = match self.run(io).await {
            Ok(()) => self.close_request.lock().unwrap_or(false),
            Err(e) => {
                warn!(transport = %self.id, error = %e, "Dropping multiplexed connection");
                true
            },
        };
        self.finish(link_failed);
    }

    async fn run(&self, io: PendingIo) -> TransportResult<()> {
        let stream = match io {
            PendingIo::Accepted(stream) => stream,
            PendingIo::Connect(address) => self.connect(address).await?,
        };
        {
            let mut link = self.link.lock();
            if *link == LinkState::Connecting {
                *link = LinkState::Established;
            }
        }
        if self.close_requested() {
            return Ok(());
        }

        let window = self.settings.stream_recv_buffer_size.max(MIN_WINDOW);
        let out_window = self.settings.stream_send_buffer_size.max(MIN_WINDOW);
        let mut input = BytesMut::with_capacity(window);
        let mut output = BytesMut::with_capacity(out_window);
        let mut decoder = PacketDecoder::new(self.settings.max_untrusted_packet_size);
        let mut encoder = PacketEncoder::with_max_packet_size(self.settings.max_packet_size);
        let mut in_flight: Option<Packet> = None;

        loop {
            if self.close_requested() {
                return Ok(());
            }
            self.fill_output(&mut encoder, &mut output, out_window, &mut in_flight)?;

            // A frame must fit the input window entirely before it is decoded.
            let capacity = decoder.expected_size().map_or(window, |size| window.max(size));
            let interest =
                InterestSet::compute(*self.link.lock(), capacity.saturating_sub(input.len()), !output.is_empty());
            let Some(readiness) = interest.readiness() else {
                self.wakeup.notified().await;
                continue;
            };

            tokio::select! {
                ready = stream.ready(readiness) => {
                    let ready = ready.map_err(|e| TransportError::io("poll", e))?;
                    if ready.is_readable() && self.read_input(&stream, &mut input, capacity)? {
                        self.decode_input(&mut decoder, &mut input)?;
                    }
                    if ready.is_writable() && !output.is_empty() {
                        self.write_output(&stream, &mut output)?;
                    }
                }
                () = self.wakeup.notified() => {}
            }
        }
    }

    async fn connect(&self, address: SocketAddr) -> TransportResult<TcpStream> {
        let timeout = self.settings.connect_timeout();
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(TransportError::io("connect", e)),
            Err(_) => {
                return Err(TransportError::Timeout {
                    operation: format!("connect to {address}"),
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                })
            },
        };
        configure_socket(SockRef::from(&stream), &self.settings)?;
        *self.remote.lock() = stream.peer_addr().ok();
        debug!(transport = %self.id, %address, "Connected");
        Ok(stream)
    }

    /// Move queued packets into the output window. The next packet is pulled
    /// only once the previous frame is entirely in the window.
    fn fill_output(
        &self,
        encoder: &mut PacketEncoder,
        output: &mut BytesMut,
        capacity: usize,
        in_flight: &mut Option<Packet>,
    ) -> TransportResult<()> {
        loop {
            if !encoder.has_pending() {
                if let Some(packet) = in_flight.take() {
                    self.on_sent(&packet);
                }
                let Some(packet) = self.queue.lock().pop_front() else {
                    return Ok(());
                };
                encoder.load(&packet)?;
                *in_flight = Some(packet);
            }
            if encoder.fill(output, capacity) == 0 {
                return Ok(());
            }
        }
    }

    fn on_sent(&self, packet: &Packet) {
        self.metrics.packet_sent();
        if packet.is_response_expected() {
            self.activity.request_sent();
        }
        if let Some(listener) = self.listener() {
            listener.packet_sent(packet);
        }
    }

    /// Returns whether bytes were read.
    fn read_input(&self, stream: &TcpStream, input: &mut BytesMut, capacity: usize) -> TransportResult<bool> {
        let room = capacity.saturating_sub(input.len());
        input.reserve(room);
        let mut window = (&mut *input).limit(room);
        match stream.try_read_buf(&mut window) {
            Ok(0) => Err(TransportError::io("read", io::Error::from(io::ErrorKind::UnexpectedEof))),
            Ok(count) => {
                self.metrics.bytes_received(count);
                Ok(true)
            },
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(TransportError::io("read", e)),
        }
    }

    fn decode_input(&self, decoder: &mut PacketDecoder, input: &mut BytesMut) -> TransportResult<()> {
        while let Some(packet) = decoder.decode(input)? {
            self.metrics.packet_received();
            self.activity.packet_received();
            let Some(listener) = self.listener() else {
                return Ok(());
            };
            let untrusted = decoder.max_packet_size() < self.settings.max_packet_size;
            if listener.packet_received(packet) && untrusted {
                debug!(transport = %self.id, "Peer trusted, raising packet size limit");
                decoder.set_max_packet_size(self.settings.max_packet_size);
            }
            if self.close_requested() {
                break;
            }
        }
        Ok(())
    }

    fn write_output(&self, stream: &TcpStream, output: &mut BytesMut) -> TransportResult<()> {
        match stream.try_write(&output[..]) {
            Ok(0) => Err(TransportError::io("write", io::Error::from(io::ErrorKind::WriteZero))),
            Ok(count) => {
                output.advance(count);
                self.metrics.bytes_sent(count);
                Ok(())
            },
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(TransportError::io("write", e)),
        }
    }

    fn finish(&self, link_failed: bool) {
        *self.state.lock() = TransportState::Closed;
        *self.link.lock() = LinkState::Closed;
        self.pending.lock().take();
        self.keepalive.lock().take();
        self.queue.lock().clear();
        if let Some(multiplexer) = self.multiplexer.upgrade() {
            multiplexer.connections.remove(&self.id);
        }
        let listener = self.listener.lock().take();
        info!(transport = %self.id, link_failed, "Multiplexed transport closed");
        if let Some(listener) = listener {
            listener.transport_closed(link_failed);
        }
    }
}

impl KeepAliveLink for MuxConnection {
    fn link_name(&self) -> String {
        self.id.to_string()
    }

    fn send_ping(&self) -> TransportResult<()> {
        self.enqueue(Packet::new(PingQuery))?;
        self.metrics.record_ping();
        Ok(())
    }

    fn fail_link(&self, reason: &str) {
        warn!(transport = %self.id, %reason, "Link failed");
        self.request_close(true);
    }
}

/// Handle of one connection served by a [`Multiplexer`].
#[derive(Clone)]
pub struct MultiplexedTransport {
    conn: Arc<MuxConnection>,
}

impl MultiplexedTransport {
    /// Socket level state.
    #[must_use]
    pub fn link_state(&self) -> LinkState {
        *self.conn.link.lock()
    }
}

impl fmt::Debug for MultiplexedTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiplexedTransport")
            .field("id", &self.conn.id)
            .field("link", &*self.conn.link.lock())
            .finish_non_exhaustive()
    }
}

impl PacketTransport for MultiplexedTransport {
    fn id(&self) -> TransportId {
        self.conn.id
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        *self.conn.remote.lock()
    }

    fn start(&self, listener: Arc<dyn PacketTransportListener>) -> TransportResult<()> {
        {
            let mut state = self.conn.state.lock();
            if *state != TransportState::Created {
                return Err(TransportError::InvalidState { message: format!("cannot start a {state} transport") });
            }
            *state = TransportState::Started;
        }
        let Some(multiplexer) = self.conn.multiplexer.upgrade() else {
            self.conn.request_close(true);
            return Err(TransportError::closed(self.conn.id));
        };
        let Some(io) = self.conn.pending.lock().take() else {
            return Err(TransportError::InvalidState { message: "socket already released".into() });
        };
        *self.conn.listener.lock() = Some(listener);

        if let (Some(watchdog), Some(interval)) = (&self.conn.watchdog, self.conn.settings.ping_interval()) {
            let conn: Arc<dyn KeepAliveLink> = self.conn.clone();
            let link: Weak<dyn KeepAliveLink> = Arc::downgrade(&conn);
            let registration =
                KeepAliveRegistration::register(watchdog, link, Arc::clone(&self.conn.activity), interval);
            *self.conn.keepalive.lock() = Some(registration);
        }
        multiplexer.spawn_connection(Arc::clone(&self.conn), io);
        Ok(())
    }

    fn send(&self, packet: Packet) -> TransportResult<()> {
        self.conn.enqueue(packet)
    }

    fn needs_throttling(&self) -> bool {
        self.conn.queue.lock().len() >= self.conn.settings.send_queue_max_size
    }

    fn close(&self) {
        self.conn.request_close(false);
    }

    fn fail(&self, reason: &str) {
        self.conn.fail_link(reason);
    }

    fn state(&self) -> TransportState {
        *self.conn.state.lock()
    }

    fn stats(&self) -> TransportStats {
        self.conn.metrics.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interest_follows_state_and_buffers() {
        let connecting = InterestSet::compute(LinkState::Connecting, 100, true);
        assert_eq!(connecting, InterestSet { connect: true, read: false, write: false });

        let idle = InterestSet::compute(LinkState::Established, 100, false);
        assert_eq!(idle, InterestSet { connect: false, read: true, write: false });

        let full_input = InterestSet::compute(LinkState::Established, 0, true);
        assert_eq!(full_input, InterestSet { connect: false, read: false, write: true });

        assert!(InterestSet::compute(LinkState::Established, 0, false).is_empty());
        assert!(InterestSet::compute(LinkState::Closing, 100, true).is_empty());
    }

    #[test]
    fn test_readiness_mapping() {
        assert_eq!(InterestSet::compute(LinkState::Established, 1, true).readiness(), Some(Interest::READABLE | Interest::WRITABLE));
        assert_eq!(InterestSet::compute(LinkState::Established, 0, false).readiness(), None);
    }

    #[test]
    fn test_unstarted_connection_closes_immediately() {
        let multiplexer = Multiplexer::start(TransportSettings::default(), None).unwrap();
        let transport = multiplexer.connect(SocketAddr::from(([127, 0, 0, 1], 9)));
        assert_eq!(multiplexer.connection_count(), 1);
        transport.close();
        assert_eq!(transport.state(), TransportState::Closed);
        assert_eq!(transport.link_state(), LinkState::Closed);
        assert_eq!(multiplexer.connection_count(), 0);
        multiplexer.shutdown();
    }
}
