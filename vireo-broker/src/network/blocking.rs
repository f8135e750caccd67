//! Thread-per-direction transport over a blocking TCP socket.
//!
//! The sender thread sleeps on a [`Semaphore`] until packets are queued, then
//! writes up to [`PIPELINE_DEPTH`] frames and flushes the buffered socket once
//! for the whole batch. The receiver thread reads one length-prefixed frame
//! at a time, enforcing the untrusted size limit until the listener reports
//! the peer as trusted.

use std::collections::VecDeque;
use std::fmt;
use std::io::{BufReader, BufWriter, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use socket2::SockRef;
use tracing::{debug, info, trace, warn};
use vireo_core::protocol::queries::PingQuery;
use vireo_core::protocol::{validate_frame_length, Packet, PacketSerializer, ProtocolError, FRAME_LENGTH_SIZE};
use vireo_core::{ActivityWatchdog, Clock, Semaphore, SystemClock, TransportSettings};

use crate::error::{TransportError, TransportResult};
use crate::network::configure_socket;
use crate::network::connection::{LinkActivity, TransportId, TransportMetrics, TransportState, TransportStats};
use crate::network::keepalive::{KeepAliveLink, KeepAliveRegistration};
use crate::network::transport::{PacketTransport, PacketTransportListener};

/// Frames written per flush.
pub const PIPELINE_DEPTH: usize = 16;

const MIN_STREAM_BUFFER: usize = 1024;

/// Blocking transport with dedicated sender and receiver threads.
#[derive(Debug, Clone)]
pub struct BlockingTransport {
    inner: Arc<Inner>,
}

struct Inner {
    id: TransportId,
    settings: TransportSettings,
    stream: TcpStream,
    remote: Option<SocketAddr>,
    state: Mutex<TransportState>,
    queue: Mutex<VecDeque<Packet>>,
    signal: Semaphore,
    stopping: AtomicBool,
    trusted: AtomicBool,
    listener: Mutex<Option<Arc<dyn PacketTransportListener>>>,
    activity: Arc<LinkActivity>,
    watchdog: Option<Arc<ActivityWatchdog>>,
    keepalive: Mutex<Option<KeepAliveRegistration>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    metrics: TransportMetrics,
}

impl fmt::Debug for Inner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockingTransport")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl BlockingTransport {
    /// Connect to `address` within the configured connect timeout.
    ///
    /// With a `watchdog` and a non-zero ping interval the transport keeps the
    /// link alive with pings once started.
    ///
    /// # Errors
    /// Returns [`TransportError::Timeout`] if the connect timed out, or an I/O
    /// error if it failed.
    pub fn connect(
        address: SocketAddr,
        settings: &TransportSettings,
        watchdog: Option<Arc<ActivityWatchdog>>,
    ) -> TransportResult<Self> {
        let timeout = settings.connect_timeout();
        let stream = TcpStream::connect_timeout(&address, timeout).map_err(|e| match e.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => TransportError::Timeout {
                operation: format!("connect to {address}"),
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            },
            _ => TransportError::io("connect", e),
        })?;
        debug!(%address, "Connected");
        Self::build(stream, settings, watchdog)
    }

    /// Wrap an accepted connection. Server side transports do not ping.
    ///
    /// # Errors
    /// Returns an I/O error if the socket cannot be configured.
    pub fn from_stream(stream: TcpStream, settings: &TransportSettings) -> TransportResult<Self> {
        Self::build(stream, settings, None)
    }

    fn build(
        stream: TcpStream,
        settings: &TransportSettings,
        watchdog: Option<Arc<ActivityWatchdog>>,
    ) -> TransportResult<Self> {
        stream.set_nonblocking(false).map_err(|e| TransportError::io("set blocking", e))?;
        configure_socket(SockRef::from(&stream), settings)?;
        let clock: Arc<dyn Clock> = watchdog.as_ref().map_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>, |w| w.clock());
        let inner = Inner {
            id: TransportId::new(),
            settings: settings.clone(),
            remote: stream.peer_addr().ok(),
            stream,
            state: Mutex::new(TransportState::Created),
            queue: Mutex::new(VecDeque::new()),
            signal: Semaphore::new(0),
            stopping: AtomicBool::new(false),
            trusted: AtomicBool::new(false),
            listener: Mutex::new(None),
            activity: Arc::new(LinkActivity::new(clock)),
            watchdog,
            keepalive: Mutex::new(None),
            threads: Mutex::new(Vec::with_capacity(2)),
            metrics: TransportMetrics::default(),
        };
        Ok(Self { inner: Arc::new(inner) })
    }

    /// Packets waiting for the sender thread.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.inner.queue.lock().len()
    }

    fn spawn(&self, role: &str, stream: TcpStream, run: fn(Arc<Inner>, TcpStream)) -> TransportResult<()> {
        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name(format!("vireo-{role}-{}", self.inner.id.short()))
            .spawn(move || run(inner, stream))
            .map_err(|e| TransportError::Internal { message: format!("cannot spawn {role} thread: {e}") })?;
        self.inner.threads.lock().push(handle);
        Ok(())
    }

    fn start_threads(&self) -> TransportResult<()> {
        let reader = self.inner.stream.try_clone().map_err(|e| TransportError::io("clone socket", e))?;
        let writer = self.inner.stream.try_clone().map_err(|e| TransportError::io("clone socket", e))?;
        self.spawn("tx", writer, Inner::run_sender)?;
        self.spawn("rx", reader, Inner::run_receiver)
    }
}

impl PacketTransport for BlockingTransport {
    fn id(&self) -> TransportId {
        self.inner.id
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        self.inner.remote
    }

    fn start(&self, listener: Arc<dyn PacketTransportListener>) -> TransportResult<()> {
        {
            let mut state = self.inner.state.lock();
            if *state != TransportState::Created {
                return Err(TransportError::InvalidState { message: format!("cannot start a {state} transport") });
            }
            *state = TransportState::Started;
        }
        *self.inner.listener.lock() = Some(listener);

        if let Err(e) = self.start_threads() {
            self.inner.shutdown(true);
            return Err(e);
        }

        if let (Some(watchdog), Some(interval)) = (&self.inner.watchdog, self.inner.settings.ping_interval()) {
            let inner: Arc<dyn KeepAliveLink> = self.inner.clone();
            let link: Weak<dyn KeepAliveLink> = Arc::downgrade(&inner);
            let registration =
                KeepAliveRegistration::register(watchdog, link, Arc::clone(&self.inner.activity), interval);
            *self.inner.keepalive.lock() = Some(registration);
        }
        info!(transport = %self.inner.id, remote = ?self.inner.remote, "Transport started");
        Ok(())
    }

    fn send(&self, packet: Packet) -> TransportResult<()> {
        self.inner.enqueue(packet)
    }

    fn needs_throttling(&self) -> bool {
        self.inner.queue.lock().len() >= self.inner.settings.send_queue_max_size
    }

    fn close(&self) {
        self.inner.shutdown(false);
    }

    fn fail(&self, reason: &str) {
        self.inner.fail_link(reason);
    }

    fn state(&self) -> TransportState {
        *self.inner.state.lock()
    }

    fn stats(&self) -> TransportStats {
        self.inner.metrics.stats()
    }
}

impl Inner {
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
        self.signal.release();
        Ok(())
    }

    fn listener(&self) -> Option<Arc<dyn PacketTransportListener>> {
        self.listener.lock().clone()
    }

    fn run_sender(self: Arc<Self>, stream: TcpStream) {
        let mut writer = BufWriter::with_capacity(self.settings.stream_send_buffer_size.max(MIN_STREAM_BUFFER), stream);
        let mut side = BytesMut::with_capacity(256);
        loop {
            self.signal.acquire();
            if self.stopping.load(Ordering::Acquire) {
                break;
            }
            let batch = self.next_batch();
            if batch.is_empty() {
                continue;
            }
            if let Err(e) = self.write_batch(&mut writer, &mut side, &batch) {
                if !self.stopping.load(Ordering::Acquire) {
                    self.fail_link(&format!("send failed: {e}"));
                }
                break;
            }
            let listener = self.listener();
            for packet in &batch {
                if packet.is_response_expected() {
                    self.activity.request_sent();
                }
                if let Some(listener) = &listener {
                    listener.packet_sent(packet);
                }
            }
        }
        trace!(transport = %self.id, "Sender thread exiting");
    }

    fn next_batch(&self) -> Vec<Packet> {
        let mut queue = self.queue.lock();
        let count = queue.len().min(PIPELINE_DEPTH);
        let batch: Vec<Packet> = queue.drain(..count).collect();
        drop(queue);
        // One permit was taken for the whole batch; consume the others.
        for _ in 1..batch.len() {
            if !self.signal.try_acquire() {
                break;
            }
        }
        batch
    }

    fn write_batch(
        &self,
        writer: &mut BufWriter<TcpStream>,
        side: &mut BytesMut,
        batch: &[Packet],
    ) -> TransportResult<()> {
        for packet in batch {
            side.clear();
            PacketSerializer::serialize(packet, side)?;
            let size = side.len();
            if size > self.settings.max_packet_size {
                return Err(ProtocolError::PacketTooLarge { actual: size, max: self.settings.max_packet_size }.into());
            }
            let length = i32::try_from(size).map_err(|_| ProtocolError::encoding("frame length overflow"))?;
            writer.write_all(&length.to_be_bytes()).map_err(|e| TransportError::io("write frame", e))?;
            writer.write_all(side).map_err(|e| TransportError::io("write frame", e))?;
            self.metrics.record_sent(FRAME_LENGTH_SIZE + size);
        }
        writer.flush().map_err(|e| TransportError::io("flush", e))
    }

    fn run_receiver(self: Arc<Self>, stream: TcpStream) {
        let mut reader = BufReader::with_capacity(self.settings.stream_recv_buffer_size.max(MIN_STREAM_BUFFER), stream);
        if let Err(e) = self.receive_loop(&mut reader) {
            if !self.stopping.load(Ordering::Acquire) {
                self.fail_link(&format!("receive failed: {e}"));
            }
        }
        trace!(transport = %self.id, "Receiver thread exiting");
    }

    fn receive_loop(&self, reader: &mut BufReader<TcpStream>) -> TransportResult<()> {
        let mut prefix = [0u8; FRAME_LENGTH_SIZE];
        loop {
            reader.read_exact(&mut prefix).map_err(|e| TransportError::io("read frame length", e))?;
            let max = if self.trusted.load(Ordering::Acquire) {
                self.settings.max_packet_size
            } else {
                self.settings.max_untrusted_packet_size
            };
            let size = validate_frame_length(i32::from_be_bytes(prefix), max)?;
            let mut body = vec![0u8; size];
            reader.read_exact(&mut body).map_err(|e| TransportError::io("read frame body", e))?;
            let packet = PacketSerializer::unserialize(Bytes::from(body))?;

            self.metrics.record_received(FRAME_LENGTH_SIZE + size);
            self.activity.packet_received();
            let Some(listener) = self.listener() else {
                return Ok(());
            };
            if listener.packet_received(packet) && !self.trusted.swap(true, Ordering::AcqRel) {
                debug!(transport = %self.id, "Peer trusted, raising packet size limit");
            }
        }
    }

    fn shutdown(&self, link_failed: bool) {
        {
            let mut state = self.state.lock();
            if !state.is_open() {
                return;
            }
            *state = TransportState::Closing;
        }
        self.stopping.store(true, Ordering::Release);
        self.signal.release();
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            if e.kind() != std::io::ErrorKind::NotConnected {
                warn!(transport = %self.id, error = %e, "Socket shutdown failed");
            }
        }
        self.keepalive.lock().take();

        let current = thread::current().id();
        let handles: Vec<JoinHandle<()>> = self.threads.lock().drain(..).collect();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!(transport = %self.id, "Transport thread panicked");
            }
        }

        *self.state.lock() = TransportState::Closed;
        let listener = self.listener.lock().take();
        info!(transport = %self.id, link_failed, "Transport closed");
        if let Some(listener) = listener {
            listener.transport_closed(link_failed);
        }
    }
}

impl KeepAliveLink for Inner {
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
        self.shutdown(true);
    }
}
