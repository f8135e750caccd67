//! Identity, state and accounting shared by every packet transport.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use uuid::Uuid;
use vireo_core::Clock;

/// Unique identifier of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportId(Uuid);

impl TransportId {
    /// Create a new unique transport id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// First eight hex digits, used in thread names.
    #[must_use]
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_owned()
    }
}

impl Default for TransportId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a transport.
///
/// `Created -> Started -> Closing -> Closed`; a transport never goes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Built, packets may be queued but nothing moves yet
    Created,
    /// I/O running
    Started,
    /// Shutdown requested, waiting for I/O to stop
    Closing,
    /// Terminated
    Closed,
}

impl TransportState {
    /// Whether the transport still accepts packets.
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Created | Self::Started)
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Started => write!(f, "started"),
            Self::Closing => write!(f, "closing"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Point in time copy of a transport's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Packets written to the socket
    pub packets_sent: u64,
    /// Packets decoded from the socket
    pub packets_received: u64,
    /// Frame bytes written, length prefixes included
    pub bytes_sent: u64,
    /// Frame bytes read, length prefixes included
    pub bytes_received: u64,
    /// Keep-alive pings sent
    pub pings_sent: u64,
    /// Packets queued while the send queue was at its limit
    pub queued_over_limit: u64,
}

#[derive(Debug, Default)]
pub(crate) struct TransportMetrics {
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    pings_sent: AtomicU64,
    queued_over_limit: AtomicU64,
}

impl TransportMetrics {
    pub fn record_sent(&self, frame_bytes: usize) {
        self.packet_sent();
        self.bytes_sent(frame_bytes);
    }

    pub fn record_received(&self, frame_bytes: usize) {
        self.packet_received();
        self.bytes_received(frame_bytes);
    }

    pub fn packet_sent(&self) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packet_received(&self) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_sent(&self, count: usize) {
        self.bytes_sent.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn bytes_received(&self, count: usize) {
        self.bytes_received.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_ping(&self) {
        self.pings_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_over_limit(&self) {
        self.queued_over_limit.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> TransportStats {
        TransportStats {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            pings_sent: self.pings_sent.load(Ordering::Relaxed),
            queued_over_limit: self.queued_over_limit.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ActivityState {
    last_request_sent: Instant,
    last_received: Instant,
    ping_sent: Option<Instant>,
}

/// Link liveness as seen by the keep-alive.
///
/// Only response-expecting sends and receptions count as activity; an
/// outstanding ping counts from the moment it was sent.
#[derive(Debug)]
pub(crate) struct LinkActivity {
    clock: Arc<dyn Clock>,
    state: Mutex<ActivityState>,
}

impl LinkActivity {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self { clock, state: Mutex::new(ActivityState { last_request_sent: now, last_received: now, ping_sent: None }) }
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    pub fn request_sent(&self) {
        let now = self.clock.now();
        self.state.lock().last_request_sent = now;
    }

    pub fn packet_received(&self) {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.last_received = now;
        state.ping_sent = None;
    }

    pub fn ping_sent(&self, at: Instant) {
        self.state.lock().ping_sent = Some(at);
    }

    pub fn ping_pending(&self) -> bool {
        self.state.lock().ping_sent.is_some()
    }

    pub fn last_activity(&self) -> Instant {
        let state = *self.state.lock();
        let latest = state.last_request_sent.max(state.last_received);
        state.ping_sent.map_or(latest, |ping| latest.max(ping))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use vireo_core::ManualClock;

    #[test]
    fn test_transport_id_is_unique() {
        let a = TransportId::new();
        let b = TransportId::new();
        assert_ne!(a, b);
        assert_eq!(a.short().len(), 8);
        assert!(a.to_string().replace('-', "").starts_with(&a.short()));
    }

    #[test]
    fn test_state_display_and_openness() {
        assert_eq!(TransportState::Closing.to_string(), "closing");
        assert!(TransportState::Created.is_open());
        assert!(TransportState::Started.is_open());
        assert!(!TransportState::Closed.is_open());
    }

    #[test]
    fn test_metrics_snapshot() {
        let metrics = TransportMetrics::default();
        metrics.record_sent(13);
        metrics.record_sent(20);
        metrics.record_received(9);
        metrics.record_ping();
        let stats = metrics.stats();
        assert_eq!(stats.packets_sent, 2);
        assert_eq!(stats.bytes_sent, 33);
        assert_eq!(stats.packets_received, 1);
        assert_eq!(stats.pings_sent, 1);
    }

    #[test]
    fn test_activity_tracks_latest_event() {
        let clock = Arc::new(ManualClock::new());
        let start = clock.now();
        let activity = LinkActivity::new(clock.clone());

        clock.advance(Duration::from_secs(2));
        activity.request_sent();
        assert_eq!(activity.last_activity(), start + Duration::from_secs(2));

        clock.advance(Duration::from_secs(1));
        activity.ping_sent(clock.now());
        assert!(activity.ping_pending());
        assert_eq!(activity.last_activity(), start + Duration::from_secs(3));

        clock.advance(Duration::from_secs(1));
        activity.packet_received();
        assert!(!activity.ping_pending());
        assert_eq!(activity.last_activity(), start + Duration::from_secs(4));
    }
}
