//! # Configuration Schema
//!
//! Typed configuration for destinations, transports and the broker process.
//! Every struct deserializes from TOML with `#[serde(default)]` so partial
//! files only need to name what differs from the defaults.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::{DEFAULT_MAX_PACKET_SIZE, DEFAULT_MAX_UNTRUSTED_PACKET_SIZE};
use crate::telemetry::LoggingConfig;

/// How journal and store files are forced to stable storage on commit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageSyncMethod {
    /// Sync file data and metadata (`fsync`)
    #[default]
    SyncAll,
    /// Sync file data only (`fdatasync`)
    SyncData,
    /// Leave flushing to the operating system
    None,
}

/// Storage layout and durability policy of one destination.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DestinationDescriptor {
    /// Destination name, also the base name of its files
    pub name: String,
    /// Folder holding the allocation table and data files
    pub data_folder: PathBuf,
    /// Folder holding journal files; defaults to `data_folder`
    pub journal_folder: Option<PathBuf>,
    /// Size of one block in bytes
    pub block_size: u32,
    /// Block count of a freshly created store
    pub initial_block_count: u32,
    /// Upper bound for auto-extension
    pub max_block_count: u32,
    /// Blocks added per extension, 0 disables auto-extension
    pub auto_extend_amount: u32,
    /// Route mutations through the write-ahead journal
    pub use_journal: bool,
    /// Journal file size that triggers rotation, in bytes
    pub max_journal_size: u64,
    /// Buffered journal bytes that trigger a write to the journal file
    pub max_write_batch_size: u64,
    /// Journal bytes not yet written to the file above which producers are throttled
    pub max_unflushed_journal_size: u64,
    /// Uncommitted store bytes above which the store commits on its own
    pub max_uncommitted_store_size: u64,
    /// Sync policy applied on commit
    pub sync_method: StorageSyncMethod,
    /// Keep retired journal files under a recycled name instead of deleting them
    pub pre_allocate_files: bool,
    /// Validate handles before every block operation
    pub safe_mode: bool,
}

impl Default for DestinationDescriptor {
    fn default() -> Self {
        Self {
            name: String::new(),
            data_folder: PathBuf::from("data"),
            journal_folder: None,
            block_size: 4096,
            initial_block_count: 64,
            max_block_count: 1_000_000,
            auto_extend_amount: 256,
            use_journal: true,
            max_journal_size: 16 * 1024 * 1024,
            max_write_batch_size: 1024 * 1024,
            max_unflushed_journal_size: 8 * 1024 * 1024,
            max_uncommitted_store_size: 32 * 1024 * 1024,
            sync_method: StorageSyncMethod::SyncAll,
            pre_allocate_files: false,
            safe_mode: false,
        }
    }
}

impl DestinationDescriptor {
    /// Descriptor with default settings stored under `data_folder`.
    #[must_use]
    pub fn new(name: impl Into<String>, data_folder: impl Into<PathBuf>) -> Self {
        Self { name: name.into(), data_folder: data_folder.into(), ..Self::default() }
    }

    /// Folder holding journal files.
    #[must_use]
    pub fn effective_journal_folder(&self) -> PathBuf {
        self.journal_folder.clone().unwrap_or_else(|| self.data_folder.clone())
    }

    /// Check the descriptor for consistency.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidDescriptor`] naming the first violated rule.
    pub fn validate(&self) -> crate::Result<()> {
        super::validator::ConfigValidator::validate_descriptor(self)
    }
}

/// Tuning of packet transports.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TransportSettings {
    /// Idle seconds before a client sends a ping, 0 disables keep-alive
    pub ping_interval_secs: u64,
    /// Connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Queued packets at which senders are asked to throttle
    pub send_queue_max_size: usize,
    /// Maximum packet size once the peer is trusted
    pub max_packet_size: usize,
    /// Maximum packet size before the peer is trusted
    pub max_untrusted_packet_size: usize,
    /// Disable Nagle's algorithm
    pub tcp_no_delay: bool,
    /// Socket send buffer size, 0 keeps the system default
    pub socket_send_buffer_size: usize,
    /// Socket receive buffer size, 0 keeps the system default
    pub socket_recv_buffer_size: usize,
    /// Buffered stream / output window size
    pub stream_send_buffer_size: usize,
    /// Buffered stream / input window size
    pub stream_recv_buffer_size: usize,
    /// Serve connections from the shared selector thread instead of per-connection threads
    pub use_multiplexer: bool,
    /// Upper bound of one selector wait in milliseconds
    pub multiplexer_timeout_ms: u64,
    /// Watchdog polling period in milliseconds
    pub watchdog_period_ms: u64,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            ping_interval_secs: 30,
            connect_timeout_ms: 5_000,
            send_queue_max_size: 1_000,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            max_untrusted_packet_size: DEFAULT_MAX_UNTRUSTED_PACKET_SIZE,
            tcp_no_delay: true,
            socket_send_buffer_size: 0,
            socket_recv_buffer_size: 0,
            stream_send_buffer_size: 16 * 1024,
            stream_recv_buffer_size: 16 * 1024,
            use_multiplexer: false,
            multiplexer_timeout_ms: 1_000,
            watchdog_period_ms: 200,
        }
    }
}

impl TransportSettings {
    /// Keep-alive interval, `None` when disabled.
    #[must_use]
    pub const fn ping_interval(&self) -> Option<Duration> {
        if self.ping_interval_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.ping_interval_secs))
        }
    }

    /// Connect timeout.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Selector wait bound.
    #[must_use]
    pub const fn multiplexer_timeout(&self) -> Duration {
        Duration::from_millis(self.multiplexer_timeout_ms)
    }

    /// Watchdog polling period.
    #[must_use]
    pub const fn watchdog_period(&self) -> Duration {
        Duration::from_millis(self.watchdog_period_ms)
    }
}

/// Listener settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the broker listens on
    pub bind_address: SocketAddr,
    /// Maximum concurrent client connections
    pub max_connections: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self { bind_address: SocketAddr::from(([127, 0, 0, 1], 7575)), max_connections: 1_000 }
    }
}

/// Complete broker process configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct BrokerConfig {
    /// Listener settings
    pub network: NetworkConfig,
    /// Transport tuning
    pub transport: TransportSettings,
    /// Logging settings
    pub logging: LoggingConfig,
    /// Hosted destinations
    pub destinations: Vec<DestinationDescriptor>,
}

impl BrokerConfig {
    /// Look up a destination descriptor by name.
    #[must_use]
    pub fn destination(&self, name: &str) -> Option<&DestinationDescriptor> {
        self.destinations.iter().find(|d| d.name == name)
    }
}
