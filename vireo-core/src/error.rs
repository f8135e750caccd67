//! Error types for the Vireo core library.
//!
//! Every error surfaced at the engine boundary maps onto an [`ErrorCode`], a
//! short machine-readable string that stays stable across releases. Crate
//! specific error enums (storage, transport) expose the same `code()` accessor.

use std::fmt;
use std::io;

use thiserror::Error;

use crate::protocol::ProtocolError;

/// Stable taxonomy of boundary error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// File system failure (read, write, sync, create, delete).
    FsError,
    /// Destination descriptor or configuration rejected by validation.
    InvalidDescriptor,
    /// No free block left and the store cannot grow any further.
    StoreFull,
    /// Integrity check failure or inconsistent on-disk structures.
    StoreCorrupted,
    /// Lock requested on a block that is already locked.
    AlreadyLocked,
    /// Unlock requested on a block that is not locked.
    NotLocked,
    /// Handle outside the store range or not pointing at a live entry.
    InvalidHandle,
    /// Journal write, rotation or recovery failure.
    JournalError,
    /// Unknown packet type tag on the wire.
    UnsupportedPacketType,
    /// Malformed packet body.
    InvalidPacket,
    /// Packet exceeding the negotiated maximum size.
    PacketTooLarge,
    /// Generic transport failure.
    TransportError,
    /// Operation attempted on a closed transport or endpoint.
    TransportClosed,
    /// Bounded wait expired.
    Timeout,
    /// Socket level failure.
    NetworkError,
    /// Operation not allowed in the current state.
    InvalidState,
    /// Unexpected internal condition.
    InternalError,
}

impl ErrorCode {
    /// All known codes, in declaration order.
    pub const ALL: [Self; 17] = [
        Self::FsError,
        Self::InvalidDescriptor,
        Self::StoreFull,
        Self::StoreCorrupted,
        Self::AlreadyLocked,
        Self::NotLocked,
        Self::InvalidHandle,
        Self::JournalError,
        Self::UnsupportedPacketType,
        Self::InvalidPacket,
        Self::PacketTooLarge,
        Self::TransportError,
        Self::TransportClosed,
        Self::Timeout,
        Self::NetworkError,
        Self::InvalidState,
        Self::InternalError,
    ];

    /// Wire representation of the code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FsError => "FS_ERROR",
            Self::InvalidDescriptor => "INVALID_DESCRIPTOR",
            Self::StoreFull => "STORE_FULL",
            Self::StoreCorrupted => "STORE_CORRUPTED",
            Self::AlreadyLocked => "ALREADY_LOCKED",
            Self::NotLocked => "NOT_LOCKED",
            Self::InvalidHandle => "INVALID_HANDLE",
            Self::JournalError => "JOURNAL_ERROR",
            Self::UnsupportedPacketType => "UNSUPPORTED_PACKET_TYPE",
            Self::InvalidPacket => "INVALID_PACKET",
            Self::PacketTooLarge => "PACKET_TOO_LARGE",
            Self::TransportError => "TRANSPORT_ERROR",
            Self::TransportClosed => "TRANSPORT_CLOSED",
            Self::Timeout => "TIMEOUT",
            Self::NetworkError => "NETWORK_ERROR",
            Self::InvalidState => "INVALID_STATE",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Parse a wire code back into the taxonomy.
    #[must_use]
    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == code)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for Vireo core operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Destination descriptor rejected by validation
    #[error("Invalid descriptor '{name}': {message}")]
    InvalidDescriptor { name: String, message: String },

    /// Configuration errors outside of destination descriptors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Invalid message format or content
    #[error("Invalid message: {message}")]
    InvalidMessage { message: String },

    /// Wire protocol errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A synchronization barrier was released with a failure
    #[error("Barrier failed: {message}")]
    BarrierFailed { message: String },

    /// A bounded wait expired
    #[error("Timed out after {duration_ms}ms waiting for {operation}")]
    Timeout { operation: String, duration_ms: u64 },

    /// File system errors with the path involved
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    /// Internal system errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Result type alias for Vireo core operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a descriptor validation error.
    #[must_use]
    pub fn invalid_descriptor(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidDescriptor { name: name.into(), message: message.into() }
    }

    /// Create a configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Wrap an I/O error with the path it happened on.
    #[must_use]
    pub fn io(path: impl Into<String>, source: io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }

    /// Stable short code for this error.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidDescriptor { .. } | Self::Configuration { .. } => {
                ErrorCode::InvalidDescriptor
            },
            Self::InvalidMessage { .. } => ErrorCode::InvalidPacket,
            Self::Protocol(e) => e.code(),
            Self::BarrierFailed { .. } => ErrorCode::JournalError,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::Io { .. } => ErrorCode::FsError,
            Self::Internal { .. } => ErrorCode::InternalError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_roundtrip() {
        for code in ErrorCode::ALL {
            assert_eq!(ErrorCode::from_code(code.as_str()), Some(code));
        }
        assert_eq!(ErrorCode::from_code("NOPE"), None);
    }

    #[test]
    fn test_error_codes() {
        let err = Error::invalid_descriptor("orders", "block_size must be positive");
        assert_eq!(err.code(), ErrorCode::InvalidDescriptor);
        assert_eq!(err.to_string(), "Invalid descriptor 'orders': block_size must be positive");

        let err = Error::io("/tmp/x", io::Error::new(io::ErrorKind::Other, "disk full"));
        assert_eq!(err.code(), ErrorCode::FsError);
        assert_eq!(err.code().to_string(), "FS_ERROR");
    }
}
