//! Broker error types.
//!
//! [`TransportError`] covers connections, framing and the transport hub.
//! [`BrokerError`] covers the engine executing queries against the stores;
//! it is what the client sees inside an `ErrorResponse`.

use std::io;

use thiserror::Error;
use vireo_core::protocol::ProtocolError;
use vireo_core::ErrorCode;
use vireo_storage::StorageError;

/// Transport operation result type alias
pub type TransportResult<T> = Result<T, TransportError>;

/// Engine operation result type alias
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Connection level failures.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Socket operation failed
    #[error("I/O error during {operation}: {source}")]
    Io {
        /// Operation during which the error occurred
        operation: &'static str,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// Framing or packet encoding failure
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Operation on a closed transport or hub
    #[error("Transport {transport} is closed")]
    Closed {
        /// Transport identifier
        transport: String,
    },

    /// A bounded wait expired
    #[error("Timed out after {timeout_ms}ms waiting for {operation}")]
    Timeout {
        /// What was being waited for
        operation: String,
        /// Wait bound in milliseconds
        timeout_ms: u64,
    },

    /// The peer answered with an `ErrorResponse`
    #[error("Remote error {code}: {message}")]
    Remote {
        /// Short error code sent by the peer
        code: String,
        /// Human readable message sent by the peer
        message: String,
    },

    /// Operation not allowed in the current transport state
    #[error("Invalid transport state: {message}")]
    InvalidState {
        /// What was attempted
        message: String,
    },

    /// Background thread or runtime could not be started
    #[error("Internal transport error: {message}")]
    Internal {
        /// Error message
        message: String,
    },
}

impl TransportError {
    /// Wrap a socket error with the operation it interrupted.
    #[must_use]
    pub const fn io(operation: &'static str, source: io::Error) -> Self {
        Self::Io { operation, source }
    }

    /// Closed transport error naming the transport.
    #[must_use]
    pub fn closed(transport: impl ToString) -> Self {
        Self::Closed { transport: transport.to_string() }
    }

    /// Stable short code for this error.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Io { .. } => ErrorCode::NetworkError,
            Self::Protocol(e) => e.code(),
            Self::Closed { .. } => ErrorCode::TransportClosed,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::Remote { code, .. } => ErrorCode::from_code(code).unwrap_or(ErrorCode::TransportError),
            Self::InvalidState { .. } => ErrorCode::InvalidState,
            Self::Internal { .. } => ErrorCode::InternalError,
        }
    }
}

/// Failures executing a query in the broker engine.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Store operation failed
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Configuration rejected
    #[error(transparent)]
    Core(#[from] vireo_core::Error),

    /// Query names a destination the broker does not host
    #[error("Unknown destination '{name}'")]
    UnknownDestination {
        /// Destination name
        name: String,
    },

    /// Query names a session that was never created or is closed
    #[error("Unknown session {session_id}")]
    UnknownSession {
        /// Session id
        session_id: i32,
    },

    /// Query names a browser that was never created or is closed
    #[error("Unknown browser {browser_id} in session {session_id}")]
    UnknownBrowser {
        /// Session id
        session_id: i32,
        /// Browser id
        browser_id: i32,
    },

    /// Query is not valid in the current connection or session state
    #[error("Invalid state: {message}")]
    InvalidState {
        /// What was attempted
        message: String,
    },
}

impl BrokerError {
    /// Create an invalid state error.
    #[must_use]
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState { message: message.into() }
    }

    /// Stable short code for this error.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Storage(e) => e.code(),
            Self::Core(e) => e.code(),
            Self::UnknownDestination { .. } => ErrorCode::InvalidDescriptor,
            Self::UnknownSession { .. } | Self::UnknownBrowser { .. } | Self::InvalidState { .. } => {
                ErrorCode::InvalidState
            },
        }
    }
}
