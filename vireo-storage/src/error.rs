//! Storage error types.
//!
//! Every failure of the block store, journal or recovery is reported as a
//! [`StorageError`] carrying a stable [`ErrorCode`]. Errors are never retried
//! internally: a failed write may have left files partially updated, so the
//! store instance is expected to be closed and reopened (running recovery).

use std::io;
use std::path::Path;

use thiserror::Error;
use vireo_core::protocol::ProtocolError;
use vireo_core::ErrorCode;

/// Storage operation result type alias
pub type StorageResult<T> = Result<T, StorageError>;

/// Error enumeration for storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    /// File system operation failed
    #[error("I/O error during {operation} on '{path}': {source}")]
    Io {
        /// Operation during which the error occurred
        operation: &'static str,
        /// File involved
        path: String,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// Configuration or descriptor rejected
    #[error(transparent)]
    Core(#[from] vireo_core::Error),

    /// No free block left and the store cannot grow any further
    #[error("Store '{name}' is full: {block_count} of {max_block_count} blocks, {requested} more needed")]
    StoreFull {
        /// Store name
        name: String,
        /// Current block count
        block_count: u32,
        /// Configured maximum
        max_block_count: u32,
        /// Free blocks that were required
        requested: usize,
    },

    /// On-disk structures are inconsistent
    #[error("Store '{name}' is corrupted: {details}")]
    StoreCorrupted {
        /// Store name
        name: String,
        /// What the integrity check found
        details: String,
    },

    /// Lock requested on a locked block
    #[error("Block {handle} is already locked")]
    AlreadyLocked {
        /// Block handle
        handle: i32,
    },

    /// Unlock requested on an unlocked block
    #[error("Block {handle} is not locked")]
    NotLocked {
        /// Block handle
        handle: i32,
    },

    /// Handle out of range or not pointing at a live entry
    #[error("Invalid handle {handle}: {reason}")]
    InvalidHandle {
        /// Offending handle
        handle: i32,
        /// Why it was rejected
        reason: &'static str,
    },

    /// Argument outside of its domain
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// Why it was rejected
        reason: String,
    },

    /// Journal write, rotation or recovery failure
    #[error("Journal error during {operation}: {reason}")]
    Journal {
        /// Journal operation that failed
        operation: &'static str,
        /// Specific reason
        reason: String,
    },

    /// Operation on a closed store
    #[error("Store '{name}' is closed")]
    Closed {
        /// Store name
        name: String,
    },

    /// Stored message could not be encoded or decoded
    #[error("Message codec error: {0}")]
    Codec(#[from] ProtocolError),
}

impl StorageError {
    /// Wrap an I/O error with the operation and file it happened on.
    #[must_use]
    pub fn io(operation: &'static str, path: &Path, source: io::Error) -> Self {
        Self::Io { operation, path: path.display().to_string(), source }
    }

    /// Create a journal error.
    #[must_use]
    pub fn journal(operation: &'static str, reason: impl Into<String>) -> Self {
        Self::Journal { operation, reason: reason.into() }
    }

    /// Create a corruption error.
    #[must_use]
    pub fn corrupted(name: &str, details: impl Into<String>) -> Self {
        Self::StoreCorrupted { name: name.to_owned(), details: details.into() }
    }

    /// Stable short code for this error.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Io { .. } => ErrorCode::FsError,
            Self::Core(e) => e.code(),
            Self::StoreFull { .. } => ErrorCode::StoreFull,
            Self::StoreCorrupted { .. } => ErrorCode::StoreCorrupted,
            Self::AlreadyLocked { .. } => ErrorCode::AlreadyLocked,
            Self::NotLocked { .. } => ErrorCode::NotLocked,
            Self::InvalidHandle { .. } => ErrorCode::InvalidHandle,
            Self::InvalidArgument { .. } | Self::Closed { .. } => ErrorCode::InvalidState,
            Self::Journal { .. } => ErrorCode::JournalError,
            Self::Codec(e) => e.code(),
        }
    }

    /// Whether the error leaves the store instance unusable.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::StoreCorrupted { .. } | Self::Journal { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(StorageError::AlreadyLocked { handle: 1 }.code(), ErrorCode::AlreadyLocked);
        assert_eq!(StorageError::NotLocked { handle: 1 }.code(), ErrorCode::NotLocked);
        assert_eq!(StorageError::corrupted("q", "cycle").code().as_str(), "STORE_CORRUPTED");

        let descriptor = vireo_core::Error::invalid_descriptor("q", "bad");
        assert_eq!(StorageError::from(descriptor).code(), ErrorCode::InvalidDescriptor);
    }

    #[test]
    fn test_fatal_classification() {
        let io = StorageError::io("sync", Path::new("/tmp/q.dat"), io::Error::other("boom"));
        assert!(io.is_fatal());
        assert_eq!(io.code(), ErrorCode::FsError);
        assert!(!StorageError::NotLocked { handle: 3 }.is_fatal());
    }
}
