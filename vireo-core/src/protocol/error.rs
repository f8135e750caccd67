//! Protocol-specific error types and handling.

use thiserror::Error;

use crate::error::ErrorCode;

/// Protocol-specific error types for packet handling.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Unknown packet type tag.
    #[error("Unsupported packet type: {packet_type:#04x}")]
    UnsupportedPacketType {
        /// Type tag found on the wire.
        packet_type: u8,
    },

    /// Declared frame size exceeds the current policy limit.
    #[error("Packet size {actual} exceeds maximum {max}")]
    PacketTooLarge {
        /// Declared packet size.
        actual: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Declared frame size is not a valid packet length.
    #[error("Invalid packet size: {size}")]
    InvalidPacketSize {
        /// Declared packet size.
        size: i32,
    },

    /// Packet body ended before all fields were read.
    #[error("Truncated packet: needed {required} more bytes, {remaining} remaining")]
    Truncated {
        /// Bytes required by the next field.
        required: usize,
        /// Bytes left in the body.
        remaining: usize,
    },

    /// Bytes left over after the packet body was fully parsed.
    #[error("Trailing data after {packet_type}: {remaining} bytes")]
    TrailingData {
        /// Name of the packet type.
        packet_type: &'static str,
        /// Unread bytes.
        remaining: usize,
    },

    /// Field value outside of its domain.
    #[error("Invalid field '{field}': {reason}")]
    InvalidField {
        /// Field name.
        field: &'static str,
        /// Reason the value was rejected.
        reason: String,
    },

    /// Packet encoding error.
    #[error("Encoding error: {message}")]
    EncodingError {
        /// Error message.
        message: String,
    },

    /// I/O error during frame processing.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type for protocol operations.
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;

impl ProtocolError {
    /// Create an encoding error with a message.
    #[must_use]
    pub fn encoding(message: impl Into<String>) -> Self {
        Self::EncodingError { message: message.into() }
    }

    /// Create an invalid field error.
    #[must_use]
    pub fn invalid_field(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField { field, reason: reason.into() }
    }

    /// Stable short code for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::UnsupportedPacketType { .. } => ErrorCode::UnsupportedPacketType,
            Self::PacketTooLarge { .. } => ErrorCode::PacketTooLarge,
            Self::InvalidPacketSize { .. }
            | Self::Truncated { .. }
            | Self::TrailingData { .. }
            | Self::InvalidField { .. }
            | Self::EncodingError { .. } => ErrorCode::InvalidPacket,
            Self::IoError(_) => ErrorCode::NetworkError,
        }
    }

    /// Check if this error indicates a framing violation that must tear the link down.
    #[must_use]
    pub const fn is_framing_violation(&self) -> bool {
        matches!(
            self,
            Self::PacketTooLarge { .. }
                | Self::InvalidPacketSize { .. }
                | Self::UnsupportedPacketType { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = ProtocolError::encoding("string too long");
        assert_eq!(err.to_string(), "Encoding error: string too long");
        assert_eq!(err.code(), ErrorCode::InvalidPacket);
    }

    #[test]
    fn test_error_properties() {
        let too_large = ProtocolError::PacketTooLarge { actual: 100, max: 10 };
        assert!(too_large.is_framing_violation());
        assert_eq!(too_large.code(), ErrorCode::PacketTooLarge);

        let truncated = ProtocolError::Truncated { required: 4, remaining: 1 };
        assert!(!truncated.is_framing_violation());

        let unknown = ProtocolError::UnsupportedPacketType { packet_type: 0xEE };
        assert_eq!(unknown.code().as_str(), "UNSUPPORTED_PACKET_TYPE");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        let err = ProtocolError::from(io_err);
        assert!(matches!(err, ProtocolError::IoError(_)));
        assert_eq!(err.code(), ErrorCode::NetworkError);
    }
}
