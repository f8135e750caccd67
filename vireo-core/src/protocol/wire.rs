//! Field level encoding primitives shared by every packet.
//!
//! Integers are big-endian, strings are UTF-8 prefixed with a `u16` byte
//! length, byte arrays are prefixed with an `i32` length, and nullable fields
//! carry a one byte presence flag ahead of the value.

use bytes::{Buf, BufMut, Bytes};

use crate::protocol::{ProtocolError, ProtocolResult};

/// Write-side helpers, available on every [`BufMut`].
pub trait WireWrite: BufMut {
    /// Write a boolean as a single byte.
    fn put_flag(&mut self, value: bool) {
        self.put_u8(u8::from(value));
    }

    /// Write a length-prefixed UTF-8 string.
    ///
    /// # Errors
    /// Returns an error if the encoded string exceeds 65535 bytes.
    fn put_utf(&mut self, value: &str) -> ProtocolResult<()> {
        let len = u16::try_from(value.len()).map_err(|_| {
            ProtocolError::encoding(format!("string of {} bytes exceeds 65535", value.len()))
        })?;
        self.put_u16(len);
        self.put_slice(value.as_bytes());
        Ok(())
    }

    /// Write an optional string behind a presence flag.
    ///
    /// # Errors
    /// Returns an error if the encoded string exceeds 65535 bytes.
    fn put_nullable_utf(&mut self, value: Option<&str>) -> ProtocolResult<()> {
        match value {
            Some(v) => {
                self.put_flag(true);
                self.put_utf(v)
            },
            None => {
                self.put_flag(false);
                Ok(())
            },
        }
    }

    /// Write an `i32` length-prefixed byte array.
    ///
    /// # Errors
    /// Returns an error if the array is larger than `i32::MAX` bytes.
    fn put_byte_array(&mut self, value: &[u8]) -> ProtocolResult<()> {
        let len = i32::try_from(value.len()).map_err(|_| {
            ProtocolError::encoding(format!("byte array of {} bytes is too large", value.len()))
        })?;
        self.put_i32(len);
        self.put_slice(value);
        Ok(())
    }

    /// Write an optional byte array behind a presence flag.
    ///
    /// # Errors
    /// Returns an error if the array is larger than `i32::MAX` bytes.
    fn put_nullable_byte_array(&mut self, value: Option<&[u8]>) -> ProtocolResult<()> {
        match value {
            Some(v) => {
                self.put_flag(true);
                self.put_byte_array(v)
            },
            None => {
                self.put_flag(false);
                Ok(())
            },
        }
    }
}

impl<T: BufMut + ?Sized> WireWrite for T {}

/// Read-side helpers with bounds checking, available on every [`Buf`].
///
/// The raw `Buf::get_*` accessors panic on underflow; these return
/// [`ProtocolError::Truncated`] instead.
pub trait WireRead: Buf {
    /// Fail unless at least `required` bytes remain.
    ///
    /// # Errors
    /// Returns [`ProtocolError::Truncated`] when the body is too short.
    fn ensure(&self, required: usize) -> ProtocolResult<()> {
        let remaining = self.remaining();
        if remaining < required {
            return Err(ProtocolError::Truncated { required, remaining });
        }
        Ok(())
    }

    /// Read one byte.
    ///
    /// # Errors
    /// Returns an error if the body is exhausted.
    fn read_u8(&mut self) -> ProtocolResult<u8> {
        self.ensure(1)?;
        Ok(self.get_u8())
    }

    /// Read a boolean flag; any non-zero byte is `true`.
    ///
    /// # Errors
    /// Returns an error if the body is exhausted.
    fn read_flag(&mut self) -> ProtocolResult<bool> {
        Ok(self.read_u8()? != 0)
    }

    /// Read a big-endian `i16`.
    ///
    /// # Errors
    /// Returns an error if the body is exhausted.
    fn read_i16(&mut self) -> ProtocolResult<i16> {
        self.ensure(2)?;
        Ok(self.get_i16())
    }

    /// Read a big-endian `i32`.
    ///
    /// # Errors
    /// Returns an error if the body is exhausted.
    fn read_i32(&mut self) -> ProtocolResult<i32> {
        self.ensure(4)?;
        Ok(self.get_i32())
    }

    /// Read a big-endian `i64`.
    ///
    /// # Errors
    /// Returns an error if the body is exhausted.
    fn read_i64(&mut self) -> ProtocolResult<i64> {
        self.ensure(8)?;
        Ok(self.get_i64())
    }

    /// Read a big-endian `f32`.
    ///
    /// # Errors
    /// Returns an error if the body is exhausted.
    fn read_f32(&mut self) -> ProtocolResult<f32> {
        self.ensure(4)?;
        Ok(self.get_f32())
    }

    /// Read a big-endian `f64`.
    ///
    /// # Errors
    /// Returns an error if the body is exhausted.
    fn read_f64(&mut self) -> ProtocolResult<f64> {
        self.ensure(8)?;
        Ok(self.get_f64())
    }

    /// Read a length-prefixed UTF-8 string.
    ///
    /// # Errors
    /// Returns an error if the body is exhausted or the bytes are not UTF-8.
    fn read_utf(&mut self) -> ProtocolResult<String> {
        self.ensure(2)?;
        let len = usize::from(self.get_u16());
        self.ensure(len)?;
        let raw = self.copy_to_bytes(len);
        String::from_utf8(raw.to_vec())
            .map_err(|e| ProtocolError::invalid_field("utf", e.to_string()))
    }

    /// Read an optional string behind a presence flag.
    ///
    /// # Errors
    /// Returns an error if the body is exhausted or the bytes are not UTF-8.
    fn read_nullable_utf(&mut self) -> ProtocolResult<Option<String>> {
        if self.read_flag()? {
            self.read_utf().map(Some)
        } else {
            Ok(None)
        }
    }

    /// Read an `i32` length-prefixed byte array.
    ///
    /// # Errors
    /// Returns an error if the body is exhausted or the length is negative.
    fn read_byte_array(&mut self) -> ProtocolResult<Bytes> {
        let len = self.read_i32()?;
        let len = usize::try_from(len)
            .map_err(|_| ProtocolError::invalid_field("byte_array", format!("length {len}")))?;
        self.ensure(len)?;
        Ok(self.copy_to_bytes(len))
    }

    /// Read an optional byte array behind a presence flag.
    ///
    /// # Errors
    /// Returns an error if the body is exhausted or the length is negative.
    fn read_nullable_byte_array(&mut self) -> ProtocolResult<Option<Bytes>> {
        if self.read_flag()? {
            self.read_byte_array().map(Some)
        } else {
            Ok(None)
        }
    }
}

impl<T: Buf + ?Sized> WireRead for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_utf_and_nullable_fields() {
        let mut buf = BytesMut::new();
        buf.put_utf("queue.orders").unwrap();
        buf.put_nullable_utf(None).unwrap();
        buf.put_nullable_utf(Some("corr-1")).unwrap();
        buf.put_nullable_byte_array(Some(b"body")).unwrap();

        let mut bytes = buf.freeze();
        assert_eq!(bytes.read_utf().unwrap(), "queue.orders");
        assert_eq!(bytes.read_nullable_utf().unwrap(), None);
        assert_eq!(bytes.read_nullable_utf().unwrap().as_deref(), Some("corr-1"));
        assert_eq!(bytes.read_nullable_byte_array().unwrap().unwrap(), Bytes::from_static(b"body"));
        assert!(!bytes.has_remaining());
    }

    #[test]
    fn test_truncated_reads_do_not_panic() {
        let mut bytes = Bytes::from_static(&[0x00, 0x00, 0x01]);
        assert!(matches!(bytes.read_i32(), Err(ProtocolError::Truncated { required: 4, remaining: 3 })));

        let mut bytes = Bytes::from_static(&[0x00, 0x05, b'a']);
        assert!(matches!(bytes.read_utf(), Err(ProtocolError::Truncated { .. })));
    }

    #[test]
    fn test_negative_array_length_rejected() {
        let mut buf = BytesMut::new();
        buf.put_i32(-1);
        let mut bytes = buf.freeze();
        assert!(matches!(bytes.read_byte_array(), Err(ProtocolError::InvalidField { .. })));
    }

    #[test]
    fn test_oversized_utf_rejected() {
        let long = "x".repeat(usize::from(u16::MAX) + 1);
        let mut buf = BytesMut::new();
        assert!(buf.put_utf(&long).is_err());
    }
}
