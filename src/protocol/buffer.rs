//! Sequential byte reader/writer abstraction used by the codec.
//!
//! The transport owns the actual buffers. The codec only needs to write
//! fields in order and read them back in the same order, so both sides are
//! expressed as traits with blanket impls over [`bytes::BufMut`] and
//! [`bytes::Buf`].
//!
//! # Encoding rules
//!
//! - Numeric fields are fixed width, big-endian.
//! - Variable-length fields are prefixed with a `u32` length.
//! - Connection tokens are a raw 16-byte array.

use bytes::{Buf, BufMut};

use super::error::CodecError;

/// Maximum length of any variable-length field (16 MiB).
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// Size of a connection token on the wire.
pub const TOKEN_SIZE: usize = 16;

// =============================================================================
// OUTPUT
// =============================================================================

/// Sequential writer supplied by the transport.
///
/// Writes are infallible: every value reaching the encoder was validated by
/// its builder, including variable-length field sizes.
pub trait BufferOutput {
    fn write_u8(&mut self, value: u8);
    fn write_u16(&mut self, value: u16);
    fn write_i32(&mut self, value: i32);
    fn write_i64(&mut self, value: i64);
    fn write_token(&mut self, token: &[u8; TOKEN_SIZE]);
    /// Write a `u32` length prefix followed by the bytes.
    fn write_bytes(&mut self, bytes: &[u8]);

    /// Write a presence byte and, if present, a length-prefixed UTF-8 string.
    fn write_optional_string(&mut self, value: Option<&str>) {
        match value {
            Some(s) => {
                self.write_u8(1);
                self.write_bytes(s.as_bytes());
            }
            None => self.write_u8(0),
        }
    }
}

impl<B: BufMut + ?Sized> BufferOutput for B {
    fn write_u8(&mut self, value: u8) {
        self.put_u8(value);
    }

    fn write_u16(&mut self, value: u16) {
        self.put_u16(value);
    }

    fn write_i32(&mut self, value: i32) {
        self.put_i32(value);
    }

    fn write_i64(&mut self, value: i64) {
        self.put_i64(value);
    }

    fn write_token(&mut self, token: &[u8; TOKEN_SIZE]) {
        self.put_slice(token);
    }

    fn write_bytes(&mut self, bytes: &[u8]) {
        debug_assert!(bytes.len() <= MAX_PAYLOAD_SIZE as usize);
        self.put_u32(bytes.len() as u32);
        self.put_slice(bytes);
    }
}

// =============================================================================
// INPUT
// =============================================================================

/// Sequential reader supplied by the transport.
///
/// Every read names the field being decoded so truncation errors point at
/// the exact spot in the frame.
pub trait BufferInput {
    fn bytes_remaining(&self) -> usize;
    fn read_u8(&mut self, field: &'static str) -> Result<u8, CodecError>;
    fn read_u16(&mut self, field: &'static str) -> Result<u16, CodecError>;
    fn read_i32(&mut self, field: &'static str) -> Result<i32, CodecError>;
    fn read_i64(&mut self, field: &'static str) -> Result<i64, CodecError>;
    fn read_token(&mut self, field: &'static str) -> Result<[u8; TOKEN_SIZE], CodecError>;

    /// Read a length-prefixed field into `out`, reusing its capacity.
    fn read_bytes_into(&mut self, field: &'static str, out: &mut Vec<u8>) -> Result<(), CodecError>;

    /// Read a presence byte and, if present, a length-prefixed UTF-8 string.
    fn read_optional_string(&mut self, field: &'static str) -> Result<Option<String>, CodecError> {
        match self.read_u8(field)? {
            0 => Ok(None),
            1 => {
                let mut raw = Vec::new();
                self.read_bytes_into(field, &mut raw)?;
                String::from_utf8(raw)
                    .map(Some)
                    .map_err(|_| CodecError::InvalidUtf8 { field })
            }
            value => Err(CodecError::InvalidEnum { field, value }),
        }
    }
}

fn ensure<B: Buf + ?Sized>(buf: &B, field: &'static str, needed: usize) -> Result<(), CodecError> {
    let remaining = buf.remaining();
    if remaining < needed {
        return Err(CodecError::Truncated {
            field,
            needed,
            remaining,
        });
    }
    Ok(())
}

impl<B: Buf + ?Sized> BufferInput for B {
    fn bytes_remaining(&self) -> usize {
        self.remaining()
    }

    fn read_u8(&mut self, field: &'static str) -> Result<u8, CodecError> {
        ensure(self, field, 1)?;
        Ok(self.get_u8())
    }

    fn read_u16(&mut self, field: &'static str) -> Result<u16, CodecError> {
        ensure(self, field, 2)?;
        Ok(self.get_u16())
    }

    fn read_i32(&mut self, field: &'static str) -> Result<i32, CodecError> {
        ensure(self, field, 4)?;
        Ok(self.get_i32())
    }

    fn read_i64(&mut self, field: &'static str) -> Result<i64, CodecError> {
        ensure(self, field, 8)?;
        Ok(self.get_i64())
    }

    fn read_token(&mut self, field: &'static str) -> Result<[u8; TOKEN_SIZE], CodecError> {
        ensure(self, field, TOKEN_SIZE)?;
        let mut token = [0u8; TOKEN_SIZE];
        self.copy_to_slice(&mut token);
        Ok(token)
    }

    fn read_bytes_into(&mut self, field: &'static str, out: &mut Vec<u8>) -> Result<(), CodecError> {
        ensure(self, field, 4)?;
        let len = self.get_u32();
        if len > MAX_PAYLOAD_SIZE {
            return Err(CodecError::LengthTooLarge {
                field,
                len,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let len = len as usize;
        ensure(self, field, len)?;
        out.clear();
        out.resize(len, 0);
        self.copy_to_slice(out);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_width_fields_are_big_endian() {
        let mut out = Vec::new();
        out.write_u16(0x0110);
        out.write_i32(-1);
        out.write_i64(42);
        assert_eq!(&out[..2], &[0x01, 0x10]);
        assert_eq!(&out[2..6], &[0xFF; 4]);
        assert_eq!(&out[6..14], &[0, 0, 0, 0, 0, 0, 0, 42]);
    }

    #[test]
    fn test_length_prefixed_bytes() {
        let mut out = Vec::new();
        out.write_bytes(b"SET k v");
        assert_eq!(&out[..4], &[0, 0, 0, 7]);

        let mut input = &out[..];
        let mut payload = Vec::with_capacity(64);
        input.read_bytes_into("operation", &mut payload).unwrap();
        assert_eq!(payload, b"SET k v");
        assert!(payload.capacity() >= 64);
        assert_eq!(input.bytes_remaining(), 0);
    }

    #[test]
    fn test_truncated_read_names_field() {
        let mut input: &[u8] = &[0, 0, 0];
        let err = input.read_i32("member").unwrap_err();
        assert_eq!(
            err,
            CodecError::Truncated {
                field: "member",
                needed: 4,
                remaining: 3
            }
        );
    }

    #[test]
    fn test_oversized_length_prefix_rejected() {
        let mut out = Vec::new();
        out.write_u8(0);
        out.put_u32(MAX_PAYLOAD_SIZE + 1);
        let mut input = &out[1..];
        let mut payload = Vec::new();
        let err = input.read_bytes_into("query", &mut payload).unwrap_err();
        assert!(matches!(err, CodecError::LengthTooLarge { field: "query", .. }));
    }

    #[test]
    fn test_optional_string() {
        let mut out = Vec::new();
        out.write_optional_string(Some("no leader"));
        out.write_optional_string(None);

        let mut input = &out[..];
        assert_eq!(
            input.read_optional_string("message").unwrap().as_deref(),
            Some("no leader")
        );
        assert_eq!(input.read_optional_string("message").unwrap(), None);
    }
}
