use thiserror::Error;

/// Errors that can occur while encoding or decoding wire data
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Unknown transaction type: {0}")]
    UnknownTransactionType(u8),

    #[error("Invalid hex in field {field}: {reason}")]
    InvalidHex { field: &'static str, reason: String },

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Field {field} is too long: {len} bytes (max {max})")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },
}

/// Marker byte opening every transaction and separating multi-signatures
pub const SENTINEL: u8 = 0xff;

/// Cursor over a byte slice. Every read checks the remaining length first.
pub struct Reader<'a> {
    input: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Reader { input, offset: 0 }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn remaining(&self) -> usize {
        self.input.len() - self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Looks at the next byte without consuming it
    pub fn peek(&self) -> Option<u8> {
        self.input.get(self.offset).copied()
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::MalformedPayload(format!(
                "need {} bytes at offset {}, only {} left",
                n,
                self.offset,
                self.remaining()
            )));
        }
        let out = &self.input[self.offset..self.offset + n];
        self.offset += n;
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64, CodecError> {
        let b = self.take(8)?;
        let mut out = [0u8; 8];
        out.copy_from_slice(b);
        Ok(u64::from_le_bytes(out))
    }

    /// Reads `n` bytes and returns them hex encoded
    pub fn read_hex(&mut self, n: usize) -> Result<String, CodecError> {
        Ok(hex::encode(self.take(n)?))
    }

    /// Reads a `u8` length prefix followed by that many bytes
    pub fn read_short_bytes(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.read_u8()? as usize;
        self.take(len)
    }

    /// Reads a DER signature. The second byte declares the body length.
    pub fn read_signature(&mut self) -> Result<String, CodecError> {
        if self.remaining() < 2 {
            return Err(CodecError::MalformedPayload(format!(
                "truncated signature at offset {}",
                self.offset
            )));
        }
        let len = self.input[self.offset + 1] as usize + 2;
        self.read_hex(len)
    }
}

pub fn write_u8(out: &mut Vec<u8>, v: u8) {
    out.push(v);
}

pub fn write_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub fn write_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub fn write_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

/// Decodes `value` and appends it, insisting on an exact byte width
pub fn write_hex(
    out: &mut Vec<u8>,
    field: &'static str,
    value: &str,
    width: Option<usize>,
) -> Result<(), CodecError> {
    let bytes = decode_hex(field, value)?;
    if let Some(width) = width {
        if bytes.len() != width {
            return Err(CodecError::MalformedPayload(format!(
                "{} must be {} bytes, got {}",
                field,
                width,
                bytes.len()
            )));
        }
    }
    out.extend_from_slice(&bytes);
    Ok(())
}

/// Appends a `u8` length prefix followed by the bytes
pub fn write_short_bytes(
    out: &mut Vec<u8>,
    field: &'static str,
    bytes: &[u8],
) -> Result<(), CodecError> {
    if bytes.len() > u8::MAX as usize {
        return Err(CodecError::FieldTooLong {
            field,
            len: bytes.len(),
            max: u8::MAX as usize,
        });
    }
    out.push(bytes.len() as u8);
    out.extend_from_slice(bytes);
    Ok(())
}

pub fn decode_hex(field: &'static str, value: &str) -> Result<Vec<u8>, CodecError> {
    hex::decode(value).map_err(|e| CodecError::InvalidHex {
        field,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_reads_little_endian() {
        let mut out = Vec::new();
        write_u8(&mut out, 7);
        write_u16(&mut out, 0x0102);
        write_u32(&mut out, 0x01020304);
        write_u64(&mut out, 42);

        let mut reader = Reader::new(&out);
        assert_eq!(reader.read_u8().unwrap(), 7);
        assert_eq!(reader.read_u16().unwrap(), 0x0102);
        assert_eq!(reader.read_u32().unwrap(), 0x01020304);
        assert_eq!(reader.read_u64().unwrap(), 42);
        assert!(reader.is_empty());
        assert_eq!(&out[1..3], &[0x02, 0x01]);
    }

    #[test]
    fn test_take_beyond_buffer_is_malformed() {
        let data = [1u8, 2, 3];
        let mut reader = Reader::new(&data);
        let err = reader.take(4).unwrap_err();
        assert!(matches!(err, CodecError::MalformedPayload(_)));
        // Nothing was consumed by the failed read
        assert_eq!(reader.offset(), 0);
    }

    #[test]
    fn test_signature_length_from_second_byte() {
        // 0x30, body length 3, three body bytes, then one trailing byte
        let data = [0x30u8, 0x03, 0xaa, 0xbb, 0xcc, 0xff];
        let mut reader = Reader::new(&data);
        assert_eq!(reader.read_signature().unwrap(), "3003aabbcc");
        assert_eq!(reader.peek(), Some(0xff));
    }

    #[test]
    fn test_signature_declared_length_overflow() {
        let data = [0x30u8, 0x45, 0x01];
        let mut reader = Reader::new(&data);
        assert!(matches!(
            reader.read_signature(),
            Err(CodecError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_write_hex_checks_width() {
        let mut out = Vec::new();
        assert!(write_hex(&mut out, "key", "aabb", Some(2)).is_ok());
        assert!(write_hex(&mut out, "key", "aabb", Some(3)).is_err());
        assert!(write_hex(&mut out, "key", "zz", None).is_err());
    }

    #[test]
    fn test_short_bytes_limit() {
        let mut out = Vec::new();
        let long = vec![0u8; 256];
        assert!(matches!(
            write_short_bytes(&mut out, "vendor_field", &long),
            Err(CodecError::FieldTooLong { .. })
        ));
    }
}
