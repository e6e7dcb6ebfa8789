//! Bit-Oriented Message Codec
//!
//! Compact writer/reader pair used for every datagram the session exchanges.
//!
//! ## Layout Rules
//!
//! - Bits are packed LSB-first into each byte.
//! - `bool` costs a single bit.
//! - Fixed-width integers and floats are written at their full width,
//!   without realignment.
//! - Variable-width unsigned integers use 7-bit groups with a continuation
//!   bit, so small tags and ids cost one byte.
//! - Byte arrays are a var-uint length followed by the raw bytes.
//!
//! A frame header is `[tag: var-uint][pad to byte boundary]`, after which the
//! body can be handed out as a plain byte slice.

use thiserror::Error;

/// Maximum number of 7-bit groups in a var-uint (ceil(64 / 7)).
const MAX_VAR_GROUPS: u32 = 10;

/// Codec errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Read past the end of the buffer.
    #[error("unexpected end of buffer: needed {needed} bits, {available} available")]
    UnexpectedEnd {
        /// Bits requested.
        needed: usize,
        /// Bits left in the buffer.
        available: usize,
    },

    /// A var-uint used more groups than its target width allows.
    #[error("variable-width integer overflow")]
    VarIntOverflow,

    /// A length prefix points past the end of the buffer.
    #[error("length prefix {0} exceeds remaining buffer")]
    LengthExceeded(u64),
}

/// Bit-level writer.
#[derive(Debug, Default, Clone)]
pub struct BitWriter {
    buf: Vec<u8>,
    bit_len: usize,
}

impl BitWriter {
    /// Create an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a writer with room for `bytes` bytes.
    pub fn with_capacity(bytes: usize) -> Self {
        Self {
            buf: Vec::with_capacity(bytes),
            bit_len: 0,
        }
    }

    /// Number of bits written so far.
    pub fn bit_len(&self) -> usize {
        self.bit_len
    }

    /// Number of bytes the written bits occupy.
    pub fn byte_len(&self) -> usize {
        self.bit_len.div_ceil(8)
    }

    /// Whether the write cursor sits on a byte boundary.
    pub fn is_aligned(&self) -> bool {
        self.bit_len % 8 == 0
    }

    /// Write the low `count` bits of `value` (count <= 64).
    pub fn write_bits(&mut self, mut value: u64, count: u32) {
        debug_assert!(count <= 64);
        let mut remaining = count;
        while remaining > 0 {
            let offset = (self.bit_len % 8) as u32;
            if offset == 0 {
                self.buf.push(0);
            }
            let take = (8 - offset).min(remaining);
            let bits = (value & low_mask(take)) as u8;
            let last = self.buf.len() - 1;
            self.buf[last] |= bits << offset;
            value >>= take;
            remaining -= take;
            self.bit_len += take as usize;
        }
    }

    /// Write a single bit.
    #[inline]
    pub fn write_bool(&mut self, value: bool) {
        self.write_bits(value as u64, 1);
    }

    /// Write a u8.
    #[inline]
    pub fn write_u8(&mut self, value: u8) {
        self.write_bits(value as u64, 8);
    }

    /// Write a u16.
    #[inline]
    pub fn write_u16(&mut self, value: u16) {
        self.write_bits(value as u64, 16);
    }

    /// Write a u32.
    #[inline]
    pub fn write_u32(&mut self, value: u32) {
        self.write_bits(value as u64, 32);
    }

    /// Write a u64.
    #[inline]
    pub fn write_u64(&mut self, value: u64) {
        self.write_bits(value, 64);
    }

    /// Write an i32 (two's complement).
    #[inline]
    pub fn write_i32(&mut self, value: i32) {
        self.write_u32(value as u32);
    }

    /// Write an f32 by its IEEE-754 bit pattern.
    #[inline]
    pub fn write_f32(&mut self, value: f32) {
        self.write_u32(value.to_bits());
    }

    /// Write a variable-width unsigned integer.
    pub fn write_var_u64(&mut self, mut value: u64) {
        loop {
            let group = (value & 0x7F) as u8;
            value >>= 7;
            if value == 0 {
                self.write_u8(group);
                return;
            }
            self.write_u8(group | 0x80);
        }
    }

    /// Write a variable-width u32.
    #[inline]
    pub fn write_var_u32(&mut self, value: u32) {
        self.write_var_u64(value as u64);
    }

    /// Write a length-prefixed byte array.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.write_var_u64(bytes.len() as u64);
        self.write_raw(bytes);
    }

    /// Write bytes without a length prefix.
    pub fn write_raw(&mut self, bytes: &[u8]) {
        if self.is_aligned() {
            self.buf.extend_from_slice(bytes);
            self.bit_len += bytes.len() * 8;
        } else {
            for &byte in bytes {
                self.write_u8(byte);
            }
        }
    }

    /// Advance the cursor to the next byte boundary.
    pub fn pad_to_byte(&mut self) {
        self.bit_len = self.byte_len() * 8;
    }

    /// Borrow the written bytes (trailing partial byte zero-padded).
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Consume the writer.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Bit-level reader over a borrowed buffer.
#[derive(Debug, Clone)]
pub struct BitReader<'a> {
    data: &'a [u8],
    bit_pos: usize,
}

impl<'a> BitReader<'a> {
    /// Create a reader positioned at the first bit.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, bit_pos: 0 }
    }

    /// Bits left to read.
    pub fn remaining_bits(&self) -> usize {
        self.data.len() * 8 - self.bit_pos
    }

    /// Current bit position.
    pub fn position(&self) -> usize {
        self.bit_pos
    }

    fn ensure(&self, bits: usize) -> Result<(), CodecError> {
        let available = self.remaining_bits();
        if bits > available {
            return Err(CodecError::UnexpectedEnd {
                needed: bits,
                available,
            });
        }
        Ok(())
    }

    /// Read `count` bits (count <= 64).
    pub fn read_bits(&mut self, count: u32) -> Result<u64, CodecError> {
        debug_assert!(count <= 64);
        self.ensure(count as usize)?;

        let mut value = 0u64;
        let mut shift = 0u32;
        let mut remaining = count;
        while remaining > 0 {
            let idx = self.bit_pos / 8;
            let offset = (self.bit_pos % 8) as u32;
            let take = (8 - offset).min(remaining);
            let bits = ((self.data[idx] >> offset) as u64) & low_mask(take);
            value |= bits << shift;
            shift += take;
            remaining -= take;
            self.bit_pos += take as usize;
        }
        Ok(value)
    }

    /// Read a single bit.
    #[inline]
    pub fn read_bool(&mut self) -> Result<bool, CodecError> {
        Ok(self.read_bits(1)? == 1)
    }

    /// Read a u8.
    #[inline]
    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.read_bits(8)? as u8)
    }

    /// Read a u16.
    #[inline]
    pub fn read_u16(&mut self) -> Result<u16, CodecError> {
        Ok(self.read_bits(16)? as u16)
    }

    /// Read a u32.
    #[inline]
    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        Ok(self.read_bits(32)? as u32)
    }

    /// Read a u64.
    #[inline]
    pub fn read_u64(&mut self) -> Result<u64, CodecError> {
        self.read_bits(64)
    }

    /// Read an i32.
    #[inline]
    pub fn read_i32(&mut self) -> Result<i32, CodecError> {
        Ok(self.read_u32()? as i32)
    }

    /// Read an f32.
    #[inline]
    pub fn read_f32(&mut self) -> Result<f32, CodecError> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    /// Read a variable-width unsigned integer.
    pub fn read_var_u64(&mut self) -> Result<u64, CodecError> {
        let mut value = 0u64;
        for group in 0..MAX_VAR_GROUPS {
            let byte = self.read_u8()?;
            let payload = (byte & 0x7F) as u64;
            let shift = group * 7;
            // The tenth group may only carry the top bit of a u64.
            if group == MAX_VAR_GROUPS - 1 && payload > 1 {
                return Err(CodecError::VarIntOverflow);
            }
            value |= payload << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(CodecError::VarIntOverflow)
    }

    /// Read a variable-width u32.
    pub fn read_var_u32(&mut self) -> Result<u32, CodecError> {
        u32::try_from(self.read_var_u64()?).map_err(|_| CodecError::VarIntOverflow)
    }

    /// Read a length-prefixed byte array.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.read_var_u64()?;
        if len.saturating_mul(8) > self.remaining_bits() as u64 {
            return Err(CodecError::LengthExceeded(len));
        }
        self.read_raw(len as usize)
    }

    /// Read `len` bytes without a length prefix.
    pub fn read_raw(&mut self, len: usize) -> Result<Vec<u8>, CodecError> {
        self.ensure(len * 8)?;
        if self.bit_pos % 8 == 0 {
            let start = self.bit_pos / 8;
            self.bit_pos += len * 8;
            return Ok(self.data[start..start + len].to_vec());
        }
        (0..len).map(|_| self.read_u8()).collect()
    }

    /// Skip to the next byte boundary.
    pub fn skip_padding(&mut self) {
        self.bit_pos = self.bit_pos.div_ceil(8) * 8;
        self.bit_pos = self.bit_pos.min(self.data.len() * 8);
    }

    /// Unread bytes starting at the next byte boundary.
    pub fn rest(&self) -> &'a [u8] {
        let start = self.bit_pos.div_ceil(8).min(self.data.len());
        &self.data[start..]
    }
}

#[inline]
fn low_mask(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

/// Write a frame header: tag followed by padding.
pub fn write_header(writer: &mut BitWriter, tag: u32) {
    writer.write_var_u32(tag);
    writer.pad_to_byte();
}

/// Read a frame header, leaving the reader at the body.
pub fn read_header(reader: &mut BitReader<'_>) -> Result<u32, CodecError> {
    let tag = reader.read_var_u32()?;
    reader.skip_padding();
    Ok(tag)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bools_share_a_byte() {
        let mut writer = BitWriter::new();
        for i in 0..8 {
            writer.write_bool(i % 3 == 0);
        }
        assert_eq!(writer.byte_len(), 1);

        let bytes = writer.into_bytes();
        let mut reader = BitReader::new(&bytes);
        for i in 0..8 {
            assert_eq!(reader.read_bool().unwrap(), i % 3 == 0);
        }
        assert!(reader.read_bool().is_err());
    }

    #[test]
    fn test_unaligned_mixed_fields() {
        let mut writer = BitWriter::new();
        writer.write_bool(true);
        writer.write_u32(0xDEAD_BEEF);
        writer.write_bool(false);
        writer.write_f32(-12.5);
        writer.write_i32(-7);
        writer.write_bytes(b"abc");
        let bytes = writer.into_bytes();

        let mut reader = BitReader::new(&bytes);
        assert!(reader.read_bool().unwrap());
        assert_eq!(reader.read_u32().unwrap(), 0xDEAD_BEEF);
        assert!(!reader.read_bool().unwrap());
        assert_eq!(reader.read_f32().unwrap(), -12.5);
        assert_eq!(reader.read_i32().unwrap(), -7);
        assert_eq!(reader.read_bytes().unwrap(), b"abc".to_vec());
    }

    #[test]
    fn test_small_var_uint_is_one_byte() {
        let mut writer = BitWriter::new();
        writer.write_var_u32(31);
        assert_eq!(writer.byte_len(), 1);

        let mut writer = BitWriter::new();
        writer.write_var_u32(300);
        assert_eq!(writer.byte_len(), 2);
    }

    #[test]
    fn test_var_uint_extremes() {
        let mut writer = BitWriter::new();
        writer.write_var_u64(u64::MAX);
        writer.write_var_u64(0);
        let bytes = writer.into_bytes();
        assert_eq!(bytes.len(), 11);

        let mut reader = BitReader::new(&bytes);
        assert_eq!(reader.read_var_u64().unwrap(), u64::MAX);
        assert_eq!(reader.read_var_u64().unwrap(), 0);
    }

    #[test]
    fn test_var_u32_overflow_rejected() {
        let mut writer = BitWriter::new();
        writer.write_var_u64(u32::MAX as u64 + 1);
        let bytes = writer.into_bytes();
        let mut reader = BitReader::new(&bytes);
        assert_eq!(reader.read_var_u32(), Err(CodecError::VarIntOverflow));
    }

    #[test]
    fn test_header_padding_exposes_body() {
        let mut writer = BitWriter::new();
        write_header(&mut writer, 3);
        writer.write_raw(&[9, 8, 7]);
        let bytes = writer.into_bytes();

        let mut reader = BitReader::new(&bytes);
        assert_eq!(read_header(&mut reader).unwrap(), 3);
        assert_eq!(reader.rest(), &[9, 8, 7]);
    }

    #[test]
    fn test_length_prefix_past_end() {
        let mut writer = BitWriter::new();
        writer.write_var_u64(64);
        writer.write_u8(1);
        let bytes = writer.into_bytes();
        let mut reader = BitReader::new(&bytes);
        assert_eq!(reader.read_bytes(), Err(CodecError::LengthExceeded(64)));
    }

    #[test]
    fn test_truncated_read_reports_sizes() {
        let bytes = [0xFFu8];
        let mut reader = BitReader::new(&bytes);
        reader.read_bits(3).unwrap();
        assert_eq!(
            reader.read_u8(),
            Err(CodecError::UnexpectedEnd { needed: 8, available: 5 })
        );
    }
}
