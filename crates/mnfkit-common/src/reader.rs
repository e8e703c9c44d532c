//! Binary reader for zero-copy parsing of byte slices.
//!
//! This module provides [`BinaryReader`], a cursor-like type that reads
//! binary data from a byte slice without copying. MNF headers mix little- and
//! big-endian fields, so every multi-byte read has an endian-selectable form.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use zerocopy::FromBytes;

use crate::{Error, Result};

/// Byte order of a multi-byte field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endian {
    #[default]
    Little,
    Big,
}

/// A binary reader that provides zero-copy reading from a byte slice.
///
/// # Example
///
/// ```
/// use mnfkit_common::BinaryReader;
///
/// let data = [0x01, 0x02, 0x03, 0x04, 0x00, 0x00, 0x00, 0x2a];
/// let mut reader = BinaryReader::new(&data);
///
/// assert_eq!(reader.read_u32().unwrap(), 0x04030201);
/// assert_eq!(reader.read_u32_be().unwrap(), 42);
/// assert!(reader.is_empty());
/// ```
#[derive(Debug, Clone)]
pub struct BinaryReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> BinaryReader<'a> {
    /// Create a new reader from a byte slice.
    #[inline]
    pub const fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    /// Create a new reader starting at a specific position.
    #[inline]
    pub const fn new_at(data: &'a [u8], position: usize) -> Self {
        Self { data, position }
    }

    /// Get the current position in the buffer.
    #[inline]
    pub const fn position(&self) -> usize {
        self.position
    }

    /// Get the total length of the underlying buffer.
    #[inline]
    pub const fn len(&self) -> usize {
        self.data.len()
    }

    /// Get the number of bytes remaining to read.
    #[inline]
    pub const fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.position)
    }

    /// Check if there are no more bytes to read.
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.position >= self.data.len()
    }

    /// Seek to an absolute position.
    #[inline]
    pub fn seek(&mut self, position: usize) {
        self.position = position;
    }

    /// Advance the position by a number of bytes.
    #[inline]
    pub fn advance(&mut self, count: usize) {
        self.position = self.position.saturating_add(count);
    }

    /// Get the remaining bytes as a slice.
    #[inline]
    pub fn remaining_bytes(&self) -> &'a [u8] {
        &self.data[self.position.min(self.data.len())..]
    }

    /// Peek at bytes without advancing the position.
    #[inline]
    pub fn peek_bytes(&self, count: usize) -> Result<&'a [u8]> {
        if self.remaining() < count {
            return Err(Error::UnexpectedEof {
                offset: self.position,
                needed: count,
                available: self.remaining(),
            });
        }
        let start = self.position.min(self.data.len());
        Ok(&self.data[start..start + count])
    }

    /// Read bytes and advance the position.
    #[inline]
    pub fn read_bytes(&mut self, count: usize) -> Result<&'a [u8]> {
        let bytes = self.peek_bytes(count)?;
        self.position += count;
        Ok(bytes)
    }

    /// Read everything up to the end of the buffer.
    #[inline]
    pub fn read_to_end(&mut self) -> &'a [u8] {
        let bytes = self.remaining_bytes();
        self.position = self.data.len().max(self.position);
        bytes
    }

    /// Read a single byte.
    #[inline]
    pub fn read_u8(&mut self) -> Result<u8> {
        self.read_bytes(1).map(|b| b[0])
    }

    /// Read a little-endian u16.
    #[inline]
    pub fn read_u16(&mut self) -> Result<u16> {
        self.read_u16_with(Endian::Little)
    }

    /// Read a big-endian u16.
    #[inline]
    pub fn read_u16_be(&mut self) -> Result<u16> {
        self.read_u16_with(Endian::Big)
    }

    /// Read a u16 with the given byte order.
    #[inline]
    pub fn read_u16_with(&mut self, endian: Endian) -> Result<u16> {
        let bytes = self.read_bytes(2)?;
        Ok(match endian {
            Endian::Little => LittleEndian::read_u16(bytes),
            Endian::Big => BigEndian::read_u16(bytes),
        })
    }

    /// Read a little-endian u32.
    #[inline]
    pub fn read_u32(&mut self) -> Result<u32> {
        self.read_u32_with(Endian::Little)
    }

    /// Read a big-endian u32.
    #[inline]
    pub fn read_u32_be(&mut self) -> Result<u32> {
        self.read_u32_with(Endian::Big)
    }

    /// Read a u32 with the given byte order.
    #[inline]
    pub fn read_u32_with(&mut self, endian: Endian) -> Result<u32> {
        let bytes = self.read_bytes(4)?;
        Ok(match endian {
            Endian::Little => LittleEndian::read_u32(bytes),
            Endian::Big => BigEndian::read_u32(bytes),
        })
    }

    /// Read a string of a specific length.
    pub fn read_string(&mut self, length: usize) -> Result<&'a str> {
        let bytes = self.read_bytes(length)?;
        std::str::from_utf8(bytes).map_err(Error::Utf8)
    }

    /// Read a struct using zerocopy.
    ///
    /// The struct must implement `FromBytes` from the zerocopy crate.
    #[inline]
    pub fn read_struct<T: FromBytes>(&mut self) -> Result<T> {
        let size = std::mem::size_of::<T>();
        let offset = self.position;
        let bytes = self.read_bytes(size)?;
        T::read_from_bytes(bytes).map_err(|_| Error::UnexpectedEof {
            offset,
            needed: size,
            available: bytes.len(),
        })
    }

    /// Peek at a little-endian u32 without advancing.
    #[inline]
    pub fn peek_u32(&self) -> Result<u32> {
        let bytes = self.peek_bytes(4)?;
        Ok(LittleEndian::read_u32(bytes))
    }

    /// Expect specific magic bytes.
    pub fn expect_magic(&mut self, expected: &[u8]) -> Result<()> {
        let actual = self.read_bytes(expected.len())?;
        if actual != expected {
            return Err(Error::InvalidMagic {
                expected: expected.to_vec(),
                actual: actual.to_vec(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_primitives() {
        let data = [
            0x01u8, 0x02, 0x03, 0x04, // u32: 0x04030201
            0xFF, 0xFF, 0xFF, 0xFF, // u32: 0xFFFFFFFF
        ];
        let mut reader = BinaryReader::new(&data);

        assert_eq!(reader.read_u32().unwrap(), 0x04030201);
        assert_eq!(reader.read_u32().unwrap(), 0xFFFFFFFF);
        assert!(reader.is_empty());
    }

    #[test]
    fn test_mixed_endianness() {
        let data = [0x00, 0x01, 0x01, 0x00, 0x00, 0x00, 0x01, 0x00];
        let mut reader = BinaryReader::new(&data);

        assert_eq!(reader.read_u16_be().unwrap(), 1);
        assert_eq!(reader.read_u16().unwrap(), 1);
        assert_eq!(reader.read_u32_with(Endian::Big).unwrap(), 0x100);
    }

    #[test]
    fn test_peek_does_not_advance() {
        let data = [0x01, 0x02, 0x03, 0x04];
        let reader = BinaryReader::new(&data);

        assert_eq!(reader.peek_u32().unwrap(), 0x04030201);
        assert_eq!(reader.position(), 0);
    }

    #[test]
    fn test_read_to_end() {
        let data = b"MES2rest";
        let mut reader = BinaryReader::new(data);
        reader.expect_magic(b"MES2").unwrap();

        assert_eq!(reader.read_to_end(), b"rest");
        assert!(reader.is_empty());
        assert_eq!(reader.read_to_end(), b"");
    }

    #[test]
    fn test_eof_error_reports_offset() {
        let data = [0x01, 0x02, 0x03];
        let mut reader = BinaryReader::new(&data);
        reader.read_u16().unwrap();

        match reader.read_u32() {
            Err(Error::UnexpectedEof {
                offset,
                needed,
                available,
            }) => {
                assert_eq!(offset, 2);
                assert_eq!(needed, 4);
                assert_eq!(available, 1);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_reads_after_seeking_past_end() {
        let mut reader = BinaryReader::new(b"abcd");
        reader.seek(100);

        assert_eq!(reader.peek_bytes(0).unwrap(), &[] as &[u8]);
        assert_eq!(reader.read_bytes(0).unwrap(), &[] as &[u8]);
        assert!(matches!(
            reader.read_bytes(1),
            Err(Error::UnexpectedEof { available: 0, .. })
        ));
        assert!(reader.read_to_end().is_empty());
        assert!(reader.is_empty());
    }

    #[test]
    fn test_bad_magic() {
        let mut reader = BinaryReader::new(b"NOPE");
        assert!(matches!(
            reader.expect_magic(b"MES2"),
            Err(Error::InvalidMagic { .. })
        ));
    }
}
