// rawble Source Code File
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project
// root for full license information.

//! Bounded little-endian byte cursors used by every wire decoder.
//!
//! Encoders throughout the crate append to a `bytes::BytesMut`; decoders
//! walk a [`ByteReader`] which fails with [`CodecError::Eof`] instead of
//! panicking when a frame is truncated. [`ByteWriter`] fills fixed-size
//! frames (the SMP key bin) where the total length is known up front.

use std::fmt;

/// Decode/encode failure of a wire frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Ran past the end of the frame.
    #[error("unexpected end of frame")]
    Eof,
    /// A length or width field carried an unsupported value.
    #[error("invalid length: {0}")]
    InvalidLength(usize),
    /// A tag, opcode or enum field carried an unknown value.
    #[error("invalid value: {0:#x}")]
    InvalidValue(u64),
}

/// Read cursor over a byte slice.
pub struct ByteReader<'a> {
    data: &'a [u8],
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn remaining(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The not-yet-consumed tail of the frame.
    pub fn rest(&self) -> &'a [u8] {
        self.data
    }

    /// Consumes and returns the whole tail.
    pub fn take_rest(&mut self) -> &'a [u8] {
        let rest = self.data;
        self.data = &[];
        rest
    }

    pub fn read_slice(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.data.len() < n {
            return Err(CodecError::Eof);
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Ok(head)
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let slice = self.read_slice(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    pub fn skip(&mut self, n: usize) -> Result<(), CodecError> {
        self.read_slice(n).map(|_| ())
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_i8(&mut self) -> Result<i8, CodecError> {
        Ok(self.read_u8()? as i8)
    }

    pub fn read_u16_le(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    pub fn read_u32_le(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u64_le(&mut self) -> Result<u64, CodecError> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }
}

impl fmt::Debug for ByteReader<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ByteReader({} bytes left)", self.data.len())
    }
}

/// Write cursor over a fixed mutable byte slice.
pub struct ByteWriter<'a> {
    data: &'a mut [u8],
    written: usize,
}

impl<'a> ByteWriter<'a> {
    pub fn new(data: &'a mut [u8]) -> Self {
        Self { data, written: 0 }
    }

    /// Total bytes written so far.
    pub fn position(&self) -> usize {
        self.written
    }

    pub fn space_left(&self) -> usize {
        self.data.len() - self.written
    }

    pub fn write_slice(&mut self, bytes: &[u8]) -> Result<(), CodecError> {
        if self.space_left() < bytes.len() {
            return Err(CodecError::Eof);
        }
        self.data[self.written..self.written + bytes.len()].copy_from_slice(bytes);
        self.written += bytes.len();
        Ok(())
    }

    pub fn write_u8(&mut self, v: u8) -> Result<(), CodecError> {
        self.write_slice(&[v])
    }

    pub fn write_u16_le(&mut self, v: u16) -> Result<(), CodecError> {
        self.write_slice(&v.to_le_bytes())
    }

    pub fn write_u32_le(&mut self, v: u32) -> Result<(), CodecError> {
        self.write_slice(&v.to_le_bytes())
    }

    pub fn write_u64_le(&mut self, v: u64) -> Result<(), CodecError> {
        self.write_slice(&v.to_le_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_walks_le_fields() {
        let frame = [0x01, 0x34, 0x12, 0x78, 0x56, 0x34, 0x12, 0xff];
        let mut r = ByteReader::new(&frame);
        assert_eq!(r.read_u8().unwrap(), 0x01);
        assert_eq!(r.read_u16_le().unwrap(), 0x1234);
        assert_eq!(r.read_u32_le().unwrap(), 0x12345678);
        assert_eq!(r.remaining(), 1);
        assert_eq!(r.take_rest(), &[0xff]);
        assert!(r.is_empty());
    }

    #[test]
    fn reader_eof_is_an_error_not_a_panic() {
        let mut r = ByteReader::new(&[0x01]);
        assert_eq!(r.read_u16_le(), Err(CodecError::Eof));
        // the failed read consumes nothing
        assert_eq!(r.remaining(), 1);
        assert_eq!(r.read_u8(), Ok(0x01));
    }

    #[test]
    fn writer_fills_fixed_frame() {
        let mut buf = [0u8; 7];
        let mut w = ByteWriter::new(&mut buf);
        w.write_u8(0xaa).unwrap();
        w.write_u16_le(0x1234).unwrap();
        w.write_u32_le(0xdeadbeef).unwrap();
        assert_eq!(w.space_left(), 0);
        assert_eq!(w.write_u8(0), Err(CodecError::Eof));
        assert_eq!(buf, [0xaa, 0x34, 0x12, 0xef, 0xbe, 0xad, 0xde]);
    }

    #[test]
    fn u64_roundtrip() {
        let mut buf = [0u8; 8];
        ByteWriter::new(&mut buf).write_u64_le(0x0102030405060708).unwrap();
        assert_eq!(
            ByteReader::new(&buf).read_u64_le().unwrap(),
            0x0102030405060708
        );
    }
}
