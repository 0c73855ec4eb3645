//! Little-endian primitive encode/decode for payload bodies, per
//! `spec.md` §4.1.
//!
//! Unlike the predecessor's XDR reader (`parser::primitive`, big-endian,
//! built around a streaming `Read` refilled from a socket), the whole HTTP
//! body is already buffered by the time a handler runs, so this is a
//! single-pass borrowing cursor rather than an async retry-refill loop.

use byteorder::{ByteOrder, LittleEndian};

use crate::status::{Error, Status};

/// A borrowing cursor over an already-fully-buffered payload.
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], Error> {
        if self.buf.len() - self.pos < n {
            return Err(Error::Status(Status::BadRequest));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, Error> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, Error> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }

    pub fn u32(&mut self) -> Result<u32, Error> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    /// Length-prefixed string: `u8` length followed by that many bytes.
    pub fn string(&mut self) -> Result<String, Error> {
        let len = self.u8()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| Error::Status(Status::BadRequest))
    }

    /// Borrows exactly `n` bytes without copying (e.g. `WRITE_RANGE` data).
    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], Error> {
        self.take(n)
    }

    /// Number of unread bytes remaining in the payload.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Enforced after the last expected field of every request: trailing
    /// bytes are a protocol-shape error (`spec.md` §4.1).
    pub fn expect_exhausted(&self) -> Result<(), Error> {
        if self.remaining() != 0 {
            return Err(Error::Status(Status::BadRequest));
        }
        Ok(())
    }
}

/// A growable response-payload builder.
#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn u16(&mut self, v: u16) -> &mut Self {
        let mut tmp = [0u8; 2];
        LittleEndian::write_u16(&mut tmp, v);
        self.buf.extend_from_slice(&tmp);
        self
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        let mut tmp = [0u8; 4];
        LittleEndian::write_u32(&mut tmp, v);
        self.buf.extend_from_slice(&tmp);
        self
    }

    pub fn string(&mut self, s: &str) -> &mut Self {
        let bytes = s.as_bytes();
        let len = bytes.len().min(u8::MAX as usize);
        self.u8(len as u8);
        self.buf.extend_from_slice(&bytes[..len]);
        self
    }

    pub fn bytes(&mut self, b: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(b);
        self
    }

    /// The built content, sized exactly to what was written.
    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_roundtrip() {
        let mut w = Writer::new();
        w.u8(7).u16(1000).u32(70_000).string("HELLO.PRG");
        let built = w.into_vec();

        let mut c = Cursor::new(&built);
        assert_eq!(c.u8().unwrap(), 7);
        assert_eq!(c.u16().unwrap(), 1000);
        assert_eq!(c.u32().unwrap(), 70_000);
        assert_eq!(c.string().unwrap(), "HELLO.PRG");
        c.expect_exhausted().unwrap();
    }

    #[test]
    fn short_read_is_bad_request() {
        let mut c = Cursor::new(&[0x01]);
        assert!(c.u16().is_err());
    }

    #[test]
    fn extra_trailing_bytes_rejected() {
        let mut w = Writer::new();
        w.u8(1);
        let mut built = w.into_vec();
        built.push(0xFF);
        let mut c = Cursor::new(&built);
        c.u8().unwrap();
        assert!(c.expect_exhausted().is_err());
    }

    #[test]
    fn string_longer_than_255_is_truncated_on_write() {
        let mut w = Writer::new();
        let long = "A".repeat(300);
        w.string(&long);
        let built = w.into_vec();
        assert_eq!(built[0], 255);
        assert_eq!(built.len(), 256);
    }
}
