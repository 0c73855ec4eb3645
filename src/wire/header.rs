//! Fixed 10-byte request/response header, per `spec.md` §3-§4.4.

use byteorder::{ByteOrder, LittleEndian};

use crate::status::Status;

/// Magic prefix identifying a W64F frame.
pub const MAGIC: [u8; 4] = *b"W64F";
/// Only wire version understood by this server.
pub const VERSION: u8 = 1;
/// Header size in bytes: magic(4) + version(1) + opcode(1) + flags(1) + reserved(1) + len(2).
pub const HEADER_LEN: usize = 10;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HeaderError {
    TooShort,
    BadMagic,
    BadVersion,
    BadReserved,
    LengthOverflow,
}

/// A parsed request header plus a borrow of its payload slice.
pub struct Request<'a> {
    pub opcode: u8,
    pub flags: u8,
    pub payload: &'a [u8],
}

/// Parses the 10-byte header and slices out the declared payload.
///
/// Trailing bytes beyond `payload_len` are tolerated and trimmed (firmware
/// clients are known to pad bodies); `max_payload` bounds the declared
/// length against server policy, not just the buffer length.
pub fn parse(buf: &[u8], max_payload: u16) -> Result<Request<'_>, HeaderError> {
    if buf.len() < HEADER_LEN {
        return Err(HeaderError::TooShort);
    }
    if buf[0..4] != MAGIC {
        return Err(HeaderError::BadMagic);
    }
    if buf[4] != VERSION {
        return Err(HeaderError::BadVersion);
    }
    let opcode = buf[5];
    let flags = buf[6];
    if buf[7] != 0 {
        return Err(HeaderError::BadReserved);
    }
    let payload_len = LittleEndian::read_u16(&buf[8..10]);
    if payload_len > max_payload {
        return Err(HeaderError::LengthOverflow);
    }
    let end = HEADER_LEN + payload_len as usize;
    if buf.len() < end {
        return Err(HeaderError::TooShort);
    }
    Ok(Request { opcode, flags, payload: &buf[HEADER_LEN..end] })
}

/// Builds a response frame: header echoing `opcode` (or `0xFF` when the
/// request header itself failed to parse) with `status` as the flags byte,
/// followed by `payload`.
pub fn build_response(opcode: u8, status: Status, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&MAGIC);
    out.push(VERSION);
    out.push(opcode);
    out.push(status.to_byte());
    out.push(0);
    let mut len_buf = [0u8; 2];
    LittleEndian::write_u16(&mut len_buf, payload.len() as u16);
    out.extend_from_slice(&len_buf);
    out.extend_from_slice(payload);
    out
}

/// The opcode byte to use in a response header when the request header
/// itself could not be parsed.
pub const UNPARSEABLE_OPCODE: u8 = 0xFF;

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(opcode: u8, flags: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&MAGIC);
        out.push(VERSION);
        out.push(opcode);
        out.push(flags);
        out.push(0);
        let mut len_buf = [0u8; 2];
        LittleEndian::write_u16(&mut len_buf, payload.len() as u16);
        out.extend_from_slice(&len_buf);
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn roundtrip_identity() {
        let payload = [1, 2, 3, 4, 5];
        let raw = frame(0x0E, 0x00, &payload);
        let parsed = parse(&raw, 4096).unwrap();
        assert_eq!(parsed.opcode, 0x0E);
        assert_eq!(parsed.flags, 0x00);
        assert_eq!(parsed.payload, &payload);
    }

    #[test]
    fn caps_request_header() {
        let raw = [b'W', b'6', b'4', b'F', 0x01, 0x0E, 0x00, 0x00, 0x00, 0x00];
        let parsed = parse(&raw, 4096).unwrap();
        assert_eq!(parsed.opcode, 0x0E);
        assert!(parsed.payload.is_empty());
    }

    #[test]
    fn rejects_bad_magic() {
        let mut raw = frame(0x01, 0, &[]);
        raw[0] = b'X';
        assert_eq!(parse(&raw, 4096), Err(HeaderError::BadMagic));
    }

    #[test]
    fn rejects_bad_version() {
        let mut raw = frame(0x01, 0, &[]);
        raw[4] = 2;
        assert_eq!(parse(&raw, 4096), Err(HeaderError::BadVersion));
    }

    #[test]
    fn rejects_nonzero_reserved() {
        let mut raw = frame(0x01, 0, &[]);
        raw[7] = 1;
        assert_eq!(parse(&raw, 4096), Err(HeaderError::BadReserved));
    }

    #[test]
    fn tolerates_trailing_padding() {
        let mut raw = frame(0x01, 0, &[9, 9]);
        raw.extend_from_slice(&[0, 0, 0, 0]);
        let parsed = parse(&raw, 4096).unwrap();
        assert_eq!(parsed.payload, &[9, 9]);
    }

    #[test]
    fn rejects_length_over_policy_max() {
        let raw = frame(0x01, 0, &[0u8; 8]);
        assert_eq!(parse(&raw, 4), Err(HeaderError::LengthOverflow));
    }

    #[test]
    fn response_header_echoes_opcode_and_status() {
        let resp = build_response(0x0E, Status::Ok, &[1, 2, 3]);
        assert_eq!(&resp[0..4], &MAGIC);
        assert_eq!(resp[4], VERSION);
        assert_eq!(resp[5], 0x0E);
        assert_eq!(resp[6], Status::Ok.to_byte());
        assert_eq!(&resp[HEADER_LEN..], &[1, 2, 3]);
    }

    #[test]
    fn unparseable_header_uses_0xff_echo() {
        let resp = build_response(UNPARSEABLE_OPCODE, Status::BadRequest, &[]);
        assert_eq!(resp[5], 0xFF);
    }
}
