//! Primitive wire types of the Minecraft Java protocol.
//!
//! Everything here operates on in-memory buffers via [`bytes::Buf`] and
//! [`bytes::BufMut`]; stream handling lives in [`super::frame`].

use bytes::{Buf, BufMut};

/// Default upper bound for protocol strings (bytes).
pub const MAX_STRING_LEN: usize = 1024 * 1024;

/// Handshake server addresses are capped at 255 characters by the protocol.
pub const MAX_ADDRESS_LEN: usize = 255 * 4;

/// A VarInt never takes more than five bytes on the wire.
pub const MAX_VARINT_LEN: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("varint is too long")]
    VarIntTooLong,
    #[error("need {needed} bytes, only {remaining} remaining")]
    EndOfStream { needed: usize, remaining: usize },
    #[error("string length {len} exceeds max {max}")]
    StringTooLong { len: usize, max: usize },
    #[error("string length is negative")]
    StringLengthNegative,
    #[error("invalid utf-8 in string: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
    #[error("connection closed")]
    Eof,
    #[error("connection closed mid-frame ({missing} bytes missing)")]
    TooFewBytes { missing: usize },
    #[error("frame length {len} exceeds max {max}")]
    FrameTooLarge { len: usize, max: usize },
    #[error("negative frame length {0}")]
    NegativeLength(i32),
    #[error("legacy ping: {field}: {detail}")]
    LegacyFormat { field: &'static str, detail: String },
    #[error("unexpected content: {0}")]
    UnexpectedContent(String),
    #[error("unrecognized packet id {id:#04x} in state {state}")]
    UnrecognizedPacket { state: &'static str, id: i32 },
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = ProtocolError> = std::result::Result<T, E>;

fn ensure(remaining: usize, needed: usize) -> Result<()> {
    if remaining < needed {
        return Err(ProtocolError::EndOfStream { needed, remaining });
    }
    Ok(())
}

/// Reads a VarInt (i32, two's complement, 7 bits per byte).
pub fn read_var_int(buf: &mut impl Buf) -> Result<i32> {
    let mut value: u32 = 0;
    for i in 0..MAX_VARINT_LEN {
        ensure(buf.remaining(), 1)?;
        let b = buf.get_u8();
        value |= ((b & 0x7F) as u32) << (7 * i);
        if b & 0x80 == 0 {
            return Ok(value as i32);
        }
    }
    Err(ProtocolError::VarIntTooLong)
}

/// Decodes a VarInt from the front of `buf` without consuming it.
///
/// Returns `Ok(None)` when more bytes are needed, otherwise the value and the
/// number of bytes it occupies.
pub fn peek_var_int(buf: &[u8]) -> Result<Option<(i32, usize)>> {
    let mut value: u32 = 0;
    for (i, b) in buf.iter().take(MAX_VARINT_LEN).enumerate() {
        value |= ((b & 0x7F) as u32) << (7 * i);
        if b & 0x80 == 0 {
            return Ok(Some((value as i32, i + 1)));
        }
    }
    if buf.len() >= MAX_VARINT_LEN {
        return Err(ProtocolError::VarIntTooLong);
    }
    Ok(None)
}

pub fn write_var_int(buf: &mut impl BufMut, value: i32) {
    let mut v = value as u32;
    loop {
        if v & !0x7F == 0 {
            buf.put_u8(v as u8);
            return;
        }
        buf.put_u8((v as u8 & 0x7F) | 0x80);
        v >>= 7;
    }
}

pub fn var_int_len(value: i32) -> usize {
    let v = value as u32;
    match v {
        0..=0x7F => 1,
        0x80..=0x3FFF => 2,
        0x4000..=0x1F_FFFF => 3,
        0x20_0000..=0x0FFF_FFFF => 4,
        _ => 5,
    }
}

pub fn read_u8(buf: &mut impl Buf) -> Result<u8> {
    ensure(buf.remaining(), 1)?;
    Ok(buf.get_u8())
}

#[allow(dead_code)]
pub fn read_bool(buf: &mut impl Buf) -> Result<bool> {
    match read_u8(buf)? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(ProtocolError::UnexpectedContent(format!(
            "invalid boolean byte {other:#04x}"
        ))),
    }
}

pub fn read_u16(buf: &mut impl Buf) -> Result<u16> {
    ensure(buf.remaining(), 2)?;
    Ok(buf.get_u16())
}

#[allow(dead_code)]
pub fn read_u32(buf: &mut impl Buf) -> Result<u32> {
    ensure(buf.remaining(), 4)?;
    Ok(buf.get_u32())
}

#[allow(dead_code)]
pub fn read_u64(buf: &mut impl Buf) -> Result<u64> {
    ensure(buf.remaining(), 8)?;
    Ok(buf.get_u64())
}

pub fn read_i64(buf: &mut impl Buf) -> Result<i64> {
    ensure(buf.remaining(), 8)?;
    Ok(buf.get_i64())
}

#[allow(dead_code)]
pub fn read_f32(buf: &mut impl Buf) -> Result<f32> {
    ensure(buf.remaining(), 4)?;
    Ok(buf.get_f32())
}

#[allow(dead_code)]
pub fn read_f64(buf: &mut impl Buf) -> Result<f64> {
    ensure(buf.remaining(), 8)?;
    Ok(buf.get_f64())
}

#[allow(dead_code)]
pub fn write_bool(buf: &mut impl BufMut, v: bool) {
    buf.put_u8(v as u8);
}

/// Reads a VarInt-prefixed UTF-8 string of at most `max` bytes.
pub fn read_string(buf: &mut impl Buf, max: usize) -> Result<String> {
    let len = read_var_int(buf)?;
    if len < 0 {
        return Err(ProtocolError::StringLengthNegative);
    }
    let len = len as usize;
    if len > max {
        return Err(ProtocolError::StringTooLong { len, max });
    }
    ensure(buf.remaining(), len)?;
    let raw = buf.copy_to_bytes(len);
    let s = std::str::from_utf8(&raw)?;
    Ok(s.to_owned())
}

pub fn write_string(buf: &mut impl BufMut, s: &str, max: usize) -> Result<()> {
    if s.len() > max {
        return Err(ProtocolError::StringTooLong { len: s.len(), max });
    }
    write_var_int(buf, s.len() as i32);
    buf.put_slice(s.as_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn encode(v: i32) -> Vec<u8> {
        let mut out = BytesMut::new();
        write_var_int(&mut out, v);
        out.to_vec()
    }

    #[test]
    fn var_int_boundaries() {
        let cases: &[(i32, &[u8])] = &[
            (0, &[0x00]),
            (1, &[0x01]),
            (127, &[0x7f]),
            (128, &[0x80, 0x01]),
            (255, &[0xff, 0x01]),
            (25565, &[0xdd, 0xc7, 0x01]),
            (2_097_151, &[0xff, 0xff, 0x7f]),
            (i32::MAX, &[0xff, 0xff, 0xff, 0xff, 0x07]),
            (-1, &[0xff, 0xff, 0xff, 0xff, 0x0f]),
            (i32::MIN, &[0x80, 0x80, 0x80, 0x80, 0x08]),
        ];
        for (v, wire) in cases {
            assert_eq!(encode(*v), *wire, "encode {v}");
            assert_eq!(var_int_len(*v), wire.len(), "len {v}");
            let mut b = &wire[..];
            assert_eq!(read_var_int(&mut b).unwrap(), *v, "decode {v}");
            assert!(b.is_empty());
        }
    }

    #[test]
    fn var_int_sixth_byte_is_too_long() {
        let mut b = &[0x80u8, 0x80, 0x80, 0x80, 0x80, 0x01][..];
        assert!(matches!(read_var_int(&mut b), Err(ProtocolError::VarIntTooLong)));

        assert!(matches!(
            peek_var_int(&[0xff, 0xff, 0xff, 0xff, 0xff]),
            Err(ProtocolError::VarIntTooLong)
        ));
    }

    #[test]
    fn var_int_short_input() {
        let mut b = &[0x80u8, 0x80][..];
        assert!(matches!(
            read_var_int(&mut b),
            Err(ProtocolError::EndOfStream { .. })
        ));
        assert!(peek_var_int(&[0x80, 0x80]).unwrap().is_none());
        assert_eq!(peek_var_int(&[0x80, 0x01, 0xaa]).unwrap(), Some((128, 2)));
    }

    #[test]
    fn string_limits() {
        let mut out = BytesMut::new();
        write_string(&mut out, "lunar.gg", 255).unwrap();
        let mut b = out.freeze();
        assert_eq!(read_string(&mut b, 255).unwrap(), "lunar.gg");

        let mut out = BytesMut::new();
        write_string(&mut out, "abcdef", 16).unwrap();
        let mut b = out.freeze();
        assert!(matches!(
            read_string(&mut b, 3),
            Err(ProtocolError::StringTooLong { len: 6, max: 3 })
        ));

        let mut out = BytesMut::new();
        write_var_int(&mut out, -1);
        let mut b = out.freeze();
        assert!(matches!(
            read_string(&mut b, 16),
            Err(ProtocolError::StringLengthNegative)
        ));

        let mut out = BytesMut::new();
        assert!(write_string(&mut out, "too long", 4).is_err());
        assert!(out.is_empty());
    }

    #[test]
    fn string_rejects_invalid_utf8() {
        let mut b = &[0x02u8, 0xc3, 0x28][..];
        assert!(matches!(
            read_string(&mut b, 16),
            Err(ProtocolError::InvalidUtf8(_))
        ));
    }

    #[test]
    fn fixed_width_is_big_endian() {
        let mut b = &[0x63u8, 0xdd, 0, 0, 0, 0, 0, 0, 0, 42, 1][..];
        assert_eq!(read_u16(&mut b).unwrap(), 25565);
        assert_eq!(read_i64(&mut b).unwrap(), 42);
        assert!(read_bool(&mut b).unwrap());
        assert!(matches!(read_u8(&mut b), Err(ProtocolError::EndOfStream { needed: 1, remaining: 0 })));
    }
}
