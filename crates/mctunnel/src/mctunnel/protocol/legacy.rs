//! Pre-Netty server list ping.
//!
//! 1.6 request layout:
//! `FE 01 FA <u16 11> "MC|PingHost"(UTF-16BE) <u16 rest> <u8 proto> <u16 n> host(UTF-16BE, n chars) <i32 port>`
//!
//! 1.4 and 1.5 clients stop after `FE 01`; beta 1.8 to 1.3 send a bare `FE`.

use bytes::{BufMut, Bytes, BytesMut};

use super::codec::{ProtocolError, Result};

pub const LEGACY_PING_ID: u8 = 0xFE;
pub const LEGACY_KICK_ID: u8 = 0xFF;

const PLUGIN_MESSAGE_ID: u8 = 0xFA;
const PING_HOST_CHANNEL: &str = "MC|PingHost";
const HEADER_LEN: usize = 3 + 2 + PING_HOST_CHANNEL.len() * 2 + 2;

/// A server list query older than 1.6. It carries no hostname.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyQuery {
    /// Bare `FE`; answered with the `motd§online§max` kick.
    Beta,
    /// `FE 01`; understands the `§1` kick.
    WithPayload,
}

impl LegacyQuery {
    /// Classifies a buffered prefix that stopped growing.
    pub fn from_prefix(buf: &[u8]) -> Option<LegacyQuery> {
        match buf {
            [LEGACY_PING_ID] => Some(LegacyQuery::Beta),
            [LEGACY_PING_ID, 0x01] => Some(LegacyQuery::WithPayload),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyPing {
    pub protocol_version: u8,
    pub server_address: String,
    pub server_port: u16,
}

fn bad(field: &'static str, detail: impl Into<String>) -> ProtocolError {
    ProtocolError::LegacyFormat {
        field,
        detail: detail.into(),
    }
}

fn be_u16(b: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([b[at], b[at + 1]])
}

fn utf16be(field: &'static str, b: &[u8]) -> Result<String> {
    let units: Vec<u16> = b.chunks_exact(2).map(|c| u16::from_be_bytes([c[0], c[1]])).collect();
    String::from_utf16(&units).map_err(|e| bad(field, e.to_string()))
}

impl LegacyPing {
    /// Parses a legacy ping from the front of `buf`.
    ///
    /// Returns `Ok(None)` while the request is still incomplete. Fields that are
    /// already present are validated eagerly so garbage fails fast.
    pub fn parse(buf: &[u8]) -> Result<Option<(LegacyPing, usize)>> {
        if let Some(&b) = buf.first() {
            if b != LEGACY_PING_ID {
                return Err(bad("packet id", format!("expected 0xfe, got {b:#04x}")));
            }
        }
        if let Some(&b) = buf.get(1) {
            if b != 0x01 {
                return Err(bad("payload", format!("expected 0x01, got {b:#04x}")));
            }
        }
        if let Some(&b) = buf.get(2) {
            if b != PLUGIN_MESSAGE_ID {
                return Err(bad("plugin message id", format!("expected 0xfa, got {b:#04x}")));
            }
        }
        if buf.len() >= 5 {
            let n = be_u16(buf, 3);
            if n as usize != PING_HOST_CHANNEL.len() {
                return Err(bad("channel length", format!("expected 11, got {n}")));
            }
        }
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let channel = utf16be("channel", &buf[5..5 + PING_HOST_CHANNEL.len() * 2])?;
        if channel != PING_HOST_CHANNEL {
            return Err(bad("channel", format!("expected {PING_HOST_CHANNEL}, got {channel:?}")));
        }

        let rest_len = be_u16(buf, HEADER_LEN - 2) as usize;
        let total = HEADER_LEN + rest_len;
        if buf.len() < total {
            return Ok(None);
        }
        let rest = &buf[HEADER_LEN..total];

        if rest.len() < 3 {
            return Err(bad("hostname length", "truncated"));
        }
        let protocol_version = rest[0];
        let host_chars = be_u16(rest, 1) as usize;
        let host_end = 3 + host_chars * 2;
        if rest.len() < host_end {
            return Err(bad(
                "hostname",
                format!("declared {host_chars} chars, {} bytes available", rest.len() - 3),
            ));
        }
        let server_address = utf16be("hostname", &rest[3..host_end])?;

        if rest.len() < host_end + 4 {
            return Err(bad("port", "truncated"));
        }
        let port = i32::from_be_bytes([
            rest[host_end],
            rest[host_end + 1],
            rest[host_end + 2],
            rest[host_end + 3],
        ]);
        let server_port = u16::try_from(port).map_err(|_| bad("port", format!("out of range: {port}")))?;

        Ok(Some((
            LegacyPing {
                protocol_version,
                server_address,
                server_port,
            },
            total,
        )))
    }

    #[cfg(test)]
    pub fn encode(&self) -> Bytes {
        let mut rest = BytesMut::new();
        rest.put_u8(self.protocol_version);
        let host: Vec<u16> = self.server_address.encode_utf16().collect();
        rest.put_u16(host.len() as u16);
        for u in host {
            rest.put_u16(u);
        }
        rest.put_i32(self.server_port as i32);

        let mut out = BytesMut::with_capacity(HEADER_LEN + rest.len());
        out.put_slice(&[LEGACY_PING_ID, 0x01, PLUGIN_MESSAGE_ID]);
        out.put_u16(PING_HOST_CHANNEL.len() as u16);
        for u in PING_HOST_CHANNEL.encode_utf16() {
            out.put_u16(u);
        }
        out.put_u16(rest.len() as u16);
        out.put_slice(&rest);
        out.freeze()
    }
}

/// The `0xFF` kick packet old clients expect as a server list answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyKick {
    pub protocol_version: i32,
    pub version_name: String,
    pub motd: String,
    pub online: i32,
    pub max_players: i32,
}

impl LegacyKick {
    /// The `§1` layout read by 1.4 and newer clients.
    pub fn encode(&self) -> Result<Bytes> {
        kick_frame(&format!(
            "\u{a7}1\0{}\0{}\0{}\0{}\0{}",
            self.protocol_version, self.version_name, self.motd, self.online, self.max_players
        ))
    }

    /// The `motd§online§max` layout read by beta 1.8 to 1.3.
    pub fn encode_beta(&self) -> Result<Bytes> {
        kick_frame(&format!(
            "{}\u{a7}{}\u{a7}{}",
            self.motd, self.online, self.max_players
        ))
    }

    pub fn encode_for(&self, query: LegacyQuery) -> Result<Bytes> {
        match query {
            LegacyQuery::Beta => self.encode_beta(),
            LegacyQuery::WithPayload => self.encode(),
        }
    }
}

fn kick_frame(text: &str) -> Result<Bytes> {
    let units: Vec<u16> = text.encode_utf16().collect();
    let len = u16::try_from(units.len()).map_err(|_| ProtocolError::StringTooLong {
        len: units.len(),
        max: u16::MAX as usize,
    })?;
    let mut out = BytesMut::with_capacity(3 + units.len() * 2);
    out.put_u8(LEGACY_KICK_ID);
    out.put_u16(len);
    for u in units {
        out.put_u16(u);
    }
    Ok(out.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> LegacyPing {
        LegacyPing {
            protocol_version: 74,
            server_address: "mc.example.net".into(),
            server_port: 25565,
        }
    }

    #[test]
    fn parses_complete_request() {
        let wire = sample().encode();
        let (ping, used) = LegacyPing::parse(&wire).unwrap().unwrap();
        assert_eq!(ping, sample());
        assert_eq!(used, wire.len());
    }

    #[test]
    fn incomplete_request_needs_more() {
        let wire = sample().encode();
        for cut in [1, 4, 20, HEADER_LEN, wire.len() - 1] {
            assert!(LegacyPing::parse(&wire[..cut]).unwrap().is_none(), "cut at {cut}");
        }
    }

    #[test]
    fn bad_fields_are_named() {
        let err = LegacyPing::parse(&[0xFE, 0x02]).unwrap_err();
        assert!(matches!(err, ProtocolError::LegacyFormat { field: "payload", .. }));

        let err = LegacyPing::parse(&[0xFE, 0x01, 0xFB]).unwrap_err();
        assert!(matches!(err, ProtocolError::LegacyFormat { field: "plugin message id", .. }));

        let err = LegacyPing::parse(&[0xFE, 0x01, 0xFA, 0x00, 0x0C]).unwrap_err();
        assert!(matches!(err, ProtocolError::LegacyFormat { field: "channel length", .. }));

        let mut wire = sample().encode().to_vec();
        wire[6] = b'X';
        let err = LegacyPing::parse(&wire).unwrap_err();
        assert!(matches!(err, ProtocolError::LegacyFormat { field: "channel", .. }));
    }

    fn kick(motd: &str) -> LegacyKick {
        LegacyKick {
            protocol_version: 127,
            version_name: "1.20".into(),
            motd: motd.into(),
            online: 0,
            max_players: 20,
        }
    }

    #[test]
    fn kick_layout() {
        let wire = kick("hi").encode().unwrap();
        assert_eq!(wire[0], 0xFF);
        let units = u16::from_be_bytes([wire[1], wire[2]]) as usize;
        assert_eq!(wire.len(), 3 + units * 2);
        let text = utf16be("kick", &wire[3..]).unwrap();
        assert_eq!(text, "\u{a7}1\u{0}127\u{0}1.20\u{0}hi\u{0}0\u{0}20");
    }

    #[test]
    fn beta_kick_layout() {
        let wire = kick("hi").encode_for(LegacyQuery::Beta).unwrap();
        assert_eq!(wire[0], 0xFF);
        let text = utf16be("kick", &wire[3..]).unwrap();
        assert_eq!(text, "hi\u{a7}0\u{a7}20");
    }

    #[test]
    fn oversized_kick_is_rejected() {
        let err = kick(&"x".repeat(u16::MAX as usize)).encode().unwrap_err();
        assert!(matches!(err, ProtocolError::StringTooLong { max: 65535, .. }));
    }

    #[test]
    fn query_prefixes() {
        assert_eq!(LegacyQuery::from_prefix(&[0xFE]), Some(LegacyQuery::Beta));
        assert_eq!(LegacyQuery::from_prefix(&[0xFE, 0x01]), Some(LegacyQuery::WithPayload));
        assert_eq!(LegacyQuery::from_prefix(&[0xFE, 0x01, 0xFA]), None);
    }
}
