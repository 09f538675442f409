//! Typed packets for the handful of messages the tunnel inspects or answers.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::codec::{self, MAX_ADDRESS_LEN, MAX_STRING_LEN, ProtocolError, Result};
use super::frame::Frame;
use super::status::ServerStatus;

/// Player names are at most 16 characters; allow for multi-byte UTF-8.
pub const MAX_NAME_LEN: usize = 16 * 4;

pub trait Packet: Sized {
    const ID: i32;

    fn id(&self) -> i32 {
        Self::ID
    }

    fn encode(&self, buf: &mut impl BufMut) -> Result<()>;

    fn decode(buf: &mut impl Buf) -> Result<Self>;
}

/// Serializes `packet` into a complete length-prefixed frame.
pub fn encode_frame<P: Packet>(packet: &P) -> Result<Bytes> {
    let mut body = BytesMut::new();
    codec::write_var_int(&mut body, packet.id());
    packet.encode(&mut body)?;

    let mut out = BytesMut::with_capacity(body.len() + codec::var_int_len(body.len() as i32));
    codec::write_var_int(&mut out, body.len() as i32);
    out.put_slice(&body);
    Ok(out.freeze())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Handshaking,
    Status,
    Login,
}

impl State {
    pub fn as_str(self) -> &'static str {
        match self {
            State::Handshaking => "handshaking",
            State::Status => "status",
            State::Login => "login",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextState {
    Status,
    Login,
}

impl NextState {
    pub fn from_var_int(v: i32) -> Result<Self> {
        match v {
            1 => Ok(NextState::Status),
            2 => Ok(NextState::Login),
            other => Err(ProtocolError::UnexpectedContent(format!(
                "invalid next state {other}"
            ))),
        }
    }

    pub fn as_var_int(self) -> i32 {
        match self {
            NextState::Status => 1,
            NextState::Login => 2,
        }
    }
}

/// Forge clients append a marker to the handshake address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModMarker {
    Fml,
    Fml2,
    Fml3,
}

impl ModMarker {
    const ALL: [ModMarker; 3] = [ModMarker::Fml, ModMarker::Fml2, ModMarker::Fml3];

    pub fn suffix(self) -> &'static str {
        match self {
            ModMarker::Fml => "\0FML\0",
            ModMarker::Fml2 => "\0FML2\0",
            ModMarker::Fml3 => "\0FML3\0",
        }
    }

    fn strip(address: &str) -> (&str, Option<ModMarker>) {
        for m in Self::ALL {
            if let Some(host) = address.strip_suffix(m.suffix()) {
                return (host, Some(m));
            }
        }
        (address, None)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol_version: i32,
    /// Address with any mod marker removed.
    pub server_address: String,
    pub server_port: u16,
    pub next_state: NextState,
    pub mod_marker: Option<ModMarker>,
}

impl Packet for Handshake {
    const ID: i32 = 0x00;

    fn encode(&self, buf: &mut impl BufMut) -> Result<()> {
        codec::write_var_int(buf, self.protocol_version);
        match self.mod_marker {
            Some(m) => codec::write_string(
                buf,
                &format!("{}{}", self.server_address, m.suffix()),
                MAX_ADDRESS_LEN,
            )?,
            None => codec::write_string(buf, &self.server_address, MAX_ADDRESS_LEN)?,
        }
        buf.put_u16(self.server_port);
        codec::write_var_int(buf, self.next_state.as_var_int());
        Ok(())
    }

    fn decode(buf: &mut impl Buf) -> Result<Self> {
        let protocol_version = codec::read_var_int(buf)?;
        let raw_address = codec::read_string(buf, MAX_ADDRESS_LEN)?;
        let server_port = codec::read_u16(buf)?;
        let next_state = NextState::from_var_int(codec::read_var_int(buf)?)?;
        let (host, mod_marker) = ModMarker::strip(&raw_address);
        Ok(Handshake {
            protocol_version,
            server_address: host.to_string(),
            server_port,
            next_state,
            mod_marker,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRequest;

impl Packet for StatusRequest {
    const ID: i32 = 0x00;

    fn encode(&self, _buf: &mut impl BufMut) -> Result<()> {
        Ok(())
    }

    fn decode(_buf: &mut impl Buf) -> Result<Self> {
        Ok(StatusRequest)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusResponse {
    pub status: ServerStatus,
}

impl Packet for StatusResponse {
    const ID: i32 = 0x00;

    fn encode(&self, buf: &mut impl BufMut) -> Result<()> {
        let json = serde_json::to_string(&self.status)?;
        codec::write_string(buf, &json, MAX_STRING_LEN)
    }

    fn decode(buf: &mut impl Buf) -> Result<Self> {
        let json = codec::read_string(buf, MAX_STRING_LEN)?;
        Ok(StatusResponse {
            status: serde_json::from_str(&json)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ping {
    pub payload: i64,
}

impl Packet for Ping {
    const ID: i32 = 0x01;

    fn encode(&self, buf: &mut impl BufMut) -> Result<()> {
        buf.put_i64(self.payload);
        Ok(())
    }

    fn decode(buf: &mut impl Buf) -> Result<Self> {
        Ok(Ping {
            payload: codec::read_i64(buf)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pong {
    pub payload: i64,
}

impl Packet for Pong {
    const ID: i32 = 0x01;

    fn encode(&self, buf: &mut impl BufMut) -> Result<()> {
        buf.put_i64(self.payload);
        Ok(())
    }

    fn decode(buf: &mut impl Buf) -> Result<Self> {
        Ok(Pong {
            payload: codec::read_i64(buf)?,
        })
    }
}

/// Only the name is decoded; newer clients send a UUID and more after it,
/// which stay in the raw frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginStart {
    pub name: String,
}

impl Packet for LoginStart {
    const ID: i32 = 0x00;

    fn encode(&self, buf: &mut impl BufMut) -> Result<()> {
        codec::write_string(buf, &self.name, MAX_NAME_LEN)
    }

    fn decode(buf: &mut impl Buf) -> Result<Self> {
        Ok(LoginStart {
            name: codec::read_string(buf, MAX_NAME_LEN)?,
        })
    }
}

/// Login-state disconnect. `reason` is a JSON text component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnect {
    pub reason: String,
}

impl Disconnect {
    pub fn text(message: &str) -> Self {
        Disconnect {
            reason: serde_json::json!({ "text": message }).to_string(),
        }
    }
}

impl Packet for Disconnect {
    const ID: i32 = 0x00;

    fn encode(&self, buf: &mut impl BufMut) -> Result<()> {
        codec::write_string(buf, &self.reason, MAX_STRING_LEN)
    }

    fn decode(buf: &mut impl Buf) -> Result<Self> {
        Ok(Disconnect {
            reason: codec::read_string(buf, MAX_STRING_LEN)?,
        })
    }
}

/// Client-to-server packets the tunnel understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Serverbound {
    Handshake(Handshake),
    StatusRequest(StatusRequest),
    Ping(Ping),
    LoginStart(LoginStart),
}

impl Serverbound {
    pub fn decode(state: State, frame: &Frame) -> Result<Self> {
        let mut body = frame.body.clone();
        match (state, frame.id) {
            (State::Handshaking, Handshake::ID) => Handshake::decode(&mut body).map(Self::Handshake),
            (State::Status, StatusRequest::ID) => {
                StatusRequest::decode(&mut body).map(Self::StatusRequest)
            }
            (State::Status, Ping::ID) => Ping::decode(&mut body).map(Self::Ping),
            (State::Login, LoginStart::ID) => LoginStart::decode(&mut body).map(Self::LoginStart),
            (state, id) => Err(ProtocolError::UnrecognizedPacket {
                state: state.as_str(),
                id,
            }),
        }
    }
}

/// Server-to-client packets the tunnel produces.
#[allow(dead_code)]
#[derive(Debug, Clone, PartialEq)]
pub enum Clientbound {
    StatusResponse(StatusResponse),
    Pong(Pong),
    Disconnect(Disconnect),
}

impl Clientbound {
    #[allow(dead_code)]
    pub fn decode(state: State, frame: &Frame) -> Result<Self> {
        let mut body = frame.body.clone();
        match (state, frame.id) {
            (State::Status, StatusResponse::ID) => {
                StatusResponse::decode(&mut body).map(Self::StatusResponse)
            }
            (State::Status, Pong::ID) => Pong::decode(&mut body).map(Self::Pong),
            (State::Login, Disconnect::ID) => Disconnect::decode(&mut body).map(Self::Disconnect),
            (state, id) => Err(ProtocolError::UnrecognizedPacket {
                state: state.as_str(),
                id,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mctunnel::protocol::frame::{DEFAULT_MAX_FRAME_LEN, FrameReader};

    async fn reframe(wire: &[u8]) -> Frame {
        FrameReader::new(wire, DEFAULT_MAX_FRAME_LEN)
            .read_frame()
            .await
            .unwrap()
    }

    fn handshake(addr: &str, marker: Option<ModMarker>) -> Handshake {
        Handshake {
            protocol_version: 47,
            server_address: addr.into(),
            server_port: 25565,
            next_state: NextState::Login,
            mod_marker: marker,
        }
    }

    #[tokio::test]
    async fn handshake_round_trip() {
        let h = handshake("lunar.gg", None);
        let wire = encode_frame(&h).unwrap();
        let f = reframe(&wire).await;
        assert_eq!(f.id, 0);
        assert_eq!(
            Serverbound::decode(State::Handshaking, &f).unwrap(),
            Serverbound::Handshake(h)
        );
    }

    #[test]
    fn handshake_strips_mod_markers() {
        let cases = [
            ("server.com.tunnel.example.dev\0FML\0", Some(ModMarker::Fml)),
            ("server.com.tunnel.example.dev\0FML2\0", Some(ModMarker::Fml2)),
            ("server.com.tunnel.example.dev\0FML3\0", Some(ModMarker::Fml3)),
            ("server.com.tunnel.example.dev", None),
        ];
        for (raw, marker) in cases {
            let mut body = BytesMut::new();
            codec::write_var_int(&mut body, 47);
            codec::write_string(&mut body, raw, MAX_ADDRESS_LEN).unwrap();
            body.put_u16(25565);
            codec::write_var_int(&mut body, 2);

            let h = Handshake::decode(&mut body.freeze()).unwrap();
            assert_eq!(h.server_address, "server.com.tunnel.example.dev", "{raw:?}");
            assert_eq!(h.mod_marker, marker, "{raw:?}");

            // marker survives a re-encode
            let mut again = BytesMut::new();
            h.encode(&mut again).unwrap();
            assert_eq!(Handshake::decode(&mut again.freeze()).unwrap(), h);
        }
    }

    #[test]
    fn handshake_rejects_unknown_next_state() {
        let mut body = BytesMut::new();
        codec::write_var_int(&mut body, 47);
        codec::write_string(&mut body, "lunar.gg", MAX_ADDRESS_LEN).unwrap();
        body.put_u16(25565);
        codec::write_var_int(&mut body, 5);
        let err = Handshake::decode(&mut body.freeze()).unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedContent(_)), "{err}");
    }

    #[tokio::test]
    async fn login_start_ignores_trailing_fields() {
        let mut body = BytesMut::new();
        codec::write_var_int(&mut body, LoginStart::ID);
        codec::write_string(&mut body, "Alice", MAX_NAME_LEN).unwrap();
        body.put_u128(0xdead_beef);
        let mut wire = BytesMut::new();
        codec::write_var_int(&mut wire, body.len() as i32);
        wire.put_slice(&body);

        let f = reframe(&wire).await;
        assert_eq!(
            Serverbound::decode(State::Login, &f).unwrap(),
            Serverbound::LoginStart(LoginStart {
                name: "Alice".into()
            })
        );
    }

    #[tokio::test]
    async fn dispatch_depends_on_state() {
        let wire = encode_frame(&Ping { payload: 99 }).unwrap();
        let f = reframe(&wire).await;
        assert_eq!(
            Serverbound::decode(State::Status, &f).unwrap(),
            Serverbound::Ping(Ping { payload: 99 })
        );
        let err = Serverbound::decode(State::Login, &f).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::UnrecognizedPacket { state: "login", id: 1 }
        ));
    }

    #[tokio::test]
    async fn status_response_carries_json() {
        let status = ServerStatus::new("mctunnel", 763, 20, "welcome");
        let wire = encode_frame(&StatusResponse {
            status: status.clone(),
        })
        .unwrap();
        let f = reframe(&wire).await;
        match Clientbound::decode(State::Status, &f).unwrap() {
            Clientbound::StatusResponse(r) => assert_eq!(r.status, status),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn disconnect_wraps_text_component() {
        let wire = encode_frame(&Disconnect::text("backend \"down\"")).unwrap();
        let f = reframe(&wire).await;
        let Clientbound::Disconnect(d) = Clientbound::decode(State::Login, &f).unwrap() else {
            panic!("expected disconnect");
        };
        let v: serde_json::Value = serde_json::from_str(&d.reason).unwrap();
        assert_eq!(v["text"], "backend \"down\"");
    }
}
