pub mod codec;
pub mod frame;
pub mod legacy;
pub mod packet;
pub mod status;

pub use codec::ProtocolError;
pub use frame::{Frame, FrameReader, Initial};
pub use legacy::{LegacyKick, LegacyQuery};
pub use packet::{
    Disconnect, Handshake, LoginStart, NextState, Pong, Serverbound, State, StatusResponse,
    encode_frame,
};
pub use status::ServerStatus;
