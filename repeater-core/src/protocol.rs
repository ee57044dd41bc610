//! Repeater wire protocol: frame types, magic, handshake literals and limits.

/// Magic value carried in the first two bytes of every frame header.
pub const MAGIC_HEAD: u16 = 0xAF55;

/// TCP port the repeater accepts binding handshakes on.
pub const DEFAULT_BIND_PORT: u16 = 1600;

/// Handshake frames are small; anything larger is treated as hostile.
pub const MAX_HELLO_PAYLOAD: usize = 255;

/// Default ceiling for one data frame payload (ciphertext bytes).
pub const DEFAULT_MAX_PAYLOAD: usize = 64 * 1024;

/// Plaintext of the ClientHello payload.
pub const CLIENT_HELLO: &[u8] = b"client hello";
/// Plaintext the server must answer with.
pub const SERVER_HELLO: &[u8] = b"server hello";
/// Plaintext of the final acknowledgement.
pub const SERVER_HELLO_ACK: &[u8] = b"server hello ack";

/// Frame types. Values are fixed by the deployed repeater firmware; `Data` is
/// the post-bind encrypted channel.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
#[repr(u16)]
pub enum FrameType {
    ClientHello = 0,
    ServerHello = 1,
    ServerHelloAck = 2,
    Data = 3,
}

impl FrameType {
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

impl TryFrom<u16> for FrameType {
    type Error = u16;

    fn try_from(v: u16) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(FrameType::ClientHello),
            1 => Ok(FrameType::ServerHello),
            2 => Ok(FrameType::ServerHelloAck),
            3 => Ok(FrameType::Data),
            other => Err(other),
        }
    }
}
