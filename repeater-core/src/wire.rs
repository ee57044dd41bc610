//! Framing: fixed 48-byte little-endian header (bincode fixint) + payload.

use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::identity::MacAddr;
use crate::protocol::{FrameType, MAGIC_HEAD};

pub const HEADER_LEN: usize = 48;

/// On-wire header. Field order and widths match the repeater's packed C struct.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct FrameHeader {
    pub magic: u16,
    pub frame_type: u16,
    pub frame_size: u32,
    pub timestamp_ms: u64,
    pub random: [u8; 16],
    pub mac: [u8; 6],
    pub reserved: [u8; 10],
}

/// One decoded frame.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Vec<u8>,
}

impl Frame {
    /// New frame stamped with the current time; `random` zeroed.
    pub fn new(frame_type: FrameType, mac: MacAddr, payload: Vec<u8>) -> Self {
        let header = FrameHeader {
            magic: MAGIC_HEAD,
            frame_type: frame_type.as_u16(),
            frame_size: payload.len() as u32,
            timestamp_ms: now_ms(),
            random: [0u8; 16],
            mac: *mac.as_bytes(),
            reserved: [0u8; 10],
        };
        Self { header, payload }
    }

    pub fn with_random(mut self, random: [u8; 16]) -> Self {
        self.header.random = random;
        self
    }

    pub fn frame_type(&self) -> Result<FrameType, u16> {
        FrameType::try_from(self.header.frame_type)
    }

    pub fn mac(&self) -> MacAddr {
        MacAddr(self.header.mac)
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Encode header + payload. Fails if payload exceeds `max_payload`.
pub fn encode_frame(frame: &Frame, max_payload: usize) -> Result<Vec<u8>, FrameEncodeError> {
    if frame.payload.len() > max_payload || frame.payload.len() > u32::MAX as usize {
        return Err(FrameEncodeError::TooLarge(frame.payload.len()));
    }
    let mut header = frame.header.clone();
    header.frame_size = frame.payload.len() as u32;
    let head = bincode::serialize(&header).map_err(FrameEncodeError::Encode)?;
    debug_assert_eq!(head.len(), HEADER_LEN);
    let mut out = Vec::with_capacity(HEADER_LEN + frame.payload.len());
    out.extend_from_slice(&head);
    out.extend_from_slice(&frame.payload);
    Ok(out)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("payload too large: {0} bytes")]
    TooLarge(usize),
}

/// Decode one frame from the front of `bytes`. Returns the frame and bytes consumed.
/// `NeedMore` means the buffer holds only part of a frame; call again after reading more.
pub fn decode_frame(bytes: &[u8], max_payload: usize) -> Result<(Frame, usize), FrameDecodeError> {
    if bytes.len() < HEADER_LEN {
        return Err(FrameDecodeError::NeedMore);
    }
    let header: FrameHeader =
        bincode::deserialize(&bytes[..HEADER_LEN]).map_err(FrameDecodeError::Decode)?;
    if header.magic != MAGIC_HEAD {
        return Err(FrameDecodeError::BadMagic(header.magic));
    }
    let len = header.frame_size as usize;
    if len > max_payload {
        return Err(FrameDecodeError::TooLarge(len));
    }
    if bytes.len() < HEADER_LEN + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let payload = bytes[HEADER_LEN..HEADER_LEN + len].to_vec();
    Ok((Frame { header, payload }, HEADER_LEN + len))
}

#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("bad magic 0x{0:04x}")]
    BadMagic(u16),
    #[error("frame too large: {0} bytes")]
    TooLarge(usize),
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}

/// Failure while pulling a frame off a stream.
#[derive(Debug, thiserror::Error)]
pub enum FrameReadError {
    #[error("peer closed the connection")]
    Closed,
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Decode(FrameDecodeError),
}

/// Read one frame. Bytes already received live in `pending`, so dropping this
/// future (timeout, close signal) never loses data.
pub async fn read_frame<R>(
    reader: &mut R,
    pending: &mut BytesMut,
    max_payload: usize,
) -> Result<Frame, FrameReadError>
where
    R: AsyncRead + Unpin,
{
    loop {
        match decode_frame(pending, max_payload) {
            Ok((frame, used)) => {
                pending.advance(used);
                return Ok(frame);
            }
            Err(FrameDecodeError::NeedMore) => {}
            Err(e) => return Err(FrameReadError::Decode(e)),
        }
        pending.reserve(HEADER_LEN);
        if reader.read_buf(pending).await? == 0 {
            return Err(FrameReadError::Closed);
        }
    }
}

/// Encode and write one frame, flushing afterwards.
pub async fn write_frame<W>(
    writer: &mut W,
    frame: &Frame,
    max_payload: usize,
) -> Result<(), FrameWriteError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode_frame(frame, max_payload)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum FrameWriteError {
    #[error(transparent)]
    Encode(#[from] FrameEncodeError),
    #[error("write failed: {0}")]
    Io(#[from] std::io::Error),
}
