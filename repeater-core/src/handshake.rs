//! Binding handshake ("hello"). Runs on its own short-lived connection to the
//! repeater's bind port and yields the key material for the data channel.
//!
//! Exchange: ClientHello (IV in `random`, payload `enc("client hello")`) ->
//! ServerHello (`enc("server hello")`) -> ServerHelloAck (`enc("server hello ack")`).

use std::fmt;

use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::crypto::{generate_iv, AesKey, KeyMaterial};
use crate::identity::{MacAddr, MasterSecret};
use crate::protocol::{FrameType, CLIENT_HELLO, MAX_HELLO_PAYLOAD, SERVER_HELLO, SERVER_HELLO_ACK};
use crate::session::{connect_stream, TransportError};
use crate::wire::{self, Frame, FrameDecodeError, FrameReadError, FrameWriteError};

/// Everything one bind attempt needs. Built per call, never persisted.
#[derive(Debug, Clone)]
pub struct HelloRequest {
    pub server: String,
    pub mac: MacAddr,
    pub master: MasterSecret,
    pub proposed_key: AesKey,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum HandshakeState {
    Idle,
    SendingHello,
    AwaitingResponse,
    Bound,
    Failed,
}

/// Why a server answer was not accepted as a valid hello.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RejectReason {
    BadMagic(u16),
    UnexpectedFrame(u16),
    Oversized(usize),
    EmptyHello,
    Undecryptable,
    HelloMismatch,
}

impl RejectReason {
    /// Stable numeric code for hosts that log or forward the reason.
    pub fn code(&self) -> u16 {
        match self {
            RejectReason::BadMagic(_) => 1,
            RejectReason::UnexpectedFrame(_) => 2,
            RejectReason::Oversized(_) => 3,
            RejectReason::EmptyHello => 4,
            RejectReason::Undecryptable => 5,
            RejectReason::HelloMismatch => 6,
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::BadMagic(m) => write!(f, "bad magic 0x{:04x}", m),
            RejectReason::UnexpectedFrame(t) => write!(f, "unexpected frame type {}", t),
            RejectReason::Oversized(n) => write!(f, "hello of {} bytes exceeds limit", n),
            RejectReason::EmptyHello => f.write_str("empty server hello"),
            RejectReason::Undecryptable => f.write_str("server hello does not decrypt"),
            RejectReason::HelloMismatch => f.write_str("server hello content mismatch"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("bind rejected (code {}): {0}", .0.code())]
    Rejected(RejectReason),
    #[error("timed out waiting for server hello")]
    Timeout,
    #[error("bind transport failure: {0}")]
    TransportFailure(#[from] TransportError),
}

impl From<RejectReason> for HandshakeError {
    fn from(r: RejectReason) -> Self {
        HandshakeError::Rejected(r)
    }
}

/// One bind attempt. `run` may be called again after a failure; nothing is
/// kept from a failed attempt.
pub struct Handshake {
    request: HelloRequest,
    config: ClientConfig,
    state: HandshakeState,
}

impl Handshake {
    pub fn new(request: HelloRequest, config: ClientConfig) -> Self {
        Self {
            request,
            config,
            state: HandshakeState::Idle,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub async fn run(&mut self) -> Result<KeyMaterial, HandshakeError> {
        self.state = HandshakeState::Idle;
        debug!(
            server = %self.request.server,
            port = self.config.bind_port,
            mac = %self.request.mac,
            master = ?self.request.master,
            "starting bind"
        );
        let result = self.exchange().await;
        match &result {
            Ok(material) => {
                self.state = HandshakeState::Bound;
                info!(server = %self.request.server, mac = %material.mac(), "device bound");
            }
            Err(e) => {
                self.state = HandshakeState::Failed;
                warn!(server = %self.request.server, error = %e, "bind failed");
            }
        }
        result
    }

    async fn exchange(&mut self) -> Result<KeyMaterial, HandshakeError> {
        self.state = HandshakeState::SendingHello;
        let mac = self.request.mac;
        let material = KeyMaterial::new(self.request.proposed_key.clone(), generate_iv(), mac);

        let mut stream = connect_stream(
            &self.request.server,
            self.config.bind_port,
            self.config.connect_timeout(),
        )
        .await?;

        let hello = Frame::new(FrameType::ClientHello, mac, material.encrypt(CLIENT_HELLO))
            .with_random(*material.iv());
        self.write(&mut stream, &hello).await?;

        self.state = HandshakeState::AwaitingResponse;
        let mut pending = BytesMut::new();
        let read = wire::read_frame(&mut stream, &mut pending, MAX_HELLO_PAYLOAD);
        let reply = match tokio::time::timeout(self.config.hello_timeout(), read).await {
            Err(_) => return Err(HandshakeError::Timeout),
            Ok(Err(FrameReadError::Decode(FrameDecodeError::BadMagic(m)))) => {
                return Err(RejectReason::BadMagic(m).into())
            }
            Ok(Err(FrameReadError::Decode(FrameDecodeError::TooLarge(n)))) => {
                return Err(RejectReason::Oversized(n).into())
            }
            Ok(Err(e)) => return Err(TransportError::from(e).into()),
            Ok(Ok(frame)) => frame,
        };
        check_server_hello(&material, &reply)?;

        let ack = Frame::new(
            FrameType::ServerHelloAck,
            mac,
            material.encrypt(SERVER_HELLO_ACK),
        );
        self.write(&mut stream, &ack).await?;
        if let Err(e) = stream.shutdown().await {
            debug!(error = %e, "bind connection shutdown failed");
        }
        Ok(material)
    }

    async fn write(&self, stream: &mut TcpStream, frame: &Frame) -> Result<(), TransportError> {
        let limit = self.config.io_timeout().unwrap_or(self.config.hello_timeout());
        match tokio::time::timeout(limit, wire::write_frame(stream, frame, MAX_HELLO_PAYLOAD)).await
        {
            Err(_) => Err(TransportError::Timeout),
            Ok(Err(FrameWriteError::Io(e))) => Err(TransportError::WriteFailed(e)),
            Ok(Err(FrameWriteError::Encode(e))) => Err(TransportError::WriteFailed(
                std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            )),
            Ok(Ok(())) => Ok(()),
        }
    }
}

fn check_server_hello(material: &KeyMaterial, frame: &Frame) -> Result<(), RejectReason> {
    match frame.frame_type() {
        Ok(FrameType::ServerHello) => {}
        Ok(other) => return Err(RejectReason::UnexpectedFrame(other.as_u16())),
        Err(raw) => return Err(RejectReason::UnexpectedFrame(raw)),
    }
    if frame.payload.is_empty() {
        return Err(RejectReason::EmptyHello);
    }
    let plain = material
        .decrypt(&frame.payload)
        .map_err(|_| RejectReason::Undecryptable)?;
    if plain != SERVER_HELLO {
        return Err(RejectReason::HelloMismatch);
    }
    Ok(())
}

/// Run one bind handshake.
pub async fn bind_device(
    request: HelloRequest,
    config: &ClientConfig,
) -> Result<KeyMaterial, HandshakeError> {
    Handshake::new(request, config.clone()).run().await
}
