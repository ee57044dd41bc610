//! Repeater-side responder. Answers bind handshakes for provisioned devices and
//! echoes encrypted data frames back. Backs the `serve` command and the tests.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use bytes::BytesMut;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::crypto::{AesKey, CryptoError, KeyMaterial};
use crate::identity::MacAddr;
use crate::protocol::{
    FrameType, CLIENT_HELLO, DEFAULT_MAX_PAYLOAD, SERVER_HELLO, SERVER_HELLO_ACK,
};
use crate::wire::{self, Frame, FrameReadError, FrameWriteError};

/// Device keys the responder knows, and the bindings it has accepted.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    provisioned: RwLock<HashMap<MacAddr, AesKey>>,
    bound: RwLock<HashMap<MacAddr, KeyMaterial>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn provision(&self, mac: MacAddr, key: AesKey) {
        self.provisioned
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(mac, key);
    }

    /// Forget a device and any binding it holds. Returns whether it was known.
    pub fn revoke(&self, mac: &MacAddr) -> bool {
        self.bound
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(mac);
        self.provisioned
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(mac)
            .is_some()
    }

    pub fn binding(&self, mac: &MacAddr) -> Option<KeyMaterial> {
        self.bound
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(mac)
            .cloned()
    }

    pub fn bound_count(&self) -> usize {
        self.bound.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn key_for(&self, mac: &MacAddr) -> Option<AesKey> {
        self.provisioned
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(mac)
            .cloned()
    }

    fn record_binding(&self, material: KeyMaterial) {
        self.bound
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(material.mac(), material);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResponderError {
    #[error(transparent)]
    Read(#[from] FrameReadError),
    #[error(transparent)]
    Write(#[from] FrameWriteError),
    #[error("unknown device {0}")]
    UnknownDevice(MacAddr),
    #[error("device {0} has no binding")]
    NotBound(MacAddr),
    #[error("hello content mismatch")]
    BadHello,
    #[error("unexpected frame type {0}")]
    UnexpectedFrame(u16),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

pub struct RepeaterServer {
    listener: TcpListener,
    registry: Arc<DeviceRegistry>,
    max_payload: usize,
}

impl RepeaterServer {
    pub async fn bind<A: ToSocketAddrs>(
        addr: A,
        registry: Arc<DeviceRegistry>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            registry,
            max_payload: DEFAULT_MAX_PAYLOAD,
        })
    }

    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Accept loop; one task per connection. Returns only on accept failure.
    pub async fn serve(self) -> std::io::Result<()> {
        info!(addr = ?self.listener.local_addr().ok(), "responder listening");
        loop {
            let (stream, peer) = self.listener.accept().await?;
            let registry = self.registry.clone();
            let max_payload = self.max_payload;
            tokio::spawn(async move {
                match handle_connection(stream, &registry, max_payload).await {
                    Ok(()) => debug!(%peer, "connection done"),
                    Err(e) => warn!(%peer, error = %e, "connection dropped"),
                }
            });
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    registry: &DeviceRegistry,
    max_payload: usize,
) -> Result<(), ResponderError> {
    let mut pending = BytesMut::new();
    loop {
        let frame = match wire::read_frame(&mut stream, &mut pending, max_payload).await {
            Ok(f) => f,
            Err(FrameReadError::Closed) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        match frame.frame_type() {
            Ok(FrameType::ClientHello) => {
                answer_hello(&mut stream, &mut pending, registry, &frame, max_payload).await?
            }
            Ok(FrameType::Data) => echo(&mut stream, registry, &frame, max_payload).await?,
            Ok(other) => return Err(ResponderError::UnexpectedFrame(other.as_u16())),
            Err(raw) => return Err(ResponderError::UnexpectedFrame(raw)),
        }
    }
}

async fn answer_hello(
    stream: &mut TcpStream,
    pending: &mut BytesMut,
    registry: &DeviceRegistry,
    hello: &Frame,
    max_payload: usize,
) -> Result<(), ResponderError> {
    let mac = hello.mac();
    let key = registry
        .key_for(&mac)
        .ok_or(ResponderError::UnknownDevice(mac))?;
    let material = KeyMaterial::new(key, hello.header.random, mac);
    if material.decrypt(&hello.payload)? != CLIENT_HELLO {
        return Err(ResponderError::BadHello);
    }

    let reply = Frame::new(FrameType::ServerHello, mac, material.encrypt(SERVER_HELLO));
    wire::write_frame(stream, &reply, max_payload).await?;

    let ack = wire::read_frame(stream, pending, max_payload).await?;
    match ack.frame_type() {
        Ok(FrameType::ServerHelloAck) => {}
        Ok(other) => return Err(ResponderError::UnexpectedFrame(other.as_u16())),
        Err(raw) => return Err(ResponderError::UnexpectedFrame(raw)),
    }
    if material.decrypt(&ack.payload)? != SERVER_HELLO_ACK {
        return Err(ResponderError::BadHello);
    }
    registry.record_binding(material);
    info!(%mac, "device bound");
    Ok(())
}

async fn echo(
    stream: &mut TcpStream,
    registry: &DeviceRegistry,
    frame: &Frame,
    max_payload: usize,
) -> Result<(), ResponderError> {
    let mac = frame.mac();
    let material = registry.binding(&mac).ok_or(ResponderError::NotBound(mac))?;
    let plain = Zeroizing::new(material.decrypt(&frame.payload)?);
    debug!(%mac, len = plain.len(), "echo");
    let reply = Frame::new(FrameType::Data, mac, material.encrypt(&plain));
    wire::write_frame(stream, &reply, max_payload).await?;
    Ok(())
}
