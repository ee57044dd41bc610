//! Transport session: one TCP link to the repeater. When the key store holds
//! material, every send/receive is a single AES-CBC encrypted `Data` frame;
//! otherwise bytes pass through unframed.
//!
//! Locking: `state` is a short std mutex never held across an await. Each TCP
//! half sits behind its own async mutex held for the whole I/O call, and
//! `close` takes both before freeing, so it waits out in-flight I/O. A watch
//! flag raced against every read/write makes a blocked call return
//! `ConnectionClosed` as soon as `close` starts.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{debug, info, warn};
use zeroize::{Zeroize, Zeroizing};

use crate::config::ClientConfig;
use crate::crypto::{CryptoError, KeyMaterial};
use crate::keystore::KeyStore;
use crate::protocol::FrameType;
use crate::wire::{self, encode_frame, Frame, FrameDecodeError, FrameEncodeError, FrameReadError};

/// Validated server address.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new(host: &str, port: u32) -> Result<Self, EndpointError> {
        let host = host.trim();
        if host.is_empty() {
            return Err(EndpointError::EmptyHost);
        }
        let port = u16::try_from(port)
            .ok()
            .filter(|p| *p != 0)
            .ok_or(EndpointError::InvalidPort(port))?;
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum EndpointError {
    #[error("server address is empty")]
    EmptyHost,
    #[error("port {0} outside 1..=65535")]
    InvalidPort(u32),
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("host unreachable: {endpoint}: {source}")]
    HostUnreachable {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },
    #[error("timed out")]
    Timeout,
    #[error("already connected")]
    AlreadyConnected,
    #[error("not connected")]
    NotConnected,
    #[error("write failed: {0}")]
    WriteFailed(#[source] std::io::Error),
    #[error("read failed: {0}")]
    ReadFailed(#[source] std::io::Error),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("payload too large: {len} bytes (limit {limit})")]
    PayloadTooLarge { len: usize, limit: usize },
    #[error("decrypt failed: {0}")]
    DecryptFailed(#[from] CryptoError),
    #[error("encrypted link has no key material")]
    KeyUnavailable,
    #[error("protocol error: {0}")]
    Protocol(#[from] FrameDecodeError),
    #[error("unexpected frame type {0}")]
    UnexpectedFrame(u16),
}

impl TransportError {
    /// Errors after which the byte stream can no longer be trusted.
    fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::WriteFailed(_)
                | TransportError::ReadFailed(_)
                | TransportError::ConnectionClosed
                | TransportError::Protocol(_)
        )
    }
}

impl From<FrameReadError> for TransportError {
    fn from(e: FrameReadError) -> Self {
        match e {
            FrameReadError::Closed => TransportError::ConnectionClosed,
            FrameReadError::Io(e) => TransportError::ReadFailed(e),
            FrameReadError::Decode(e) => TransportError::Protocol(e),
        }
    }
}

/// Open a TCP stream within `limit`.
pub(crate) async fn connect_stream(
    host: &str,
    port: u16,
    limit: Duration,
) -> Result<TcpStream, TransportError> {
    let stream = match tokio::time::timeout(limit, TcpStream::connect((host, port))).await {
        Err(_) => return Err(TransportError::Timeout),
        Ok(Err(source)) => {
            return Err(TransportError::HostUnreachable {
                endpoint: format!("{}:{}", host, port),
                source,
            })
        }
        Ok(Ok(s)) => s,
    };
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "set_nodelay failed");
    }
    Ok(stream)
}

async fn with_timeout<F: Future>(limit: Option<Duration>, fut: F) -> Option<F::Output> {
    match limit {
        Some(d) => tokio::time::timeout(d, fut).await.ok(),
        None => Some(fut.await),
    }
}

struct LinkReader {
    half: OwnedReadHalf,
    /// Bytes read but not yet consumed as a whole frame.
    pending: BytesMut,
}

struct Link {
    reader: AsyncMutex<LinkReader>,
    writer: AsyncMutex<OwnedWriteHalf>,
    closed: watch::Sender<bool>,
    /// Set when key material is present at connect or on any I/O; from then
    /// on plaintext is refused.
    encrypted: AtomicBool,
    peer: Option<SocketAddr>,
}

impl Link {
    fn new(stream: TcpStream) -> Self {
        let peer = stream.peer_addr().ok();
        let (half, writer) = stream.into_split();
        let (closed, _) = watch::channel(false);
        Self {
            reader: AsyncMutex::new(LinkReader {
                half,
                pending: BytesMut::new(),
            }),
            writer: AsyncMutex::new(writer),
            closed,
            encrypted: AtomicBool::new(false),
            peer,
        }
    }

    /// Resolves once `shutdown` has started.
    async fn closing(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    fn is_closing(&self) -> bool {
        *self.closed.borrow()
    }

    async fn shutdown(&self) {
        self.closed.send_replace(true);
        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.shutdown().await {
                debug!(error = %e, "tcp shutdown failed");
            }
        }
        let mut reader = self.reader.lock().await;
        reader.pending[..].zeroize();
        reader.pending.clear();
    }
}

enum LinkState {
    Disconnected,
    Connecting,
    Connected(Arc<Link>),
}

/// Session over one repeater endpoint. Created unconnected; `connect`, `send`,
/// `receive` and `close` may be called from different threads.
pub struct Session {
    endpoint: Endpoint,
    keys: Arc<KeyStore>,
    config: ClientConfig,
    state: Mutex<LinkState>,
}

/// Resets `Connecting` if a connect attempt is abandoned half-way.
struct ConnectingGuard<'a> {
    session: &'a Session,
    armed: bool,
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.session.lock_state();
            if matches!(*state, LinkState::Connecting) {
                *state = LinkState::Disconnected;
            }
        }
    }
}

impl Session {
    /// Allocate a session descriptor. Does not touch the network.
    pub fn open(endpoint: Endpoint, keys: Arc<KeyStore>, config: ClientConfig) -> Self {
        Self {
            endpoint,
            keys,
            config,
            state: Mutex::new(LinkState::Disconnected),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn is_connected(&self) -> bool {
        matches!(*self.lock_state(), LinkState::Connected(_))
    }

    fn lock_state(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn link(&self) -> Result<Arc<Link>, TransportError> {
        match &*self.lock_state() {
            LinkState::Connected(link) => Ok(link.clone()),
            _ => Err(TransportError::NotConnected),
        }
    }

    /// Establish the TCP connection. A second call while connected (or
    /// connecting) returns `AlreadyConnected` and leaves the link alone.
    ///
    /// A refused or unreachable address fails with `HostUnreachable` as soon
    /// as the OS reports it. An address that never answers (dropped SYNs)
    /// fails with `Timeout` once `connect_timeout_ms` elapses; treat both as
    /// "server not reachable".
    ///
    /// If key material is present at connect time the link is encrypted from
    /// the start, so losing the key later fails with `KeyUnavailable`.
    pub async fn connect(&self) -> Result<(), TransportError> {
        {
            let mut state = self.lock_state();
            match *state {
                LinkState::Disconnected => *state = LinkState::Connecting,
                _ => return Err(TransportError::AlreadyConnected),
            }
        }
        let mut guard = ConnectingGuard {
            session: self,
            armed: true,
        };
        let stream = connect_stream(
            self.endpoint.host(),
            self.endpoint.port(),
            self.config.connect_timeout(),
        )
        .await?;
        let link = Arc::new(Link::new(stream));
        if self.keys.is_set() {
            link.encrypted.store(true, Ordering::SeqCst);
        }

        let mut state = self.lock_state();
        guard.armed = false;
        if !matches!(*state, LinkState::Connecting) {
            // closed while the connect was in flight
            return Err(TransportError::ConnectionClosed);
        }
        info!(endpoint = %self.endpoint, peer = ?link.peer, "connected");
        *state = LinkState::Connected(link);
        Ok(())
    }

    /// Send `data`. Returns the number of plaintext bytes accepted.
    pub async fn send(&self, data: &[u8]) -> Result<usize, TransportError> {
        let link = self.link()?;
        let limit = self.config.max_payload;
        let bytes = match self.keys.get() {
            Some(material) => {
                link.encrypted.store(true, Ordering::SeqCst);
                Zeroizing::new(encode_data_frame(&material, data, limit)?)
            }
            None if link.encrypted.load(Ordering::SeqCst) => {
                return Err(TransportError::KeyUnavailable)
            }
            None => {
                if data.len() > limit {
                    return Err(TransportError::PayloadTooLarge {
                        len: data.len(),
                        limit,
                    });
                }
                Zeroizing::new(data.to_vec())
            }
        };

        let mut writer = tokio::select! {
            biased;
            _ = link.closing() => return Err(TransportError::ConnectionClosed),
            w = link.writer.lock() => w,
        };
        if link.is_closing() {
            return Err(TransportError::ConnectionClosed);
        }
        let write = async {
            writer.write_all(&bytes).await?;
            writer.flush().await
        };
        let outcome = tokio::select! {
            biased;
            _ = link.closing() => Err(TransportError::ConnectionClosed),
            r = with_timeout(self.config.io_timeout(), write) => match r {
                Some(Ok(())) => Ok(data.len()),
                Some(Err(e)) => Err(TransportError::WriteFailed(e)),
                None => Err(TransportError::Timeout),
            },
        };
        drop(writer);

        match outcome {
            Ok(n) => {
                debug!(len = n, wire = bytes.len(), "sent");
                Ok(n)
            }
            Err(e) => {
                // a timed-out write may have left half a frame on the wire
                if e.is_fatal() || matches!(e, TransportError::Timeout) {
                    self.drop_link(&link).await;
                }
                Err(e)
            }
        }
    }

    /// Blocking receive of at most `capacity` plaintext bytes.
    pub async fn receive(&self, capacity: usize) -> Result<Vec<u8>, TransportError> {
        let link = self.link()?;
        let mut reader = tokio::select! {
            biased;
            _ = link.closing() => return Err(TransportError::ConnectionClosed),
            r = link.reader.lock() => r,
        };
        if link.is_closing() {
            return Err(TransportError::ConnectionClosed);
        }
        let limit = self.config.max_payload;
        let material = self.keys.get();
        if material.is_some() {
            link.encrypted.store(true, Ordering::SeqCst);
        } else if link.encrypted.load(Ordering::SeqCst) {
            return Err(TransportError::KeyUnavailable);
        }

        let read = async {
            match &material {
                Some(m) => read_data_frame(&mut reader, m, capacity, limit).await,
                None => read_plain(&mut reader, capacity).await,
            }
        };
        let outcome = tokio::select! {
            biased;
            _ = link.closing() => Err(TransportError::ConnectionClosed),
            r = with_timeout(self.config.io_timeout(), read) => r.unwrap_or(Err(TransportError::Timeout)),
        };
        drop(reader);

        match outcome {
            Ok(data) => {
                debug!(len = data.len(), "received");
                Ok(data)
            }
            Err(e) => {
                if e.is_fatal() {
                    self.drop_link(&link).await;
                }
                Err(e)
            }
        }
    }

    /// Release the socket. Idempotent; in-flight calls return `ConnectionClosed`.
    pub async fn close(&self) {
        let link = {
            let mut state = self.lock_state();
            match std::mem::replace(&mut *state, LinkState::Disconnected) {
                LinkState::Connected(link) => link,
                LinkState::Connecting | LinkState::Disconnected => return,
            }
        };
        link.shutdown().await;
        info!(endpoint = %self.endpoint, "session closed");
    }

    /// Tear down `link` if it is still the current one.
    async fn drop_link(&self, link: &Arc<Link>) {
        let current = {
            let mut state = self.lock_state();
            match &*state {
                LinkState::Connected(cur) if Arc::ptr_eq(cur, link) => {
                    *state = LinkState::Disconnected;
                    true
                }
                _ => false,
            }
        };
        if current {
            warn!(endpoint = %self.endpoint, "link dropped after i/o failure");
            link.shutdown().await;
        }
    }
}

fn encode_data_frame(
    material: &KeyMaterial,
    data: &[u8],
    limit: usize,
) -> Result<Vec<u8>, TransportError> {
    let cipher = material.encrypt(data);
    let frame = Frame::new(FrameType::Data, material.mac(), cipher);
    encode_frame(&frame, limit).map_err(|e| match e {
        FrameEncodeError::TooLarge(len) => TransportError::PayloadTooLarge { len, limit },
        FrameEncodeError::Encode(e) => TransportError::WriteFailed(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            e,
        )),
    })
}

async fn read_data_frame(
    reader: &mut LinkReader,
    material: &KeyMaterial,
    capacity: usize,
    limit: usize,
) -> Result<Vec<u8>, TransportError> {
    let frame = wire::read_frame(&mut reader.half, &mut reader.pending, limit).await?;
    match frame.frame_type() {
        Ok(FrameType::Data) => {}
        Ok(other) => return Err(TransportError::UnexpectedFrame(other.as_u16())),
        Err(raw) => return Err(TransportError::UnexpectedFrame(raw)),
    }
    let plain = material.decrypt(&frame.payload)?;
    if plain.len() > capacity {
        let len = plain.len();
        drop(Zeroizing::new(plain));
        return Err(TransportError::PayloadTooLarge {
            len,
            limit: capacity,
        });
    }
    Ok(plain)
}

async fn read_plain(reader: &mut LinkReader, capacity: usize) -> Result<Vec<u8>, TransportError> {
    if !reader.pending.is_empty() {
        let n = capacity.min(reader.pending.len());
        let mut chunk = reader.pending.split_to(n);
        let out = chunk.to_vec();
        chunk[..].zeroize();
        return Ok(out);
    }
    let mut buf = vec![0u8; capacity];
    let n = reader
        .half
        .read(&mut buf)
        .await
        .map_err(TransportError::ReadFailed)?;
    if n == 0 {
        return Err(TransportError::ConnectionClosed);
    }
    buf.truncate(n);
    Ok(buf)
}
