//! Blocking client facade: one repeater endpoint, its session, and the key
//! store the bind handshake fills. Every call blocks the calling thread on the
//! shared runtime, so do not call from inside an async task.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::crypto::{AesKey, KeyMaterial};
use crate::handshake::{self, HandshakeError, HelloRequest};
use crate::identity::{MacAddr, MasterSecret};
use crate::keystore::KeyStore;
use crate::runtime;
use crate::session::{Endpoint, EndpointError, Session, TransportError};
use crate::status::{self, StatusCode};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("invalid endpoint: {0}")]
    Initialization(#[from] EndpointError),
    #[error("client not initialized or already released")]
    NotInitialized,
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error("runtime unavailable: {0}")]
    Runtime(#[source] std::io::Error),
}

impl StatusCode for ClientError {
    fn status_code(&self) -> i32 {
        match self {
            ClientError::Initialization(_) | ClientError::InvalidArgument(_) => {
                status::INVALID_ARGUMENT
            }
            ClientError::NotInitialized => status::NOT_INITIALIZED,
            ClientError::Transport(e) => e.status_code(),
            ClientError::Handshake(e) => e.status_code(),
            ClientError::Runtime(_) => status::FAILURE,
        }
    }
}

fn block_on<F: Future>(fut: F) -> Result<F::Output, ClientError> {
    let rt = runtime::runtime().map_err(ClientError::Runtime)?;
    Ok(rt.block_on(fut))
}

/// Validate raw bind inputs and run one handshake against `server`.
pub fn bind_device(
    server: &str,
    mac: &[u8],
    master: &[u8],
    proposed_key: &[u8],
    config: &ClientConfig,
) -> Result<KeyMaterial, ClientError> {
    if server.trim().is_empty() {
        return Err(ClientError::InvalidArgument("server address is empty"));
    }
    let mac = MacAddr::from_slice(mac).ok_or(ClientError::InvalidArgument("mac must be 6 bytes"))?;
    let master = MasterSecret::new(master)
        .ok_or(ClientError::InvalidArgument("master secret must be 1..=16 bytes"))?;
    let proposed_key = AesKey::from_slice(proposed_key)
        .ok_or(ClientError::InvalidArgument("aes key must be 16 or 32 bytes"))?;
    let request = HelloRequest {
        server: server.trim().to_string(),
        mac,
        master,
        proposed_key,
    };
    Ok(block_on(handshake::bind_device(request, config))??)
}

pub struct RepeaterClient {
    session: Session,
    keys: Arc<KeyStore>,
    /// Only a client that owns its store clears it on release.
    owns_keys: bool,
    config: ClientConfig,
    /// `true` once released. `bind_device` installs keys while holding it.
    released: Mutex<bool>,
}

impl RepeaterClient {
    /// Client for `address:port` with default settings and a private key store.
    pub fn init(address: &str, port: u32) -> Result<Self, ClientError> {
        Self::with_config(address, port, ClientConfig::default())
    }

    pub fn with_config(address: &str, port: u32, config: ClientConfig) -> Result<Self, ClientError> {
        Self::build(address, port, config, Arc::new(KeyStore::new()), true)
    }

    /// Client sharing `keys` with other clients (the C ABI keeps one per
    /// process). Release leaves a shared store untouched.
    pub fn with_key_store(
        address: &str,
        port: u32,
        config: ClientConfig,
        keys: Arc<KeyStore>,
    ) -> Result<Self, ClientError> {
        Self::build(address, port, config, keys, false)
    }

    fn build(
        address: &str,
        port: u32,
        config: ClientConfig,
        keys: Arc<KeyStore>,
        owns_keys: bool,
    ) -> Result<Self, ClientError> {
        let endpoint = Endpoint::new(address, port)?;
        debug!(%endpoint, owns_keys, "client created");
        Ok(Self {
            session: Session::open(endpoint, keys.clone(), config.clone()),
            keys,
            owns_keys,
            config,
            released: Mutex::new(false),
        })
    }

    fn lifecycle(&self) -> MutexGuard<'_, bool> {
        self.released.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_live(&self) -> Result<(), ClientError> {
        if *self.lifecycle() {
            return Err(ClientError::NotInitialized);
        }
        Ok(())
    }

    /// Bind against `server` (on the configured bind port). On success the
    /// new key material replaces any previous binding; on failure nothing changes.
    pub fn bind_device(
        &self,
        server: &str,
        mac: &[u8],
        master: &[u8],
        proposed_key: &[u8],
    ) -> Result<(), ClientError> {
        self.ensure_live()?;
        let material = bind_device(server, mac, master, proposed_key, &self.config)?;
        let released = self.lifecycle();
        if *released {
            debug!("released during bind; key material discarded");
            return Err(ClientError::NotInitialized);
        }
        self.keys.set(material);
        Ok(())
    }

    pub fn connect(&self) -> Result<(), ClientError> {
        self.ensure_live()?;
        Ok(block_on(self.session.connect())??)
    }

    /// Send `data`; returns the byte count accepted (always `data.len()`).
    pub fn send(&self, data: &[u8]) -> Result<usize, ClientError> {
        self.ensure_live()?;
        if data.is_empty() {
            return Err(ClientError::InvalidArgument("empty payload"));
        }
        Ok(block_on(self.session.send(data))??)
    }

    /// Receive one message of at most `capacity` bytes.
    pub fn receive(&self, capacity: usize) -> Result<Vec<u8>, ClientError> {
        self.ensure_live()?;
        if capacity == 0 {
            return Err(ClientError::InvalidArgument("zero capacity"));
        }
        Ok(block_on(self.session.receive(capacity))??)
    }

    /// Receive into `buf`; returns the byte count written.
    pub fn receive_into(&self, buf: &mut [u8]) -> Result<usize, ClientError> {
        let data = self.receive(buf.len())?;
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }

    /// Close the connection, unblock any pending receive and drop the key
    /// material of an owned store. Never fails; later calls return
    /// `NotInitialized`.
    pub fn release(&self) {
        {
            let mut released = self.lifecycle();
            if *released {
                debug!("release on released client");
                return;
            }
            *released = true;
        }
        match runtime::runtime() {
            Ok(rt) => rt.block_on(self.session.close()),
            Err(e) => warn!(error = %e, "runtime unavailable; socket left to drop"),
        }
        if self.owns_keys {
            self.keys.clear();
        }
        info!(endpoint = %self.session.endpoint(), "client released");
    }

    /// Key of the current binding, if any.
    pub fn aes_key(&self) -> Option<Vec<u8>> {
        self.keys.get().map(|m| m.key().as_bytes().to_vec())
    }

    /// IV of the current binding, if any.
    pub fn aes_iv(&self) -> Option<Vec<u8>> {
        self.keys.get().map(|m| m.iv().to_vec())
    }

    pub fn is_connected(&self) -> bool {
        !*self.lifecycle() && self.session.is_connected()
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.session.endpoint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{DeviceRegistry, RepeaterServer};
    use std::net::SocketAddr;
    use std::time::Duration;

    const MAC: [u8; 6] = [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF];

    fn start_responder(key: &[u8]) -> SocketAddr {
        let registry = Arc::new(DeviceRegistry::new());
        registry.provision(MacAddr(MAC), AesKey::from_slice(key).unwrap());
        let rt = runtime::runtime().unwrap();
        let server = rt
            .block_on(RepeaterServer::bind("127.0.0.1:0", registry))
            .unwrap();
        let addr = server.local_addr().unwrap();
        rt.spawn(server.serve());
        addr
    }

    fn client_for(addr: SocketAddr) -> RepeaterClient {
        let config = ClientConfig {
            bind_port: addr.port(),
            ..ClientConfig::default()
        };
        RepeaterClient::with_config("127.0.0.1", u32::from(addr.port()), config).unwrap()
    }

    #[test]
    fn invalid_endpoint_fails_init() {
        assert!(matches!(
            RepeaterClient::init("", 80),
            Err(ClientError::Initialization(EndpointError::EmptyHost))
        ));
        let err = RepeaterClient::init("10.0.0.1", 70000).err().unwrap();
        assert_eq!(err.status_code(), status::INVALID_ARGUMENT);
    }

    #[test]
    fn bind_connect_send_receive() {
        let addr = start_responder(&[0x01; 16]);
        let client = client_for(addr);
        assert!(client.aes_key().is_none());
        assert!(client.aes_iv().is_none());

        client
            .bind_device("127.0.0.1", &MAC, &[0u8; 16], &[0x01; 16])
            .unwrap();
        assert_eq!(client.aes_key().unwrap(), vec![0x01; 16]);
        let iv = client.aes_iv().unwrap();
        assert_eq!(iv.len(), 16);
        assert!(iv.iter().all(|b| b.is_ascii_alphanumeric()));

        client.connect().unwrap();
        assert!(client.is_connected());
        assert_eq!(client.send(b"PING").unwrap(), 4);
        assert_eq!(client.receive(64).unwrap(), b"PING");

        let mut buf = [0u8; 32];
        client.send(b"again").unwrap();
        let n = client.receive_into(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"again");

        client.release();
        assert!(!client.is_connected());
        assert!(client.aes_key().is_none());
        assert!(matches!(client.send(b"x"), Err(ClientError::NotInitialized)));
        assert!(matches!(client.connect(), Err(ClientError::NotInitialized)));
    }

    #[test]
    fn failed_bind_leaves_no_key() {
        let addr = start_responder(&[0x01; 16]);
        let client = client_for(addr);
        let err = client
            .bind_device("127.0.0.1", &[1, 2, 3, 4, 5, 6], &[0u8; 4], &[0x01; 16])
            .unwrap_err();
        assert_eq!(err.status_code(), status::FAILURE);
        assert!(client.aes_key().is_none());
    }

    #[test]
    fn bind_validates_arguments() {
        let client = RepeaterClient::init("127.0.0.1", 9).unwrap();
        let bad = [
            client.bind_device("", &MAC, &[0; 16], &[0; 16]),
            client.bind_device("127.0.0.1", &MAC[..5], &[0; 16], &[0; 16]),
            client.bind_device("127.0.0.1", &MAC, &[], &[0; 16]),
            client.bind_device("127.0.0.1", &MAC, &[0; 17], &[0; 16]),
            client.bind_device("127.0.0.1", &MAC, &[0; 16], &[0; 24]),
        ];
        for result in bad {
            assert!(matches!(result, Err(ClientError::InvalidArgument(_))));
        }
    }

    #[test]
    fn calls_before_connect() {
        let client = RepeaterClient::init("127.0.0.1", 9).unwrap();
        let err = client.send(b"x").unwrap_err();
        assert_eq!(err.status_code(), status::NOT_CONNECTED);
        assert!(matches!(client.send(b""), Err(ClientError::InvalidArgument(_))));
        assert!(matches!(client.receive(0), Err(ClientError::InvalidArgument(_))));
        assert_eq!(client.receive(8).unwrap_err().status_code(), status::NOT_CONNECTED);
    }

    /// Answers the hello correctly, but only after `delay`.
    fn slow_responder(key: [u8; 16], delay: Duration) -> SocketAddr {
        use crate::protocol::{FrameType, MAX_HELLO_PAYLOAD, SERVER_HELLO};
        use crate::wire::{self, Frame};

        let rt = runtime::runtime().unwrap();
        let listener = rt
            .block_on(tokio::net::TcpListener::bind("127.0.0.1:0"))
            .unwrap();
        let addr = listener.local_addr().unwrap();
        rt.spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut pending = bytes::BytesMut::new();
            let hello = wire::read_frame(&mut stream, &mut pending, MAX_HELLO_PAYLOAD)
                .await
                .unwrap();
            let km = KeyMaterial::new(AesKey::Aes128(key), hello.header.random, hello.mac());
            tokio::time::sleep(delay).await;
            let reply = Frame::new(FrameType::ServerHello, hello.mac(), km.encrypt(SERVER_HELLO));
            wire::write_frame(&mut stream, &reply, MAX_HELLO_PAYLOAD)
                .await
                .unwrap();
            let _ = wire::read_frame(&mut stream, &mut pending, MAX_HELLO_PAYLOAD).await;
        });
        addr
    }

    #[test]
    fn release_during_bind_discards_key() {
        let addr = slow_responder([0x01; 16], Duration::from_millis(300));
        let client = Arc::new(client_for(addr));
        let binder = {
            let client = client.clone();
            std::thread::spawn(move || client.bind_device("127.0.0.1", &MAC, &[0u8; 16], &[0x01; 16]))
        };
        std::thread::sleep(Duration::from_millis(100));
        client.release();
        let result = binder.join().unwrap();
        assert!(matches!(result, Err(ClientError::NotInitialized)));
        assert!(client.aes_key().is_none());
        assert!(client.aes_iv().is_none());
    }

    #[test]
    fn release_leaves_shared_store_alone() {
        let shared = Arc::new(KeyStore::new());
        let a = RepeaterClient::with_key_store("127.0.0.1", 9, ClientConfig::default(), shared.clone())
            .unwrap();
        let b = RepeaterClient::with_key_store("127.0.0.1", 9, ClientConfig::default(), shared.clone())
            .unwrap();
        shared.set(KeyMaterial::new(
            AesKey::Aes128([0x03; 16]),
            crate::crypto::generate_iv(),
            MacAddr(MAC),
        ));
        a.release();
        assert_eq!(b.aes_key().unwrap(), vec![0x03; 16]);
        assert!(shared.is_set());

        let owned = RepeaterClient::init("127.0.0.1", 9).unwrap();
        owned.keys.set(shared.get().unwrap());
        owned.release();
        assert!(owned.aes_key().is_none());
    }

    #[test]
    fn release_twice_is_harmless() {
        let client = RepeaterClient::init("127.0.0.1", 9).unwrap();
        client.release();
        client.release();
        assert!(matches!(client.receive(8), Err(ClientError::NotInitialized)));
    }

    #[test]
    fn release_unblocks_receive_on_other_thread() {
        let rt = runtime::runtime().unwrap();
        let listener = rt
            .block_on(tokio::net::TcpListener::bind("127.0.0.1:0"))
            .unwrap();
        let addr = listener.local_addr().unwrap();
        // accept and hold the connection open without ever replying
        rt.spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(stream);
        });

        let config = ClientConfig {
            io_timeout_ms: 0,
            ..ClientConfig::default()
        };
        let client = Arc::new(
            RepeaterClient::with_config("127.0.0.1", u32::from(addr.port()), config).unwrap(),
        );
        client.connect().unwrap();

        let reader = {
            let client = client.clone();
            std::thread::spawn(move || client.receive(64))
        };
        std::thread::sleep(Duration::from_millis(100));
        client.release();
        let result = reader.join().unwrap();
        assert_eq!(
            result.unwrap_err().status_code(),
            status::CONNECTION_CLOSED
        );
    }
}
