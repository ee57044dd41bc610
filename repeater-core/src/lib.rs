//! Repeater client core.
//! Binds a device to a repeater with an AES hello handshake, then carries
//! encrypted framed data over TCP. Usable from Rust or through the C ABI in `ffi`.

pub mod client;
pub mod config;
pub mod crypto;
pub mod ffi;
pub mod handshake;
pub mod identity;
pub mod keystore;
pub mod protocol;
pub mod runtime;
pub mod server;
pub mod session;
pub mod status;
pub mod wire;

pub use client::{ClientError, RepeaterClient};
pub use config::ClientConfig;
pub use crypto::{AesKey, CryptoError, KeyMaterial};
pub use handshake::{Handshake, HandshakeError, HandshakeState, HelloRequest, RejectReason};
pub use identity::{MacAddr, MasterSecret};
pub use keystore::KeyStore;
pub use session::{Endpoint, EndpointError, Session, TransportError};
pub use status::StatusCode;
pub use wire::{decode_frame, encode_frame, Frame, FrameDecodeError, FrameEncodeError};
