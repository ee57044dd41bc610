//! Integer status codes returned across the C ABI. Zero or positive is success
//! (byte counts for send/receive); negative values identify the failure.

use crate::handshake::HandshakeError;
use crate::session::TransportError;

pub const OK: i32 = 0;
pub const FAILURE: i32 = -1;
pub const TIMEOUT: i32 = -2;
pub const REJECTED: i32 = -3;
pub const NOT_INITIALIZED: i32 = -4;
pub const NOT_CONNECTED: i32 = -5;
pub const ALREADY_CONNECTED: i32 = -6;
pub const INVALID_ARGUMENT: i32 = -7;
pub const HOST_UNREACHABLE: i32 = -8;
pub const CONNECTION_CLOSED: i32 = -9;
pub const DECRYPT_FAILED: i32 = -10;
pub const PAYLOAD_TOO_LARGE: i32 = -11;
pub const KEY_UNAVAILABLE: i32 = -12;

pub trait StatusCode {
    fn status_code(&self) -> i32;
}

impl StatusCode for TransportError {
    fn status_code(&self) -> i32 {
        match self {
            TransportError::HostUnreachable { .. } => HOST_UNREACHABLE,
            TransportError::Timeout => TIMEOUT,
            TransportError::AlreadyConnected => ALREADY_CONNECTED,
            TransportError::NotConnected => NOT_CONNECTED,
            TransportError::ConnectionClosed => CONNECTION_CLOSED,
            TransportError::PayloadTooLarge { .. } => PAYLOAD_TOO_LARGE,
            TransportError::DecryptFailed(_) => DECRYPT_FAILED,
            TransportError::KeyUnavailable => KEY_UNAVAILABLE,
            TransportError::WriteFailed(_)
            | TransportError::ReadFailed(_)
            | TransportError::Protocol(_)
            | TransportError::UnexpectedFrame(_) => FAILURE,
        }
    }
}

impl StatusCode for HandshakeError {
    fn status_code(&self) -> i32 {
        match self {
            HandshakeError::Rejected(_) => REJECTED,
            HandshakeError::Timeout => TIMEOUT,
            HandshakeError::TransportFailure(_) => FAILURE,
        }
    }
}

/// Collapse a result into a status: `Ok(n)` becomes `n` (clamped to i32),
/// errors their code.
pub fn to_status<E: StatusCode>(result: Result<usize, E>) -> i32 {
    match result {
        Ok(n) => i32::try_from(n).unwrap_or(i32::MAX),
        Err(e) => e.status_code(),
    }
}
