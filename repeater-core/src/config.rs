//! Client tunables. Deserializable so hosts can embed it in their own config files.

use std::time::Duration;

use serde::Deserialize;

use crate::protocol::{DEFAULT_BIND_PORT, DEFAULT_MAX_PAYLOAD};

#[derive(Debug, Clone, Eq, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    /// Port the repeater accepts bind handshakes on (default 1600).
    #[serde(default = "default_bind_port")]
    pub bind_port: u16,
    /// TCP connect timeout in ms (default 2000).
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// How long to wait for the server hello in ms (default 15000).
    #[serde(default = "default_hello_timeout_ms")]
    pub hello_timeout_ms: u64,
    /// Per-call send/receive timeout in ms; 0 blocks indefinitely (default 2000).
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,
    /// Largest data frame payload accepted or sent (default 64 KiB).
    #[serde(default = "default_max_payload")]
    pub max_payload: usize,
}

fn default_bind_port() -> u16 {
    DEFAULT_BIND_PORT
}
fn default_connect_timeout_ms() -> u64 {
    2000
}
fn default_hello_timeout_ms() -> u64 {
    15_000
}
fn default_io_timeout_ms() -> u64 {
    2000
}
fn default_max_payload() -> usize {
    DEFAULT_MAX_PAYLOAD
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            bind_port: default_bind_port(),
            connect_timeout_ms: default_connect_timeout_ms(),
            hello_timeout_ms: default_hello_timeout_ms(),
            io_timeout_ms: default_io_timeout_ms(),
            max_payload: default_max_payload(),
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn hello_timeout(&self) -> Duration {
        Duration::from_millis(self.hello_timeout_ms)
    }

    pub fn io_timeout(&self) -> Option<Duration> {
        match self.io_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}
