//! Load config from file and environment.

use repeater_core::ClientConfig;
use serde::Deserialize;
use std::path::PathBuf;

/// Tool configuration. File: ~/.config/repeater/config.toml or /etc/repeater/config.toml.
/// Env overrides: REPEATER_SERVER, REPEATER_BIND_PORT, REPEATER_LISTEN, REPEATER_IO_TIMEOUT_MS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Default repeater host for `bind` and `ping`.
    #[serde(default)]
    pub server: Option<String>,
    /// Listen address for `serve` (default 0.0.0.0:1600).
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub client: ClientConfig,
}

fn default_listen() -> String {
    format!("0.0.0.0:{}", repeater_core::protocol::DEFAULT_BIND_PORT)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: None,
            listen: default_listen(),
            client: ClientConfig::default(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    if let Ok(s) = std::env::var("REPEATER_SERVER") {
        if !s.is_empty() {
            c.server = Some(s);
        }
    }
    if let Ok(s) = std::env::var("REPEATER_BIND_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.client.bind_port = p;
        }
    }
    if let Ok(s) = std::env::var("REPEATER_LISTEN") {
        if !s.is_empty() {
            c.listen = s;
        }
    }
    if let Ok(s) = std::env::var("REPEATER_IO_TIMEOUT_MS") {
        if let Ok(ms) = s.parse::<u64>() {
            c.client.io_timeout_ms = ms;
        }
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/repeater/config.toml"));
    }
    out.push(PathBuf::from("/etc/repeater/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p).map(|s| toml::from_str::<Config>(&s)) {
                Ok(Ok(c)) => return Some(c),
                Ok(Err(e)) => tracing::warn!(path = %p.display(), error = %e, "ignoring bad config"),
                Err(e) => tracing::warn!(path = %p.display(), error = %e, "config unreadable"),
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_client_section() {
        let c: Config = toml::from_str(
            r#"
            server = "192.168.4.1"
            [client]
            bind_port = 1700
            io_timeout_ms = 0
            "#,
        )
        .unwrap();
        assert_eq!(c.server.as_deref(), Some("192.168.4.1"));
        assert_eq!(c.listen, "0.0.0.0:1600");
        assert_eq!(c.client.bind_port, 1700);
        assert_eq!(c.client.io_timeout(), None);
        assert_eq!(c.client.hello_timeout_ms, 15_000);
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 1").is_err());
        assert!(toml::from_str::<Config>("[client]\nretries = 3").is_err());
    }
}
