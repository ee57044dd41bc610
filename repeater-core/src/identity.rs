//! Device identity: BLE MAC address of the bound device and the local master secret.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

/// 6-byte device MAC. Written into every frame header so the repeater can pick the key.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    /// Build from a byte slice; `None` unless exactly 6 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 6] = bytes.try_into().ok()?;
        Some(MacAddr(arr))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MacParseError {
    #[error("expected 12 hex digits, got {0}")]
    Length(usize),
    #[error("invalid hex digit {0:?}")]
    Digit(char),
}

/// Accepts `AA:BB:CC:DD:EE:FF`, `AA-BB-...` and bare `AABBCCDDEEFF`.
impl FromStr for MacAddr {
    type Err = MacParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: Vec<char> = s.chars().filter(|c| *c != ':' && *c != '-').collect();
        if digits.len() != 12 {
            return Err(MacParseError::Length(digits.len()));
        }
        let mut out = [0u8; 6];
        for (i, pair) in digits.chunks(2).enumerate() {
            let hi = pair[0].to_digit(16).ok_or(MacParseError::Digit(pair[0]))?;
            let lo = pair[1].to_digit(16).ok_or(MacParseError::Digit(pair[1]))?;
            out[i] = ((hi << 4) | lo) as u8;
        }
        Ok(MacAddr(out))
    }
}

/// Longest master secret accepted from the host.
pub const MAX_MASTER_LEN: usize = 16;

/// Master secret of the binding host (the phone's own MAC on current firmware).
/// Kept locally with the binding; never put on the wire.
#[derive(Clone, Eq, PartialEq)]
pub struct MasterSecret(Vec<u8>);

impl MasterSecret {
    /// `None` if empty or longer than [`MAX_MASTER_LEN`].
    pub fn new(bytes: &[u8]) -> Option<Self> {
        if bytes.is_empty() || bytes.len() > MAX_MASTER_LEN {
            return None;
        }
        Some(MasterSecret(bytes.to_vec()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for MasterSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MasterSecret({} bytes)", self.0.len())
    }
}

impl Drop for MasterSecret {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// Decode a hex string (even length, no separators) into bytes.
pub fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    s.as_bytes()
        .chunks(2)
        .map(|pair| {
            let hi = (pair[0] as char).to_digit(16)?;
            let lo = (pair[1] as char).to_digit(16)?;
            Some(((hi << 4) | lo) as u8)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_colon_separated() {
        let mac: MacAddr = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        assert_eq!(mac.as_bytes(), &[0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        assert_eq!(mac.to_string(), "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn parse_bare_hex_lowercase() {
        let mac: MacAddr = "b0e9fe8b3d0c".parse().unwrap();
        assert_eq!(mac.as_bytes(), &[0xB0, 0xE9, 0xFE, 0x8B, 0x3D, 0x0C]);
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert_eq!("AA:BB".parse::<MacAddr>(), Err(MacParseError::Length(4)));
        assert_eq!(
            "ZZ:BB:CC:DD:EE:FF".parse::<MacAddr>(),
            Err(MacParseError::Digit('Z'))
        );
    }

    #[test]
    fn master_secret_bounds() {
        assert!(MasterSecret::new(&[]).is_none());
        assert!(MasterSecret::new(&[0u8; 17]).is_none());
        assert_eq!(MasterSecret::new(&[0u8; 16]).unwrap().as_bytes().len(), 16);
        assert_eq!(MasterSecret::new(&[1u8; 6]).unwrap().as_bytes().len(), 6);
    }

    #[test]
    fn hex_decoding() {
        assert_eq!(decode_hex("B0E9FEF6E749"), Some(vec![0xB0, 0xE9, 0xFE, 0xF6, 0xE7, 0x49]));
        assert_eq!(decode_hex("abc"), None);
        assert_eq!(decode_hex("zz"), None);
    }
}
