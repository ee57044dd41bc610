//! AES-CBC channel crypto: keys, per-binding key material, PKCS#7 encrypt/decrypt.

use aes::{Aes128, Aes256};
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::distributions::Alphanumeric;
use rand::Rng;
use zeroize::Zeroize;

use crate::identity::MacAddr;

pub const AES_BLOCK_SIZE: usize = 16;
pub const IV_LEN: usize = 16;

/// AES key, 128 or 256 bit. Zeroized on drop.
#[derive(Clone, Eq, PartialEq)]
pub enum AesKey {
    Aes128([u8; 16]),
    Aes256([u8; 32]),
}

impl AesKey {
    /// `None` unless `bytes` is 16 or 32 bytes long.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        match bytes.len() {
            16 => bytes.try_into().ok().map(AesKey::Aes128),
            32 => bytes.try_into().ok().map(AesKey::Aes256),
            _ => None,
        }
    }

    /// Readable 16-character alphanumeric key, the format repeater firmware provisions.
    pub fn generate_readable() -> Self {
        AesKey::Aes128(readable_block())
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            AesKey::Aes128(k) => k,
            AesKey::Aes256(k) => k,
        }
    }
}

impl std::fmt::Debug for AesKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AesKey::Aes128(_) => f.write_str("AesKey::Aes128(..)"),
            AesKey::Aes256(_) => f.write_str("AesKey::Aes256(..)"),
        }
    }
}

impl Drop for AesKey {
    fn drop(&mut self) {
        match self {
            AesKey::Aes128(k) => k.zeroize(),
            AesKey::Aes256(k) => k.zeroize(),
        }
    }
}

/// Key, IV and the device MAC they are bound to. Set together, never partially.
#[derive(Clone, Eq, PartialEq)]
pub struct KeyMaterial {
    key: AesKey,
    iv: [u8; IV_LEN],
    mac: MacAddr,
}

impl KeyMaterial {
    pub fn new(key: AesKey, iv: [u8; IV_LEN], mac: MacAddr) -> Self {
        Self { key, iv, mac }
    }

    pub fn key(&self) -> &AesKey {
        &self.key
    }

    pub fn iv(&self) -> &[u8; IV_LEN] {
        &self.iv
    }

    pub fn mac(&self) -> MacAddr {
        self.mac
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        encrypt_cbc(&self.key, &self.iv, plaintext)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        decrypt_cbc(&self.key, &self.iv, ciphertext)
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("key", &self.key)
            .field("mac", &self.mac)
            .finish_non_exhaustive()
    }
}

impl Drop for KeyMaterial {
    fn drop(&mut self) {
        self.iv.zeroize();
    }
}

/// Fresh 16-character alphanumeric IV. The repeater expects printable IVs.
pub fn generate_iv() -> [u8; IV_LEN] {
    readable_block()
}

fn readable_block() -> [u8; 16] {
    let mut out = [0u8; 16];
    let mut rng = rand::thread_rng();
    for b in out.iter_mut() {
        *b = rng.sample(Alphanumeric);
    }
    out
}

/// Ciphertext length for a plaintext of `len` bytes (PKCS#7 always pads).
pub fn padded_len(len: usize) -> usize {
    AES_BLOCK_SIZE - (len % AES_BLOCK_SIZE) + len
}

/// AES-CBC encrypt with PKCS#7 padding.
pub fn encrypt_cbc(key: &AesKey, iv: &[u8; IV_LEN], plaintext: &[u8]) -> Vec<u8> {
    match key {
        AesKey::Aes128(k) => cbc::Encryptor::<Aes128>::new(&(*k).into(), &(*iv).into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        AesKey::Aes256(k) => cbc::Encryptor::<Aes256>::new(&(*k).into(), &(*iv).into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
    }
}

/// AES-CBC decrypt and strip PKCS#7 padding.
pub fn decrypt_cbc(
    key: &AesKey,
    iv: &[u8; IV_LEN],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.is_empty() || ciphertext.len() % AES_BLOCK_SIZE != 0 {
        return Err(CryptoError::Unaligned(ciphertext.len()));
    }
    let plain = match key {
        AesKey::Aes128(k) => cbc::Decryptor::<Aes128>::new(&(*k).into(), &(*iv).into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext),
        AesKey::Aes256(k) => cbc::Decryptor::<Aes256>::new(&(*k).into(), &(*iv).into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext),
    };
    plain.map_err(|_| CryptoError::BadPadding)
}

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum CryptoError {
    #[error("ciphertext length {0} is not a positive multiple of the block size")]
    Unaligned(usize),
    #[error("invalid padding")]
    BadPadding,
}
