//! Key material store: single writer (bind), many readers (session I/O).

use std::sync::RwLock;

use crate::crypto::KeyMaterial;

/// Holds the key material of the last successful bind. Key, IV and MAC are
/// replaced as one value, so readers never see a mixed pair.
#[derive(Debug, Default)]
pub struct KeyStore {
    slot: RwLock<Option<KeyMaterial>>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, material: KeyMaterial) {
        let mut slot = self.slot.write().unwrap_or_else(|e| e.into_inner());
        // previous value is zeroized by its Drop
        *slot = Some(material);
    }

    pub fn get(&self) -> Option<KeyMaterial> {
        self.slot.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_set(&self) -> bool {
        self.slot.read().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Drop the stored material. Zeroized on drop.
    pub fn clear(&self) {
        self.slot.write().unwrap_or_else(|e| e.into_inner()).take();
    }
}
