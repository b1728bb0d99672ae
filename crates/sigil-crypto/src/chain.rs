//! Symmetric chain keys.
//!
//! Each step derives a one-time message key and the next chain key from the
//! current chain key with HMAC-SHA256. The old chain key is overwritten on
//! every step so past message keys cannot be recomputed from current state.

use std::fmt;

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::CryptoError;

type HmacSha256 = Hmac<Sha256>;

/// Label for deriving a message key
const MESSAGE_LABEL: &[u8] = &[0x01];

/// Label for deriving the next chain key
const CHAIN_LABEL: &[u8] = &[0x02];

/// A message key derived from a chain step.
///
/// Used for a single message and then discarded.
#[derive(Clone)]
pub struct MessageKey {
    key: [u8; 32],
    index: u32,
}

impl MessageKey {
    /// 32-byte symmetric key.
    pub fn key(&self) -> &[u8; 32] {
        &self.key
    }

    /// Chain index this key was derived at.
    pub fn index(&self) -> u32 {
        self.index
    }
}

impl Drop for MessageKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Chain key with its position in the chain.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainKey {
    key: [u8; 32],
    index: u32,
}

impl ChainKey {
    /// Start a chain from raw key material at `index`.
    pub fn new(key: [u8; 32], index: u32) -> Self {
        Self { key, index }
    }

    /// Current position in the chain.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Raw chain key bytes.
    pub fn key(&self) -> &[u8; 32] {
        &self.key
    }

    /// Derive the message key at the current index and step the chain.
    pub fn step(&mut self) -> Result<MessageKey, CryptoError> {
        if self.index == u32::MAX {
            return Err(CryptoError::ChainOverflow { index: self.index });
        }

        let message = MessageKey { key: self.mac(MESSAGE_LABEL), index: self.index };
        let next = self.mac(CHAIN_LABEL);

        self.key.zeroize();
        self.key = next;
        self.index += 1;

        Ok(message)
    }

    fn mac(&self, label: &[u8]) -> [u8; 32] {
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.key) else {
            unreachable!("HMAC-SHA256 accepts any key size");
        };
        mac.update(label);
        let result = mac.finalize().into_bytes();

        let mut key = [0u8; 32];
        key.copy_from_slice(&result);
        key
    }
}

impl Drop for ChainKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl fmt::Debug for ChainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainKey").field("index", &self.index).finish_non_exhaustive()
    }
}

/// Expand `secret` into `N` 32-byte keys bound to `label`.
pub(crate) fn expand<const N: usize>(secret: &[u8], label: &[u8]) -> [[u8; 32]; N] {
    let hkdf = Hkdf::<Sha256>::new(None, secret);
    let mut okm = vec![0u8; 32 * N];
    let Ok(()) = hkdf.expand(label, &mut okm) else {
        unreachable!("output length stays within the HKDF-SHA256 limit");
    };

    let mut keys = [[0u8; 32]; N];
    for (key, chunk) in keys.iter_mut().zip(okm.chunks_exact(32)) {
        key.copy_from_slice(chunk);
    }
    okm.zeroize();
    keys
}
