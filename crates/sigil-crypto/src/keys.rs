//! Identity and pre-key key pairs.
//!
//! Key pairs are Ed25519. The public half is kept as raw bytes so it can be
//! compared in constant time and persisted without re-encoding.

use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::CryptoError;

/// Length of a serialized public key.
pub const PUBLIC_KEY_LEN: usize = 32;

/// Length of a serialized private key (the Ed25519 seed).
pub const PRIVATE_KEY_LEN: usize = 32;

/// Length of a detached signature.
pub const SIGNATURE_LEN: usize = 64;

/// A 32-byte public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey([u8; PUBLIC_KEY_LEN]);

impl PublicKey {
    /// Wrap raw key bytes.
    pub fn new(bytes: [u8; PUBLIC_KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Decode from a byte slice, rejecting anything that is not 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let array: [u8; PUBLIC_KEY_LEN] =
            bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
                kind: "public key",
                expected: PUBLIC_KEY_LEN,
                got: bytes.len(),
            })?;
        Ok(Self(array))
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.0
    }

    /// Constant-time comparison against another key.
    pub fn ct_eq(&self, other: &Self) -> bool {
        self.0.iter().zip(other.0.iter()).fold(0u8, |acc, (a, b)| acc | (a ^ b)) == 0
    }

    /// Verify a detached signature made by the matching private key.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        let key = VerifyingKey::from_bytes(&self.0).map_err(|_| CryptoError::InvalidPublicKey)?;
        let signature =
            Signature::from_slice(signature).map_err(|_| CryptoError::InvalidSignature)?;
        key.verify(message, &signature).map_err(|_| CryptoError::InvalidSignature)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey(")?;
        for byte in &self.0[..4] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "..)")
    }
}

/// An Ed25519 key pair.
///
/// The private half is zeroized on drop by `ed25519_dalek`.
#[derive(Clone)]
pub struct KeyPair {
    signing: SigningKey,
}

impl KeyPair {
    /// Derive a key pair from 32 bytes of secret seed material.
    ///
    /// Callers supply the randomness so key generation stays deterministic
    /// under a seeded environment.
    pub fn from_seed(seed: &[u8; PRIVATE_KEY_LEN]) -> Self {
        Self { signing: SigningKey::from_bytes(seed) }
    }

    /// Rebuild a key pair from persisted private and public halves.
    ///
    /// The public half must match the one derived from the private key.
    pub fn from_parts(private_key: &[u8], public_key: &[u8]) -> Result<Self, CryptoError> {
        let seed: [u8; PRIVATE_KEY_LEN] =
            private_key.try_into().map_err(|_| CryptoError::InvalidKeyLength {
                kind: "private key",
                expected: PRIVATE_KEY_LEN,
                got: private_key.len(),
            })?;
        let pair = Self::from_seed(&seed);
        let expected = PublicKey::from_slice(public_key)?;
        if !pair.public_key().ct_eq(&expected) {
            return Err(CryptoError::InvalidPublicKey);
        }
        Ok(pair)
    }

    /// Public half.
    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing.verifying_key().to_bytes())
    }

    /// Private seed bytes, zeroized when the returned buffer drops.
    pub fn private_key(&self) -> Zeroizing<[u8; PRIVATE_KEY_LEN]> {
        Zeroizing::new(self.signing.to_bytes())
    }

    /// Produce a detached signature over `message`.
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.signing.sign(message).to_bytes()
    }
}

impl PartialEq for KeyPair {
    fn eq(&self, other: &Self) -> bool {
        self.public_key() == other.public_key()
    }
}

impl Eq for KeyPair {}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair").field("public", &self.public_key()).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed(byte: u8) -> [u8; 32] {
        [byte; 32]
    }

    #[test]
    fn key_pair_is_deterministic() {
        let a = KeyPair::from_seed(&seed(7));
        let b = KeyPair::from_seed(&seed(7));
        assert_eq!(a.public_key(), b.public_key());
    }

    #[test]
    fn sign_then_verify() {
        let pair = KeyPair::from_seed(&seed(1));
        let signature = pair.sign(b"signed pre-key");
        assert!(pair.public_key().verify(b"signed pre-key", &signature).is_ok());
        assert_eq!(
            pair.public_key().verify(b"tampered", &signature),
            Err(CryptoError::InvalidSignature)
        );
    }

    #[test]
    fn from_parts_rejects_mismatched_public_key() {
        let pair = KeyPair::from_seed(&seed(1));
        let other = KeyPair::from_seed(&seed(2));
        let result = KeyPair::from_parts(&*pair.private_key(), other.public_key().as_bytes());
        assert_eq!(result, Err(CryptoError::InvalidPublicKey));
    }

    #[test]
    fn public_key_rejects_short_input() {
        let err = PublicKey::from_slice(&[0u8; 31]).unwrap_err();
        assert_eq!(
            err,
            CryptoError::InvalidKeyLength { kind: "public key", expected: 32, got: 31 }
        );
    }

    #[test]
    fn ct_eq_matches_eq() {
        let a = KeyPair::from_seed(&seed(3)).public_key();
        let b = KeyPair::from_seed(&seed(4)).public_key();
        assert!(a.ct_eq(&a));
        assert!(!a.ct_eq(&b));
    }
}
