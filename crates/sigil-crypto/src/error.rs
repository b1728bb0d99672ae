//! Error types for key and session state.

use thiserror::Error;

/// Errors raised while building, advancing, or decoding cryptographic state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Key material had the wrong length
    #[error("invalid {kind} length: expected {expected}, got {got}")]
    InvalidKeyLength {
        /// What kind of key was being decoded
        kind: &'static str,
        /// Required length in bytes
        expected: usize,
        /// Length that was supplied
        got: usize,
    },

    /// Public key bytes do not describe a valid curve point
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Signature did not verify against the public key
    #[error("signature verification failed")]
    InvalidSignature,

    /// A chain index reached `u32::MAX`
    #[error("chain index overflow at {index}")]
    ChainOverflow {
        /// Index at which the overflow was detected
        index: u32,
    },

    /// The operation needs a current session state but the record is archived
    #[error("session has no current state")]
    NoCurrentState,

    /// CBOR encode or decode failed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A legacy session record could not be converted
    #[error("malformed legacy session: {0}")]
    MalformedLegacySession(String),
}
