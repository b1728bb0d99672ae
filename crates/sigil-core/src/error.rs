//! Protocol store error types.

use std::time::Duration;

use sigil_crypto::CryptoError;
use thiserror::Error;

use crate::storage::StorageError;

/// Errors surfaced by [`crate::ProtocolStore`] operations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Record is absent.
    ///
    /// Most callers treat this as a bootstrap signal (fetch keys, start a
    /// handshake) rather than a failure.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Kind of record that was looked up
        kind: &'static str,
        /// Identifier that was looked up
        id: String,
    },

    /// Persisted data violates its schema.
    ///
    /// Never coerced. Callers should restart at this boundary.
    #[error("corrupt record: {0}")]
    Corruption(String),

    /// Identity gate refused a send.
    #[error("untrusted identity for {service_id}: {reason}")]
    Trust {
        /// Peer whose identity failed the gate
        service_id: String,
        /// Which gate failed
        reason: TrustError,
    },

    /// Queued job exceeded its time allowance.
    #[error("job on queue {queue} timed out after {after:?}")]
    Timeout {
        /// Queue key the job ran under
        queue: String,
        /// Allowance that was exceeded
        after: Duration,
    },

    /// Queue can no longer accept jobs.
    #[error("queue {0} is closed")]
    QueueClosed(String),

    /// Legacy session migration lacks local identity data.
    ///
    /// Indicates a deeper invariant violation; unreachable in correct use.
    #[error("session migration failed: {0}")]
    Migration(String),

    /// Malformed address or identifier.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),

    /// Persistence adapter failure.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Key or session state failure.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl StoreError {
    /// Whether the caller should stop rather than continue.
    ///
    /// Corruption and migration failures mean local state can no longer be
    /// trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Corruption(_) | Self::Migration(_))
    }

    /// Whether this is a plain "record absent" signal.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether retrying the whole logical operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Storage(err) => err.is_transient(),
            _ => false,
        }
    }

    pub(crate) fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { kind, id: id.into() }
    }
}

/// Reasons an identity is refused for sending.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustError {
    /// Stored key differs from the key about to be used
    #[error("identity key mismatch")]
    KeyMismatch,

    /// User marked the identity unverified
    #[error("identity is unverified")]
    Unverified,

    /// Key changed recently and the change has not been acknowledged
    #[error("identity change needs approval")]
    ApprovalRequired,
}
