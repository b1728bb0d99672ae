//! Sigil cryptographic state
//!
//! The objects the protocol store persists and hands back to callers: key
//! pairs, pairwise session records, group sender key records, and the
//! conversion of legacy session records. Pure functions with deterministic
//! outputs; callers provide random bytes.
//!
//! # Key Lifecycle
//!
//! ```text
//! Handshake secret
//!        │
//!        ▼
//! HKDF → root key, sending chain, receiving chain
//!        │
//!        ▼
//! Chain step (HMAC) → Message keys
//! ```
//!
//! Chain keys are overwritten on every step and message keys are zeroized on
//! drop, so compromise of current state does not expose past message keys.
//!
//! Archiving a [`SessionRecord`] moves its current state into a bounded
//! history: no new messages are encrypted with it, but messages already in
//! flight still decrypt.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod chain;
mod error;
mod keys;
pub mod legacy;
mod sender_key;
mod session;

pub use chain::{ChainKey, MessageKey};
pub use error::CryptoError;
pub use keys::{KeyPair, PRIVATE_KEY_LEN, PUBLIC_KEY_LEN, PublicKey, SIGNATURE_LEN};
pub use legacy::{LocalUserData, migrate_legacy_session};
pub use sender_key::{MAX_SENDER_KEY_STATES, SenderKeyRecord, SenderKeyState};
pub use session::{
    MAX_ARCHIVED_STATES, SESSION_PROTOCOL_VERSION, SessionParams, SessionRecord, SessionState,
};
