//! Conversion of pre-version-2 session records.
//!
//! The legacy layout stores every session for a peer device as a flat list of
//! entries. At most one entry is open (`closed == -1`); the rest carry the
//! millisecond timestamp at which they were closed. Chain counters record the
//! last index used, with `-1` meaning the chain is unused.
//!
//! Migration needs the local identity key and registration id because the
//! legacy layout never stored them per entry.

use serde::{Deserialize, Serialize};

use crate::{ChainKey, CryptoError, PublicKey, SessionRecord, SessionState};

/// `closed` value marking the open entry.
pub const LEGACY_OPEN: i64 = -1;

/// Local identity data the legacy layout lacks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LocalUserData {
    /// Our identity public key
    pub identity_key_public: PublicKey,
    /// Our registration id
    pub registration_id: u32,
}

/// Legacy on-disk session record.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacySessionRecord {
    /// All entries for the peer device, in no particular order
    pub sessions: Vec<LegacySessionEntry>,
}

/// One entry of a legacy session record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacySessionEntry {
    /// Peer registration id
    pub registration_id: u32,
    /// Peer identity key bytes
    pub remote_identity_key: Vec<u8>,
    /// Root key bytes
    pub root_key: Vec<u8>,
    /// Sending chain key bytes
    pub sending_chain_key: Vec<u8>,
    /// Last sending index used, `-1` if none
    pub sending_counter: i64,
    /// Receiving chain key bytes, absent before the first reply
    pub receiving_chain_key: Option<Vec<u8>>,
    /// Last receiving index used, `-1` if none
    pub receiving_counter: i64,
    /// Messages sent on the previous sending chain
    pub previous_counter: u32,
    /// `-1` when open, otherwise the close time in milliseconds
    pub closed: i64,
}

impl LegacySessionRecord {
    /// Encode to CBOR.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes)
            .map_err(|e| CryptoError::Serialization(e.to_string()))?;
        Ok(bytes)
    }

    /// Decode from CBOR.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        ciborium::from_reader(bytes).map_err(|e| CryptoError::MalformedLegacySession(e.to_string()))
    }
}

/// Convert a legacy record into the current [`SessionRecord`] layout.
///
/// The open entry becomes the current state. Closed entries become archived
/// states, most recently closed first.
pub fn migrate_legacy_session(
    bytes: &[u8],
    local: &LocalUserData,
) -> Result<SessionRecord, CryptoError> {
    let legacy = LegacySessionRecord::from_bytes(bytes)?;

    let mut entries = legacy.sessions;
    let open_index = entries.iter().position(|entry| entry.closed == LEGACY_OPEN);
    let open = open_index.map(|index| entries.remove(index));

    entries.sort_by(|a, b| b.closed.cmp(&a.closed));

    let current = open.map(|entry| convert_entry(&entry, local)).transpose()?;
    let previous =
        entries.iter().map(|entry| convert_entry(entry, local)).collect::<Result<Vec<_>, _>>()?;

    Ok(SessionRecord::from_states(current, previous))
}

fn convert_entry(
    entry: &LegacySessionEntry,
    local: &LocalUserData,
) -> Result<SessionState, CryptoError> {
    let remote_identity = PublicKey::from_slice(&entry.remote_identity_key)
        .map_err(|e| CryptoError::MalformedLegacySession(e.to_string()))?;
    let root_key = key_bytes(&entry.root_key, "root key")?;
    let sending = ChainKey::new(
        key_bytes(&entry.sending_chain_key, "sending chain key")?,
        next_index(entry.sending_counter)?,
    );
    let receiving = entry
        .receiving_chain_key
        .as_deref()
        .map(|key| {
            Ok::<_, CryptoError>(ChainKey::new(
                key_bytes(key, "receiving chain key")?,
                next_index(entry.receiving_counter)?,
            ))
        })
        .transpose()?;

    Ok(SessionState::from_parts(
        local.identity_key_public,
        remote_identity,
        local.registration_id,
        entry.registration_id,
        root_key,
        sending,
        receiving,
        entry.previous_counter,
    ))
}

fn key_bytes(bytes: &[u8], what: &str) -> Result<[u8; 32], CryptoError> {
    bytes.try_into().map_err(|_| {
        CryptoError::MalformedLegacySession(format!("{what} has {} bytes", bytes.len()))
    })
}

fn next_index(counter: i64) -> Result<u32, CryptoError> {
    counter
        .checked_add(1)
        .and_then(|index| u32::try_from(index).ok())
        .filter(|index| *index < u32::MAX)
        .ok_or_else(|| {
            CryptoError::MalformedLegacySession(format!("counter {counter} out of range"))
        })
}
