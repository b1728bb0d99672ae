//! Fuzz target for legacy session migration
//!
//! Builds legacy records from structured input (so most cases get past the
//! CBOR layer) and also tries raw bytes.
//!
//! # Invariants
//!
//! - Migration NEVER panics; malformed entries are errors
//! - The open entry, and only the open entry, becomes the current state
//! - Closed entries become archived states, capped at the archive limit
//! - A migrated record survives a serialize/deserialize round trip

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use sigil_crypto::{
    KeyPair, LocalUserData, MAX_ARCHIVED_STATES, SessionRecord,
    legacy::{LEGACY_OPEN, LegacySessionEntry, LegacySessionRecord},
    migrate_legacy_session,
};

#[derive(Debug, Arbitrary)]
enum Input {
    /// Arbitrary bytes straight into the decoder
    Raw(Vec<u8>),
    /// Well-formed CBOR with fuzzed entry contents
    Structured(Vec<Entry>),
}

#[derive(Debug, Arbitrary)]
struct Entry {
    registration_id: u32,
    /// Seed for a valid identity key, or raw bytes when `None`
    identity_seed: Option<u8>,
    raw_identity: Vec<u8>,
    /// Whether the chain keys have the right length
    full_keys: bool,
    sending_counter: i64,
    receiving_counter: Option<i64>,
    previous_counter: u32,
    open: bool,
    closed_at: u32,
}

impl Entry {
    fn to_legacy(&self) -> LegacySessionEntry {
        let key_len = if self.full_keys { 32 } else { 31 };
        let remote_identity_key = match self.identity_seed {
            Some(seed) => KeyPair::from_seed(&[seed; 32]).public_key().as_bytes().to_vec(),
            None => self.raw_identity.clone(),
        };
        LegacySessionEntry {
            registration_id: self.registration_id,
            remote_identity_key,
            root_key: vec![1; 32],
            sending_chain_key: vec![2; key_len],
            sending_counter: self.sending_counter,
            receiving_chain_key: self.receiving_counter.map(|_| vec![3; 32]),
            receiving_counter: self.receiving_counter.unwrap_or(-1),
            previous_counter: self.previous_counter,
            closed: if self.open { LEGACY_OPEN } else { i64::from(self.closed_at) },
        }
    }
}

fuzz_target!(|input: Input| {
    let local = LocalUserData {
        identity_key_public: KeyPair::from_seed(&[7; 32]).public_key(),
        registration_id: 1,
    };

    let (bytes, entries) = match input {
        Input::Raw(bytes) => (bytes, None),
        Input::Structured(entries) => {
            let sessions: Vec<_> = entries.iter().map(Entry::to_legacy).collect();
            let record = LegacySessionRecord { sessions: sessions.clone() };
            (record.to_bytes().expect("legacy record encodes"), Some(sessions))
        },
    };

    let Ok(record) = migrate_legacy_session(&bytes, &local) else {
        return;
    };

    if let Some(sessions) = entries {
        let open = sessions.iter().filter(|entry| entry.closed == LEGACY_OPEN).count();
        assert_eq!(record.has_current_state(), open > 0);
        let closed = sessions.len() - usize::from(open > 0);
        assert_eq!(record.previous_states().count(), closed.min(MAX_ARCHIVED_STATES));
    }

    let bytes = record.serialize().expect("migrated record encodes");
    assert_eq!(SessionRecord::deserialize(&bytes).expect("migrated record decodes"), record);
});
