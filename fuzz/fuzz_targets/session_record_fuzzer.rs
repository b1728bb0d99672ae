//! Fuzz target for session and sender key record decoding
//!
//! Feeds arbitrary bytes to the current-layout decoders.
//!
//! # Invariants
//!
//! - Decoding NEVER panics; malformed input is an error
//! - A record that decodes re-encodes, and the re-encoding decodes to the
//!   same record
//! - Decoded records never exceed the archived state limit

#![no_main]

use libfuzzer_sys::fuzz_target;
use sigil_crypto::{MAX_ARCHIVED_STATES, SenderKeyRecord, SessionRecord};

fuzz_target!(|data: &[u8]| {
    if let Ok(record) = SessionRecord::deserialize(data) {
        assert!(record.previous_states().count() <= MAX_ARCHIVED_STATES);
        let bytes = record.serialize().expect("decoded record re-encodes");
        let again = SessionRecord::deserialize(&bytes).expect("re-encoded record decodes");
        assert_eq!(again, record);
    }

    if let Ok(record) = SenderKeyRecord::deserialize(data) {
        let bytes = record.serialize().expect("decoded sender key re-encodes");
        let again = SenderKeyRecord::deserialize(&bytes).expect("re-encoded sender key decodes");
        assert_eq!(again, record);
    }
});
