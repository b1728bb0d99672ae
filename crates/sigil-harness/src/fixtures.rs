//! Builders shared by the harness tests.

#![allow(clippy::disallowed_types, reason = "Scripted sender state is never held across await")]
#![allow(clippy::expect_used, reason = "Fixtures only run in tests")]

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;
use sigil_core::{
    Address, DeviceId, MemoryStorage, NullMessageSender, ProtocolStore, QualifiedAddress,
    ServiceId, StoreConfig, StoreError,
    records::{StoredSession, StoredUnprocessed},
};
use sigil_crypto::{
    KeyPair, SessionParams, SessionRecord, SessionState,
    legacy::{LEGACY_OPEN, LegacySessionEntry, LegacySessionRecord},
};

use crate::SimEnv;

/// Our own service id in every fixture.
pub const OUR_SERVICE_ID: &str = "me";

/// Our registration id in every fixture.
pub const OUR_REGISTRATION_ID: u32 = 1;

/// Store over memory storage and a seeded environment.
pub type SimStore = ProtocolStore<SimEnv, MemoryStorage>;

/// Service id from a literal.
pub fn service(id: &str) -> ServiceId {
    ServiceId::new(id).expect("fixture service ids are valid")
}

/// Our service id.
pub fn me() -> ServiceId {
    service(OUR_SERVICE_ID)
}

/// Address of `peer`'s device `device`.
pub fn peer(peer: &str, device: u32) -> Address {
    Address::new(service(peer), DeviceId(device))
}

/// Address of `peer`'s device `device`, as seen by us.
pub fn session_address(peer_id: &str, device: u32) -> QualifiedAddress {
    QualifiedAddress::new(me(), peer(peer_id, device))
}

/// Deterministic key pair; distinct `n` give distinct keys.
pub fn identity_key(n: u8) -> KeyPair {
    KeyPair::from_seed(&[n; 32])
}

/// Our identity key pair.
pub fn our_identity() -> KeyPair {
    identity_key(1)
}

/// Session record with an open state towards `remote`.
pub fn open_session(remote: &KeyPair, remote_registration_id: u32) -> SessionRecord {
    SessionRecord::new(SessionState::initialize(&SessionParams {
        local_identity: our_identity().public_key(),
        remote_identity: remote.public_key(),
        local_registration_id: OUR_REGISTRATION_ID,
        remote_registration_id,
        shared_secret: [0x5a; 32],
        initiator: true,
    }))
}

/// Legacy record bytes with one closed entry and, if `open`, one open entry.
pub fn legacy_session_bytes(remote: &KeyPair, remote_registration_id: u32, open: bool) -> Vec<u8> {
    let entry = |closed: i64| LegacySessionEntry {
        registration_id: remote_registration_id,
        remote_identity_key: remote.public_key().as_bytes().to_vec(),
        root_key: vec![3; 32],
        sending_chain_key: vec![4; 32],
        sending_counter: 5,
        receiving_chain_key: Some(vec![6; 32]),
        receiving_counter: -1,
        previous_counter: 0,
        closed,
    };

    let mut sessions = vec![entry(1_600_000_000_000)];
    if open {
        sessions.push(entry(LEGACY_OPEN));
    }
    LegacySessionRecord { sessions }.to_bytes().expect("legacy fixture encodes")
}

/// Raw session row without a schema version.
pub fn legacy_row(address: &QualifiedAddress, bytes: Vec<u8>) -> StoredSession {
    StoredSession {
        id: address.to_string(),
        our_service_id: address.our_service_id.clone(),
        service_id: address.service_id().clone(),
        conversation_id: address.service_id().to_string(),
        device_id: address.device_id(),
        record: bytes,
        version: None,
    }
}

/// Envelope received at `received_at` with no attempts yet.
pub fn envelope(id: &str, received_at: u64) -> StoredUnprocessed {
    StoredUnprocessed {
        id: id.to_string(),
        version: 2,
        attempts: 0,
        envelope: id.as_bytes().to_vec(),
        received_at,
        timestamp: received_at,
        source_service_id: None,
        source_device: None,
        server_guid: None,
        server_timestamp: None,
        decrypted: None,
        urgent: true,
    }
}

/// Open a store over `storage` with our local identity already set.
pub fn bootstrap_store_with(env: SimEnv, storage: MemoryStorage, config: StoreConfig) -> SimStore {
    let store = ProtocolStore::open(env, storage, config).expect("store opens");
    store
        .set_local_identity(&me(), &our_identity(), OUR_REGISTRATION_ID)
        .expect("local identity saved");
    store
}

/// Fresh store seeded with `seed`, default config, local identity set.
pub fn bootstrap_store(seed: u64) -> SimStore {
    bootstrap_store_with(SimEnv::with_seed(seed), MemoryStorage::new(), StoreConfig::default())
}

/// [`NullMessageSender`] that replays scripted outcomes.
///
/// Succeeds once the script runs out.
#[derive(Clone, Default)]
pub struct ScriptedSender {
    script: Arc<Mutex<VecDeque<bool>>>,
    sent: Arc<Mutex<Vec<ServiceId>>>,
}

impl ScriptedSender {
    /// Sender that always succeeds.
    pub fn succeeding() -> Self {
        Self::default()
    }

    /// Sender whose next sends succeed or fail per `outcomes`.
    pub fn scripted(outcomes: impl IntoIterator<Item = bool>) -> Self {
        let sender = Self::default();
        sender.script.lock().unwrap_or_else(PoisonError::into_inner).extend(outcomes);
        sender
    }

    /// Every service id a send was attempted for, in order.
    pub fn sent(&self) -> Vec<ServiceId> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl NullMessageSender for ScriptedSender {
    async fn send_null_message(&self, service_id: &ServiceId) -> Result<(), StoreError> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).push(service_id.clone());
        let succeed =
            self.script.lock().unwrap_or_else(PoisonError::into_inner).pop_front().unwrap_or(true);
        if succeed {
            Ok(())
        } else {
            Err(StoreError::Storage(sigil_core::StorageError::Io(format!(
                "null message to {service_id} not delivered"
            ))))
        }
    }
}
