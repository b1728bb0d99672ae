//! Persisted record layouts.
//!
//! These are the raw rows the storage adapters read and write. Live objects
//! are built from them by the hydration layer ([`crate::cache`]).

use serde::{Deserialize, Serialize};

use crate::{
    ids::{DeviceId, DistributionId, ServiceId},
    storage::{Record, Table},
};

/// Session layout version written by this crate.
///
/// Rows without a version are legacy and are migrated on first read.
pub const CURRENT_SESSION_VERSION: u8 = 2;

/// Stored identity key of a peer.
///
/// `verified` is kept as the raw integer; values outside the known statuses
/// are rejected on hydration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredIdentityKey {
    /// Peer account
    pub id: ServiceId,
    /// Raw public key bytes
    pub public_key: Vec<u8>,
    /// Whether this key was the first one ever seen for the peer
    pub first_use: bool,
    /// Wall clock time (ms) the key was saved
    pub timestamp: u64,
    /// Raw verified status
    pub verified: u8,
    /// Whether the user acknowledged the latest key change
    pub nonblocking_approval: bool,
}

impl Record for StoredIdentityKey {
    const TABLE: Table = Table::IdentityKeys;

    fn record_id(&self) -> &str {
        self.id.as_str()
    }
}

/// Stored session for one peer device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSession {
    /// `our:peer.device`
    pub id: String,
    /// Which of our identities owns the session
    pub our_service_id: ServiceId,
    /// Peer account
    pub service_id: ServiceId,
    /// Conversation the peer belongs to
    pub conversation_id: String,
    /// Peer device
    pub device_id: DeviceId,
    /// Encoded session record
    pub record: Vec<u8>,
    /// Layout version; `None` for legacy rows
    pub version: Option<u8>,
}

impl Record for StoredSession {
    const TABLE: Table = Table::Sessions;

    fn record_id(&self) -> &str {
        &self.id
    }
}

/// Stored one-time pre-key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredPreKey {
    /// `our:key_id`
    pub id: String,
    /// Owning local identity
    pub our_service_id: ServiceId,
    /// Key id advertised to peers
    pub key_id: u32,
    /// Public half
    pub public_key: Vec<u8>,
    /// Private half
    pub private_key: Vec<u8>,
    /// Wall clock time (ms) of creation
    pub created_at: u64,
}

impl Record for StoredPreKey {
    const TABLE: Table = Table::PreKeys;

    fn record_id(&self) -> &str {
        &self.id
    }
}

/// Stored signed pre-key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSignedPreKey {
    /// `our:key_id`
    pub id: String,
    /// Owning local identity
    pub our_service_id: ServiceId,
    /// Key id advertised to peers
    pub key_id: u32,
    /// Public half
    pub public_key: Vec<u8>,
    /// Private half
    pub private_key: Vec<u8>,
    /// Identity signature over the public half
    pub signature: Vec<u8>,
    /// Wall clock time (ms) of creation
    pub created_at: u64,
    /// Whether the server acknowledged the upload
    pub confirmed: bool,
}

impl Record for StoredSignedPreKey {
    const TABLE: Table = Table::SignedPreKeys;

    fn record_id(&self) -> &str {
        &self.id
    }
}

/// Stored sender key for one (sender device, distribution).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSenderKey {
    /// `our:sender.device--distribution`
    pub id: String,
    /// `our:sender.device`
    pub sender_id: String,
    /// Group distribution
    pub distribution_id: DistributionId,
    /// Encoded sender key record
    pub data: Vec<u8>,
    /// Wall clock time (ms) of the last write
    pub last_updated: u64,
}

impl Record for StoredSenderKey {
    const TABLE: Table = Table::SenderKeys;

    fn record_id(&self) -> &str {
        &self.id
    }
}

/// Received envelope waiting for decryption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredUnprocessed {
    /// Envelope id
    pub id: String,
    /// Envelope layout version
    pub version: u8,
    /// Processing attempts so far
    pub attempts: u32,
    /// Raw envelope bytes
    pub envelope: Vec<u8>,
    /// Wall clock time (ms) of receipt
    pub received_at: u64,
    /// Sender timestamp (ms)
    pub timestamp: u64,
    /// Sender account, once known
    pub source_service_id: Option<ServiceId>,
    /// Sender device, once known
    pub source_device: Option<DeviceId>,
    /// Server-assigned guid
    pub server_guid: Option<String>,
    /// Server receive time (ms)
    pub server_timestamp: Option<u64>,
    /// Decrypted content, kept until the message is handled
    pub decrypted: Option<Vec<u8>>,
    /// Whether the envelope is marked urgent
    pub urgent: bool,
}

impl Record for StoredUnprocessed {
    const TABLE: Table = Table::Unprocessed;

    fn record_id(&self) -> &str {
        &self.id
    }
}

/// Fields filled in on an unprocessed envelope after decryption.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnprocessedUpdate {
    /// Sender account
    pub source_service_id: Option<ServiceId>,
    /// Sender device
    pub source_device: Option<DeviceId>,
    /// Server-assigned guid
    pub server_guid: Option<String>,
    /// Server receive time (ms)
    pub server_timestamp: Option<u64>,
    /// Decrypted content
    pub decrypted: Option<Vec<u8>>,
}

impl StoredUnprocessed {
    /// Apply `update`, keeping existing values where the update has none.
    pub fn apply(&mut self, update: UnprocessedUpdate) {
        if update.source_service_id.is_some() {
            self.source_service_id = update.source_service_id;
        }
        if update.source_device.is_some() {
            self.source_device = update.source_device;
        }
        if update.server_guid.is_some() {
            self.server_guid = update.server_guid;
        }
        if update.server_timestamp.is_some() {
            self.server_timestamp = update.server_timestamp;
        }
        if update.decrypted.is_some() {
            self.decrypted = update.decrypted;
        }
    }
}

/// A device known to hold the current group sender key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemberDevice {
    /// Device number
    pub id: DeviceId,
    /// Account of the device
    pub identifier: ServiceId,
    /// Registration id at the time of distribution
    pub registration_id: u32,
}

/// Sender key bookkeeping held on a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSenderKeyInfo {
    /// Wall clock time (ms) the current sender key was created
    pub created_at: u64,
    /// Distribution the sender key belongs to
    pub distribution_id: DistributionId,
    /// Devices that already hold the sender key
    pub member_devices: Vec<MemberDevice>,
}

/// Group row carrying sender key bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredGroup {
    /// Group id
    pub id: String,
    /// Sender key bookkeeping, absent until the first group send
    pub sender_key_info: Option<GroupSenderKeyInfo>,
}

impl Record for StoredGroup {
    const TABLE: Table = Table::Groups;

    fn record_id(&self) -> &str {
        &self.id
    }
}

/// Untyped settings value, CBOR-encoded by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredItem {
    /// Item key
    pub id: String,
    /// Encoded value
    pub value: Vec<u8>,
}

impl Record for StoredItem {
    const TABLE: Table = Table::Items;

    fn record_id(&self) -> &str {
        &self.id
    }
}

/// Writes committed together at the end of a zone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitBatch {
    /// Sender keys to create or update
    pub sender_keys: Vec<StoredSenderKey>,
    /// Sessions to create or update
    pub sessions: Vec<StoredSession>,
    /// Unprocessed envelopes to create or update
    pub unprocessed: Vec<StoredUnprocessed>,
}

impl CommitBatch {
    /// Whether there is nothing to write.
    pub fn is_empty(&self) -> bool {
        self.sender_keys.is_empty() && self.sessions.is_empty() && self.unprocessed.is_empty()
    }
}
