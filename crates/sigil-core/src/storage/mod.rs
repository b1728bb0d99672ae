//! Storage abstraction for the protocol store
//!
//! Trait-based abstraction for persisting raw records. The trait is
//! synchronous (no async); the store calls it from inside zone bodies and
//! never holds a lock across it.
//!
//! Every record type gets the same six operations, selected by the record's
//! [`Table`]. Zone commits go through
//! [`Storage::commit_decrypt_result`], which must be atomic.

mod chaotic;
mod error;
mod memory;
mod redb;

pub use chaotic::ChaoticStorage;
pub use error::StorageError;
pub use memory::MemoryStorage;
use serde::{Serialize, de::DeserializeOwned};

pub use self::redb::RedbStorage;
use crate::records::CommitBatch;

/// Logical tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    /// Peer identity keys
    IdentityKeys,
    /// Pairwise sessions
    Sessions,
    /// One-time pre-keys
    PreKeys,
    /// Signed pre-keys
    SignedPreKeys,
    /// Group sender keys
    SenderKeys,
    /// Envelopes awaiting decryption
    Unprocessed,
    /// Group rows with sender key bookkeeping
    Groups,
    /// Settings items
    Items,
}

impl Table {
    /// Every table, in a fixed order.
    pub const ALL: [Table; 8] = [
        Table::IdentityKeys,
        Table::Sessions,
        Table::PreKeys,
        Table::SignedPreKeys,
        Table::SenderKeys,
        Table::Unprocessed,
        Table::Groups,
        Table::Items,
    ];

    /// Table name used by durable adapters.
    pub const fn name(self) -> &'static str {
        match self {
            Table::IdentityKeys => "identity_keys",
            Table::Sessions => "sessions",
            Table::PreKeys => "pre_keys",
            Table::SignedPreKeys => "signed_pre_keys",
            Table::SenderKeys => "sender_keys",
            Table::Unprocessed => "unprocessed",
            Table::Groups => "groups",
            Table::Items => "items",
        }
    }

    /// Whether a configuration wipe clears this table outright.
    ///
    /// Groups survive; only their sender key bookkeeping is cleared.
    pub const fn is_configuration(self) -> bool {
        !matches!(self, Table::Groups)
    }
}

/// A row type with a fixed table and string id.
pub trait Record: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Table the record lives in
    const TABLE: Table;

    /// Row id
    fn record_id(&self) -> &str;
}

/// Storage abstraction for protocol store records
///
/// Must be Clone (shared by the store and tooling), Send + Sync, and
/// synchronous. Implementations typically share internal state via Arc, so
/// clones access the same underlying storage.
pub trait Storage: Clone + Send + Sync + 'static {
    /// Insert or replace a record by id.
    fn create_or_update<R: Record>(&self, record: &R) -> Result<(), StorageError>;

    /// Fetch a record by id. `None` if absent.
    fn get_by_id<R: Record>(&self, id: &str) -> Result<Option<R>, StorageError>;

    /// Insert or replace many records in one write.
    fn bulk_add<R: Record>(&self, records: &[R]) -> Result<(), StorageError>;

    /// Delete records by id. Missing ids are ignored.
    fn remove_by_ids<R: Record>(&self, ids: &[String]) -> Result<(), StorageError>;

    /// Delete one record by id.
    fn remove_by_id<R: Record>(&self, id: &str) -> Result<(), StorageError> {
        self.remove_by_ids::<R>(&[id.to_string()])
    }

    /// Delete every record of the type.
    fn remove_all<R: Record>(&self) -> Result<(), StorageError>;

    /// Every record of the type. Order is not guaranteed.
    fn get_all<R: Record>(&self) -> Result<Vec<R>, StorageError>;

    /// Write sender keys, sessions and unprocessed envelopes atomically.
    ///
    /// # Invariants
    ///
    /// - Post: either every row in `batch` is persisted or none is
    fn commit_decrypt_result(&self, batch: &CommitBatch) -> Result<(), StorageError>;

    /// Delete every row in every table.
    fn remove_all_data(&self) -> Result<(), StorageError>;

    /// Delete keys, sessions, envelopes and items, keeping group rows but
    /// clearing their sender key bookkeeping.
    fn remove_all_configuration(&self) -> Result<(), StorageError>;
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(value, &mut bytes)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    Ok(bytes)
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    ciborium::from_reader(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}
