#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard},
};

use super::{Record, Storage, StorageError, Table, decode, encode};
use crate::records::{CommitBatch, StoredGroup};

/// In-memory storage implementation for testing and simulation
///
/// Rows are kept CBOR-encoded, like the durable adapter, so encoding bugs
/// surface in memory-backed tests too. All state is wrapped in
/// `Arc<Mutex<>>` to allow Clone and concurrent access.
#[derive(Clone)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryStorageInner>>,
}

#[derive(Default)]
struct MemoryStorageInner {
    /// Encoded rows per table, keyed by row id
    tables: HashMap<Table, BTreeMap<String, Vec<u8>>>,

    /// Number of mutating calls that reached storage
    writes: usize,
}

impl MemoryStorageInner {
    fn table(&mut self, table: Table) -> &mut BTreeMap<String, Vec<u8>> {
        self.tables.entry(table).or_default()
    }

    fn put<R: Record>(&mut self, record: &R) -> Result<(), StorageError> {
        let bytes = encode(record)?;
        self.table(R::TABLE).insert(record.record_id().to_string(), bytes);
        Ok(())
    }
}

impl MemoryStorage {
    /// Create a new empty `MemoryStorage`
    pub fn new() -> Self {
        Self { inner: Arc::new(Mutex::new(MemoryStorageInner::default())) }
    }

    /// Number of mutating calls so far.
    ///
    /// Lets tests assert that a read path did not write.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned. This is acceptable for test
    /// code.
    #[allow(clippy::expect_used)]
    pub fn writes(&self) -> usize {
        self.inner.lock().expect("Mutex poisoned").writes
    }

    /// Number of rows in `table`.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned. This is acceptable for test
    /// code.
    #[allow(clippy::expect_used)]
    pub fn row_count(&self, table: Table) -> usize {
        self.inner.lock().expect("Mutex poisoned").tables.get(&table).map_or(0, BTreeMap::len)
    }

    #[allow(clippy::expect_used)]
    fn lock(&self) -> MutexGuard<'_, MemoryStorageInner> {
        self.inner.lock().expect("Mutex poisoned")
    }

    fn write(&self) -> MutexGuard<'_, MemoryStorageInner> {
        let mut inner = self.lock();
        inner.writes += 1;
        inner
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

/// # Panics
///
/// Every method panics if the internal mutex is poisoned. This is acceptable
/// for test code.
impl Storage for MemoryStorage {
    fn create_or_update<R: Record>(&self, record: &R) -> Result<(), StorageError> {
        self.write().put(record)
    }

    fn get_by_id<R: Record>(&self, id: &str) -> Result<Option<R>, StorageError> {
        let mut inner = self.lock();
        inner.table(R::TABLE).get(id).map(|bytes| decode(bytes)).transpose()
    }

    fn bulk_add<R: Record>(&self, records: &[R]) -> Result<(), StorageError> {
        // Encode everything first so a bad record leaves the table untouched.
        let encoded = records
            .iter()
            .map(|record| Ok((record.record_id().to_string(), encode(record)?)))
            .collect::<Result<Vec<_>, StorageError>>()?;

        let mut inner = self.write();
        inner.table(R::TABLE).extend(encoded);
        Ok(())
    }

    fn remove_by_ids<R: Record>(&self, ids: &[String]) -> Result<(), StorageError> {
        let mut inner = self.write();
        let table = inner.table(R::TABLE);
        for id in ids {
            table.remove(id);
        }
        Ok(())
    }

    fn remove_all<R: Record>(&self) -> Result<(), StorageError> {
        self.write().table(R::TABLE).clear();
        Ok(())
    }

    fn get_all<R: Record>(&self) -> Result<Vec<R>, StorageError> {
        let mut inner = self.lock();
        inner.table(R::TABLE).values().map(|bytes| decode(bytes)).collect()
    }

    fn commit_decrypt_result(&self, batch: &CommitBatch) -> Result<(), StorageError> {
        let mut rows = Vec::with_capacity(
            batch.sender_keys.len() + batch.sessions.len() + batch.unprocessed.len(),
        );
        for record in &batch.sender_keys {
            rows.push((Table::SenderKeys, record.id.clone(), encode(record)?));
        }
        for record in &batch.sessions {
            rows.push((Table::Sessions, record.id.clone(), encode(record)?));
        }
        for record in &batch.unprocessed {
            rows.push((Table::Unprocessed, record.id.clone(), encode(record)?));
        }

        let mut inner = self.write();
        for (table, id, bytes) in rows {
            inner.table(table).insert(id, bytes);
        }
        Ok(())
    }

    fn remove_all_data(&self) -> Result<(), StorageError> {
        self.write().tables.clear();
        Ok(())
    }

    fn remove_all_configuration(&self) -> Result<(), StorageError> {
        let mut inner = self.write();

        let groups = inner
            .table(Table::Groups)
            .values()
            .map(|bytes| decode::<StoredGroup>(bytes))
            .collect::<Result<Vec<_>, _>>()?;
        let cleared = groups
            .into_iter()
            .map(|group| {
                let group = StoredGroup { sender_key_info: None, ..group };
                Ok((group.id.clone(), encode(&group)?))
            })
            .collect::<Result<BTreeMap<_, _>, StorageError>>()?;

        inner.tables.retain(|table, _| !table.is_configuration());
        inner.tables.insert(Table::Groups, cleared);
        Ok(())
    }
}
