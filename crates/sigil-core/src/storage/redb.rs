//! Redb-backed durable storage implementation.
//!
//! Uses Redb's ACID transactions with Copy-on-Write for crash safety. Each
//! logical [`Table`] maps to one redb table keyed by row id with CBOR values.
//! Zone commits and wipes run in a single write transaction.

use std::{path::Path, sync::Arc};

use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};

use super::{Record, Storage, StorageError, Table, decode, encode};
use crate::records::{CommitBatch, StoredGroup};

/// Key: row id (UTF-8)
/// Value: CBOR-encoded record
type RowTable = TableDefinition<'static, &'static str, &'static [u8]>;

const fn definition(table: Table) -> RowTable {
    TableDefinition::new(table.name())
}

fn io(err: impl std::fmt::Display) -> StorageError {
    StorageError::Io(err.to_string())
}

/// Durable storage backed by Redb.
///
/// Thread-safe through Redb's internal locking. Clone is cheap (Arc).
#[derive(Clone)]
pub struct RedbStorage {
    db: Arc<Database>,
}

impl RedbStorage {
    /// Open or create a Redb database at the given path.
    ///
    /// Creates every table if missing.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the database cannot be opened or created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = Database::create(path.as_ref()).map_err(io)?;

        let txn = db.begin_write().map_err(io)?;
        for table in Table::ALL {
            let _ = txn.open_table(definition(table)).map_err(io)?;
        }
        txn.commit().map_err(io)?;

        Ok(Self { db: Arc::new(db) })
    }

    fn put_rows<'a>(
        txn: &WriteTransaction,
        table: Table,
        rows: impl IntoIterator<Item = (&'a str, Vec<u8>)>,
    ) -> Result<(), StorageError> {
        let mut handle = txn.open_table(definition(table)).map_err(io)?;
        for (id, bytes) in rows {
            handle.insert(id, bytes.as_slice()).map_err(io)?;
        }
        Ok(())
    }

    fn clear(txn: &WriteTransaction, table: Table) -> Result<(), StorageError> {
        let mut handle = txn.open_table(definition(table)).map_err(io)?;
        handle.retain(|_, _| false).map_err(io)?;
        Ok(())
    }

    fn encode_rows<R: Record>(records: &[R]) -> Result<Vec<(&str, Vec<u8>)>, StorageError> {
        records.iter().map(|record| Ok((record.record_id(), encode(record)?))).collect()
    }
}

impl Storage for RedbStorage {
    fn create_or_update<R: Record>(&self, record: &R) -> Result<(), StorageError> {
        self.bulk_add(std::slice::from_ref(record))
    }

    fn get_by_id<R: Record>(&self, id: &str) -> Result<Option<R>, StorageError> {
        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(definition(R::TABLE)).map_err(io)?;

        match table.get(id).map_err(io)? {
            Some(value) => Ok(Some(decode(value.value())?)),
            None => Ok(None),
        }
    }

    fn bulk_add<R: Record>(&self, records: &[R]) -> Result<(), StorageError> {
        let rows = Self::encode_rows(records)?;

        let txn = self.db.begin_write().map_err(io)?;
        Self::put_rows(&txn, R::TABLE, rows)?;
        txn.commit().map_err(io)?;

        Ok(())
    }

    fn remove_by_ids<R: Record>(&self, ids: &[String]) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(io)?;
        {
            let mut table = txn.open_table(definition(R::TABLE)).map_err(io)?;
            for id in ids {
                table.remove(id.as_str()).map_err(io)?;
            }
        }
        txn.commit().map_err(io)?;

        Ok(())
    }

    fn remove_all<R: Record>(&self) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(io)?;
        Self::clear(&txn, R::TABLE)?;
        txn.commit().map_err(io)?;

        Ok(())
    }

    fn get_all<R: Record>(&self) -> Result<Vec<R>, StorageError> {
        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(definition(R::TABLE)).map_err(io)?;

        let mut records = Vec::new();
        for result in table.iter().map_err(io)? {
            let (_, value) = result.map_err(io)?;
            records.push(decode(value.value())?);
        }

        Ok(records)
    }

    fn commit_decrypt_result(&self, batch: &CommitBatch) -> Result<(), StorageError> {
        let sender_keys = Self::encode_rows(&batch.sender_keys)?;
        let sessions = Self::encode_rows(&batch.sessions)?;
        let unprocessed = Self::encode_rows(&batch.unprocessed)?;

        let txn = self.db.begin_write().map_err(io)?;
        Self::put_rows(&txn, Table::SenderKeys, sender_keys)?;
        Self::put_rows(&txn, Table::Sessions, sessions)?;
        Self::put_rows(&txn, Table::Unprocessed, unprocessed)?;
        txn.commit().map_err(io)?;

        Ok(())
    }

    fn remove_all_data(&self) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(io)?;
        for table in Table::ALL {
            Self::clear(&txn, table)?;
        }
        txn.commit().map_err(io)?;

        Ok(())
    }

    fn remove_all_configuration(&self) -> Result<(), StorageError> {
        let groups: Vec<StoredGroup> = self.get_all()?;
        let cleared: Vec<StoredGroup> = groups
            .into_iter()
            .map(|group| StoredGroup { sender_key_info: None, ..group })
            .collect();
        let rows = Self::encode_rows(&cleared)?;

        let txn = self.db.begin_write().map_err(io)?;
        for table in Table::ALL.into_iter().filter(|table| table.is_configuration()) {
            Self::clear(&txn, table)?;
        }
        Self::put_rows(&txn, Table::Groups, rows)?;
        txn.commit().map_err(io)?;

        Ok(())
    }
}
