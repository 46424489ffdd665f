//! Persistent metadata store backed by redb.
//!
//! Provides versioned get/create/compare-and-set/delete/list over the tables
//! in [`crate::tables`]. Every write is one redb write transaction, so a
//! compare-and-set either commits both the version bump and the new payload
//! or nothing at all.

use crate::tables::Table;
use redb::{Database, ReadableTable};
use std::path::Path;
use tracing::{debug, info};

/// Size of the version prefix stored in front of every value
const VERSION_PREFIX_LEN: usize = 8;

/// Error type for metadata store operations
#[derive(Debug, thiserror::Error)]
pub enum MetaStoreError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt value under key '{0}'")]
    Corrupt(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<redb::TransactionError> for MetaStoreError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<MetaStoreError> for riverbed_common::Error {
    fn from(e: MetaStoreError) -> Self {
        match e {
            MetaStoreError::Bincode(e) => Self::Serialization(e.to_string()),
            MetaStoreError::Corrupt(key) => Self::Internal(format!("corrupt value under {key}")),
            other => Self::StoreUnavailable(other.to_string()),
        }
    }
}

pub type MetaStoreResult<T> = Result<T, MetaStoreError>;

/// A stored value together with its version
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Versioned {
    /// Starts at 1 on create, incremented by every successful compare-and-set
    pub version: u64,
    pub value: Vec<u8>,
}

impl Versioned {
    pub(crate) fn encode(version: u64, value: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(VERSION_PREFIX_LEN + value.len());
        buf.extend_from_slice(&version.to_be_bytes());
        buf.extend_from_slice(value);
        buf
    }

    pub(crate) fn decode(key: &str, bytes: &[u8]) -> MetaStoreResult<Self> {
        if bytes.len() < VERSION_PREFIX_LEN {
            return Err(MetaStoreError::Corrupt(key.to_string()));
        }
        let (prefix, value) = bytes.split_at(VERSION_PREFIX_LEN);
        let mut version = [0u8; VERSION_PREFIX_LEN];
        version.copy_from_slice(prefix);
        Ok(Self {
            version: u64::from_be_bytes(version),
            value: value.to_vec(),
        })
    }
}

/// Persistent metadata store backed by redb.
pub struct MetaStore {
    db: Database,
}

impl MetaStore {
    /// Open (or create) the redb database at the given path.
    pub fn open(path: impl AsRef<Path>) -> MetaStoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Create all tables eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        for table in Table::ALL {
            let _t = write_txn.open_table(table.definition())?;
        }
        write_txn.commit()?;

        info!("Opened metadata store at {}", path.display());
        Ok(Self { db })
    }

    /// Read the current value and version under `key`
    pub fn get(&self, table: Table, key: &str) -> MetaStoreResult<Option<Versioned>> {
        let read_txn = self.db.begin_read()?;
        let t = read_txn.open_table(table.definition())?;
        match t.get(key)? {
            Some(val) => Ok(Some(Versioned::decode(key, val.value())?)),
            None => Ok(None),
        }
    }

    /// Insert `value` at version 1 if `key` is absent.
    ///
    /// Returns the new version, or `None` if the key already exists.
    pub fn create(&self, table: Table, key: &str, value: &[u8]) -> MetaStoreResult<Option<u64>> {
        let write_txn = self.db.begin_write()?;
        let created = {
            let mut t = write_txn.open_table(table.definition())?;
            let exists = t.get(key)?.is_some();
            if exists {
                false
            } else {
                t.insert(key, Versioned::encode(1, value).as_slice())?;
                true
            }
        };
        if created {
            write_txn.commit()?;
            debug!("create {}/{}", table, key);
            Ok(Some(1))
        } else {
            Ok(None)
        }
    }

    /// Compare-and-swap on the version of `key`.
    ///
    /// Returns the new version if the stored version matched `expected_version`,
    /// `None` otherwise (including when the key does not exist).
    pub fn compare_and_set(
        &self,
        table: Table,
        key: &str,
        expected_version: u64,
        value: &[u8],
    ) -> MetaStoreResult<Option<u64>> {
        let write_txn = self.db.begin_write()?;
        let swapped = {
            let mut t = write_txn.open_table(table.definition())?;
            // Read and compare, then drop the guard before mutating
            let current = match t.get(key)? {
                Some(val) => Some(Versioned::decode(key, val.value())?.version),
                None => None,
            };
            if current == Some(expected_version) {
                let next = expected_version + 1;
                t.insert(key, Versioned::encode(next, value).as_slice())?;
                Some(next)
            } else {
                None
            }
        };
        if swapped.is_some() {
            write_txn.commit()?;
            debug!("cas {}/{} -> v{:?}", table, key, swapped);
        }
        Ok(swapped)
    }

    /// Remove `key`; returns whether it existed
    pub fn delete(&self, table: Table, key: &str) -> MetaStoreResult<bool> {
        let write_txn = self.db.begin_write()?;
        let existed = {
            let mut t = write_txn.open_table(table.definition())?;
            t.remove(key)?.is_some()
        };
        write_txn.commit()?;
        Ok(existed)
    }

    /// All entries whose key starts with `prefix`, in key order
    pub fn list(&self, table: Table, prefix: &str) -> MetaStoreResult<Vec<(String, Versioned)>> {
        let read_txn = self.db.begin_read()?;
        let t = read_txn.open_table(table.definition())?;
        let mut result = Vec::new();
        for entry in t.iter()? {
            let entry = entry?;
            let k = entry.0.value().to_string();
            if k.starts_with(prefix) {
                let versioned = Versioned::decode(&k, entry.1.value())?;
                result.push((k, versioned));
            }
        }
        Ok(result)
    }
}
