//! Versioned key-value capability used by the stream metadata layer.
//!
//! [`KvStore`] is the only primitive the stream layer needs: linearizable
//! reads plus create-if-absent and compare-and-set by version. Both the redb
//! [`MetaStore`] and the in-memory [`MemoryKvStore`] implement it.

use crate::store::{MetaStore, Versioned};
use crate::tables::Table;
use async_trait::async_trait;
use parking_lot::RwLock;
use riverbed_common::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};

/// Durable, linearizable versioned key-value store
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Backend name for logging
    fn name(&self) -> &str;

    /// Current value and version under `key`
    async fn get(&self, table: Table, key: &str) -> Result<Option<Versioned>>;

    /// Insert at version 1; `None` if the key already exists
    async fn create(&self, table: Table, key: &str, value: Vec<u8>) -> Result<Option<u64>>;

    /// Replace the value if the stored version equals `expected_version`.
    ///
    /// Returns the new version, or `None` when the comparison failed.
    async fn compare_and_set(
        &self,
        table: Table,
        key: &str,
        expected_version: u64,
        value: Vec<u8>,
    ) -> Result<Option<u64>>;

    /// Remove `key`; returns whether it existed
    async fn delete(&self, table: Table, key: &str) -> Result<bool>;

    /// Entries whose key starts with `prefix`, in key order
    async fn list(&self, table: Table, prefix: &str) -> Result<Vec<(String, Versioned)>>;
}

#[async_trait]
impl KvStore for MetaStore {
    fn name(&self) -> &str {
        "redb"
    }

    async fn get(&self, table: Table, key: &str) -> Result<Option<Versioned>> {
        Ok(Self::get(self, table, key)?)
    }

    async fn create(&self, table: Table, key: &str, value: Vec<u8>) -> Result<Option<u64>> {
        Ok(Self::create(self, table, key, &value)?)
    }

    async fn compare_and_set(
        &self,
        table: Table,
        key: &str,
        expected_version: u64,
        value: Vec<u8>,
    ) -> Result<Option<u64>> {
        Ok(Self::compare_and_set(
            self,
            table,
            key,
            expected_version,
            &value,
        )?)
    }

    async fn delete(&self, table: Table, key: &str) -> Result<bool> {
        Ok(Self::delete(self, table, key)?)
    }

    async fn list(&self, table: Table, prefix: &str) -> Result<Vec<(String, Versioned)>> {
        Ok(Self::list(self, table, prefix)?)
    }
}

/// In-memory [`KvStore`] for tests and ephemeral deployments.
///
/// Supports injecting a number of `StoreUnavailable` failures so retry paths
/// can be exercised without a real outage.
#[derive(Default)]
pub struct MemoryKvStore {
    tables: RwLock<HashMap<Table, BTreeMap<String, Versioned>>>,
    injected_failures: AtomicU32,
}

impl MemoryKvStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` calls fail with `StoreUnavailable`
    pub fn fail_next(&self, count: u32) {
        self.injected_failures.store(count, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        let remaining = self
            .injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match remaining {
            Ok(_) => Err(Error::store_unavailable("injected failure")),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, table: Table, key: &str) -> Result<Option<Versioned>> {
        self.check_available()?;
        let tables = self.tables.read();
        Ok(tables.get(&table).and_then(|t| t.get(key)).cloned())
    }

    async fn create(&self, table: Table, key: &str, value: Vec<u8>) -> Result<Option<u64>> {
        self.check_available()?;
        let mut tables = self.tables.write();
        let t = tables.entry(table).or_default();
        if t.contains_key(key) {
            return Ok(None);
        }
        t.insert(key.to_string(), Versioned { version: 1, value });
        Ok(Some(1))
    }

    async fn compare_and_set(
        &self,
        table: Table,
        key: &str,
        expected_version: u64,
        value: Vec<u8>,
    ) -> Result<Option<u64>> {
        self.check_available()?;
        let mut tables = self.tables.write();
        let Some(current) = tables.get_mut(&table).and_then(|t| t.get_mut(key)) else {
            return Ok(None);
        };
        if current.version != expected_version {
            return Ok(None);
        }
        current.version += 1;
        current.value = value;
        Ok(Some(current.version))
    }

    async fn delete(&self, table: Table, key: &str) -> Result<bool> {
        self.check_available()?;
        let mut tables = self.tables.write();
        Ok(tables
            .get_mut(&table)
            .is_some_and(|t| t.remove(key).is_some()))
    }

    async fn list(&self, table: Table, prefix: &str) -> Result<Vec<(String, Versioned)>> {
        self.check_available()?;
        let tables = self.tables.read();
        Ok(tables
            .get(&table)
            .map(|t| {
                t.range(prefix.to_string()..)
                    .take_while(|(k, _)| k.starts_with(prefix))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn exercise(store: Arc<dyn KvStore>) {
        assert_eq!(
            store.create(Table::Streams, "s/a", b"1".to_vec()).await.unwrap(),
            Some(1)
        );
        assert_eq!(
            store.create(Table::Streams, "s/a", b"2".to_vec()).await.unwrap(),
            None
        );
        assert_eq!(
            store
                .compare_and_set(Table::Streams, "s/a", 1, b"3".to_vec())
                .await
                .unwrap(),
            Some(2)
        );
        assert_eq!(
            store
                .compare_and_set(Table::Streams, "s/a", 1, b"4".to_vec())
                .await
                .unwrap(),
            None
        );

        let got = store.get(Table::Streams, "s/a").await.unwrap().unwrap();
        assert_eq!(got.version, 2);
        assert_eq!(got.value, b"3");

        store.create(Table::Streams, "t/a", b"x".to_vec()).await.unwrap();
        let listed = store.list(Table::Streams, "s/").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].0, "s/a");

        assert!(store.delete(Table::Streams, "t/a").await.unwrap());
        assert!(store.get(Table::Streams, "t/a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_store_semantics() {
        exercise(Arc::new(MemoryKvStore::new())).await;
    }

    #[tokio::test]
    async fn test_redb_store_semantics() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetaStore::open(dir.path().join("meta.redb")).unwrap();
        exercise(Arc::new(store)).await;
    }

    #[tokio::test]
    async fn test_injected_failures_are_retryable() {
        let store = MemoryKvStore::new();
        store.fail_next(2);

        let err = store.get(Table::Scopes, "s").await.unwrap_err();
        assert!(err.is_retryable());
        assert!(store.get(Table::Scopes, "s").await.is_err());
        assert!(store.get(Table::Scopes, "s").await.unwrap().is_none());
    }
}
