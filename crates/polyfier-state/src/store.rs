//! StateStore: redb-backed persistence for the Polyfier dispatcher.
//!
//! Configurations live in one table per kind, keyed by content hash. Node
//! history, orders, profiles, and results are JSON-serialized into redb's
//! `&[u8]` value columns. The store supports both on-disk and in-memory
//! backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use polyfier_core::ConfigKind;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::contract::{ConfigStore, NodeStore, ResultStore};
use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store.
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for kind in ConfigKind::ALL {
            txn.open_table(config_table(kind)).map_err(map_err!(Table))?;
        }
        txn.open_table(PROFILES).map_err(map_err!(Table))?;
        txn.open_table(ORDERS).map_err(map_err!(Table))?;
        txn.open_table(CONTROL_NODES).map_err(map_err!(Table))?;
        txn.open_table(WORKER_NODES).map_err(map_err!(Table))?;
        txn.open_table(RESULTS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn put_json<T: Serialize>(
        &self,
        def: TableDefinition<'static, &'static str, &'static [u8]>,
        key: &str,
        record: &T,
    ) -> StateResult<()> {
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(
        &self,
        def: TableDefinition<'static, &'static str, &'static [u8]>,
        key: &str,
    ) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    // ── Configurations ─────────────────────────────────────────────

    /// Number of distinct configurations stored for a kind.
    pub fn count_configs(&self, kind: ConfigKind) -> StateResult<u64> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(config_table(kind)).map_err(map_err!(Table))?;
        let mut count = 0;
        for entry in table.iter().map_err(map_err!(Read))? {
            entry.map_err(map_err!(Read))?;
            count += 1;
        }
        Ok(count)
    }

    // ── Nodes and orders ───────────────────────────────────────────

    pub fn get_control_node(&self, key: &str) -> StateResult<Option<ControlNodeRecord>> {
        self.get_json(CONTROL_NODES, key)
    }

    pub fn get_worker_node(&self, key: &str) -> StateResult<Option<WorkerNodeRecord>> {
        self.get_json(WORKER_NODES, key)
    }

    /// Get the order placed for a worker key.
    pub fn get_order(&self, worker_key: &str) -> StateResult<Option<OrderRecord>> {
        self.get_json(ORDERS, worker_key)
    }

    // ── Profiles ───────────────────────────────────────────────────

    pub fn get_profile(&self, hash: u64) -> StateResult<Option<ProfileRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PROFILES).map_err(map_err!(Table))?;
        match table.get(hash).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: ProfileRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }
}

impl ConfigStore for StateStore {
    fn exists(&self, kind: ConfigKind, hash: u64) -> StateResult<bool> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(config_table(kind)).map_err(map_err!(Table))?;
        Ok(table.get(hash).map_err(map_err!(Read))?.is_some())
    }

    fn insert(&self, kind: ConfigKind, hash: u64, canonical: &str) -> StateResult<bool> {
        // redb serializes write transactions, so check-then-insert is atomic.
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let inserted;
        {
            let mut table = txn.open_table(config_table(kind)).map_err(map_err!(Table))?;
            inserted = if table.get(hash).map_err(map_err!(Read))?.is_some() {
                false
            } else {
                table.insert(hash, canonical).map_err(map_err!(Write))?;
                true
            };
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(inserted)
    }

    fn get(&self, kind: ConfigKind, hash: u64) -> StateResult<Option<String>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(config_table(kind)).map_err(map_err!(Table))?;
        Ok(table
            .get(hash)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value().to_string()))
    }
}

impl ResultStore for StateStore {
    fn append_result(&self, result: &ResultRecord) -> StateResult<u64> {
        let value = serde_json::to_vec(result).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let seq;
        {
            let mut table = txn.open_table(RESULTS).map_err(map_err!(Table))?;
            seq = table
                .last()
                .map_err(map_err!(Read))?
                .map(|(key, _)| key.value() + 1)
                .unwrap_or(0);
            table
                .insert(seq, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(worker_key = %result.worker_key, seq, "result appended");
        Ok(seq)
    }

    fn list_results(&self, worker_key: &str) -> StateResult<Vec<ResultRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RESULTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: ResultRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if record.worker_key == worker_key {
                results.push(record);
            }
        }
        Ok(results)
    }
}

impl NodeStore for StateStore {
    fn put_control_node(&self, node: &ControlNodeRecord) -> StateResult<()> {
        self.put_json(CONTROL_NODES, node.table_key(), node)?;
        debug!(key = %node.key, status = %node.status, "control node stored");
        Ok(())
    }

    fn put_worker_node(&self, node: &WorkerNodeRecord) -> StateResult<()> {
        self.put_json(WORKER_NODES, node.table_key(), node)?;
        debug!(key = %node.key, status = %node.status, "worker node stored");
        Ok(())
    }

    fn put_order(&self, order: &OrderRecord) -> StateResult<()> {
        self.put_json(ORDERS, &order.worker_key, order)
    }

    fn put_profile(&self, profile: &ProfileRecord) -> StateResult<bool> {
        let value = serde_json::to_vec(profile).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let inserted;
        {
            let mut table = txn.open_table(PROFILES).map_err(map_err!(Table))?;
            inserted = if table.get(profile.hash).map_err(map_err!(Read))?.is_some() {
                false
            } else {
                table
                    .insert(profile.hash, value.as_slice())
                    .map_err(map_err!(Write))?;
                true
            };
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(hash = profile.hash, inserted, "profile stored");
        Ok(inserted)
    }
}
