//! Storage contracts the dispatcher depends on.
//!
//! The orchestrator holds an `Arc<dyn Persistence>`, so any backend that
//! implements the three traits below can stand in for [`StateStore`]
//! (tests use this to inject failing stores).
//!
//! [`StateStore`]: crate::StateStore

use polyfier_core::{ConfigKind, Configuration, Profile};
use tracing::debug;

use crate::error::StateResult;
use crate::types::{ControlNodeRecord, OrderRecord, ProfileRecord, ResultRecord, WorkerNodeRecord};

/// Content-addressed configuration storage.
pub trait ConfigStore: Send + Sync {
    fn exists(&self, kind: ConfigKind, hash: u64) -> StateResult<bool>;

    /// Insert if absent. Returns `false` when the key was already present;
    /// the existing value is left untouched.
    fn insert(&self, kind: ConfigKind, hash: u64, canonical: &str) -> StateResult<bool>;

    fn get(&self, kind: ConfigKind, hash: u64) -> StateResult<Option<String>>;
}

/// Append-only result log.
pub trait ResultStore: Send + Sync {
    /// Append a result and return its sequence number.
    fn append_result(&self, result: &ResultRecord) -> StateResult<u64>;

    fn list_results(&self, worker_key: &str) -> StateResult<Vec<ResultRecord>>;
}

/// Durable node, order, and profile history.
pub trait NodeStore: Send + Sync {
    fn put_control_node(&self, node: &ControlNodeRecord) -> StateResult<()>;

    fn put_worker_node(&self, node: &WorkerNodeRecord) -> StateResult<()>;

    fn put_order(&self, order: &OrderRecord) -> StateResult<()>;

    /// Insert if absent, like [`ConfigStore::insert`].
    fn put_profile(&self, profile: &ProfileRecord) -> StateResult<bool>;
}

/// Everything the dispatcher needs from a backend.
pub trait Persistence: ConfigStore + ResultStore + NodeStore {}

impl<T: ConfigStore + ResultStore + NodeStore> Persistence for T {}

/// Store a configuration once per content hash and return the hash.
pub fn store_config<S>(store: &S, config: &Configuration) -> StateResult<u64>
where
    S: ConfigStore + ?Sized,
{
    let (hash, canonical) = config.encode();
    if store.exists(config.kind, hash)? {
        return Ok(hash);
    }
    let inserted = store.insert(config.kind, hash, &canonical)?;
    debug!(kind = %config.kind, hash, inserted, "configuration stored");
    Ok(hash)
}

/// Dedup-persist a profile's six configurations and seed set, then the
/// profile record itself.
pub fn store_profile<S>(store: &S, profile: &Profile) -> StateResult<ProfileRecord>
where
    S: Persistence + ?Sized,
{
    for config in profile.configurations() {
        store_config(store, config)?;
    }
    store_config(store, &profile.issued_seeds.to_configuration())?;
    let record = ProfileRecord::from_profile(profile);
    store.put_profile(&record)?;
    Ok(record)
}
