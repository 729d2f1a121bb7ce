//! In-memory registry of live control nodes, workers, jobs, and observers.
//!
//! The registry lives for the lifetime of the process and is never persisted;
//! durable history goes through the store. It is guarded by a single
//! `tokio::sync::RwLock`, which callers must not hold across store I/O.

use std::collections::{HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

use polyfier_state::{ControlNodeRecord, WorkerNodeRecord};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use crate::channel::{ChannelHandle, SessionId};

/// A signed-in control node and the channel it last spoke on.
#[derive(Debug, Clone)]
pub struct ControlNode {
    pub record: ControlNodeRecord,
    pub channel: ChannelHandle,
}

impl ControlNode {
    pub fn new(record: ControlNodeRecord, channel: ChannelHandle) -> Self {
        Self { record, channel }
    }

    /// Rebind to the connection a message arrived on.
    pub fn migrate_channel(&mut self, channel: &ChannelHandle) {
        if self.channel.session_id() != channel.session_id() {
            debug!(
                key = %self.record.key,
                from = self.channel.session_id(),
                to = channel.session_id(),
                "control node channel migrated"
            );
            self.channel = channel.clone();
            self.record.session_id = channel.session_id();
        }
    }
}

/// An ordered worker. It has no channel until it first connects.
#[derive(Debug, Clone)]
pub struct WorkerNode {
    pub record: WorkerNodeRecord,
    pub channel: Option<ChannelHandle>,
}

impl WorkerNode {
    pub fn new(record: WorkerNodeRecord) -> Self {
        Self {
            record,
            channel: None,
        }
    }

    pub fn migrate_channel(&mut self, channel: &ChannelHandle) {
        let current = self.channel.as_ref().map(ChannelHandle::session_id);
        if current != Some(channel.session_id()) {
            debug!(
                key = %self.record.key,
                from = ?current,
                to = channel.session_id(),
                "worker channel migrated"
            );
            self.channel = Some(channel.clone());
            self.record.session_id = channel.session_id();
        }
    }
}

/// Everything guarded by the registry lock.
#[derive(Debug, Default)]
pub struct RegistryState {
    pub controls: HashMap<String, ControlNode>,
    pub workers: HashMap<String, WorkerNode>,
    /// Serialized job per worker key, returned verbatim on request.
    pub jobs: HashMap<String, String>,
    pub observers: HashMap<SessionId, ChannelHandle>,
    /// Worker keys with a job order in flight but not yet installed.
    pub reserved: HashSet<String>,
}

impl RegistryState {
    /// Look up a control node and rebind it to the channel the message
    /// arrived on.
    pub fn bind_control(&mut self, key: &str, channel: &ChannelHandle) -> Option<&mut ControlNode> {
        let node = self.controls.get_mut(key)?;
        node.migrate_channel(channel);
        Some(node)
    }

    /// Look up a worker and rebind it to the channel the message arrived on.
    pub fn bind_worker(&mut self, key: &str, channel: &ChannelHandle) -> Option<&mut WorkerNode> {
        let node = self.workers.get_mut(key)?;
        node.migrate_channel(channel);
        Some(node)
    }

    /// Claim a worker key for a job order. Fails if the key is live or
    /// already claimed.
    pub fn reserve_worker(&mut self, key: &str) -> bool {
        !self.workers.contains_key(key) && self.reserved.insert(key.to_string())
    }

    /// Swap a reservation for the installed worker and its job.
    pub fn install_worker(&mut self, node: WorkerNode, job: String) {
        let key = node.record.key.clone();
        self.reserved.remove(&key);
        self.jobs.insert(key.clone(), job);
        self.workers.insert(key, node);
    }
}

/// Point-in-time view of the registry, sent to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySnapshot {
    /// Unix timestamp (milliseconds).
    pub time: u64,
    pub controls: Vec<ControlNodeRecord>,
    pub workers: Vec<WorkerNodeRecord>,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    inner: RwLock<RegistryState>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.inner.read().await
    }

    pub async fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.inner.write().await
    }

    pub async fn snapshot(&self) -> RegistrySnapshot {
        let state = self.inner.read().await;
        let mut controls: Vec<ControlNodeRecord> =
            state.controls.values().map(|n| n.record.clone()).collect();
        let mut workers: Vec<WorkerNodeRecord> =
            state.workers.values().map(|n| n.record.clone()).collect();
        controls.sort_by(|a, b| a.key.cmp(&b.key));
        workers.sort_by(|a, b| a.key.cmp(&b.key));
        RegistrySnapshot {
            time: epoch_millis(),
            controls,
            workers,
        }
    }

    pub async fn control(&self, key: &str) -> Option<ControlNodeRecord> {
        self.inner.read().await.controls.get(key).map(|n| n.record.clone())
    }

    pub async fn worker(&self, key: &str) -> Option<WorkerNodeRecord> {
        self.inner.read().await.workers.get(key).map(|n| n.record.clone())
    }

    pub async fn job(&self, worker_key: &str) -> Option<String> {
        self.inner.read().await.jobs.get(worker_key).cloned()
    }

    pub async fn observer_count(&self) -> usize {
        self.inner.read().await.observers.len()
    }

    /// Drop the observer subscription of a closed connection. Node entries
    /// survive disconnects.
    pub async fn disconnect(&self, session_id: SessionId) {
        if self.inner.write().await.observers.remove(&session_id).is_some() {
            debug!(session_id, "observer disconnected");
        }
    }
}

pub(crate) fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
