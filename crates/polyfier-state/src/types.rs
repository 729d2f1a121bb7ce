//! Durable record types for the Polyfier state store.
//!
//! These mirror what the dispatcher tracks in memory, but are what survives
//! sign-out and restarts. All are JSON-serialized into redb value columns.

use std::collections::BTreeMap;

use polyfier_core::{ConfigKind, Profile};
use serde::{Deserialize, Serialize};

/// Well-known node status values. Status is otherwise free-form.
pub mod status {
    pub const IDLE: &str = "IDLE";
    pub const START: &str = "START";
    pub const BUSY: &str = "BUSY";
    pub const UNKNOWN: &str = "UNKNOWN";
    /// Worker created by a control node but not yet signed in.
    pub const ORDERED: &str = "ORDERED";
}

// ── Nodes ──────────────────────────────────────────────────────

/// A control node that orders jobs on behalf of workers it launches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlNodeRecord {
    pub key: String,
    pub api_key: String,
    #[serde(default)]
    pub branch: Option<String>,
    pub session_id: u64,
    pub status: String,
    pub active: bool,
    /// Unix timestamp (milliseconds).
    pub registered_at: u64,
    pub update_time: u64,
}

impl ControlNodeRecord {
    pub fn table_key(&self) -> &str {
        &self.key
    }
}

/// A worker node executing one issued profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerNodeRecord {
    pub key: String,
    pub control_key: String,
    /// Session of the channel the worker last spoke on. Zero until sign-in.
    pub session_id: u64,
    #[serde(default)]
    pub branch: Option<String>,
    pub status: String,
    pub active: bool,
    #[serde(default)]
    pub data_stores: BTreeMap<String, bool>,
    pub results_count: u64,
    /// Cumulative size of deposited result bodies, in KiB.
    pub data_count: f64,
    pub registered_at: u64,
    pub update_time: u64,
}

impl WorkerNodeRecord {
    pub fn table_key(&self) -> &str {
        &self.key
    }
}

// ── Orders and profiles ────────────────────────────────────────

/// Link between a worker, the control node that ordered it, and its profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRecord {
    pub worker_key: String,
    pub control_key: String,
    pub profile_hash: u64,
    pub issued_at: u64,
    /// Never set: completion is not tracked.
    #[serde(default)]
    pub completed_at: Option<u64>,
}

/// A profile reduced to the hashes of its parts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileRecord {
    pub hash: u64,
    pub schema: u64,
    pub data: u64,
    pub query: u64,
    pub store: u64,
    pub partition: u64,
    pub start: u64,
    pub seeds: u64,
    pub created_at: u64,
}

impl ProfileRecord {
    pub fn from_profile(profile: &Profile) -> Self {
        let [schema, data, query, store, partition, start] =
            profile.configurations().map(|c| c.hash());
        Self {
            hash: profile.content_hash(),
            schema,
            data,
            query,
            store,
            partition,
            start,
            seeds: profile.issued_seeds.hash(),
            created_at: profile.created_at,
        }
    }

    /// The config hash for one of the six profile kinds.
    pub fn config_hash(&self, kind: ConfigKind) -> Option<u64> {
        match kind {
            ConfigKind::Schema => Some(self.schema),
            ConfigKind::Data => Some(self.data),
            ConfigKind::Query => Some(self.query),
            ConfigKind::Store => Some(self.store),
            ConfigKind::Partition => Some(self.partition),
            ConfigKind::Start => Some(self.start),
            ConfigKind::Seeds => Some(self.seeds),
            _ => None,
        }
    }
}

// ── Results ────────────────────────────────────────────────────

/// One deposited execution result. Text payloads are stored by hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRecord {
    pub worker_key: String,
    pub control_key: String,
    pub seed: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_hash: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logical_plan_hash: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub physical_plan_hash: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_set_hash: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicted_ms: Option<u64>,
    pub received_at: u64,
}
