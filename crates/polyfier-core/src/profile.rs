//! Profile generation.
//!
//! A [`ProfileGenerator`] owns one permuter per configuration kind and turns
//! each request into a [`Profile`]: one configuration of every kind plus the
//! seed set the worker must exercise.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::codec::{ConfigKind, Configuration, rehash};
use crate::error::{CoreError, CoreResult};
use crate::permuter::{BooleanPermuter, Permuter, SortMode};
use crate::seeds::SeedSet;

/// Start-config field naming the branch a worker should run.
pub const BRANCH_FIELD: &str = "branch";

/// Preset and permeable keys for one configuration kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PermuterConfig {
    #[serde(default)]
    pub preset: BTreeMap<String, String>,
    #[serde(default)]
    pub permeable: Vec<String>,
}

impl PermuterConfig {
    pub fn preset(mut self, key: &str, value: &str) -> Self {
        self.preset.insert(key.to_string(), value.to_string());
        self
    }

    pub fn permeable(mut self, key: &str) -> Self {
        self.permeable.push(key.to_string());
        self
    }

    fn build(&self, mode: SortMode) -> CoreResult<BooleanPermuter> {
        BooleanPermuter::with_sort_mode(self.preset.clone(), self.permeable.iter().cloned(), mode)
    }
}

/// Generator settings: one [`PermuterConfig`] per profile kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratorConfig {
    /// Restart exhausted permuters instead of failing.
    #[serde(default = "default_loop_back")]
    pub loop_back: bool,
    #[serde(default)]
    pub sort_mode: SortMode,
    #[serde(default)]
    pub schema: PermuterConfig,
    #[serde(default)]
    pub data: PermuterConfig,
    #[serde(default)]
    pub query: PermuterConfig,
    #[serde(default)]
    pub store: PermuterConfig,
    #[serde(default)]
    pub partition: PermuterConfig,
    #[serde(default)]
    pub start: PermuterConfig,
}

fn default_loop_back() -> bool {
    true
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            loop_back: default_loop_back(),
            sort_mode: SortMode::default(),
            schema: PermuterConfig::default().preset("schema", "default"),
            data: PermuterConfig::default()
                .preset("dataConfig0", "")
                .preset("dataConfig1", "")
                .preset("dataConfig2", "")
                .preset("dataConfig3", ""),
            query: PermuterConfig::default()
                .preset("queryConfig0", "")
                .preset("queryConfig1", "")
                .preset("queryConfig2", "")
                .preset("queryConfig3", "")
                .preset("complexity", "4"),
            store: PermuterConfig::default()
                .preset("CASSANDRA", "false")
                .preset("NEO4J", "false")
                .preset("COTTONTAIL", "false")
                .permeable("HSQLDB")
                .permeable("POSTGRESQL")
                .permeable("MONGODB")
                .permeable("MONETDB"),
            partition: PermuterConfig::default()
                .preset("partConfig0", "")
                .preset("partConfig1", "")
                .preset("partConfig2", "")
                .preset("partConfig3", ""),
            start: PermuterConfig::default()
                .preset("startConfig0", "")
                .preset("startConfig1", "")
                .preset("startConfig2", "")
                .preset("startConfig3", ""),
        }
    }
}

/// One complete job specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    /// Identity metadata, excluded from the content hash.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub schema_config: Configuration,
    pub data_config: Configuration,
    pub query_config: Configuration,
    pub store_config: Configuration,
    pub partition_config: Configuration,
    pub start_config: Configuration,
    pub issued_seeds: SeedSet,
    /// Unix timestamp (milliseconds).
    pub created_at: u64,
}

impl Profile {
    /// The six configurations in canonical order.
    pub fn configurations(&self) -> [&Configuration; 6] {
        [
            &self.schema_config,
            &self.data_config,
            &self.query_config,
            &self.store_config,
            &self.partition_config,
            &self.start_config,
        ]
    }

    /// Hash over the configuration hashes and the seed set, in canonical order.
    pub fn content_hash(&self) -> u64 {
        let mut hashes: Vec<u64> = self.configurations().iter().map(|c| c.hash()).collect();
        hashes.push(self.issued_seeds.hash());
        rehash(&hashes)
    }

    /// Store name → enabled, read from the store configuration.
    pub fn data_stores(&self) -> BTreeMap<String, bool> {
        self.store_config
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), v == "true"))
            .collect()
    }

    /// Branch requested by the start configuration, if any.
    pub fn branch(&self) -> Option<&str> {
        self.start_config.get(BRANCH_FIELD)
    }

    pub fn to_json(&self) -> CoreResult<String> {
        serde_json::to_string(self).map_err(|e| CoreError::Canonical(e.to_string()))
    }

    pub fn from_json(json: &str) -> CoreResult<Self> {
        serde_json::from_str(json).map_err(|e| CoreError::Canonical(e.to_string()))
    }
}

struct Permuters {
    schema: Box<dyn Permuter>,
    data: Box<dyn Permuter>,
    query: Box<dyn Permuter>,
    store: Box<dyn Permuter>,
    partition: Box<dyn Permuter>,
    start: Box<dyn Permuter>,
    issued: u64,
}

impl Permuters {
    fn exhausted(&self) -> Option<ConfigKind> {
        [
            (ConfigKind::Schema, &self.schema),
            (ConfigKind::Data, &self.data),
            (ConfigKind::Query, &self.query),
            (ConfigKind::Store, &self.store),
            (ConfigKind::Partition, &self.partition),
            (ConfigKind::Start, &self.start),
        ]
        .into_iter()
        .find(|(_, p)| p.peek().is_none())
        .map(|(kind, _)| kind)
    }
}

/// Thread-safe profile factory.
pub struct ProfileGenerator {
    permuters: Mutex<Permuters>,
    loop_back: bool,
}

impl ProfileGenerator {
    /// Build all six permuters. Key overlaps fail here, not at request time.
    pub fn new(config: &GeneratorConfig) -> CoreResult<Self> {
        let mode = config.sort_mode;
        Ok(Self::from_permuters(
            [
                boxed(config.schema.build(mode)?),
                boxed(config.data.build(mode)?),
                boxed(config.query.build(mode)?),
                boxed(config.store.build(mode)?),
                boxed(config.partition.build(mode)?),
                boxed(config.start.build(mode)?),
            ],
            config.loop_back,
        ))
    }

    /// Assemble a generator from permuters given in canonical kind order
    /// (schema, data, query, store, partition, start).
    pub fn from_permuters(permuters: [Box<dyn Permuter>; 6], loop_back: bool) -> Self {
        let [schema, data, query, store, partition, start] = permuters;
        Self {
            permuters: Mutex::new(Permuters {
                schema,
                data,
                query,
                store,
                partition,
                start,
                issued: 0,
            }),
            loop_back,
        }
    }

    pub fn create_profile(&self, seeds: SeedSet) -> CoreResult<Profile> {
        self.create_profile_with(seeds, None, None)
    }

    /// Draw the next configuration of every kind and stamp optional identity.
    pub fn create_profile_with(
        &self,
        seeds: SeedSet,
        profile_key: Option<String>,
        api_key: Option<String>,
    ) -> CoreResult<Profile> {
        let mut state = self.permuters.lock().unwrap_or_else(PoisonError::into_inner);

        if !self.loop_back {
            if let Some(kind) = state.exhausted() {
                warn!(%kind, "configuration space exhausted");
                return Err(CoreError::ExhaustedConfigurationSpace { kind });
            }
        }

        let lb = self.loop_back;
        let profile = Profile {
            profile_key,
            api_key,
            schema_config: draw(ConfigKind::Schema, state.schema.as_mut(), lb)?,
            data_config: draw(ConfigKind::Data, state.data.as_mut(), lb)?,
            query_config: draw(ConfigKind::Query, state.query.as_mut(), lb)?,
            store_config: draw(ConfigKind::Store, state.store.as_mut(), lb)?,
            partition_config: draw(ConfigKind::Partition, state.partition.as_mut(), lb)?,
            start_config: draw(ConfigKind::Start, state.start.as_mut(), lb)?,
            issued_seeds: seeds,
            created_at: epoch_millis(),
        };

        state.issued += 1;
        debug!(issued = state.issued, "profile created");
        Ok(profile)
    }

    /// Number of profiles issued so far.
    pub fn issued(&self) -> u64 {
        self.permuters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .issued
    }
}

fn draw(kind: ConfigKind, permuter: &mut dyn Permuter, loop_back: bool) -> CoreResult<Configuration> {
    let fields = match permuter.next() {
        Some(fields) => fields,
        None if loop_back => {
            debug!(%kind, "permuter looped back");
            permuter.loop_back();
            permuter
                .next()
                .or_else(|| permuter.fixed_point())
                .ok_or(CoreError::ExhaustedConfigurationSpace { kind })?
        }
        None => return Err(CoreError::ExhaustedConfigurationSpace { kind }),
    };
    Ok(Configuration::new(kind, fields))
}

fn boxed(permuter: BooleanPermuter) -> Box<dyn Permuter> {
    Box::new(permuter)
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
