//! Content-addressed configuration codec.
//!
//! A [`Configuration`] is a kind-tagged string map. Its canonical form is the
//! JSON object of its fields with keys in ascending order, and its content hash
//! is the first eight bytes (big-endian) of the SHA-256 digest of that form.
//! Both are pure functions of the fields, so identical payloads hash
//! identically across processes and machines.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{CoreError, CoreResult};

/// Separator used when folding several hashes into one.
const REHASH_SEPARATOR: &str = "&";

/// The kind of a stored configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfigKind {
    Schema,
    Data,
    Query,
    Store,
    Partition,
    Start,
    LogicalPlan,
    PhysicalPlan,
    Error,
    Seeds,
}

impl ConfigKind {
    /// Every kind, in declaration order.
    pub const ALL: [ConfigKind; 10] = [
        ConfigKind::Schema,
        ConfigKind::Data,
        ConfigKind::Query,
        ConfigKind::Store,
        ConfigKind::Partition,
        ConfigKind::Start,
        ConfigKind::LogicalPlan,
        ConfigKind::PhysicalPlan,
        ConfigKind::Error,
        ConfigKind::Seeds,
    ];

    /// Name of the table holding configurations of this kind.
    pub fn table_name(self) -> &'static str {
        match self {
            ConfigKind::Schema => "schema_configs",
            ConfigKind::Data => "data_configs",
            ConfigKind::Query => "query_configs",
            ConfigKind::Store => "store_configs",
            ConfigKind::Partition => "part_configs",
            ConfigKind::Start => "start_configs",
            ConfigKind::LogicalPlan => "logical_configs",
            ConfigKind::PhysicalPlan => "physical_configs",
            ConfigKind::Error => "error_configs",
            ConfigKind::Seeds => "seeds_configs",
        }
    }

    /// Wire label (`SCHEMA`, `LOGICAL_PLAN`, ...).
    pub fn label(self) -> &'static str {
        match self {
            ConfigKind::Schema => "SCHEMA",
            ConfigKind::Data => "DATA",
            ConfigKind::Query => "QUERY",
            ConfigKind::Store => "STORE",
            ConfigKind::Partition => "PARTITION",
            ConfigKind::Start => "START",
            ConfigKind::LogicalPlan => "LOGICAL_PLAN",
            ConfigKind::PhysicalPlan => "PHYSICAL_PLAN",
            ConfigKind::Error => "ERROR",
            ConfigKind::Seeds => "SEEDS",
        }
    }
}

impl fmt::Display for ConfigKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for ConfigKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ConfigKind::ALL
            .into_iter()
            .find(|kind| kind.label().eq_ignore_ascii_case(s))
            .ok_or_else(|| CoreError::Config(format!("unknown configuration kind: {s}")))
    }
}

/// A kind-tagged configuration payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    pub kind: ConfigKind,
    pub fields: BTreeMap<String, String>,
}

impl Configuration {
    pub fn new(kind: ConfigKind, fields: BTreeMap<String, String>) -> Self {
        Self { kind, fields }
    }

    /// A configuration holding a single field.
    pub fn single(kind: ConfigKind, key: &str, value: &str) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(key.to_string(), value.to_string());
        Self { kind, fields }
    }

    /// Canonical serialization of the fields.
    pub fn canonical(&self) -> String {
        canonical_form(&self.fields)
    }

    /// Content hash of the canonical serialization.
    pub fn hash(&self) -> u64 {
        hash_str(&self.canonical())
    }

    /// Hash and canonical form in one pass.
    pub fn encode(&self) -> (u64, String) {
        let canonical = self.canonical();
        (hash_str(&canonical), canonical)
    }

    /// Rebuild a configuration from a stored canonical form.
    pub fn from_canonical(kind: ConfigKind, canonical: &str) -> CoreResult<Self> {
        let fields: BTreeMap<String, String> = serde_json::from_str(canonical)
            .map_err(|e| CoreError::Canonical(e.to_string()))?;
        Ok(Self { kind, fields })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }
}

/// Encode a field map of the given kind into `(hash, canonical)`.
///
/// The kind does not participate in the hash; kinds are stored apart.
pub fn encode<I, K, V>(kind: ConfigKind, fields: I) -> (u64, String)
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    let fields = fields
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect::<BTreeMap<String, String>>();
    Configuration::new(kind, fields).encode()
}

/// Combine child hashes into a parent hash. Order matters.
pub fn rehash(hashes: &[u64]) -> u64 {
    let joined = hashes
        .iter()
        .map(u64::to_string)
        .collect::<Vec<_>>()
        .join(REHASH_SEPARATOR);
    hash_str(&joined)
}

/// Stable 64-bit hash of a string.
pub fn hash_str(data: &str) -> u64 {
    let digest = Sha256::digest(data.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

fn canonical_form(fields: &BTreeMap<String, String>) -> String {
    // serde_json's Value Display cannot fail, and the map is already sorted.
    let object = fields
        .iter()
        .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
        .collect::<serde_json::Map<String, serde_json::Value>>();
    serde_json::Value::Object(object).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_ignores_insertion_order() {
        let a = encode(ConfigKind::Store, [("a", "1"), ("b", "2")]);
        let b = encode(ConfigKind::Store, [("b", "2"), ("a", "1")]);
        assert_eq!(a, b);
        assert_eq!(a.1, r#"{"a":"1","b":"2"}"#);
    }

    #[test]
    fn hash_is_stable_across_calls() {
        let config = Configuration::single(ConfigKind::Error, "error", "boom");
        assert_eq!(config.hash(), config.clone().hash());
        assert_eq!(config.hash(), hash_str(r#"{"error":"boom"}"#));
    }

    #[test]
    fn different_payloads_hash_differently() {
        let a = Configuration::single(ConfigKind::Error, "error", "boom");
        let b = Configuration::single(ConfigKind::Error, "error", "bang");
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn rehash_is_order_sensitive() {
        let h1 = hash_str("one");
        let h2 = hash_str("two");
        assert_ne!(rehash(&[h1, h2]), rehash(&[h2, h1]));
        assert_eq!(rehash(&[h1, h2]), hash_str(&format!("{h1}&{h2}")));
    }

    #[test]
    fn canonical_round_trip_rehashes_identically() {
        let config = Configuration::single(ConfigKind::LogicalPlan, "plan", "Scan(\"t\")");
        let (hash, canonical) = config.encode();
        let restored = Configuration::from_canonical(ConfigKind::LogicalPlan, &canonical).unwrap();
        assert_eq!(restored, config);
        assert_eq!(restored.hash(), hash);
    }

    #[test]
    fn kind_parses_from_label() {
        assert_eq!("physical_plan".parse::<ConfigKind>().unwrap(), ConfigKind::PhysicalPlan);
        assert!("nonsense".parse::<ConfigKind>().is_err());
        assert_eq!(ConfigKind::Partition.table_name(), "part_configs");
    }

    #[test]
    fn kind_serializes_as_wire_label() {
        let json = serde_json::to_string(&ConfigKind::LogicalPlan).unwrap();
        assert_eq!(json, "\"LOGICAL_PLAN\"");
    }
}
