//! polyfier.toml configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreResult;
use crate::profile::GeneratorConfig;
use crate::seeds::SeedSet;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolyfierConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub generator: GeneratorConfig,
    #[serde(default)]
    pub seeds: SeedsConfig,
    #[serde(default)]
    pub client: ClientConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Seconds between registry snapshots sent to observers.
    #[serde(default = "default_broadcast_interval")]
    pub broadcast_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            data_dir: default_data_dir(),
            broadcast_interval_secs: default_broadcast_interval(),
        }
    }
}

/// Seed window issued with every job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedsConfig {
    pub from: u64,
    pub to: u64,
}

impl Default for SeedsConfig {
    fn default() -> Self {
        Self { from: 0, to: 1000 }
    }
}

impl SeedsConfig {
    pub fn seed_set(&self) -> CoreResult<SeedSet> {
        SeedSet::range(self.from, self.to)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Bounded wait for a job reply.
    #[serde(default = "default_job_timeout")]
    pub job_timeout_secs: u64,
}

impl ClientConfig {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            job_timeout_secs: default_job_timeout(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    44567
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/polyfier")
}

fn default_broadcast_interval() -> u64 {
    5
}

fn default_job_timeout() -> u64 {
    60
}

impl PolyfierConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: PolyfierConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permuter::SortMode;

    #[test]
    fn default_round_trips_through_toml() {
        let config = PolyfierConfig::default();
        let toml_str = config.to_toml_string().unwrap();
        assert!(toml_str.contains("POSTGRESQL"));
        let parsed: PolyfierConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn parse_minimal() {
        let toml_str = r#"
[server]
port = 9000

[generator]
loop_back = false
sort_mode = "bit-value"

[generator.store]
permeable = ["HSQLDB", "MONGODB"]
preset = { NEO4J = "false" }

[seeds]
from = 100
to = 200
"#;
        let config: PolyfierConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.broadcast_interval_secs, 5);
        assert!(!config.generator.loop_back);
        assert_eq!(config.generator.sort_mode, SortMode::BitValue);
        assert_eq!(config.generator.store.permeable, vec!["HSQLDB", "MONGODB"]);
        assert!(config.generator.schema.preset.is_empty());
        assert_eq!(config.seeds.seed_set().unwrap().len(), 100);
        assert_eq!(config.client.job_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn from_file_reads_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("polyfier.toml");
        std::fs::write(&path, "[server]\nhost = \"127.0.0.1\"\n").unwrap();
        let config = PolyfierConfig::from_file(&path).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.generator, GeneratorConfig::default());
    }
}
