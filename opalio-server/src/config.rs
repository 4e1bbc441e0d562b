use opalio_core::{OpalError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    pub storage: StorageConfig,
    pub registry: RegistryConfig,
    #[serde(default = "default_object_types")]
    pub object_types: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Stable node identity; generated fresh when omitted.
    #[serde(default)]
    pub node_id: Option<String>,
    pub bind_addr: String,
    #[serde(default)]
    pub advertise_addr: Option<String>,
}

impl NodeConfig {
    pub fn effective_address(&self) -> String {
        self.advertise_addr
            .clone()
            .unwrap_or_else(|| self.bind_addr.clone())
    }

    pub fn effective_node_id(&self) -> String {
        self.node_id
            .clone()
            .unwrap_or_else(|| ulid::Ulid::new().to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    #[serde(default = "default_capacity_bytes")]
    pub capacity_bytes: u64,
}

fn default_capacity_bytes() -> u64 {
    10 * 1024 * 1024 * 1024
}

fn default_object_types() -> Vec<String> {
    vec!["blob".to_string(), "fragment".to_string()]
}

/// Registry backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub backend: RegistryBackend,
    #[serde(default)]
    pub namespace: Option<String>,
    pub redis: Option<RedisConfig>,
}

impl RegistryConfig {
    pub fn namespace_or_default(&self) -> &str {
        self.namespace
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or("default")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryBackend {
    Redis,
    /// Single-node operation: the registry only ever lists this node.
    Standalone,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(::config::Environment::with_prefix("OPALIO"))
            .build()
            .map_err(|e| OpalError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| OpalError::Config(e.to_string()))?;

        Ok(config)
    }
}
