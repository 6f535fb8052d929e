//! Configuration for planning and local execution.
//!
//! [`FlowConfig`] is a plain serde struct. It is loaded from TOML (`.toml`)
//! or JSON (any other extension), optionally adjusted from `PIPEFLOW_*`
//! environment variables, and then handed to the planner and the runner,
//! which treat it as read-only.
//!
//! # Example
//!
//! ```ignore
//! use pipeflow::config::FlowConfig;
//!
//! let mut config = FlowConfig::load("pipeflow.toml")?;
//! config.apply_env_overrides()?;
//! let connector = pipeflow::FlowConnector::new(config)?;
//! ```

pub mod tokens;

pub use tokens::{SerializationTokens, TokenRegistration, RESERVED_TOKEN_LIMIT, TOKENS_PROPERTY};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default prefix for intermediate tap identifiers
pub const DEFAULT_TEMPORARY_DIR: &str = "tmp/pipeflow";

/// Default number of records or groups between heartbeats
pub const DEFAULT_KEEP_ALIVE_INTERVAL: u64 = 1_000;

/// Default number of parallel mapper partitions
pub const DEFAULT_MAP_PARTITIONS: usize = 1;

/// Default in-memory shuffle budget, in tuples
pub const DEFAULT_MAX_GROUP_TUPLES: usize = 10_000_000;

pub const ENV_MAP_PARTITIONS: &str = "PIPEFLOW_MAP_PARTITIONS";
pub const ENV_KEEP_ALIVE_INTERVAL: &str = "PIPEFLOW_KEEP_ALIVE_INTERVAL";
pub const ENV_MAX_GROUP_TUPLES: &str = "PIPEFLOW_MAX_GROUP_TUPLES";
pub const ENV_TEMPORARY_DIR: &str = "PIPEFLOW_TEMPORARY_DIR";

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write config {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Failed to serialize config: {0}")]
    Serialize(String),

    #[error("Invalid value '{value}' for {var}")]
    Env { var: String, value: String },

    #[error("Invalid setting: {0}")]
    Invalid(String),

    #[error("Invalid serialization token: {0}")]
    InvalidToken(String),
}

// ==================== Flow Config ====================

/// Settings shared by the planner and the local runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Prefix for intermediate tap identifiers
    #[serde(default = "default_temporary_dir")]
    pub temporary_dir: String,

    /// Records, groups or sink writes between heartbeats
    #[serde(default = "default_keep_alive_interval")]
    pub keep_alive_interval: u64,

    /// Parallel mapper partitions in the local runner
    #[serde(default = "default_map_partitions")]
    pub map_partitions: usize,

    /// Tuples the in-memory shuffle may buffer per stage
    #[serde(default = "default_max_group_tuples")]
    pub max_group_tuples: usize,

    /// Keep intermediate taps after a successful run
    #[serde(default)]
    pub keep_intermediates: bool,

    /// Skip cascade flows whose sinks are newer than their sources
    #[serde(default)]
    pub skip_up_to_date_flows: bool,

    /// Directory for rolling log files, used by the binary
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Explicit serialization token registrations
    #[serde(default)]
    pub serialization_tokens: Vec<TokenRegistration>,

    /// Free-form properties served to operations
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

fn default_temporary_dir() -> String {
    DEFAULT_TEMPORARY_DIR.to_string()
}

fn default_keep_alive_interval() -> u64 {
    DEFAULT_KEEP_ALIVE_INTERVAL
}

fn default_map_partitions() -> usize {
    DEFAULT_MAP_PARTITIONS
}

fn default_max_group_tuples() -> usize {
    DEFAULT_MAX_GROUP_TUPLES
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            temporary_dir: default_temporary_dir(),
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
            map_partitions: DEFAULT_MAP_PARTITIONS,
            max_group_tuples: DEFAULT_MAX_GROUP_TUPLES,
            keep_intermediates: false,
            skip_up_to_date_flows: false,
            log_dir: None,
            serialization_tokens: Vec::new(),
            properties: BTreeMap::new(),
        }
    }
}

fn is_toml(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "toml")
}

impl FlowConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a TOML or JSON file, chosen by extension.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = if is_toml(path) {
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?
        } else {
            serde_json::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?
        };
        config.validate()?;
        tracing::debug!("Loaded flow config from {:?}", path);
        Ok(config)
    }

    /// Save as pretty TOML or JSON, chosen by extension.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = if is_toml(path) {
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?
        } else {
            serde_json::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?
        };
        std::fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Override settings from `PIPEFLOW_*` environment variables.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        fn parsed<T: std::str::FromStr>(var: &str) -> Result<Option<T>, ConfigError> {
            match std::env::var(var) {
                Ok(value) => value
                    .trim()
                    .parse()
                    .map(Some)
                    .map_err(|_| ConfigError::Env {
                        var: var.to_string(),
                        value,
                    }),
                Err(_) => Ok(None),
            }
        }

        if let Some(partitions) = parsed::<usize>(ENV_MAP_PARTITIONS)? {
            self.map_partitions = partitions;
        }
        if let Some(interval) = parsed::<u64>(ENV_KEEP_ALIVE_INTERVAL)? {
            self.keep_alive_interval = interval;
        }
        if let Some(max) = parsed::<usize>(ENV_MAX_GROUP_TUPLES)? {
            self.max_group_tuples = max;
        }
        if let Ok(dir) = std::env::var(ENV_TEMPORARY_DIR) {
            self.temporary_dir = dir;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.map_partitions == 0 {
            return Err(ConfigError::Invalid("map_partitions must be at least 1".to_string()));
        }
        if self.keep_alive_interval == 0 {
            return Err(ConfigError::Invalid("keep_alive_interval must be at least 1".to_string()));
        }
        if self.temporary_dir.trim().is_empty() {
            return Err(ConfigError::Invalid("temporary_dir must not be empty".to_string()));
        }
        Ok(())
    }

    /// Build the token registry from the registration list and the
    /// `pipeflow.serialization.tokens` property.
    pub fn serialization_tokens(&self) -> Result<SerializationTokens, ConfigError> {
        SerializationTokens::build(
            &self.serialization_tokens,
            self.properties.get(TOKENS_PROPERTY).map(String::as_str),
        )
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}
