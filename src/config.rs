use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::db::{ConnectionDescriptor, DatabaseType, PostgresTlsOptions};
use crate::error::{EngineError, Result};

/// A connection saved under a name in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedConnection {
    pub name: String,
    pub database_type: DatabaseType,
    pub connection_string: String,
}

impl NamedConnection {
    pub fn descriptor(&self) -> Result<ConnectionDescriptor> {
        ConnectionDescriptor::new(self.connection_string.clone(), self.database_type)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostgresConfig {
    pub connect_timeout_secs: u64,
    #[serde(flatten)]
    pub tls: PostgresTlsOptions,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 15,
            tls: PostgresTlsOptions::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub cache_ttl_secs: u64,
    pub cache_capacity: usize,
    pub baseline_capacity: usize,
    pub default_timeout_secs: u64,
    pub health_check_timeout_secs: u64,
    pub history_max_entries: usize,
    /// Reject dangerous statements before every execution.
    pub validate_sql: bool,
    /// Baseline average above which `analyze_query` flags a statement.
    pub slow_query_threshold_ms: u64,
    pub postgres: PostgresConfig,
    pub connections: Vec<NamedConnection>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 1800,
            cache_capacity: 1000,
            baseline_capacity: 5000,
            default_timeout_secs: 30,
            health_check_timeout_secs: 5,
            history_max_entries: 1000,
            validate_sql: false,
            slow_query_threshold_ms: 1000,
            postgres: PostgresConfig::default(),
            connections: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sqlpilot")
            .join("config.toml")
    }

    /// Load from `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
            .map_err(|e| EngineError::Configuration(format!("{}: {}", path.display(), e)))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: EngineConfig =
            toml::from_str(content).map_err(|e| EngineError::Configuration(e.to_string()))?;
        if config.cache_capacity == 0 || config.baseline_capacity == 0 {
            return Err(EngineError::Configuration(
                "cache_capacity and baseline_capacity must be positive".to_string(),
            ));
        }
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| EngineError::Configuration(e.to_string()))?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| EngineError::Configuration(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| EngineError::Configuration(e.to_string()))
    }

    /// Look up a saved connection by name, case-insensitively.
    pub fn connection(&self, name: &str) -> Result<&NamedConnection> {
        self.connections
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| {
                EngineError::Configuration(format!("no saved connection named {:?}", name))
            })
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_secs(self.health_check_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.postgres.connect_timeout_secs)
    }

    pub fn cache_capacity(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.cache_capacity).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn baseline_capacity(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.baseline_capacity).unwrap_or(NonZeroUsize::MIN)
    }
}
