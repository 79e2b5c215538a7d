use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("failed to serialize config: {0}")]
    Serialize(#[source] serde_yaml::Error),
}

/// One alias -> upstream model mapping inside a provider.
///
/// `alias` is the externally visible model id and defaults to `upstream` when
/// left empty. Lower `priority` wins; `weight` feeds the weighted round-robin
/// share inside a priority tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelMapping {
    #[serde(default)]
    pub alias: String,
    pub upstream: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub weight: i64,
    /// Overrides the manager-wide consecutive-failure threshold for this entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_failures: Option<i64>,
}

impl ModelMapping {
    pub fn effective_alias(&self) -> &str {
        if self.alias.is_empty() {
            &self.upstream
        } else {
            &self.alias
        }
    }

    pub fn effective_weight(&self) -> u64 {
        if self.weight > 0 { self.weight as u64 } else { 1 }
    }

    pub fn effective_priority(&self) -> i64 {
        self.priority
    }

    pub fn effective_max_failures(&self, default: u32) -> u32 {
        match self.max_failures {
            Some(value) if value > 0 => value as u32,
            _ => default,
        }
    }
}

/// One upstream provider: endpoint, credential, balancing knobs and its model
/// mappings. `exclude_params` lists payload keys stripped before forwarding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub weight: i64,
    #[serde(default)]
    pub priority: i64,
    /// Per-attempt timeout in seconds for buffered requests. Defaults to 60.
    #[serde(default)]
    pub timeout: i64,
    #[serde(default)]
    pub model_mappings: Vec<ModelMapping>,
    #[serde(default)]
    pub exclude_params: Vec<String>,
}

impl ProviderConfig {
    pub fn effective_weight(&self) -> u64 {
        if self.weight > 0 { self.weight as u64 } else { 1 }
    }

    pub fn effective_priority(&self) -> i64 {
        self.priority
    }

    pub fn effective_timeout(&self) -> Duration {
        if self.timeout > 0 {
            Duration::from_secs(self.timeout as u64)
        } else {
            Duration::from_secs(60)
        }
    }
}

/// Top-level proxy configuration, loaded from YAML.
///
/// All scalar knobs accept absent or non-positive values and fall back to the
/// documented defaults through the `effective_*` accessors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub api_keys: Vec<String>,
    #[serde(default)]
    pub admin_key: String,
    /// Attempts per request. 1 means no failover retry.
    #[serde(default)]
    pub max_retries: i64,
    /// Consecutive failures before a (provider, upstream) entry goes unhealthy.
    #[serde(default)]
    pub max_failures: i64,
    /// Minimum seconds between recovery probes of one unhealthy entry.
    #[serde(default)]
    pub recovery_interval: i64,
    /// Seconds between recovery sweep passes.
    #[serde(default)]
    pub health_check_period: i64,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

impl ProxyConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let raw = serde_yaml::to_string(self).map_err(ConfigError::Serialize)?;
        fs::write(path, raw).map_err(|source| ConfigError::Write {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn effective_max_retries(&self) -> usize {
        if self.max_retries > 0 {
            self.max_retries as usize
        } else {
            1
        }
    }

    pub fn effective_max_failures(&self) -> u32 {
        if self.max_failures > 0 {
            self.max_failures as u32
        } else {
            3
        }
    }

    pub fn effective_recovery_interval(&self) -> Duration {
        if self.recovery_interval > 0 {
            Duration::from_secs(self.recovery_interval as u64)
        } else {
            Duration::from_secs(30)
        }
    }

    pub fn effective_health_check_period(&self) -> Duration {
        if self.health_check_period > 0 {
            Duration::from_secs(self.health_check_period as u64)
        } else {
            Duration::from_secs(60)
        }
    }

    pub fn apply(&mut self, patch: ProxyConfigPatch) {
        if let Some(providers) = patch.providers {
            self.providers = providers;
        }
        if let Some(max_retries) = patch.max_retries {
            self.max_retries = max_retries;
        }
        if let Some(max_failures) = patch.max_failures {
            self.max_failures = max_failures;
        }
        if let Some(recovery_interval) = patch.recovery_interval {
            self.recovery_interval = recovery_interval;
        }
        if let Some(health_check_period) = patch.health_check_period {
            self.health_check_period = health_check_period;
        }
    }
}

/// Partial update accepted by the admin config endpoint. Absent fields keep
/// their current on-disk values.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProxyConfigPatch {
    pub providers: Option<Vec<ProviderConfig>>,
    pub max_retries: Option<i64>,
    pub max_failures: Option<i64>,
    pub recovery_interval: Option<i64>,
    pub health_check_period: Option<i64>,
}
