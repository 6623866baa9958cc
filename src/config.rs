//! Library configuration, loadable from a toml file.
//!
//! A [`Config`] gathers the tunables of every component so an embedding
//! application can keep them in one file and hand out the per-component
//! configs from its composition root.

use crate::exec::breaker::BreakerConfig;
use crate::exec::resources::{ResourcePool, ResourceType};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::error::Result;

fn default_max_concurrency() -> usize {
    4
}

/// Executor tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorSettings {
    /// Concurrency cap for batch runs.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
        }
    }
}

/// Queue tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Concurrency cap for the queue's worker.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
        }
    }
}

/// Default circuit-breaker tunables for breakers created from config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSettings {
    #[serde(default = "BreakerSettings::default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "BreakerSettings::default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "BreakerSettings::default_half_open_max_calls")]
    pub half_open_max_calls: u32,
}

impl BreakerSettings {
    fn default_failure_threshold() -> u32 {
        crate::exec::breaker::DEFAULT_FAILURE_THRESHOLD
    }

    fn default_timeout_secs() -> u64 {
        crate::exec::breaker::DEFAULT_TIMEOUT_SECS
    }

    fn default_half_open_max_calls() -> u32 {
        crate::exec::breaker::DEFAULT_HALF_OPEN_MAX_CALLS
    }
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: Self::default_failure_threshold(),
            timeout_secs: Self::default_timeout_secs(),
            half_open_max_calls: Self::default_half_open_max_calls(),
        }
    }
}

impl From<&BreakerSettings> for BreakerConfig {
    fn from(settings: &BreakerSettings) -> Self {
        BreakerConfig::new(
            settings.failure_threshold,
            Duration::from_secs(settings.timeout_secs),
        )
        .with_half_open_max_calls(settings.half_open_max_calls)
    }
}

/// Resource pool capacity overrides; types not listed keep 1.0.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceSettings {
    #[serde(default)]
    pub capacities: HashMap<ResourceType, f64>,
}

impl ResourceSettings {
    /// Build a pool with these capacities.
    pub fn build_pool(&self) -> ResourcePool {
        ResourcePool::with_capacities(self.capacities.clone())
    }
}

/// Top-level configuration for the execution core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub executor: ExecutorSettings,
    #[serde(default)]
    pub queue: QueueSettings,
    #[serde(default)]
    pub breaker: BreakerSettings,
    #[serde(default)]
    pub resources: ResourceSettings,
}

impl Config {
    /// Load from a toml file; a missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "loading config");
        if !path.exists() {
            debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        Ok(config)
    }

    /// Save to a toml file, creating parent directories as needed.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "config saved");
        Ok(())
    }

    /// The breaker config derived from these settings.
    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig::from(&self.breaker)
    }
}
