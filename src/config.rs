use crate::{error::TranscludeError, source::UrlPolicy};
use serde::{Deserialize, Serialize};
use std::{
    fs::{read_to_string, write},
    path::{Path, PathBuf},
};

pub const DEFAULT_POOL_SIZE: usize = 30;
pub const DEFAULT_WORKER_NAME: &str = "transclude-worker";

/// Process-wide engine settings.
///
/// Every field has a default, so an empty (or missing) config file yields a
/// usable engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of pool workers draining the shared scheduler.
    pub pool_size: usize,
    /// Thread name prefix; workers are named `{worker_name}-{n}`.
    pub worker_name: String,
    /// Upper bound on tracked resources. `None` keeps every edge for the
    /// process lifetime.
    pub tracker_capacity: Option<usize>,
    /// Which discovered includes are followed at all.
    pub include_policy: UrlPolicy,
    /// Which included documents are themselves searched for includes.
    pub recurse_policy: UrlPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            pool_size: DEFAULT_POOL_SIZE,
            worker_name: DEFAULT_WORKER_NAME.to_string(),
            tracker_capacity: None,
            include_policy: UrlPolicy::All,
            recurse_policy: UrlPolicy::All,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, TranscludeError> {
        let config: EngineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, TranscludeError> {
        Ok(toml::to_string(self)?)
    }

    pub fn validate(&self) -> Result<(), TranscludeError> {
        if self.pool_size == 0 {
            return Err(TranscludeError::Config(
                "pool_size must be at least 1".to_string(),
            ));
        }
        if self.tracker_capacity == Some(0) {
            return Err(TranscludeError::Config(
                "tracker_capacity must be at least 1 when set".to_string(),
            ));
        }
        Ok(())
    }
}

pub trait EngineConfigProvider: Send + Sync {
    fn get_config(&self) -> Result<EngineConfig, TranscludeError>;
    fn set_config(&self, config: &EngineConfig) -> Result<(), TranscludeError>;
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TomlConfigProvider {
    path: PathBuf,
}

impl TomlConfigProvider {
    pub fn new(path: PathBuf) -> Self {
        TomlConfigProvider { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EngineConfigProvider for TomlConfigProvider {
    fn get_config(&self) -> Result<EngineConfig, TranscludeError> {
        tracing::debug!("Attempting to read engine config from: {:?}", &self.path);
        if !self.path.exists() {
            tracing::debug!("Config file not found, using default engine config.");
            return Ok(EngineConfig::default());
        }
        let content = read_to_string(&self.path)?;
        EngineConfig::from_toml_str(&content)
    }

    fn set_config(&self, config: &EngineConfig) -> Result<(), TranscludeError> {
        tracing::debug!("Attempting to write engine config to: {:?}", &self.path);
        config.validate()?;
        write(&self.path, config.to_toml_string()?)?;
        Ok(())
    }
}
