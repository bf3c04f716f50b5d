//! Engine configuration, loaded from YAML.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the config file when no CLI path is given.
pub const CONFIG_ENV: &str = "BPMN_ACTOR_CONFIG";

/// What the cleansing service does with a completed instance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionPolicy {
    #[default]
    Archive,
    Delete,
}

/// Provider implementation ids, resolved against the
/// [`ProviderRegistry`](crate::providers::ProviderRegistry) at startup.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSelection {
    pub data_objects: String,
    pub timer_store: String,
    pub integration: String,
}

impl Default for ProviderSelection {
    fn default() -> Self {
        Self {
            data_objects: "memory".to_string(),
            timer_store: "memory".to_string(),
            integration: "memory".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Tenant component of every FlowNodeId.
    pub client_id: String,
    pub timer_poll_interval_ms: u64,
    pub completion: CompletionPolicy,
    pub providers: ProviderSelection,
    /// Directory of `*.yaml` process definitions deployed by the host.
    pub definitions_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            client_id: "default".to_string(),
            timer_poll_interval_ms: 1000,
            completion: CompletionPolicy::Archive,
            providers: ProviderSelection::default(),
            definitions_dir: None,
        }
    }
}

impl EngineConfig {
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml::from_str(content).context("Parsing engine config")?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a YAML file. Relative `definitions_dir` resolves against the
    /// file's directory.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
        let mut config: EngineConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Parsing {}", path.display()))?;
        config.validate()?;
        if let (Some(dir), Some(base)) = (config.definitions_dir.as_mut(), path.parent()) {
            if dir.is_relative() {
                *dir = base.join(&*dir);
            }
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.client_id.is_empty(), "client_id must not be empty");
        anyhow::ensure!(
            self.timer_poll_interval_ms > 0,
            "timer_poll_interval_ms must be positive"
        );
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.timer_poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_yaml_gives_defaults() {
        let config = EngineConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
    }

    #[test]
    fn partial_yaml_overrides_fields() {
        let yaml = r#"
client_id: acme
completion: delete
providers:
  timer_store: postgres
"#;
        let config = EngineConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.client_id, "acme");
        assert_eq!(config.completion, CompletionPolicy::Delete);
        assert_eq!(config.providers.timer_store, "postgres");
        assert_eq!(config.providers.data_objects, "memory");
        assert_eq!(config.timer_poll_interval_ms, 1000);
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        assert!(EngineConfig::from_yaml_str("timer_poll_interval_ms: 0").is_err());
    }
}
