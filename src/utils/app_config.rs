/// Application configuration management
/// Stores user preferences in <config_dir>/stack-cli/config.toml

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::registry::{InvalidationRule, Registry, Service};
use crate::core::sequencer::{HealthGate, UnhealthyPolicy};
use crate::utils::constants::{
    default_invalidation_rules, default_services, DEFAULT_ARCHIVE_PREFIX, DEFAULT_BACKUP_DIR,
    DEFAULT_HELPER_IMAGE, DEFAULT_NETWORK,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthConfig {
    /// humantime duration, e.g. "60s" or "2m"
    pub timeout: Option<String>,
    pub interval: Option<String>,
    pub on_timeout: Option<UnhealthyPolicy>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub project_root: Option<String>,
    /// Relative to the project root unless absolute
    pub backup_dir: Option<String>,
    pub archive_prefix: Option<String>,
    pub helper_image: Option<String>,
    pub network: Option<String>,
    #[serde(default)]
    pub health: HealthConfig,
    /// Replaces the built-in service list when non-empty
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<Service>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub invalidation: Vec<InvalidationRule>,
}

fn parse_duration(field: &str, value: &Option<String>, default: Duration) -> Result<Duration> {
    match value {
        Some(text) => humantime::parse_duration(text)
            .with_context(|| format!("Invalid duration for health.{}: '{}'", field, text)),
        None => Ok(default),
    }
}

impl AppConfig {
    /// Get config file path
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Could not determine the user config directory")?
            .join("stack-cli");

        // Create directory if it doesn't exist
        fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir.join("config.toml"))
    }

    /// Load configuration from file
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;

        Ok(())
    }

    /// Set and save project root
    pub fn set_project_root(&mut self, root: PathBuf) -> Result<()> {
        self.project_root = Some(root.to_string_lossy().to_string());
        self.save()
    }

    pub fn backup_root(&self, project_root: &Path) -> PathBuf {
        let dir = PathBuf::from(self.backup_dir.as_deref().unwrap_or(DEFAULT_BACKUP_DIR));
        if dir.is_absolute() {
            dir
        } else {
            project_root.join(dir)
        }
    }

    pub fn archive_prefix(&self) -> String {
        self.archive_prefix
            .clone()
            .unwrap_or_else(|| DEFAULT_ARCHIVE_PREFIX.to_string())
    }

    pub fn helper_image(&self) -> String {
        self.helper_image
            .clone()
            .unwrap_or_else(|| DEFAULT_HELPER_IMAGE.to_string())
    }

    pub fn network(&self) -> String {
        self.network.clone().unwrap_or_else(|| DEFAULT_NETWORK.to_string())
    }

    pub fn health_gate(&self) -> Result<HealthGate> {
        let defaults = HealthGate::default();
        let gate = HealthGate {
            timeout: parse_duration("timeout", &self.health.timeout, defaults.timeout)?,
            interval: parse_duration("interval", &self.health.interval, defaults.interval)?,
        };
        if gate.interval.is_zero() {
            anyhow::bail!("health.interval must be greater than zero");
        }
        Ok(gate)
    }

    pub fn on_unhealthy(&self) -> UnhealthyPolicy {
        self.health.on_timeout.unwrap_or_default()
    }

    /// Configured services, or the built-in stack. Built-in invalidation rules
    /// apply to whichever of their services are still registered.
    pub fn registry(&self) -> Result<Registry> {
        let services = if self.services.is_empty() {
            default_services()
        } else {
            self.services.clone()
        };

        let rules = if self.invalidation.is_empty() {
            let known = |name: &str| services.iter().any(|s| s.name == name);
            default_invalidation_rules()
                .into_iter()
                .filter(|rule| known(rule.service.as_str()))
                .map(|rule| InvalidationRule {
                    invalidates: rule.invalidates.into_iter().filter(|n| known(n.as_str())).collect(),
                    ..rule
                })
                .filter(|rule| !rule.invalidates.is_empty())
                .collect()
        } else {
            self.invalidation.clone()
        };

        Registry::new(services, rules).context("Invalid service configuration")
    }
}
