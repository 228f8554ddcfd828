//! Runtime configuration.
//!
//! The host parses `crush.yaml` into [`Config`] before the extension
//! runtime starts; the runtime itself only consumes the parsed object.
//! Extensions may mutate the configuration in place from their
//! config-load hook, so everything here is plain owned data.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Skills gating configuration.
///
/// Applied after discovery, before skills are surfaced as tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillsConfig {
    /// Master switch -- when `false` no skills are registered.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Allowlist of skill names. When non-empty only these are kept.
    #[serde(default)]
    pub allow: Vec<String>,
    /// Denylist of skill names, applied after the allowlist.
    #[serde(default)]
    pub deny: Vec<String>,
}

impl Default for SkillsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allow: Vec::new(),
            deny: Vec::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// Top-level configuration consumed by the extension runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Ordered list of extension artifact paths loaded at startup.
    /// Empty or absent means "no extensions".
    #[serde(default)]
    pub plugins: Vec<String>,
    /// Skills gating configuration.
    #[serde(default)]
    pub skills: Option<SkillsConfig>,
    /// Free-form options. Extensions may read or rewrite entries from
    /// their config-load hook; the host treats unknown keys as opaque.
    #[serde(default)]
    pub options: HashMap<String, serde_json::Value>,
}

impl Config {
    /// Read and parse a YAML configuration file.
    pub async fn load(path: &Path) -> anyhow::Result<Config> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        let config: Config =
            serde_yaml::from_str(&contents).context("failed to parse config YAML")?;
        config.validate()?;

        tracing::debug!(plugins = config.plugins.len(), "configuration loaded");
        Ok(config)
    }

    /// Validate semantic constraints that serde cannot enforce.
    pub fn validate(&self) -> anyhow::Result<()> {
        for (i, path) in self.plugins.iter().enumerate() {
            if path.trim().is_empty() {
                anyhow::bail!("config: plugins[{i}] is an empty path");
            }
        }
        Ok(())
    }

    /// Serialize and write the configuration back to a YAML file.
    pub async fn save(&self, path: &Path) -> anyhow::Result<()> {
        let contents = serde_yaml::to_string(self).context("serialize config YAML")?;
        tokio::fs::write(path, &contents)
            .await
            .with_context(|| format!("failed to write config file: {}", path.display()))?;
        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }
}
