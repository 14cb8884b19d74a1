//! Configuration loading and resolution.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use carve::{GovernorConfig, ModelField, ReferenceDefinition};
use serde::{Deserialize, Serialize};

/// Environment variable naming the config file when `--config` is absent.
pub const CONFIG_ENV: &str = "CARVE_CONFIG";

const DEFAULT_CONFIG: &str = "carve.yaml";

/// One file: pool limits, named references and the items to extract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    /// Overrides the environment-derived limits when present.
    #[serde(default)]
    pub limits: Option<GovernorConfig>,
    #[serde(default)]
    pub references: Vec<ReferenceDefinition>,
    #[serde(default)]
    pub items: Vec<ItemConfig>,
}

/// A named top-level extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemConfig {
    pub name: String,
    /// Root input templates see through `{{{FromInput=...}}}` and `{INPUT}`.
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default)]
    pub index: Option<u32>,
    #[serde(flatten)]
    pub field: ModelField,
}

impl CliConfig {
    pub fn governor_config(&self) -> GovernorConfig {
        self.limits.clone().unwrap_or_else(GovernorConfig::from_env)
    }

    pub fn item(&self, name: &str) -> Option<&ItemConfig> {
        self.items.iter().find(|item| item.name == name)
    }
}

/// Resolve the config file path: explicit flag, then `CARVE_CONFIG`, then
/// `./carve.yaml`.
pub fn resolve_config_path(explicit: Option<&str>) -> PathBuf {
    if let Some(path) = explicit {
        return PathBuf::from(path);
    }

    if let Ok(env_path) = std::env::var(CONFIG_ENV) {
        if !env_path.is_empty() {
            return PathBuf::from(env_path);
        }
    }

    PathBuf::from(DEFAULT_CONFIG)
}

/// Load a config file, choosing the parser from the extension.
pub fn load_config(path: &Path) -> anyhow::Result<CliConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("unable to read config {}", path.display()))?;
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    match extension.as_deref() {
        Some("json") => serde_json::from_str(&text)
            .with_context(|| format!("invalid JSON config {}", path.display())),
        Some("yaml") | Some("yml") => serde_yaml::from_str(&text)
            .with_context(|| format!("invalid YAML config {}", path.display())),
        other => bail!(
            "unsupported config extension {:?} for {} (expected .json, .yaml or .yml)",
            other.unwrap_or(""),
            path.display()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_path_wins() {
        assert_eq!(
            resolve_config_path(Some("/tmp/custom.json")),
            PathBuf::from("/tmp/custom.json")
        );
    }

    #[test]
    fn test_item_fields_flatten() {
        let config: CliConfig = serde_yaml::from_str(
            r#"
items:
  - name: greeting
    input: {who: world}
    connector:
      source: {kind: static, value: '"hello {{{who}}}"'}
    model: {kind: scalar}
"#,
        )
        .unwrap();
        let item = config.item("greeting").unwrap();
        assert_eq!(item.input["who"], "world");
        assert_eq!(item.index, None);
        assert!(config.limits.is_none());
        assert!(config.references.is_empty());
    }

    #[test]
    fn test_limits_override_environment() {
        let config: CliConfig = serde_json::from_str(
            r#"{"limits": {"http_workers": 3, "host_limits": {"api.example.com": 1}}}"#,
        )
        .unwrap();
        let limits = config.governor_config();
        assert_eq!(limits.http_workers, 3);
        assert_eq!(limits.host_limits.get("api.example.com"), Some(&1));
    }
}
