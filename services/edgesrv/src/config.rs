//! Service configuration
//!
//! Sources, later ones override earlier ones:
//! 1. built-in defaults
//! 2. config file (YAML, TOML or JSON by extension)
//! 3. `EDGESRV_` environment variables, `__` separating nested keys
//!    (`EDGESRV_ENGINE__WORKER_COUNT=4`)

use anyhow::{bail, Context, Result};
use edge_rules::EngineConfig;
use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub engine: EngineConfig,

    /// SQLite file for rule state, windows, snapshots and the retry queue
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// YAML rule file; rule CRUD writes back here
    #[serde(default = "default_rules_file")]
    pub rules_file: PathBuf,

    #[serde(default)]
    pub log: LogSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    /// Default filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Directory for daily rolling log files; console only when unset
    #[serde(default)]
    pub dir: Option<PathBuf>,

    #[serde(default = "default_log_prefix")]
    pub file_prefix: String,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("data/edgesrv.db")
}

fn default_rules_file() -> PathBuf {
    PathBuf::from("config/rules.yaml")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_prefix() -> String {
    "edgesrv".to_string()
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: None,
            file_prefix: default_log_prefix(),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            database_path: default_database_path(),
            rules_file: default_rules_file(),
            log: LogSettings::default(),
        }
    }
}

impl ServiceConfig {
    /// Load from an optional file plus environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(path) = path {
            let extension = path
                .extension()
                .and_then(|s| s.to_str())
                .context("Config file has no extension")?;

            figment = match extension {
                "json" => figment.merge(Json::file(path)),
                "toml" => figment.merge(Toml::file(path)),
                "yaml" | "yml" => figment.merge(Yaml::file(path)),
                _ => bail!("Unsupported config format: {}", extension),
            };
        }

        figment = figment.merge(Env::prefixed("EDGESRV_").split("__"));

        let config: ServiceConfig = figment
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to parse config: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.database_path.as_os_str().is_empty() {
            bail!("database_path must not be empty");
        }
        if self.rules_file.as_os_str().is_empty() {
            bail!("rules_file must not be empty");
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_without_file() {
        let config = ServiceConfig::load(None).unwrap();
        assert_eq!(config.engine, EngineConfig::default());
        assert_eq!(config.rules_file, PathBuf::from("config/rules.yaml"));
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_yaml_file_overrides() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "engine:\n  worker_count: 3\n  action_timeout_ms: 500\ndatabase_path: /tmp/edge.db\nlog:\n  level: debug"
        )
        .unwrap();

        let config = ServiceConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.engine.worker_count, 3);
        assert_eq!(config.engine.action_timeout_ms, 500);
        assert_eq!(config.engine.queue_capacity, 1000);
        assert_eq!(config.database_path, PathBuf::from("/tmp/edge.db"));
        assert_eq!(config.log.level, "debug");
    }

    #[test]
    fn test_unknown_extension_rejected() {
        let file = tempfile::Builder::new().suffix(".ini").tempfile().unwrap();
        assert!(ServiceConfig::load(Some(file.path())).is_err());
    }
}
