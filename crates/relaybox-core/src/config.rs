//! Daemon-wide configuration: defaults loaded from a TOML file, then
//! overridden by environment variables.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// `sqlx` connection string, e.g. `sqlite://relaybox.db`.
    #[serde(default = "default_database_url")]
    pub database_url: String,
    /// Address the external HTTP surface binds to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Path the synthesised runtime config is written to.
    #[serde(default = "default_config_path")]
    pub config_path: PathBuf,
    /// Scheduler tick interval, in seconds.
    #[serde(default = "default_scheduler_tick_seconds")]
    pub scheduler_tick_seconds: u64,
    /// Upper bound on concurrent prober workers per probe batch.
    #[serde(default = "default_node_test_concurrency")]
    pub node_test_concurrency: usize,
    /// Shell command template that validates a candidate config.
    #[serde(default)]
    pub check_cmd: Option<String>,
    /// Shell command template that restarts the engine against a config.
    #[serde(default)]
    pub restart_cmd: Option<String>,
    /// Clash-API compatible controller address attached under
    /// `experimental.clash_api`, e.g. `127.0.0.1:9090`. Omitted from the
    /// synthesised config entirely when unset.
    #[serde(default)]
    pub external_controller: Option<String>,
    /// Bearer secret required by clients of `external_controller`.
    #[serde(default)]
    pub external_controller_secret: Option<String>,
    /// Emit logs as JSON lines instead of human-readable text.
    #[serde(default)]
    pub log_json: bool,
    /// Tracing `EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_database_url() -> String {
    "sqlite://relaybox.db".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0:8787".to_string()
}

fn default_config_path() -> PathBuf {
    PathBuf::from("data/sing-box.json")
}

fn default_scheduler_tick_seconds() -> u64 {
    30
}

fn default_node_test_concurrency() -> usize {
    8
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            bind_addr: default_bind_addr(),
            config_path: default_config_path(),
            scheduler_tick_seconds: default_scheduler_tick_seconds(),
            node_test_concurrency: default_node_test_concurrency(),
            check_cmd: None,
            restart_cmd: None,
            external_controller: None,
            external_controller_secret: None,
            log_json: false,
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Loads defaults, then a TOML file if `path` exists, then applies
    /// environment overrides. Mirrors the two-phase "defaulted struct,
    /// then env override" shape used elsewhere in the workspace.
    pub fn load(path: Option<&std::path::Path>) -> crate::Result<Self> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let text = std::fs::read_to_string(path)?;
                toml::from_str(&text)
                    .map_err(|e| crate::Error::new("REQ_INVALID_FIELD", e.to_string()))?
            }
            _ => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var("RELAYBOX_DATABASE_URL") {
            self.database_url = value;
        }
        if let Ok(value) = std::env::var("RELAYBOX_BIND_ADDR") {
            self.bind_addr = value;
        }
        if let Ok(value) = std::env::var("SINGBOX_CONFIG") {
            self.config_path = PathBuf::from(value);
        }
        if let Ok(value) = std::env::var("SINGBOX_CHECK_CMD") {
            self.check_cmd = Some(value);
        }
        if let Ok(value) = std::env::var("SINGBOX_RESTART_CMD") {
            self.restart_cmd = Some(value);
        }
        if let Ok(value) = std::env::var("RELAYBOX_EXTERNAL_CONTROLLER") {
            self.external_controller = Some(value);
        }
        if let Ok(value) = std::env::var("RELAYBOX_EXTERNAL_CONTROLLER_SECRET") {
            self.external_controller_secret = Some(value);
        }
        if let Ok(value) = std::env::var("RELAYBOX_LOG_LEVEL") {
            self.log_level = value;
        }
    }
}

impl From<std::io::Error> for crate::Error {
    fn from(err: std::io::Error) -> Self {
        crate::Error::new("INTERNAL_ERROR", err.to_string())
    }
}
