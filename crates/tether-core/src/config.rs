//! Bridge configuration loaded from file and environment.
//!
//! | Key | Default | Description |
//! |-----|---------|-------------|
//! | host | 127.0.0.1 | Gateway bind address. |
//! | port | 8010 | Gateway port. |
//! | storage_path | ./data | Base directory for the sled vault. |
//! | read_timeout_secs | 90 | Max gap between successful inbound reads. |
//! | ping_interval_secs | 30 | Writer-side liveness probe period. |
//! | outbound_capacity | 100 | Per-connection outbound queue bound. |
//! | enqueue_timeout_secs | 5 | Max wait to place a request on a full queue. |
//! | tool_call_timeout_secs | 30 | Default wait for a `tool_result`. |
//! | command_timeout_secs | 30 | Wait for a `server_command_ack`. |
//! | duplicate_policy | replace | `replace` or `reject` a re-registered client id. |
//! | tokens | {} | Bearer token -> user id, used by the gateway identity source. |

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "config/bridge";

/// What to do when a client id that is already active registers again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Tear the prior connection down, then store the new one.
    #[default]
    Replace,
    /// Refuse the new registration.
    Reject,
}

/// Top-level configuration for the bridge gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub app_name: String,
    pub host: String,
    pub port: u16,
    pub storage_path: String,
    pub read_timeout_secs: u64,
    pub ping_interval_secs: u64,
    pub outbound_capacity: usize,
    pub enqueue_timeout_secs: u64,
    pub tool_call_timeout_secs: u64,
    pub command_timeout_secs: u64,
    #[serde(default)]
    pub duplicate_policy: DuplicatePolicy,
    #[serde(default)]
    pub tokens: HashMap<String, String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            app_name: "Tether Bridge".to_string(),
            host: "127.0.0.1".to_string(),
            port: 8010,
            storage_path: "./data".to_string(),
            read_timeout_secs: 90,
            ping_interval_secs: 30,
            outbound_capacity: 100,
            enqueue_timeout_secs: 5,
            tool_call_timeout_secs: 30,
            command_timeout_secs: 30,
            duplicate_policy: DuplicatePolicy::Replace,
            tokens: HashMap::new(),
        }
    }
}

impl BridgeConfig {
    /// Load config from file and environment. Precedence: env `TETHER__*` >
    /// file at `TETHER_CONFIG` (default `config/bridge[.toml]`) > defaults.
    pub fn load() -> Result<Self, config::ConfigError> {
        let path = std::env::var("TETHER_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(Path::new(&path))
    }

    /// Load using the given file (if it exists) plus environment overrides.
    pub fn load_from(path: &Path) -> Result<Self, config::ConfigError> {
        let defaults = Self::default();
        let builder = config::Config::builder()
            .set_default("app_name", defaults.app_name)?
            .set_default("host", defaults.host)?
            .set_default("port", defaults.port as i64)?
            .set_default("storage_path", defaults.storage_path)?
            .set_default("read_timeout_secs", defaults.read_timeout_secs as i64)?
            .set_default("ping_interval_secs", defaults.ping_interval_secs as i64)?
            .set_default("outbound_capacity", defaults.outbound_capacity as i64)?
            .set_default("enqueue_timeout_secs", defaults.enqueue_timeout_secs as i64)?
            .set_default("tool_call_timeout_secs", defaults.tool_call_timeout_secs as i64)?
            .set_default("command_timeout_secs", defaults.command_timeout_secs as i64)?
            .set_default("duplicate_policy", "replace")?;

        let builder = if path.exists() || path.with_extension("toml").exists() {
            builder.add_source(config::File::with_name(&path.to_string_lossy()))
        } else {
            builder
        };

        let built = builder
            .add_source(config::Environment::with_prefix("TETHER").separator("__"))
            .build()?;

        built.try_deserialize()
    }

    /// Write this configuration as TOML (creates parent directories).
    pub fn save_to_path(&self, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        Ok(())
    }

    /// Directory of the sled vault holding engrams, persona facts and the audit log.
    pub fn vault_path(&self) -> PathBuf {
        Path::new(&self.storage_path).join("bridge_vault")
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Runtime settings for the bridge crate.
    pub fn link_settings(&self) -> LinkSettings {
        LinkSettings {
            read_timeout: Duration::from_secs(self.read_timeout_secs.max(1)),
            ping_interval: Duration::from_secs(self.ping_interval_secs.max(1)),
            outbound_capacity: self.outbound_capacity.max(1),
            enqueue_timeout: Duration::from_secs(self.enqueue_timeout_secs),
            tool_call_timeout: Duration::from_secs(self.tool_call_timeout_secs.max(1)),
            command_timeout: Duration::from_secs(self.command_timeout_secs.max(1)),
            duplicate_policy: self.duplicate_policy,
        }
    }
}

/// Timeouts and bounds used by the registry and the per-connection loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkSettings {
    pub read_timeout: Duration,
    pub ping_interval: Duration,
    pub outbound_capacity: usize,
    pub enqueue_timeout: Duration,
    pub tool_call_timeout: Duration,
    pub command_timeout: Duration,
    pub duplicate_policy: DuplicatePolicy,
}

impl Default for LinkSettings {
    fn default() -> Self {
        BridgeConfig::default().link_settings()
    }
}
