//! ---
//! relay_section: "01-core-functionality"
//! relay_subsection: "module"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Shared configuration and tracing primitives."
//! relay_version: "v0.1.0"
//! relay_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_channel_name() -> String {
    "relay".to_owned()
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_disconnect_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_queue_capacity() -> usize {
    256
}

fn default_command_topic() -> String {
    "relay.commands".to_owned()
}

fn default_reply_topic() -> String {
    "relay.replies".to_owned()
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_max_pending() -> usize {
    1024
}

fn default_history_depth() -> usize {
    100
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_file_output() -> bool {
    true
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

/// Primary configuration object for Relay processes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub correlator: CorrelatorConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "RELAY_CONFIG";

    /// Load configuration from disk, respecting the `RELAY_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    /// Read and validate a single configuration file.
    pub fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.channel.validate()?;
        self.correlator.validate()?;
        self.broker.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Encoding used for envelopes on the wire.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    #[default]
    Json,
    Cbor,
}

impl std::fmt::Display for WireFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireFormat::Json => f.write_str("json"),
            WireFormat::Cbor => f.write_str("cbor"),
        }
    }
}

/// Settings for a subscription channel.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Name used in logs and lifecycle events.
    #[serde(default = "default_channel_name")]
    pub name: String,
    #[serde(default = "default_connect_timeout", rename = "connect_timeout_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub connect_timeout: Duration,
    #[serde(default = "default_disconnect_timeout", rename = "disconnect_timeout_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub disconnect_timeout: Duration,
    #[serde(default)]
    pub wire_format: WireFormat,
    /// Topics subscribed on connect even before a listener is registered.
    #[serde(default)]
    pub subscriptions: Vec<String>,
    /// Capacity used for queue listeners when the caller does not pick one.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            name: default_channel_name(),
            connect_timeout: default_connect_timeout(),
            disconnect_timeout: default_disconnect_timeout(),
            wire_format: WireFormat::default(),
            subscriptions: Vec::new(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl ChannelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(anyhow!("channel name cannot be empty"));
        }
        if self.connect_timeout.is_zero() {
            return Err(anyhow!("channel '{}' connect_timeout_ms must be positive", self.name));
        }
        if self.disconnect_timeout.is_zero() {
            return Err(anyhow!(
                "channel '{}' disconnect_timeout_ms must be positive",
                self.name
            ));
        }
        if self.queue_capacity == 0 {
            return Err(anyhow!("channel '{}' queue_capacity must be positive", self.name));
        }
        if let Some(topic) = self.subscriptions.iter().find(|t| t.trim().is_empty()) {
            return Err(anyhow!(
                "channel '{}' lists an empty subscription topic {:?}",
                self.name,
                topic
            ));
        }
        Ok(())
    }
}

/// Settings for command/reply correlation.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelatorConfig {
    #[serde(default = "default_command_topic")]
    pub command_topic: String,
    #[serde(default = "default_reply_topic")]
    pub reply_topic: String,
    #[serde(default = "default_command_timeout", rename = "default_timeout_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub default_timeout: Duration,
    /// Upper bound on concurrently outstanding commands.
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            command_topic: default_command_topic(),
            reply_topic: default_reply_topic(),
            default_timeout: default_command_timeout(),
            max_pending: default_max_pending(),
        }
    }
}

impl CorrelatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.command_topic.trim().is_empty() || self.reply_topic.trim().is_empty() {
            return Err(anyhow!("correlator command and reply topics cannot be empty"));
        }
        if self.command_topic == self.reply_topic {
            return Err(anyhow!(
                "correlator command_topic and reply_topic must differ (both '{}')",
                self.command_topic
            ));
        }
        if self.default_timeout.is_zero() {
            return Err(anyhow!("correlator default_timeout_ms must be positive"));
        }
        if self.max_pending == 0 {
            return Err(anyhow!("correlator max_pending must be positive"));
        }
        Ok(())
    }
}

/// Settings for the in-process broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Number of envelopes retained per topic for history queries.
    #[serde(default = "default_history_depth")]
    pub history_depth: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            history_depth: default_history_depth(),
        }
    }
}

impl BrokerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.history_depth == 0 {
            return Err(anyhow!("broker history_depth must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
    /// Also write a daily rolling JSON log file under `directory`.
    #[serde(default = "default_file_output")]
    pub file_output: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
            file_output: default_file_output(),
        }
    }
}
