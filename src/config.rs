use std::path::Path;

use serde::de::DeserializeOwned;
use tracing::trace;

use crate::collector::system::{Smoothing, Source};

/// Configuration of the `pulse-server` binary
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ServerConfig {
    #[serde(default = "crate::util::get_default_listen")]
    pub listen: String,

    /// Heartbeat interval pushed to relays, in seconds
    #[serde(default = "default_heartbeat")]
    pub heartbeat: u64,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub poll: PollConfig,

    /// Points kept per metric by the in-memory store
    #[serde(default = "default_store_capacity")]
    pub store_capacity: usize,

    /// Webhooks receiving every single sample
    #[serde(default)]
    pub observers: Vec<WebhookConfig>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct PollConfig {
    /// Seconds between two polls
    #[serde(default = "default_poll_interval")]
    pub interval: u64,

    /// Metric names to poll; absent polls every collector of every relay
    pub names: Option<Vec<String>>,

    /// Restrict polling to these relay ids
    pub ids: Option<Vec<String>>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: default_poll_interval(),
            names: None,
            ids: None,
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct WebhookConfig {
    pub name: String,
    pub url: String,
}

/// Configuration of the `pulse-relay` binary
#[derive(Debug, Clone, serde::Deserialize)]
pub struct RelayConfig {
    #[serde(default = "crate::util::get_default_listen")]
    pub server: String,

    /// Relay id, defaults to the host name
    pub id: Option<String>,

    /// Seconds between reconnection attempts
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay: u64,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub collectors: Vec<CollectorConfig>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct CollectorConfig {
    pub name: String,
    pub source: Source,
    #[serde(default)]
    pub tags: Vec<String>,
    pub smoothing: Option<Smoothing>,
}

impl RelayConfig {
    /// Reject smoothing on sources that produce more than one reading.
    pub fn validate(&self) -> anyhow::Result<()> {
        for collector in &self.collectors {
            if collector.smoothing.is_some() && !collector.source.is_point() {
                anyhow::bail!(
                    "collector '{}': smoothing is only supported on cpu and random sources",
                    collector.name
                );
            }
        }
        Ok(())
    }
}

fn default_heartbeat() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_poll_interval() -> u64 {
    60
}

fn default_store_capacity() -> usize {
    crate::sinks::memory::DEFAULT_CAPACITY
}

fn default_reconnect_delay() -> u64 {
    5
}

pub fn read_config_file<T: DeserializeOwned + std::fmt::Debug>(
    path: impl AsRef<Path>,
) -> anyhow::Result<T> {
    let path = path.as_ref();
    let file_content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("unable to read {}: {e}", path.display()))?;
    serde_json::from_str(&file_content)
        .map_err(|e| anyhow::anyhow!("invalid configuration file {}: {e}", path.display()))
        .inspect(|config| trace!("loaded config: {config:?}"))
}
