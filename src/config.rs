// src/config.rs
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::rabbitmq::errors::RabbitMQError;

/// Longest name AMQP accepts for a queue (short string).
const MAX_QUEUE_NAME_LEN: usize = 255;

/// Environment variable that points at an explicit config file.
pub const CONFIG_PATH_VAR: &str = "RABBITMQ_CONFIG";

/// Broker connection settings, read once when the process starts.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_vhost")]
    pub vhost: String,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default = "default_password")]
    pub password: String,

    /// Queues declared durable every time a connection is established.
    #[serde(default)]
    pub queues: Vec<String>,

    #[serde(default = "default_heartbeat")]
    pub heartbeat_seconds: u16,
    #[serde(default = "default_connection_attempts")]
    pub connection_attempts: u32,
    #[serde(default = "default_connection_retry_delay")]
    pub connection_retry_delay_ms: u64,
    #[serde(default = "default_timeout")]
    pub connection_timeout_ms: u64,

    /// Pause before reconnecting so a recovering broker isn't hammered.
    #[serde(default = "default_reconnect_wait")]
    pub reconnect_wait_ms: u64,
    #[serde(default = "default_channel_retry_pause")]
    pub channel_retry_pause_ms: u64,

    #[serde(default = "default_publish_max_retries")]
    pub publish_max_retries: u32,
    #[serde(default = "default_publish_retry_delay")]
    pub publish_retry_delay_ms: u64,
}

// Default values
pub(crate) fn default_host() -> String { "localhost".to_string() }
pub(crate) fn default_port() -> u16 { 5672 }
pub(crate) fn default_vhost() -> String { "/".to_string() }
pub(crate) fn default_username() -> String { "guest".to_string() }
pub(crate) fn default_password() -> String { "guest".to_string() }
pub(crate) fn default_heartbeat() -> u16 { 1200 }
pub(crate) fn default_connection_attempts() -> u32 { 5 }
pub(crate) fn default_connection_retry_delay() -> u64 { 2000 }
pub(crate) fn default_timeout() -> u64 { 5000 }
pub(crate) fn default_reconnect_wait() -> u64 { 2000 }
pub(crate) fn default_channel_retry_pause() -> u64 { 1000 }
pub(crate) fn default_publish_max_retries() -> u32 { 2 }
pub(crate) fn default_publish_retry_delay() -> u64 { 1000 }

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            vhost: default_vhost(),
            username: default_username(),
            password: default_password(),
            queues: Vec::new(),
            heartbeat_seconds: default_heartbeat(),
            connection_attempts: default_connection_attempts(),
            connection_retry_delay_ms: default_connection_retry_delay(),
            connection_timeout_ms: default_timeout(),
            reconnect_wait_ms: default_reconnect_wait(),
            channel_retry_pause_ms: default_channel_retry_pause(),
            publish_max_retries: default_publish_max_retries(),
            publish_retry_delay_ms: default_publish_retry_delay(),
        }
    }
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("vhost", &self.vhost)
            .field("username", &self.username)
            .field("password", &"***")
            .field("queues", &self.queues)
            .field("heartbeat_seconds", &self.heartbeat_seconds)
            .field("connection_attempts", &self.connection_attempts)
            .field("connection_timeout_ms", &self.connection_timeout_ms)
            .field("publish_max_retries", &self.publish_max_retries)
            .finish_non_exhaustive()
    }
}

impl BrokerConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(u64::from(self.heartbeat_seconds))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn connection_retry_delay(&self) -> Duration {
        Duration::from_millis(self.connection_retry_delay_ms)
    }

    pub fn reconnect_wait(&self) -> Duration {
        Duration::from_millis(self.reconnect_wait_ms)
    }

    pub fn channel_retry_pause(&self) -> Duration {
        Duration::from_millis(self.channel_retry_pause_ms)
    }

    pub fn publish_retry_delay(&self) -> Duration {
        Duration::from_millis(self.publish_retry_delay_ms)
    }

    /// `host:port`, used in log lines.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> std::result::Result<(), RabbitMQError> {
        if self.host.trim().is_empty() {
            return Err(RabbitMQError::ConfigError("host cannot be empty".to_string()));
        }
        if self.port == 0 {
            return Err(RabbitMQError::ConfigError("port cannot be 0".to_string()));
        }
        if self.connection_attempts == 0 {
            return Err(RabbitMQError::ConfigError(
                "connection_attempts must be at least 1".to_string(),
            ));
        }
        for queue in &self.queues {
            validate_queue_name(queue)?;
        }
        Ok(())
    }
}

pub fn validate_queue_name(queue: &str) -> std::result::Result<(), RabbitMQError> {
    if queue.is_empty() {
        return Err(RabbitMQError::ConfigError("queue name cannot be empty".to_string()));
    }
    if queue.len() > MAX_QUEUE_NAME_LEN {
        return Err(RabbitMQError::ConfigError(format!(
            "queue name `{}...` exceeds {} bytes",
            queue.chars().take(32).collect::<String>(),
            MAX_QUEUE_NAME_LEN
        )));
    }
    Ok(())
}

// Configuration file discovery, loading and writing
pub fn find_config_file() -> Result<PathBuf> {
    if let Ok(explicit) = std::env::var(CONFIG_PATH_VAR) {
        let path = PathBuf::from(explicit);
        if path.exists() {
            debug!("Using config file from {}: {}", CONFIG_PATH_VAR, path.display());
            return Ok(path);
        }
        return Err(anyhow!("{} points at a missing file: {}", CONFIG_PATH_VAR, path.display()));
    }

    let locations = [
        ("Current directory", Path::new("TaskQueue.json")),
        ("Current directory (alternative)", Path::new("config/TaskQueue.json")),
    ];

    for (location_name, path) in locations.iter() {
        if path.exists() {
            debug!("Found config file in {}: {}", location_name, path.display());
            return Ok(path.to_path_buf());
        }
    }

    if let Some(home_dir) = home::home_dir() {
        let home_config = home_dir.join(".TaskQueue.json");
        if home_config.exists() {
            debug!("Found config file in home directory: {}", home_config.display());
            return Ok(home_config);
        }
    }

    Err(anyhow!(
        "Could not find TaskQueue.json in the current directory, config/ or your home directory"
    ))
}

pub fn load_config(path: &Path) -> Result<BrokerConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;

    let config: BrokerConfig = serde_json::from_str(&content)
        .context("Configuration file contains invalid JSON or fields of the wrong type")?;

    config.validate()?;
    Ok(config)
}

pub fn write_default_config(path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(&BrokerConfig::default())
        .context("Failed to serialize default configuration")?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory at {}", parent.display()))?;
        }
    }

    fs::write(path, json)
        .with_context(|| format!("Failed to write configuration to {}", path.display()))?;

    info!("Created default configuration file at: {}", path.display());
    Ok(())
}
