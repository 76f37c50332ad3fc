// src/env.rs
use std::env;
use std::str::FromStr;

use dotenv::dotenv;

use crate::config::BrokerConfig;
use crate::rabbitmq::errors::{RabbitMQError, Result};

pub const HOST_VAR: &str = "RABBITMQ_HOST";
pub const PORT_VAR: &str = "RABBITMQ_PORT";
pub const VHOST_VAR: &str = "RABBITMQ_VHOST";
pub const USER_VAR: &str = "RABBITMQ_USER";
pub const PASS_VAR: &str = "RABBITMQ_PASS";
pub const QUEUES_VAR: &str = "RABBITMQ_QUEUES";

impl BrokerConfig {
    /// Reads the broker settings from the process environment (and `.env`).
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key lookup; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = BrokerConfig::default();

        let config = BrokerConfig {
            host: lookup(HOST_VAR).unwrap_or(defaults.host),
            port: parse_or(&lookup, PORT_VAR, defaults.port)?,
            vhost: lookup(VHOST_VAR).unwrap_or(defaults.vhost),
            username: lookup(USER_VAR).unwrap_or(defaults.username),
            password: lookup(PASS_VAR).unwrap_or(defaults.password),
            queues: match lookup(QUEUES_VAR) {
                Some(raw) => split_queues(&raw),
                None => defaults.queues,
            },
            heartbeat_seconds: parse_or(&lookup, "RABBITMQ_HEARTBEAT", defaults.heartbeat_seconds)?,
            connection_attempts: parse_or(
                &lookup,
                "RABBITMQ_CONNECTION_ATTEMPTS",
                defaults.connection_attempts,
            )?,
            connection_retry_delay_ms: parse_or(
                &lookup,
                "RABBITMQ_CONNECTION_RETRY_DELAY_MS",
                defaults.connection_retry_delay_ms,
            )?,
            connection_timeout_ms: parse_or(
                &lookup,
                "RABBITMQ_CONNECT_TIMEOUT_MS",
                defaults.connection_timeout_ms,
            )?,
            reconnect_wait_ms: parse_or(&lookup, "RABBITMQ_RECONNECT_WAIT_MS", defaults.reconnect_wait_ms)?,
            channel_retry_pause_ms: parse_or(
                &lookup,
                "RABBITMQ_CHANNEL_RETRY_PAUSE_MS",
                defaults.channel_retry_pause_ms,
            )?,
            publish_max_retries: parse_or(
                &lookup,
                "RABBITMQ_PUBLISH_MAX_RETRIES",
                defaults.publish_max_retries,
            )?,
            publish_retry_delay_ms: parse_or(
                &lookup,
                "RABBITMQ_PUBLISH_RETRY_DELAY_MS",
                defaults.publish_retry_delay_ms,
            )?,
        };

        config.validate()?;
        Ok(config)
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|e| {
            RabbitMQError::ConfigError(format!("{} has an invalid value `{}`: {}", key, raw, e))
        }),
        None => Ok(default),
    }
}

fn split_queues(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|queue| !queue.is_empty())
        .map(str::to_string)
        .collect()
}
