//! Durable task publishing and consumption over RabbitMQ.
//!
//! A [`ConnectionManager`] is built once per process from a [`BrokerConfig`]
//! and shared by every caller that publishes tasks or runs a consumer.

pub mod config;
pub mod env;
pub mod message;
pub mod rabbitmq;

pub use config::BrokerConfig;
pub use message::{TaskMessage, DEFAULT_QUEUE};
pub use rabbitmq::{ConnectionManager, RabbitMQError, Result};
