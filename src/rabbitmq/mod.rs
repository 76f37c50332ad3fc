// src/rabbitmq/mod.rs
// Durable task queue plumbing on top of RabbitMQ

pub mod errors;
pub mod broker;
pub mod connection;
pub mod consumer;
pub mod memory;

mod amqp_client;
mod publisher;

// Re-export specific items to simplify imports elsewhere
pub use amqp_client::{amqp_uri, AmqpBroker, AmqpChannel, AmqpConnection};
pub use broker::{Broker, BrokerChannel, BrokerConnection, Delivery, DeliveryStream, QueueInfo};
pub use connection::ConnectionManager;
pub use consumer::{handler_fn, ConsumeSummary, DeliveryHandler, TaskDispatcher, TaskError};
pub use errors::{RabbitMQError, Result};
pub use memory::MemoryBroker;
