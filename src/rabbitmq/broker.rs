// src/rabbitmq/broker.rs
// The seam between the connection manager and a concrete broker client.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;

use super::errors::Result;
use crate::config::BrokerConfig;

/// AMQP delivery mode that asks the broker to write the message to disk.
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery>> + Send>>;

/// Opens connections to a broker.
#[async_trait]
pub trait Broker: Send + Sync {
    type Connection: BrokerConnection;

    async fn connect(&self, config: &BrokerConfig) -> Result<Self::Connection>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    type Channel: BrokerChannel;

    /// False once the broker (or we) closed the connection.
    fn is_connected(&self) -> bool;

    async fn create_channel(&self) -> Result<Self::Channel>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declares `queue` durable. Declaring an existing queue is a no-op.
    async fn declare_durable_queue(&self, queue: &str) -> Result<QueueInfo>;

    /// Publishes to `queue` through the default exchange with persistent delivery mode.
    async fn publish_persistent(&self, queue: &str, payload: &[u8]) -> Result<()>;

    async fn set_prefetch(&self, count: u16) -> Result<()>;

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Settles a single delivery with the broker.
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self) -> Result<()>;
    async fn nack(&self, requeue: bool) -> Result<()>;
    async fn reject(&self, requeue: bool) -> Result<()>;
}

/// A message handed to a consumer. Settling it is the handler's job.
pub struct Delivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub data: Vec<u8>,
    acker: Arc<dyn Acknowledge>,
}

impl Delivery {
    pub fn new(delivery_tag: u64, redelivered: bool, data: Vec<u8>, acker: Arc<dyn Acknowledge>) -> Self {
        Self {
            delivery_tag,
            redelivered,
            data,
            acker,
        }
    }

    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }

    pub async fn reject(&self, requeue: bool) -> Result<()> {
        self.acker.reject(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("len", &self.data.len())
            .finish()
    }
}
