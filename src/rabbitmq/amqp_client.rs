// src/rabbitmq/amqp_client.rs
// lapin-backed implementation of the broker seam.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    uri::{AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info};
use uuid::Uuid;

use super::broker::{
    Acknowledge, Broker, BrokerChannel, BrokerConnection, Delivery, DeliveryStream, QueueInfo,
    PERSISTENT_DELIVERY_MODE,
};
use super::errors::{RabbitMQError, Result};
use crate::config::BrokerConfig;

/// Talks AMQP 0-9-1 to a real RabbitMQ server.
#[derive(Debug, Clone)]
pub struct AmqpBroker {
    /// Enable publisher confirms on every channel.
    confirm_mode: bool,
}

impl Default for AmqpBroker {
    fn default() -> Self {
        Self { confirm_mode: true }
    }
}

impl AmqpBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_confirm_mode(mut self, confirm_mode: bool) -> Self {
        self.confirm_mode = confirm_mode;
        self
    }
}

pub fn amqp_uri(config: &BrokerConfig) -> AMQPUri {
    AMQPUri {
        scheme: AMQPScheme::AMQP,
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: config.username.clone(),
                password: config.password.clone(),
            },
            host: config.host.clone(),
            port: config.port,
        },
        vhost: config.vhost.clone(),
        query: AMQPQueryString {
            heartbeat: Some(config.heartbeat_seconds),
            connection_timeout: Some(config.connection_timeout_ms),
            ..AMQPQueryString::default()
        },
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    type Connection = AmqpConnection;

    async fn connect(&self, config: &BrokerConfig) -> Result<AmqpConnection> {
        let mut attempt = 0;

        loop {
            attempt += 1;
            let name = format!("task-queue-{}", &Uuid::new_v4().to_string()[..8]);
            let properties = ConnectionProperties::default().with_connection_name(name.into());

            debug!(
                address = %config.address(),
                attempt,
                max_attempts = config.connection_attempts,
                "Connecting to RabbitMQ"
            );

            let result = match timeout(
                config.connect_timeout(),
                Connection::connect_uri(amqp_uri(config), properties),
            )
            .await
            {
                Ok(Ok(connection)) => Ok(connection),
                Ok(Err(e)) => Err(RabbitMQError::from(e)),
                Err(elapsed) => Err(RabbitMQError::from(elapsed)),
            };

            match result {
                Ok(connection) => {
                    info!(address = %config.address(), "Connected to RabbitMQ");
                    return Ok(AmqpConnection {
                        connection,
                        confirm_mode: self.confirm_mode,
                    });
                }
                Err(err) if attempt < config.connection_attempts => {
                    error!(
                        address = %config.address(),
                        attempt,
                        max_attempts = config.connection_attempts,
                        error = %err,
                        "Failed to connect to RabbitMQ"
                    );
                    sleep(config.connection_retry_delay()).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

pub struct AmqpConnection {
    connection: Connection,
    confirm_mode: bool,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    type Channel = AmqpChannel;

    fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    async fn create_channel(&self) -> Result<AmqpChannel> {
        let channel = self.connection.create_channel().await?;

        if self.confirm_mode {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|e| RabbitMQError::ChannelError(format!("Failed to enable confirm mode: {}", e)))?;
        }

        Ok(AmqpChannel {
            channel,
            confirm_mode: self.confirm_mode,
        })
    }

    async fn close(&self) -> Result<()> {
        self.connection.close(200, "Closing connection").await?;
        Ok(())
    }
}

pub struct AmqpChannel {
    channel: Channel,
    confirm_mode: bool,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_durable_queue(&self, queue: &str) -> Result<QueueInfo> {
        let declared = self
            .channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| RabbitMQError::ChannelError(format!("Failed to declare queue `{}`: {}", queue, e)))?;

        Ok(QueueInfo {
            name: declared.name().as_str().to_string(),
            message_count: declared.message_count(),
            consumer_count: declared.consumer_count(),
        })
    }

    async fn publish_persistent(&self, queue: &str, payload: &[u8]) -> Result<()> {
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(PERSISTENT_DELIVERY_MODE);

        let confirm = self
            .channel
            .basic_publish("", queue, BasicPublishOptions::default(), payload, properties)
            .await
            .map_err(|e| RabbitMQError::PublishError(e.to_string()))?;

        let confirmation = confirm
            .await
            .map_err(|e| RabbitMQError::PublishError(e.to_string()))?;

        if self.confirm_mode && confirmation.is_nack() {
            return Err(RabbitMQError::PublishError(format!(
                "broker refused message for queue `{}`",
                queue
            )));
        }
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|e| RabbitMQError::ChannelError(format!("Failed to set QoS: {}", e)))
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| RabbitMQError::ConsumeError(e.to_string()))?;

        let stream = StreamExt::map(consumer, |delivery| {
            delivery.map_err(RabbitMQError::from).map(|delivery| {
                Delivery::new(
                    delivery.delivery_tag,
                    delivery.redelivered,
                    delivery.data,
                    Arc::new(AmqpAcker(delivery.acker)),
                )
            })
        });

        Ok(Box::pin(stream))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| RabbitMQError::ConsumeError(e.to_string()))
    }

    async fn close(&self) -> Result<()> {
        self.channel.close(200, "Closing channel").await?;
        Ok(())
    }
}

struct AmqpAcker(Acker);

#[async_trait]
impl Acknowledge for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| RabbitMQError::AckError(e.to_string()))
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                ..BasicNackOptions::default()
            })
            .await
            .map_err(|e| RabbitMQError::AckError(e.to_string()))
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.0
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(|e| RabbitMQError::AckError(e.to_string()))
    }
}
