// src/rabbitmq/connection.rs
use std::future::Future;

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::amqp_client::AmqpBroker;
use super::broker::{Broker, BrokerChannel, BrokerConnection, QueueInfo};
use super::consumer::{ConsumeSummary, DeliveryHandler};
use super::errors::{RabbitMQError, Result};
use crate::config::{validate_queue_name, BrokerConfig};

/// Only one message is in flight per consumer.
pub const CONSUMER_PREFETCH: u16 = 1;

/// Owns at most one long-lived broker connection.
///
/// Construct it once at startup and share it (`Arc<ConnectionManager<_>>`).
/// `publish` and `declare_queue` open their own short-lived connections and
/// never touch the long-lived one.
pub struct ConnectionManager<B: Broker = AmqpBroker> {
    pub(crate) broker: B,
    pub(crate) config: BrokerConfig,
    connection: Mutex<Option<B::Connection>>,
}

impl ConnectionManager<AmqpBroker> {
    /// Manager backed by a real RabbitMQ server.
    pub fn amqp(config: BrokerConfig) -> Result<Self> {
        Self::new(AmqpBroker::new(), config)
    }
}

impl<B: Broker> ConnectionManager<B> {
    pub fn new(broker: B, config: BrokerConfig) -> Result<Self> {
        config.validate()?;
        Ok(ConnectionManager {
            broker,
            config,
            connection: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    pub async fn is_connected(&self) -> bool {
        self.connection
            .lock()
            .await
            .as_ref()
            .map_or(false, |connection| connection.is_connected())
    }

    /// Replaces the long-lived connection and declares the configured queues on it.
    ///
    /// With `wait` set, pauses before dialing so a broker that is mid-recovery
    /// isn't hit by a reconnect storm. Failures are returned, not retried.
    pub async fn establish_connection(&self, wait: bool) -> Result<()> {
        let mut slot = self.connection.lock().await;
        self.establish_locked(&mut slot, wait).await
    }

    async fn establish_locked(
        &self,
        slot: &mut MutexGuard<'_, Option<B::Connection>>,
        wait: bool,
    ) -> Result<()> {
        info!(
            host = %self.config.host,
            port = self.config.port,
            "Establishing connection with RabbitMQ"
        );

        if let Some(previous) = slot.take() {
            if let Err(e) = previous.close().await {
                debug!(error = %e, "Ignoring error while closing previous connection");
            }
        }

        if wait {
            sleep(self.config.reconnect_wait()).await;
        }

        let connection = self.broker.connect(&self.config).await?;
        let declared = async {
            let channel = connection.create_channel().await?;
            for queue in &self.config.queues {
                channel.declare_durable_queue(queue).await?;
            }
            if let Err(e) = channel.close().await {
                debug!(error = %e, "Failed to close bootstrap channel");
            }
            Ok::<(), RabbitMQError>(())
        }
        .await;

        if let Err(err) = declared {
            if let Err(e) = connection.close().await {
                debug!(error = %e, "Failed to close half-established connection");
            }
            return Err(err);
        }

        **slot = Some(connection);
        Ok(())
    }

    /// Returns a fresh channel on a live connection, reconnecting if needed.
    pub async fn get_channel(&self) -> Result<<B::Connection as BrokerConnection>::Channel> {
        let mut slot = self.connection.lock().await;

        let stale = slot.as_ref().map_or(true, |connection| !connection.is_connected());
        if stale {
            warn!(
                host = %self.config.host,
                port = self.config.port,
                "Re-establishing connection with RabbitMQ"
            );
            self.establish_locked(&mut slot, false).await?;
        }

        let attempt = match slot.as_ref() {
            Some(connection) => connection.create_channel().await,
            None => Err(RabbitMQError::ConnectionClosed("no connection".to_string())),
        };

        match attempt {
            Ok(channel) => Ok(channel),
            Err(err) if err.is_connection_lost() => {
                warn!(
                    host = %self.config.host,
                    port = self.config.port,
                    error = %err,
                    "Re-establishing connection with RabbitMQ"
                );
                sleep(self.config.channel_retry_pause()).await;
                self.establish_locked(&mut slot, false).await?;

                let connection = slot
                    .as_ref()
                    .ok_or_else(|| RabbitMQError::ConnectionClosed("no connection".to_string()))?;
                connection.create_channel().await
            }
            Err(err) => Err(err),
        }
    }

    /// Declares `queue` durable over a dedicated short-lived connection.
    pub async fn declare_queue(&self, queue: &str) -> Result<QueueInfo> {
        validate_queue_name(queue)?;

        let connection = self.broker.connect(&self.config).await?;
        let result = async {
            let channel = connection.create_channel().await?;
            channel.declare_durable_queue(queue).await
        }
        .await;

        if let Err(e) = connection.close().await {
            debug!(queue, error = %e, "Failed to close declare connection");
        }

        let declared = result?;
        info!(queue, messages = declared.message_count, "Declared durable queue");
        Ok(declared)
    }

    /// Runs the receive loop on `queue` until `shutdown` resolves.
    ///
    /// Prefetch is 1 and `handler` is awaited inline, so it never sees a second
    /// message while the first is still being handled. Settling the delivery is
    /// up to the handler. Setup errors and a lost connection end the loop with an
    /// error; the caller's supervisor is expected to restart it.
    pub async fn consume<H, S>(&self, queue: &str, handler: &H, shutdown: S) -> Result<ConsumeSummary>
    where
        H: DeliveryHandler + ?Sized,
        S: Future<Output = ()> + Send,
    {
        validate_queue_name(queue)?;

        self.establish_connection(false).await?;
        let channel = self.get_channel().await?;
        channel.set_prefetch(CONSUMER_PREFETCH).await?;
        channel.declare_durable_queue(queue).await?;

        let consumer_tag = format!("{}-{}", queue, Uuid::new_v4());
        let mut deliveries = channel.consume(queue, &consumer_tag).await?;
        let started_at = Utc::now();
        info!(queue, consumer_tag = %consumer_tag, "Started consuming");

        tokio::pin!(shutdown);
        let mut delivered = 0u64;

        let outcome = loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    info!(queue, consumer_tag = %consumer_tag, "Interrupt received, stopping consumer");
                    break Ok(());
                }
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => {
                        delivered += 1;
                        handler.handle(delivery).await;
                    }
                    Some(Err(err)) => {
                        error!(queue, consumer_tag = %consumer_tag, error = %err, "Consumer failed");
                        break Err(err);
                    }
                    None => {
                        break Err(RabbitMQError::ConsumeError(format!(
                            "consumer `{}` was cancelled by the broker",
                            consumer_tag
                        )));
                    }
                },
            }
        };

        if outcome.is_ok() {
            if let Err(e) = channel.cancel(&consumer_tag).await {
                debug!(error = %e, "Failed to cancel consumer");
            }
            if let Err(e) = channel.close().await {
                debug!(error = %e, "Failed to close consumer channel");
            }
        }
        drop(deliveries);

        if let Err(e) = self.close().await {
            debug!(error = %e, "Failed to close connection after consuming");
        }

        let summary = ConsumeSummary {
            consumer_tag,
            delivered,
            started_at,
            stopped_at: Utc::now(),
        };
        info!(queue, delivered = summary.delivered, "Stopped consuming");
        outcome.map(|()| summary)
    }

    /// `consume` that stops on Ctrl+C.
    pub async fn consume_until_ctrl_c<H>(&self, queue: &str, handler: &H) -> Result<ConsumeSummary>
    where
        H: DeliveryHandler + ?Sized,
    {
        let interrupt = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Unable to listen for Ctrl+C, consuming until the broker stops");
                std::future::pending::<()>().await;
            }
        };
        self.consume(queue, handler, interrupt).await
    }

    /// Closes the long-lived connection, if there is one.
    pub async fn close(&self) -> Result<()> {
        if let Some(connection) = self.connection.lock().await.take() {
            info!("Closing RabbitMQ connection");
            connection.close().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rabbitmq::memory::MemoryBroker;

    fn quiet_config(queues: &[&str]) -> BrokerConfig {
        BrokerConfig {
            queues: queues.iter().map(|q| q.to_string()).collect(),
            reconnect_wait_ms: 0,
            channel_retry_pause_ms: 0,
            publish_retry_delay_ms: 0,
            ..BrokerConfig::default()
        }
    }

    #[tokio::test]
    async fn starts_without_a_connection() {
        let manager = ConnectionManager::new(MemoryBroker::new(), quiet_config(&[])).unwrap();
        assert!(!manager.is_connected().await);
    }

    #[tokio::test]
    async fn establishing_declares_configured_queues() {
        let broker = MemoryBroker::new();
        let manager = ConnectionManager::new(broker.clone(), quiet_config(&["default", "billing"])).unwrap();

        manager.establish_connection(false).await.unwrap();

        assert!(manager.is_connected().await);
        assert!(broker.is_durable("default"));
        assert!(broker.is_durable("billing"));
    }

    #[tokio::test]
    async fn re_establishing_replaces_the_connection() {
        let broker = MemoryBroker::new();
        let manager = ConnectionManager::new(broker.clone(), quiet_config(&[])).unwrap();

        manager.establish_connection(false).await.unwrap();
        manager.establish_connection(true).await.unwrap();

        assert_eq!(broker.connect_attempts(), 2);
        assert_eq!(broker.open_connections(), 1);
    }

    #[tokio::test]
    async fn establish_failure_is_not_retried() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(1);
        let manager = ConnectionManager::new(broker.clone(), quiet_config(&[])).unwrap();

        let err = manager.establish_connection(false).await.unwrap_err();
        assert!(matches!(err, RabbitMQError::ConnectionError(_)));
        assert_eq!(broker.connect_attempts(), 1);
        assert!(!manager.is_connected().await);
    }

    #[tokio::test]
    async fn get_channel_connects_lazily() {
        let broker = MemoryBroker::new();
        let manager = ConnectionManager::new(broker.clone(), quiet_config(&["default"])).unwrap();

        let channel = manager.get_channel().await.unwrap();
        channel.declare_durable_queue("default").await.unwrap();
        assert_eq!(broker.open_connections(), 1);
    }

    #[tokio::test]
    async fn get_channel_replaces_a_dropped_connection() {
        let broker = MemoryBroker::new();
        let manager = ConnectionManager::new(broker.clone(), quiet_config(&[])).unwrap();
        manager.establish_connection(false).await.unwrap();

        broker.drop_connections();
        assert!(!manager.is_connected().await);

        let channel = manager.get_channel().await.unwrap();
        channel.declare_durable_queue("after-drop").await.unwrap();
        assert_eq!(broker.connect_attempts(), 2);
        assert!(manager.is_connected().await);
    }

    #[tokio::test]
    async fn get_channel_reconnects_once_when_channels_run_out() {
        let broker = MemoryBroker::new();
        broker.set_channel_max(1);
        let manager = ConnectionManager::new(broker.clone(), quiet_config(&[])).unwrap();

        let _first = manager.get_channel().await.unwrap();
        let _second = manager.get_channel().await.unwrap();

        assert_eq!(broker.connect_attempts(), 2);
        assert_eq!(broker.open_connections(), 1);
    }

    #[tokio::test]
    async fn failed_bootstrap_closes_the_new_connection() {
        let broker = MemoryBroker::new();
        broker.set_channel_max(0);
        let manager = ConnectionManager::new(broker.clone(), quiet_config(&["default"])).unwrap();

        let err = manager.establish_connection(false).await.unwrap_err();

        assert!(matches!(err, RabbitMQError::ChannelExhausted));
        assert!(!manager.is_connected().await);
        assert_eq!(broker.open_connections(), 0);
    }

    #[tokio::test]
    async fn failed_reconnect_in_get_channel_leaves_nothing_open() {
        let broker = MemoryBroker::new();
        let manager = ConnectionManager::new(broker.clone(), quiet_config(&[])).unwrap();
        manager.establish_connection(false).await.unwrap();

        broker.drop_connections();
        broker.set_channel_max(0);

        assert!(manager.get_channel().await.is_err());
        assert_eq!(broker.open_connections(), 0);
    }

    #[tokio::test]
    async fn get_channel_recovers_when_the_connection_closes_underneath_it() {
        let broker = MemoryBroker::new();
        let manager = ConnectionManager::new(broker.clone(), quiet_config(&["default"])).unwrap();
        manager.establish_connection(false).await.unwrap();
        broker.fail_next_channels(1);

        let channel = manager.get_channel().await.unwrap();
        channel.declare_durable_queue("default").await.unwrap();

        assert_eq!(broker.connect_attempts(), 2);
        assert_eq!(broker.open_connections(), 1);
        assert!(manager.is_connected().await);
    }

    #[tokio::test]
    async fn declare_queue_uses_its_own_connection() {
        let broker = MemoryBroker::new();
        let manager = ConnectionManager::new(broker.clone(), quiet_config(&[])).unwrap();

        let info = manager.declare_queue("provisioned").await.unwrap();

        assert_eq!(info.name, "provisioned");
        assert!(broker.is_durable("provisioned"));
        assert_eq!(broker.open_connections(), 0);
        assert!(!manager.is_connected().await);
    }

    #[tokio::test]
    async fn declare_queue_rejects_empty_names() {
        let broker = MemoryBroker::new();
        let manager = ConnectionManager::new(broker.clone(), quiet_config(&[])).unwrap();

        assert!(manager.declare_queue("").await.is_err());
        assert_eq!(broker.connect_attempts(), 0);
    }

    #[tokio::test]
    async fn close_drops_the_connection() {
        let broker = MemoryBroker::new();
        let manager = ConnectionManager::new(broker.clone(), quiet_config(&[])).unwrap();
        manager.establish_connection(false).await.unwrap();

        manager.close().await.unwrap();
        manager.close().await.unwrap();

        assert_eq!(broker.open_connections(), 0);
        assert!(!manager.is_connected().await);
    }

    #[test]
    fn invalid_config_is_rejected_up_front() {
        let config = BrokerConfig { host: String::new(), ..BrokerConfig::default() };
        assert!(ConnectionManager::new(MemoryBroker::new(), config).is_err());
    }
}
