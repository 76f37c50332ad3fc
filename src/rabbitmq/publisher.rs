// src/rabbitmq/publisher.rs
use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, error, info};

use super::broker::{Broker, BrokerChannel, BrokerConnection};
use super::connection::ConnectionManager;
use super::errors::{RabbitMQError, Result};
use crate::config::validate_queue_name;
use crate::message::{payload_preview, TaskMessage};

impl<B: Broker> ConnectionManager<B> {
    /// Publishes `payload` to `queue` as a persistent message.
    ///
    /// Every attempt opens its own connection, declares the queue durable,
    /// publishes and closes the connection again. A failed attempt is retried up
    /// to `publish_max_retries` more times with a fixed pause in between; once
    /// the budget is spent the last error comes back wrapped in
    /// [`RabbitMQError::RetriesExhausted`]. Delivery is at-least-once: a retry
    /// after a partial failure can enqueue the message twice.
    pub async fn publish(&self, queue: &str, payload: &[u8]) -> Result<()> {
        validate_queue_name(queue)?;

        let max_attempts = self.config.publish_max_retries.saturating_add(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.send_message(queue, payload).await {
                Ok(()) => {
                    info!(
                        queue,
                        attempt,
                        preview = %payload_preview(payload),
                        "Submitted message"
                    );
                    return Ok(());
                }
                Err(err) => {
                    error!(
                        queue,
                        attempt,
                        max_attempts,
                        preview = %payload_preview(payload),
                        error = %err,
                        "Failed to publish message"
                    );
                    if attempt >= max_attempts {
                        return Err(RabbitMQError::RetriesExhausted {
                            queue: queue.to_string(),
                            attempts: attempt,
                            source: Box::new(err),
                        });
                    }
                    sleep(self.config.publish_retry_delay()).await;
                }
            }
        }
    }

    /// Serializes `{task, params}` and publishes it to `queue`.
    ///
    /// A serialization failure is returned straight away without contacting
    /// the broker.
    pub async fn submit_task<P>(&self, task: &str, params: &P, queue: &str) -> Result<()>
    where
        P: Serialize + ?Sized,
    {
        let message = TaskMessage::with_params(task, params)?;
        let payload = message.to_payload()?;
        self.publish(queue, &payload).await
    }

    async fn send_message(&self, queue: &str, payload: &[u8]) -> Result<()> {
        let connection = self.broker.connect(&self.config).await?;

        let result = async {
            let channel = connection.create_channel().await?;
            channel.declare_durable_queue(queue).await?;
            channel.publish_persistent(queue, payload).await
        }
        .await;

        if let Err(e) = connection.close().await {
            debug!(queue, error = %e, "Failed to close publish connection");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;
    use crate::rabbitmq::memory::MemoryBroker;
    use serde_json::json;

    fn manager(broker: &MemoryBroker) -> ConnectionManager<MemoryBroker> {
        let config = BrokerConfig {
            publish_retry_delay_ms: 0,
            ..BrokerConfig::default()
        };
        ConnectionManager::new(broker.clone(), config).unwrap()
    }

    #[tokio::test]
    async fn publish_enqueues_one_persistent_message() {
        let broker = MemoryBroker::new();
        manager(&broker).publish("default", b"hello").await.unwrap();

        let messages = broker.messages("default");
        assert_eq!(messages.len(), 1);
        assert!(messages[0].persistent);
        assert!(broker.is_durable("default"));
        assert_eq!(broker.open_connections(), 0);
    }

    #[tokio::test]
    async fn publish_retries_a_failed_send() {
        let broker = MemoryBroker::new();
        broker.fail_next_publishes(1);

        manager(&broker).publish("default", b"hello").await.unwrap();

        assert_eq!(broker.connect_attempts(), 2);
        assert_eq!(broker.queue_depth("default"), 1);
    }

    #[tokio::test]
    async fn publish_gives_up_after_three_attempts() {
        let broker = MemoryBroker::new();
        broker.fail_next_publishes(3);

        let err = manager(&broker).publish("default", b"hello").await.unwrap_err();

        match err {
            RabbitMQError::RetriesExhausted { queue, attempts, source } => {
                assert_eq!(queue, "default");
                assert_eq!(attempts, 3);
                assert!(matches!(*source, RabbitMQError::PublishError(_)));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(broker.queue_depth("default"), 0);
        assert_eq!(broker.open_connections(), 0);
    }

    #[tokio::test]
    async fn retry_budget_follows_config() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(1);
        let config = BrokerConfig {
            publish_max_retries: 0,
            publish_retry_delay_ms: 0,
            ..BrokerConfig::default()
        };
        let manager = ConnectionManager::new(broker.clone(), config).unwrap();

        let err = manager.publish("default", b"hello").await.unwrap_err();
        assert!(matches!(err, RabbitMQError::RetriesExhausted { attempts: 1, .. }));
        assert_eq!(broker.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn huge_retry_budget_still_publishes() {
        let broker = MemoryBroker::new();
        broker.fail_next_publishes(1);
        let config = BrokerConfig::from_lookup(|key| {
            (key == "RABBITMQ_PUBLISH_MAX_RETRIES").then(|| u32::MAX.to_string())
        })
        .unwrap();
        let config = BrokerConfig { publish_retry_delay_ms: 0, ..config };
        let manager = ConnectionManager::new(broker.clone(), config).unwrap();

        manager.publish("default", b"x").await.unwrap();

        assert_eq!(broker.connect_attempts(), 2);
        assert_eq!(broker.queue_depth("default"), 1);
    }

    #[tokio::test]
    async fn submit_task_wraps_params() {
        let broker = MemoryBroker::new();
        manager(&broker)
            .submit_task("sync_subscription", &json!({"code": "monthly_pro"}), "billing")
            .await
            .unwrap();

        let stored = broker.messages("billing");
        let decoded = TaskMessage::from_payload(&stored[0].data).unwrap();
        assert_eq!(decoded, TaskMessage::new("sync_subscription", json!({"code": "monthly_pro"})));
    }

    #[tokio::test]
    async fn unserializable_params_never_reach_the_broker() {
        use std::collections::HashMap;

        let broker = MemoryBroker::new();
        let mut params = HashMap::new();
        params.insert((1, 2), "tuple keys are not valid JSON object keys");

        let err = manager(&broker).submit_task("bad", &params, "default").await.unwrap_err();

        assert!(matches!(err, RabbitMQError::SerializationError(_)));
        assert_eq!(broker.connect_attempts(), 0);
    }
}
