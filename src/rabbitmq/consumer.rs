// src/rabbitmq/consumer.rs
use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::broker::Delivery;
use crate::message::{payload_preview, TaskMessage};

/// Error type task handlers return.
pub type TaskError = Box<dyn std::error::Error + Send + Sync>;

/// Callback invoked once per delivered message.
///
/// The handler owns the delivery: it must ack, nack or reject it, and it
/// should finish promptly since nothing else on the queue is delivered until it
/// does.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, delivery: Delivery);
}

/// Wraps an async closure as a [`DeliveryHandler`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F, Fut>
where
    F: Fn(Delivery) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    FnHandler {
        f,
        _future: PhantomData,
    }
}

pub struct FnHandler<F, Fut> {
    f: F,
    _future: PhantomData<fn() -> Fut>,
}

#[async_trait]
impl<F, Fut> DeliveryHandler for FnHandler<F, Fut>
where
    F: Fn(Delivery) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    async fn handle(&self, delivery: Delivery) {
        (self.f)(delivery).await
    }
}

/// Decodes [`TaskMessage`] payloads and settles each delivery from the outcome.
///
/// Success acks. A handler error nacks (requeued unless disabled). A payload
/// that isn't a task message is rejected without requeue.
pub struct TaskDispatcher<F, Fut> {
    handler: F,
    requeue_failed: bool,
    _future: PhantomData<fn() -> Fut>,
}

impl<F, Fut> TaskDispatcher<F, Fut>
where
    F: Fn(TaskMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), TaskError>> + Send,
{
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            requeue_failed: true,
            _future: PhantomData,
        }
    }

    pub fn requeue_failed(mut self, requeue: bool) -> Self {
        self.requeue_failed = requeue;
        self
    }
}

#[async_trait]
impl<F, Fut> DeliveryHandler for TaskDispatcher<F, Fut>
where
    F: Fn(TaskMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), TaskError>> + Send,
{
    async fn handle(&self, delivery: Delivery) {
        let message = match TaskMessage::from_payload(&delivery.data) {
            Ok(message) => message,
            Err(e) => {
                error!(
                    delivery_tag = delivery.delivery_tag,
                    preview = %payload_preview(&delivery.data),
                    error = %e,
                    "Rejecting malformed task message"
                );
                if let Err(e) = delivery.reject(false).await {
                    error!(error = %e, "Failed to reject message");
                }
                return;
            }
        };

        let task = message.task.clone();
        debug!(task = %task, redelivered = delivery.redelivered, "Dispatching task");

        match (self.handler)(message).await {
            Ok(()) => {
                if let Err(e) = delivery.ack().await {
                    error!(task = %task, error = %e, "Failed to acknowledge message");
                }
            }
            Err(e) => {
                warn!(task = %task, requeue = self.requeue_failed, error = %e, "Task failed");
                if let Err(e) = delivery.nack(self.requeue_failed).await {
                    error!(task = %task, error = %e, "Failed to negatively acknowledge message");
                }
            }
        }
    }
}

/// What a finished `consume` call did.
#[derive(Debug, Clone, Serialize)]
pub struct ConsumeSummary {
    pub consumer_tag: String,
    pub delivered: u64,
    pub started_at: DateTime<Utc>,
    pub stopped_at: DateTime<Utc>,
}

impl ConsumeSummary {
    pub fn log(&self) {
        info!(
            consumer_tag = %self.consumer_tag,
            delivered = self.delivered,
            seconds = (self.stopped_at - self.started_at).num_seconds(),
            "Consumer summary"
        );
    }
}
