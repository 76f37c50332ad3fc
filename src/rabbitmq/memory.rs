// src/rabbitmq/memory.rs
// In-process broker with durable queues, prefetch and fault injection.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::stream;
use tokio::sync::watch;

use super::broker::{
    Acknowledge, Broker, BrokerChannel, BrokerConnection, Delivery, DeliveryStream, QueueInfo,
};
use super::errors::{RabbitMQError, Result};
use crate::config::BrokerConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub data: Vec<u8>,
    pub persistent: bool,
    pub redelivered: bool,
}

#[derive(Debug, Default)]
struct MemoryQueue {
    durable: bool,
    ready: VecDeque<StoredMessage>,
}

#[derive(Debug)]
struct ConnectionState {
    open: bool,
    channels: u16,
}

#[derive(Debug)]
struct ConsumerState {
    queue: String,
    connection_id: u64,
    prefetch: u16,
    unacked: HashMap<u64, StoredMessage>,
}

#[derive(Debug, Default)]
struct State {
    queues: HashMap<String, MemoryQueue>,
    connections: HashMap<u64, ConnectionState>,
    consumers: HashMap<String, ConsumerState>,
    next_connection_id: u64,
    next_delivery_tag: u64,
    connect_attempts: u64,
    failing_connects: u32,
    failing_publishes: u32,
    failing_channels: u32,
    channel_max: Option<u16>,
}

struct Inner {
    state: Mutex<State>,
    changes: watch::Sender<u64>,
}

/// Test-harness broker. Clones share the same queues and connections.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                changes,
            }),
        }
    }
}

enum Next {
    Deliver(Delivery),
    Wait,
    Fail(RabbitMQError),
    End,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self) {
        self.inner.changes.send_modify(|version| *version += 1);
    }

    /// The next `count` connection attempts are refused.
    pub fn fail_next_connects(&self, count: u32) {
        self.state().failing_connects = count;
    }

    /// The next `count` publishes fail after the connection is opened.
    pub fn fail_next_publishes(&self, count: u32) {
        self.state().failing_publishes = count;
    }

    /// The next `count` channel opens fail as if the connection had just
    /// been closed, while it still reports itself open.
    pub fn fail_next_channels(&self, count: u32) {
        self.state().failing_channels = count;
    }

    /// Caps the number of open channels per connection.
    pub fn set_channel_max(&self, channel_max: u16) {
        self.state().channel_max = Some(channel_max);
    }

    /// Simulates the broker dropping every client connection.
    pub fn drop_connections(&self) {
        {
            let mut state = self.state();
            for connection in state.connections.values_mut() {
                connection.open = false;
            }
        }
        self.notify();
    }

    pub fn connect_attempts(&self) -> u64 {
        self.state().connect_attempts
    }

    pub fn open_connections(&self) -> usize {
        self.state().connections.values().filter(|c| c.open).count()
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.state().queues.contains_key(queue)
    }

    pub fn is_durable(&self, queue: &str) -> bool {
        self.state().queues.get(queue).map_or(false, |q| q.durable)
    }

    /// Messages waiting for a consumer.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Delivered but not yet acknowledged, across all consumers of `queue`.
    pub fn unacked(&self, queue: &str) -> usize {
        self.state()
            .consumers
            .values()
            .filter(|c| c.queue == queue)
            .map(|c| c.unacked.len())
            .sum()
    }

    pub fn messages(&self, queue: &str) -> Vec<StoredMessage> {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn connection_open(state: &State, connection_id: u64) -> bool {
        state
            .connections
            .get(&connection_id)
            .map_or(false, |c| c.open)
    }

    // Gives back whatever a consumer still holds, as a broker does on cancel.
    fn requeue_consumer(state: &mut State, consumer_tag: &str) {
        if let Some(consumer) = state.consumers.remove(consumer_tag) {
            let mut pending: Vec<_> = consumer.unacked.into_iter().collect();
            pending.sort_by_key(|(tag, _)| *tag);
            if let Some(queue) = state.queues.get_mut(&consumer.queue) {
                for (_, mut message) in pending.into_iter().rev() {
                    message.redelivered = true;
                    queue.ready.push_front(message);
                }
            }
        }
    }

    // Forgets the connection entirely; returns whether it was still open.
    fn close_connection(&self, connection_id: u64) -> bool {
        let was_open = {
            let mut state = self.state();
            let was_open = state
                .connections
                .remove(&connection_id)
                .map_or(false, |c| c.open);
            let tags: Vec<String> = state
                .consumers
                .iter()
                .filter(|(_, c)| c.connection_id == connection_id)
                .map(|(tag, _)| tag.clone())
                .collect();
            for tag in tags {
                Self::requeue_consumer(&mut state, &tag);
            }
            was_open
        };
        self.notify();
        was_open
    }

    #[cfg(test)]
    fn tracked_connections(&self) -> usize {
        self.state().connections.len()
    }

    fn next_delivery(&self, consumer_tag: &str) -> Next {
        let mut state = self.state();
        let state = &mut *state;

        let Some(consumer) = state.consumers.get(consumer_tag) else {
            return Next::End;
        };
        if !Self::connection_open(state, consumer.connection_id) {
            Self::requeue_consumer(state, consumer_tag);
            return Next::Fail(RabbitMQError::ConnectionClosed(
                "connection closed by broker".to_string(),
            ));
        }

        let Some(consumer) = state.consumers.get_mut(consumer_tag) else {
            return Next::End;
        };
        if consumer.prefetch > 0 && consumer.unacked.len() >= usize::from(consumer.prefetch) {
            return Next::Wait;
        }
        let Some(message) = state
            .queues
            .get_mut(&consumer.queue)
            .and_then(|q| q.ready.pop_front())
        else {
            return Next::Wait;
        };

        state.next_delivery_tag += 1;
        let delivery_tag = state.next_delivery_tag;
        consumer.unacked.insert(delivery_tag, message.clone());

        let acker = MemoryAcker {
            broker: self.clone(),
            consumer_tag: consumer_tag.to_string(),
            delivery_tag,
        };
        Next::Deliver(Delivery::new(
            delivery_tag,
            message.redelivered,
            message.data,
            Arc::new(acker),
        ))
    }

    fn settle(&self, consumer_tag: &str, delivery_tag: u64, requeue: bool) -> Result<()> {
        {
            let mut state = self.state();
            let consumer = state
                .consumers
                .get_mut(consumer_tag)
                .ok_or_else(|| RabbitMQError::AckError(format!("unknown consumer `{}`", consumer_tag)))?;
            let queue = consumer.queue.clone();
            let mut message = consumer
                .unacked
                .remove(&delivery_tag)
                .ok_or_else(|| RabbitMQError::AckError(format!("unknown delivery tag {}", delivery_tag)))?;

            if requeue {
                message.redelivered = true;
                if let Some(queue) = state.queues.get_mut(&queue) {
                    queue.ready.push_front(message);
                }
            }
        }
        self.notify();
        Ok(())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    type Connection = MemoryConnection;

    async fn connect(&self, _config: &BrokerConfig) -> Result<MemoryConnection> {
        let mut state = self.state();
        state.connect_attempts += 1;

        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(RabbitMQError::ConnectionError("connection refused".to_string()));
        }

        state.next_connection_id += 1;
        let id = state.next_connection_id;
        state.connections.insert(id, ConnectionState { open: true, channels: 0 });

        Ok(MemoryConnection {
            broker: self.clone(),
            id,
        })
    }
}

pub struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    type Channel = MemoryChannel;

    fn is_connected(&self) -> bool {
        MemoryBroker::connection_open(&self.broker.state(), self.id)
    }

    async fn create_channel(&self) -> Result<MemoryChannel> {
        let mut state = self.broker.state();
        let channel_max = state.channel_max;

        if state.failing_channels > 0 && MemoryBroker::connection_open(&state, self.id) {
            state.failing_channels -= 1;
            return Err(RabbitMQError::ConnectionClosed(
                "connection closed while opening channel".to_string(),
            ));
        }

        let connection = state
            .connections
            .get_mut(&self.id)
            .filter(|c| c.open)
            .ok_or_else(|| RabbitMQError::ConnectionClosed("connection is Closed".to_string()))?;

        if channel_max.map_or(false, |max| connection.channels >= max) {
            return Err(RabbitMQError::ChannelExhausted);
        }
        connection.channels += 1;

        Ok(MemoryChannel {
            broker: self.broker.clone(),
            connection_id: self.id,
            prefetch: AtomicU16::new(0),
            closed: AtomicBool::new(false),
        })
    }

    async fn close(&self) -> Result<()> {
        if self.broker.close_connection(self.id) {
            Ok(())
        } else {
            Err(RabbitMQError::ConnectionClosed("connection already closed".to_string()))
        }
    }
}

pub struct MemoryChannel {
    broker: MemoryBroker,
    connection_id: u64,
    prefetch: AtomicU16,
    closed: AtomicBool,
}

impl MemoryChannel {
    fn ensure_open(&self, state: &State) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RabbitMQError::ConnectionClosed("channel is Closed".to_string()));
        }
        if !MemoryBroker::connection_open(state, self.connection_id) {
            return Err(RabbitMQError::ConnectionClosed("connection is Closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_durable_queue(&self, queue: &str) -> Result<QueueInfo> {
        let mut state = self.broker.state();
        self.ensure_open(&state)?;

        let consumer_count = state.consumers.values().filter(|c| c.queue == queue).count();
        let declared = state.queues.entry(queue.to_string()).or_default();
        declared.durable = true;

        Ok(QueueInfo {
            name: queue.to_string(),
            message_count: u32::try_from(declared.ready.len()).unwrap_or(u32::MAX),
            consumer_count: u32::try_from(consumer_count).unwrap_or(u32::MAX),
        })
    }

    async fn publish_persistent(&self, queue: &str, payload: &[u8]) -> Result<()> {
        {
            let mut state = self.broker.state();
            self.ensure_open(&state)?;

            if state.failing_publishes > 0 {
                state.failing_publishes -= 1;
                return Err(RabbitMQError::PublishError("broker refused message".to_string()));
            }

            let target = state.queues.get_mut(queue).ok_or_else(|| {
                RabbitMQError::ChannelError(format!("NOT_FOUND - no queue '{}'", queue))
            })?;
            target.ready.push_back(StoredMessage {
                data: payload.to_vec(),
                persistent: true,
                redelivered: false,
            });
        }
        self.broker.notify();
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.ensure_open(&self.broker.state())?;
        self.prefetch.store(count, Ordering::SeqCst);
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        {
            let mut state = self.broker.state();
            self.ensure_open(&state)?;

            if !state.queues.contains_key(queue) {
                return Err(RabbitMQError::ConsumeError(format!("NOT_FOUND - no queue '{}'", queue)));
            }
            if state.consumers.contains_key(consumer_tag) {
                return Err(RabbitMQError::ConsumeError(format!(
                    "consumer tag `{}` already in use",
                    consumer_tag
                )));
            }
            state.consumers.insert(
                consumer_tag.to_string(),
                ConsumerState {
                    queue: queue.to_string(),
                    connection_id: self.connection_id,
                    prefetch: self.prefetch.load(Ordering::SeqCst),
                    unacked: HashMap::new(),
                },
            );
        }

        let seed = (
            self.broker.clone(),
            consumer_tag.to_string(),
            self.broker.inner.changes.subscribe(),
        );

        let deliveries = stream::unfold(seed, |(broker, tag, mut changes)| async move {
            loop {
                changes.borrow_and_update();
                match broker.next_delivery(&tag) {
                    Next::Deliver(delivery) => return Some((Ok(delivery), (broker, tag, changes))),
                    Next::Fail(err) => return Some((Err(err), (broker, tag, changes))),
                    Next::End => return None,
                    Next::Wait => {}
                }
                if changes.changed().await.is_err() {
                    return None;
                }
            }
        });

        Ok(Box::pin(deliveries))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        {
            let mut state = self.broker.state();
            self.ensure_open(&state)?;
            MemoryBroker::requeue_consumer(&mut state, consumer_tag);
        }
        self.broker.notify();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        {
            let mut state = self.broker.state();
            if let Some(connection) = state.connections.get_mut(&self.connection_id) {
                connection.channels = connection.channels.saturating_sub(1);
            }
        }
        Ok(())
    }
}

struct MemoryAcker {
    broker: MemoryBroker,
    consumer_tag: String,
    delivery_tag: u64,
}

#[async_trait]
impl Acknowledge for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.broker.settle(&self.consumer_tag, self.delivery_tag, false)
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.broker.settle(&self.consumer_tag, self.delivery_tag, requeue)
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.broker.settle(&self.consumer_tag, self.delivery_tag, requeue)
    }
}
