// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Broker
//!
//! A single-process stand-in for RabbitMQ implementing the transport traits,
//! meant for tests. It supports the subset of AMQP the bus relies on: direct
//! exchanges, durable queues, bindings, manual acks and requeueing nacks.
//! Unacknowledged messages return to their queue, flagged as redelivered,
//! when the channel that received them goes away.
//!
//! Faults are injected from the test side: unreachable broker, failing
//! connects or publishes, dropped connections and channel errors.

use crate::{
    errors::TransportError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    transport::{
        BrokerChannel, BrokerConnection, ChannelNotification, ConnectionNotification,
        DeliveryStream, InboundDelivery, MessageProperties, OutboundMessage, Transport,
    },
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use parking_lot::Mutex;
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::debug;

type DeliverySender = UnboundedSender<Result<InboundDelivery, TransportError>>;

#[derive(Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    redelivered: bool,
    properties: MessageProperties,
    body: Vec<u8>,
}

struct Consumer {
    channel: u64,
    tx: DeliverySender,
}

struct QueueState {
    def: QueueDefinition,
    bindings: Vec<(String, String)>,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<Consumer>,
    next_consumer: usize,
}

struct Unacked {
    channel: u64,
    queue: String,
    message: StoredMessage,
}

struct ConnectionState {
    open: Arc<AtomicBool>,
    notifier: UnboundedSender<ConnectionNotification>,
}

struct ChannelState {
    connection: u64,
    open: Arc<AtomicBool>,
    notifier: UnboundedSender<ChannelNotification>,
}

#[derive(Default)]
struct BrokerState {
    unreachable: bool,
    failing_connects: u32,
    failing_publishes: u32,
    failing_binds: u32,
    exchanges: HashMap<String, ExchangeDefinition>,
    queues: HashMap<String, QueueState>,
    unacked: HashMap<u64, Unacked>,
    connections: HashMap<u64, ConnectionState>,
    channels: HashMap<u64, ChannelState>,
    next_id: u64,
    next_tag: u64,
    published: usize,
    returned: usize,
    acks: usize,
    nacks: usize,
    connects: usize,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn ensure_channel(&self, channel: u64) -> Result<(), TransportError> {
        match self.channels.get(&channel) {
            Some(state) if state.open.load(Ordering::SeqCst) => Ok(()),
            _ => Err(TransportError::ChannelClosed(format!("channel {channel} is closed"))),
        }
    }

    /// Hands ready messages to the queue consumers, round-robin.
    fn dispatch(&mut self, queue: &str) {
        loop {
            let Some(state) = self.queues.get_mut(queue) else {
                return;
            };

            if state.ready.is_empty() || state.consumers.is_empty() {
                return;
            }

            let index = state.next_consumer % state.consumers.len();
            let Some(message) = state.ready.pop_front() else {
                return;
            };

            self.next_tag += 1;
            let tag = self.next_tag;
            let delivery = InboundDelivery {
                delivery_tag: tag,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                redelivered: message.redelivered,
                properties: message.properties.clone(),
                body: message.body.clone(),
            };

            let consumer = &state.consumers[index];
            let channel = consumer.channel;
            if consumer.tx.send(Ok(delivery)).is_err() {
                state.consumers.remove(index);
                state.ready.push_front(message);
                continue;
            }

            state.next_consumer = index + 1;
            self.unacked.insert(
                tag,
                Unacked {
                    channel,
                    queue: queue.to_owned(),
                    message,
                },
            );
        }
    }

    fn requeue(&mut self, tag: u64) {
        let Some(unacked) = self.unacked.remove(&tag) else {
            return;
        };

        if let Some(queue) = self.queues.get_mut(&unacked.queue) {
            let mut message = unacked.message;
            message.redelivered = true;
            queue.ready.push_front(message);
        }
        self.dispatch(&unacked.queue);
    }

    /// Closes the channel, cancelling its consumers and requeueing what it held.
    fn close_channel(&mut self, channel: u64) -> Option<ChannelState> {
        let state = self.channels.remove(&channel)?;
        state.open.store(false, Ordering::SeqCst);

        for queue in self.queues.values_mut() {
            queue.consumers.retain(|c| c.channel != channel);
        }

        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.channel == channel)
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable_by(|a, b| b.cmp(a));
        for tag in tags {
            self.requeue(tag);
        }

        Some(state)
    }

    fn close_connection(&mut self, connection: u64) -> Option<ConnectionState> {
        let state = self.connections.remove(&connection)?;
        state.open.store(false, Ordering::SeqCst);

        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, c)| c.connection == connection)
            .map(|(id, _)| *id)
            .collect();
        for channel in channels {
            self.close_channel(channel);
        }

        Some(state)
    }
}

/// Handle on an in-memory broker; clones share the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> MemoryBroker {
        MemoryBroker::default()
    }

    /// While unreachable, every connect fails with [`TransportError::Unreachable`].
    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().unreachable = !reachable;
    }

    /// Makes the next `count` connects fail with a socket error.
    pub fn fail_next_connects(&self, count: u32) {
        self.state.lock().failing_connects = count;
    }

    /// Makes the next `count` publishes fail with a socket error.
    pub fn fail_next_publishes(&self, count: u32) {
        self.state.lock().failing_publishes = count;
    }

    /// Makes the next `count` queue bindings fail with an access error.
    pub fn fail_next_binds(&self, count: u32) {
        self.state.lock().failing_binds = count;
    }

    /// Closes every connection as a broker restart would, raising shutdown notifications.
    pub fn drop_connections(&self) {
        let mut state = self.state.lock();
        let ids: Vec<u64> = state.connections.keys().copied().collect();

        for id in ids {
            if let Some(conn) = state.close_connection(id) {
                let _ = conn
                    .notifier
                    .send(ConnectionNotification::Shutdown("connection forced".to_owned()));
            }
        }
        debug!("memory broker dropped every connection");
    }

    /// Drops every connection and forgets what a restart would not keep:
    /// non-durable exchanges and queues, and bindings to forgotten exchanges.
    pub fn restart(&self) {
        self.drop_connections();

        let mut state = self.state.lock();
        state.exchanges.retain(|_, def| def.durable);
        state.queues.retain(|_, q| q.def.durable);

        let BrokerState {
            exchanges, queues, ..
        } = &mut *state;
        for queue in queues.values_mut() {
            queue
                .bindings
                .retain(|(exchange, _)| exchanges.contains_key(exchange));
        }
        debug!("memory broker restarted");
    }

    /// Fails every channel that has a consumer attached; returns how many were hit.
    pub fn raise_channel_error(&self) -> usize {
        let mut state = self.state.lock();
        let mut targets: Vec<u64> = state
            .queues
            .values()
            .flat_map(|q| q.consumers.iter().map(|c| c.channel))
            .collect();
        targets.sort_unstable();
        targets.dedup();

        for channel in &targets {
            if let Some(closed) = state.close_channel(*channel) {
                let _ = closed
                    .notifier
                    .send(ChannelNotification::CallbackError("channel error".to_owned()));
            }
        }

        targets.len()
    }

    /// Routing keys bound to `queue`, in binding order.
    pub fn bindings(&self, queue: &str) -> Vec<String> {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.bindings.iter().map(|(_, key)| key.clone()).collect())
            .unwrap_or_default()
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.state.lock().queues.contains_key(queue)
    }

    pub fn exchange_exists(&self, exchange: &str) -> bool {
        self.state.lock().exchanges.contains_key(exchange)
    }

    /// Ready plus unacknowledged messages of `queue`.
    pub fn queue_depth(&self, queue: &str) -> usize {
        let state = self.state.lock();
        let ready = state.queues.get(queue).map_or(0, |q| q.ready.len());
        let unacked = state.unacked.values().filter(|u| u.queue == queue).count();
        ready + unacked
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.consumers.len())
    }

    pub fn ack_count(&self) -> usize {
        self.state.lock().acks
    }

    pub fn nack_count(&self) -> usize {
        self.state.lock().nacks
    }

    pub fn published_count(&self) -> usize {
        self.state.lock().published
    }

    /// Mandatory messages that matched no binding.
    pub fn returned_count(&self) -> usize {
        self.state.lock().returned
    }

    pub fn connect_count(&self) -> usize {
        self.state.lock().connects
    }

    pub fn open_channel_count(&self) -> usize {
        self.state.lock().channels.len()
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, TransportError> {
        let mut state = self.state.lock();

        if state.unreachable {
            return Err(TransportError::Unreachable("memory broker is down".to_owned()));
        }

        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(TransportError::Socket("connection reset by peer".to_owned()));
        }

        let id = state.next_id();
        let open = Arc::new(AtomicBool::new(true));
        let (notifier, rx) = unbounded_channel();
        state.connections.insert(
            id,
            ConnectionState {
                open: open.clone(),
                notifier,
            },
        );
        state.connects += 1;

        Ok(Arc::new(MemoryConnection {
            id,
            open,
            broker: self.clone(),
            notifications: Mutex::new(Some(rx)),
        }))
    }
}

struct MemoryConnection {
    id: u64,
    open: Arc<AtomicBool>,
    broker: MemoryBroker,
    notifications: Mutex<Option<UnboundedReceiver<ConnectionNotification>>>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn endpoint(&self) -> String {
        "memory".to_owned()
    }

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, TransportError> {
        let mut state = self.broker.state.lock();

        if !self.is_open() {
            return Err(TransportError::Unreachable("connection is closed".to_owned()));
        }

        let id = state.next_id();
        let open = Arc::new(AtomicBool::new(true));
        let (notifier, rx) = unbounded_channel();
        state.channels.insert(
            id,
            ChannelState {
                connection: self.id,
                open: open.clone(),
                notifier,
            },
        );

        Ok(Arc::new(MemoryChannel {
            id,
            open,
            broker: self.broker.clone(),
            notifications: Mutex::new(Some(rx)),
        }))
    }

    fn notifications(&self) -> Option<UnboundedReceiver<ConnectionNotification>> {
        self.notifications.lock().take()
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.broker.state.lock().close_connection(self.id);
        Ok(())
    }
}

struct MemoryChannel {
    id: u64,
    open: Arc<AtomicBool>,
    broker: MemoryBroker,
    notifications: Mutex<Option<UnboundedReceiver<ChannelNotification>>>,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock();
        state.ensure_channel(self.id)?;

        match state.exchanges.get(&def.name) {
            Some(existing) if existing.kind != def.kind || existing.durable != def.durable => Err(
                TransportError::Protocol(format!("inequivalent arg for exchange '{}'", def.name)),
            ),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(def.name.clone(), def.clone());
                Ok(())
            }
        }
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock();
        state.ensure_channel(self.id)?;

        match state.queues.get(&def.name) {
            Some(existing) if existing.def.durable != def.durable => Err(TransportError::Protocol(
                format!("inequivalent arg 'durable' for queue '{}'", def.name),
            )),
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    def.name.clone(),
                    QueueState {
                        def: def.clone(),
                        bindings: Vec::new(),
                        ready: VecDeque::new(),
                        consumers: Vec::new(),
                        next_consumer: 0,
                    },
                );
                Ok(())
            }
        }
    }

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock();
        state.ensure_channel(self.id)?;

        if state.failing_binds > 0 {
            state.failing_binds -= 1;
            return Err(TransportError::Protocol(format!(
                "access refused binding '{}'",
                binding.queue_name
            )));
        }

        if !state.exchanges.contains_key(&binding.exchange_name) {
            return Err(TransportError::Protocol(format!(
                "no exchange '{}'",
                binding.exchange_name
            )));
        }

        let Some(queue) = state.queues.get_mut(&binding.queue_name) else {
            return Err(TransportError::Protocol(format!(
                "no queue '{}'",
                binding.queue_name
            )));
        };

        let key = (binding.exchange_name.clone(), binding.routing_key.clone());
        if !queue.bindings.contains(&key) {
            queue.bindings.push(key);
        }
        Ok(())
    }

    async fn queue_unbind(&self, binding: &QueueBinding) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock();
        state.ensure_channel(self.id)?;

        if let Some(queue) = state.queues.get_mut(&binding.queue_name) {
            queue
                .bindings
                .retain(|(exchange, key)| {
                    exchange != &binding.exchange_name || key != &binding.routing_key
                });
        }
        Ok(())
    }

    async fn basic_publish(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock();
        state.ensure_channel(self.id)?;

        if state.failing_publishes > 0 {
            state.failing_publishes -= 1;
            return Err(TransportError::Socket("broken pipe".to_owned()));
        }

        if !state.exchanges.contains_key(&message.exchange) {
            return Err(TransportError::Protocol(format!(
                "no exchange '{}'",
                message.exchange
            )));
        }

        let targets: Vec<String> = state
            .queues
            .iter()
            .filter(|(_, q)| {
                q.bindings
                    .iter()
                    .any(|(exchange, key)| exchange == &message.exchange && key == &message.routing_key)
            })
            .map(|(name, _)| name.clone())
            .collect();

        state.published += 1;
        if targets.is_empty() && message.mandatory {
            state.returned += 1;
        }

        for name in targets {
            if let Some(queue) = state.queues.get_mut(&name) {
                queue.ready.push_back(StoredMessage {
                    exchange: message.exchange.clone(),
                    routing_key: message.routing_key.clone(),
                    redelivered: false,
                    properties: message.properties.clone(),
                    body: message.body.clone(),
                });
            }
            state.dispatch(&name);
        }

        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
    ) -> Result<DeliveryStream, TransportError> {
        let mut state = self.broker.state.lock();
        state.ensure_channel(self.id)?;

        let (tx, rx) = unbounded_channel();
        let Some(target) = state.queues.get_mut(queue) else {
            return Err(TransportError::Protocol(format!("no queue '{queue}'")));
        };
        target.consumers.push(Consumer {
            channel: self.id,
            tx,
        });
        state.dispatch(queue);

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
        })
        .boxed())
    }

    async fn basic_ack(&self, delivery_tag: u64, _multiple: bool) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock();
        state.ensure_channel(self.id)?;

        match state.unacked.get(&delivery_tag) {
            Some(unacked) if unacked.channel == self.id => {
                state.unacked.remove(&delivery_tag);
                state.acks += 1;
                Ok(())
            }
            _ => Err(TransportError::Protocol(format!(
                "unknown delivery tag {delivery_tag}"
            ))),
        }
    }

    async fn basic_nack(
        &self,
        delivery_tag: u64,
        _multiple: bool,
        requeue: bool,
    ) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock();
        state.ensure_channel(self.id)?;

        match state.unacked.get(&delivery_tag) {
            Some(unacked) if unacked.channel == self.id => {
                state.nacks += 1;
                if requeue {
                    state.requeue(delivery_tag);
                } else {
                    state.unacked.remove(&delivery_tag);
                }
                Ok(())
            }
            _ => Err(TransportError::Protocol(format!(
                "unknown delivery tag {delivery_tag}"
            ))),
        }
    }

    fn notifications(&self) -> Option<UnboundedReceiver<ChannelNotification>> {
        self.notifications.lock().take()
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.broker.state.lock().close_channel(self.id);
        Ok(())
    }
}

/// Polls `condition` every few milliseconds until it holds or `timeout` elapses.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        if condition() {
            return true;
        }

        if tokio::time::Instant::now() >= deadline {
            return false;
        }

        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(key: &str) -> OutboundMessage {
        OutboundMessage {
            exchange: "bus".to_owned(),
            routing_key: key.to_owned(),
            mandatory: true,
            properties: MessageProperties::default(),
            body: b"{}".to_vec(),
        }
    }

    async fn topology(broker: &MemoryBroker) -> Arc<dyn BrokerChannel> {
        let conn = broker.connect().await.unwrap();
        let channel = conn.create_channel().await.unwrap();
        channel
            .exchange_declare(&ExchangeDefinition::new("bus"))
            .await
            .unwrap();
        channel
            .queue_declare(&QueueDefinition::new("q").durable())
            .await
            .unwrap();
        channel
            .queue_bind(&QueueBinding::new("q").exchange("bus").routing_key("A"))
            .await
            .unwrap();
        channel
    }

    #[tokio::test]
    async fn routes_by_exact_routing_key() {
        let broker = MemoryBroker::new();
        let channel = topology(&broker).await;

        channel.basic_publish(&message("A")).await.unwrap();
        channel.basic_publish(&message("B")).await.unwrap();

        assert_eq!(broker.queue_depth("q"), 1);
        assert_eq!(broker.published_count(), 2);
        assert_eq!(broker.returned_count(), 1);
    }

    #[tokio::test]
    async fn unacked_messages_return_when_the_channel_closes() {
        let broker = MemoryBroker::new();
        let channel = topology(&broker).await;
        channel.basic_publish(&message("A")).await.unwrap();

        let mut deliveries = channel.basic_consume("q", "c").await.unwrap();
        let first = deliveries.next().await.unwrap().unwrap();
        assert!(!first.redelivered);

        channel.close().await.unwrap();
        assert!(deliveries.next().await.is_none());

        let other = broker
            .connect()
            .await
            .unwrap()
            .create_channel()
            .await
            .unwrap();
        let mut deliveries = other.basic_consume("q", "c").await.unwrap();
        let again = deliveries.next().await.unwrap().unwrap();

        assert!(again.redelivered);
        other.basic_ack(again.delivery_tag, false).await.unwrap();
        assert_eq!(broker.queue_depth("q"), 0);
        assert_eq!(broker.ack_count(), 1);
    }

    #[tokio::test]
    async fn injected_faults_surface_as_transport_errors() {
        let broker = MemoryBroker::new();
        let channel = topology(&broker).await;

        broker.fail_next_publishes(1);
        assert!(matches!(
            channel.basic_publish(&message("A")).await,
            Err(TransportError::Socket(_))
        ));
        assert!(channel.basic_publish(&message("A")).await.is_ok());

        broker.fail_next_binds(1);
        let binding = QueueBinding::new("q").exchange("bus").routing_key("B");
        assert!(matches!(
            channel.queue_bind(&binding).await,
            Err(TransportError::Protocol(_))
        ));
        assert!(channel.queue_bind(&binding).await.is_ok());

        broker.fail_next_connects(1);
        assert!(matches!(
            broker.connect().await.err(),
            Some(TransportError::Socket(_))
        ));
        assert!(broker.connect().await.is_ok());

        broker.set_reachable(false);
        assert!(matches!(
            broker.connect().await.err(),
            Some(TransportError::Unreachable(_))
        ));
    }

    #[tokio::test]
    async fn dropping_connections_notifies_and_closes_channels() {
        let broker = MemoryBroker::new();
        let conn = broker.connect().await.unwrap();
        let mut notifications = conn.notifications().unwrap();
        let channel = conn.create_channel().await.unwrap();

        broker.drop_connections();

        assert!(!conn.is_open());
        assert!(!channel.is_open());
        assert_eq!(broker.open_channel_count(), 0);
        assert!(matches!(
            notifications.recv().await,
            Some(ConnectionNotification::Shutdown(_))
        ));
    }

    #[tokio::test]
    async fn redeclaring_with_other_flags_is_rejected() {
        let broker = MemoryBroker::new();
        let channel = topology(&broker).await;

        let result = channel.queue_declare(&QueueDefinition::new("q")).await;

        assert!(matches!(result, Err(TransportError::Protocol(_))));
    }
}
