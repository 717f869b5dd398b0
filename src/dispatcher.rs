// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Event Bus
//!
//! [`EventBus`] exposes publish, subscribe and unsubscribe over one direct
//! exchange and one shared durable queue per process. It owns the long-lived
//! consumer channel, which moves through [`ChannelPhase`]:
//!
//! ```text
//! Unbound --open + declare--> QueueBound --basic.consume--> Consuming
//!    ^                                                          |
//!    +------------- channel lost / last subscription gone ------+
//! ```
//!
//! Every operation that replaces the consumer channel (subscribe, recovery
//! after a reconnect, recreation after a channel error, teardown after the
//! last unsubscribe) runs under one async lock.
//!
//! After the connection manager reconnects following a failure, the bus
//! replays its whole registry through the subscribe path, rebinding every
//! routing key before consumption restarts. A channel-level error only
//! recreates the channel. Queue bindings are removed lazily, when the registry
//! reports that an event lost its last handler.

use crate::{
    amqp::AmqpTransport,
    channel::ScopedChannel,
    configs::EventBusConfigs,
    connection::ConnectionManager,
    consumer::consume,
    errors::EventBusError,
    event::{Event, EventHandler},
    exchange::ExchangeDefinition,
    handler::{HandlerProvider, HandlerType},
    publisher::Publisher,
    queue::{QueueBinding, QueueDefinition},
    subscriptions::{Subscription, SubscriptionRegistry},
    transport::{BrokerChannel, ChannelNotification, Transport},
};
use futures_util::{future::BoxFuture, StreamExt};
use opentelemetry::{global, Context};
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};
use tokio::{
    sync::{broadcast::error::RecvError, mpsc::UnboundedReceiver, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Lifecycle of the shared consumer channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelPhase {
    /// No consumer channel
    Unbound,
    /// Channel open, exchange and queue declared
    QueueBound,
    /// Deliveries flowing to the handlers
    Consuming,
}

struct ConsumerChannel {
    channel: Option<Arc<dyn BrokerChannel>>,
    phase: ChannelPhase,
    generation: u64,
    task: Option<JoinHandle<()>>,
    /// Routing keys bound to the queue since the last recovery
    bound: HashSet<String>,
    /// Set while the last recovery left work undone
    stale: bool,
    retry_scheduled: bool,
}

impl ConsumerChannel {
    fn unbound() -> ConsumerChannel {
        ConsumerChannel {
            channel: None,
            phase: ChannelPhase::Unbound,
            generation: 0,
            task: None,
            bound: HashSet::new(),
            stale: false,
            retry_scheduled: false,
        }
    }

    /// Stops consumption and hands back the channel for closing.
    fn reset(&mut self) -> Option<Arc<dyn BrokerChannel>> {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.phase = ChannelPhase::Unbound;
        self.generation += 1;
        self.channel.take()
    }
}

/// At-least-once event bus over one RabbitMQ exchange and queue.
///
/// Always handled through an `Arc`; background tasks hold weak references
/// and stop once the bus is dropped or disposed.
pub struct EventBus {
    app_name: String,
    exchange: String,
    queue: String,
    redelivery_delay: Duration,
    recovery_retry_interval: Duration,
    connection: Arc<ConnectionManager>,
    registry: Arc<SubscriptionRegistry>,
    handlers: Arc<HandlerProvider>,
    publisher: Publisher,
    consumer: Mutex<ConsumerChannel>,
    listener: parking_lot::Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
    me: Weak<EventBus>,
}

impl EventBus {
    /// Connects to RabbitMQ with the given configuration.
    ///
    /// A failed first connect is logged only; the bus retries on the next
    /// call. Under [`crate::configs::ConnectRetryMode::Forever`] this waits
    /// for the broker instead.
    ///
    /// # Parameters
    /// * `configs` - Broker identity, exchange, queue and retry settings
    /// * `handlers` - Provider the handler instances are resolved from
    ///
    /// # Returns
    /// The running bus, or `ConfigurationError` for an invalid configuration
    pub async fn connect(
        configs: &EventBusConfigs,
        handlers: Arc<HandlerProvider>,
    ) -> Result<Arc<EventBus>, EventBusError> {
        EventBus::with_transport(configs, Arc::new(AmqpTransport::new(configs)), handlers).await
    }

    /// Like [`EventBus::connect`], over any transport.
    pub async fn with_transport(
        configs: &EventBusConfigs,
        transport: Arc<dyn Transport>,
        handlers: Arc<HandlerProvider>,
    ) -> Result<Arc<EventBus>, EventBusError> {
        configs.validate()?;

        let connection = ConnectionManager::new(transport, configs.connect_policy());
        if !connection.try_connect().await {
            warn!("broker unreachable at startup, connecting again on first use");
        }

        EventBus::new(
            configs,
            connection,
            Arc::new(SubscriptionRegistry::new()),
            handlers,
        )
    }

    /// Builds a bus over existing parts. Must be called inside a tokio runtime.
    ///
    /// # Parameters
    /// * `configs` - Exchange, queue and retry settings
    /// * `connection` - Manager of the broker connection, connected or not
    /// * `registry` - Registry the subscriptions are recorded in
    /// * `handlers` - Provider the handler instances are resolved from
    pub fn new(
        configs: &EventBusConfigs,
        connection: Arc<ConnectionManager>,
        registry: Arc<SubscriptionRegistry>,
        handlers: Arc<HandlerProvider>,
    ) -> Result<Arc<EventBus>, EventBusError> {
        configs.validate()?;

        let bus = Arc::new_cyclic(|me| EventBus {
            app_name: configs.app_name.clone(),
            exchange: configs.exchange.clone(),
            queue: configs.queue.clone(),
            redelivery_delay: configs.redelivery_delay,
            recovery_retry_interval: configs.recovery_retry_interval,
            publisher: Publisher::new(&configs.exchange, configs.publish_policy(), connection.clone()),
            connection,
            registry,
            handlers,
            consumer: Mutex::new(ConsumerChannel::unbound()),
            listener: parking_lot::Mutex::new(None),
            disposed: AtomicBool::new(false),
            me: me.clone(),
        });

        *bus.listener.lock() = Some(tokio::spawn(bus.listen()));

        Ok(bus)
    }

    /// Subscriptions currently known to the bus.
    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    /// Current phase of the shared consumer channel.
    pub async fn consumer_phase(&self) -> ChannelPhase {
        self.consumer.lock().await.phase
    }

    /// Publishes `event` to every queue subscribed to its name.
    ///
    /// # Parameters
    /// * `event` - The event to send; its name is the routing key
    ///
    /// # Returns
    /// Ok(()) once published, `TransientBrokerError` when retries ran out,
    /// `NotConnected` after disposal
    pub async fn publish<E: Event>(&self, event: &E) -> Result<(), EventBusError> {
        if self.is_disposed() {
            return Err(EventBusError::NotConnected);
        }

        self.publisher.publish(&Context::current(), event).await
    }

    /// Delivers events of type `E` to the `H` instance resolved per delivery.
    ///
    /// Binds the queue for `E` on its first subscription and starts the
    /// consumer when it is not running yet.
    ///
    /// # Returns
    /// Ok(()) once subscribed; `DuplicateSubscription` when `H` already
    /// listens to `E`, `EventNameConflict` when another type owns the name of
    /// `E`, or the broker error that prevented binding
    pub async fn subscribe<E, H>(&self) -> Result<(), EventBusError>
    where
        E: Event,
        H: EventHandler<E>,
    {
        if self.is_disposed() {
            return Err(EventBusError::NotConnected);
        }

        let subscription = Subscription::new::<E, H>();
        let event = subscription.event_name();
        let handler = subscription.handler_type().name();
        info!(event, handler, "subscribing to event...");

        let mut consumer = self.consumer.lock().await;
        self.subscribe_locked(&mut consumer, subscription).await?;
        self.start_consuming(&mut consumer).await?;

        info!(event, handler, "subscribed to event");
        Ok(())
    }

    /// Stops delivering `E` to `H`. The routing key is unbound in the
    /// background once no handler is left for `E`.
    ///
    /// Waits for any subscribe or recovery in progress, so a replay cannot
    /// bring the pair back afterwards.
    pub async fn unsubscribe<E, H>(&self)
    where
        E: Event,
        H: EventHandler<E>,
    {
        let handler = HandlerType::of::<H>();
        info!(event = E::name(), handler = handler.name(), "unsubscribing from event...");

        let _consumer = self.consumer.lock().await;
        if self.registry.remove_subscription(E::name(), &handler) {
            info!(event = E::name(), handler = handler.name(), "unsubscribed from event");
        } else {
            debug!(event = E::name(), handler = handler.name(), "no such subscription");
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Closes the consumer channel and the connection; the bus is unusable afterwards.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        let listener = self.listener.lock().take();
        if let Some(listener) = listener {
            listener.abort();
        }

        let channel = self.consumer.lock().await.reset();
        if let Some(channel) = channel {
            close_quietly(channel.as_ref()).await;
        }

        self.connection.dispose().await;
        info!("event bus disposed");
    }

    async fn subscribe_locked(
        &self,
        consumer: &mut ConsumerChannel,
        subscription: Subscription,
    ) -> Result<(), EventBusError> {
        let event = subscription.event_name();
        self.registry.admits(&subscription)?;

        if !consumer.channel.as_ref().is_some_and(|c| c.is_open()) {
            self.open_consumer_channel(consumer).await?;
        }

        if !consumer.bound.contains(event) {
            self.bind(event).await?;
            consumer.bound.insert(event.to_owned());
        }

        self.registry.add_subscription(subscription)
    }

    /// Replaces the consumer channel with a fresh one and declares the topology.
    async fn open_consumer_channel(
        &self,
        consumer: &mut ConsumerChannel,
    ) -> Result<(), EventBusError> {
        if let Some(stale) = consumer.reset() {
            close_quietly(stale.as_ref()).await;
        }

        if !self.connection.is_connected() {
            self.connection.try_connect().await;
        }

        debug!("creating consumer channel...");
        let channel = self.connection.create_channel().await?;

        if let Err(err) = channel
            .exchange_declare(&ExchangeDefinition::new(&self.exchange))
            .await
        {
            error!(error = err.to_string(), "error declaring the bus exchange");
            close_quietly(channel.as_ref()).await;
            return Err(EventBusError::DeclareExchangeError(self.exchange.clone()));
        }

        if let Err(err) = channel
            .queue_declare(&QueueDefinition::new(&self.queue).durable())
            .await
        {
            error!(error = err.to_string(), "error declaring the consumer queue");
            close_quietly(channel.as_ref()).await;
            return Err(EventBusError::DeclareQueueError(self.queue.clone()));
        }

        if let Some(notifications) = channel.notifications() {
            tokio::spawn(self.watch_channel(notifications, consumer.generation));
        }

        consumer.channel = Some(channel);
        consumer.phase = ChannelPhase::QueueBound;
        debug!("created consumer channel");

        Ok(())
    }

    async fn start_consuming(&self, consumer: &mut ConsumerChannel) -> Result<(), EventBusError> {
        if consumer.phase == ChannelPhase::Consuming {
            return Ok(());
        }

        let Some(channel) = consumer.channel.clone() else {
            error!("could not start consuming because the consumer channel is missing");
            return Err(EventBusError::NotConnected);
        };

        debug!("starting basic consume...");
        let consumer_tag = format!("{}-{}", self.app_name, Uuid::new_v4());
        let mut deliveries = channel
            .basic_consume(&self.queue, &consumer_tag)
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                EventBusError::ConsumerDeclarationError(err.to_string())
            })?;

        let registry = self.registry.clone();
        let handlers = self.handlers.clone();
        let delay = self.redelivery_delay;

        consumer.task = Some(tokio::spawn(async move {
            while let Some(result) = deliveries.next().await {
                match result {
                    Ok(delivery) => {
                        let registry = registry.clone();
                        let handlers = handlers.clone();
                        let channel = channel.clone();

                        tokio::spawn(async move {
                            if let Err(err) = consume(
                                &global::tracer("eventbus consumer"),
                                &delivery,
                                &registry,
                                &handlers,
                                channel.as_ref(),
                                delay,
                            )
                            .await
                            {
                                error!(error = err.to_string(), "error consume msg");
                            }
                        });
                    }
                    Err(err) => error!(error = err.to_string(), "errors consume msg"),
                }
            }
            debug!("consumer stream ended");
        }));
        consumer.phase = ChannelPhase::Consuming;
        debug!("started basic consume");

        Ok(())
    }

    async fn bind(&self, event: &str) -> Result<(), EventBusError> {
        let channel = ScopedChannel::open(&self.connection).await?;
        let binding = QueueBinding::new(&self.queue)
            .exchange(&self.exchange)
            .routing_key(event);

        let result = channel.queue_bind(&binding).await;
        channel.close().await;

        result.map_err(|err| {
            error!(error = err.to_string(), event, "error to bind queue to exchange");
            EventBusError::BindingExchangeToQueueError(self.queue.clone(), self.exchange.clone())
        })
    }

    async fn unbind(&self, event: &str) -> Result<(), EventBusError> {
        let channel = ScopedChannel::open(&self.connection).await?;
        let binding = QueueBinding::new(&self.queue)
            .exchange(&self.exchange)
            .routing_key(event);

        let result = channel.queue_unbind(&binding).await;
        channel.close().await;

        result.map_err(|err| {
            error!(error = err.to_string(), event, "error to unbind queue from exchange");
            EventBusError::UnbindingExchangeToQueueError(self.queue.clone(), self.exchange.clone())
        })
    }

    /// Rebuilds the consumer channel and replays every subscription.
    async fn recover(&self) {
        if self.is_disposed() {
            return;
        }

        let mut consumer = self.consumer.lock().await;
        self.recover_locked(&mut consumer).await;
    }

    async fn recover_locked(&self, consumer: &mut ConsumerChannel) {
        if consumer.channel.is_none() && self.registry.is_empty() {
            debug!("nothing to recover after reconnect");
            consumer.stale = false;
            return;
        }

        info!("connection restored, re-creating subscriptions...");
        consumer.bound.clear();

        if let Err(err) = self.open_consumer_channel(consumer).await {
            error!(error = err.to_string(), "could not recreate the consumer channel");
            self.retry_recovery_later(consumer);
            return;
        }

        let subscriptions = self.registry.snapshot();
        self.registry.clear();
        let mut complete = true;

        for subscription in subscriptions {
            let event = subscription.event_name();
            let handler = subscription.handler_type().name();

            if let Err(err) = self.subscribe_locked(consumer, subscription.clone()).await {
                error!(error = err.to_string(), event, handler, "could not re-subscribe");
                complete = false;
                // unbound until the next subscribe for the event or the retry
                let _ = self.registry.add_subscription(subscription);
            }
        }

        if !self.registry.is_empty() {
            if let Err(err) = self.start_consuming(consumer).await {
                error!(error = err.to_string(), "could not restart consuming");
                complete = false;
            }
        }

        if complete {
            consumer.stale = false;
            info!("subscriptions re-created");
        } else {
            self.retry_recovery_later(consumer);
        }
    }

    /// Schedules another recovery while the connection is up; otherwise the
    /// next reconnect triggers it.
    fn retry_recovery_later(&self, consumer: &mut ConsumerChannel) {
        consumer.stale = true;

        if consumer.retry_scheduled || self.is_disposed() || !self.connection.is_connected() {
            return;
        }

        warn!(
            "subscriptions partially recovered, trying again in {:.1} seconds",
            self.recovery_retry_interval.as_secs_f64()
        );
        consumer.retry_scheduled = true;
        tokio::spawn(self.recover_later());
    }

    fn recover_later(&self) -> BoxFuture<'static, ()> {
        let me = self.me.clone();
        let interval = self.recovery_retry_interval;

        Box::pin(async move {
            tokio::time::sleep(interval).await;

            let Some(bus) = me.upgrade() else { return };
            let mut consumer = bus.consumer.lock().await;
            consumer.retry_scheduled = false;

            if bus.is_disposed() || !consumer.stale {
                return;
            }

            bus.recover_locked(&mut consumer).await;
        })
    }

    /// Recreates the consumer channel after a channel-level error.
    async fn on_channel_error(&self, reason: String, generation: u64) {
        let mut consumer = self.consumer.lock().await;

        if self.is_disposed() || consumer.generation != generation {
            debug!(reason, "ignoring error from a replaced consumer channel");
            return;
        }

        if !self.connection.is_connected() {
            info!(reason, "consumer channel lost with the connection, waiting for recovery");
            consumer.reset();
            return;
        }

        warn!(reason, "recreating consumer channel...");
        if let Err(err) = self.open_consumer_channel(&mut consumer).await {
            error!(error = err.to_string(), "could not recreate the consumer channel");
            self.retry_recovery_later(&mut consumer);
            return;
        }

        if self.registry.is_empty() {
            return;
        }

        if let Err(err) = self.start_consuming(&mut consumer).await {
            error!(error = err.to_string(), "could not restart consuming");
            self.retry_recovery_later(&mut consumer);
        }
    }

    /// Unbinds an event nobody listens to anymore; closes the consumer when none is left.
    async fn on_last_handler_removed(&self, event: &str) {
        let mut consumer = self.consumer.lock().await;

        if self.is_disposed() || self.registry.has_subscriptions_for_event(event) {
            return;
        }

        if let Err(err) = self.unbind(event).await {
            warn!(error = err.to_string(), event, "could not unbind event");
        }
        consumer.bound.remove(event);

        if self.registry.is_empty() {
            debug!("no subscription left, closing the consumer channel");
            if let Some(channel) = consumer.reset() {
                close_quietly(channel.as_ref()).await;
            }
        }
    }

    fn listen(&self) -> BoxFuture<'static, ()> {
        let me = self.me.clone();
        let mut reconnected = self.connection.on_reconnected_after_failure();
        let mut removed = self.registry.on_last_handler_removed();

        Box::pin(async move {
            loop {
                tokio::select! {
                    signal = reconnected.recv() => match signal {
                        Ok(()) | Err(RecvError::Lagged(_)) => {
                            let Some(bus) = me.upgrade() else { return };
                            bus.recover().await;
                        }
                        Err(RecvError::Closed) => return,
                    },
                    signal = removed.recv() => match signal {
                        Ok(event) => {
                            let Some(bus) = me.upgrade() else { return };
                            bus.on_last_handler_removed(&event).await;
                        }
                        Err(RecvError::Lagged(missed)) => {
                            warn!(missed, "missed last-handler-removed signals, bindings may linger");
                        }
                        Err(RecvError::Closed) => return,
                    },
                }
            }
        })
    }

    fn watch_channel(
        &self,
        mut notifications: UnboundedReceiver<ChannelNotification>,
        generation: u64,
    ) -> BoxFuture<'static, ()> {
        let me = self.me.clone();

        Box::pin(async move {
            let Some(ChannelNotification::CallbackError(reason)) = notifications.recv().await else {
                return;
            };

            if let Some(bus) = me.upgrade() {
                bus.on_channel_error(reason, generation).await;
            }
        })
    }
}

async fn close_quietly(channel: &dyn BrokerChannel) {
    if let Err(err) = channel.close().await {
        warn!(error = err.to_string(), "failure to close consumer channel");
    }
}
