// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Subscription Registry
//!
//! The in-memory source of truth for "who listens to what". For each event
//! name it keeps the ordered list of subscribed handler types and the
//! [`EventType`] needed to decode inbound payloads. The registry is read by
//! the delivery path and written by subscribe/unsubscribe, all under one lock.
//!
//! Removing the last handler of an event broadcasts the event name on the
//! last-handler-removed channel; the bus reacts by unbinding the routing key.

use crate::{
    errors::EventBusError,
    event::{Event, EventHandler},
    handler::{HandlerInvoker, HandlerType, TypedInvoker},
};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::{
    any::{Any, TypeId},
    fmt,
    sync::Arc,
};
use tokio::sync::broadcast;
use tracing::debug;

type Decoder = fn(&[u8]) -> Result<Arc<dyn Any + Send + Sync>, serde_json::Error>;

/// Payload shape registered for an event name.
#[derive(Clone, Copy)]
pub struct EventType {
    name: &'static str,
    type_name: &'static str,
    id: TypeId,
    decoder: Decoder,
}

impl EventType {
    /// Describes the event type `E`.
    ///
    /// # Returns
    /// The descriptor holding the routing name of `E` and its JSON decoder
    pub fn of<E: Event>() -> EventType {
        EventType {
            name: E::name(),
            type_name: std::any::type_name::<E>(),
            id: TypeId::of::<E>(),
            decoder: decode::<E>,
        }
    }

    /// Routing name, used as the routing key.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Fully qualified Rust type name.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn is<E: Event>(&self) -> bool {
        self.id == TypeId::of::<E>()
    }

    /// Decodes a JSON body into the registered event type.
    pub fn decode(&self, body: &[u8]) -> Result<Arc<dyn Any + Send + Sync>, EventBusError> {
        (self.decoder)(body).map_err(|err| EventBusError::ParsePayloadError(err.to_string()))
    }
}

impl PartialEq for EventType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl fmt::Debug for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

fn decode<E: Event>(body: &[u8]) -> Result<Arc<dyn Any + Send + Sync>, serde_json::Error> {
    let event: E = serde_json::from_slice(body)?;
    Ok(Arc::new(event))
}

/// One (event, handler type) pair, carrying everything needed to dispatch
/// to it and to replay it after a reconnect.
#[derive(Clone)]
pub struct Subscription {
    event_type: EventType,
    handler_type: HandlerType,
    invoker: Arc<dyn HandlerInvoker>,
}

impl Subscription {
    /// Subscription of handler type `H` to event type `E`.
    pub fn new<E, H>() -> Subscription
    where
        E: Event,
        H: EventHandler<E>,
    {
        Subscription {
            event_type: EventType::of::<E>(),
            handler_type: HandlerType::of::<H>(),
            invoker: Arc::new(TypedInvoker::<E, H>::new()),
        }
    }

    pub fn event_name(&self) -> &'static str {
        self.event_type.name()
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    pub fn handler_type(&self) -> HandlerType {
        self.handler_type
    }

    pub(crate) fn invoker(&self) -> &dyn HandlerInvoker {
        self.invoker.as_ref()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("event", &self.event_type)
            .field("handler", &self.handler_type)
            .finish()
    }
}

#[derive(Default)]
struct Inner {
    handlers: IndexMap<String, Vec<Subscription>>,
    event_types: IndexMap<String, EventType>,
}

impl Inner {
    fn admits(&self, subscription: &Subscription) -> Result<(), EventBusError> {
        let name = subscription.event_name();

        if let Some(registered) = self.event_types.get(name) {
            if *registered != subscription.event_type {
                return Err(EventBusError::EventNameConflict {
                    event: name.to_owned(),
                    registered: registered.type_name().to_owned(),
                    rejected: subscription.event_type.type_name().to_owned(),
                });
            }
        }

        if self
            .handlers
            .get(name)
            .is_some_and(|subs| subs.iter().any(|s| s.handler_type == subscription.handler_type))
        {
            return Err(EventBusError::DuplicateSubscription {
                event: name.to_owned(),
                handler: subscription.handler_type.name().to_owned(),
            });
        }

        Ok(())
    }
}

/// Event name to subscribed handlers, in registration order.
pub struct SubscriptionRegistry {
    inner: Mutex<Inner>,
    last_handler_removed: broadcast::Sender<String>,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionRegistry {
    pub fn new() -> SubscriptionRegistry {
        let (last_handler_removed, _) = broadcast::channel(64);

        SubscriptionRegistry {
            inner: Mutex::new(Inner::default()),
            last_handler_removed,
        }
    }

    /// Receives the name of every event that just lost its last handler.
    pub fn on_last_handler_removed(&self) -> broadcast::Receiver<String> {
        self.last_handler_removed.subscribe()
    }

    /// Records a subscription.
    ///
    /// # Parameters
    /// * `subscription` - The (event, handler type) pair to add
    ///
    /// # Returns
    /// `DuplicateSubscription` if the handler type already listens to the
    /// event, `EventNameConflict` if another event type owns the event name
    pub fn add_subscription(&self, subscription: Subscription) -> Result<(), EventBusError> {
        let mut inner = self.inner.lock();
        let name = subscription.event_name();

        inner.admits(&subscription)?;

        inner
            .event_types
            .entry(name.to_owned())
            .or_insert(subscription.event_type);
        inner
            .handlers
            .entry(name.to_owned())
            .or_default()
            .push(subscription);

        debug!(event = name, "subscription added");
        Ok(())
    }

    /// Removes a subscription if present; returns whether something was removed.
    pub fn remove_subscription(&self, event_name: &str, handler_type: &HandlerType) -> bool {
        let bucket_emptied = {
            let mut inner = self.inner.lock();

            let Some(subs) = inner.handlers.get_mut(event_name) else {
                return false;
            };

            let Some(position) = subs.iter().position(|s| &s.handler_type == handler_type) else {
                return false;
            };

            subs.remove(position);
            if subs.is_empty() {
                inner.handlers.shift_remove(event_name);
                inner.event_types.shift_remove(event_name);
                true
            } else {
                false
            }
        };

        debug!(event = event_name, handler = handler_type.name(), "subscription removed");

        if bucket_emptied {
            let _ = self.last_handler_removed.send(event_name.to_owned());
        }

        true
    }

    /// Checks, without recording it, whether `subscription` would be accepted.
    pub fn admits(&self, subscription: &Subscription) -> Result<(), EventBusError> {
        self.inner.lock().admits(subscription)
    }

    pub fn contains(&self, event_name: &str, handler_type: &HandlerType) -> bool {
        self.inner
            .lock()
            .handlers
            .get(event_name)
            .is_some_and(|subs| subs.iter().any(|s| &s.handler_type == handler_type))
    }

    pub fn has_subscriptions_for_event(&self, event_name: &str) -> bool {
        self.inner.lock().handlers.contains_key(event_name)
    }

    /// Handlers for the event in registration order; empty when none.
    pub fn get_handlers_for_event(&self, event_name: &str) -> Vec<Subscription> {
        self.inner
            .lock()
            .handlers
            .get(event_name)
            .cloned()
            .unwrap_or_default()
    }

    /// Payload shape registered for the event; None when nobody listens to it.
    pub fn get_event_type_by_name(&self, event_name: &str) -> Option<EventType> {
        self.inner.lock().event_types.get(event_name).copied()
    }

    /// Event type and handlers read under a single lock acquisition.
    pub fn lookup(&self, event_name: &str) -> Option<(EventType, Vec<Subscription>)> {
        let inner = self.inner.lock();
        let event_type = inner.event_types.get(event_name).copied()?;
        let handlers = inner.handlers.get(event_name).cloned().unwrap_or_default();
        Some((event_type, handlers))
    }

    /// Every subscription, grouped by event in first-subscribed order.
    pub fn snapshot(&self) -> Vec<Subscription> {
        self.inner
            .lock()
            .handlers
            .values()
            .flat_map(|subs| subs.iter().cloned())
            .collect()
    }

    /// Drops every subscription without raising last-handler-removed.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.handlers.clear();
        inner.event_types.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().handlers.is_empty()
    }
}
