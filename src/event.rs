// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Events and Event Handlers
//!
//! An event is something that already happened and that other components may
//! react to. Concrete events are plain serde structs that embed an
//! [`EventMetadata`] and implement [`Event`]; handlers implement
//! [`EventHandler`] for the events they care about.

use crate::errors::EventBusError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

/// Identity shared by every event: a unique id and the creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl EventMetadata {
    pub fn new() -> EventMetadata {
        EventMetadata {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
        }
    }
}

impl Default for EventMetadata {
    fn default() -> Self {
        Self::new()
    }
}

/// An application event that can travel through the bus.
///
/// The event name doubles as the routing key, so two event types must never
/// share a name on the same exchange.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct OrderPlaced {
///     #[serde(flatten)]
///     meta: EventMetadata,
///     order_id: u64,
/// }
///
/// impl Event for OrderPlaced {
///     fn metadata(&self) -> &EventMetadata {
///         &self.meta
///     }
/// }
/// ```
pub trait Event: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Routing name of the event. Defaults to the short type name; override
    /// it for generic event types.
    fn name() -> &'static str {
        short_type_name::<Self>()
    }

    fn metadata(&self) -> &EventMetadata;

    fn id(&self) -> Uuid {
        self.metadata().id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.metadata().created_at
    }
}

/// Processes one kind of event. Returning an error requeues the message.
#[async_trait]
pub trait EventHandler<E: Event>: Send + Sync + 'static {
    async fn handle(&self, event: &E) -> Result<(), EventBusError>;
}

/// Last path segment of a type name, e.g. `OrderPlaced` for `shop::events::OrderPlaced`.
pub(crate) fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}
