// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Event Bus over RabbitMQ
//!
//! At-least-once publish/subscribe between services, built on one direct
//! exchange and one durable queue per consuming process. Connection loss is
//! handled transparently: the bus reconnects, rebuilds its consumer channel
//! and re-binds every subscription.
//!
//! ```ignore
//! let handlers = Arc::new(HandlerProvider::new().with_handler(SendInvoice::default()));
//! let bus = EventBus::connect(&EventBusConfigs::from_env()?, handlers).await?;
//!
//! bus.subscribe::<OrderPlaced, SendInvoice>().await?;
//! bus.publish(&OrderPlaced::new(42)).await?;
//! ```

mod consumer;
mod otel;

pub mod amqp;
pub mod channel;
pub mod configs;
pub mod connection;
pub mod dispatcher;
pub mod errors;
pub mod event;
pub mod exchange;
pub mod handler;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod subscriptions;
pub mod transport;

#[cfg(any(test, feature = "test-tools"))]
pub mod test_tools;

pub use configs::{ConnectRetryMode, EventBusConfigs, RabbitMQConfigs};
pub use connection::ConnectionManager;
pub use dispatcher::{ChannelPhase, EventBus};
pub use errors::{EventBusError, TransportError};
pub use event::{Event, EventHandler, EventMetadata};
pub use handler::{HandlerProvider, HandlerType};
pub use subscriptions::{EventType, Subscription, SubscriptionRegistry};
