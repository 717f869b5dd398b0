// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transport
//!
//! The bus talks to the broker through three traits: a [`Transport`] opens
//! connections, a [`BrokerConnection`] multiplexes channels, and a
//! [`BrokerChannel`] carries the AMQP operations the bus needs. The lapin
//! implementation lives in `amqp`; tests use the in-memory broker.
//!
//! Broker-initiated events (connection shutdown, blocked connection, channel
//! errors) are delivered as notification values on a receiver that can be
//! taken once per handle.

use crate::{
    errors::TransportError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::mpsc::UnboundedReceiver;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Properties carried next to a message body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub kind: Option<String>,
    pub message_id: Option<String>,
    pub persistent: bool,
    pub headers: BTreeMap<String, String>,
}

/// A message ready to be published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub exchange: String,
    pub routing_key: String,
    /// Ask the broker to report the message back when no queue is bound
    pub mandatory: bool,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

/// A message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundDelivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

/// Stream of deliveries for one consumer; ends when the channel closes.
pub type DeliveryStream = BoxStream<'static, Result<InboundDelivery, TransportError>>;

/// Broker-initiated events concerning a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionNotification {
    Shutdown(String),
    Blocked(String),
    CallbackError(String),
}

/// Broker-initiated events concerning a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelNotification {
    CallbackError(String),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, TransportError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    fn is_open(&self) -> bool;

    /// Host and port, for logging.
    fn endpoint(&self) -> String;

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, TransportError>;

    /// Takes the notification receiver; `None` once taken.
    fn notifications(&self) -> Option<UnboundedReceiver<ConnectionNotification>>;

    async fn close(&self) -> Result<(), TransportError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn is_open(&self) -> bool;

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), TransportError>;

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), TransportError>;

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), TransportError>;

    async fn queue_unbind(&self, binding: &QueueBinding) -> Result<(), TransportError>;

    async fn basic_publish(&self, message: &OutboundMessage) -> Result<(), TransportError>;

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, TransportError>;

    async fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), TransportError>;

    async fn basic_nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), TransportError>;

    /// Takes the notification receiver; `None` once taken.
    fn notifications(&self) -> Option<UnboundedReceiver<ChannelNotification>>;

    async fn close(&self) -> Result<(), TransportError>;
}
