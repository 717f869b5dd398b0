// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Transport
//!
//! lapin-backed implementation of the transport traits. Connection and
//! channel errors reported by lapin's `on_error` hooks are forwarded as
//! notifications so the connection manager and the dispatcher can react.

use crate::{
    configs::EventBusConfigs,
    errors::TransportError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    transport::{
        BrokerChannel, BrokerConnection, ChannelNotification, ConnectionNotification,
        DeliveryStream, InboundDelivery, MessageProperties, OutboundMessage, Transport,
    },
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use parking_lot::Mutex;
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tracing::{debug, error};

const PERSISTENT_DELIVERY_MODE: u8 = 2;
const REPLY_SUCCESS: u16 = 200;

/// Opens lapin connections to a RabbitMQ server.
pub struct AmqpTransport {
    uri: String,
    endpoint: String,
    connection_name: String,
}

impl AmqpTransport {
    pub fn new(cfg: &EventBusConfigs) -> AmqpTransport {
        AmqpTransport {
            uri: cfg.rabbitmq.uri(),
            endpoint: cfg.rabbitmq.endpoint(),
            connection_name: cfg.app_name.clone(),
        }
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, TransportError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name.clone()));

        let conn = match Connection::connect(&self.uri, options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(TransportError::from(err))
            }
        }?;
        debug!("amqp connected");

        Ok(Arc::new(AmqpConnection::new(conn, self.endpoint.clone())))
    }
}

struct AmqpConnection {
    inner: Connection,
    endpoint: String,
    notifications: Mutex<Option<UnboundedReceiver<ConnectionNotification>>>,
}

impl AmqpConnection {
    fn new(inner: Connection, endpoint: String) -> AmqpConnection {
        let (tx, rx) = unbounded_channel();

        inner.on_error(move |err| {
            let notification = match err {
                lapin::Error::ProtocolError(e) => {
                    ConnectionNotification::CallbackError(e.to_string())
                }
                other => ConnectionNotification::Shutdown(other.to_string()),
            };
            let _ = tx.send(notification);
        });

        AmqpConnection {
            inner,
            endpoint,
            notifications: Mutex::new(Some(rx)),
        }
    }
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, TransportError> {
        debug!("creating amqp channel...");
        match self.inner.create_channel().await {
            Ok(c) => {
                debug!("channel created");
                Ok(Arc::new(AmqpChannel::new(c)))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(TransportError::from(err))
            }
        }
    }

    fn notifications(&self) -> Option<UnboundedReceiver<ConnectionNotification>> {
        self.notifications.lock().take()
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.is_open() {
            return Ok(());
        }

        self.inner
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(TransportError::from)
    }
}

struct AmqpChannel {
    inner: Channel,
    notifications: Mutex<Option<UnboundedReceiver<ChannelNotification>>>,
}

impl AmqpChannel {
    fn new(inner: Channel) -> AmqpChannel {
        let (tx, rx) = unbounded_channel();

        inner.on_error(move |err| {
            let _ = tx.send(ChannelNotification::CallbackError(err.to_string()));
        });

        AmqpChannel {
            inner,
            notifications: Mutex::new(Some(rx)),
        }
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), TransportError> {
        debug!("declaring exchange: {}", def.name);

        self.inner
            .exchange_declare(
                &def.name,
                def.kind.into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: false,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the exchange"
                );
                TransportError::from(err)
            })
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), TransportError> {
        debug!("declaring queue: {}", def.name);

        match self
            .inner
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: false,
                    auto_delete: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the queue"
                );
                Err(TransportError::from(err))
            }
            _ => Ok(()),
        }
    }

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), TransportError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        self.inner
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                TransportError::from(err)
            })
    }

    async fn queue_unbind(&self, binding: &QueueBinding) -> Result<(), TransportError> {
        debug!(
            "unbinding queue: {} from the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        self.inner
            .queue_unbind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to unbind queue from exchange");
                TransportError::from(err)
            })
    }

    async fn basic_publish(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        match self
            .inner
            .basic_publish(
                &message.exchange,
                &message.routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: message.mandatory,
                },
                &message.body,
                to_amqp_properties(&message.properties),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(TransportError::from(err))
            }
            _ => Ok(()),
        }
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, TransportError> {
        let consumer = match self
            .inner
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(TransportError::from(err))
            }
            Ok(c) => Ok(c),
        }?;

        Ok(consumer
            .map(|result| result.map(from_delivery).map_err(TransportError::from))
            .boxed())
    }

    async fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), TransportError> {
        self.inner
            .basic_ack(delivery_tag, BasicAckOptions { multiple })
            .await
            .map_err(TransportError::from)
    }

    async fn basic_nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), TransportError> {
        self.inner
            .basic_nack(delivery_tag, BasicNackOptions { multiple, requeue })
            .await
            .map_err(TransportError::from)
    }

    fn notifications(&self) -> Option<UnboundedReceiver<ChannelNotification>> {
        self.notifications.lock().take()
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.is_open() {
            return Ok(());
        }

        self.inner
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(TransportError::from)
    }
}

fn to_amqp_properties(props: &MessageProperties) -> BasicProperties {
    let headers: BTreeMap<ShortString, AMQPValue> = props
        .headers
        .iter()
        .map(|(key, value)| {
            (
                ShortString::from(key.clone()),
                AMQPValue::LongString(LongString::from(value.clone())),
            )
        })
        .collect();

    let mut amqp = BasicProperties::default().with_headers(FieldTable::from(headers));

    if let Some(content_type) = &props.content_type {
        amqp = amqp.with_content_type(ShortString::from(content_type.clone()));
    }

    if let Some(kind) = &props.kind {
        amqp = amqp.with_type(ShortString::from(kind.clone()));
    }

    if let Some(message_id) = &props.message_id {
        amqp = amqp.with_message_id(ShortString::from(message_id.clone()));
    }

    if props.persistent {
        amqp = amqp.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
    }

    amqp
}

fn from_amqp_properties(props: &AMQPProperties) -> MessageProperties {
    let headers = match props.headers() {
        Some(table) => table
            .inner()
            .iter()
            .filter_map(|(key, value)| {
                let value = match value {
                    AMQPValue::LongString(v) => String::from_utf8_lossy(v.as_bytes()).into_owned(),
                    AMQPValue::ShortString(v) => v.to_string(),
                    _ => return None,
                };
                Some((key.to_string(), value))
            })
            .collect(),
        None => BTreeMap::default(),
    };

    MessageProperties {
        content_type: props.content_type().as_ref().map(|v| v.to_string()),
        kind: props.kind().as_ref().map(|v| v.to_string()),
        message_id: props.message_id().as_ref().map(|v| v.to_string()),
        persistent: *props.delivery_mode() == Some(PERSISTENT_DELIVERY_MODE),
        headers,
    }
}

fn from_delivery(delivery: Delivery) -> InboundDelivery {
    InboundDelivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.to_string(),
        routing_key: delivery.routing_key.to_string(),
        redelivered: delivery.redelivered,
        properties: from_amqp_properties(&delivery.properties),
        body: delivery.data,
    }
}
