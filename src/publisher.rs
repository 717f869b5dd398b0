// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Event Publisher
//!
//! Publishing is independent from consumption: every call gets its own
//! scoped channel, declares the bus exchange, and sends the serialized event
//! under the publish retry policy. Trace context is propagated through the
//! message headers.

use crate::{
    channel::ScopedChannel,
    connection::ConnectionManager,
    errors::EventBusError,
    event::Event,
    exchange::ExchangeDefinition,
    otel,
    retry::RetryPolicy,
    transport::{MessageProperties, OutboundMessage, JSON_CONTENT_TYPE},
};
use opentelemetry::Context;
use std::sync::Arc;
use tracing::{debug, error, trace};

/// Sends events to the bus exchange, one scoped channel per call.
pub struct Publisher {
    exchange: String,
    policy: RetryPolicy,
    connection: Arc<ConnectionManager>,
}

impl Publisher {
    /// Creates a publisher for `exchange`.
    ///
    /// # Parameters
    /// * `exchange` - Name of the direct exchange events are published to
    /// * `policy` - Retry policy applied to each `basic.publish`
    /// * `connection` - Connection the scoped channels are opened on
    pub fn new(exchange: &str, policy: RetryPolicy, connection: Arc<ConnectionManager>) -> Self {
        Publisher {
            exchange: exchange.to_owned(),
            policy,
            connection,
        }
    }

    /// Publishes `event` with the event name as routing key.
    ///
    /// Transient failures are retried per policy; once exhausted the last one
    /// is returned as [`EventBusError::TransientBrokerError`].
    ///
    /// # Parameters
    /// * `ctx` - OpenTelemetry context propagated through the message headers
    /// * `event` - The event to serialize and send
    ///
    /// # Returns
    /// Ok(()) once the broker accepted the message, or the EventBusError that stopped it
    pub async fn publish<E: Event>(&self, ctx: &Context, event: &E) -> Result<(), EventBusError> {
        let event_id = event.id().to_string();

        if !self.connection.is_connected() && !self.connection.try_connect().await {
            error!(event_id, "could not publish, the broker is unreachable");
            return Err(EventBusError::TransientBrokerError(
                "broker is unreachable".to_owned(),
            ));
        }

        trace!(event_id, event = E::name(), "creating channel to publish event...");
        let channel = ScopedChannel::open(&self.connection).await?;

        trace!(event_id, "declaring exchange to publish event...");
        let declared = channel
            .exchange_declare(&ExchangeDefinition::new(&self.exchange))
            .await;
        if let Err(err) = declared {
            error!(error = err.to_string(), event_id, "error declaring exchange");
            channel.close().await;
            return Err(EventBusError::DeclareExchangeError(self.exchange.clone()));
        }

        let message = match build_message(ctx, &self.exchange, event) {
            Ok(message) => message,
            Err(err) => {
                channel.close().await;
                return Err(err);
            }
        };

        let result = self
            .policy
            .run("publish event", |attempt| {
                trace!(event_id, attempt, "publishing event...");
                channel.basic_publish(&message)
            })
            .await;

        channel.close().await;

        match result {
            Ok(()) => {
                debug!(event_id, event = E::name(), "event published");
                Ok(())
            }
            Err(err) if err.is_transient() => {
                error!(error = err.to_string(), event_id, "giving up publishing event");
                Err(EventBusError::TransientBrokerError(err.to_string()))
            }
            Err(err) => {
                error!(error = err.to_string(), event_id, "error publishing event");
                Err(EventBusError::PublishingError(err.to_string()))
            }
        }
    }
}

/// Serializes `event` and wraps it with the bus properties.
pub(crate) fn build_message<E: Event>(
    ctx: &Context,
    exchange: &str,
    event: &E,
) -> Result<OutboundMessage, EventBusError> {
    let body = serde_json::to_vec(event).map_err(|err| {
        error!(error = err.to_string(), "error serializing event");
        EventBusError::SerializePayloadError(err.to_string())
    })?;

    let mut properties = MessageProperties {
        content_type: Some(JSON_CONTENT_TYPE.to_owned()),
        kind: Some(E::name().to_owned()),
        message_id: Some(event.id().to_string()),
        persistent: true,
        ..MessageProperties::default()
    };
    otel::inject_context(ctx, &mut properties.headers);

    Ok(OutboundMessage {
        exchange: exchange.to_owned(),
        routing_key: E::name().to_owned(),
        mandatory: true,
        properties,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        errors::TransportError,
        event::EventMetadata,
        transport::{BrokerChannel, BrokerConnection, MockBrokerChannel, MockBrokerConnection, MockTransport},
    };
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct InvoicePaid {
        meta: EventMetadata,
        amount: u64,
    }

    impl Event for InvoicePaid {
        fn metadata(&self) -> &EventMetadata {
            &self.meta
        }
    }

    fn connection_with(channel: MockBrokerChannel) -> Arc<ConnectionManager> {
        let channel: Arc<dyn BrokerChannel> = Arc::new(channel);
        let mut transport = MockTransport::new();

        transport.expect_connect().returning(move || {
            let channel = channel.clone();
            let mut conn = MockBrokerConnection::new();
            conn.expect_is_open().return_const(true);
            conn.expect_endpoint().return_const("broker:5672".to_owned());
            conn.expect_notifications().returning(|| None);
            conn.expect_create_channel()
                .returning(move || Ok(channel.clone()));
            Ok(Arc::new(conn) as Arc<dyn BrokerConnection>)
        });

        ConnectionManager::new(Arc::new(transport), RetryPolicy::exponential(1))
    }

    fn failing_channel(failures: u32, err: TransportError) -> (MockBrokerChannel, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut channel = MockBrokerChannel::new();
        channel.expect_exchange_declare().returning(|_| Ok(()));
        channel.expect_close().times(1).returning(|| Ok(()));
        channel.expect_basic_publish().returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) < failures {
                Err(err.clone())
            } else {
                Ok(())
            }
        });
        (channel, calls)
    }

    fn event() -> InvoicePaid {
        InvoicePaid {
            meta: EventMetadata::new(),
            amount: 42,
        }
    }

    #[test]
    fn message_carries_bus_properties() {
        let event = event();

        let message = build_message(&Context::new(), "bus", &event).unwrap();

        assert_eq!(message.exchange, "bus");
        assert_eq!(message.routing_key, "InvoicePaid");
        assert!(message.mandatory);
        assert!(message.properties.persistent);
        assert_eq!(message.properties.kind.as_deref(), Some("InvoicePaid"));
        assert_eq!(message.properties.content_type.as_deref(), Some(JSON_CONTENT_TYPE));
        assert_eq!(
            message.properties.message_id,
            Some(event.meta.id.to_string())
        );

        let decoded: InvoicePaid = serde_json::from_slice(&message.body).unwrap();
        assert_eq!(decoded, event);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_below_the_limit_are_retried() {
        let (channel, calls) = failing_channel(4, TransportError::Socket("reset".into()));
        let publisher = Publisher::new("bus", RetryPolicy::exponential(5), connection_with(channel));

        publisher.publish(&Context::new(), &event()).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_at_the_limit_surface() {
        let (channel, calls) = failing_channel(5, TransportError::Unreachable("down".into()));
        let publisher = Publisher::new("bus", RetryPolicy::exponential(5), connection_with(channel));

        let err = publisher.publish(&Context::new(), &event()).await.unwrap_err();

        assert!(matches!(err, EventBusError::TransientBrokerError(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failures_are_not_retried() {
        let (channel, calls) = failing_channel(1, TransportError::Protocol("access refused".into()));
        let publisher = Publisher::new("bus", RetryPolicy::exponential(5), connection_with(channel));

        let err = publisher.publish(&Context::new(), &event()).await.unwrap_err();

        assert!(matches!(err, EventBusError::PublishingError(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_broker_fails_before_opening_a_channel() {
        let mut transport = MockTransport::new();
        transport
            .expect_connect()
            .returning(|| Err(TransportError::Unreachable("refused".into())));
        let connection = ConnectionManager::new(Arc::new(transport), RetryPolicy::exponential(2));
        let publisher = Publisher::new("bus", RetryPolicy::exponential(5), connection);

        let err = publisher.publish(&Context::new(), &event()).await.unwrap_err();

        assert!(matches!(err, EventBusError::TransientBrokerError(_)));
    }

    #[tokio::test]
    async fn exchange_declare_failure_releases_the_channel() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_exchange_declare()
            .returning(|_| Err(TransportError::Protocol("precondition failed".into())));
        channel.expect_basic_publish().never();
        channel.expect_close().times(1).returning(|| Ok(()));
        let publisher = Publisher::new("bus", RetryPolicy::exponential(5), connection_with(channel));

        let err = publisher.publish(&Context::new(), &event()).await.unwrap_err();

        assert_eq!(err, EventBusError::DeclareExchangeError("bus".into()));
        assert_eq!(err.to_string(), "failure to declare an exchange `bus`");
    }
}
