// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Inbound Delivery Processing
//!
//! Every delivery taken from the shared queue goes through [`consume`]:
//!
//! 1. resolve the event name from the routing key
//! 2. ack and drop the message when nobody listens to that event
//! 3. decode the payload into the registered event type
//! 4. run every subscribed handler in registration order
//! 5. ack on success; otherwise wait the redelivery delay and nack with requeue
//!
//! Handlers are always awaited before the ack/nack decision is made.

use crate::{
    errors::EventBusError,
    handler::{HandlerProvider, Invocation},
    otel,
    subscriptions::{Subscription, SubscriptionRegistry},
    transport::{BrokerChannel, InboundDelivery},
};
use opentelemetry::{
    context::FutureExt,
    global::{BoxedSpan, BoxedTracer},
    trace::{Span, Status},
};
use std::{any::Any, borrow::Cow, sync::Arc, time::Duration};
use tracing::{debug, error, trace, warn};

/// Processes one delivery and settles it on `channel`.
///
/// Handlers run under the trace context extracted from the message headers.
/// Only a failed ack is returned as an error; a failed nack is logged and
/// left to the broker, which redelivers unsettled messages once the channel
/// goes away.
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    delivery: &InboundDelivery,
    registry: &SubscriptionRegistry,
    handlers: &HandlerProvider,
    channel: &dyn BrokerChannel,
    redelivery_delay: Duration,
) -> Result<(), EventBusError> {
    let event_name = delivery.routing_key.as_str();
    let (ctx, mut span) = otel::new_span(&delivery.properties, tracer, event_name);

    debug!(
        event = event_name,
        exchange = delivery.exchange.as_str(),
        redelivered = delivery.redelivered,
        "received event"
    );

    let Some((event_type, subscriptions)) = registry.lookup(event_name) else {
        let msg = "removing message from queue - reason: no subscription for event";
        debug!(event = event_name, "{}", msg);
        span.set_status(Status::Error {
            description: Cow::from(msg),
        });

        return ack(channel, delivery, &mut span).await;
    };

    let result = match event_type.decode(&delivery.body) {
        Ok(event) => {
            process(event_name, &subscriptions, handlers, event)
                .with_context(ctx)
                .await
        }
        Err(err) => {
            error!(error = err.to_string(), event = event_name, "error decoding event");
            Err(err)
        }
    };

    match result {
        Ok(()) => {
            debug!(event = event_name, "event successfully processed");
            ack(channel, delivery, &mut span).await
        }
        Err(err) => {
            warn!(
                error = err.to_string(),
                event = event_name,
                "error processing event, requeuing for later"
            );
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("error processing event"),
            });

            if let Err(err) = requeue(channel, delivery, redelivery_delay, &mut span).await {
                warn!(
                    error = err.to_string(),
                    event = event_name,
                    "leaving message unsettled until the broker redelivers it"
                );
            }
            Ok(())
        }
    }
}

async fn process(
    event_name: &str,
    subscriptions: &[Subscription],
    handlers: &HandlerProvider,
    event: Arc<dyn Any + Send + Sync>,
) -> Result<(), EventBusError> {
    trace!(event = event_name, "processing event...");

    for subscription in subscriptions {
        let handler = subscription.handler_type();

        match subscription.invoker().invoke(handlers, event.as_ref()).await {
            Ok(Invocation::Handled) => {
                trace!(event = event_name, handler = handler.name(), "handler done")
            }
            Ok(Invocation::Unresolved) => warn!(
                event = event_name,
                handler = handler.name(),
                "there is no handler instance for the event, skipping"
            ),
            Err(err) => {
                return Err(match err {
                    EventBusError::HandlerExecutionError(_) => err,
                    other => EventBusError::HandlerExecutionError(format!(
                        "{}: {}",
                        handler.name(),
                        other
                    )),
                });
            }
        }
    }

    Ok(())
}

async fn ack(
    channel: &dyn BrokerChannel,
    delivery: &InboundDelivery,
    span: &mut BoxedSpan,
) -> Result<(), EventBusError> {
    match channel.basic_ack(delivery.delivery_tag, false).await {
        Err(err) => {
            error!(error = err.to_string(), "error whiling ack msg");
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("error to ack msg"),
            });
            Err(EventBusError::AckMessageError)
        }
        _ => {
            span.set_status(Status::Ok);
            Ok(())
        }
    }
}

async fn requeue(
    channel: &dyn BrokerChannel,
    delivery: &InboundDelivery,
    delay: Duration,
    span: &mut BoxedSpan,
) -> Result<(), EventBusError> {
    warn!(
        "adding message to queue again with {:.1} seconds delay...",
        delay.as_secs_f64()
    );
    tokio::time::sleep(delay).await;

    match channel.basic_nack(delivery.delivery_tag, false, true).await {
        Ok(()) => {
            trace!("message added to queue again");
            Ok(())
        }
        Err(err) => {
            error!(error = err.to_string(), "could not enqueue message again");
            span.record_error(&err);
            Err(EventBusError::NackMessageError)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        errors::TransportError,
        event::{Event, EventHandler, EventMetadata},
        transport::{MessageProperties, MockBrokerChannel},
    };
    use async_trait::async_trait;
    use mockall::predicate::eq;
    use opentelemetry::{
        global,
        propagation::{text_map_propagator::FieldIter, Extractor, Injector, TextMapPropagator},
        trace::Tracer,
        Context,
    };
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Serialize, Deserialize)]
    struct StockReserved {
        meta: EventMetadata,
        sku: String,
    }

    impl Event for StockReserved {
        fn metadata(&self) -> &EventMetadata {
            &self.meta
        }
    }

    #[derive(Default)]
    struct Recorder {
        skus: parking_lot::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EventHandler<StockReserved> for Recorder {
        async fn handle(&self, event: &StockReserved) -> Result<(), EventBusError> {
            self.skus.lock().push(event.sku.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct Failing {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EventHandler<StockReserved> for Failing {
        async fn handle(&self, _event: &StockReserved) -> Result<(), EventBusError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(EventBusError::HandlerExecutionError("out of stock".into()))
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Tenant(String);

    /// Carries a [`Tenant`] through the `x-tenant` header.
    #[derive(Debug)]
    struct TenantPropagator {
        fields: Vec<String>,
    }

    impl TextMapPropagator for TenantPropagator {
        fn inject_context(&self, cx: &Context, injector: &mut dyn Injector) {
            if let Some(tenant) = cx.get::<Tenant>() {
                injector.set("x-tenant", tenant.0.clone());
            }
        }

        fn extract_with_context(&self, cx: &Context, extractor: &dyn Extractor) -> Context {
            match extractor.get("x-tenant") {
                Some(tenant) => cx.with_value(Tenant(tenant.to_owned())),
                None => cx.clone(),
            }
        }

        fn fields(&self) -> FieldIter<'_> {
            FieldIter::new(&self.fields)
        }
    }

    #[derive(Default)]
    struct TenantRecorder {
        seen: parking_lot::Mutex<Vec<Option<Tenant>>>,
    }

    #[async_trait]
    impl EventHandler<StockReserved> for TenantRecorder {
        async fn handle(&self, _event: &StockReserved) -> Result<(), EventBusError> {
            let cx = Context::current();
            self.seen.lock().push(cx.get::<Tenant>().cloned());
            Ok(())
        }
    }

    fn delivery(routing_key: &str, body: Vec<u8>) -> InboundDelivery {
        InboundDelivery {
            delivery_tag: 7,
            exchange: "bus".to_owned(),
            routing_key: routing_key.to_owned(),
            redelivered: false,
            properties: MessageProperties::default(),
            body,
        }
    }

    fn stock_body() -> Vec<u8> {
        serde_json::to_vec(&StockReserved {
            meta: EventMetadata::new(),
            sku: "sku-1".into(),
        })
        .unwrap()
    }

    async fn run(
        delivery: &InboundDelivery,
        registry: &SubscriptionRegistry,
        handlers: &HandlerProvider,
        channel: &MockBrokerChannel,
    ) -> Result<(), EventBusError> {
        consume(
            &global::tracer("test"),
            delivery,
            registry,
            handlers,
            channel,
            Duration::from_secs(5),
        )
        .await
    }

    #[tokio::test]
    async fn orphan_messages_are_acked_and_dropped() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_basic_ack()
            .with(eq(7), eq(false))
            .times(1)
            .returning(|_, _| Ok(()));
        channel.expect_basic_nack().never();

        let result = run(
            &delivery("StockReserved", stock_body()),
            &SubscriptionRegistry::new(),
            &HandlerProvider::new(),
            &channel,
        )
        .await;

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn handled_messages_are_acked_once() {
        let registry = SubscriptionRegistry::new();
        registry
            .add_subscription(Subscription::new::<StockReserved, Recorder>())
            .unwrap();
        let recorder = Arc::new(Recorder::default());
        let handlers = HandlerProvider::new();
        handlers.register_arc(recorder.clone());

        let mut channel = MockBrokerChannel::new();
        channel
            .expect_basic_ack()
            .with(eq(7), eq(false))
            .times(1)
            .returning(|_, _| Ok(()));
        channel.expect_basic_nack().never();

        run(&delivery("StockReserved", stock_body()), &registry, &handlers, &channel)
            .await
            .unwrap();

        assert_eq!(*recorder.skus.lock(), vec!["sku-1".to_owned()]);
    }

    #[tokio::test]
    async fn unresolvable_handlers_are_skipped() {
        let registry = SubscriptionRegistry::new();
        registry
            .add_subscription(Subscription::new::<StockReserved, Failing>())
            .unwrap();
        registry
            .add_subscription(Subscription::new::<StockReserved, Recorder>())
            .unwrap();
        let recorder = Arc::new(Recorder::default());
        let handlers = HandlerProvider::new();
        handlers.register_arc(recorder.clone());

        let mut channel = MockBrokerChannel::new();
        channel.expect_basic_ack().times(1).returning(|_, _| Ok(()));
        channel.expect_basic_nack().never();

        run(&delivery("StockReserved", stock_body()), &registry, &handlers, &channel)
            .await
            .unwrap();

        assert_eq!(recorder.skus.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn handler_failure_nacks_with_requeue_after_the_delay() {
        let registry = SubscriptionRegistry::new();
        registry
            .add_subscription(Subscription::new::<StockReserved, Failing>())
            .unwrap();
        registry
            .add_subscription(Subscription::new::<StockReserved, Recorder>())
            .unwrap();
        let recorder = Arc::new(Recorder::default());
        let handlers = HandlerProvider::new().with_handler(Failing::default());
        handlers.register_arc(recorder.clone());

        let mut channel = MockBrokerChannel::new();
        channel.expect_basic_ack().never();
        channel
            .expect_basic_nack()
            .with(eq(7), eq(false), eq(true))
            .times(1)
            .returning(|_, _, _| Ok(()));

        let started = tokio::time::Instant::now();
        run(&delivery("StockReserved", stock_body()), &registry, &handlers, &channel)
            .await
            .unwrap();

        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(recorder.skus.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn undecodable_payload_is_requeued() {
        let registry = SubscriptionRegistry::new();
        registry
            .add_subscription(Subscription::new::<StockReserved, Recorder>())
            .unwrap();
        let handlers = HandlerProvider::new().with_handler(Recorder::default());

        let mut channel = MockBrokerChannel::new();
        channel.expect_basic_ack().never();
        channel
            .expect_basic_nack()
            .with(eq(7), eq(false), eq(true))
            .times(1)
            .returning(|_, _, _| Ok(()));

        run(
            &delivery("StockReserved", b"{\"sku\":".to_vec()),
            &registry,
            &handlers,
            &channel,
        )
        .await
        .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn nack_failure_is_swallowed() {
        let registry = SubscriptionRegistry::new();
        registry
            .add_subscription(Subscription::new::<StockReserved, Failing>())
            .unwrap();
        let handlers = HandlerProvider::new().with_handler(Failing::default());

        let mut channel = MockBrokerChannel::new();
        channel
            .expect_basic_nack()
            .times(1)
            .returning(|_, _, _| Err(TransportError::ChannelClosed("gone".into())));

        let result = run(&delivery("StockReserved", stock_body()), &registry, &handlers, &channel).await;

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn ack_failure_is_reported() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_basic_ack()
            .returning(|_, _| Err(TransportError::ChannelClosed("gone".into())));

        let result = run(
            &delivery("Unknown", Vec::new()),
            &SubscriptionRegistry::new(),
            &HandlerProvider::new(),
            &channel,
        )
        .await;

        assert_eq!(result, Err(EventBusError::AckMessageError));
    }

    #[tokio::test]
    async fn handlers_run_under_the_propagated_context() {
        global::set_text_map_propagator(TenantPropagator {
            fields: vec!["x-tenant".to_owned()],
        });
        let registry = SubscriptionRegistry::new();
        registry
            .add_subscription(Subscription::new::<StockReserved, TenantRecorder>())
            .unwrap();
        let recorder = Arc::new(TenantRecorder::default());
        let handlers = HandlerProvider::new();
        handlers.register_arc(recorder.clone());

        let mut channel = MockBrokerChannel::new();
        channel.expect_basic_ack().times(1).returning(|_, _| Ok(()));

        let mut delivery = delivery("StockReserved", stock_body());
        delivery
            .properties
            .headers
            .insert("x-tenant".to_owned(), "acme".to_owned());

        run(&delivery, &registry, &handlers, &channel).await.unwrap();

        assert_eq!(*recorder.seen.lock(), vec![Some(Tenant("acme".into()))]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_nack_is_reported_by_requeue() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_basic_nack()
            .with(eq(7), eq(false), eq(true))
            .times(1)
            .returning(|_, _, _| Err(TransportError::ChannelClosed("gone".into())));
        let mut span = global::tracer("test").start("requeue");

        let result = requeue(
            &channel,
            &delivery("StockReserved", Vec::new()),
            Duration::from_secs(5),
            &mut span,
        )
        .await;

        assert_eq!(result, Err(EventBusError::NackMessageError));
    }
}
