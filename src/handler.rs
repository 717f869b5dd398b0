// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Handler Resolution
//!
//! The bus never owns handler instances. Subscriptions record handler *types*
//! and every delivery resolves the instance from a [`HandlerProvider`], the
//! same way an application container hands out services. A handler type that
//! is not registered in the provider is skipped for that delivery.

use crate::{
    errors::EventBusError,
    event::{short_type_name, Event, EventHandler},
};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::{
    any::{Any, TypeId},
    collections::HashMap,
    fmt,
    marker::PhantomData,
    sync::Arc,
};

/// Type-indexed container of handler instances.
#[derive(Default)]
pub struct HandlerProvider {
    handlers: RwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl HandlerProvider {
    /// Creates an empty provider.
    pub fn new() -> HandlerProvider {
        HandlerProvider::default()
    }

    /// Registers `handler`, replacing any earlier instance of the same type.
    pub fn register<H: Send + Sync + 'static>(&self, handler: H) -> &Self {
        self.register_arc(Arc::new(handler))
    }

    /// Registers a shared instance, so the caller can keep inspecting it.
    pub fn register_arc<H: Send + Sync + 'static>(&self, handler: Arc<H>) -> &Self {
        self.handlers.write().insert(TypeId::of::<H>(), handler);
        self
    }

    /// Builder form of [`HandlerProvider::register`].
    pub fn with_handler<H: Send + Sync + 'static>(self, handler: H) -> Self {
        self.register(handler);
        self
    }

    /// Removes the instance of `H`; returns whether one was registered.
    pub fn remove<H: Send + Sync + 'static>(&self) -> bool {
        self.handlers.write().remove(&TypeId::of::<H>()).is_some()
    }

    /// Looks up the instance of `H`.
    ///
    /// # Returns
    /// The registered instance, or None when `H` was never registered or was removed
    pub fn resolve<H: Send + Sync + 'static>(&self) -> Option<Arc<H>> {
        let handler = self.handlers.read().get(&TypeId::of::<H>()).cloned()?;
        handler.downcast::<H>().ok()
    }
}

/// Identity of a handler type inside the registry.
#[derive(Clone, Copy)]
pub struct HandlerType {
    id: TypeId,
    name: &'static str,
}

impl HandlerType {
    /// Identity of the handler type `H`.
    pub fn of<H: 'static>() -> HandlerType {
        HandlerType {
            id: TypeId::of::<H>(),
            name: short_type_name::<H>(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for HandlerType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for HandlerType {}

impl fmt::Debug for HandlerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// What happened when a subscription was offered a decoded event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invocation {
    Handled,
    /// No instance of the handler type was available
    Unresolved,
}

/// Resolves a handler and feeds it an already decoded event.
#[async_trait]
pub(crate) trait HandlerInvoker: Send + Sync {
    async fn invoke(
        &self,
        handlers: &HandlerProvider,
        event: &(dyn Any + Send + Sync),
    ) -> Result<Invocation, EventBusError>;
}

pub(crate) struct TypedInvoker<E, H> {
    _marker: PhantomData<fn() -> (E, H)>,
}

impl<E, H> TypedInvoker<E, H> {
    pub(crate) fn new() -> Self {
        TypedInvoker {
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<E, H> HandlerInvoker for TypedInvoker<E, H>
where
    E: Event,
    H: EventHandler<E>,
{
    async fn invoke(
        &self,
        handlers: &HandlerProvider,
        event: &(dyn Any + Send + Sync),
    ) -> Result<Invocation, EventBusError> {
        let Some(handler) = handlers.resolve::<H>() else {
            return Ok(Invocation::Unresolved);
        };

        let Some(event) = event.downcast_ref::<E>() else {
            return Err(EventBusError::UnknownEventType(E::name().to_owned()));
        };

        handler.handle(event).await?;
        Ok(Invocation::Handled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventMetadata;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Serialize, Deserialize)]
    struct Pinged {
        meta: EventMetadata,
    }

    impl Event for Pinged {
        fn metadata(&self) -> &EventMetadata {
            &self.meta
        }
    }

    #[derive(Default)]
    struct CountingHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EventHandler<Pinged> for CountingHandler {
        async fn handle(&self, _event: &Pinged) -> Result<(), EventBusError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn resolves_registered_instances_by_type() {
        let provider = HandlerProvider::new().with_handler(CountingHandler::default());

        assert!(provider.resolve::<CountingHandler>().is_some());
        assert!(provider.resolve::<String>().is_none());
        assert!(provider.remove::<CountingHandler>());
        assert!(provider.resolve::<CountingHandler>().is_none());
    }

    #[test]
    fn handler_types_compare_by_identity() {
        assert_eq!(HandlerType::of::<CountingHandler>(), HandlerType::of::<CountingHandler>());
        assert_ne!(HandlerType::of::<CountingHandler>(), HandlerType::of::<String>());
        assert_eq!(HandlerType::of::<CountingHandler>().name(), "CountingHandler");
    }

    #[tokio::test]
    async fn invoker_skips_unresolvable_handlers() {
        let invoker = TypedInvoker::<Pinged, CountingHandler>::new();
        let event = Pinged {
            meta: EventMetadata::new(),
        };

        let empty = HandlerProvider::new();
        assert_eq!(invoker.invoke(&empty, &event).await, Ok(Invocation::Unresolved));

        let provider = HandlerProvider::new();
        let handler = Arc::new(CountingHandler::default());
        provider.register_arc(handler.clone());

        assert_eq!(invoker.invoke(&provider, &event).await, Ok(Invocation::Handled));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invoker_rejects_values_of_another_type() {
        let invoker = TypedInvoker::<Pinged, CountingHandler>::new();
        let provider = HandlerProvider::new().with_handler(CountingHandler::default());

        let result = invoker.invoke(&provider, &"not an event".to_owned()).await;

        assert_eq!(result, Err(EventBusError::UnknownEventType("Pinged".into())));
    }
}
