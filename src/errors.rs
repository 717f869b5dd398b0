// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Event Bus
//!
//! Two enums live here. `EventBusError` is what callers of the bus see: it
//! covers configuration, connectivity, subscription bookkeeping, publishing
//! and message handling. `TransportError` is what the broker seam reports and
//! carries the transient/permanent classification the retry policies use.

use thiserror::Error;

/// Represents errors that can occur while publishing, subscribing or consuming.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum EventBusError {
    /// Missing or malformed configuration at construction time
    #[error("invalid configuration: {0}")]
    ConfigurationError(String),

    /// A channel was requested while no broker connection is open
    #[error("no broker connection is available to perform this action")]
    NotConnected,

    /// The same handler was registered twice for one event
    #[error("handler `{handler}` already registered for event `{event}`")]
    DuplicateSubscription { event: String, handler: String },

    /// Two distinct event types resolve to the same event name
    #[error("event name `{event}` is already used by `{registered}`, cannot subscribe `{rejected}`")]
    EventNameConflict {
        event: String,
        registered: String,
        rejected: String,
    },

    /// Broker unreachable or socket failure after retries were exhausted
    #[error("broker unreachable: {0}")]
    TransientBrokerError(String),

    /// Application handler logic failed
    #[error("handler execution failed: {0}")]
    HandlerExecutionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{1}` to exchange `{0}`")]
    BindingExchangeToQueueError(String, String),

    /// Error removing a queue binding
    #[error("failure to unbind queue `{1}` from exchange `{0}`")]
    UnbindingExchangeToQueueError(String, String),

    /// Non-transient error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// Error serializing an event payload
    #[error("failure to serialize payload: {0}")]
    SerializePayloadError(String),

    /// Error decoding an inbound payload
    #[error("failure to parse payload: {0}")]
    ParsePayloadError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error attaching a consumer to the queue
    #[error("failure to declare consumer `{0}`")]
    ConsumerDeclarationError(String),

    /// Decoded value did not match the registered event type
    #[error("unknown event type `{0}`")]
    UnknownEventType(String),
}

/// Failures reported by the broker transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Broker could not be reached or the connection is not usable
    #[error("broker unreachable: {0}")]
    Unreachable(String),

    /// Socket level I/O failure
    #[error("socket failure: {0}")]
    Socket(String),

    /// The channel was closed, by us or by the broker
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// The broker rejected the operation
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Unreachable(_) | TransportError::Socket(_))
    }
}

impl From<lapin::Error> for TransportError {
    fn from(err: lapin::Error) -> Self {
        match err {
            lapin::Error::IOError(e) => TransportError::Socket(e.to_string()),
            lapin::Error::InvalidConnectionState(state) => {
                TransportError::Unreachable(format!("connection state {state:?}"))
            }
            lapin::Error::MissingHeartbeatError => {
                TransportError::Unreachable("missing heartbeat".to_owned())
            }
            lapin::Error::InvalidChannelState(state) => {
                TransportError::ChannelClosed(format!("channel state {state:?}"))
            }
            lapin::Error::InvalidChannel(id) => {
                TransportError::ChannelClosed(format!("invalid channel {id}"))
            }
            other => TransportError::Protocol(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_unreachable_and_socket_failures_are_transient() {
        assert!(TransportError::Unreachable("down".into()).is_transient());
        assert!(TransportError::Socket("reset".into()).is_transient());
        assert!(!TransportError::ChannelClosed("closed".into()).is_transient());
        assert!(!TransportError::Protocol("NOT_FOUND".into()).is_transient());
    }

    #[test]
    fn duplicate_subscription_names_both_sides() {
        let err = EventBusError::DuplicateSubscription {
            event: "OrderPlaced".into(),
            handler: "AuditHandler".into(),
        };

        assert_eq!(
            err.to_string(),
            "handler `AuditHandler` already registered for event `OrderPlaced`"
        );
    }
}
