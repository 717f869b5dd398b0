// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Persistent Broker Connection
//!
//! [`ConnectionManager`] owns the single logical connection of a bus and hides
//! reconnects from its users. Connect attempts are serialized; each attempt
//! retries under the configured [`RetryPolicy`].
//!
//! Once connected, the manager listens for broker notifications (shutdown,
//! blocked connection, callback errors). Each connection is tagged with a
//! generation; the first notification for the current generation moves the
//! manager to "failed" and triggers a reconnect, notifications for older
//! generations are dropped. When a reconnect succeeds after a failure, the
//! manager broadcasts a signal so the bus can rebuild its topology.

use crate::{
    errors::{EventBusError, TransportError},
    retry::RetryPolicy,
    transport::{BrokerChannel, BrokerConnection, ConnectionNotification, Transport},
};
use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Weak,
};
use tokio::sync::{broadcast, mpsc::UnboundedReceiver, Mutex};
use tracing::{debug, error, info, warn};

/// Owner of the single logical broker connection of a bus.
///
/// Shared behind an `Arc`; the manager keeps a weak reference to itself to
/// spawn its notification watchers.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    connect_lock: Mutex<()>,
    connection: RwLock<Option<Arc<dyn BrokerConnection>>>,
    generation: AtomicU64,
    connection_failed: AtomicBool,
    disposed: AtomicBool,
    reconnected: broadcast::Sender<()>,
    me: Weak<ConnectionManager>,
}

impl ConnectionManager {
    /// Creates a disconnected manager.
    ///
    /// # Parameters
    /// * `transport` - Opens the underlying broker connections
    /// * `policy` - Retry policy applied to every connect attempt
    ///
    /// # Returns
    /// An Arc-wrapped ConnectionManager; call [`ConnectionManager::try_connect`] to connect
    pub fn new(transport: Arc<dyn Transport>, policy: RetryPolicy) -> Arc<ConnectionManager> {
        let (reconnected, _) = broadcast::channel(16);

        Arc::new_cyclic(|me| ConnectionManager {
            transport,
            policy,
            connect_lock: Mutex::new(()),
            connection: RwLock::new(None),
            generation: AtomicU64::new(0),
            connection_failed: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            reconnected,
            me: me.clone(),
        })
    }

    /// True iff a connection exists, is open and the manager is not disposed.
    pub fn is_connected(&self) -> bool {
        if self.disposed.load(Ordering::SeqCst) {
            return false;
        }

        self.connection
            .read()
            .as_ref()
            .is_some_and(|conn| conn.is_open())
    }

    /// Whether [`ConnectionManager::dispose`] was called.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Receives one message each time connectivity is restored after a failure.
    pub fn on_reconnected_after_failure(&self) -> broadcast::Receiver<()> {
        self.reconnected.subscribe()
    }

    /// Connects to the broker, retrying per policy.
    ///
    /// Only one attempt runs at a time; callers queued behind a successful
    /// attempt return immediately. Returns false when the bounded policy is
    /// exhausted, on a permanent failure, or once disposed. Under the
    /// unbounded policy this only returns after success or disposal.
    pub async fn try_connect(&self) -> bool {
        info!("trying to connect to the broker...");

        let _guard = self.connect_lock.lock().await;

        if self.is_disposed() {
            info!("connection manager is disposed, no action will be taken");
            return false;
        }

        if self.is_connected() {
            return true;
        }

        let result = self
            .policy
            .run_until(
                "connect to the broker",
                |_| self.transport.connect(),
                || self.is_disposed(),
            )
            .await;

        let conn = match result {
            Ok(conn) if conn.is_open() => conn,
            Ok(_) => {
                error!("broker connection was closed right after opening");
                self.connection_failed.store(true, Ordering::SeqCst);
                return false;
            }
            Err(err) => {
                error!(error = err.to_string(), "could not connect to the broker");
                self.connection_failed.store(true, Ordering::SeqCst);
                return false;
            }
        };

        if self.is_disposed() {
            close_quietly(conn.as_ref()).await;
            return false;
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(notifications) = conn.notifications() {
            tokio::spawn(self.watch(notifications, generation));
        }

        info!(
            endpoint = conn.endpoint(),
            "acquired a persistent connection, subscribed to failure notifications"
        );
        *self.connection.write() = Some(conn);

        if self.connection_failed.swap(false, Ordering::SeqCst) {
            info!("connection restored after a failure");
            let _ = self.reconnected.send(());
        }

        true
    }

    /// Opens a channel on the current connection; never connects or retries.
    ///
    /// # Returns
    /// The new channel, or `NotConnected` when no open connection exists
    pub async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, EventBusError> {
        let conn = match self.current() {
            Some(conn) if !self.is_disposed() && conn.is_open() => conn,
            _ => return Err(EventBusError::NotConnected),
        };

        conn.create_channel().await.map_err(|err| match err {
            TransportError::Unreachable(_) => EventBusError::NotConnected,
            other => EventBusError::ChannelError(other.to_string()),
        })
    }

    /// Closes the connection for good and suppresses further reconnects.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        let conn = self.connection.write().take();
        if let Some(conn) = conn {
            close_quietly(conn.as_ref()).await;
        }
        debug!("connection manager disposed");
    }

    fn current(&self) -> Option<Arc<dyn BrokerConnection>> {
        self.connection.read().clone()
    }

    fn watch(
        &self,
        mut notifications: UnboundedReceiver<ConnectionNotification>,
        generation: u64,
    ) -> BoxFuture<'static, ()> {
        let me = self.me.clone();

        Box::pin(async move {
            let Some(notification) = notifications.recv().await else {
                return;
            };

            if let Some(manager) = me.upgrade() {
                manager.on_notification(notification, generation).await;
            }
        })
    }

    async fn on_notification(&self, notification: ConnectionNotification, generation: u64) {
        if generation != self.generation.load(Ordering::SeqCst) {
            debug!(?notification, "ignoring notification from a replaced connection");
            return;
        }

        match &notification {
            ConnectionNotification::Shutdown(reason) => {
                warn!(reason, "broker connection is on shutdown, trying to re-connect...")
            }
            ConnectionNotification::Blocked(reason) => {
                warn!(reason, "broker connection is blocked, trying to re-connect...")
            }
            ConnectionNotification::CallbackError(reason) => {
                warn!(reason, "broker connection threw an exception, trying to re-connect...")
            }
        }

        self.connection_failed.store(true, Ordering::SeqCst);

        if self.is_disposed() {
            info!("connection manager is disposed, no action will be taken");
            return;
        }

        let stale = self.connection.write().take();
        if let Some(conn) = stale {
            close_quietly(conn.as_ref()).await;
        }

        self.try_connect().await;
    }
}

async fn close_quietly(conn: &dyn BrokerConnection) {
    if let Err(err) = conn.close().await {
        warn!(error = err.to_string(), "failure to close broker connection");
    }
}
