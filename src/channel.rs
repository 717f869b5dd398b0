// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Scoped Channels
//!
//! Publishing and binding each use a short-lived channel of their own. A
//! [`ScopedChannel`] is closed explicitly on the happy path and, should the
//! owner bail out early with `?`, closed from a background task on drop.

use crate::{connection::ConnectionManager, errors::EventBusError, transport::BrokerChannel};
use std::{ops::Deref, sync::Arc};
use tracing::{debug, warn};

pub struct ScopedChannel {
    channel: Arc<dyn BrokerChannel>,
    closed: bool,
}

impl ScopedChannel {
    /// Opens a channel, connecting first when needed.
    pub async fn open(connection: &ConnectionManager) -> Result<ScopedChannel, EventBusError> {
        if !connection.is_connected() {
            connection.try_connect().await;
        }

        let channel = connection.create_channel().await?;
        debug!("scoped channel opened");

        Ok(ScopedChannel {
            channel,
            closed: false,
        })
    }

    /// Closes the channel now, logging a failure instead of returning it.
    pub async fn close(mut self) {
        self.closed = true;
        if let Err(err) = self.channel.close().await {
            warn!(error = err.to_string(), "failure to close scoped channel");
        }
    }
}

impl Deref for ScopedChannel {
    type Target = dyn BrokerChannel;

    fn deref(&self) -> &Self::Target {
        self.channel.as_ref()
    }
}

impl Drop for ScopedChannel {
    fn drop(&mut self) {
        if self.closed {
            return;
        }

        let channel = self.channel.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = channel.close().await {
                        warn!(error = err.to_string(), "failure to close scoped channel");
                    }
                });
            }
            Err(_) => warn!("scoped channel dropped outside a runtime, leaving it to the broker"),
        }
    }
}
