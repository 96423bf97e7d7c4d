// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! `MessagePublisher` serializes typed messages into envelopes and writes them
//! to the broker, either straight to their destination or through a delay route
//! when a delay is requested. It also implements the object-safe [`Publisher`]
//! trait used by the retry coordinator to republish existing envelopes.
//!
//! Writes go through the manager's shared channel. Channels do not support
//! unsynchronized concurrent writers, so every write holds an internal mutex
//! until the broker accepted it (including the publisher confirm when enabled).

use crate::{
    connection::ConnectionManager,
    envelope::Envelope,
    errors::AmqpError,
    otel,
    queue::dead_letter_queue_name,
    topology::{TopologyProvisioner, DEFAULT_EXCHANGE},
};
use async_trait::async_trait;
use lapin::BasicProperties;
use serde::Serialize;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Where an envelope is written, relative to its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// The destination queue, or the exchange it is bound to
    Direct,
    /// The delay queue of the destination for the given delay
    Delayed(Duration),
    /// The dead-letter queue of the destination
    DeadLetter,
}

impl Route {
    /// Route for an optional caller supplied delay; a zero delay is direct.
    pub fn for_delay(delay: Option<Duration>) -> Route {
        match delay {
            Some(delay) if !delay.is_zero() => Route::Delayed(delay),
            _ => Route::Direct,
        }
    }
}

/// Per publish options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOptions {
    pub delay: Option<Duration>,
    pub persistent: bool,
    pub correlation_id: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

impl Default for PublishOptions {
    fn default() -> Self {
        PublishOptions {
            delay: None,
            persistent: true,
            correlation_id: None,
            metadata: BTreeMap::new(),
        }
    }
}

impl PublishOptions {
    pub fn delayed(delay: Duration) -> Self {
        PublishOptions::default().with_delay(delay)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Publishes in transient mode; the message is lost on broker restart.
    pub fn transient(mut self) -> Self {
        self.persistent = false;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Publishing of already built envelopes.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Writes `envelope` persistently along `route`.
    async fn publish_envelope(&self, envelope: &Envelope, route: Route) -> Result<(), AmqpError>;
}

/// Publisher over the connection manager's shared channel.
pub struct MessagePublisher {
    manager: Arc<ConnectionManager>,
    topology: Arc<TopologyProvisioner>,
    publisher_confirms: bool,
    write_lock: Mutex<()>,
}

impl MessagePublisher {
    pub fn new(
        manager: Arc<ConnectionManager>,
        topology: Arc<TopologyProvisioner>,
        publisher_confirms: bool,
    ) -> Arc<MessagePublisher> {
        Arc::new(MessagePublisher {
            manager,
            topology,
            publisher_confirms,
            write_lock: Mutex::new(()),
        })
    }

    /// Publishes `message` to `destination` and returns the envelope id.
    ///
    /// Serialization failures are returned before anything reaches the broker.
    /// With a non-zero delay the message only becomes visible on `destination`
    /// once the delay elapsed. A destination queue that was never declared is
    /// provisioned with the default definition first.
    ///
    /// # Parameters
    /// * `message` - The payload, serialized as JSON
    /// * `destination` - The target queue name
    /// * `options` - Delay, persistence, correlation id and metadata
    ///
    /// # Returns
    /// * `Result<Uuid, AmqpError>` - The id of the published envelope
    pub async fn publish<T>(
        &self,
        message: &T,
        destination: &str,
        options: PublishOptions,
    ) -> Result<Uuid, AmqpError>
    where
        T: Serialize + Sync + ?Sized,
    {
        let mut envelope = Envelope::new(message, destination)?;
        if let Some(correlation_id) = options.correlation_id {
            envelope = envelope.with_correlation_id(correlation_id);
        }
        envelope = envelope.with_metadata(options.metadata);

        self.send(&envelope, Route::for_delay(options.delay), options.persistent)
            .await?;

        debug!(id = %envelope.id, destination, "message published");
        Ok(envelope.id)
    }

    async fn send(&self, envelope: &Envelope, route: Route, persistent: bool) -> Result<(), AmqpError> {
        let (exchange, routing_key) = self.resolve(envelope, route).await?;
        let properties = envelope.to_properties(persistent, otel::inject_current_context());

        match self
            .write(&exchange, &routing_key, &envelope.payload, properties.clone())
            .await
        {
            Err(err) if err.is_transport() => {
                warn!(
                    error = err.to_string(),
                    id = %envelope.id,
                    "transport failure while publishing, retrying on a fresh channel"
                );
                self.write(&exchange, &routing_key, &envelope.payload, properties)
                    .await
            }
            result => result,
        }
    }

    async fn resolve(&self, envelope: &Envelope, route: Route) -> Result<(String, String), AmqpError> {
        match route {
            Route::Direct => {
                self.topology
                    .ensure_destination(&envelope.destination)
                    .await?;
                Ok(self.topology.route_for(&envelope.destination).await)
            }
            Route::Delayed(delay) => {
                self.topology
                    .ensure_destination(&envelope.destination)
                    .await?;
                let queue = self
                    .topology
                    .ensure_delay_route(&envelope.destination, delay)
                    .await?;
                Ok((DEFAULT_EXCHANGE.to_owned(), queue))
            }
            Route::DeadLetter => Ok((
                DEFAULT_EXCHANGE.to_owned(),
                dead_letter_queue_name(&envelope.destination),
            )),
        }
    }

    async fn write(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let channel = self.manager.acquire_channel().await?;

        let _guard = self.write_lock.lock().await;
        channel
            .basic_publish(
                exchange,
                routing_key,
                payload,
                properties,
                self.publisher_confirms,
            )
            .await
            .inspect_err(|err| {
                error!(
                    error = err.to_string(),
                    exchange, routing_key, "error publishing message"
                )
            })
    }
}

#[async_trait]
impl Publisher for MessagePublisher {
    async fn publish_envelope(&self, envelope: &Envelope, route: Route) -> Result<(), AmqpError> {
        self.send(envelope, route, true).await
    }
}
