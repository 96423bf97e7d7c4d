// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Client
//!
//! Wires the reliability components together over one connection:
//!
//! ```text
//! ConnectionManager -> TopologyProvisioner (recovery hook)
//!                   -> MessagePublisher -> RetryCoordinator
//!                   -> MessageConsumer  -> ConsumerRegistry
//! ```

use crate::{
    config::BrokerConfig,
    connection::{ConnectionManager, ConnectionStatus},
    consumer::{ConsumerTag, MessageConsumer, SubscriptionState},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    handler::MessageHandler,
    publisher::{MessagePublisher, PublishOptions},
    queue::QueueDefinition,
    registry::ConsumerRegistry,
    retry::RetryCoordinator,
    topology::TopologyProvisioner,
    transport::Connector,
};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use uuid::Uuid;

pub struct AmqpClient {
    manager: Arc<ConnectionManager>,
    topology: Arc<TopologyProvisioner>,
    publisher: Arc<MessagePublisher>,
    consumer: Arc<MessageConsumer>,
    registry: Arc<ConsumerRegistry>,
}

impl AmqpClient {
    /// Connects to the broker described by `cfg` and wires the publisher,
    /// retry coordinator and consumer on top of the connection.
    ///
    /// # Parameters
    /// * `cfg` - Broker address, credentials and retry/consume settings
    ///
    /// # Returns
    /// * `Result<AmqpClient, AmqpError>` - The ready client, or
    ///   `InvalidConfig` / `ConnectionError` when the configuration is wrong or
    ///   the broker is unreachable at startup
    pub async fn connect(cfg: BrokerConfig) -> Result<AmqpClient, AmqpError> {
        cfg.validate()?;
        let manager = ConnectionManager::connect(&cfg).await?;
        Ok(Self::assemble(manager, &cfg).await)
    }

    /// Connects through a custom transport.
    pub async fn with_connector(
        connector: Arc<dyn Connector>,
        cfg: BrokerConfig,
    ) -> Result<AmqpClient, AmqpError> {
        cfg.validate()?;
        let manager = ConnectionManager::with_connector(connector, &cfg).await?;
        Ok(Self::assemble(manager, &cfg).await)
    }

    async fn assemble(manager: Arc<ConnectionManager>, cfg: &BrokerConfig) -> AmqpClient {
        let topology = TopologyProvisioner::new(manager.clone(), cfg.dead_letter_enabled);
        manager.add_recovery_hook(topology.clone()).await;

        let publisher = MessagePublisher::new(manager.clone(), topology.clone(), cfg.publisher_confirms);
        let retry = RetryCoordinator::new(publisher.clone());
        let registry = Arc::new(ConsumerRegistry::new());
        let consumer = MessageConsumer::new(
            manager.clone(),
            topology.clone(),
            retry,
            registry.clone(),
            cfg,
        );

        AmqpClient {
            manager,
            topology,
            publisher,
            consumer,
            registry,
        }
    }

    pub async fn ensure_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        self.topology.ensure_queue(def).await
    }

    pub async fn ensure_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.topology.ensure_exchange(def).await
    }

    pub async fn publish<T>(
        &self,
        message: &T,
        destination: &str,
        options: PublishOptions,
    ) -> Result<Uuid, AmqpError>
    where
        T: Serialize + Sync + ?Sized,
    {
        self.publisher.publish(message, destination, options).await
    }

    pub async fn subscribe<T, H>(
        &self,
        queue: &str,
        handler: H,
        prefetch: Option<u16>,
    ) -> Result<ConsumerTag, AmqpError>
    where
        T: DeserializeOwned + Send + 'static,
        H: MessageHandler<T> + 'static,
    {
        self.consumer.subscribe(queue, handler, prefetch).await
    }

    pub async fn unsubscribe(&self, tag: &str) -> Result<(), AmqpError> {
        self.consumer.unsubscribe(tag).await
    }

    pub async fn subscription_state(&self, tag: &str) -> Option<SubscriptionState> {
        self.consumer.state(tag).await
    }

    pub fn status(&self) -> ConnectionStatus {
        self.manager.status()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.manager.subscribe_status()
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub fn topology(&self) -> &Arc<TopologyProvisioner> {
        &self.topology
    }

    pub fn publisher(&self) -> &Arc<MessagePublisher> {
        &self.publisher
    }

    pub fn registry(&self) -> &Arc<ConsumerRegistry> {
        &self.registry
    }

    /// Cancels every subscription, then closes the connection.
    pub async fn shutdown(&self) -> Result<(), AmqpError> {
        self.registry.unregister_all().await;
        self.manager.close().await?;
        info!("amqp client shut down");
        Ok(())
    }
}
