// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! `TopologyProvisioner` declares the broker topology a queue needs to support
//! retries and dead-lettering:
//!
//! - the durable main queue, whose dead-letter arguments point at `<queue>.dlx`
//! - the `<queue>.dlx` exchange and the `<queue>.dlq` queue bound to it
//! - on demand, `<queue>.delay.<millis>` queues with a message TTL whose expiry
//!   dead-letters the message back into the main queue through the default
//!   exchange
//!
//! Every declaration is recorded so it can be replayed after a reconnect. Each
//! batch of declarations runs on its own short-lived channel: a broker
//! `PRECONDITION_FAILED` closes the channel it happened on, and the shared
//! publishing channel must survive a topology mismatch.

use crate::{
    connection::ConnectionManager,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{
        dead_letter_exchange_name, dead_letter_queue_name, delay_queue_name, QueueDefinition,
        AMQP_HEADERS_DEAD_LETTER_EXCHANGE, AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY,
        AMQP_HEADERS_MAX_LENGTH, AMQP_HEADERS_MAX_LENGTH_BYTES, AMQP_HEADERS_MESSAGE_TTL,
    },
    transport::{BrokerChannel, ExchangeKind, RecoveryHook},
};
use async_trait::async_trait;
use lapin::types::{AMQPValue, FieldTable, LongLongInt, LongString, ShortString};
use std::{
    collections::BTreeMap,
    sync::Arc,
    time::Duration,
};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// The default exchange, routing by queue name
pub const DEFAULT_EXCHANGE: &str = "";

#[derive(Debug, Clone, PartialEq)]
struct DelayRoute {
    queue: String,
    ttl_ms: u64,
}

#[derive(Debug, Clone, Default)]
struct Declared {
    exchanges: BTreeMap<String, ExchangeDefinition>,
    queues: BTreeMap<String, QueueDefinition>,
    delay_routes: BTreeMap<String, DelayRoute>,
}

/// Idempotent declaration of queues, dead-letter pairs and delay routes.
pub struct TopologyProvisioner {
    manager: Arc<ConnectionManager>,
    dead_letter_default: bool,
    declared: RwLock<Declared>,
}

impl TopologyProvisioner {
    /// Creates a provisioner; `dead_letter_default` applies to queue definitions
    /// that do not choose explicitly.
    pub fn new(manager: Arc<ConnectionManager>, dead_letter_default: bool) -> Arc<Self> {
        Arc::new(TopologyProvisioner {
            manager,
            dead_letter_default,
            declared: RwLock::new(Declared::default()),
        })
    }

    /// Declares `def` together with its dead-letter pair and exchange binding.
    ///
    /// Calling it again with the same definition is a no-op. A different
    /// definition under an already declared name is a topology mismatch.
    pub async fn ensure_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        if let Some(existing) = self.declared.read().await.queues.get(&def.name) {
            if existing == def {
                debug!(queue = def.name, "queue already declared");
                return Ok(());
            }
            error!(queue = def.name, "queue redeclared with different arguments");
            return Err(AmqpError::TopologyMismatch(def.name.clone()));
        }

        let channel = self.manager.create_channel().await?;
        let result = self.declare_queue(channel.as_ref(), def).await;
        close_quietly(channel).await;
        result?;

        self.declared
            .write()
            .await
            .queues
            .insert(def.name.clone(), def.clone());
        info!(queue = def.name, "queue provisioned");

        Ok(())
    }

    /// Declares (or reuses) the delay queue for `queue` and returns its name.
    ///
    /// Messages published to the delay queue expire after `delay` and are
    /// dead-lettered back into `queue` through the default exchange.
    ///
    /// # Parameters
    /// * `queue` - The queue delayed messages end up in
    /// * `delay` - How long messages wait; must be positive and fit a queue ttl
    ///
    /// # Returns
    /// * `Result<String, AmqpError>` - The delay queue name
    ///   (`<queue>.delay.<millis>`), or `InvalidConfig` for an unusable delay
    pub async fn ensure_delay_route(&self, queue: &str, delay: Duration) -> Result<String, AmqpError> {
        let name = delay_queue_name(queue, delay);
        if self.declared.read().await.delay_routes.contains_key(&name) {
            return Ok(name);
        }

        let ttl_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        if ttl_ms == 0 || u32::try_from(ttl_ms).is_err() {
            return Err(AmqpError::InvalidConfig(format!(
                "delay of {ttl_ms}ms is not a valid queue ttl"
            )));
        }

        let route = DelayRoute {
            queue: queue.to_owned(),
            ttl_ms,
        };

        let channel = self.manager.create_channel().await?;
        let result = declare_delay_queue(channel.as_ref(), &name, &route).await;
        close_quietly(channel).await;
        result?;

        self.declared
            .write()
            .await
            .delay_routes
            .insert(name.clone(), route);
        debug!(queue, delay_queue = name, ttl_ms, "delay route provisioned");

        Ok(name)
    }

    /// Declares a standalone exchange.
    pub async fn ensure_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        if let Some(existing) = self.declared.read().await.exchanges.get(&def.name) {
            if existing == def {
                return Ok(());
            }
            return Err(AmqpError::TopologyMismatch(def.name.clone()));
        }

        let channel = self.manager.create_channel().await?;
        let result = declare_exchange(channel.as_ref(), def).await;
        close_quietly(channel).await;
        result?;

        self.declared
            .write()
            .await
            .exchanges
            .insert(def.name.clone(), def.clone());

        Ok(())
    }

    /// Exchange and routing key a message for `destination` is published with.
    ///
    /// Queues bound to an exchange are reached through it, anything else
    /// through the default exchange.
    pub async fn route_for(&self, destination: &str) -> (String, String) {
        match self
            .declared
            .read()
            .await
            .queues
            .get(destination)
            .and_then(|def| def.binding.as_ref())
        {
            Some(binding) => (binding.exchange.name.clone(), binding.routing_key.clone()),
            None => (DEFAULT_EXCHANGE.to_owned(), destination.to_owned()),
        }
    }

    /// Makes sure a message addressed to `queue` has a queue to land in.
    ///
    /// A queue nobody declared through this provisioner is declared with the
    /// default definition. When the broker already holds it with other
    /// arguments it is routable as is and left untouched.
    pub async fn ensure_destination(&self, queue: &str) -> Result<(), AmqpError> {
        if self.is_provisioned(queue).await {
            return Ok(());
        }

        match self.ensure_queue(&QueueDefinition::new(queue)).await {
            Err(AmqpError::TopologyMismatch(_)) => {
                warn!(queue, "destination exists with a different definition, using it as is");
                Ok(())
            }
            result => result,
        }
    }

    pub async fn is_provisioned(&self, queue: &str) -> bool {
        self.declared.read().await.queues.contains_key(queue)
    }

    /// Whether dead-lettering is active for `queue`.
    pub async fn dead_letter_enabled(&self, queue: &str) -> bool {
        self.declared
            .read()
            .await
            .queues
            .get(queue)
            .map(|def| def.dead_letter_enabled(self.dead_letter_default))
            .unwrap_or(self.dead_letter_default)
    }

    /// Re-declares everything recorded so far, in dependency order.
    pub async fn reprovision(&self) -> Result<(), AmqpError> {
        let declared = self.declared.read().await.clone();
        if declared.queues.is_empty()
            && declared.exchanges.is_empty()
            && declared.delay_routes.is_empty()
        {
            return Ok(());
        }

        let channel = self.manager.create_channel().await?;
        let result = async {
            for def in declared.exchanges.values() {
                declare_exchange(channel.as_ref(), def).await?;
            }
            for def in declared.queues.values() {
                self.declare_queue(channel.as_ref(), def).await?;
            }
            for (name, route) in &declared.delay_routes {
                declare_delay_queue(channel.as_ref(), name, route).await?;
            }
            Ok::<(), AmqpError>(())
        }
        .await;
        close_quietly(channel).await;
        result?;

        info!(
            queues = declared.queues.len(),
            delay_routes = declared.delay_routes.len(),
            "topology reprovisioned"
        );

        Ok(())
    }

    async fn declare_queue(
        &self,
        channel: &dyn BrokerChannel,
        def: &QueueDefinition,
    ) -> Result<(), AmqpError> {
        debug!(queue = def.name, "creating queue");
        let dead_letter = def.dead_letter_enabled(self.dead_letter_default);

        if dead_letter {
            let dlx = dead_letter_exchange_name(&def.name);
            let dlq = dead_letter_queue_name(&def.name);

            channel
                .exchange_declare(&dlx, ExchangeKind::Direct, true, FieldTable::default())
                .await?;
            channel.queue_declare(&dlq, true, FieldTable::default()).await?;
            channel.queue_bind(&dlq, &dlx, &def.name).await?;
        }

        channel
            .queue_declare(&def.name, true, queue_arguments(def, dead_letter))
            .await?;

        if let Some(binding) = &def.binding {
            declare_exchange(channel, &binding.exchange).await?;
            channel
                .queue_bind(&def.name, &binding.exchange.name, &binding.routing_key)
                .await?;
        }

        debug!(queue = def.name, dead_letter, "queue was created");
        Ok(())
    }
}

#[async_trait]
impl RecoveryHook for TopologyProvisioner {
    async fn on_reconnect(&self) -> Result<(), AmqpError> {
        self.reprovision().await
    }
}

/// Arguments of a main queue.
pub(crate) fn queue_arguments(def: &QueueDefinition, dead_letter: bool) -> FieldTable {
    let mut args = BTreeMap::new();

    if dead_letter {
        args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            AMQPValue::LongString(LongString::from(dead_letter_exchange_name(&def.name))),
        );
        args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            AMQPValue::LongString(LongString::from(def.name.clone())),
        );
    }

    let limits = [
        (AMQP_HEADERS_MESSAGE_TTL, def.ttl),
        (AMQP_HEADERS_MAX_LENGTH, def.max_length),
        (AMQP_HEADERS_MAX_LENGTH_BYTES, def.max_length_bytes),
    ];
    for (key, value) in limits {
        if let Some(value) = value {
            args.insert(
                ShortString::from(key),
                AMQPValue::LongLongInt(LongLongInt::from(value)),
            );
        }
    }

    FieldTable::from(args)
}

/// Arguments of a delay queue: expire after the ttl, then route to the main
/// queue through the default exchange.
pub(crate) fn delay_arguments(queue: &str, ttl_ms: u64) -> FieldTable {
    let mut args = BTreeMap::new();
    args.insert(
        ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
        AMQPValue::LongLongInt(i64::try_from(ttl_ms).unwrap_or(i64::MAX)),
    );
    args.insert(
        ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
        AMQPValue::LongString(LongString::from(DEFAULT_EXCHANGE)),
    );
    args.insert(
        ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
        AMQPValue::LongString(LongString::from(queue)),
    );
    FieldTable::from(args)
}

async fn declare_exchange(
    channel: &dyn BrokerChannel,
    def: &ExchangeDefinition,
) -> Result<(), AmqpError> {
    debug!(exchange = def.name, "creating exchange");
    channel
        .exchange_declare(&def.name, def.kind.clone(), def.durable, def.arguments())
        .await
}

async fn declare_delay_queue(
    channel: &dyn BrokerChannel,
    name: &str,
    route: &DelayRoute,
) -> Result<(), AmqpError> {
    channel
        .queue_declare(name, true, delay_arguments(&route.queue, route.ttl_ms))
        .await
}

async fn close_quietly(channel: Arc<dyn BrokerChannel>) {
    if let Err(err) = channel.close().await {
        debug!(error = err.to_string(), "failure to close topology channel");
    }
}
