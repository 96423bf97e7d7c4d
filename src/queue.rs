// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Types describing main queues and the names of the auxiliary queues the
//! reliability layer derives from them:
//!
//! - `<queue>.dlx` / `<queue>.dlq`: dead-letter exchange and queue
//! - `<queue>.delay.<millis>`: TTL queue that dead-letters back into `<queue>`

use crate::exchange::ExchangeDefinition;
use std::time::Duration;

/// Constant for the argument used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the argument used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the argument used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the argument used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the argument used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Name of the dead-letter queue derived from `queue`.
pub fn dead_letter_queue_name(queue: &str) -> String {
    format!("{queue}.dlq")
}

/// Name of the dead-letter exchange derived from `queue`.
pub fn dead_letter_exchange_name(queue: &str) -> String {
    format!("{queue}.dlx")
}

/// Name of the delay queue holding messages for `queue` during `delay`.
pub fn delay_queue_name(queue: &str, delay: Duration) -> String {
    format!("{queue}.delay.{}", delay.as_millis())
}

/// Definition of a main queue.
///
/// Main queues are always durable. Dead-lettering follows the broker
/// configuration unless overridden with [`QueueDefinition::without_dead_letter`].
#[derive(Debug, Clone, PartialEq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) dead_letter: Option<bool>,
    pub(crate) ttl: Option<u32>,
    pub(crate) max_length: Option<u32>,
    pub(crate) max_length_bytes: Option<u32>,
    pub(crate) binding: Option<QueueBinding>,
}

impl QueueDefinition {
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            dead_letter: None,
            ttl: None,
            max_length: None,
            max_length_bytes: None,
            binding: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sets the message Time-To-Live (TTL) for the queue, in milliseconds.
    ///
    /// Expired messages are dead-lettered when a DLQ is configured.
    pub fn ttl(mut self, ttl: u32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(mut self, max: u32) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Sets the maximum size in bytes the queue can hold.
    pub fn max_length_bytes(mut self, max_bytes: u32) -> Self {
        self.max_length_bytes = Some(max_bytes);
        self
    }

    /// Forces a dead-letter queue, whatever the broker configuration says.
    pub fn with_dead_letter(mut self) -> Self {
        self.dead_letter = Some(true);
        self
    }

    pub fn without_dead_letter(mut self) -> Self {
        self.dead_letter = Some(false);
        self
    }

    /// Binds the queue to `exchange` with `routing_key`; publishes addressed to
    /// this queue then go through the exchange.
    pub fn bind(mut self, exchange: ExchangeDefinition, routing_key: &str) -> Self {
        self.binding = Some(QueueBinding {
            exchange,
            routing_key: routing_key.to_owned(),
        });
        self
    }

    pub(crate) fn dead_letter_enabled(&self, default: bool) -> bool {
        self.dead_letter.unwrap_or(default)
    }
}

/// Binding of a main queue to an exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueBinding {
    pub(crate) exchange: ExchangeDefinition,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    pub fn exchange(&self) -> &ExchangeDefinition {
        &self.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }
}
