// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Reliable messaging on top of AMQP 0-9-1: bounded retries through delay
//! queues, dead-letter queues, publisher confirms and automatic recovery of
//! connections, topology and subscriptions.

mod delivery;
mod otel;

pub mod channel;
pub mod client;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod envelope;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod publisher;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod topology;
pub mod transport;

pub use client::AmqpClient;
pub use config::{BrokerConfig, RetryPolicy};
pub use connection::{ConnectionManager, ConnectionStatus};
pub use consumer::{ConsumerTag, MessageConsumer, SubscriptionState};
pub use envelope::Envelope;
pub use errors::AmqpError;
pub use handler::{HandlerError, MessageHandler};
pub use publisher::{MessagePublisher, PublishOptions, Publisher, Route};
pub use queue::QueueDefinition;
pub use retry::{RetryCoordinator, RetryDecision};
pub use topology::TopologyProvisioner;
