// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transport
//!
//! The narrow set of AMQP operations the reliability layer needs, expressed as
//! traits so the connection manager, topology, publisher and consumers are
//! independent of the client library. The production implementation over
//! `lapin` lives in [`crate::channel`].

use crate::errors::AmqpError;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lapin::{types::FieldTable, BasicProperties};
use std::sync::Arc;

/// Stream of deliveries for one broker consumer. It ends when the consumer is
/// cancelled or its channel goes away.
pub type DeliveryStream = BoxStream<'static, Result<InboundDelivery, AmqpError>>;

/// Callback invoked once when a connection is lost, with a description of the cause.
pub type LossCallback = Box<dyn Fn(String) + Send + Sync>;

/// A message handed to a consumer.
#[derive(Debug, Clone)]
pub struct InboundDelivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub data: Vec<u8>,
    pub properties: BasicProperties,
}

/// Exchange types understood by the broker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

/// Opens connections to the broker.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError>;
}

/// One logical connection to the broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    fn is_connected(&self) -> bool;

    /// Registers the callback fired when the connection drops unexpectedly.
    fn on_lost(&self, callback: LossCallback);

    async fn close(&self) -> Result<(), AmqpError>;
}

/// A channel on a connection. Implementations are not expected to serialize
/// concurrent writers; callers do.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn is_open(&self) -> bool;

    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
        args: FieldTable,
    ) -> Result<(), AmqpError>;

    async fn queue_declare(
        &self,
        name: &str,
        durable: bool,
        args: FieldTable,
    ) -> Result<(), AmqpError>;

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError>;

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    /// Puts the channel in publisher confirm mode.
    async fn confirm_select(&self) -> Result<(), AmqpError>;

    /// Publishes a message; when `await_confirm` is set it returns only after the
    /// broker acknowledged it.
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
        await_confirm: bool,
    ) -> Result<(), AmqpError>;

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// Work re-run by the connection manager after a successful reconnect, before
/// the connection is reported as available again.
#[async_trait]
pub trait RecoveryHook: Send + Sync {
    async fn on_reconnect(&self) -> Result<(), AmqpError>;
}
