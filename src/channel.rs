// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module implements the transport traits over `lapin`: establishing the
//! connection to the RabbitMQ server, creating channels on it, and mapping every
//! channel operation and its errors into the crate's types.

use crate::{
    config::BrokerConfig,
    errors::{from_lapin, AmqpError},
    transport::{
        BrokerChannel, BrokerConnection, Connector, DeliveryStream, ExchangeKind, InboundDelivery,
        LossCallback,
    },
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    types::{FieldTable, LongString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tracing::{debug, error};

const REPLY_SUCCESS: u16 = 200;

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
        }
    }
}

/// Opens `lapin` connections using the broker configuration.
pub struct LapinConnector {
    uri: String,
    connection_name: String,
}

impl LapinConnector {
    pub fn new(cfg: &BrokerConfig) -> LapinConnector {
        LapinConnector {
            uri: cfg.uri(),
            connection_name: cfg.connection_name.clone(),
        }
    }
}

#[async_trait]
impl Connector for LapinConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name.clone()));

        let conn = match Connection::connect(&self.uri, options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }?;
        debug!("amqp connected");

        Ok(Arc::new(LapinConnection { conn }))
    }
}

/// A `lapin` connection.
pub struct LapinConnection {
    conn: Connection,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        debug!("creating amqp channel...");
        match self.conn.create_channel().await {
            Ok(channel) => {
                debug!(id = channel.id(), "channel created");
                Ok(Arc::new(LapinChannel { channel }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.conn.status().connected()
    }

    fn on_lost(&self, callback: LossCallback) {
        self.conn.on_error(move |err| callback(err.to_string()));
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.conn.status().connected() {
            return Ok(());
        }

        self.conn
            .close(REPLY_SUCCESS, "shutdown")
            .await
            .map_err(|err| from_lapin(err, "connection", AmqpError::Transport))
    }
}

/// A `lapin` channel.
pub struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
        args: FieldTable,
    ) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(
                name,
                kind.into(),
                ExchangeDeclareOptions {
                    durable,
                    ..ExchangeDeclareOptions::default()
                },
                args,
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), name, "error to declare the exchange");
                from_lapin(err, name, |_| AmqpError::DeclareExchangeError(name.to_owned()))
            })
    }

    async fn queue_declare(
        &self,
        name: &str,
        durable: bool,
        args: FieldTable,
    ) -> Result<(), AmqpError> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable,
                    ..QueueDeclareOptions::default()
                },
                args,
            )
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), name, "error to declare the queue");
                from_lapin(err, name, |_| AmqpError::DeclareQueueError(name.to_owned()))
            })
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                from_lapin(err, queue, |_| {
                    AmqpError::BindingExchangeToQueueError(exchange.to_owned(), queue.to_owned())
                })
            })
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|err| from_lapin(err, "qos", AmqpError::QoSDeclarationError))
    }

    async fn confirm_select(&self) -> Result<(), AmqpError> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|err| from_lapin(err, "confirm", AmqpError::ChannelError))
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
        await_confirm: bool,
    ) -> Result<(), AmqpError> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                properties,
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error publishing message");
                from_lapin(err, routing_key, AmqpError::PublishingError)
            })?;

        if !await_confirm {
            return Ok(());
        }

        let confirmation = confirm.await.map_err(|err| {
            error!(error = err.to_string(), "error awaiting publisher confirm");
            from_lapin(err, routing_key, AmqpError::PublishingError)
        })?;

        if confirmation.is_nack() {
            return Err(AmqpError::PublishNotConfirmed);
        }

        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                from_lapin(err, queue, AmqpError::ConsumerDeclarationError)
            })?;

        let stream = consumer.map(|result| {
            result
                .map(|delivery| InboundDelivery {
                    delivery_tag: delivery.delivery_tag,
                    redelivered: delivery.redelivered,
                    data: delivery.data,
                    properties: delivery.properties,
                })
                .map_err(|err| AmqpError::Transport(err.to_string()))
        });

        Ok(stream.boxed())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|err| from_lapin(err, consumer_tag, AmqpError::CancelConsumerError))
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.channel.status().connected() {
            return Ok(());
        }

        self.channel
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(|err| from_lapin(err, "channel", AmqpError::Transport))
    }
}
