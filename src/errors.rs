// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the AMQP Reliability Layer
//!
//! This module provides the error type shared by every component of the crate.
//! The `AmqpError` enum covers connection lifecycle, topology declaration,
//! publishing, consuming and payload (de)serialization failures. Helpers classify
//! an error as a transient transport failure (recovered by reconnecting) or as a
//! fatal configuration failure (surfaced to the caller and never retried).

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error: {0}")]
    InternalError(String),

    /// Invalid configuration values
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// The connection manager was closed and will not hand out channels anymore
    #[error("connection closed")]
    ConnectionClosed,

    /// No live connection became available in time
    #[error("connection unavailable")]
    ConnectionUnavailable,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// The connection or channel was lost while an operation was in flight
    #[error("transport failure: {0}")]
    Transport(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// An existing queue or exchange was declared with incompatible arguments
    #[error("topology mismatch for `{0}`")]
    TopologyMismatch(String),

    /// Error binding an exchange to a queue
    #[error("failure to bind exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// The broker negatively acknowledged a publish
    #[error("publish was not confirmed by the broker")]
    PublishNotConfirmed,

    /// Error serializing a message payload
    #[error("failure to serialize payload: {0}")]
    SerializePayloadError(String),

    /// Error parsing a message payload
    #[error("failure to parse payload: {0}")]
    ParsePayloadError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error publishing a message to the Dead Letter Queue (DLQ)
    #[error("failure to publish to dlq `{0}`")]
    PublishingToDLQError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer
    #[error("consumer declaration error `{0}`")]
    ConsumerDeclarationError(String),

    /// Error cancelling a consumer
    #[error("failure to cancel consumer `{0}`")]
    CancelConsumerError(String),

    /// The consumer tag is not registered
    #[error("unknown consumer `{0}`")]
    UnknownConsumer(String),
}

impl AmqpError {
    /// Whether the failure came from a lost connection or channel.
    ///
    /// Transport failures are recovered by the connection manager and are worth
    /// retrying once a channel is re-acquired.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            AmqpError::Transport(_)
                | AmqpError::ChannelError(_)
                | AmqpError::ConnectionUnavailable
        )
    }

    /// Whether the failure is a configuration problem that must not be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AmqpError::InvalidConfig(_)
                | AmqpError::ConnectionError(_)
                | AmqpError::ConnectionClosed
                | AmqpError::TopologyMismatch(_)
        )
    }
}

/// Maps a lapin error into the crate error, keeping the transport/fatal split.
///
/// `fallback` builds the operation specific variant used when the failure is
/// neither a transport loss nor a precondition failure.
pub(crate) fn from_lapin(
    err: lapin::Error,
    name: &str,
    fallback: impl FnOnce(String) -> AmqpError,
) -> AmqpError {
    match err {
        lapin::Error::InvalidChannelState(_)
        | lapin::Error::InvalidConnectionState(_)
        | lapin::Error::InvalidChannel(_)
        | lapin::Error::IOError(_) => AmqpError::Transport(err.to_string()),
        other => {
            let msg = other.to_string();
            if msg.contains("PRECONDITION_FAILED") || msg.contains("PRECONDITION-FAILED") {
                AmqpError::TopologyMismatch(name.to_owned())
            } else {
                fallback(msg)
            }
        }
    }
}
