// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelope
//!
//! The envelope is the wire-level unit of work: an opaque JSON payload plus the
//! delivery metadata the reliability layer relies on. Identity, correlation and
//! the retry counter travel in AMQP properties and headers so that any instance
//! of the retry coordinator can make its decision from the delivery alone.
//!
//! Header layout:
//! - `message_id` property: envelope id
//! - `correlation_id` property: correlation id
//! - `timestamp` property: creation time in epoch seconds
//! - `x-created-at`: creation time in epoch milliseconds
//! - `x-retry-count`: number of times the message was requeued after a failure
//! - `x-destination`: logical queue the message is addressed to
//! - `x-metadata`: nested table with the caller supplied key/value context

use crate::errors::AmqpError;
use chrono::{DateTime, TimeZone, Utc};
use lapin::{
    types::{AMQPValue, FieldTable, LongLongInt, LongString, ShortString},
    BasicProperties,
};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use tracing::warn;
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// AMQP delivery mode for messages that survive a broker restart
pub const DELIVERY_MODE_PERSISTENT: u8 = 2;
/// AMQP delivery mode for transient messages
pub const DELIVERY_MODE_TRANSIENT: u8 = 1;

pub const HEADER_RETRY_COUNT: &str = "x-retry-count";
pub const HEADER_CREATED_AT: &str = "x-created-at";
pub const HEADER_DESTINATION: &str = "x-destination";
pub const HEADER_METADATA: &str = "x-metadata";

/// Metadata key set on every envelope published to a dead-letter queue
pub const METADATA_DEAD_LETTER_REASON: &str = "x-dead-letter-reason";
/// Metadata key carrying the last failure description of a dead-lettered envelope
pub const METADATA_DEAD_LETTER_ERROR: &str = "x-dead-letter-error";

/// Why an envelope was moved to the dead-letter queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterReason {
    /// The handler kept failing until the retry budget was exhausted
    MaxRetriesExceeded,
    /// The payload could not be decoded into the handler's message type
    DecodeFailure,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterReason::MaxRetriesExceeded => "max-retries-exceeded",
            DeadLetterReason::DecodeFailure => "decode-failure",
        }
    }
}

/// A message plus its delivery metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub id: Uuid,
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub correlation_id: String,
    pub metadata: BTreeMap<String, String>,
    pub retry_count: u32,
    pub destination: String,
}

impl Envelope {
    /// Serializes `message` as JSON into a fresh envelope addressed to `destination`.
    ///
    /// The id and the correlation id are freshly generated, the retry counter
    /// starts at zero.
    pub fn new<T: Serialize + ?Sized>(message: &T, destination: &str) -> Result<Envelope, AmqpError> {
        let payload = serde_json::to_vec(message)
            .map_err(|err| AmqpError::SerializePayloadError(err.to_string()))?;

        Ok(Envelope::from_payload(payload, destination))
    }

    /// Wraps already encoded bytes.
    pub fn from_payload(payload: Vec<u8>, destination: &str) -> Envelope {
        let id = Uuid::new_v4();
        Envelope {
            id,
            payload,
            created_at: Utc::now(),
            correlation_id: id.to_string(),
            metadata: BTreeMap::new(),
            retry_count: 0,
            destination: destination.to_owned(),
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn with_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata.extend(metadata);
        self
    }

    /// Decodes the JSON payload into the handler's message type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, AmqpError> {
        serde_json::from_slice(&self.payload)
            .map_err(|err| AmqpError::ParsePayloadError(err.to_string()))
    }

    /// The reason recorded when the envelope was dead-lettered, if any.
    pub fn dead_letter_reason(&self) -> Option<&str> {
        self.metadata
            .get(METADATA_DEAD_LETTER_REASON)
            .map(String::as_str)
    }

    /// Copy for the next delivery attempt against `queue`.
    pub(crate) fn next_attempt(&self, queue: &str) -> Envelope {
        Envelope {
            retry_count: self.retry_count.saturating_add(1),
            destination: queue.to_owned(),
            ..self.clone()
        }
    }

    /// Copy marked as terminally failed, retry counter untouched.
    pub(crate) fn dead_lettered(
        &self,
        queue: &str,
        reason: DeadLetterReason,
        detail: Option<&str>,
    ) -> Envelope {
        let mut envelope = Envelope {
            destination: queue.to_owned(),
            ..self.clone()
        };
        envelope.metadata.insert(
            METADATA_DEAD_LETTER_REASON.to_owned(),
            reason.as_str().to_owned(),
        );
        if let Some(detail) = detail {
            envelope
                .metadata
                .insert(METADATA_DEAD_LETTER_ERROR.to_owned(), detail.to_owned());
        }
        envelope
    }

    /// Builds the AMQP properties carrying this envelope.
    ///
    /// `headers` may already contain entries (trace propagation); the envelope
    /// headers are added on top of them.
    pub fn to_properties(
        &self,
        persistent: bool,
        mut headers: BTreeMap<ShortString, AMQPValue>,
    ) -> BasicProperties {
        headers.insert(
            ShortString::from(HEADER_RETRY_COUNT),
            AMQPValue::LongLongInt(LongLongInt::from(self.retry_count)),
        );
        headers.insert(
            ShortString::from(HEADER_CREATED_AT),
            AMQPValue::LongLongInt(self.created_at.timestamp_millis()),
        );
        headers.insert(
            ShortString::from(HEADER_DESTINATION),
            AMQPValue::LongString(LongString::from(self.destination.clone())),
        );

        let metadata: BTreeMap<ShortString, AMQPValue> = self
            .metadata
            .iter()
            .map(|(k, v)| {
                (
                    ShortString::from(k.clone()),
                    AMQPValue::LongString(LongString::from(v.clone())),
                )
            })
            .collect();
        headers.insert(
            ShortString::from(HEADER_METADATA),
            AMQPValue::FieldTable(FieldTable::from(metadata)),
        );

        let delivery_mode = if persistent {
            DELIVERY_MODE_PERSISTENT
        } else {
            DELIVERY_MODE_TRANSIENT
        };

        BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_delivery_mode(delivery_mode)
            .with_message_id(ShortString::from(self.id.to_string()))
            .with_correlation_id(ShortString::from(self.correlation_id.clone()))
            .with_timestamp(u64::try_from(self.created_at.timestamp()).unwrap_or_default())
            .with_headers(FieldTable::from(headers))
    }

    /// Rebuilds the envelope from a delivery.
    ///
    /// Messages published by foreign producers may lack the envelope headers:
    /// a missing id is replaced by a new one, a missing destination falls back to
    /// `queue`, and a missing retry counter reads as zero.
    pub fn from_delivery(data: Vec<u8>, props: &BasicProperties, queue: &str) -> Envelope {
        let headers = props.headers().clone().unwrap_or_default();
        let headers = headers.inner();

        let id = match props
            .message_id()
            .as_ref()
            .map(|v| Uuid::parse_str(v.as_str()))
        {
            Some(Ok(id)) => id,
            _ => {
                let id = Uuid::new_v4();
                warn!(id = %id, queue, "delivery without a valid message id, assigning one");
                id
            }
        };

        let correlation_id = props
            .correlation_id()
            .as_ref()
            .map(|v| v.to_string())
            .unwrap_or_else(|| id.to_string());

        let created_at = headers
            .get(HEADER_CREATED_AT)
            .and_then(as_i64)
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .or_else(|| {
                (*props.timestamp())
                    .and_then(|secs| i64::try_from(secs).ok())
                    .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            })
            .unwrap_or_else(Utc::now);

        let retry_count = headers
            .get(HEADER_RETRY_COUNT)
            .and_then(as_i64)
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or_default();

        let destination = headers
            .get(HEADER_DESTINATION)
            .and_then(as_string)
            .unwrap_or_else(|| queue.to_owned());

        let metadata = headers
            .get(HEADER_METADATA)
            .and_then(|v| v.as_field_table())
            .map(|table| {
                table
                    .inner()
                    .iter()
                    .filter_map(|(k, v)| as_string(v).map(|v| (k.to_string(), v)))
                    .collect()
            })
            .unwrap_or_default();

        Envelope {
            id,
            payload: data,
            created_at,
            correlation_id,
            metadata,
            retry_count,
            destination,
        }
    }
}

fn as_i64(value: &AMQPValue) -> Option<i64> {
    match value {
        AMQPValue::ShortShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongInt(v) => Some(i64::from(*v)),
        AMQPValue::LongUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongLongInt(v) => Some(*v),
        AMQPValue::Timestamp(v) => i64::try_from(*v).ok(),
        _ => None,
    }
}

fn as_string(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(v) => std::str::from_utf8(v.as_bytes()).ok().map(str::to_owned),
        AMQPValue::ShortString(v) => Some(v.to_string()),
        _ => None,
    }
}
