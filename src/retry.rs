// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry and Dead-Letter Routing
//!
//! Decides what happens to a delivery whose handler failed. The retry counter
//! travels in the envelope, so the decision only depends on the envelope and
//! the queue's [`RetryPolicy`]:
//!
//! - below the budget, a copy with `retry_count + 1` is republished through the
//!   delay route of the queue and becomes visible again after `retry_delay`
//! - at the budget, the envelope is published unchanged to `<queue>.dlq` with
//!   its dead-letter reason recorded in the metadata
//!
//! The original delivery is only acknowledged by the caller once the republish
//! succeeded.

use crate::{
    config::RetryPolicy,
    envelope::{DeadLetterReason, Envelope},
    errors::AmqpError,
    publisher::{Publisher, Route},
    queue::dead_letter_queue_name,
};
use std::{sync::Arc, time::Duration};
use tracing::{error, warn};

/// Outcome of a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Republished for another attempt after `delay`
    Requeue { delay: Duration },
    /// Published to the dead-letter queue
    DeadLetter,
    /// Dead-lettering is disabled for the queue; the delivery is dropped
    Discard,
}

/// Republishes failed envelopes for retry or dead-lettering.
#[derive(Clone)]
pub struct RetryCoordinator {
    publisher: Arc<dyn Publisher>,
}

impl RetryCoordinator {
    pub fn new(publisher: Arc<dyn Publisher>) -> Self {
        RetryCoordinator { publisher }
    }

    /// The decision for an envelope already retried `retry_count` times.
    pub fn decide(retry_count: u32, policy: &RetryPolicy) -> RetryDecision {
        if retry_count < policy.max_attempts {
            RetryDecision::Requeue {
                delay: policy.retry_delay,
            }
        } else if policy.dead_letter_enabled {
            RetryDecision::DeadLetter
        } else {
            RetryDecision::Discard
        }
    }

    /// Schedules another attempt of `envelope` on `queue`, or dead-letters it
    /// when the retry budget is spent.
    pub async fn handle_failure(
        &self,
        envelope: &Envelope,
        queue: &str,
        policy: &RetryPolicy,
        failure: &str,
    ) -> Result<RetryDecision, AmqpError> {
        let decision = Self::decide(envelope.retry_count, policy);

        match decision {
            RetryDecision::Requeue { delay } => {
                let next = envelope.next_attempt(queue);
                warn!(
                    id = %envelope.id,
                    queue,
                    attempt = next.retry_count,
                    delay_ms = delay.as_millis() as u64,
                    failure,
                    "error handling message, scheduling retry"
                );
                self.publisher
                    .publish_envelope(&next, Route::for_delay(Some(delay)))
                    .await?;
            }
            RetryDecision::DeadLetter => {
                error!(
                    id = %envelope.id,
                    queue,
                    retries = envelope.retry_count,
                    "too many attempts, sending to dlq"
                );
                self.dead_letter(
                    envelope,
                    queue,
                    DeadLetterReason::MaxRetriesExceeded,
                    Some(failure),
                )
                .await?;
            }
            RetryDecision::Discard => {
                error!(
                    id = %envelope.id,
                    queue,
                    retries = envelope.retry_count,
                    failure,
                    "too many attempts and no dlq configured, discarding message"
                );
            }
        }

        Ok(decision)
    }

    /// Dead-letters an envelope the handler can never process.
    ///
    /// The retry counter is left untouched.
    pub async fn handle_poison(
        &self,
        envelope: &Envelope,
        queue: &str,
        policy: &RetryPolicy,
        failure: &str,
    ) -> Result<RetryDecision, AmqpError> {
        if !policy.dead_letter_enabled {
            error!(id = %envelope.id, queue, failure, "undecodable message and no dlq configured, discarding");
            return Ok(RetryDecision::Discard);
        }

        error!(id = %envelope.id, queue, failure, "undecodable message, sending to dlq");
        self.dead_letter(envelope, queue, DeadLetterReason::DecodeFailure, Some(failure))
            .await?;

        Ok(RetryDecision::DeadLetter)
    }

    /// Publishes `envelope` to the dead-letter queue of `queue`.
    pub async fn dead_letter(
        &self,
        envelope: &Envelope,
        queue: &str,
        reason: DeadLetterReason,
        detail: Option<&str>,
    ) -> Result<(), AmqpError> {
        let dead = envelope.dead_lettered(queue, reason, detail);

        self.publisher
            .publish_envelope(&dead, Route::DeadLetter)
            .await
            .map_err(|err| {
                error!(error = err.to_string(), id = %envelope.id, "error whiling sending to dlq");
                AmqpError::PublishingToDLQError(dead_letter_queue_name(queue))
            })
    }
}
