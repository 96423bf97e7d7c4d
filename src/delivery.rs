// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Processing
//!
//! Handling of a single delivery on a subscription:
//! 1. Rebuilds the envelope from the AMQP properties and opens a consumer span
//! 2. Decodes the typed payload; undecodable payloads skip the handler and are
//!    dead-lettered without consuming a retry
//! 3. Runs the handler, catching panics
//! 4. Acks on success, otherwise asks the retry coordinator to republish and
//!    acks once that succeeded
//! 5. Nacks with requeue when the republish failed, so the message is not lost

use crate::{
    config::RetryPolicy,
    envelope::Envelope,
    errors::AmqpError,
    handler::MessageHandler,
    otel,
    retry::{RetryCoordinator, RetryDecision},
    transport::{BrokerChannel, InboundDelivery},
};
use futures_util::FutureExt;
use opentelemetry::{
    global::{BoxedSpan, BoxedTracer},
    trace::{Span, Status},
};
use serde::de::DeserializeOwned;
use std::{borrow::Cow, panic::AssertUnwindSafe};
use tracing::{debug, error, warn};

/// What happened to a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeliveryOutcome {
    Acked,
    RetryScheduled,
    DeadLettered,
    /// Dropped with a nack; no dead-letter queue for the queue
    Discarded,
    /// Returned to the queue because the republish failed
    Requeued,
}

/// Everything a subscription task shares across its deliveries.
pub(crate) struct DeliveryContext<'a> {
    pub(crate) queue: &'a str,
    pub(crate) channel: &'a dyn BrokerChannel,
    pub(crate) retry: &'a RetryCoordinator,
    pub(crate) policy: &'a RetryPolicy,
    pub(crate) tracer: &'a BoxedTracer,
}

pub(crate) async fn process<T, H>(
    ctx: &DeliveryContext<'_>,
    handler: &H,
    delivery: InboundDelivery,
) -> Result<DeliveryOutcome, AmqpError>
where
    T: DeserializeOwned + Send + 'static,
    H: MessageHandler<T> + ?Sized,
{
    let tag = delivery.delivery_tag;
    let envelope = Envelope::from_delivery(delivery.data, &delivery.properties, ctx.queue);
    let (_otel_ctx, mut span) = otel::new_span(&delivery.properties, ctx.tracer, ctx.queue);

    debug!(
        id = %envelope.id,
        queue = ctx.queue,
        retry_count = envelope.retry_count,
        redelivered = delivery.redelivered,
        "received"
    );

    let message = match envelope.decode::<T>() {
        Ok(message) => message,
        Err(err) => {
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("undecodable payload"),
            });
            let decision = ctx
                .retry
                .handle_poison(&envelope, ctx.queue, ctx.policy, &err.to_string())
                .await;
            return settle(ctx, tag, &envelope, decision, &mut span).await;
        }
    };

    let failure = match AssertUnwindSafe(handler.handle(message))
        .catch_unwind()
        .await
    {
        Ok(Ok(true)) => {
            debug!(id = %envelope.id, "message successfully processed");
            ack(ctx, tag, &mut span).await?;
            span.set_status(Status::Ok);
            return Ok(DeliveryOutcome::Acked);
        }
        Ok(Ok(false)) => "handler reported failure".to_owned(),
        Ok(Err(err)) => err.to_string(),
        Err(_) => {
            error!(id = %envelope.id, queue = ctx.queue, "handler panicked");
            "handler panicked".to_owned()
        }
    };

    span.set_status(Status::Error {
        description: Cow::from(failure.clone()),
    });

    let decision = ctx
        .retry
        .handle_failure(&envelope, ctx.queue, ctx.policy, &failure)
        .await;
    settle(ctx, tag, &envelope, decision, &mut span).await
}

async fn settle(
    ctx: &DeliveryContext<'_>,
    tag: u64,
    envelope: &Envelope,
    decision: Result<RetryDecision, AmqpError>,
    span: &mut BoxedSpan,
) -> Result<DeliveryOutcome, AmqpError> {
    match decision {
        Ok(RetryDecision::Requeue { .. }) => {
            ack(ctx, tag, span).await?;
            Ok(DeliveryOutcome::RetryScheduled)
        }
        Ok(RetryDecision::DeadLetter) => {
            ack(ctx, tag, span).await?;
            Ok(DeliveryOutcome::DeadLettered)
        }
        Ok(RetryDecision::Discard) => {
            nack(ctx, tag, false, span).await?;
            Ok(DeliveryOutcome::Discarded)
        }
        Err(err) => {
            warn!(
                error = err.to_string(),
                id = %envelope.id,
                "republish failed, returning message to the queue"
            );
            span.record_error(&err);
            nack(ctx, tag, true, span).await?;
            Ok(DeliveryOutcome::Requeued)
        }
    }
}

async fn ack(ctx: &DeliveryContext<'_>, tag: u64, span: &mut BoxedSpan) -> Result<(), AmqpError> {
    ctx.channel.basic_ack(tag).await.inspect_err(|err| {
        error!(error = err.to_string(), "error whiling ack msg");
        span.record_error(err);
        span.set_status(Status::Error {
            description: Cow::from("error to ack msg"),
        });
    })
}

async fn nack(
    ctx: &DeliveryContext<'_>,
    tag: u64,
    requeue: bool,
    span: &mut BoxedSpan,
) -> Result<(), AmqpError> {
    ctx.channel
        .basic_nack(tag, requeue)
        .await
        .inspect_err(|err| {
            error!(error = err.to_string(), requeue, "error whiling nack msg");
            span.record_error(err);
            span.set_status(Status::Error {
                description: Cow::from("error to nack msg"),
            });
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        handler::HandlerError,
        publisher::{MockPublisher, Route},
        transport::MockBrokerChannel,
    };
    use mockall::predicate::eq;
    use opentelemetry::global;
    use serde::{Deserialize, Serialize};
    use std::{
        collections::BTreeMap,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    #[derive(Debug, Serialize, Deserialize)]
    struct Order {
        id: u32,
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            retry_delay: Duration::from_secs(5),
            dead_letter_enabled: true,
        }
    }

    fn delivery(payload: &[u8], retry_count: u32) -> InboundDelivery {
        let envelope = Envelope {
            retry_count,
            ..Envelope::from_payload(payload.to_vec(), "orders")
        };
        InboundDelivery {
            delivery_tag: 42,
            redelivered: false,
            data: envelope.payload.clone(),
            properties: envelope.to_properties(true, BTreeMap::new()),
        }
    }

    async fn run<H: MessageHandler<Order>>(
        channel: MockBrokerChannel,
        publisher: MockPublisher,
        policy: RetryPolicy,
        handler: &H,
        delivery: InboundDelivery,
    ) -> Result<DeliveryOutcome, AmqpError> {
        let retry = RetryCoordinator::new(Arc::new(publisher));
        let tracer = global::tracer("test");
        let ctx = DeliveryContext {
            queue: "orders",
            channel: &channel,
            retry: &retry,
            policy: &policy,
            tracer: &tracer,
        };
        process(&ctx, handler, delivery).await
    }

    #[tokio::test]
    async fn successful_handler_acks() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_basic_ack()
            .with(eq(42))
            .times(1)
            .returning(|_| Ok(()));
        let mut publisher = MockPublisher::new();
        publisher.expect_publish_envelope().never();

        let handler = |order: Order| async move { Ok::<bool, HandlerError>(order.id == 7) };
        let outcome = run(channel, publisher, policy(), &handler, delivery(br#"{"id":7}"#, 0))
            .await
            .unwrap();

        assert_eq!(outcome, DeliveryOutcome::Acked);
    }

    #[tokio::test]
    async fn failing_handler_schedules_retry_then_acks() {
        let mut channel = MockBrokerChannel::new();
        channel.expect_basic_ack().times(1).returning(|_| Ok(()));
        let mut publisher = MockPublisher::new();
        publisher
            .expect_publish_envelope()
            .withf(|env, route| {
                env.retry_count == 1 && *route == Route::Delayed(Duration::from_secs(5))
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let handler = |_: Order| async move { Err::<bool, HandlerError>("downstream timeout".into()) };
        let outcome = run(channel, publisher, policy(), &handler, delivery(br#"{"id":1}"#, 0))
            .await
            .unwrap();

        assert_eq!(outcome, DeliveryOutcome::RetryScheduled);
    }

    #[tokio::test]
    async fn panicking_handler_counts_as_failure() {
        let mut channel = MockBrokerChannel::new();
        channel.expect_basic_ack().times(1).returning(|_| Ok(()));
        let mut publisher = MockPublisher::new();
        publisher
            .expect_publish_envelope()
            .times(1)
            .returning(|_, _| Ok(()));

        let handler = |order: Order| async move {
            if order.id > 0 {
                panic!("unexpected order");
            }
            Ok::<bool, HandlerError>(true)
        };
        let outcome = run(channel, publisher, policy(), &handler, delivery(br#"{"id":1}"#, 0))
            .await
            .unwrap();

        assert_eq!(outcome, DeliveryOutcome::RetryScheduled);
    }

    #[tokio::test]
    async fn undecodable_payload_skips_handler() {
        let invocations = AtomicUsize::new(0);
        let mut channel = MockBrokerChannel::new();
        channel.expect_basic_ack().times(1).returning(|_| Ok(()));
        let mut publisher = MockPublisher::new();
        publisher
            .expect_publish_envelope()
            .withf(|env, route| env.retry_count == 0 && *route == Route::DeadLetter)
            .times(1)
            .returning(|_, _| Ok(()));

        let handler = |_: Order| {
            invocations.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<bool, HandlerError>(true) }
        };
        let outcome = run(channel, publisher, policy(), &handler, delivery(b"not json", 0))
            .await
            .unwrap();

        assert_eq!(outcome, DeliveryOutcome::DeadLettered);
        assert_eq!(invocations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_republish_requeues_the_delivery() {
        let mut channel = MockBrokerChannel::new();
        channel.expect_basic_ack().never();
        channel
            .expect_basic_nack()
            .with(eq(42), eq(true))
            .times(1)
            .returning(|_, _| Ok(()));
        let mut publisher = MockPublisher::new();
        publisher
            .expect_publish_envelope()
            .returning(|_, _| Err(AmqpError::ConnectionUnavailable));

        let handler = |_: Order| async move { Ok::<bool, HandlerError>(false) };
        let outcome = run(channel, publisher, policy(), &handler, delivery(br#"{"id":1}"#, 0))
            .await
            .unwrap();

        assert_eq!(outcome, DeliveryOutcome::Requeued);
    }

    #[tokio::test]
    async fn exhausted_without_dlq_is_dropped() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_basic_nack()
            .with(eq(42), eq(false))
            .times(1)
            .returning(|_, _| Ok(()));
        let mut publisher = MockPublisher::new();
        publisher.expect_publish_envelope().never();
        let policy = RetryPolicy {
            dead_letter_enabled: false,
            ..policy()
        };

        let handler = |_: Order| async move { Ok::<bool, HandlerError>(false) };
        let outcome = run(channel, publisher, policy, &handler, delivery(br#"{"id":1}"#, 3))
            .await
            .unwrap();

        assert_eq!(outcome, DeliveryOutcome::Discarded);
    }
}
