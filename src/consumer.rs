// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! `MessageConsumer` binds typed handlers to queues. Every subscription owns a
//! dedicated channel (so the prefetch limit applies per subscription) and a
//! tokio task that pulls deliveries and hands them to the handler one at a
//! time.
//!
//! When the delivery stream ends because the channel or the connection went
//! away, the task waits for the connection manager to report a live connection
//! and consumes again under the same consumer tag. Deliveries left unacked on
//! the lost channel are redelivered by the broker.

use crate::{
    config::{BrokerConfig, RetryPolicy},
    connection::ConnectionManager,
    delivery::{self, DeliveryContext, DeliveryOutcome},
    errors::AmqpError,
    handler::MessageHandler,
    otel,
    queue::QueueDefinition,
    registry::{ConsumerRegistry, Registration},
    retry::RetryCoordinator,
    topology::TopologyProvisioner,
    transport::{BrokerChannel, DeliveryStream},
};
use futures_util::StreamExt;
use opentelemetry::global::{self, BoxedTracer};
use serde::de::DeserializeOwned;
use std::{marker::PhantomData, sync::Arc};
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Identifier of a subscription, `<connection-name>.<queue>.<uuid>`.
pub type ConsumerTag = String;

/// Lifecycle of a subscription.
///
/// After a delivery was settled the state reports its outcome until the next
/// delivery arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Waiting for deliveries
    Subscribed,
    /// The handler is running
    Processing,
    Acked,
    RetryScheduled,
    DeadLettered,
    /// Unsubscribed, or stopped because the connection was closed
    Cancelled,
}

impl From<DeliveryOutcome> for SubscriptionState {
    fn from(outcome: DeliveryOutcome) -> Self {
        match outcome {
            DeliveryOutcome::Acked => SubscriptionState::Acked,
            DeliveryOutcome::RetryScheduled | DeliveryOutcome::Requeued => {
                SubscriptionState::RetryScheduled
            }
            DeliveryOutcome::DeadLettered | DeliveryOutcome::Discarded => {
                SubscriptionState::DeadLettered
            }
        }
    }
}

type ChannelSlot = Arc<Mutex<Option<Arc<dyn BrokerChannel>>>>;

/// Control side of a running subscription.
pub struct SubscriptionHandle {
    tag: ConsumerTag,
    queue: String,
    state: watch::Receiver<SubscriptionState>,
    stop: watch::Sender<bool>,
    channel: ChannelSlot,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SubscriptionHandle {
    pub(crate) fn new(
        tag: ConsumerTag,
        queue: String,
        state: watch::Receiver<SubscriptionState>,
        stop: watch::Sender<bool>,
        channel: ChannelSlot,
        task: JoinHandle<()>,
    ) -> Self {
        SubscriptionHandle {
            tag,
            queue,
            state,
            stop,
            channel,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    /// Receiver notified on every state change.
    pub fn watch_state(&self) -> watch::Receiver<SubscriptionState> {
        self.state.clone()
    }

    /// Cancels the broker consumer, then waits for the in-flight handler and
    /// the subscription task to finish.
    pub(crate) async fn cancel(&self) -> Result<(), AmqpError> {
        if self.stop.send_replace(true) {
            debug!(consumer_tag = self.tag, "subscription already cancelled");
        }

        let channel = self.channel.lock().await.clone();
        let mut result = Ok(());
        if let Some(channel) = channel {
            if let Err(err) = channel.basic_cancel(&self.tag).await {
                warn!(error = err.to_string(), consumer_tag = self.tag, "failure to cancel consumer");
                if !err.is_transport() {
                    result = Err(AmqpError::CancelConsumerError(self.tag.clone()));
                }
            }
        }

        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                error!(error = err.to_string(), consumer_tag = self.tag, "subscription task failed");
            }
        }

        result
    }
}

/// Subscribes typed handlers to queues.
pub struct MessageConsumer {
    manager: Arc<ConnectionManager>,
    topology: Arc<TopologyProvisioner>,
    retry: RetryCoordinator,
    registry: Arc<ConsumerRegistry>,
    connection_name: String,
    policy: RetryPolicy,
    default_prefetch: u16,
}

impl MessageConsumer {
    pub fn new(
        manager: Arc<ConnectionManager>,
        topology: Arc<TopologyProvisioner>,
        retry: RetryCoordinator,
        registry: Arc<ConsumerRegistry>,
        cfg: &BrokerConfig,
    ) -> Arc<MessageConsumer> {
        Arc::new(MessageConsumer {
            manager,
            topology,
            retry,
            registry,
            connection_name: cfg.connection_name.clone(),
            policy: cfg.retry_policy(),
            default_prefetch: cfg.prefetch_count,
        })
    }

    /// Starts consuming `queue` with `handler` and returns the consumer tag.
    ///
    /// A queue that was not provisioned yet is declared with the default
    /// definition first. The subscription survives reconnects under the same tag.
    ///
    /// # Parameters
    /// * `queue` - The queue to consume
    /// * `handler` - Called once per delivery; `Ok(true)` acknowledges it, a
    ///   rejection or error goes through the retry policy
    /// * `prefetch` - Bound on unacknowledged deliveries; `None` uses the
    ///   configured default
    ///
    /// # Returns
    /// * `Result<ConsumerTag, AmqpError>` - The tag used to unsubscribe
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
        let prefetch = prefetch.unwrap_or(self.default_prefetch);
        if prefetch == 0 {
            return Err(AmqpError::InvalidConfig(
                "prefetch count must be greater than zero".to_owned(),
            ));
        }

        if !self.topology.is_provisioned(queue).await {
            self.topology.ensure_queue(&QueueDefinition::new(queue)).await?;
        }

        let tag = format!("{}.{}.{}", self.connection_name, queue, Uuid::new_v4());
        let policy = RetryPolicy {
            dead_letter_enabled: self.topology.dead_letter_enabled(queue).await,
            ..self.policy
        };

        let generation = self.manager.generation();
        let (channel, stream) = open(&self.manager, queue, &tag, prefetch).await?;

        let slot: ChannelSlot = Arc::new(Mutex::new(Some(channel.clone())));
        let (state_tx, state_rx) = watch::channel(SubscriptionState::Subscribed);
        let (stop_tx, stop_rx) = watch::channel(false);

        let subscription = Subscription {
            tag: tag.clone(),
            queue: queue.to_owned(),
            prefetch,
            policy,
            manager: self.manager.clone(),
            retry: self.retry.clone(),
            handler: Arc::new(handler),
            channel: slot.clone(),
            state: state_tx,
            tracer: global::tracer(otel::TRACER_NAME),
            _message: PhantomData,
        };

        let task = tokio::spawn(subscription.run(channel, stream, generation, stop_rx));
        let handle = SubscriptionHandle::new(tag.clone(), queue.to_owned(), state_rx, stop_tx, slot, task);

        // a rejected registration drops the handle, which stops the task
        self.registry
            .register(tag.clone(), Registration::new(queue, prefetch, handle))
            .await?;

        info!(queue, consumer_tag = tag, prefetch, "subscribed");
        Ok(tag)
    }

    /// Cancels the subscription identified by `tag`.
    pub async fn unsubscribe(&self, tag: &str) -> Result<(), AmqpError> {
        self.registry.unregister(tag).await
    }

    pub async fn state(&self, tag: &str) -> Option<SubscriptionState> {
        self.registry.state(tag).await
    }
}

struct Subscription<T, H: ?Sized> {
    tag: ConsumerTag,
    queue: String,
    prefetch: u16,
    policy: RetryPolicy,
    manager: Arc<ConnectionManager>,
    retry: RetryCoordinator,
    handler: Arc<H>,
    channel: ChannelSlot,
    state: watch::Sender<SubscriptionState>,
    tracer: BoxedTracer,
    _message: PhantomData<fn() -> T>,
}

impl<T, H> Subscription<T, H>
where
    T: DeserializeOwned + Send + 'static,
    H: MessageHandler<T> + ?Sized + 'static,
{
    async fn run(
        self,
        mut channel: Arc<dyn BrokerChannel>,
        mut stream: DeliveryStream,
        mut generation: u64,
        mut stop: watch::Receiver<bool>,
    ) {
        loop {
            self.consume(channel.as_ref(), &mut stream, &mut stop).await;
            if *stop.borrow() {
                break;
            }

            warn!(queue = self.queue, consumer_tag = self.tag, "delivery stream ended, resubscribing");
            close_quietly(channel.as_ref()).await;

            match self.resubscribe(generation, &mut stop).await {
                Some((next_channel, next_stream, next_generation)) => {
                    channel = next_channel;
                    stream = next_stream;
                    generation = next_generation;
                }
                None => break,
            }
        }

        self.channel.lock().await.take();
        close_quietly(channel.as_ref()).await;
        self.state.send_replace(SubscriptionState::Cancelled);
        info!(queue = self.queue, consumer_tag = self.tag, "subscription stopped");
    }

    /// Handles deliveries until the stream ends or the subscription is stopped.
    /// A delivery already taken from the stream is always settled.
    async fn consume(
        &self,
        channel: &dyn BrokerChannel,
        stream: &mut DeliveryStream,
        stop: &mut watch::Receiver<bool>,
    ) {
        let ctx = DeliveryContext {
            queue: &self.queue,
            channel,
            retry: &self.retry,
            policy: &self.policy,
            tracer: &self.tracer,
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = stopped(stop) => return,
                next = stream.next() => next,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(err)) => {
                    warn!(error = err.to_string(), queue = self.queue, "consumer stream failed");
                    return;
                }
                None => return,
            };

            self.state.send_replace(SubscriptionState::Processing);
            match delivery::process::<T, H>(&ctx, self.handler.as_ref(), delivery).await {
                Ok(outcome) => {
                    self.state.send_replace(outcome.into());
                }
                Err(err) => {
                    // the broker redelivers whatever could not be settled
                    error!(error = err.to_string(), queue = self.queue, "failure to settle delivery");
                    self.state.send_replace(SubscriptionState::Subscribed);
                    if err.is_transport() {
                        return;
                    }
                }
            }
        }
    }

    async fn resubscribe(
        &self,
        mut generation: u64,
        stop: &mut watch::Receiver<bool>,
    ) -> Option<(Arc<dyn BrokerChannel>, DeliveryStream, u64)> {
        self.channel.lock().await.take();

        loop {
            let connected = tokio::select! {
                _ = stopped(stop) => return None,
                connected = self.manager.wait_until_connected(generation) => connected,
            };

            generation = match connected {
                Ok(generation) => generation,
                Err(err) => {
                    info!(error = err.to_string(), queue = self.queue, "connection closed, stopping subscription");
                    return None;
                }
            };

            match open(&self.manager, &self.queue, &self.tag, self.prefetch).await {
                Ok((channel, stream)) => {
                    *self.channel.lock().await = Some(channel.clone());
                    if *stop.borrow() {
                        close_quietly(channel.as_ref()).await;
                        return None;
                    }
                    self.state.send_replace(SubscriptionState::Subscribed);
                    info!(queue = self.queue, consumer_tag = self.tag, generation, "resubscribed");
                    return Some((channel, stream, generation));
                }
                Err(err) if err.is_fatal() => {
                    error!(error = err.to_string(), queue = self.queue, "failure to resubscribe");
                    return None;
                }
                Err(err) => {
                    warn!(error = err.to_string(), queue = self.queue, "resubscribe attempt failed");
                    tokio::select! {
                        _ = stopped(stop) => return None,
                        _ = tokio::time::sleep(self.manager.reconnect_interval()) => {}
                    }
                }
            }
        }
    }
}

/// Opens a dedicated channel with QoS and starts the broker consumer on it.
async fn open(
    manager: &ConnectionManager,
    queue: &str,
    tag: &str,
    prefetch: u16,
) -> Result<(Arc<dyn BrokerChannel>, DeliveryStream), AmqpError> {
    let channel = manager.create_channel().await?;

    let stream = async {
        channel.basic_qos(prefetch).await?;
        channel.basic_consume(queue, tag).await
    }
    .await;

    match stream {
        Ok(stream) => Ok((channel, stream)),
        Err(err) => {
            error!(error = err.to_string(), queue, "error to create the consumer");
            close_quietly(channel.as_ref()).await;
            Err(err)
        }
    }
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            return;
        }
    }
}

async fn close_quietly(channel: &dyn BrokerChannel) {
    if channel.is_open() {
        if let Err(err) = channel.close().await {
            debug!(error = err.to_string(), "failure to close consumer channel");
        }
    }
}
