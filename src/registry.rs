// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Book-keeping of live subscriptions, keyed by consumer tag.

use crate::{
    consumer::{ConsumerTag, SubscriptionHandle, SubscriptionState},
    errors::AmqpError,
};
use futures_util::future::join_all;
use std::collections::HashMap;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// A registered subscription.
pub struct Registration {
    queue: String,
    prefetch: u16,
    handle: SubscriptionHandle,
}

impl Registration {
    pub(crate) fn new(queue: &str, prefetch: u16, handle: SubscriptionHandle) -> Self {
        Registration {
            queue: queue.to_owned(),
            prefetch,
            handle,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn prefetch(&self) -> u16 {
        self.prefetch
    }

    pub fn handle(&self) -> &SubscriptionHandle {
        &self.handle
    }
}

#[derive(Default)]
pub struct ConsumerRegistry {
    entries: Mutex<HashMap<ConsumerTag, Registration>>,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, tag: ConsumerTag, registration: Registration) -> Result<(), AmqpError> {
        let mut entries = self.entries.lock().await;
        prune(&mut entries);
        if entries.contains_key(&tag) {
            warn!(consumer_tag = tag, "consumer tag already registered");
            return Err(AmqpError::ConsumerDeclarationError(tag));
        }

        debug!(consumer_tag = tag, queue = registration.queue, "consumer registered");
        entries.insert(tag, registration);
        Ok(())
    }

    /// Removes the subscription and cancels it, waiting for its in-flight
    /// delivery to be settled.
    pub async fn unregister(&self, tag: &str) -> Result<(), AmqpError> {
        let registration = self.entries.lock().await.remove(tag);

        let Some(registration) = registration else {
            return Err(AmqpError::UnknownConsumer(tag.to_owned()));
        };

        registration.handle.cancel().await?;
        info!(consumer_tag = tag, queue = registration.queue, "unsubscribed");
        Ok(())
    }

    /// Cancels every subscription concurrently. Failures are logged; the
    /// registry is empty afterwards.
    pub async fn unregister_all(&self) {
        let registrations: Vec<_> = self.entries.lock().await.drain().collect();
        if registrations.is_empty() {
            return;
        }

        let count = registrations.len();
        let results = join_all(
            registrations
                .iter()
                .map(|(_, registration)| registration.handle.cancel()),
        )
        .await;

        for ((tag, _), result) in registrations.iter().zip(results) {
            if let Err(err) = result {
                warn!(error = err.to_string(), consumer_tag = tag, "failure to cancel subscription");
            }
        }

        info!(count, "all subscriptions cancelled");
    }

    pub async fn contains(&self, tag: &str) -> bool {
        self.live().await.contains_key(tag)
    }

    pub async fn len(&self) -> usize {
        self.live().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.live().await.is_empty()
    }

    /// `(queue, tag)` pairs of the live subscriptions.
    pub async fn subscriptions(&self) -> Vec<(String, ConsumerTag)> {
        let mut subscriptions: Vec<_> = self
            .live()
            .await
            .iter()
            .map(|(tag, registration)| (registration.queue.clone(), tag.clone()))
            .collect();
        subscriptions.sort();
        subscriptions
    }

    pub async fn state(&self, tag: &str) -> Option<SubscriptionState> {
        self.live()
            .await
            .get(tag)
            .map(|registration| registration.handle.state())
    }

    async fn live(&self) -> MutexGuard<'_, HashMap<ConsumerTag, Registration>> {
        let mut entries = self.entries.lock().await;
        prune(&mut entries);
        entries
    }
}

/// Forgets subscriptions whose task stopped on its own, after the connection
/// was closed or a resubscribe failed for good.
fn prune(entries: &mut HashMap<ConsumerTag, Registration>) {
    entries.retain(|tag, registration| {
        let running = registration.handle.state() != SubscriptionState::Cancelled;
        if !running {
            info!(consumer_tag = tag, queue = registration.queue, "removing stopped subscription");
        }
        running
    });
}
