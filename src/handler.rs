// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Handler contract for typed messages.
//!
//! A handler returns `Ok(true)` when the message was processed. `Ok(false)`, an
//! error or a panic all count as a failed attempt and go through the retry
//! path. Deliveries are at-least-once, so handlers must tolerate seeing the
//! same message (same envelope id) more than once.

use async_trait::async_trait;
use std::future::Future;

/// Error type handlers may fail with.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

#[async_trait]
pub trait MessageHandler<T: Send + 'static>: Send + Sync {
    async fn handle(&self, message: T) -> Result<bool, HandlerError>;
}

#[async_trait]
impl<T, F, Fut> MessageHandler<T> for F
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = Result<bool, HandlerError>> + Send,
{
    async fn handle(&self, message: T) -> Result<bool, HandlerError> {
        (self)(message).await
    }
}
