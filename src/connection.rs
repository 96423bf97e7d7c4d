// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Connection Management
//!
//! `ConnectionManager` owns the single logical connection to the broker and the
//! shared publishing channel derived from it. Components receive the manager by
//! `Arc` and ask it for channels instead of caching them: after a disconnect any
//! previously handed out channel is stale.
//!
//! Lifecycle:
//! 1. `connect` opens the connection; an unreachable broker fails immediately.
//! 2. When the connection drops, a supervisor task sets the status to
//!    `Reconnecting` and retries every `reconnect_interval`.
//! 3. On success the registered recovery hooks run (topology replay) and only
//!    then the status becomes `Connected` with a new generation, which resumes
//!    waiting publishers and consumers.
//! 4. `close` stops the supervisor, closes the shared channel and the connection.

use crate::{
    channel::LapinConnector,
    config::BrokerConfig,
    errors::AmqpError,
    transport::{BrokerChannel, BrokerConnection, Connector, RecoveryHook},
};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, error, info, warn};

/// Observable state of the managed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// A live connection; the generation grows by one on every reconnect
    Connected { generation: u64 },
    /// The connection was lost and the supervisor is trying to restore it
    Reconnecting,
    /// `close` was called; no channel will be handed out anymore
    Closed,
}

struct Live {
    connection: Arc<dyn BrokerConnection>,
    channel: Arc<dyn BrokerChannel>,
    generation: u64,
}

/// Owner of the broker connection and of channel creation.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    reconnect_interval: Duration,
    acquire_timeout: Duration,
    publisher_confirms: bool,
    live: RwLock<Option<Live>>,
    generation: AtomicU64,
    status: watch::Sender<ConnectionStatus>,
    hooks: RwLock<Vec<Arc<dyn RecoveryHook>>>,
    losses: mpsc::UnboundedSender<u64>,
}

impl ConnectionManager {
    /// Connects to the broker described by `cfg` using `lapin`.
    pub async fn connect(cfg: &BrokerConfig) -> Result<Arc<ConnectionManager>, AmqpError> {
        cfg.validate()?;
        Self::with_connector(Arc::new(LapinConnector::new(cfg)), cfg).await
    }

    /// Connects through a custom transport.
    ///
    /// The first connection attempt is not retried: a broker that is
    /// unreachable at startup is a configuration error.
    pub async fn with_connector(
        connector: Arc<dyn Connector>,
        cfg: &BrokerConfig,
    ) -> Result<Arc<ConnectionManager>, AmqpError> {
        let (losses, losses_rx) = mpsc::unbounded_channel();

        let live = establish(connector.as_ref(), &losses, 1, cfg.publisher_confirms)
            .await
            .map_err(|err| match err {
                AmqpError::ConnectionError(_) => err,
                other => AmqpError::ConnectionError(other.to_string()),
            })?;

        let (status, _) = watch::channel(ConnectionStatus::Connected { generation: 1 });

        let manager = Arc::new(ConnectionManager {
            connector,
            reconnect_interval: cfg.reconnect_interval(),
            acquire_timeout: cfg.channel_acquire_timeout(),
            publisher_confirms: cfg.publisher_confirms,
            live: RwLock::new(Some(live)),
            generation: AtomicU64::new(1),
            status,
            hooks: RwLock::new(vec![]),
            losses,
        });

        tokio::spawn(supervise(Arc::downgrade(&manager), losses_rx));
        info!("amqp connection established");

        Ok(manager)
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Receiver notified on every status change, including connection loss.
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    /// Generation of the current (or last) live connection.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn reconnect_interval(&self) -> Duration {
        self.reconnect_interval
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.status.borrow(), ConnectionStatus::Closed)
    }

    /// Registers work replayed after every successful reconnect.
    pub async fn add_recovery_hook(&self, hook: Arc<dyn RecoveryHook>) {
        self.hooks.write().await.push(hook);
    }

    /// Returns the shared publishing channel.
    ///
    /// While reconnecting this waits for the new connection, up to the
    /// configured acquire timeout. A channel closed by the broker is reopened
    /// on the live connection, in confirm mode when confirms are enabled.
    ///
    /// # Returns
    /// * `Result<Arc<dyn BrokerChannel>, AmqpError>` - The channel, or
    ///   `ConnectionUnavailable` after the timeout and `ConnectionClosed` once
    ///   the manager was closed
    pub async fn acquire_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        match tokio::time::timeout(self.acquire_timeout, self.wait_shared_channel()).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    timeout_ms = self.acquire_timeout.as_millis() as u64,
                    "no channel available in time"
                );
                Err(AmqpError::ConnectionUnavailable)
            }
        }
    }

    /// Opens a new channel on the current connection.
    ///
    /// Used for consumers (one channel each, so prefetch applies per
    /// subscription) and for topology declarations.
    pub async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let connection = self
            .live
            .read()
            .await
            .as_ref()
            .map(|live| live.connection.clone());

        match connection {
            Some(connection) => connection.create_channel().await,
            None if self.is_closed() => Err(AmqpError::ConnectionClosed),
            None => Err(AmqpError::ConnectionUnavailable),
        }
    }

    /// Waits until a connection newer than `after_generation` is available.
    ///
    /// If the generation did not change but the connection is alive (only a
    /// channel was closed) it returns the current generation.
    pub async fn wait_until_connected(&self, after_generation: u64) -> Result<u64, AmqpError> {
        let mut status = self.status.subscribe();
        loop {
            let current = *status.borrow_and_update();
            match current {
                ConnectionStatus::Closed => return Err(AmqpError::ConnectionClosed),
                ConnectionStatus::Connected { generation } if generation > after_generation => {
                    return Ok(generation)
                }
                ConnectionStatus::Connected { generation } => {
                    if self.connection_alive().await {
                        return Ok(generation);
                    }
                }
                ConnectionStatus::Reconnecting => {}
            }

            if status.changed().await.is_err() {
                return Err(AmqpError::ConnectionClosed);
            }
        }
    }

    /// Stops reconnecting, closes the shared channel, then the connection.
    pub async fn close(&self) -> Result<(), AmqpError> {
        let mut live = self.live.write().await;
        if self.is_closed() {
            return Ok(());
        }
        self.status.send_replace(ConnectionStatus::Closed);

        if let Some(live) = live.take() {
            info!(generation = live.generation, "closing amqp connection");
            if let Err(err) = live.channel.close().await {
                warn!(error = err.to_string(), "failure to close the shared channel");
            }
            live.connection.close().await?;
        }

        Ok(())
    }

    pub(crate) fn report_lost(&self, generation: u64) {
        if self.losses.send(generation).is_err() {
            debug!("connection supervisor is gone");
        }
    }

    async fn connection_alive(&self) -> bool {
        self.live
            .read()
            .await
            .as_ref()
            .map(|live| live.connection.is_connected())
            .unwrap_or(false)
    }

    async fn wait_shared_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let mut status = self.status.subscribe();
        loop {
            let current = *status.borrow_and_update();
            match current {
                ConnectionStatus::Closed => return Err(AmqpError::ConnectionClosed),
                ConnectionStatus::Reconnecting => {}
                ConnectionStatus::Connected { .. } => {
                    if let Some(channel) = self.shared_channel().await? {
                        return Ok(channel);
                    }
                }
            }

            if status.changed().await.is_err() {
                return Err(AmqpError::ConnectionClosed);
            }
        }
    }

    /// The shared channel, reopened under the write lock if it was closed while
    /// the connection stayed up. `None` when the connection itself is gone.
    async fn shared_channel(&self) -> Result<Option<Arc<dyn BrokerChannel>>, AmqpError> {
        {
            let live = self.live.read().await;
            match live.as_ref() {
                None => return Ok(None),
                Some(live) if live.channel.is_open() => return Ok(Some(live.channel.clone())),
                Some(_) => {}
            }
        }

        let mut live = self.live.write().await;
        let Some(live) = live.as_mut() else {
            return Ok(None);
        };

        if live.channel.is_open() {
            return Ok(Some(live.channel.clone()));
        }

        if !live.connection.is_connected() {
            self.report_lost(live.generation);
            return Ok(None);
        }

        debug!(generation = live.generation, "shared channel closed, reopening");
        let channel = live.connection.create_channel().await?;
        if self.publisher_confirms {
            channel.confirm_select().await?;
        }
        live.channel = channel.clone();

        Ok(Some(channel))
    }

    async fn recover(&self) {
        let lost_generation = self.generation();
        warn!(generation = lost_generation, "amqp connection lost, reconnecting");
        self.status.send_replace(ConnectionStatus::Reconnecting);

        if let Some(old) = self.live.write().await.take() {
            if let Err(err) = old.connection.close().await {
                debug!(error = err.to_string(), "failure to close the lost connection");
            }
        }

        let next_generation = lost_generation.saturating_add(1);
        let mut status = self.status.subscribe();
        let mut attempt: u32 = 0;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.reconnect_interval) => {}
                _ = wait_closed(&mut status) => return,
            }

            attempt = attempt.saturating_add(1);
            let live = match establish(
                self.connector.as_ref(),
                &self.losses,
                next_generation,
                self.publisher_confirms,
            )
            .await
            {
                Ok(live) => live,
                Err(err) => {
                    warn!(attempt, error = err.to_string(), "reconnect attempt failed");
                    continue;
                }
            };

            {
                let mut slot = self.live.write().await;
                if self.is_closed() {
                    drop(slot);
                    if let Err(err) = live.connection.close().await {
                        debug!(error = err.to_string(), "failure to close the new connection");
                    }
                    return;
                }
                *slot = Some(live);
                self.generation.store(next_generation, Ordering::SeqCst);
            }

            let hooks = self.hooks.read().await.clone();
            for hook in hooks {
                if let Err(err) = hook.on_reconnect().await {
                    error!(error = err.to_string(), "recovery hook failed");
                }
            }

            if self.is_closed() {
                return;
            }
            self.status.send_replace(ConnectionStatus::Connected {
                generation: next_generation,
            });
            info!(generation = next_generation, attempt, "amqp connection restored");
            return;
        }
    }
}

async fn establish(
    connector: &dyn Connector,
    losses: &mpsc::UnboundedSender<u64>,
    generation: u64,
    publisher_confirms: bool,
) -> Result<Live, AmqpError> {
    let connection = connector.connect().await?;

    let losses = losses.clone();
    connection.on_lost(Box::new(move |reason| {
        warn!(generation, reason = %reason, "amqp connection error");
        let _ = losses.send(generation);
    }));

    let channel = connection.create_channel().await?;
    if publisher_confirms {
        channel.confirm_select().await?;
    }

    Ok(Live {
        connection,
        channel,
        generation,
    })
}

async fn wait_closed(status: &mut watch::Receiver<ConnectionStatus>) {
    loop {
        if *status.borrow_and_update() == ConnectionStatus::Closed {
            return;
        }
        if status.changed().await.is_err() {
            return;
        }
    }
}

async fn supervise(manager: Weak<ConnectionManager>, mut losses: mpsc::UnboundedReceiver<u64>) {
    while let Some(generation) = losses.recv().await {
        let Some(manager) = manager.upgrade() else {
            break;
        };

        if manager.is_closed() {
            break;
        }

        if manager.generation() != generation
            || manager.status() == ConnectionStatus::Reconnecting
        {
            debug!(generation, "ignoring stale connection loss");
            continue;
        }

        manager.recover().await;
    }

    debug!("connection supervisor stopped");
}
