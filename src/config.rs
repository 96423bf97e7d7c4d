// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Configuration
//!
//! `BrokerConfig` is the configuration surface consumed from the host
//! application: broker credentials, reconnect behaviour and the retry policy
//! applied by consumers. It deserializes with `serde` (every field defaulted) so
//! it can be embedded in any application config file, and can also be read from
//! `AMQP_*` environment variables.

use crate::errors::AmqpError;
use serde::{Deserialize, Serialize};
use std::{str::FromStr, time::Duration};

pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 5_000;
pub const DEFAULT_PREFETCH_COUNT: u16 = 10;
pub const DEFAULT_RECONNECT_INTERVAL_MS: u64 = 10_000;
pub const DEFAULT_CHANNEL_ACQUIRE_TIMEOUT_MS: u64 = 30_000;

/// Connection and reliability settings for the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,

    /// Name reported to the broker, also used as the consumer tag prefix
    pub connection_name: String,

    /// Handler retries before a message is dead-lettered
    pub max_retry_attempts: u32,

    /// Fixed delay between a failure and the next delivery attempt
    pub retry_delay_ms: u64,

    pub dead_letter_enabled: bool,

    /// Unacknowledged deliveries a subscription may hold
    pub prefetch_count: u16,

    /// Interval between reconnect attempts after a connection loss
    pub reconnect_interval_ms: u64,

    /// Wait for broker acks on every publish
    pub publisher_confirms: bool,

    /// How long a publish waits for a channel while reconnecting
    pub channel_acquire_timeout_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: String::new(),
            connection_name: "amqp-reliability".to_owned(),
            max_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            dead_letter_enabled: true,
            prefetch_count: DEFAULT_PREFETCH_COUNT,
            reconnect_interval_ms: DEFAULT_RECONNECT_INTERVAL_MS,
            publisher_confirms: true,
            channel_acquire_timeout_ms: DEFAULT_CHANNEL_ACQUIRE_TIMEOUT_MS,
        }
    }
}

impl BrokerConfig {
    /// Reads the configuration from `AMQP_*` environment variables.
    ///
    /// Unset or unparsable variables keep their default value:
    /// `AMQP_HOST`, `AMQP_PORT`, `AMQP_USER`, `AMQP_PASSWORD`, `AMQP_VHOST`,
    /// `AMQP_CONNECTION_NAME`, `AMQP_MAX_RETRY_ATTEMPTS`, `AMQP_RETRY_DELAY_MS`,
    /// `AMQP_DEAD_LETTER_ENABLED`, `AMQP_PREFETCH_COUNT`,
    /// `AMQP_RECONNECT_INTERVAL_MS`, `AMQP_PUBLISHER_CONFIRMS`,
    /// `AMQP_CHANNEL_ACQUIRE_TIMEOUT_MS`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        Self {
            host: lookup("AMQP_HOST").unwrap_or(defaults.host),
            port: parsed(&lookup, "AMQP_PORT").unwrap_or(defaults.port),
            user: lookup("AMQP_USER").unwrap_or(defaults.user),
            password: lookup("AMQP_PASSWORD").unwrap_or(defaults.password),
            vhost: lookup("AMQP_VHOST").unwrap_or(defaults.vhost),
            connection_name: lookup("AMQP_CONNECTION_NAME").unwrap_or(defaults.connection_name),
            max_retry_attempts: parsed(&lookup, "AMQP_MAX_RETRY_ATTEMPTS")
                .unwrap_or(defaults.max_retry_attempts),
            retry_delay_ms: parsed(&lookup, "AMQP_RETRY_DELAY_MS")
                .unwrap_or(defaults.retry_delay_ms),
            dead_letter_enabled: parsed(&lookup, "AMQP_DEAD_LETTER_ENABLED")
                .unwrap_or(defaults.dead_letter_enabled),
            prefetch_count: parsed(&lookup, "AMQP_PREFETCH_COUNT")
                .unwrap_or(defaults.prefetch_count),
            reconnect_interval_ms: parsed(&lookup, "AMQP_RECONNECT_INTERVAL_MS")
                .unwrap_or(defaults.reconnect_interval_ms),
            publisher_confirms: parsed(&lookup, "AMQP_PUBLISHER_CONFIRMS")
                .unwrap_or(defaults.publisher_confirms),
            channel_acquire_timeout_ms: parsed(&lookup, "AMQP_CHANNEL_ACQUIRE_TIMEOUT_MS")
                .unwrap_or(defaults.channel_acquire_timeout_ms),
        }
    }

    /// Composes the AMQP URI from the connection fields.
    pub fn uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.vhost
        )
    }

    /// Checks the values that would otherwise fail late at the broker.
    pub fn validate(&self) -> Result<(), AmqpError> {
        if self.host.trim().is_empty() {
            return Err(AmqpError::InvalidConfig("host must not be empty".to_owned()));
        }
        if self.prefetch_count == 0 {
            return Err(AmqpError::InvalidConfig(
                "prefetch_count must be greater than zero".to_owned(),
            ));
        }
        if self.reconnect_interval_ms == 0 {
            return Err(AmqpError::InvalidConfig(
                "reconnect_interval_ms must be greater than zero".to_owned(),
            ));
        }
        if u32::try_from(self.retry_delay_ms).is_err() {
            return Err(AmqpError::InvalidConfig(
                "retry_delay_ms does not fit a queue ttl".to_owned(),
            ));
        }
        Ok(())
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = user.into();
        self.password = password.into();
        self
    }

    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = name.into();
        self
    }

    pub fn with_max_retry_attempts(mut self, attempts: u32) -> Self {
        self.max_retry_attempts = attempts;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay_ms = duration_millis(delay);
        self
    }

    pub fn with_dead_letter(mut self, enabled: bool) -> Self {
        self.dead_letter_enabled = enabled;
        self
    }

    pub fn with_prefetch_count(mut self, prefetch: u16) -> Self {
        self.prefetch_count = prefetch;
        self
    }

    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval_ms = duration_millis(interval);
        self
    }

    pub fn with_publisher_confirms(mut self, enabled: bool) -> Self {
        self.publisher_confirms = enabled;
        self
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn channel_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.channel_acquire_timeout_ms)
    }

    /// The retry policy consumers apply unless a subscription overrides it.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retry_attempts,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            dead_letter_enabled: self.dead_letter_enabled,
        }
    }
}

/// Retry budget applied to a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub dead_letter_enabled: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        BrokerConfig::default().retry_policy()
    }
}

pub(crate) fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Reads `key` through `lookup` and parses it, ignoring unparsable values.
fn parsed<V: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<V> {
    lookup(key).and_then(|value| value.trim().parse().ok())
}
