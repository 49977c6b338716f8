//! Store configuration
//!
//! [`Config`] is what callers fill in. Zero values mean "use the default",
//! so `Config::default().connector(c)` is a complete configuration. It is
//! resolved once, at construction, into immutable [`Limits`] and a
//! [`PoolConfig`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::connector::Connector;
use crate::error::{Result, StoreError};
use crate::pool::PoolConfig;

pub const DEFAULT_TOKENS: u64 = 1;
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_INITIAL_POOL_SIZE: usize = 5;
pub const DEFAULT_MAX_POOL_SIZE: usize = 100;

/// How `take` answers when the store cannot be reached or replies garbage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailureMode {
    /// Deny the request
    #[default]
    FailClosed,
    /// Allow the request; limit, remaining and reset are reported as zero
    FailOpen,
}

impl std::str::FromStr for FailureMode {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace(['-', '_'], "").as_str() {
            "failclosed" | "closed" => Ok(FailureMode::FailClosed),
            "failopen" | "open" => Ok(FailureMode::FailOpen),
            _ => Err(StoreError::Config(format!(
                "Invalid failure mode: {s}. Valid options are: fail-closed, fail-open"
            ))),
        }
    }
}

/// `AUTH` credentials sent right after connecting
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Omitted from `AUTH` when `None` (legacy single-password auth)
    pub username: Option<String>,
    pub password: String,
}

impl Credentials {
    pub fn new(username: Option<String>, password: impl Into<String>) -> Self {
        Self {
            username,
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Token bucket parameters resolved from a [`Config`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Limits {
    /// Bucket size
    pub tokens: u64,
    pub interval: Duration,
    /// Nanoseconds it takes to earn one token
    pub rate: f64,
    /// Seconds an idle key survives in the store
    pub ttl: u64,
}

/// Input to [`RedisStore::new`](crate::RedisStore::new)
#[derive(Clone, Default)]
pub struct Config {
    /// Tokens allowed per interval (default 1)
    pub tokens: u64,
    /// Interval over which `tokens` are replenished (default 1s)
    pub interval: Duration,
    /// Seconds a key may sit idle before it is purged (default 10x interval)
    pub ttl: u64,
    /// Connections opened eagerly (default 5)
    pub initial_pool_size: usize,
    /// Ceiling on live connections (default 100)
    pub max_pool_size: usize,
    pub credentials: Option<Credentials>,
    pub connector: Option<Arc<dyn Connector>>,
    pub failure_mode: FailureMode,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tokens(mut self, tokens: u64) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn ttl(mut self, ttl: u64) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn initial_pool_size(mut self, size: usize) -> Self {
        self.initial_pool_size = size;
        self
    }

    pub fn max_pool_size(mut self, size: usize) -> Self {
        self.max_pool_size = size;
        self
    }

    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn connector(mut self, connector: impl Connector) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    pub fn failure_mode(mut self, mode: FailureMode) -> Self {
        self.failure_mode = mode;
        self
    }

    /// Resolve defaults for the bucket parameters
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Config`] if the TTL resolves to zero, which
    /// happens for sub-second intervals without an explicit TTL.
    pub fn limits(&self) -> Result<Limits> {
        let tokens = if self.tokens > 0 {
            self.tokens
        } else {
            DEFAULT_TOKENS
        };

        let interval = if self.interval.is_zero() {
            DEFAULT_INTERVAL
        } else {
            self.interval
        };

        let rate = interval.as_nanos() as f64 / tokens as f64;

        let ttl = if self.ttl > 0 {
            self.ttl
        } else {
            10 * interval.as_secs()
        };
        if ttl == 0 {
            return Err(StoreError::Config("ttl cannot be 0".to_string()));
        }

        Ok(Limits {
            tokens,
            interval,
            rate,
            ttl,
        })
    }

    /// Resolve pool sizing and the connection factory
    pub fn pool_config(&self) -> Result<PoolConfig> {
        let connector = self
            .connector
            .clone()
            .ok_or_else(|| StoreError::Config("missing connector".to_string()))?;

        let initial_size = if self.initial_pool_size > 0 {
            self.initial_pool_size
        } else {
            DEFAULT_INITIAL_POOL_SIZE
        };

        let max_size = if self.max_pool_size > 0 {
            self.max_pool_size
        } else {
            DEFAULT_MAX_POOL_SIZE
        };

        if initial_size > max_size {
            return Err(StoreError::Config(format!(
                "initial pool size {initial_size} exceeds max pool size {max_size}"
            )));
        }

        Ok(PoolConfig {
            initial_size,
            max_size,
            connector,
            credentials: self.credentials.clone(),
        })
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("tokens", &self.tokens)
            .field("interval", &self.interval)
            .field("ttl", &self.ttl)
            .field("initial_pool_size", &self.initial_pool_size)
            .field("max_pool_size", &self.max_pool_size)
            .field("credentials", &self.credentials)
            .field("connector", &self.connector.as_ref().map(|_| ".."))
            .field("failure_mode", &self.failure_mode)
            .finish()
    }
}
