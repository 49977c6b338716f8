//! Rate limiter store backed by a remote Redis-compatible server
//!
//! Each [`RedisStore::take`] borrows a pooled connection, runs the token
//! bucket script for the key and hands the connection back. Any failure on
//! that path is absorbed by the configured [`FailureMode`]; `take` itself
//! never returns an error.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

use crate::config::{Config, FailureMode, Limits};
use crate::error::{Result, StoreError};
use crate::pool::{Pool, PoolStats};
use crate::script::{BucketReply, Script};

const RUNNING: u8 = 0;
const STOPPING: u8 = 1;
const STOPPED: u8 = 2;

/// Outcome of a single `take`
///
/// When a failure mode was applied every numeric field is zero; zero here
/// means "unknown", not "no quota".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TakeResult {
    /// Configured bucket size
    pub limit: u64,
    /// Tokens left after this call
    pub remaining: u64,
    /// Nanosecond unix timestamp at which the bucket is full again
    pub reset: u64,
    pub allowed: bool,
}

impl TakeResult {
    fn unknown(allowed: bool) -> Self {
        Self {
            allowed,
            ..Self::default()
        }
    }
}

impl FailureMode {
    /// The result reported when the store could not answer
    pub fn outcome(self) -> TakeResult {
        match self {
            FailureMode::FailClosed => TakeResult::unknown(false),
            FailureMode::FailOpen => TakeResult::unknown(true),
        }
    }
}

/// The contract a rate limiter needs from its backing store
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Consume one token for `key`
    async fn take(&self, key: &str) -> TakeResult;

    /// Release every resource; later calls to `take` are denied
    async fn close(&self) -> Result<()>;
}

/// Token bucket store whose state lives in a remote server
///
/// # Example
///
/// ```no_run
/// use limitcrab::{Config, RedisStore};
/// use limitcrab::connector::TcpConnector;
/// use std::time::Duration;
///
/// # async fn run() -> limitcrab::Result<()> {
/// let store = RedisStore::new(
///     Config::new()
///         .tokens(10)
///         .interval(Duration::from_secs(60))
///         .connector(TcpConnector::new("127.0.0.1:6379".parse().unwrap())),
/// )
/// .await?;
///
/// let result = store.take("user:123").await;
/// if !result.allowed {
///     println!("rate limited until {}", result.reset);
/// }
/// store.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct RedisStore {
    limits: Limits,
    pool: Pool,
    script: Script,
    failure_mode: FailureMode,
    state: AtomicU8,
}

impl RedisStore {
    /// Validate `config`, open the pool and register the script
    ///
    /// # Errors
    ///
    /// - [`StoreError::Config`] for an invalid configuration
    /// - [`StoreError::Setup`] if the pool cannot be opened or the script
    ///   cannot be registered
    pub async fn new(config: Config) -> Result<Self> {
        let limits = config.limits()?;
        let pool_config = config.pool_config()?;
        let script = Script::build(&limits);

        let pool = Pool::new(pool_config)
            .await
            .map_err(|e| StoreError::setup("failed to setup connection pool", e))?;

        {
            let mut conn = pool
                .acquire()
                .await
                .map_err(|e| StoreError::setup("failed to get connection to register script", e))?;
            script
                .register(&mut conn)
                .await
                .map_err(|e| StoreError::setup("failed to prime script", e))?;
        }

        info!(
            tokens = limits.tokens,
            interval = ?limits.interval,
            ttl = limits.ttl,
            sha = %script.sha(),
            "rate limit store ready"
        );

        Ok(Self {
            limits,
            pool,
            script,
            failure_mode: config.failure_mode,
            state: AtomicU8::new(RUNNING),
        })
    }

    /// Consume one token for `key` at the current time
    pub async fn take(&self, key: &str) -> TakeResult {
        self.take_at(key, SystemTime::now()).await
    }

    /// Consume one token for `key` as of `now`
    pub async fn take_at(&self, key: &str, now: SystemTime) -> TakeResult {
        if self.state.load(Ordering::Acquire) != RUNNING {
            return TakeResult::unknown(false);
        }

        let now_ns = match now.duration_since(UNIX_EPOCH) {
            Ok(d) => match u64::try_from(d.as_nanos()) {
                Ok(ns) => ns,
                Err(_) => {
                    return self.fail(
                        key,
                        &StoreError::Config(format!(
                            "time {d:?} past the epoch overflows a nanosecond timestamp"
                        )),
                    );
                }
            },
            Err(e) => {
                return self.fail(
                    key,
                    &StoreError::Config(format!("time is before the unix epoch: {e}")),
                );
            }
        };

        match self.eval(key, now_ns).await {
            Ok(reply) => TakeResult {
                limit: self.limits.tokens,
                remaining: reply.remaining,
                reset: reply.reset,
                allowed: reply.allowed,
            },
            Err(e) => self.fail(key, &e),
        }
    }

    async fn eval(&self, key: &str, now_ns: u64) -> Result<BucketReply> {
        let mut conn = self.pool.acquire().await?;
        self.script.eval(&mut conn, key, now_ns).await
    }

    fn fail(&self, key: &str, err: &StoreError) -> TakeResult {
        warn!(
            key,
            error = %err,
            mode = ?self.failure_mode,
            "rate limit store unavailable"
        );
        self.failure_mode.outcome()
    }

    /// Stop serving and close the pool
    ///
    /// Only the first call has any effect. Takes still in flight finish on
    /// the connection they hold, which is then destroyed. A take that is
    /// still dialing when the pool closes gets the failure mode answer.
    pub async fn close(&self) -> Result<()> {
        if self
            .state
            .compare_exchange(RUNNING, STOPPING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        self.pool.close();
        self.state.store(STOPPED, Ordering::Release);
        info!("rate limit store closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) != RUNNING
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn script(&self) -> &Script {
        &self.script
    }

    pub fn failure_mode(&self) -> FailureMode {
        self.failure_mode
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }
}

#[async_trait]
impl RateLimitStore for RedisStore {
    async fn take(&self, key: &str) -> TakeResult {
        RedisStore::take(self, key).await
    }

    async fn close(&self) -> Result<()> {
        RedisStore::close(self).await
    }
}
