//! # limitcrab
//!
//! A distributed token bucket rate limiter whose state lives in a
//! Redis-compatible server.
//!
//! ## Overview
//!
//! limitcrab talks to the server through its own minimal RESP client:
//! - **[`resp`]**: command encoding and recursive reply decoding
//! - **[`connection`]**: one authenticated session with its own buffers
//! - **[`pool`]**: a bounded, non-blocking pool of reusable connections
//! - **[`script`]**: the token bucket script, evaluated atomically by the server
//! - **[`store`]**: [`RedisStore`], which ties them together behind `take`
//!
//! ## Quick Start
//!
//! ```no_run
//! use limitcrab::{Config, FailureMode, RedisStore};
//! use limitcrab::connector::TcpConnector;
//! use std::time::Duration;
//!
//! # async fn run() -> limitcrab::Result<()> {
//! // 100 requests per minute per key, backed by a local server
//! let store = RedisStore::new(
//!     Config::new()
//!         .tokens(100)
//!         .interval(Duration::from_secs(60))
//!         .failure_mode(FailureMode::FailOpen)
//!         .connector(TcpConnector::new("127.0.0.1:6379".parse().unwrap())),
//! )
//! .await?;
//!
//! let result = store.take("api_key_12345").await;
//! println!("allowed={} remaining={}", result.allowed, result.remaining);
//!
//! store.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Failure Modes
//!
//! `take` never returns an error. When the pool is exhausted, the server is
//! unreachable or a reply is malformed, the configured [`FailureMode`]
//! decides the answer:
//!
//! - [`FailureMode::FailClosed`] (default): deny
//! - [`FailureMode::FailOpen`]: allow, with limit, remaining and reset all zero
//!
//! ## Thread Safety
//!
//! [`RedisStore`] is `Send + Sync`; share it behind an `Arc` and call `take`
//! from as many tasks as you like. The pool hands each call its own
//! connection, so per-key ordering is left to the server.

pub mod config;
pub mod connection;
pub mod connector;
pub mod error;
pub mod pool;
pub mod resp;
pub mod script;
pub mod store;

pub use config::{Config, Credentials, FailureMode, Limits};
pub use connection::Connection;
pub use connector::{BoxTransport, Connector, FnConnector, TcpConnector, Transport};
pub use error::{Result, StoreError};
pub use pool::{Pool, PoolConfig, PoolStats, PooledConnection};
pub use resp::Reply;
pub use script::{BucketReply, Script};
pub use store::{RateLimitStore, RedisStore, TakeResult};
