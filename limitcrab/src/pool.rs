//! Bounded connection pool
//!
//! The pool never waits for capacity: once `max_size` connections are live
//! and none is idle, [`Pool::acquire`] fails with
//! [`StoreError::PoolExhausted`]. Bookkeeping sits behind one
//! `parking_lot::Mutex` that is never held across an await; dialing and all
//! connection I/O happen outside it.

use parking_lot::Mutex;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tracing::debug;

use crate::config::Credentials;
use crate::connection::Connection;
use crate::connector::Connector;
use crate::error::{Result, StoreError};

#[derive(Clone)]
pub struct PoolConfig {
    /// Connections opened by [`Pool::new`]
    pub initial_size: usize,
    /// Ceiling on live connections, idle or checked out
    pub max_size: usize,
    pub connector: Arc<dyn Connector>,
    pub credentials: Option<Credentials>,
}

impl fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolConfig")
            .field("initial_size", &self.initial_size)
            .field("max_size", &self.max_size)
            .field("credentials", &self.credentials)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections that exist, idle or checked out
    pub live: usize,
    pub idle: usize,
    pub max: usize,
}

struct PoolState {
    idle: Vec<Connection>,
    live: usize,
    closed: bool,
}

pub struct Pool {
    config: PoolConfig,
    state: Mutex<PoolState>,
}

impl Pool {
    /// Open `initial_size` connections up front
    ///
    /// Fails if any of them cannot be opened; connections opened so far are
    /// dropped.
    pub async fn new(config: PoolConfig) -> Result<Self> {
        let mut idle = Vec::with_capacity(config.initial_size);
        for _ in 0..config.initial_size {
            idle.push(Self::open(&config).await?);
        }

        debug!(
            initial = config.initial_size,
            max = config.max_size,
            "connection pool ready"
        );

        Ok(Self {
            state: Mutex::new(PoolState {
                live: idle.len(),
                idle,
                closed: false,
            }),
            config,
        })
    }

    async fn open(config: &PoolConfig) -> Result<Connection> {
        Connection::open(config.connector.as_ref(), config.credentials.as_ref()).await
    }

    /// Check out an idle connection, or open one if below the ceiling
    pub async fn acquire(&self) -> Result<PooledConnection<'_>> {
        let slot = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(StoreError::PoolClosed);
            }
            if let Some(conn) = state.idle.pop() {
                return Ok(PooledConnection::new(self, conn));
            }
            if state.live >= self.config.max_size {
                return Err(StoreError::PoolExhausted {
                    max: self.config.max_size,
                });
            }
            state.live += 1;
            Slot { pool: self }
        };

        let conn = Self::open(&self.config).await?;

        {
            let state = self.state.lock();
            if state.closed {
                drop(state);
                debug!(conn = conn.id(), "pool closed while dialing, dropping connection");
                return Err(StoreError::PoolClosed);
            }
        }

        slot.fill();
        Ok(PooledConnection::new(self, conn))
    }

    /// Take back a checked-out connection
    ///
    /// Broken connections, and every connection once the pool is closed,
    /// are destroyed and their slot freed.
    pub(crate) fn release(&self, conn: Connection) {
        let mut state = self.state.lock();
        if state.closed || conn.is_broken() {
            state.live -= 1;
            drop(state);
            debug!(
                conn = conn.id(),
                broken = conn.is_broken(),
                "destroying connection"
            );
        } else {
            state.idle.push(conn);
        }
    }

    /// Drop every idle connection and refuse further checkouts
    ///
    /// Checked-out connections are destroyed as they come back. Calling this
    /// more than once has no further effect.
    pub fn close(&self) {
        let idle = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.live -= state.idle.len();
            std::mem::take(&mut state.idle)
        };

        debug!(closed = idle.len(), "connection pool closed");
        drop(idle);
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            live: state.live,
            idle: state.idle.len(),
            max: self.config.max_size,
        }
    }
}

/// A reserved but not yet filled slot in the live count
///
/// Gives the slot back if dialing fails or the acquiring future is dropped.
struct Slot<'a> {
    pool: &'a Pool,
}

impl Slot<'_> {
    fn fill(self) {
        std::mem::forget(self);
    }
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        self.pool.state.lock().live -= 1;
    }
}

/// A connection checked out of a [`Pool`]
///
/// Returned to the pool (or destroyed, if broken) when dropped.
pub struct PooledConnection<'a> {
    pool: &'a Pool,
    conn: Option<Connection>,
}

impl<'a> PooledConnection<'a> {
    fn new(pool: &'a Pool, conn: Connection) -> Self {
        Self {
            pool,
            conn: Some(conn),
        }
    }
}

impl Deref for PooledConnection<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection already released")
    }
}

impl DerefMut for PooledConnection<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection already released")
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

impl fmt::Debug for PooledConnection<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PooledConnection").field(&self.conn).finish()
    }
}
