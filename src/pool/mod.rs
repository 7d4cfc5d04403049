//! Bounded async connection pool.
//!
//! Capacity is governed by a fair semaphore with `max_size` permits: a checkout
//! holds one permit for as long as its [`PooledConnection`] lives, and dropping
//! the guard wakes exactly one waiter. The idle/active bookkeeping sits behind a
//! mutex that is never held across an `.await`.

mod connection;

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Semaphore;

use crate::config::PoolOptions;
use crate::driver::ManageConnection;
use crate::error::TxBatchError;

pub use connection::PooledConnection;

/// Point-in-time view of the pool plus lifetime counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolState {
    pub idle: usize,
    pub active: usize,
    pub max_size: usize,
    pub created: u64,
    pub discarded: u64,
    pub released: u64,
}

/// Cloneable handle to a shared connection pool.
pub struct ConnectionPool<M: ManageConnection> {
    inner: Arc<PoolInner<M>>,
}

impl<M: ManageConnection> Clone for ConnectionPool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: ManageConnection> std::fmt::Debug for ConnectionPool<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("options", &self.inner.options)
            .field("state", &self.state())
            .finish()
    }
}

pub(crate) struct PoolInner<M: ManageConnection> {
    manager: M,
    options: PoolOptions,
    permits: Arc<Semaphore>,
    internals: Mutex<PoolInternals<M::Connection>>,
    next_id: AtomicU64,
    created: AtomicU64,
    discarded: AtomicU64,
    released: AtomicU64,
}

struct PoolInternals<C> {
    idle: VecDeque<IdleConnection<C>>,
    active: HashSet<u64>,
    closed: bool,
}

struct IdleConnection<C> {
    id: u64,
    conn: C,
}

impl<M: ManageConnection> ConnectionPool<M> {
    /// Build a pool and warm `min_size` idle connections.
    ///
    /// # Errors
    /// Returns `TxBatchError::ConfigError` for invalid options, or the manager's error if a
    /// warm-up connection cannot be opened.
    pub async fn build(manager: M, options: PoolOptions) -> Result<Self, TxBatchError> {
        options.validate()?;
        let inner = Arc::new(PoolInner {
            permits: Arc::new(Semaphore::new(options.max_size)),
            internals: Mutex::new(PoolInternals {
                idle: VecDeque::with_capacity(options.max_size),
                active: HashSet::with_capacity(options.max_size),
                closed: false,
            }),
            manager,
            options,
            next_id: AtomicU64::new(1),
            created: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
            released: AtomicU64::new(0),
        });

        for _ in 0..inner.options.min_size {
            let conn = inner.manager.connect().await?;
            let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
            inner.created.fetch_add(1, Ordering::Relaxed);
            inner.lock().idle.push_back(IdleConnection { id, conn });
        }

        tracing::debug!(
            min_size = inner.options.min_size,
            max_size = inner.options.max_size,
            "connection pool ready"
        );
        Ok(Self { inner })
    }

    #[must_use]
    pub fn options(&self) -> &PoolOptions {
        &self.inner.options
    }

    #[must_use]
    pub fn manager(&self) -> &M {
        &self.inner.manager
    }

    /// Check out a connection, waiting at most `connect_timeout`.
    ///
    /// # Errors
    /// Returns `TxBatchError::PoolTimeout` if nothing frees up in time, `TxBatchError::PoolClosed`
    /// after [`shutdown`](Self::shutdown), or the manager's error if a new connection fails to open.
    pub async fn acquire(&self) -> Result<PooledConnection<M>, TxBatchError> {
        self.acquire_timeout(self.inner.options.connect_timeout)
            .await
    }

    /// Check out a connection, waiting at most `timeout`.
    ///
    /// # Errors
    /// Same as [`acquire`](Self::acquire).
    pub async fn acquire_timeout(
        &self,
        timeout: Duration,
    ) -> Result<PooledConnection<M>, TxBatchError> {
        let started = Instant::now();
        let permit =
            match tokio::time::timeout(timeout, Arc::clone(&self.inner.permits).acquire_owned())
                .await
            {
                Err(_) => {
                    tracing::debug!(?timeout, "pool checkout timed out");
                    return Err(TxBatchError::PoolTimeout { waited: timeout });
                }
                Ok(Err(_)) => return Err(TxBatchError::PoolClosed),
                Ok(Ok(permit)) => permit,
            };

        let reused = {
            let mut internals = self.inner.lock();
            if internals.closed {
                return Err(TxBatchError::PoolClosed);
            }
            let reused = internals.idle.pop_back();
            if let Some(idle) = &reused {
                internals.active.insert(idle.id);
            }
            reused
        };
        if let Some(IdleConnection { id, conn }) = reused {
            tracing::trace!(conn_id = id, "reusing idle connection");
            return Ok(PooledConnection::new(
                Arc::clone(&self.inner),
                id,
                conn,
                permit,
            ));
        }

        let remaining = timeout.saturating_sub(started.elapsed());
        let conn = match tokio::time::timeout(remaining, self.inner.manager.connect()).await {
            Err(_) => return Err(TxBatchError::PoolTimeout { waited: timeout }),
            Ok(result) => result?,
        };
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut internals = self.inner.lock();
            if internals.closed {
                return Err(TxBatchError::PoolClosed);
            }
            internals.active.insert(id);
        }
        self.inner.created.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(conn_id = id, "opened new pooled connection");
        Ok(PooledConnection::new(
            Arc::clone(&self.inner),
            id,
            conn,
            permit,
        ))
    }

    /// Return a connection to the pool. Equivalent to dropping the guard.
    pub fn release(&self, conn: PooledConnection<M>) {
        drop(conn);
    }

    #[must_use]
    pub fn state(&self) -> PoolState {
        let internals = self.inner.lock();
        PoolState {
            idle: internals.idle.len(),
            active: internals.active.len(),
            max_size: self.inner.options.max_size,
            created: self.inner.created.load(Ordering::Relaxed),
            discarded: self.inner.discarded.load(Ordering::Relaxed),
            released: self.inner.released.load(Ordering::Relaxed),
        }
    }

    /// Close the pool: waiters and future checkouts fail with `PoolClosed`, idle connections
    /// are dropped now, and checked-out connections are dropped when released.
    pub fn shutdown(&self) {
        self.inner.permits.close();
        let idle: Vec<_> = {
            let mut internals = self.inner.lock();
            internals.closed = true;
            internals.idle.drain(..).collect()
        };
        tracing::debug!(dropped = idle.len(), "connection pool shut down");
        drop(idle);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

impl<M: ManageConnection> PoolInner<M> {
    fn lock(&self) -> MutexGuard<'_, PoolInternals<M::Connection>> {
        // A panic while holding this lock leaves plain collections behind; keep going.
        self.internals
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Move a connection out of the active set, either back to idle or into the bin.
    /// Runs before the guard's permit is dropped, so a woken waiter sees the idle entry.
    pub(crate) fn release(&self, id: u64, conn: M::Connection, broken: bool) {
        let discard = {
            let mut internals = self.lock();
            let was_active = internals.active.remove(&id);
            debug_assert!(was_active, "connection {id} released while not active");
            self.released.fetch_add(1, Ordering::Relaxed);

            if broken || internals.closed || self.manager.has_broken(&conn) {
                Some(conn)
            } else {
                internals.idle.push_back(IdleConnection { id, conn });
                debug_assert!(internals.idle.len() + internals.active.len() <= self.options.max_size);
                None
            }
        };

        if let Some(conn) = discard {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(conn_id = id, "discarding pooled connection");
            drop(conn);
        }
    }
}
