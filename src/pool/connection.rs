use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use tokio::sync::OwnedSemaphorePermit;

use crate::driver::ManageConnection;

use super::PoolInner;

/// Exclusive checkout of one pooled connection.
///
/// Dropping the guard releases the connection exactly once: back to the idle set, or
/// discarded when it was marked broken or the manager reports it broken.
pub struct PooledConnection<M: ManageConnection> {
    pool: Arc<PoolInner<M>>,
    id: u64,
    conn: Option<M::Connection>,
    broken: bool,
    // Dropped after `Drop::drop` has returned the connection, which wakes the next waiter.
    _permit: OwnedSemaphorePermit,
}

impl<M: ManageConnection> PooledConnection<M> {
    pub(super) fn new(
        pool: Arc<PoolInner<M>>,
        id: u64,
        conn: M::Connection,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            pool,
            id,
            conn: Some(conn),
            broken: false,
            _permit: permit,
        }
    }

    /// Pool-assigned identifier, stable for the lifetime of the physical connection.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Discard this connection on release instead of returning it to idle.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    #[must_use]
    pub fn is_marked_broken(&self) -> bool {
        self.broken
    }
}

impl<M: ManageConnection> Deref for PooledConnection<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        match self.conn.as_ref() {
            Some(conn) => conn,
            None => unreachable!("pooled connection accessed after release"),
        }
    }
}

impl<M: ManageConnection> DerefMut for PooledConnection<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self.conn.as_mut() {
            Some(conn) => conn,
            None => unreachable!("pooled connection accessed after release"),
        }
    }
}

impl<M: ManageConnection> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(self.id, conn, self.broken);
        }
    }
}

impl<M: ManageConnection> fmt::Debug for PooledConnection<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}
