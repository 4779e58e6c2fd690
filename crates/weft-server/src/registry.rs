//! Live-connection table.
//!
//! Maps poll tokens to connections. Registration with the poller and
//! insertion happen under the same write lock, and stale-token purging holds
//! the read lock, so a purge can never deregister an fd number that was just
//! reused by a freshly accepted socket.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};
use tracing::{debug, info};

use crate::connection::Connection;
use crate::error::{ServerError, ServerResult};
use crate::metrics::Metrics;

/// Table of registered connections keyed by poll token.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    conns: RwLock<HashMap<Token, Arc<Connection>>>,
}

impl ConnectionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the connection's socket for read readiness and stores it.
    ///
    /// On failure nothing is stored and the caller still owns the socket.
    pub fn register(&self, conn: Arc<Connection>, poll: &Registry) -> ServerResult<()> {
        let mut conns = self.write();
        poll.register(&mut SourceFd(&conn.fd()), conn.token(), Interest::READABLE)
            .map_err(|source| ServerError::Registration {
                peer: conn.peer(),
                source,
            })?;
        info!(peer = %conn.peer(), fd = conn.fd(), "connection opened");
        conns.insert(conn.token(), conn);

        let metrics = Metrics::global();
        metrics.connections_accepted.inc();
        metrics.connections_active.inc();
        Ok(())
    }

    /// Looks a connection up by token.
    pub fn lookup(&self, token: Token) -> Option<Arc<Connection>> {
        self.read().get(&token).cloned()
    }

    /// Removes a connection, deregisters it and shuts its socket down.
    ///
    /// Only removes the entry if it still refers to this very connection.
    /// Returns the first error encountered, but the entry is always deleted.
    /// Removing a connection that is no longer registered is a no-op.
    pub fn remove(&self, conn: &Arc<Connection>, poll: &Registry) -> ServerResult<()> {
        let mut conns = self.write();
        match conns.get(&conn.token()) {
            Some(current) if Arc::ptr_eq(current, conn) => {}
            _ => return Ok(()),
        }
        conns.remove(&conn.token());
        let result = close_one(conn, poll);
        drop(conns);
        record_closed(1);

        info!(peer = %conn.peer(), fd = conn.fd(), "connection closed");
        result
    }

    /// Removes every connection.
    ///
    /// The registry is always left empty; all errors are aggregated.
    pub fn remove_all(&self, poll: &Registry) -> ServerResult<()> {
        let drained: Vec<Arc<Connection>> = {
            let mut conns = self.write();
            conns.drain().map(|(_, conn)| conn).collect()
        };

        let mut errors = Vec::new();
        for conn in &drained {
            if let Err(e) = close_one(conn, poll) {
                errors.push(e);
            }
        }
        if !drained.is_empty() {
            record_closed(drained.len());
            info!(count = drained.len(), "closed all connections");
        }
        ServerError::aggregate(errors)
    }

    /// Best-effort deregistration of a token that has no registry entry.
    ///
    /// Returns true if the token was indeed stale.
    pub fn purge_stale(&self, token: Token, poll: &Registry) -> bool {
        let conns = self.read();
        if conns.contains_key(&token) {
            return false;
        }
        if let Ok(fd) = i32::try_from(token.0) {
            // The fd is usually closed already, in which case the kernel
            // dropped it from the interest list and this fails harmlessly.
            if let Err(e) = poll.deregister(&mut SourceFd(&fd)) {
                debug!(fd, error = %e, "stale fd already gone from poller");
            }
        }
        true
    }

    /// Returns the number of registered connections.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Returns true if no connections are registered.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<Token, Arc<Connection>>> {
        self.conns.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Token, Arc<Connection>>> {
        self.conns.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn record_closed(count: usize) {
    let metrics = Metrics::global();
    let count = u64::try_from(count).unwrap_or(u64::MAX);
    metrics.connections_closed.inc_by(count);
    metrics
        .connections_active
        .sub(i64::try_from(count).unwrap_or(i64::MAX));
}

/// Deregisters and shuts down one connection, keeping the first error.
fn close_one(conn: &Connection, poll: &Registry) -> ServerResult<()> {
    let deregistered = poll.deregister(&mut SourceFd(&conn.fd()));
    let shut = conn.shutdown();
    deregistered?;
    shut?;
    Ok(())
}
