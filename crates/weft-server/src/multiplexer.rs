//! Readiness multiplexer over `mio::Poll`.
//!
//! Owns one kernel readiness context (epoll on Linux) and the connection
//! registry. The readiness loop calls [`EventMultiplexer::wait`]; everything
//! else (accept loop, workers, shutdown) only touches the registry side,
//! through a cloned [`mio::Registry`].
//!
//! `mio` delivers edge-triggered readiness. Mutual exclusion between workers
//! does not depend on that: a connection is only handed out as a
//! [`Checkout`], and readiness that arrives while a checkout is outstanding is
//! recorded on the connection so the holder drains again before letting go.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use mio::event::Event;
use mio::net::TcpStream;
use mio::{Events, Poll, Registry, Token, Waker};
use tracing::{debug, error, trace};

use crate::connection::{Checkout, Connection};
use crate::error::{ServerError, ServerResult};
use crate::metrics::Metrics;
use crate::registry::ConnectionRegistry;

/// How long a single `wait` blocks when nothing happens.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Token reserved for the waker. Socket tokens are fds and never get here.
const WAKE_TOKEN: Token = Token(usize::MAX);

/// Events fetched per poll call.
const EVENT_CAPACITY: usize = 128;

/// Result of one `wait` call.
#[derive(Debug)]
pub enum Readiness {
    /// Connections that are readable and now exclusively owned by the caller.
    Batch(Vec<Checkout>),
    /// Nothing to do; poll again.
    Empty,
}

struct Poller {
    poll: Poll,
    events: Events,
}

/// Readiness context plus the table of connections registered with it.
pub struct EventMultiplexer {
    poller: Mutex<Poller>,
    registry: Registry,
    waker: Waker,
    conns: ConnectionRegistry,
    interval: Duration,
}

impl EventMultiplexer {
    /// Allocates the readiness context.
    pub fn create(interval: Duration) -> ServerResult<Self> {
        let poll = Poll::new().map_err(ServerError::MultiplexerInit)?;
        let registry = poll
            .registry()
            .try_clone()
            .map_err(ServerError::MultiplexerInit)?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN).map_err(ServerError::MultiplexerInit)?;

        Ok(Self {
            poller: Mutex::new(Poller {
                poll,
                events: Events::with_capacity(EVENT_CAPACITY),
            }),
            registry,
            waker,
            conns: ConnectionRegistry::new(),
            interval,
        })
    }

    /// Registers an accepted socket for read readiness.
    ///
    /// If registration fails the socket is shut down and closed here, and the
    /// error is returned; it is never tracked.
    pub fn add_or_close(&self, stream: TcpStream, peer: SocketAddr) -> ServerResult<Arc<Connection>> {
        let conn = Arc::new(Connection::new(stream, peer));
        match self.conns.register(Arc::clone(&conn), &self.registry) {
            Ok(()) => Ok(conn),
            Err(e) => {
                Metrics::global().registration_failures.inc();
                if let Err(close_err) = conn.shutdown() {
                    debug!(%peer, error = %close_err, "shutdown after failed registration");
                }
                // Dropping the only reference closes the fd.
                drop(conn);
                Err(e)
            }
        }
    }

    /// Blocks up to the poll interval and returns the connections that are
    /// ready to be drained.
    ///
    /// Connections already checked out are skipped (their readiness is
    /// remembered). Stale tokens are purged, and connections reporting an
    /// error or hangup without readable data are closed; neither fails the
    /// batch.
    pub fn wait(&self) -> ServerResult<Readiness> {
        let mut guard = self.poller.lock().unwrap_or_else(PoisonError::into_inner);
        let Poller { poll, events } = &mut *guard;

        poll.poll(events, Some(self.interval))
            .map_err(ServerError::Poll)?;

        let mut batch = Vec::new();
        for event in events.iter() {
            if let Some(checkout) = self.classify(event) {
                batch.push(checkout);
            }
        }

        if batch.is_empty() {
            Ok(Readiness::Empty)
        } else {
            Ok(Readiness::Batch(batch))
        }
    }

    fn classify(&self, event: &Event) -> Option<Checkout> {
        let token = event.token();
        if token == WAKE_TOKEN {
            return None;
        }

        let Some(conn) = self.conns.lookup(token) else {
            self.conns.purge_stale(token, &self.registry);
            trace!(token = token.0, "event for unregistered fd");
            return None;
        };

        let Some(checkout) = conn.try_checkout() else {
            trace!(fd = conn.fd(), "connection already in flight");
            return None;
        };

        let readable = event.is_readable();
        let broken =
            event.is_error() || (!readable && (event.is_read_closed() || event.is_write_closed()));

        if broken {
            if let Err(e) = self.close(&conn) {
                error!(peer = %conn.peer(), error = %e, "failed to close broken connection");
            }
            return None;
        }
        readable.then_some(checkout)
    }

    /// Interrupts a blocking [`wait`](Self::wait).
    pub fn wake(&self) -> io::Result<()> {
        self.waker.wake()
    }

    /// Removes one connection: deregisters it, shuts it down, forgets it.
    pub fn close(&self, conn: &Arc<Connection>) -> ServerResult<()> {
        self.conns.remove(conn, &self.registry)
    }

    /// Removes every registered connection, aggregating errors.
    pub fn close_all(&self) -> ServerResult<()> {
        self.conns.remove_all(&self.registry)
    }

    /// Looks a registered connection up by its poll token.
    pub fn lookup(&self, token: Token) -> Option<Arc<Connection>> {
        self.conns.lookup(token)
    }

    /// Returns the number of registered connections.
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    /// Returns true if no connections are registered.
    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }
}
