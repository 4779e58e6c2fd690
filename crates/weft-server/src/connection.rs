//! Connection state management.
//!
//! A [`Connection`] is shared (`Arc`) between the registry, the readiness loop
//! and at most one worker. Exclusive drain rights are represented by a
//! [`Checkout`]: an owned, non-`Clone` token that only the readiness loop can
//! mint and that hands the connection back when dropped.

use std::io;
use std::net::{Shutdown, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use mio::Token;
use mio::net::TcpStream;

use crate::buffer_pool::PooledBuffer;

/// Dispatch state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchState {
    /// No worker owns the connection.
    Idle,
    /// A worker is draining the connection.
    InFlight,
    /// A worker is draining the connection and more readiness was reported
    /// in the meantime.
    Renotified,
}

/// State of a client connection.
pub struct Connection {
    /// Registry key and poll token, derived from the socket's fd.
    token: Token,
    /// Raw fd, kept for registration through `SourceFd`.
    fd: RawFd,
    /// Peer address, for logging.
    peer: SocketAddr,
    /// Non-blocking TCP stream.
    stream: TcpStream,
    /// Exclusive dispatch state. Never locked while the registry lock is held.
    state: Mutex<DispatchState>,
    /// Bytes of an unterminated frame, parked between dispatches.
    pending: Mutex<Option<PooledBuffer>>,
    /// Set once the server has shut the socket down.
    closed: AtomicBool,
}

impl Connection {
    /// Wraps an accepted stream.
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        let fd = stream.as_raw_fd();
        Self {
            token: token_for(fd),
            fd,
            peer,
            stream,
            state: Mutex::new(DispatchState::Idle),
            pending: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Returns the poll token of this connection.
    pub fn token(&self) -> Token {
        self.token
    }

    /// Returns the raw fd of the socket.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Returns the peer address.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Returns the underlying stream.
    ///
    /// `Read` and `Write` are implemented for `&TcpStream`, so a shared
    /// reference is enough to do I/O.
    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    /// Returns true while a worker holds a [`Checkout`] for this connection.
    pub fn is_in_flight(&self) -> bool {
        *self.lock_state() != DispatchState::Idle
    }

    /// Returns true once the server has shut this connection down.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Shuts the socket down in both directions.
    ///
    /// Marks the connection closed first, so a worker reading the resulting
    /// end of stream can tell it apart from the peer hanging up. A peer that
    /// already went away is not an error.
    pub fn shutdown(&self) -> io::Result<()> {
        self.closed.store(true, Ordering::Release);
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }

    /// Takes the parked partial frame, if any.
    pub(crate) fn take_pending(&self) -> Option<PooledBuffer> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Parks a partial frame until the next dispatch.
    pub(crate) fn park_pending(&self, buf: PooledBuffer) {
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = Some(buf);
    }

    /// Returns the number of parked bytes.
    pub fn pending_len(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(0, |buf| buf.len())
    }

    /// Tries to take exclusive drain rights.
    ///
    /// Returns `None` if a worker already holds them; that readiness is
    /// remembered and reported back to the holder at check-in.
    pub(crate) fn try_checkout(self: &Arc<Self>) -> Option<Checkout> {
        let mut state = self.lock_state();
        match *state {
            DispatchState::Idle => {
                *state = DispatchState::InFlight;
                Some(Checkout {
                    conn: Arc::clone(self),
                    held: true,
                })
            }
            DispatchState::InFlight | DispatchState::Renotified => {
                *state = DispatchState::Renotified;
                None
            }
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, DispatchState> {
        // The state is a plain enum, a poisoned lock still holds a valid value.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("fd", &self.fd)
            .field("peer", &self.peer)
            .field("state", &*self.lock_state())
            .finish_non_exhaustive()
    }
}

/// Returns the poll token used for a socket fd.
pub(crate) fn token_for(fd: RawFd) -> Token {
    // fds handed out by the kernel are never negative.
    Token(usize::try_from(fd).unwrap_or(usize::MAX))
}

/// Outcome of handing a [`Checkout`] back.
#[derive(Debug)]
pub enum CheckIn {
    /// The connection is idle again.
    Released,
    /// Readiness arrived while the connection was checked out; the holder
    /// keeps the checkout and must drain again.
    Redispatch(Checkout),
}

/// Exclusive right to drain one connection.
///
/// Dropping a checkout releases the connection, so a worker that returns
/// early or panics can never leave it stuck in flight.
#[derive(Debug)]
pub struct Checkout {
    conn: Arc<Connection>,
    held: bool,
}

impl Checkout {
    /// Returns the checked-out connection.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Hands the connection back.
    ///
    /// If readiness was reported while the connection was out, the checkout
    /// is kept and returned as [`CheckIn::Redispatch`].
    pub fn check_in(mut self) -> CheckIn {
        let mut state = self.conn.lock_state();
        if *state == DispatchState::Renotified {
            *state = DispatchState::InFlight;
            drop(state);
            return CheckIn::Redispatch(self);
        }
        *state = DispatchState::Idle;
        drop(state);
        self.held = false;
        CheckIn::Released
    }
}

impl Drop for Checkout {
    fn drop(&mut self) {
        if self.held {
            *self.conn.lock_state() = DispatchState::Idle;
        }
    }
}
