//! Server error types.

use std::fmt;
use std::net::SocketAddr;

use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur during server operations.
#[derive(Debug, Error)]
pub enum ServerError {
    /// `up` was called on a server that is already running.
    #[error("server already running on {addr}")]
    AlreadyRunning { addr: SocketAddr },

    /// `down` was called on a server that is not running.
    #[error("server already stopped")]
    AlreadyStopped,

    /// The frame delimiter is empty.
    #[error("frame delimiter must not be empty")]
    InvalidDelimiter,

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The bind address could not be parsed or resolved.
    #[error("invalid bind address '{addr}': {reason}")]
    InvalidAddress { addr: String, reason: String },

    /// Bind failed.
    #[error("failed to bind to {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        source: std::io::Error,
    },

    /// The readiness context could not be created.
    #[error("failed to create readiness context: {0}")]
    MultiplexerInit(#[source] std::io::Error),

    /// A socket could not be registered with the readiness context.
    #[error("failed to register connection from {peer}: {source}")]
    Registration {
        peer: SocketAddr,
        source: std::io::Error,
    },

    /// The poll call itself failed.
    #[error("poll failed: {0}")]
    Poll(#[source] std::io::Error),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A worker thread could not be spawned.
    #[error("failed to spawn worker thread: {0}")]
    WorkerSpawn(#[source] std::io::Error),

    /// A long-lived loop thread panicked.
    #[error("{0} thread panicked")]
    ThreadPanicked(&'static str),

    /// Several errors collected while tearing things down.
    #[error("{}", AggregateDisplay(.0))]
    Aggregate(Vec<ServerError>),
}

impl ServerError {
    /// Folds a list of errors into a single result.
    ///
    /// No errors is `Ok`, one error is returned as-is, more are wrapped in
    /// [`ServerError::Aggregate`].
    pub fn aggregate(mut errors: Vec<ServerError>) -> ServerResult<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Self::Aggregate(errors)),
        }
    }

    /// Returns true if this is a lifecycle misuse (`AlreadyRunning` or
    /// `AlreadyStopped`) rather than a real failure.
    pub fn is_lifecycle(&self) -> bool {
        matches!(self, Self::AlreadyRunning { .. } | Self::AlreadyStopped)
    }
}

struct AggregateDisplay<'a>(&'a [ServerError]);

impl fmt::Display for AggregateDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors: ", self.0.len())?;
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}
