//! Server configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::time::Duration;

use bytes::Bytes;

use crate::buffer_pool::DEFAULT_BUFFER_CAPACITY;
use crate::error::{ServerError, ServerResult};
use crate::frame::{DEFAULT_DELIMITER, DEFAULT_MAX_FRAME_SIZE};
use crate::multiplexer::DEFAULT_POLL_INTERVAL;

/// Default number of idle buffers kept by the pool.
pub const DEFAULT_POOL_SIZE: usize = 128;

/// Default pause after a transient accept failure.
pub const DEFAULT_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// Default time a reply write may wait for the peer to drain.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// `host:port` to listen on. Empty host means all interfaces, empty or
    /// missing port means an ephemeral port.
    pub bind_address: String,
    /// Bytes that terminate a frame.
    pub delimiter: Bytes,
    /// Initial capacity of read buffers.
    pub buffer_capacity: usize,
    /// Number of idle buffers the pool keeps.
    pub pool_size: usize,
    /// Largest unterminated frame a connection may buffer.
    pub max_frame_size: usize,
    /// Upper bound on one readiness wait.
    pub poll_interval: Duration,
    /// Pause after a transient accept error.
    pub accept_backoff: Duration,
    /// Time a single reply write may block on a full socket.
    pub write_timeout: Duration,
}

impl ServerConfig {
    /// Creates a configuration listening on `bind_address`.
    pub fn new(bind_address: impl Into<String>) -> Self {
        Self {
            bind_address: bind_address.into(),
            ..Self::default()
        }
    }

    /// Sets the frame delimiter.
    #[must_use]
    pub fn with_delimiter(mut self, delimiter: impl Into<Bytes>) -> Self {
        self.delimiter = delimiter.into();
        self
    }

    /// Sets the initial read buffer capacity.
    #[must_use]
    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    /// Sets the number of pooled buffers.
    #[must_use]
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    /// Sets the maximum unterminated frame size.
    #[must_use]
    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Sets the readiness poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the accept backoff.
    #[must_use]
    pub fn with_accept_backoff(mut self, backoff: Duration) -> Self {
        self.accept_backoff = backoff;
        self
    }

    /// Sets the reply write timeout.
    #[must_use]
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Checks the values `up` depends on.
    pub fn validate(&self) -> ServerResult<()> {
        if self.delimiter.is_empty() {
            return Err(ServerError::InvalidDelimiter);
        }
        for (name, value) in [
            ("buffer_capacity", self.buffer_capacity),
            ("pool_size", self.pool_size),
            ("max_frame_size", self.max_frame_size),
        ] {
            if value == 0 {
                return Err(ServerError::InvalidConfig(format!("{name} must be positive")));
            }
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: String::new(),
            delimiter: Bytes::from_static(DEFAULT_DELIMITER),
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            pool_size: DEFAULT_POOL_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            accept_backoff: DEFAULT_ACCEPT_BACKOFF,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

/// Resolves a `host:port` bind address.
///
/// - empty host → `0.0.0.0`
/// - empty or missing port → `0`, letting the OS pick an ephemeral port
/// - a bare port (`"7000"`) → all interfaces on that port
/// - IPv6 literals must be bracketed: `[::1]:7000`
/// - hostnames resolve through the system resolver; the first result wins
pub fn resolve_bind_addr(address: &str) -> ServerResult<SocketAddr> {
    let invalid = |reason: String| ServerError::InvalidAddress {
        addr: address.to_string(),
        reason,
    };

    let address = address.trim();
    if let Ok(addr) = address.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(port) = address.parse::<u16>() {
        return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
    }

    let (host, port) = split_host_port(address);
    let port = if port.is_empty() {
        0
    } else {
        port.parse::<u16>()
            .map_err(|e| invalid(format!("bad port '{port}': {e}")))?
    };

    if host.is_empty() {
        return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
    }
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    (host, port)
        .to_socket_addrs()
        .map_err(|e| invalid(e.to_string()))?
        .next()
        .ok_or_else(|| invalid("host resolved to no addresses".to_string()))
}

/// Splits `host:port`, keeping bracketed IPv6 hosts intact. A missing colon
/// means the whole string is the host.
fn split_host_port(address: &str) -> (&str, &str) {
    if let Some(rest) = address.strip_prefix('[') {
        if let Some(close) = rest.find(']') {
            let host = &address[..close + 2];
            let port = rest[close + 1..].strip_prefix(':').unwrap_or("");
            return (host, port);
        }
    }
    match address.rsplit_once(':') {
        Some((host, port)) => (host, port),
        None => (address, ""),
    }
}
