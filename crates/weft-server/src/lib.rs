//! # weft-server: event-driven TCP frame server
//!
//! Accepts TCP connections, watches them with a single readiness context and
//! hands each ready connection to a worker that cuts the byte stream into
//! delimiter-terminated frames for an application [`ConnectionHandler`].
//!
//! ## Architecture
//!
//! The server uses `mio` for non-blocking I/O with poll-based loops on plain
//! threads; there is no async runtime.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                            weft-server                           │
//! │  ┌─────────────┐   ┌──────────────────┐   ┌───────────────────┐  │
//! │  │ accept loop │ → │ EventMultiplexer │ → │ worker per ready  │  │
//! │  │ (listener)  │   │ (mio poll +      │   │ connection:       │  │
//! │  └─────────────┘   │  registry)       │   │ FrameReader →     │  │
//! │                    └──────────────────┘   │ ConnectionHandler │  │
//! │                                           └───────────────────┘  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A connection is drained by at most one worker at a time. Frames of one
//! connection reach the handler in wire order; there is no ordering across
//! connections.
//!
//! ## Usage
//!
//! ```no_run
//! use std::io::Write;
//! use weft_server::{Server, ServerConfig};
//!
//! let server = Server::new(
//!     ServerConfig::new("127.0.0.1:7000"),
//!     |frame: &[u8], out: &mut dyn Write| -> anyhow::Result<()> {
//!         out.write_all(b"> ")?;
//!         out.write_all(frame)?;
//!         out.write_all(b"\n")?;
//!         Ok(())
//!     },
//! );
//! server.up()?;
//! // ...
//! server.down()?;
//! # Ok::<(), weft_server::ServerError>(())
//! ```

pub mod buffer_pool;
mod config;
mod connection;
mod error;
pub mod frame;
mod handler;
pub mod metrics;
pub mod multiplexer;
mod registry;
mod server;
#[cfg(test)]
mod tests;

pub use buffer_pool::{BufferPool, PooledBuffer};
pub use config::{ServerConfig, resolve_bind_addr};
pub use connection::{CheckIn, Checkout, Connection};
pub use error::{ServerError, ServerResult};
pub use frame::{FrameError, FrameReader};
pub use handler::{ConnectionHandler, ConnectionWriter};
pub use metrics::Metrics;
pub use multiplexer::{EventMultiplexer, Readiness};
pub use registry::ConnectionRegistry;
pub use server::Server;
