//! Delimiter-framed message extraction.
//!
//! A worker calls [`FrameReader::read_frame`] with a checked-out connection.
//! The reader drains the socket until it would block, cutting the byte stream
//! into frames at every delimiter and handing each frame to the application.
//! An unterminated tail is parked in the connection until the next dispatch;
//! on a clean end of stream it is delivered as the final frame. A connection
//! the server closed itself never has its tail delivered.

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

use crate::buffer_pool::{BufferPool, PooledBuffer};
use crate::connection::Checkout;
use crate::handler::{ConnectionHandler, ConnectionWriter};
use crate::metrics::Metrics;

/// Default frame delimiter.
pub const DEFAULT_DELIMITER: &[u8] = b"\r\n";

/// Default upper bound on a single unterminated frame.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Size of the scratch chunk each socket read lands in.
const READ_CHUNK: usize = 4096;

/// Why a drain stopped without leaving the connection usable.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The peer closed its side cleanly. Not a failure.
    #[error("end of stream")]
    EndOfStream,

    /// The server closed the connection while it was being drained.
    #[error("connection closed by server")]
    Aborted,

    /// The buffered, unterminated frame outgrew the configured limit.
    #[error("frame exceeds {limit} bytes without a delimiter")]
    TooLarge { limit: usize },

    /// Reading from the socket failed.
    #[error("read failed: {0}")]
    Io(#[from] io::Error),

    /// The application handler failed.
    #[error("handler failed: {0}")]
    Handler(#[source] anyhow::Error),
}

impl FrameError {
    /// Returns true for a clean peer close.
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Self::EndOfStream)
    }

    /// Returns true when the server itself closed the connection.
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }
}

/// Extracts delimited frames from connections.
#[derive(Debug)]
pub struct FrameReader {
    pool: Arc<BufferPool>,
    delimiter: Bytes,
    max_frame_size: usize,
}

impl FrameReader {
    /// Creates a reader.
    ///
    /// # Panics
    ///
    /// Panics if `delimiter` is empty.
    pub fn new(pool: Arc<BufferPool>, delimiter: impl Into<Bytes>, max_frame_size: usize) -> Self {
        let delimiter = delimiter.into();
        assert!(!delimiter.is_empty(), "delimiter must not be empty");
        Self {
            pool,
            delimiter,
            max_frame_size,
        }
    }

    /// Returns the delimiter.
    pub fn delimiter(&self) -> &[u8] {
        &self.delimiter
    }

    /// Drains a checked-out connection.
    ///
    /// `Ok(())` means the socket would block and the connection stays open.
    pub fn read_frame(
        &self,
        checkout: &Checkout,
        handler: &dyn ConnectionHandler,
        write_timeout: Duration,
    ) -> Result<(), FrameError> {
        let conn = checkout.connection();
        let mut reader = conn.stream();
        let mut writer = ConnectionWriter::new(conn.stream(), write_timeout);

        let mut pending = conn.take_pending();
        let result = self.drain_until(
            &mut reader,
            &mut writer,
            &mut pending,
            handler,
            &|| conn.is_closed(),
        );
        if let Some(buf) = pending {
            conn.park_pending(buf);
        }
        result
    }

    /// Reads from `reader` until it would block or ends, invoking `handler`
    /// for each complete frame.
    ///
    /// `pending` carries an unterminated tail in and out. It is `None` on
    /// return unless unconsumed bytes remain and the stream is still open.
    pub fn drain<R, W>(
        &self,
        reader: &mut R,
        writer: &mut W,
        pending: &mut Option<PooledBuffer>,
        handler: &dyn ConnectionHandler,
    ) -> Result<(), FrameError>
    where
        R: Read,
        W: Write,
    {
        self.drain_until(reader, writer, pending, handler, &|| false)
    }

    /// Like [`drain`](Self::drain), but an end of stream seen once `closed`
    /// reports true is [`FrameError::Aborted`] and the tail is discarded.
    fn drain_until<R, W>(
        &self,
        reader: &mut R,
        writer: &mut W,
        pending: &mut Option<PooledBuffer>,
        handler: &dyn ConnectionHandler,
        closed: &dyn Fn() -> bool,
    ) -> Result<(), FrameError>
    where
        R: Read,
        W: Write,
    {
        let mut buf = pending.take().unwrap_or_else(|| self.pool.acquire());
        let dlen = self.delimiter.len();
        // Everything before `scanned` is known to hold no complete delimiter.
        let mut scanned = buf.len().saturating_sub(dlen - 1);
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            let n = match reader.read(&mut chunk) {
                Ok(0) => {
                    if closed() {
                        return Err(FrameError::Aborted);
                    }
                    if !buf.is_empty() {
                        Metrics::global().frames.inc();
                        handler.handle(&buf, writer).map_err(FrameError::Handler)?;
                    }
                    return Err(FrameError::EndOfStream);
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if !buf.is_empty() {
                        *pending = Some(buf);
                    }
                    return Ok(());
                }
                Err(e) => return Err(FrameError::Io(e)),
            };

            if buf.capacity() - buf.len() < n {
                let grow = buf.capacity().max(self.pool.default_capacity()).max(n);
                buf.reserve(grow);
            }
            buf.extend_from_slice(&chunk[..n]);

            let consumed = self.dispatch_frames(&buf, scanned, writer, handler)?;
            if consumed > 0 {
                let rest = buf.len() - consumed;
                buf.copy_within(consumed.., 0);
                buf.truncate(rest);
            }
            scanned = buf.len().saturating_sub(dlen - 1);

            if buf.len() > self.max_frame_size {
                return Err(FrameError::TooLarge {
                    limit: self.max_frame_size,
                });
            }
        }
    }

    /// Hands every complete frame in `data` to the handler.
    ///
    /// Returns the number of bytes consumed, delimiters included.
    fn dispatch_frames<W: Write>(
        &self,
        data: &[u8],
        mut from: usize,
        writer: &mut W,
        handler: &dyn ConnectionHandler,
    ) -> Result<usize, FrameError> {
        let mut consumed = 0;
        while let Some(at) = find(&data[from..], &self.delimiter) {
            let end = from + at;
            Metrics::global().frames.inc();
            handler
                .handle(&data[consumed..end], writer)
                .map_err(FrameError::Handler)?;
            consumed = end + self.delimiter.len();
            from = consumed;
        }
        Ok(consumed)
    }
}

/// Returns the offset of the first occurrence of `needle` in `haystack`.
fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
