//! The boundary between the multiplexer and the embedding application.

use std::io::{self, Write};
use std::thread;
use std::time::{Duration, Instant};

/// Application callback invoked once per extracted frame.
///
/// `frame` never contains the delimiter. `writer` writes back to the same
/// connection. Returning an error closes the connection.
///
/// Any `Fn(&[u8], &mut dyn Write) -> anyhow::Result<()>` closure that is
/// `Send + Sync + 'static` is a handler.
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Handles one frame.
    fn handle(&self, frame: &[u8], writer: &mut dyn Write) -> anyhow::Result<()>;
}

impl<F> ConnectionHandler for F
where
    F: Fn(&[u8], &mut dyn Write) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn handle(&self, frame: &[u8], writer: &mut dyn Write) -> anyhow::Result<()> {
        self(frame, writer)
    }
}

/// Longest pause between retries of a write that would block.
const MAX_BACKOFF: Duration = Duration::from_millis(10);

/// Writer over a non-blocking socket.
///
/// A full socket buffer surfaces as `WouldBlock`; this writer retries with a
/// short, growing sleep until the data goes out or `timeout` elapses.
pub struct ConnectionWriter<W> {
    inner: W,
    timeout: Duration,
}

impl<W: Write> ConnectionWriter<W> {
    /// Wraps `inner`, giving each write call at most `timeout` to make
    /// progress.
    pub fn new(inner: W, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    fn retry<T>(&mut self, mut op: impl FnMut(&mut W) -> io::Result<T>) -> io::Result<T> {
        let deadline = Instant::now() + self.timeout;
        let mut backoff = Duration::from_micros(50);
        loop {
            match op(&mut self.inner) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "peer is not draining its receive buffer",
                        ));
                    }
                    thread::sleep(backoff);
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                other => return other,
            }
        }
    }
}

impl<W: Write> Write for ConnectionWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.retry(|w| w.write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.retry(Write::flush)
    }
}
