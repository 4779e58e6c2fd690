//! Server orchestration: listener, accept loop, readiness loop, workers.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, debug_span, error, info, warn};

use crate::buffer_pool::BufferPool;
use crate::config::{ServerConfig, resolve_bind_addr};
use crate::connection::{CheckIn, Checkout};
use crate::error::{ServerError, ServerResult};
use crate::frame::FrameReader;
use crate::handler::ConnectionHandler;
use crate::metrics::Metrics;
use crate::multiplexer::{EventMultiplexer, Readiness};

const LISTENER_TOKEN: Token = Token(0);
const ACCEPT_WAKE_TOKEN: Token = Token(1);

/// The frame server.
///
/// Created stopped. [`up`](Self::up) binds and starts the loops,
/// [`down`](Self::down) stops them and closes every connection; the pair may
/// be repeated.
pub struct Server {
    config: ServerConfig,
    handler: Arc<dyn ConnectionHandler>,
    running: Mutex<Option<Running>>,
}

/// Everything that only exists while the server is up.
struct Running {
    addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    mux: Arc<EventMultiplexer>,
    accept_waker: Waker,
    accept: JoinHandle<ServerResult<()>>,
    readiness: JoinHandle<()>,
    workers: Arc<WorkerGroup>,
}

impl Server {
    /// Creates a stopped server.
    pub fn new(config: ServerConfig, handler: impl ConnectionHandler) -> Self {
        Self {
            config,
            handler: Arc::new(handler),
            running: Mutex::new(None),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Binds the listener and starts serving.
    ///
    /// On error nothing is left running and the server stays stopped.
    pub fn up(&self) -> ServerResult<()> {
        let mut running = self.lock_running();
        if let Some(current) = running.as_ref() {
            return Err(ServerError::AlreadyRunning { addr: current.addr });
        }

        self.config.validate()?;
        let requested = resolve_bind_addr(&self.config.bind_address)?;
        let mut listener = TcpListener::bind(requested)
            .map_err(|source| ServerError::BindFailed {
                addr: requested,
                source,
            })?;
        let addr = listener.local_addr()?;

        let mux = Arc::new(EventMultiplexer::create(self.config.poll_interval)?);
        let accept_poll = Poll::new().map_err(ServerError::MultiplexerInit)?;
        accept_poll
            .registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let accept_waker = Waker::new(accept_poll.registry(), ACCEPT_WAKE_TOKEN)
            .map_err(ServerError::MultiplexerInit)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let workers = Arc::new(WorkerGroup::default());

        let acceptor = Acceptor {
            poll: accept_poll,
            listener,
            mux: Arc::clone(&mux),
            shutdown: Arc::clone(&shutdown),
            interval: self.config.poll_interval,
            backoff: self.config.accept_backoff,
        };
        let accept = thread::Builder::new()
            .name("weft-accept".to_string())
            .spawn(move || acceptor.run())
            .map_err(ServerError::WorkerSpawn)?;

        let pool = Arc::new(BufferPool::new(
            self.config.pool_size,
            self.config.buffer_capacity,
        ));
        let dispatch = Arc::new(Dispatch {
            mux: Arc::clone(&mux),
            reader: FrameReader::new(
                pool,
                self.config.delimiter.clone(),
                self.config.max_frame_size,
            ),
            handler: Arc::clone(&self.handler),
            write_timeout: self.config.write_timeout,
        });
        let readiness = {
            let shutdown = Arc::clone(&shutdown);
            let workers = Arc::clone(&workers);
            thread::Builder::new()
                .name("weft-poll".to_string())
                .spawn(move || readiness_loop(&dispatch, &shutdown, &workers))
        };
        let readiness = match readiness {
            Ok(handle) => handle,
            Err(e) => {
                shutdown.store(true, Ordering::Release);
                // Without the wake the accept loop still sees the flag
                // within one poll interval.
                if let Err(wake) = accept_waker.wake() {
                    warn!(error = %wake, "failed to wake accept loop");
                }
                if let Err(err) = join_accept(accept) {
                    error!(error = %err, "accept thread did not stop cleanly");
                }
                return Err(ServerError::WorkerSpawn(e));
            }
        };

        info!(%addr, "server listening");
        *running = Some(Running {
            addr,
            shutdown,
            mux,
            accept_waker,
            accept,
            readiness,
            workers,
        });
        Ok(())
    }

    /// Stops serving.
    ///
    /// Closes the listener and every connection and waits for all workers.
    /// Teardown always runs to completion; errors met on the way are
    /// aggregated into the result.
    pub fn down(&self) -> ServerResult<()> {
        let mut running = self.lock_running();
        let current = running.take().ok_or(ServerError::AlreadyStopped)?;
        current.stop()
    }

    /// Returns the bound address while running. With port 0 configured this
    /// is where the ephemeral port shows up.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock_running().as_ref().map(|r| r.addr)
    }

    /// Returns true between a successful `up` and the next `down`.
    pub fn is_running(&self) -> bool {
        self.lock_running().is_some()
    }

    /// Returns the number of workers currently draining connections.
    pub fn active_workers(&self) -> usize {
        self.lock_running()
            .as_ref()
            .map_or(0, |r| r.workers.active())
    }

    /// Returns the number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.lock_running().as_ref().map_or(0, |r| r.mux.len())
    }

    fn lock_running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let running = self
            .running
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(running) = running {
            if let Err(e) = running.stop() {
                warn!(error = %e, "errors while stopping server on drop");
            }
        }
    }
}

impl Running {
    fn stop(self) -> ServerResult<()> {
        let mut errors = Vec::new();

        self.shutdown.store(true, Ordering::Release);
        // Both loops also observe the flag within one poll interval, so a
        // failed wake only delays shutdown.
        if let Err(e) = self.accept_waker.wake() {
            errors.push(ServerError::Io(e));
        }
        if let Err(e) = self.mux.wake() {
            errors.push(ServerError::Io(e));
        }

        if let Err(e) = join_accept(self.accept) {
            errors.push(e);
        }
        if self.readiness.join().is_err() {
            errors.push(ServerError::ThreadPanicked("readiness"));
        }

        match self.mux.close_all() {
            Ok(()) => {}
            Err(ServerError::Aggregate(inner)) => errors.extend(inner),
            Err(e) => errors.push(e),
        }
        self.workers.wait_idle();

        info!(addr = %self.addr, "server stopped");
        ServerError::aggregate(errors)
    }
}

/// Waits for the accept thread, folding a panic into the error.
fn join_accept(handle: JoinHandle<ServerResult<()>>) -> ServerResult<()> {
    handle
        .join()
        .unwrap_or(Err(ServerError::ThreadPanicked("accept")))
}

/// Owns the listener for the lifetime of the accept thread.
struct Acceptor {
    poll: Poll,
    listener: TcpListener,
    mux: Arc<EventMultiplexer>,
    shutdown: Arc<AtomicBool>,
    interval: Duration,
    backoff: Duration,
}

impl Acceptor {
    /// Accepts until shutdown or a fatal accept error, then closes the
    /// listener. Only a failure to release the listener is returned.
    fn run(mut self) -> ServerResult<()> {
        self.accept_loop();
        let released = self.poll.registry().deregister(&mut self.listener);
        drop(self.listener);
        released.map_err(ServerError::Io)
    }

    fn accept_loop(&mut self) {
        let mut events = Events::with_capacity(4);
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return;
            }
            match self.poll.poll(&mut events, Some(self.interval)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "accept poll failed; no longer accepting");
                    return;
                }
            }

            // The listener is edge-triggered: accept until it would block.
            loop {
                if self.shutdown.load(Ordering::Acquire) {
                    return;
                }
                match self.listener.accept() {
                    Ok((stream, peer)) => {
                        if let Err(e) = self.mux.add_or_close(stream, peer) {
                            warn!(%peer, error = %e, "dropped connection that could not be registered");
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if is_transient_accept_error(&e) => {
                        warn!(error = %e, backoff = ?self.backoff, "transient accept error");
                        thread::sleep(self.backoff);
                    }
                    Err(e) => {
                        error!(error = %e, "accept failed; no longer accepting");
                        return;
                    }
                }
            }
        }
    }
}

/// Errors after which accepting can resume once the condition clears.
fn is_transient_accept_error(e: &io::Error) -> bool {
    // EMFILE / ENFILE: out of file descriptors, process or system wide.
    const EMFILE: i32 = 24;
    const ENFILE: i32 = 23;

    matches!(
        e.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::TimedOut
    ) || matches!(e.raw_os_error(), Some(EMFILE | ENFILE))
}

/// State shared by the readiness loop and every worker.
struct Dispatch {
    mux: Arc<EventMultiplexer>,
    reader: FrameReader,
    handler: Arc<dyn ConnectionHandler>,
    write_timeout: Duration,
}

fn readiness_loop(dispatch: &Arc<Dispatch>, shutdown: &AtomicBool, workers: &Arc<WorkerGroup>) {
    while !shutdown.load(Ordering::Acquire) {
        match dispatch.mux.wait() {
            Ok(Readiness::Empty) => {}
            Ok(Readiness::Batch(batch)) => {
                for checkout in batch {
                    spawn_worker(dispatch, workers, checkout);
                }
            }
            Err(ServerError::Poll(e)) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => error!(error = %e, "readiness wait failed"),
        }
    }
    debug!("readiness loop stopped");
}

fn spawn_worker(dispatch: &Arc<Dispatch>, workers: &Arc<WorkerGroup>, checkout: Checkout) {
    let conn = Arc::clone(checkout.connection());
    let ticket = workers.enter();
    let worker = Arc::clone(dispatch);

    let spawned = thread::Builder::new()
        .name(format!("weft-conn-{}", conn.fd()))
        .spawn(move || {
            let _ticket = ticket;
            worker.serve(checkout);
        });

    if let Err(e) = spawned {
        // The closure, and with it the checkout, is already dropped. Nobody
        // would ever drain this connection again, so close it.
        error!(peer = %conn.peer(), error = %e, "failed to spawn connection worker");
        if let Err(e) = dispatch.mux.close(&conn) {
            error!(peer = %conn.peer(), error = %e, "failed to close connection");
        }
    }
}

impl Dispatch {
    /// Drains one connection until it would block with no readiness
    /// outstanding, or until it has to be closed.
    fn serve(&self, mut checkout: Checkout) {
        let conn = Arc::clone(checkout.connection());
        let span = debug_span!("connection", fd = conn.fd(), peer = %conn.peer());
        let _entered = span.enter();

        loop {
            match self
                .reader
                .read_frame(&checkout, self.handler.as_ref(), self.write_timeout)
            {
                Ok(()) => match checkout.check_in() {
                    CheckIn::Released => return,
                    CheckIn::Redispatch(again) => checkout = again,
                },
                Err(e) => {
                    if e.is_end_of_stream() {
                        debug!("peer closed connection");
                    } else if e.is_aborted() {
                        debug!("connection closed during shutdown");
                    } else {
                        Metrics::global().frame_errors.inc();
                        error!(error = %e, "closing connection");
                    }
                    // Close while still holding the checkout so no other
                    // worker can pick the connection up in between.
                    if let Err(e) = self.mux.close(&conn) {
                        error!(error = %e, "failed to close connection");
                    }
                    drop(checkout);
                    return;
                }
            }
        }
    }
}

/// Counts running workers so `down` can wait for them.
#[derive(Default)]
struct WorkerGroup {
    active: Mutex<usize>,
    idle: Condvar,
}

impl WorkerGroup {
    fn enter(self: &Arc<Self>) -> WorkerTicket {
        *self.lock() += 1;
        Metrics::global().workers_active.inc();
        WorkerTicket(Arc::clone(self))
    }

    fn active(&self) -> usize {
        *self.lock()
    }

    fn wait_idle(&self) {
        let mut active = self.lock();
        while *active > 0 {
            active = self
                .idle
                .wait(active)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn lock(&self) -> MutexGuard<'_, usize> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Held by a worker thread; leaving the group on drop covers panics too.
struct WorkerTicket(Arc<WorkerGroup>);

impl Drop for WorkerTicket {
    fn drop(&mut self) {
        let mut active = self.0.lock();
        *active = active.saturating_sub(1);
        Metrics::global().workers_active.dec();
        if *active == 0 {
            self.0.idle.notify_all();
        }
    }
}
