//! End-to-end tests against a live server on a loopback ephemeral port.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::{ConnectionHandler, Server, ServerConfig, ServerError};

fn config() -> ServerConfig {
    ServerConfig::new("127.0.0.1:0").with_poll_interval(Duration::from_millis(50))
}

fn echo(frame: &[u8], out: &mut dyn Write) -> anyhow::Result<()> {
    out.write_all(b"> ")?;
    out.write_all(frame)?;
    out.write_all(b"\n")?;
    Ok(())
}

fn started(config: ServerConfig, handler: impl ConnectionHandler) -> (Server, SocketAddr) {
    let server = Server::new(config, handler);
    server.up().unwrap();
    let addr = server.local_addr().unwrap();
    (server, addr)
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

/// Reads up to and including the next `\n`.
fn read_line(stream: &mut TcpStream) -> String {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).unwrap();
        assert!(n > 0, "connection closed before newline");
        line.push(byte[0]);
        if byte[0] == b'\n' {
            return String::from_utf8(line).unwrap();
        }
    }
}

fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if check() {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for {what}");
}

/// Handler that records every frame it sees.
#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<Vec<u8>>>>);

impl Recorder {
    fn frames(&self) -> Vec<Vec<u8>> {
        self.0.lock().unwrap().clone()
    }
}

impl ConnectionHandler for Recorder {
    fn handle(&self, frame: &[u8], _: &mut dyn Write) -> anyhow::Result<()> {
        self.0.lock().unwrap().push(frame.to_vec());
        Ok(())
    }
}

#[test]
fn ephemeral_port_is_reported() {
    let (server, addr) = started(config(), echo);
    assert_ne!(addr.port(), 0);
    assert!(server.is_running());
    server.down().unwrap();
    assert!(server.local_addr().is_none());
}

#[test]
fn echo_round_trip() {
    let (server, addr) = started(config(), echo);
    let mut client = connect(addr);

    client.write_all(b"hello\r\n").unwrap();
    assert_eq!(read_line(&mut client), "> hello\n");

    client.write_all(b"one\r\ntwo\r\n").unwrap();
    assert_eq!(read_line(&mut client), "> one\n");
    assert_eq!(read_line(&mut client), "> two\n");

    server.down().unwrap();
}

#[test]
fn fragmented_frame_is_reassembled() {
    let (server, addr) = started(config(), echo);
    let mut client = connect(addr);

    client.write_all(b"he").unwrap();
    thread::sleep(Duration::from_millis(100));
    client.write_all(b"llo\r\n").unwrap();

    assert_eq!(read_line(&mut client), "> hello\n");
    server.down().unwrap();
}

#[test]
fn clean_close_delivers_leftover_frame() {
    let recorder = Recorder::default();
    let (server, addr) = started(config(), recorder.clone());

    let mut client = connect(addr);
    client.write_all(b"partial").unwrap();
    client.shutdown(Shutdown::Write).unwrap();

    eventually("leftover frame", || recorder.frames() == vec![b"partial".to_vec()]);
    eventually("connection removal", || server.connection_count() == 0);
    server.down().unwrap();
}

#[test]
fn frames_spanning_several_buffer_doublings() {
    let (server, addr) = started(config().with_buffer_capacity(16), echo);
    let mut client = connect(addr);

    let payload: String = (0..300).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
    client.write_all(payload.as_bytes()).unwrap();
    client.write_all(b"\r\n").unwrap();

    assert_eq!(read_line(&mut client), format!("> {payload}\n"));
    server.down().unwrap();
}

#[test]
fn custom_delimiter() {
    let (server, addr) = started(config().with_delimiter(&b"\n"[..]), echo);
    let mut client = connect(addr);

    client.write_all(b"ping\n").unwrap();
    assert_eq!(read_line(&mut client), "> ping\n");
    server.down().unwrap();
}

#[test]
fn handler_error_closes_connection() {
    let handler = |frame: &[u8], out: &mut dyn Write| -> anyhow::Result<()> {
        if frame == b"quit" {
            anyhow::bail!("client asked to quit");
        }
        echo(frame, out)
    };
    let (server, addr) = started(config(), handler);
    let mut client = connect(addr);

    client.write_all(b"hi\r\n").unwrap();
    assert_eq!(read_line(&mut client), "> hi\n");

    client.write_all(b"quit\r\n").unwrap();
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());

    eventually("connection removal", || server.connection_count() == 0);
    server.down().unwrap();
}

#[test]
fn oversized_frame_closes_connection() {
    let (server, addr) = started(config().with_max_frame_size(64), echo);
    let mut client = connect(addr);

    // Unread data at close may turn the FIN into a reset; either way the
    // connection must go away.
    let _ = client.write_all(&[b'x'; 256]);
    let mut rest = Vec::new();
    let _ = client.read_to_end(&mut rest);
    assert!(rest.is_empty());

    eventually("connection removal", || server.connection_count() == 0);
    server.down().unwrap();
}

#[test]
fn double_up_and_double_down_are_rejected() {
    let (server, addr) = started(config(), echo);

    let err = server.up().unwrap_err();
    assert!(matches!(err, ServerError::AlreadyRunning { addr: a } if a == addr));
    assert!(server.is_running());

    server.down().unwrap();
    let err = server.down().unwrap_err();
    assert!(matches!(err, ServerError::AlreadyStopped));
    assert!(!server.is_running());
}

#[test]
fn empty_delimiter_fails_up() {
    let server = Server::new(config().with_delimiter(bytes::Bytes::new()), echo);
    assert!(matches!(server.up(), Err(ServerError::InvalidDelimiter)));
    assert!(!server.is_running());
}

#[test]
fn bind_conflict_fails_up() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = taken.local_addr().unwrap();

    let server = Server::new(ServerConfig::new(addr.to_string()), echo);
    assert!(matches!(server.up(), Err(ServerError::BindFailed { .. })));
    assert!(!server.is_running());
}

#[test]
fn down_with_open_connections_then_up_again() {
    let server = Server::new(config(), echo);
    server.up().unwrap();
    let addr = server.local_addr().unwrap();

    let mut clients: Vec<TcpStream> = (0..3).map(|_| connect(addr)).collect();
    for client in &mut clients {
        client.write_all(b"mid-fra").unwrap();
    }
    eventually("registration", || server.connection_count() == 3);

    server.down().unwrap();
    assert!(!server.is_running());
    assert_eq!(server.connection_count(), 0);
    assert_eq!(server.active_workers(), 0);

    // Every client sees its connection end.
    for client in &mut clients {
        let mut rest = Vec::new();
        let _ = client.read_to_end(&mut rest);
        assert!(rest.is_empty());
    }
    // The listener is gone.
    assert!(TcpStream::connect(addr).is_err());

    server.up().unwrap();
    let mut client = connect(server.local_addr().unwrap());
    client.write_all(b"again\r\n").unwrap();
    assert_eq!(read_line(&mut client), "> again\n");
    server.down().unwrap();
}

/// Counts handler calls that started and finished, sleeping in between.
#[derive(Clone)]
struct Slow {
    delay: Duration,
    frames: Recorder,
    started: Arc<AtomicUsize>,
    finished: Arc<AtomicUsize>,
}

impl Slow {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            frames: Recorder::default(),
            started: Arc::new(AtomicUsize::new(0)),
            finished: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl ConnectionHandler for Slow {
    fn handle(&self, frame: &[u8], out: &mut dyn Write) -> anyhow::Result<()> {
        self.frames.handle(frame, out)?;
        self.started.fetch_add(1, Ordering::SeqCst);
        thread::sleep(self.delay);
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn down_does_not_deliver_tail_of_busy_connection() {
    let slow = Slow::new(Duration::from_millis(500));
    let (server, addr) = started(config(), slow.clone());

    let mut client = connect(addr);
    client.write_all(b"slow\r\nmid").unwrap();
    eventually("handler entered", || slow.started.load(Ordering::SeqCst) == 1);

    server.down().unwrap();

    assert_eq!(slow.frames.frames(), vec![b"slow".to_vec()]);
    assert_eq!(slow.finished.load(Ordering::SeqCst), 1);
}

#[test]
fn down_waits_for_workers_inside_the_handler() {
    const CLIENTS: usize = 3;

    let slow = Slow::new(Duration::from_millis(300));
    let (server, addr) = started(config(), slow.clone());

    let mut clients: Vec<TcpStream> = (0..CLIENTS).map(|_| connect(addr)).collect();
    for client in &mut clients {
        client.write_all(b"work\r\n").unwrap();
    }
    eventually("all handlers entered", || {
        slow.started.load(Ordering::SeqCst) == CLIENTS
    });
    assert_eq!(server.active_workers(), CLIENTS);

    server.down().unwrap();

    assert_eq!(slow.finished.load(Ordering::SeqCst), CLIENTS);
    assert_eq!(server.active_workers(), 0);
    assert_eq!(server.connection_count(), 0);
}

#[test]
fn drop_stops_a_running_server() {
    let addr = {
        let (_server, addr) = started(config(), echo);
        addr
    };
    assert!(TcpStream::connect(addr).is_err());
}

/// Many clients writing as fast as they can. A connection must never be
/// drained by two workers at once, and its frames must arrive in order.
#[test]
fn connections_are_never_drained_concurrently() {
    const CLIENTS: usize = 16;
    const MESSAGES: usize = 300;

    #[derive(Default)]
    struct Tracker {
        busy: Mutex<HashMap<usize, bool>>,
        seen: Mutex<HashMap<usize, Vec<usize>>>,
        overlaps: Mutex<usize>,
    }

    struct Shared(Arc<Tracker>);

    impl ConnectionHandler for Shared {
        fn handle(&self, frame: &[u8], _: &mut dyn Write) -> anyhow::Result<()> {
            let tracker = &self.0;
            let text = std::str::from_utf8(frame)?;
            let (client, seq) = text
                .split_once(':')
                .ok_or_else(|| anyhow::anyhow!("malformed frame {text:?}"))?;
            let client: usize = client.parse()?;
            let seq: usize = seq.parse()?;

            {
                let mut busy = tracker.busy.lock().unwrap();
                let flag = busy.entry(client).or_default();
                if *flag {
                    *tracker.overlaps.lock().unwrap() += 1;
                }
                *flag = true;
            }
            thread::yield_now();
            tracker.seen.lock().unwrap().entry(client).or_default().push(seq);
            tracker.busy.lock().unwrap().insert(client, false);
            Ok(())
        }
    }

    let tracker = Arc::new(Tracker::default());
    let (server, addr) = started(config(), Shared(Arc::clone(&tracker)));

    let writers: Vec<_> = (0..CLIENTS)
        .map(|client| {
            thread::spawn(move || {
                let mut stream = connect(addr);
                for seq in 0..MESSAGES {
                    write!(stream, "{client}:{seq}\r\n").unwrap();
                }
                stream
            })
        })
        .collect();
    let streams: Vec<TcpStream> = writers.into_iter().map(|w| w.join().unwrap()).collect();

    eventually("all frames", || {
        let seen = tracker.seen.lock().unwrap();
        seen.values().map(Vec::len).sum::<usize>() == CLIENTS * MESSAGES
    });

    assert_eq!(*tracker.overlaps.lock().unwrap(), 0);
    let expected: Vec<usize> = (0..MESSAGES).collect();
    for (client, seqs) in tracker.seen.lock().unwrap().iter() {
        assert_eq!(seqs, &expected, "client {client} frames out of order");
    }

    drop(streams);
    server.down().unwrap();
}
