mod common;

use std::io::{Read, Write};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use reactor_http::listener::{Listener, ListenerHandler};
use reactor_http::socket::{ReadResume, Socket, SocketError, SocketHandler, SocketState};

use common::{assert_quiet, connect, eventually, loopback, recv, shutdown, start_reactor};

#[derive(Debug, PartialEq)]
enum Event {
    Connected,
    Data(Vec<u8>),
    End,
    Error,
    Close,
}

struct Recorder {
    events: Sender<Event>,
}

impl SocketHandler for Recorder {
    fn on_connected(&self, _socket: &Socket) {
        self.events.send(Event::Connected).unwrap();
    }

    fn on_data(&self, _socket: &Socket, data: Bytes, _resume: ReadResume) -> bool {
        self.events.send(Event::Data(data.to_vec())).unwrap();
        false
    }

    fn on_end(&self, _socket: &Socket) {
        self.events.send(Event::End).unwrap();
    }

    fn on_error(&self, _socket: &Socket, _error: &SocketError) {
        self.events.send(Event::Error).unwrap();
    }

    fn on_close(&self, _socket: &Socket) {
        self.events.send(Event::Close).unwrap();
    }
}

/// Writes back whatever it reads and ends its side once the peer ended.
struct Echo;

impl SocketHandler for Echo {
    fn on_data(&self, socket: &Socket, data: Bytes, _resume: ReadResume) -> bool {
        socket.write(data, || {}).unwrap();
        false
    }

    fn on_end(&self, socket: &Socket) {
        socket.end().unwrap();
    }
}

struct EchoServer;

impl ListenerHandler for EchoServer {
    fn on_connection(&self, _listener: &Listener, socket: Socket) {
        socket.set_handler(Arc::new(Echo)).unwrap();
    }
}

#[test]
fn operations_before_connect_are_state_conflicts() {
    let reactor = start_reactor("socket-conflicts");
    let socket = Socket::new(&reactor);
    assert_eq!(socket.state(), SocketState::NOT_CONNECTED);

    match socket.write(Bytes::from_static(b"x"), || {}) {
        Err(SocketError::StateConflict { operation, state }) => {
            assert_eq!(operation, "write");
            assert_eq!(state, SocketState::NOT_CONNECTED);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(matches!(socket.end(), Err(SocketError::StateConflict { operation: "end", .. })));

    shutdown(&reactor);
}

#[test]
fn dispose_without_io_is_allowed_once() {
    let reactor = start_reactor("socket-dispose");
    let (tx, rx) = mpsc::channel();
    let socket = Socket::new(&reactor);
    socket.set_handler(Arc::new(Recorder { events: tx })).unwrap();

    socket.dispose().unwrap();
    assert!(socket.state().is_disposed());
    assert!(matches!(socket.dispose(), Err(SocketError::ObjectDisposed)));
    assert!(matches!(socket.write(Bytes::from_static(b"x"), || {}), Err(SocketError::ObjectDisposed)));
    assert!(matches!(socket.connect(loopback()), Err(SocketError::ObjectDisposed)));

    assert_eq!(recv(&rx), Event::Close);
    shutdown(&reactor);
}

#[test]
fn echo_with_half_close() {
    let reactor = start_reactor("socket-echo");
    let listener = Listener::new(&reactor, Arc::new(EchoServer));
    let addr = listener.listen(loopback()).unwrap();

    let (tx, rx) = mpsc::channel();
    let client = Socket::new(&reactor);
    client.set_handler(Arc::new(Recorder { events: tx })).unwrap();
    client.connect(addr).unwrap();
    assert!(matches!(client.connect(addr), Err(SocketError::StateConflict { operation: "connect", .. })));

    assert_eq!(recv(&rx), Event::Connected);
    assert!(client.state().is_connected());
    assert!(client.peer_addr().is_some());
    assert!(matches!(client.connect(addr), Err(SocketError::StateConflict { operation: "connect", .. })));

    assert!(!client.write(Bytes::new(), || {}).unwrap());
    client.write(Bytes::from_static(b"ping"), || {}).unwrap();

    let mut echoed = Vec::new();
    while echoed.len() < 4 {
        match recv(&rx) {
            Event::Data(data) => echoed.extend(data),
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(echoed, b"ping");

    client.end().unwrap();
    assert!(matches!(client.write(Bytes::from_static(b"late"), || {}), Err(SocketError::StateConflict { .. })));
    assert!(matches!(client.end(), Err(SocketError::StateConflict { .. })));

    assert_eq!(recv(&rx), Event::End);
    assert_eq!(recv(&rx), Event::Close);
    let state = client.state();
    assert!(state.contains(SocketState::CLOSED | SocketState::READ_ENDED | SocketState::WRITE_ENDED));
    assert!(!state.contains(SocketState::ERROR));

    assert!(eventually(|| listener.open_connections() == 0));

    // closed sockets can still be disposed, without a second close notification
    client.dispose().unwrap();
    assert_quiet(&rx);

    shutdown(&reactor);
}

#[test]
fn connect_failure_reports_error_then_close() {
    let reactor = start_reactor("socket-refused");

    // grab a free port and release it again so nothing listens there
    let addr = std::net::TcpListener::bind(loopback()).unwrap().local_addr().unwrap();

    let (tx, rx) = mpsc::channel();
    let client = Socket::new(&reactor);
    client.set_handler(Arc::new(Recorder { events: tx })).unwrap();
    client.connect(addr).unwrap();

    assert_eq!(recv(&rx), Event::Error);
    assert_eq!(recv(&rx), Event::Close);
    assert!(client.state().contains(SocketState::ERROR | SocketState::CLOSED));

    shutdown(&reactor);
}

/// Hands every accepted socket to the test.
struct Accepted {
    sockets: Mutex<Sender<Socket>>,
}

impl ListenerHandler for Accepted {
    fn on_connection(&self, _listener: &Listener, socket: Socket) {
        self.sockets.lock().unwrap().send(socket).unwrap();
    }
}

#[test]
fn write_continuation_fires_once_the_peer_drained_the_output() {
    let reactor = start_reactor("socket-write-backpressure");
    let (sockets_tx, sockets_rx) = mpsc::channel();
    let listener = Listener::new(&reactor, Arc::new(Accepted { sockets: Mutex::new(sockets_tx) }));
    let addr = listener.listen(loopback()).unwrap();

    let mut client = connect(addr);
    let server = recv(&sockets_rx);

    // far more than the kernel buffers of a peer that doesn't read
    let payload = Bytes::from(vec![b'x'; 32 * 1024 * 1024]);
    let (drained_tx, drained_rx) = mpsc::channel();
    let must_wait = server.write(payload.clone(), move || drained_tx.send(()).unwrap()).unwrap();
    assert!(must_wait);
    assert_quiet(&drained_rx);

    let mut received = vec![0u8; payload.len()];
    client.read_exact(&mut received).unwrap();
    assert!(received.iter().all(|&byte| byte == b'x'));
    recv(&drained_rx);

    server.dispose().unwrap();
    shutdown(&reactor);
}

/// Pauses reading after every chunk and hands the resume to the test.
struct Pausing {
    data: Mutex<Sender<Vec<u8>>>,
    resumes: Mutex<Sender<ReadResume>>,
}

impl SocketHandler for Pausing {
    fn on_data(&self, _socket: &Socket, data: Bytes, resume: ReadResume) -> bool {
        self.data.lock().unwrap().send(data.to_vec()).unwrap();
        self.resumes.lock().unwrap().send(resume).unwrap();
        true
    }
}

#[test]
fn paused_reads_wait_for_resume() {
    let reactor = start_reactor("socket-read-backpressure");
    let (sockets_tx, sockets_rx) = mpsc::channel();
    let listener = Listener::new(&reactor, Arc::new(Accepted { sockets: Mutex::new(sockets_tx) }));
    let addr = listener.listen(loopback()).unwrap();

    let mut client = connect(addr);
    let server = recv(&sockets_rx);
    let (data_tx, data_rx) = mpsc::channel();
    let (resumes_tx, resumes_rx) = mpsc::channel();
    server.set_handler(Arc::new(Pausing { data: Mutex::new(data_tx), resumes: Mutex::new(resumes_tx) })).unwrap();

    client.write_all(b"one").unwrap();
    assert_eq!(recv(&data_rx), b"one");
    let resume = recv(&resumes_rx);

    client.write_all(b"two").unwrap();
    assert_quiet(&data_rx);

    resume.resume();
    assert_eq!(recv(&data_rx), b"two");
    let _next = recv(&resumes_rx);

    server.dispose().unwrap();
    shutdown(&reactor);
}
