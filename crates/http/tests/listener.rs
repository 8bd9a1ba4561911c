mod common;

use std::io::Read;
use std::net::Shutdown;
use std::sync::Arc;
use std::sync::mpsc::{self, Sender};

use bytes::Bytes;
use reactor_http::listener::{Listener, ListenerError, ListenerHandler, ListenerState};
use reactor_http::socket::{ReadResume, Socket, SocketHandler};

use common::{assert_quiet, connect, eventually, loopback, recv, shutdown, start_reactor};

#[derive(Debug, PartialEq)]
enum Event {
    Accepted,
    Closed,
}

/// Ends its side as soon as the peer ended.
struct Mirror;

impl SocketHandler for Mirror {
    fn on_data(&self, _socket: &Socket, _data: Bytes, _resume: ReadResume) -> bool {
        false
    }

    fn on_end(&self, socket: &Socket) {
        socket.end().unwrap();
    }
}

struct Recorder {
    events: Sender<Event>,
}

impl ListenerHandler for Recorder {
    fn on_connection(&self, _listener: &Listener, socket: Socket) {
        socket.set_handler(Arc::new(Mirror)).unwrap();
        self.events.send(Event::Accepted).unwrap();
    }

    fn on_close(&self, _listener: &Listener) {
        self.events.send(Event::Closed).unwrap();
    }
}

fn recording_listener(name: &str) -> (reactor_http::reactor::Reactor, Listener, mpsc::Receiver<Event>) {
    let reactor = start_reactor(name);
    let (tx, rx) = mpsc::channel();
    let listener = Listener::new(&reactor, Arc::new(Recorder { events: tx }));
    (reactor, listener, rx)
}

#[test]
fn close_without_connections_notifies_right_away() {
    let (reactor, listener, rx) = recording_listener("listener-idle");
    assert_eq!(listener.state(), ListenerState::Idle);

    let addr = listener.listen(loopback()).unwrap();
    assert_ne!(addr.port(), 0);
    assert_eq!(listener.local_addr(), Some(addr));
    assert_eq!(listener.state(), ListenerState::Listening);
    assert!(matches!(listener.listen(loopback()), Err(ListenerError::AlreadyListening)));

    listener.close().unwrap();
    assert_eq!(listener.state(), ListenerState::Closed);
    assert_eq!(recv(&rx), Event::Closed);
    assert_quiet(&rx);

    assert!(matches!(listener.close(), Err(ListenerError::StateConflict { operation: "close", .. })));
    assert!(matches!(listener.listen(loopback()), Err(ListenerError::StateConflict { operation: "listen", .. })));

    shutdown(&reactor);
}

#[test]
fn close_waits_for_open_connections() {
    let (reactor, listener, rx) = recording_listener("listener-graceful");
    let addr = listener.listen(loopback()).unwrap();

    let mut first = connect(addr);
    let mut second = connect(addr);
    assert_eq!(recv(&rx), Event::Accepted);
    assert_eq!(recv(&rx), Event::Accepted);
    assert_eq!(listener.open_connections(), 2);

    listener.close().unwrap();
    assert_eq!(listener.state(), ListenerState::Closing);
    assert_quiet(&rx);

    first.shutdown(Shutdown::Write).unwrap();
    let mut rest = Vec::new();
    first.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());
    assert!(eventually(|| listener.open_connections() == 1));
    assert_eq!(listener.state(), ListenerState::Closing);
    assert_quiet(&rx);

    second.shutdown(Shutdown::Write).unwrap();
    second.read_to_end(&mut rest).unwrap();
    assert_eq!(recv(&rx), Event::Closed);
    assert_eq!(listener.state(), ListenerState::Closed);
    assert_eq!(listener.open_connections(), 0);
    assert_quiet(&rx);

    shutdown(&reactor);
}

#[test]
fn dispose_forgets_the_handler() {
    let (reactor, listener, rx) = recording_listener("listener-dispose");
    listener.listen(loopback()).unwrap();

    listener.dispose().unwrap();
    assert_eq!(listener.state(), ListenerState::Disposed);
    assert!(matches!(listener.dispose(), Err(ListenerError::ObjectDisposed)));
    assert!(matches!(listener.close(), Err(ListenerError::ObjectDisposed)));
    assert!(matches!(listener.listen(loopback()), Err(ListenerError::ObjectDisposed)));
    assert_quiet(&rx);

    shutdown(&reactor);
}
