#![allow(dead_code, reason = "every test binary uses a different subset of the helpers")]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::mpsc::Receiver;
use std::time::Duration;

use reactor_http::reactor::Reactor;

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn start_reactor(name: &str) -> Reactor {
    let reactor = Reactor::named(name).unwrap();
    reactor.start().unwrap();
    reactor
}

pub fn shutdown(reactor: &Reactor) {
    reactor.stop();
    reactor.join().unwrap();
}

pub fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

pub fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(TIMEOUT)).unwrap();
    stream.set_nodelay(true).unwrap();
    stream
}

pub fn send(stream: &mut TcpStream, request: &str) {
    stream.write_all(request.as_bytes()).unwrap();
}

pub fn read_to_end(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).unwrap();
    String::from_utf8(buf).unwrap()
}

/// Reads until `buf` holds a complete head plus the body announced by its content-length.
pub fn read_response(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(len) = complete_response_len(&buf) {
            assert_eq!(len, buf.len(), "more than one response received");
            return String::from_utf8(buf).unwrap();
        }
        let n = stream.read(&mut chunk).unwrap();
        assert!(n > 0, "connection closed before the response completed");
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Reads exactly `expected.len()` bytes and checks them.
pub fn expect_bytes(stream: &mut TcpStream, expected: &str) {
    let mut buf = vec![0u8; expected.len()];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(String::from_utf8(buf).unwrap(), expected);
}

fn complete_response_len(buf: &[u8]) -> Option<usize> {
    let head_end = buf.windows(4).position(|window| window == b"\r\n\r\n")? + 4;
    let head = std::str::from_utf8(&buf[..head_end]).ok()?;
    let content_length = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .map_or(0, |(_, value)| value.trim().parse::<usize>().unwrap());
    let total = head_end + content_length;
    (buf.len() >= total).then_some(total)
}

/// Waits for the next value, failing the test after [`TIMEOUT`].
pub fn recv<T>(rx: &Receiver<T>) -> T {
    rx.recv_timeout(TIMEOUT).expect("timed out waiting for a callback")
}

/// Asserts nothing arrives for a short while.
pub fn assert_quiet<T: std::fmt::Debug>(rx: &Receiver<T>) {
    if let Ok(value) = rx.recv_timeout(Duration::from_millis(200)) {
        panic!("unexpected {value:?}");
    }
}

/// Polls `condition` until it holds or [`TIMEOUT`] elapsed.
pub fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + TIMEOUT;
    while std::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}
