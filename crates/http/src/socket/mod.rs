//! A TCP connection driven by a [`Reactor`].
//!
//! [`Socket`] exposes connect, write, end and dispose with an explicit lifecycle
//! ([`SocketState`]) and write backpressure. Reading starts once a [`SocketHandler`] is
//! registered on a connected socket; every read, drain and connect completion is posted
//! back onto the reactor, so handler callbacks always run on the reactor thread and never
//! synchronously from inside a public operation.
//!
//! The socket closes only after both halves ended (peer FIN and a local [`Socket::end`]
//! whose FIN reached the OS), or immediately on an I/O error.

mod state;

pub use state::SocketState;

use std::io::{self, IoSlice};
use std::mem;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

use crate::buffer::ConnectionBuffer;
use crate::config::SocketConfig;
use crate::protocol::ParseError;
use crate::reactor::Reactor;
use crate::utils::lock;

const MAX_IO_SLICES: usize = 64;

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

type Continuation = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("can't {operation} while the socket is {state}")]
    StateConflict { operation: &'static str, state: SocketState },

    #[error("socket has been disposed")]
    ObjectDisposed,

    #[error("malformed request: {source}")]
    Parse {
        #[from]
        source: ParseError,
    },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl SocketError {
    pub fn state_conflict(operation: &'static str, state: SocketState) -> Self {
        Self::StateConflict { operation, state }
    }
}

/// Callbacks of a socket, all invoked on the reactor thread.
pub trait SocketHandler: Send + Sync + 'static {
    /// An outbound [`Socket::connect`] completed.
    fn on_connected(&self, _socket: &Socket) {}

    /// Bytes arrived.
    ///
    /// Returning `false` lets the socket issue the next read right away. Returning `true`
    /// pauses reading until [`ReadResume::resume`] is called.
    fn on_data(&self, socket: &Socket, data: Bytes, resume: ReadResume) -> bool;

    /// The peer shut down its write half.
    fn on_end(&self, _socket: &Socket) {}

    /// An I/O error occurred; [`SocketHandler::on_close`] follows immediately.
    fn on_error(&self, _socket: &Socket, _error: &SocketError) {}

    fn on_close(&self, _socket: &Socket) {}
}

/// Continuation handed to [`SocketHandler::on_data`] for requesting the next read.
#[derive(Debug)]
#[must_use = "reading stays paused until `resume` is called"]
pub struct ReadResume {
    socket: Socket,
    epoch: u64,
}

impl ReadResume {
    pub fn resume(self) {
        let Self { socket, epoch } = self;
        socket.post(move |socket| socket.resume_read(epoch));
    }
}

/// Handle to one connection; clones share it.
#[derive(Clone)]
pub struct Socket {
    inner: Arc<SocketInner>,
}

struct SocketInner {
    id: u64,
    reactor: Reactor,
    config: SocketConfig,
    core: Mutex<SocketCore>,
}

#[derive(Default)]
struct SocketCore {
    state: SocketState,
    handler: Option<Arc<dyn SocketHandler>>,
    reader: Option<Arc<OwnedReadHalf>>,
    writer: Option<Arc<OwnedWriteHalf>>,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,

    read_buf: BytesMut,
    read_epoch: u64,
    reading: bool,
    read_task: Option<AbortHandle>,

    outbound: ConnectionBuffer,
    continuations: Vec<Continuation>,
    draining: bool,
    drain_task: Option<AbortHandle>,
    fin_pending: bool,

    connect_task: Option<AbortHandle>,
    close_observers: Vec<Continuation>,
}

/// Everything a closing socket lets go of; dropped outside the core lock.
struct Released {
    handler: Option<Arc<dyn SocketHandler>>,
    observers: Vec<Continuation>,
    _continuations: Vec<Continuation>,
    _reader: Option<Arc<OwnedReadHalf>>,
    _writer: Option<Arc<OwnedWriteHalf>>,
}

impl SocketCore {
    fn release(&mut self) -> Released {
        for task in [self.read_task.take(), self.drain_task.take(), self.connect_task.take()].into_iter().flatten() {
            task.abort();
        }
        self.outbound.clear();
        self.reading = false;
        self.draining = false;
        self.fin_pending = false;

        Released {
            handler: self.handler.take(),
            observers: mem::take(&mut self.close_observers),
            _continuations: mem::take(&mut self.continuations),
            _reader: self.reader.take(),
            _writer: self.writer.take(),
        }
    }

    fn attach(&mut self, stream: TcpStream) {
        self.local_addr = stream.local_addr().ok();
        self.peer_addr = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();
        self.reader = Some(Arc::new(reader));
        self.writer = Some(Arc::new(writer));
        self.state.remove(SocketState::CONNECTING);
        self.state.insert(SocketState::CONNECTED);
    }

    fn is_finished(&self) -> bool {
        self.state.intersects(SocketState::CLOSED | SocketState::DISPOSED)
    }

    /// Writes as much of the outbound buffer as the OS accepts without blocking.
    fn flush(&mut self) -> io::Result<()> {
        let Some(writer) = self.writer.clone() else {
            return Ok(());
        };

        while !self.outbound.is_empty() {
            let mut slices = [IoSlice::new(&[]); MAX_IO_SLICES];
            let count = self.outbound.chunks_vectored(&mut slices);
            let written = writer.try_write_vectored(&slices[..count]);
            match written {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.outbound.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl Socket {
    /// Creates an unconnected socket.
    pub fn new(reactor: &Reactor) -> Self {
        Self::with_config(reactor, SocketConfig::default())
    }

    pub fn with_config(reactor: &Reactor, config: SocketConfig) -> Self {
        Self::build(reactor, config, SocketCore::default())
    }

    /// Wraps an accepted stream; the socket starts out connected.
    pub(crate) fn accepted(reactor: &Reactor, config: SocketConfig, stream: TcpStream) -> Self {
        let mut core = SocketCore::default();
        core.attach(stream);
        Self::build(reactor, config, core)
    }

    fn build(reactor: &Reactor, config: SocketConfig, core: SocketCore) -> Self {
        Self {
            inner: Arc::new(SocketInner {
                id: NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed),
                reactor: reactor.clone(),
                config,
                core: Mutex::new(core),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn state(&self) -> SocketState {
        lock(&self.inner.core).state
    }

    pub fn reactor(&self) -> &Reactor {
        &self.inner.reactor
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.inner.core).local_addr
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        lock(&self.inner.core).peer_addr
    }

    /// Registers the callback set. On a connected socket this starts the read loop.
    pub fn set_handler(&self, handler: Arc<dyn SocketHandler>) -> Result<(), SocketError> {
        let mut core = lock(&self.inner.core);
        core.state.ensure_not_disposed()?;
        core.handler = Some(handler);
        if core.state.is_connected() {
            drop(core);
            self.post(Self::start_reading);
        }
        Ok(())
    }

    /// Opens a connection to `addr`.
    ///
    /// Valid only from `NOT_CONNECTED`. Completion is reported through
    /// [`SocketHandler::on_connected`], failure through `on_error` and `on_close`.
    pub fn connect(&self, addr: SocketAddr) -> Result<(), SocketError> {
        let mut core = lock(&self.inner.core);
        core.state.ensure_can_connect()?;
        core.state.insert(SocketState::CONNECTING);

        let weak = Arc::downgrade(&self.inner);
        core.connect_task = Some(self.inner.reactor.spawn(async move {
            let result = TcpStream::connect(addr).await;
            post_from_task(&weak, move |socket| socket.complete_connect(result));
        }));
        debug!(socket = self.inner.id, %addr, "connecting");
        Ok(())
    }

    /// Queues `data` for sending.
    ///
    /// Returns `false` when everything went to the OS and the caller may write again,
    /// `true` when the caller has to wait for `continuation`, which fires once the
    /// outbound buffer has fully drained. Zero length data is a no-op returning `false`.
    pub fn write<F>(&self, mut data: Bytes, continuation: F) -> Result<bool, SocketError>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut core = lock(&self.inner.core);
        core.state.ensure_can_send("write")?;
        if data.is_empty() {
            return Ok(false);
        }

        let attempt = match &core.writer {
            Some(writer) if core.outbound.is_empty() && !core.draining => Some(writer.try_write(&data)),
            _ => None,
        };
        match attempt {
            Some(Ok(n)) if n == data.len() => {
                trace!(socket = self.inner.id, bytes = n, "written");
                return Ok(false);
            }
            Some(Ok(n)) => data.advance(n),
            Some(Err(e)) if e.kind() != io::ErrorKind::WouldBlock => {
                drop(core);
                self.post(move |socket| socket.fail(e.into()));
                return Ok(true);
            }
            _ => {}
        }

        trace!(socket = self.inner.id, bytes = data.len(), "write queued");
        core.outbound.push(data);
        core.continuations.push(Box::new(continuation));
        self.spawn_drain(&mut core);
        Ok(true)
    }

    /// Shuts down the send half. The FIN goes out once the outbound buffer is empty.
    pub fn end(&self) -> Result<(), SocketError> {
        let mut core = lock(&self.inner.core);
        core.state.ensure_can_send("end")?;
        core.state.insert(SocketState::WRITE_ENDED);
        if core.outbound.is_empty() && !core.draining {
            // dropping the write half shuts it down
            core.writer = None;
        } else {
            core.fin_pending = true;
        }
        drop(core);

        debug!(socket = self.inner.id, "write half ended");
        self.post(Self::try_close);
        Ok(())
    }

    /// Releases the OS handle and stops all pending I/O.
    ///
    /// Unless the socket already closed, `on_close` is posted. A second call fails with
    /// [`SocketError::ObjectDisposed`].
    pub fn dispose(&self) -> Result<(), SocketError> {
        let mut core = lock(&self.inner.core);
        core.state.ensure_not_disposed()?;
        let was_closed = core.state.is_closed();
        core.state.insert(SocketState::DISPOSED);
        let released = core.release();
        drop(core);

        debug!(socket = self.inner.id, "socket disposed");
        let Released { handler, observers, .. } = released;
        if !was_closed {
            self.post(move |socket| socket.notify_close(handler, observers, None));
        }
        Ok(())
    }

    /// Fails the socket with `error` from the reactor.
    pub(crate) fn abort(&self, error: SocketError) {
        self.post(move |socket| socket.fail(error));
    }

    /// Runs `continuation` on the reactor once the outbound buffer is empty.
    ///
    /// Dropped without running if the socket closes first.
    pub(crate) fn when_drained<F>(&self, continuation: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut core = lock(&self.inner.core);
        if core.is_finished() {
            return;
        }
        if core.outbound.is_empty() && !core.draining {
            drop(core);
            self.inner.reactor.post(continuation);
        } else {
            core.continuations.push(Box::new(continuation));
        }
    }

    /// Runs `observer` once the socket closes or is disposed.
    pub(crate) fn add_close_observer<F>(&self, observer: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut core = lock(&self.inner.core);
        if core.is_finished() {
            drop(core);
            self.inner.reactor.post(observer);
        } else {
            core.close_observers.push(Box::new(observer));
        }
    }

    fn post<F>(&self, action: F)
    where
        F: FnOnce(&Socket) + Send + 'static,
    {
        let socket = self.clone();
        self.inner.reactor.post(move || action(&socket));
    }

    fn complete_connect(&self, result: io::Result<TcpStream>) {
        let mut core = lock(&self.inner.core);
        core.connect_task = None;
        if core.is_finished() {
            return;
        }

        match result {
            Ok(stream) => {
                core.attach(stream);
                let handler = core.handler.clone();
                drop(core);

                debug!(socket = self.inner.id, "connected");
                if let Some(handler) = handler {
                    handler.on_connected(self);
                }
                self.start_reading();
            }
            Err(e) => {
                drop(core);
                self.fail(e.into());
            }
        }
    }

    fn start_reading(&self) {
        let mut core = lock(&self.inner.core);
        let readable = core.state.is_connected()
            && !core.state.intersects(SocketState::READ_ENDED | SocketState::CLOSED | SocketState::DISPOSED);
        if !readable || core.reading || core.handler.is_none() {
            return;
        }
        let Some(reader) = core.reader.clone() else {
            return;
        };

        core.reading = true;
        let epoch = core.read_epoch;
        let mut buf = mem::take(&mut core.read_buf);
        buf.reserve(self.inner.config.read_buffer_size);
        let timeout = self.inner.config.read_timeout;

        let weak = Arc::downgrade(&self.inner);
        core.read_task = Some(self.inner.reactor.spawn(async move {
            let result = read_once(&reader, &mut buf, timeout).await;
            drop(reader);
            post_from_task(&weak, move |socket| socket.complete_read(epoch, result, buf));
        }));
    }

    fn resume_read(&self, epoch: u64) {
        if lock(&self.inner.core).read_epoch != epoch {
            trace!(socket = self.inner.id, "stale read resume ignored");
            return;
        }
        self.start_reading();
    }

    fn complete_read(&self, epoch: u64, result: io::Result<usize>, mut buf: BytesMut) {
        let mut core = lock(&self.inner.core);
        if core.is_finished() || epoch != core.read_epoch {
            return;
        }
        core.read_task = None;
        core.reading = false;

        match result {
            Err(e) => {
                drop(core);
                self.fail(e.into());
            }
            Ok(0) => {
                core.state.insert(SocketState::READ_ENDED);
                core.read_buf = BytesMut::new();
                let handler = core.handler.clone();
                drop(core);

                debug!(socket = self.inner.id, "peer ended its write half");
                if let Some(handler) = handler {
                    handler.on_end(self);
                }
                self.try_close();
            }
            Ok(n) => {
                let data = buf.split().freeze();
                core.read_buf = buf;
                core.read_epoch += 1;
                let epoch = core.read_epoch;
                let handler = core.handler.clone();
                drop(core);

                trace!(socket = self.inner.id, bytes = n, "read");
                let Some(handler) = handler else {
                    return;
                };
                let resume = ReadResume { socket: self.clone(), epoch };
                if !handler.on_data(self, data, resume) {
                    self.resume_read(epoch);
                }
            }
        }
    }

    fn spawn_drain(&self, core: &mut SocketCore) {
        if core.draining {
            return;
        }
        let Some(writer) = core.writer.clone() else {
            return;
        };

        core.draining = true;
        let weak = Arc::downgrade(&self.inner);
        core.drain_task = Some(self.inner.reactor.spawn(async move {
            let ready = writer.writable().await;
            drop(writer);
            post_from_task(&weak, move |socket| socket.complete_drain(ready));
        }));
    }

    fn complete_drain(&self, ready: io::Result<()>) {
        let mut core = lock(&self.inner.core);
        if core.is_finished() {
            return;
        }
        core.drain_task = None;
        core.draining = false;

        if let Err(e) = ready.and_then(|()| core.flush()) {
            drop(core);
            self.fail(e.into());
            return;
        }

        if !core.outbound.is_empty() {
            self.spawn_drain(&mut core);
            return;
        }

        let continuations = mem::take(&mut core.continuations);
        let fin = mem::take(&mut core.fin_pending);
        if fin {
            core.writer = None;
        }
        drop(core);

        trace!(socket = self.inner.id, "outbound buffer drained");
        for continuation in continuations {
            continuation();
        }
        if fin {
            self.try_close();
        }
    }

    fn try_close(&self) {
        let mut core = lock(&self.inner.core);
        if core.is_finished() || !core.state.both_ended() || core.fin_pending {
            return;
        }
        core.state.insert(SocketState::CLOSED);
        let released = core.release();
        drop(core);

        debug!(socket = self.inner.id, "socket closed");
        let Released { handler, observers, .. } = released;
        self.notify_close(handler, observers, None);
    }

    fn fail(&self, error: SocketError) {
        let mut core = lock(&self.inner.core);
        if core.is_finished() {
            return;
        }
        core.state.insert(SocketState::ERROR | SocketState::CLOSED);
        let released = core.release();
        drop(core);

        warn!(socket = self.inner.id, cause = %error, "socket failed");
        let Released { handler, observers, .. } = released;
        self.notify_close(handler, observers, Some(&error));
    }

    fn notify_close(
        &self,
        handler: Option<Arc<dyn SocketHandler>>,
        observers: Vec<Continuation>,
        error: Option<&SocketError>,
    ) {
        if let Some(handler) = handler {
            if let Some(error) = error {
                handler.on_error(self, error);
            }
            handler.on_close(self);
        }
        for observer in observers {
            observer();
        }
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket").field("id", &self.inner.id).finish_non_exhaustive()
    }
}

impl Drop for SocketInner {
    fn drop(&mut self) {
        let core = self.core.get_mut().unwrap_or_else(std::sync::PoisonError::into_inner);
        for task in [core.read_task.take(), core.drain_task.take(), core.connect_task.take()].into_iter().flatten() {
            task.abort();
        }
    }
}

fn post_from_task<F>(weak: &Weak<SocketInner>, action: F)
where
    F: FnOnce(&Socket) + Send + 'static,
{
    if let Some(inner) = weak.upgrade() {
        Socket { inner }.post(action);
    }
}

async fn read_once(reader: &OwnedReadHalf, buf: &mut BytesMut, timeout: Option<Duration>) -> io::Result<usize> {
    let read = async {
        loop {
            reader.readable().await?;
            match reader.try_read_buf(buf) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                result => return result,
            }
        }
    };

    match timeout {
        Some(limit) => tokio::time::timeout(limit, read)
            .await
            .map_err(|elapsed| io::Error::new(io::ErrorKind::TimedOut, elapsed))?,
        None => read.await,
    }
}
