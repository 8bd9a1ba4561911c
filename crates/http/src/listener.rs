//! Accepts inbound connections and tracks them for graceful shutdown.
//!
//! A [`Listener`] moves through `Idle -> Listening -> Closing -> Closed`, with `Disposed`
//! reachable from anywhere. Every accepted [`Socket`] counts as open until its own close
//! notification fired; [`ListenerHandler::on_close`] fires exactly once, when the listener
//! has been closed and the last of those sockets is gone.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::AbortHandle;
use tracing::{debug, error, info};

use crate::config::SocketConfig;
use crate::reactor::Reactor;
use crate::socket::Socket;
use crate::utils::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Idle,
    Listening,
    Closing,
    Closed,
    Disposed,
}

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("listener is already listening")]
    AlreadyListening,

    #[error("can't {operation} while the listener is {state:?}")]
    StateConflict { operation: &'static str, state: ListenerState },

    #[error("listener has been disposed")]
    ObjectDisposed,

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

/// Callbacks of a listener, all invoked on the reactor thread.
pub trait ListenerHandler: Send + Sync + 'static {
    /// A connection was accepted; the socket is connected but has no handler yet.
    fn on_connection(&self, listener: &Listener, socket: Socket);

    /// Accepting failed; the listener closes afterwards.
    fn on_error(&self, _listener: &Listener, _error: &ListenerError) {}

    fn on_close(&self, _listener: &Listener) {}
}

/// Handle to a listening endpoint; clones share it.
///
/// The accept loop only holds a weak reference, dropping every handle stops accepting.
#[derive(Clone)]
pub struct Listener {
    inner: Arc<ListenerInner>,
}

struct ListenerInner {
    reactor: Reactor,
    config: SocketConfig,
    core: Mutex<ListenerCore>,
}

struct ListenerCore {
    state: ListenerState,
    handler: Option<Arc<dyn ListenerHandler>>,
    open_connections: usize,
    local_addr: Option<SocketAddr>,
    accept_task: Option<AbortHandle>,
}

impl ListenerCore {
    /// Stops accepting and moves on to `Closing`, or straight to `Closed` when no
    /// connection is open, handing back the handler to notify in that case.
    fn begin_close(&mut self) -> Option<Arc<dyn ListenerHandler>> {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        if self.open_connections == 0 {
            self.state = ListenerState::Closed;
            self.handler.take()
        } else {
            self.state = ListenerState::Closing;
            None
        }
    }
}

impl Listener {
    pub fn new(reactor: &Reactor, handler: Arc<dyn ListenerHandler>) -> Self {
        Self::with_config(reactor, SocketConfig::default(), handler)
    }

    /// Accepted sockets are created with `config`.
    pub fn with_config(reactor: &Reactor, config: SocketConfig, handler: Arc<dyn ListenerHandler>) -> Self {
        Self {
            inner: Arc::new(ListenerInner {
                reactor: reactor.clone(),
                config,
                core: Mutex::new(ListenerCore {
                    state: ListenerState::Idle,
                    handler: Some(handler),
                    open_connections: 0,
                    local_addr: None,
                    accept_task: None,
                }),
            }),
        }
    }

    pub fn state(&self) -> ListenerState {
        lock(&self.inner.core).state
    }

    /// Number of accepted connections that have not closed yet.
    pub fn open_connections(&self) -> usize {
        lock(&self.inner.core).open_connections
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.inner.core).local_addr
    }

    pub fn reactor(&self) -> &Reactor {
        &self.inner.reactor
    }

    /// Binds `addr` and starts accepting; returns the bound address.
    pub fn listen(&self, addr: SocketAddr) -> Result<SocketAddr, ListenerError> {
        let mut core = lock(&self.inner.core);
        match core.state {
            ListenerState::Idle => {}
            ListenerState::Listening => return Err(ListenerError::AlreadyListening),
            ListenerState::Disposed => return Err(ListenerError::ObjectDisposed),
            state => return Err(ListenerError::StateConflict { operation: "listen", state }),
        }

        let std_listener = std::net::TcpListener::bind(addr)?;
        std_listener.set_nonblocking(true)?;
        let local_addr = std_listener.local_addr()?;

        let weak = Arc::downgrade(&self.inner);
        core.accept_task = Some(self.inner.reactor.spawn(async move {
            let listener = match TcpListener::from_std(std_listener) {
                Ok(listener) => listener,
                Err(e) => {
                    post_from_task(&weak, move |listener| listener.complete_accept(Err(e)));
                    return;
                }
            };

            loop {
                let result = listener.accept().await;
                let failed = result.is_err();
                if !post_from_task(&weak, move |listener| listener.complete_accept(result)) || failed {
                    return;
                }
            }
        }));
        core.state = ListenerState::Listening;
        core.local_addr = Some(local_addr);

        info!(%local_addr, "start listening");
        Ok(local_addr)
    }

    /// Stops accepting.
    ///
    /// `on_close` is posted right away when no accepted connection is open, otherwise it
    /// fires when the last one closes.
    pub fn close(&self) -> Result<(), ListenerError> {
        let mut core = lock(&self.inner.core);
        match core.state {
            ListenerState::Idle | ListenerState::Listening => {}
            ListenerState::Disposed => return Err(ListenerError::ObjectDisposed),
            state => return Err(ListenerError::StateConflict { operation: "close", state }),
        }

        let handler = core.begin_close();
        let open = core.open_connections;
        drop(core);

        info!(open_connections = open, "listener closing");
        if let Some(handler) = handler {
            let listener = self.clone();
            self.inner.reactor.post(move || listener.notify_closed(&handler));
        }
        Ok(())
    }

    /// Stops accepting and forgets the handler without notifying it.
    ///
    /// Sockets accepted earlier stay open.
    pub fn dispose(&self) -> Result<(), ListenerError> {
        let mut core = lock(&self.inner.core);
        if core.state == ListenerState::Disposed {
            return Err(ListenerError::ObjectDisposed);
        }
        if let Some(task) = core.accept_task.take() {
            task.abort();
        }
        core.state = ListenerState::Disposed;
        let handler = core.handler.take();
        drop(core);

        drop(handler);
        debug!("listener disposed");
        Ok(())
    }

    fn complete_accept(&self, result: io::Result<(TcpStream, SocketAddr)>) {
        let mut core = lock(&self.inner.core);
        if core.state != ListenerState::Listening {
            return;
        }

        match result {
            Ok((stream, peer_addr)) => {
                core.open_connections += 1;
                let handler = core.handler.clone();
                drop(core);

                let socket = Socket::accepted(&self.inner.reactor, self.inner.config, stream);
                debug!(socket = socket.id(), %peer_addr, "connection accepted");

                let weak = Arc::downgrade(&self.inner);
                socket.add_close_observer(move || {
                    if let Some(inner) = weak.upgrade() {
                        Listener { inner }.connection_closed();
                    }
                });
                if let Some(handler) = handler {
                    handler.on_connection(self, socket);
                }
            }
            Err(e) => {
                core.accept_task = None;
                let handler = core.handler.clone();
                drop(core);

                let error = ListenerError::from(e);
                error!(cause = %error, "failed to accept");
                if let Some(handler) = handler {
                    handler.on_error(self, &error);
                }

                let closed = lock(&self.inner.core).begin_close();
                if let Some(handler) = closed {
                    self.notify_closed(&handler);
                }
            }
        }
    }

    fn connection_closed(&self) {
        let mut core = lock(&self.inner.core);
        core.open_connections = core.open_connections.saturating_sub(1);
        if core.state != ListenerState::Closing || core.open_connections > 0 {
            return;
        }
        core.state = ListenerState::Closed;
        let handler = core.handler.take();
        drop(core);

        if let Some(handler) = handler {
            self.notify_closed(&handler);
        }
    }

    fn notify_closed(&self, handler: &Arc<dyn ListenerHandler>) {
        info!("listener closed");
        handler.on_close(self);
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener").finish_non_exhaustive()
    }
}

impl Drop for ListenerInner {
    fn drop(&mut self) {
        let core = self.core.get_mut().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(task) = core.accept_task.take() {
            task.abort();
        }
    }
}

/// Posts `action` if the listener is still alive; returns whether it was.
fn post_from_task<F>(weak: &Weak<ListenerInner>, action: F) -> bool
where
    F: FnOnce(&Listener) + Send + 'static,
{
    let Some(inner) = weak.upgrade() else {
        return false;
    };
    let listener = Listener { inner };
    let reactor = listener.inner.reactor.clone();
    reactor.post(move || action(&listener));
    true
}
