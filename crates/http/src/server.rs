//! An HTTP server: a [`Listener`] feeding accepted sockets into [`HttpConnection`]s.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{info, trace, warn};

use crate::config::ServerConfig;
use crate::connection::{ConnectionShared, HttpConnection};
use crate::handler::RequestHandler;
use crate::listener::{Listener, ListenerError, ListenerHandler, ListenerState};
use crate::reactor::Reactor;
use crate::socket::Socket;
use crate::utils::lock;

type CloseCallback = Box<dyn FnOnce() + Send + 'static>;

/// Serves HTTP/1.x on one listening address.
///
/// [`HttpServer::close`] stops accepting, closes idle connections and makes every
/// following response close its connection; [`HttpServer::on_closed`] callbacks fire once
/// the last connection is gone.
#[derive(Clone)]
pub struct HttpServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    config: ServerConfig,
    handler: Arc<dyn RequestHandler>,
    listener: Listener,
    draining: Arc<AtomicBool>,
    connections: Mutex<Vec<Weak<ConnectionShared>>>,
    closed_callbacks: Mutex<Vec<CloseCallback>>,
}

struct Acceptor {
    server: Weak<ServerInner>,
}

impl HttpServer {
    pub fn new(reactor: &Reactor, handler: Arc<dyn RequestHandler>) -> Self {
        Self::with_config(reactor, ServerConfig::default(), handler)
    }

    pub fn with_config(reactor: &Reactor, config: ServerConfig, handler: Arc<dyn RequestHandler>) -> Self {
        let inner = Arc::new_cyclic(|server| ServerInner {
            config,
            handler,
            listener: Listener::with_config(reactor, config.socket, Arc::new(Acceptor { server: server.clone() })),
            draining: Arc::new(AtomicBool::new(false)),
            connections: Mutex::new(Vec::new()),
            closed_callbacks: Mutex::new(Vec::new()),
        });
        Self { inner }
    }

    pub fn listen(&self, addr: SocketAddr) -> Result<SocketAddr, ListenerError> {
        self.inner.listener.listen(addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.listener.local_addr()
    }

    pub fn state(&self) -> ListenerState {
        self.inner.listener.state()
    }

    pub fn open_connections(&self) -> usize {
        self.inner.listener.open_connections()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Registers `callback` to run once the server closed and all connections are gone.
    pub fn on_closed<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        lock(&self.inner.closed_callbacks).push(Box::new(callback));
    }

    /// Stops accepting and winds the open connections down.
    pub fn close(&self) -> Result<(), ListenerError> {
        self.inner.draining.store(true, Ordering::Release);
        self.inner.listener.close()?;

        let connections: Vec<_> = lock(&self.inner.connections).iter().filter_map(Weak::upgrade).collect();
        info!(connections = connections.len(), "http server closing");
        for connection in connections {
            connection.shutdown_idle();
        }
        Ok(())
    }
}

impl std::fmt::Debug for HttpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpServer").field("config", &self.inner.config).finish_non_exhaustive()
    }
}

impl ListenerHandler for Acceptor {
    fn on_connection(&self, _listener: &Listener, socket: Socket) {
        let Some(server) = self.server.upgrade() else {
            if let Err(e) = socket.dispose() {
                trace!(socket = socket.id(), cause = %e, "server gone, socket already disposed");
            }
            return;
        };

        let connection = HttpConnection::serve(
            socket.clone(),
            Arc::clone(&server.handler),
            &server.config,
            Arc::clone(&server.draining),
        );
        match connection {
            Ok(connection) => {
                let mut connections = lock(&server.connections);
                connections.retain(|connection| connection.strong_count() > 0);
                connections.push(connection.downgrade());
            }
            Err(e) => {
                warn!(socket = socket.id(), cause = %e, "can't serve accepted connection");
                if let Err(e) = socket.dispose() {
                    trace!(socket = socket.id(), cause = %e, "socket already disposed");
                }
            }
        }
    }

    fn on_error(&self, _listener: &Listener, error: &ListenerError) {
        warn!(cause = %error, "http server stopped accepting");
    }

    fn on_close(&self, _listener: &Listener) {
        let Some(server) = self.server.upgrade() else {
            return;
        };
        info!("http server closed");
        let callbacks = std::mem::take(&mut *lock(&server.closed_callbacks));
        for callback in callbacks {
            callback();
        }
    }
}
