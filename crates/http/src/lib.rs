//! An embeddable reactor with a pipelined HTTP/1.1 transaction layer
//!
//! This crate provides a single-threaded event loop, TCP sockets with explicit lifecycle
//! and backpressure, and an HTTP/1.0 and HTTP/1.1 pipeline on top of them which writes
//! responses back **in the order the requests arrived**, even when they are produced
//! asynchronously and complete out of order.
//!
//! # Features
//!
//! - One reactor thread serializing every state transition and callback
//! - Sockets with half-close, write backpressure and read pausing
//! - Graceful listener shutdown tracking open connections
//! - Incremental request parsing with pipelining support
//! - Ordered output segments per connection
//! - Keep-alive and `Expect: 100-continue` handling
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use bytes::Bytes;
//! use reactor_http::handler::make_handler;
//! use reactor_http::reactor::Reactor;
//! use reactor_http::server::HttpServer;
//! use tracing::{error, info, Level};
//! use tracing_subscriber::FmtSubscriber;
//!
//! fn main() {
//!     // Initialize logging
//!     let subscriber = FmtSubscriber::builder()
//!         .with_max_level(Level::INFO)
//!         .finish();
//!     tracing::subscriber::set_global_default(subscriber)
//!         .expect("setting default subscriber failed");
//!
//!     let reactor = Reactor::new().expect("can't build reactor");
//!     let handler = make_handler(|header, _body, response| {
//!         info!(path = header.uri().path(), "request received");
//!         let response_body = Bytes::from_static(b"Hello World!\r\n");
//!         if let Err(e) = response.send(http::Response::new(response_body)) {
//!             error!(cause = %e, "can't send response");
//!         }
//!     });
//!
//!     let server = HttpServer::new(&reactor, Arc::new(handler));
//!     match server.listen("127.0.0.1:8080".parse().unwrap()) {
//!         Ok(addr) => info!(%addr, "start listening"),
//!         Err(e) => {
//!             error!(cause = %e, "bind server error");
//!             return;
//!         }
//!     }
//!
//!     reactor.start().expect("reactor started once");
//!     reactor.join().expect("joined from outside the reactor");
//! }
//! ```
//!
//! # Architecture
//!
//! The crate is organized into several key modules:
//!
//! - [`reactor`]: The work queue thread everything else runs on
//! - [`buffer`]: Byte range queue backing pending output
//! - [`socket`]: Connection lifecycle, reads and writes
//! - [`listener`]: Accepting connections and graceful shutdown
//! - [`codec`] and [`parser`]: Request decoding into request events
//! - [`connection`]: The transaction pipeline and output segment chain
//! - [`handler`]: The application contract
//! - [`server`]: A listener wired to the pipeline
//! - [`protocol`]: Protocol types and errors
//!
//! # Threading
//!
//! Socket and listener I/O runs as futures on the reactor's runtime, but no callback is
//! ever called from inside them: every completion is posted back as a work item. Public
//! operations such as [`socket::Socket::write`] never call back synchronously either, so
//! callbacks never re-enter the code that triggered them.
//!
//! # Error Handling
//!
//! - Usage errors (writing after end, listening twice, ...) are returned at the call site
//! - I/O and parse errors go through `on_error`, immediately followed by `on_close`
//! - A panic in a posted action terminates the reactor, see [`reactor`]
//!
//! # Limitations
//!
//! - HTTP/1.0 and HTTP/1.1 only, no TLS
//! - No chunked transfer encoding: request bodies need `Content-Length`, response bodies
//!   without one are delimited by closing the connection
//! - Maximum header size: 8KB by default
//! - Maximum number of headers: 64

pub mod buffer;
pub mod codec;
pub mod config;
pub mod connection;
pub mod handler;
pub mod listener;
pub mod parser;
pub mod protocol;
pub mod reactor;
pub mod server;
pub mod socket;

mod utils;
pub(crate) use utils::ensure;
