//! The HTTP transaction pipeline.
//!
//! An [`HttpConnection`] sits on a [`Socket`](crate::socket::Socket) and turns its bytes
//! into transactions: each parsed request is raised to the
//! [`RequestHandler`](crate::handler::RequestHandler) together with its [`RequestBody`]
//! and [`Response`], and gets an output segment appended to the connection's chain.
//!
//! # Ordering
//!
//! Only the front segment writes to the socket. A response completing out of order keeps
//! its output in its own segment until every earlier response ended, so pipelined
//! responses always reach the wire in request order.
//!
//! # Closing
//!
//! A response decided not to keep the connection alive ends the socket right after it
//! drained. Once the peer stops sending, a sentinel segment ends the socket after the
//! last response.

mod http_connection;
mod request_body;
mod response;
mod segment;
mod transaction;

pub use http_connection::HttpConnection;
pub use request_body::{BodyConsumer, BodyResume, RequestBody};
pub use response::Response;

pub(crate) use http_connection::ConnectionShared;
