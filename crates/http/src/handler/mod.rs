//! The application side of the HTTP layer.
//!
//! A [`RequestHandler`] is called once per parsed request, on the reactor thread, with
//! the request head, its body and the response to fill in. It may answer right away or
//! move the [`Response`] elsewhere and finish it later; responses still reach the wire in
//! request order.
//!
//! ```no_run
//! use bytes::Bytes;
//! use reactor_http::handler::make_handler;
//!
//! let handler = make_handler(|_header, _body, response: reactor_http::handler::Response| {
//!     let _ = response.send(http::Response::new(Bytes::from_static(b"Hello World!\r\n")));
//! });
//! # let _ = handler;
//! ```

pub use crate::connection::{BodyConsumer, BodyResume, RequestBody, Response};

use crate::protocol::RequestHeader;

pub trait RequestHandler: Send + Sync + 'static {
    fn on_request(&self, header: RequestHeader, body: RequestBody, response: Response);
}

#[derive(Debug)]
pub struct HandlerFn<F> {
    f: F,
}

impl<F> RequestHandler for HandlerFn<F>
where
    F: Fn(RequestHeader, RequestBody, Response) + Send + Sync + 'static,
{
    fn on_request(&self, header: RequestHeader, body: RequestBody, response: Response) {
        (self.f)(header, body, response)
    }
}

/// Builds a [`RequestHandler`] from a closure.
pub fn make_handler<F>(f: F) -> HandlerFn<F>
where
    F: Fn(RequestHeader, RequestBody, Response) + Send + Sync + 'static,
{
    HandlerFn { f }
}
