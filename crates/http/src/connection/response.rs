//! The response side of a transaction, as handed to application code.

use std::sync::Arc;

use bytes::Bytes;
use http::header::CONTENT_LENGTH;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use tracing::{error, warn};

use crate::connection::transaction::Transaction;
use crate::ensure;
use crate::protocol::{HttpError, ResponseHead, ResponsePhase, SendError};
use crate::utils::lock;

/// Writes one response onto its connection.
///
/// The head stays mutable until it is rendered, explicitly through
/// [`Response::write_head`] or implicitly by the first body write. Output produced while
/// an earlier pipelined response is still being written is kept until it's this
/// response's turn, so responses reach the wire in request order.
///
/// A response dropped before [`Response::end`] counts as failed, see [`Response::fail`].
pub struct Response {
    tx: Arc<Transaction>,
    head: ResponseHead,
    body_allowed: bool,
    content_length: Option<u64>,
    written: u64,
}

impl Response {
    pub(crate) fn new(tx: Arc<Transaction>) -> Self {
        Self { tx, head: ResponseHead::new(()), body_allowed: true, content_length: None, written: 0 }
    }

    pub fn status(&self) -> StatusCode {
        self.head.status()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.head.headers()
    }

    pub fn phase(&self) -> ResponsePhase {
        lock(self.tx.state()).phase()
    }

    pub fn set_status(&mut self, status: StatusCode) -> Result<(), SendError> {
        lock(self.tx.state()).ensure_mutable()?;
        *self.head.status_mut() = status;
        Ok(())
    }

    pub fn headers_mut(&mut self) -> Result<&mut HeaderMap, SendError> {
        lock(self.tx.state()).ensure_mutable()?;
        Ok(self.head.headers_mut())
    }

    pub fn insert_header(&mut self, name: HeaderName, value: HeaderValue) -> Result<(), SendError> {
        self.headers_mut()?.insert(name, value);
        Ok(())
    }

    /// Renders `100 Continue` when the request carried `Expect: 100-continue`.
    ///
    /// Happens at most once, and only before the head.
    pub fn send_continue(&self) -> Result<(), SendError> {
        self.tx.send_continue()
    }

    /// Renders the head. It can be rendered only once.
    pub fn write_head(&mut self) -> Result<(), SendError> {
        let mut state = lock(self.tx.state());
        state.ensure_mutable()?;
        let length = content_length(&self.head)?;
        state.begin_headers()?;

        self.body_allowed = !self.tx.is_head() && status_allows_body(self.head.status());
        self.content_length = length;

        let Some(connection) = self.tx.connection() else {
            state.fail();
            return Err(SendError::ConnectionClosed);
        };
        match connection.send_head(&self.tx, &mut self.head, self.body_allowed, state.continue_sent()) {
            Ok(keep_alive) => {
                state.record_keep_alive(keep_alive);
                Ok(())
            }
            Err(e) => {
                state.fail();
                Err(e)
            }
        }
    }

    /// Writes a body chunk, rendering the head first if needed.
    ///
    /// Returns `true` when the caller should wait for `continuation` before writing
    /// again, `false` when it may keep writing. Empty chunks are a no-op.
    pub fn write<F>(&mut self, data: Bytes, continuation: F) -> Result<bool, SendError>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.phase() == ResponsePhase::Pending {
            self.write_head()?;
        }

        let state = lock(self.tx.state());
        state.ensure_body()?;
        if data.is_empty() {
            return Ok(false);
        }
        ensure!(self.body_allowed, SendError::invalid_body("this response carries no body"));

        let len = data.len() as u64;
        if let Some(limit) = self.content_length {
            ensure!(self.written + len <= limit, SendError::invalid_body("body longer than content-length"));
        }
        self.written += len;

        let connection = self.tx.connection().ok_or(SendError::ConnectionClosed)?;
        connection.segment_write(self.tx.id(), data, Box::new(continuation))
    }

    /// Signals the end of the body; the next pipelined response may follow.
    pub fn end(mut self) -> Result<(), SendError> {
        if self.phase() == ResponsePhase::Pending {
            self.write_head()?;
        }

        let mut state = lock(self.tx.state());
        if let Some(limit) = self.content_length {
            if self.body_allowed && self.written < limit {
                state.fail();
                drop(state);
                warn!(tx = self.tx.id(), written = self.written, content_length = limit, "body shorter than content-length");
                if let Some(connection) = self.tx.connection() {
                    connection.dispose();
                }
                return Err(SendError::invalid_body("body shorter than content-length"));
            }
        }
        state.finish()?;
        let close_after = state.keep_alive() == Some(false);

        if let Some(connection) = self.tx.connection() {
            connection.segment_end(self.tx.id(), close_after);
        }
        Ok(())
    }

    /// Abandons the response after an application error.
    ///
    /// Before the head went out a `500` closing the connection is rendered instead;
    /// afterwards no well-formed response is possible any more and the connection is
    /// disposed.
    pub fn fail(mut self, error: HttpError) {
        self.abandon(&error);
    }

    /// Renders `response` in one go, deriving `Content-Length` from its body when absent.
    pub fn send(mut self, response: http::Response<Bytes>) -> Result<(), SendError> {
        lock(self.tx.state()).ensure_mutable()?;

        let (parts, body) = response.into_parts();
        self.head = ResponseHead::from_parts(parts, ());
        if !self.head.headers().contains_key(CONTENT_LENGTH) && status_allows_body(self.head.status()) {
            self.head.headers_mut().insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
        }

        self.write_head()?;
        if self.body_allowed {
            self.write(body, || {})?;
        }
        self.end()
    }

    fn abandon(&mut self, error: &dyn std::fmt::Display) {
        let mut state = lock(self.tx.state());
        let previous = state.fail();
        let connection = self.tx.connection();

        match (previous, connection) {
            (ResponsePhase::Pending, Some(connection)) => {
                error!(tx = self.tx.id(), cause = %error, "response failed, answering with 500");
                if let Err(e) = connection.send_error_head(&self.tx) {
                    warn!(tx = self.tx.id(), cause = %e, "can't render error response");
                }
            }
            (ResponsePhase::HeadersSent, Some(connection)) => {
                drop(state);
                error!(tx = self.tx.id(), cause = %error, "response failed after its head was sent, disposing connection");
                connection.dispose();
            }
            _ => {}
        }
    }
}

impl Drop for Response {
    fn drop(&mut self) {
        if lock(self.tx.state()).is_open() {
            self.abandon(&"response dropped before it was finished");
        }
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response").field("tx", &self.tx.id()).field("head", &self.head).finish()
    }
}

fn status_allows_body(status: StatusCode) -> bool {
    !(status.is_informational() || status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED)
}

fn content_length(head: &ResponseHead) -> Result<Option<u64>, SendError> {
    let Some(value) = head.headers().get(CONTENT_LENGTH) else {
        return Ok(None);
    };
    value
        .to_str()
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Some)
        .ok_or_else(|| SendError::invalid_body("invalid content-length header"))
}
