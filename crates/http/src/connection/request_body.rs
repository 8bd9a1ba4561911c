//! Push-based delivery of a request body to application code.
//!
//! A [`RequestBody`] hands the bytes of one request to a [`BodyConsumer`] in arrival
//! order. Bytes that arrive before anybody subscribed are stashed and further parsing on
//! the connection pauses; dropping the body unsubscribed discards the rest of it so the
//! next pipelined request can be parsed.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use tracing::trace;

use crate::connection::transaction::Transaction;
use crate::protocol::{HttpError, PayloadSize, SendError};
use crate::utils::lock;

/// Receives the chunks of a request body, always on the reactor thread.
pub trait BodyConsumer: Send + 'static {
    /// Returning `true` pauses delivery until [`BodyResume::resume`] is called.
    fn on_data(&mut self, data: Bytes, resume: BodyResume) -> bool;

    fn on_end(&mut self);

    /// The body can't be completed, e.g. the connection closed mid-body.
    fn on_error(&mut self, error: &HttpError);
}

/// Requests the next chunk after a [`BodyConsumer`] paused delivery.
#[must_use = "delivery stays paused until `resume` is called"]
pub struct BodyResume {
    body: Arc<BodyShared>,
    epoch: u64,
}

impl BodyResume {
    pub fn resume(self) {
        let Self { body, epoch } = self;
        let reactor = body.tx.reactor().clone();
        reactor.post(move || {
            if !body.resume(epoch) {
                return;
            }
            match body.tx.connection() {
                Some(connection) => connection.flush_body(&body),
                None => {
                    body.deliver();
                }
            }
        });
    }
}

impl std::fmt::Debug for BodyResume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BodyResume").field("epoch", &self.epoch).finish()
    }
}

/// The body of one request, handed to [`RequestHandler::on_request`](crate::handler::RequestHandler::on_request).
pub struct RequestBody {
    inner: Option<Arc<BodyShared>>,
}

impl RequestBody {
    pub(crate) fn new(inner: Arc<BodyShared>) -> Self {
        Self { inner: Some(inner) }
    }

    /// The `Content-Length` of the request, `0` without one.
    pub fn content_length(&self) -> u64 {
        self.inner.as_ref().map_or(0, |body| body.payload_size.len())
    }

    pub fn is_empty(&self) -> bool {
        self.content_length() == 0
    }

    /// Starts delivering the body to `consumer`.
    ///
    /// For a request carrying `Expect: 100-continue` this renders the interim response,
    /// unless the final head is already on its way.
    pub fn subscribe<C: BodyConsumer>(mut self, consumer: C) {
        let Some(body) = self.inner.take() else {
            return;
        };
        body.attach(Box::new(consumer));
        body.tx.request_continue();

        let reactor = body.tx.reactor().clone();
        reactor.post(move || match body.tx.connection() {
            Some(connection) => connection.flush_body(&body),
            None => {
                body.fail();
                body.deliver();
            }
        });
    }

    /// Buffers the whole body and hands it to `on_complete`.
    pub fn collect<F>(self, on_complete: F)
    where
        F: FnOnce(Result<Bytes, HttpError>) + Send + 'static,
    {
        self.subscribe(Collect { buf: BytesMut::new(), on_complete: Some(on_complete) });
    }
}

impl Drop for RequestBody {
    fn drop(&mut self) {
        let Some(body) = self.inner.take() else {
            return;
        };
        trace!(tx = body.tx.id(), "request body dropped unread, discarding it");
        body.detach();

        let reactor = body.tx.reactor().clone();
        reactor.post(move || {
            if let Some(connection) = body.tx.connection() {
                connection.flush_body(&body);
            }
        });
    }
}

impl std::fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestBody").field("content_length", &self.content_length()).finish()
    }
}

struct Collect<F> {
    buf: BytesMut,
    on_complete: Option<F>,
}

impl<F> BodyConsumer for Collect<F>
where
    F: FnOnce(Result<Bytes, HttpError>) + Send + 'static,
{
    fn on_data(&mut self, data: Bytes, _resume: BodyResume) -> bool {
        self.buf.extend_from_slice(&data);
        false
    }

    fn on_end(&mut self) {
        if let Some(on_complete) = self.on_complete.take() {
            on_complete(Ok(self.buf.split().freeze()));
        }
    }

    fn on_error(&mut self, error: &HttpError) {
        if let Some(on_complete) = self.on_complete.take() {
            on_complete(Err(HttpError::application(error.to_string())));
        }
    }
}

pub(crate) struct BodyShared {
    tx: Arc<Transaction>,
    payload_size: PayloadSize,
    state: Mutex<BodyState>,
}

#[derive(Default)]
struct BodyState {
    consumer: Option<Box<dyn BodyConsumer>>,
    subscribed: bool,
    detached: bool,
    stash: VecDeque<Bytes>,
    ended: bool,
    failed: bool,
    done: bool,
    awaiting: Option<u64>,
    epoch: u64,
}

impl BodyShared {
    pub(crate) fn new(tx: Arc<Transaction>, payload_size: PayloadSize) -> Self {
        Self { tx, payload_size, state: Mutex::new(BodyState::default()) }
    }

    /// Whether the connection has to stop handing out events until this body moves on.
    pub(crate) fn blocks_parsing(&self) -> bool {
        let state = lock(&self.state);
        !state.detached && !state.done && (state.awaiting.is_some() || !state.stash.is_empty())
    }

    pub(crate) fn push_chunk(&self, data: Bytes) {
        let mut state = lock(&self.state);
        if !state.detached && !state.done {
            state.stash.push_back(data);
        }
    }

    pub(crate) fn push_end(&self) {
        lock(&self.state).ended = true;
    }

    /// The body will never be completed.
    pub(crate) fn fail(&self) {
        let mut state = lock(&self.state);
        if !state.ended {
            state.failed = true;
        }
    }

    fn attach(&self, consumer: Box<dyn BodyConsumer>) {
        let mut state = lock(&self.state);
        state.consumer = Some(consumer);
        state.subscribed = true;
    }

    fn detach(&self) {
        let mut state = lock(&self.state);
        state.detached = true;
        state.stash.clear();
    }

    fn resume(&self, epoch: u64) -> bool {
        let mut state = lock(&self.state);
        if state.awaiting != Some(epoch) {
            return false;
        }
        state.awaiting = None;
        true
    }

    /// Hands stashed chunks, then the end or the failure, to the consumer.
    ///
    /// Returns `true` when the consumer paused delivery. Must not be called with the
    /// connection core locked: the consumer may call back into the connection.
    pub(crate) fn deliver(self: &Arc<Self>) -> bool {
        loop {
            let mut state = lock(&self.state);
            if !state.subscribed || state.done || state.awaiting.is_some() {
                return state.awaiting.is_some();
            }
            let Some(mut consumer) = state.consumer.take() else {
                return false;
            };

            if let Some(chunk) = state.stash.pop_front() {
                state.epoch += 1;
                let epoch = state.epoch;
                drop(state);

                let deferred = consumer.on_data(chunk, BodyResume { body: Arc::clone(self), epoch });

                let mut state = lock(&self.state);
                state.consumer = Some(consumer);
                if deferred {
                    state.awaiting = Some(epoch);
                    return true;
                }
            } else if state.ended || state.failed {
                state.done = true;
                let ended = state.ended;
                drop(state);

                if ended {
                    consumer.on_end();
                } else {
                    consumer.on_error(&HttpError::from(SendError::ConnectionClosed));
                }
                return false;
            } else {
                state.consumer = Some(consumer);
                return false;
            }
        }
    }
}
