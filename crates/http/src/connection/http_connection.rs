use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::{Bytes, BytesMut};
use http::header::{CONNECTION, CONTENT_LENGTH};
use http::{HeaderValue, StatusCode};
use tokio_util::codec::Encoder;
use tracing::{debug, trace, warn};

use crate::codec::{ResponseEncoder, ResponseFrame};
use crate::config::ServerConfig;
use crate::connection::request_body::{BodyShared, RequestBody};
use crate::connection::response::Response;
use crate::connection::segment::{Continuation, OutputSegment, SegmentChain};
use crate::connection::transaction::Transaction;
use crate::handler::RequestHandler;
use crate::parser::{RequestEvent, RequestParser};
use crate::protocol::{ResponseHead, SendError};
use crate::socket::{ReadResume, Socket, SocketError, SocketHandler};
use crate::utils::{has_token, lock};

/// An HTTP/1.x connection serving requests from one [`Socket`].
///
/// `HttpConnection` registers itself as the socket's handler and:
/// - parses the inbound bytes into requests, pipelined ones included
/// - raises every request to the [`RequestHandler`] in arrival order
/// - chains the responses so they reach the wire in request order, whatever order the
///   application completes them in
/// - decides keep-alive versus close per response and ends the socket accordingly
pub struct HttpConnection {
    shared: Arc<ConnectionShared>,
}

impl HttpConnection {
    pub fn new(socket: Socket, handler: Arc<dyn RequestHandler>) -> Result<Self, SocketError> {
        Self::with_config(socket, handler, &ServerConfig::default())
    }

    pub fn with_config(socket: Socket, handler: Arc<dyn RequestHandler>, config: &ServerConfig) -> Result<Self, SocketError> {
        Self::serve(socket, handler, config, Arc::new(AtomicBool::new(false)))
    }

    /// `draining` is shared with the server; once set, responses close their connection.
    pub(crate) fn serve(
        socket: Socket,
        handler: Arc<dyn RequestHandler>,
        config: &ServerConfig,
        draining: Arc<AtomicBool>,
    ) -> Result<Self, SocketError> {
        let shared = Arc::new_cyclic(|me| ConnectionShared {
            me: me.clone(),
            socket: socket.clone(),
            handler,
            draining,
            max_pipelined: config.max_pipelined_requests,
            core: Mutex::new(ConnectionCore {
                parser: RequestParser::new(config.max_header_bytes),
                segments: SegmentChain::default(),
                body: None,
                socket_resume: None,
                next_tx_id: 0,
                awaiting_capacity: false,
                read_finished: false,
                sentinel_added: false,
                closing: false,
                closed: false,
            }),
        });

        socket.set_handler(Arc::clone(&shared) as Arc<dyn SocketHandler>)?;
        debug!(socket = socket.id(), peer_addr = ?socket.peer_addr(), "http connection established");
        Ok(Self { shared })
    }

    pub fn socket(&self) -> &Socket {
        &self.shared.socket
    }

    /// Number of responses not yet handed completely to the socket.
    pub fn in_flight(&self) -> usize {
        lock(&self.shared.core).segments.responses()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.shared.core).closed
    }

    /// Tears the connection down right away, pending responses included.
    pub fn dispose(&self) {
        self.shared.dispose();
    }

    pub(crate) fn downgrade(&self) -> Weak<ConnectionShared> {
        Arc::downgrade(&self.shared)
    }
}

impl std::fmt::Debug for HttpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpConnection").field("socket", &self.shared.socket).finish()
    }
}

pub(crate) struct ConnectionShared {
    me: Weak<ConnectionShared>,
    socket: Socket,
    handler: Arc<dyn RequestHandler>,
    draining: Arc<AtomicBool>,
    max_pipelined: usize,
    core: Mutex<ConnectionCore>,
}

struct ConnectionCore {
    parser: RequestParser,
    segments: SegmentChain,
    /// Body of the request currently being parsed.
    body: Option<Arc<BodyShared>>,
    socket_resume: Option<ReadResume>,
    next_tx_id: u64,
    awaiting_capacity: bool,
    read_finished: bool,
    sentinel_added: bool,
    closing: bool,
    closed: bool,
}

impl ConnectionCore {
    fn is_blocked(&self) -> bool {
        self.awaiting_capacity || self.body.as_ref().is_some_and(|body| body.blocks_parsing())
    }
}

impl ConnectionShared {
    /// Raises queued request events to the application until the queue is empty or a
    /// body consumer holds delivery back, then resumes reading.
    fn drain(&self) {
        let mut core = lock(&self.core);
        loop {
            if core.closed {
                return;
            }
            if core.is_blocked() {
                break;
            }
            let Some(event) = core.parser.next_event() else {
                break;
            };

            match event {
                RequestEvent::Headers { header, payload_size, keep_alive } => {
                    if core.closing {
                        trace!(socket = self.socket.id(), uri = %header.uri(), "connection closing, request dropped");
                        continue;
                    }
                    if core.segments.responses() >= self.max_pipelined {
                        trace!(socket = self.socket.id(), "too many responses in flight, holding requests back");
                        core.parser.push_front(RequestEvent::Headers { header, payload_size, keep_alive });
                        core.awaiting_capacity = true;
                        break;
                    }

                    core.next_tx_id += 1;
                    let tx = Arc::new(Transaction::new(
                        core.next_tx_id,
                        &header,
                        keep_alive,
                        self.socket.reactor().clone(),
                        self.me.clone(),
                    ));
                    core.segments.push_response(tx.id());
                    let body = Arc::new(BodyShared::new(Arc::clone(&tx), payload_size));
                    core.body = Some(Arc::clone(&body));
                    drop(core);

                    debug!(
                        socket = self.socket.id(),
                        tx = tx.id(),
                        method = %header.method(),
                        uri = %header.uri(),
                        "request received"
                    );
                    self.handler.on_request(header, RequestBody::new(body), Response::new(tx));
                }
                RequestEvent::BodyChunk(bytes) => {
                    let Some(body) = core.body.clone() else {
                        continue;
                    };
                    drop(core);
                    body.push_chunk(bytes);
                    self.deliver(&body);
                }
                RequestEvent::End => {
                    let Some(body) = core.body.take() else {
                        continue;
                    };
                    drop(core);
                    body.push_end();
                    self.deliver(&body);
                }
            }
            core = lock(&self.core);
        }

        let resume = if core.is_blocked() || core.parser.has_events() { None } else { core.socket_resume.take() };
        self.maybe_add_sentinel(&mut core);
        drop(core);

        if let Some(resume) = resume {
            resume.resume();
        }
    }

    fn deliver(&self, body: &Arc<BodyShared>) {
        if body.deliver() {
            // the consumer holds delivery back; queued chunks must not pin the read buffer
            lock(&self.core).parser.rebuffer();
        }
    }

    /// Continues a body whose consumer subscribed, resumed or went away.
    pub(crate) fn flush_body(&self, body: &Arc<BodyShared>) {
        self.deliver(body);
        self.drain();
    }

    fn post_drain(&self) {
        if let Some(me) = self.me.upgrade() {
            self.socket.reactor().post(move || me.drain());
        }
    }

    pub(crate) fn write_continue(&self, tx: &Transaction) -> Result<(), SendError> {
        let mut dst = BytesMut::new();
        ResponseEncoder::new().encode(ResponseFrame::Continue(tx.version()), &mut dst)?;
        self.segment_write(tx.id(), dst.freeze(), Box::new(|| {})).map(|_| ())
    }

    /// Renders the head of `tx` and returns the keep-alive decision.
    pub(crate) fn send_head(
        &self,
        tx: &Transaction,
        head: &mut ResponseHead,
        body_allowed: bool,
        continue_sent: bool,
    ) -> Result<bool, SendError> {
        let mut core = lock(&self.core);
        if core.closed {
            return Err(SendError::ConnectionClosed);
        }

        *head.version_mut() = tx.version();
        let keep_alive = self.keep_alive(tx, head, body_allowed, continue_sent);
        if !keep_alive && head.headers().get(CONNECTION).is_some_and(|value| !has_token(value, b"close")) {
            head.headers_mut().insert(CONNECTION, HeaderValue::from_static("close"));
        }

        let mut dst = BytesMut::new();
        ResponseEncoder::new().encode(ResponseFrame::Head(head, keep_alive), &mut dst)?;
        self.write_locked(&mut core, tx.id(), dst.freeze(), Box::new(|| {}))?;

        if !keep_alive {
            if let Some(segment) = core.segments.get_mut(tx.id()) {
                segment.mark_close_after();
            }
            core.closing = true;
            core.parser.halt();
        }
        trace!(socket = self.socket.id(), tx = tx.id(), status = %head.status(), keep_alive, "response head rendered");
        Ok(keep_alive)
    }

    /// A `500` that closes the connection, for a response that failed before its head.
    pub(crate) fn send_error_head(&self, tx: &Transaction) -> Result<(), SendError> {
        let mut head = ResponseHead::new(());
        *head.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        *head.version_mut() = tx.version();
        head.headers_mut().insert(CONTENT_LENGTH, HeaderValue::from_static("0"));

        let mut dst = BytesMut::new();
        ResponseEncoder::new().encode(ResponseFrame::Head(&head, false), &mut dst)?;

        let mut core = lock(&self.core);
        self.write_locked(&mut core, tx.id(), dst.freeze(), Box::new(|| {}))?;
        self.end_locked(&mut core, tx.id(), true);
        Ok(())
    }

    pub(crate) fn segment_write(&self, tx_id: u64, data: Bytes, continuation: Continuation) -> Result<bool, SendError> {
        let mut core = lock(&self.core);
        self.write_locked(&mut core, tx_id, data, continuation)
    }

    pub(crate) fn segment_end(&self, tx_id: u64, close_after: bool) {
        let mut core = lock(&self.core);
        self.end_locked(&mut core, tx_id, close_after);
    }

    pub(crate) fn dispose(&self) {
        if let Err(e) = self.socket.dispose() {
            trace!(socket = self.socket.id(), cause = %e, "connection already disposed");
        }
    }

    /// Ends an idle connection; busy ones close after their current responses.
    pub(crate) fn shutdown_idle(&self) {
        let mut core = lock(&self.core);
        if !core.closed && !core.closing && core.segments.is_empty() && core.parser.is_idle() {
            debug!(socket = self.socket.id(), "closing idle connection");
            self.end_socket(&mut core);
        }
    }

    /// Decided per transaction: a later pipelined request asking to close must not cut
    /// the responses ahead of it short.
    fn keep_alive(&self, tx: &Transaction, head: &ResponseHead, body_allowed: bool, continue_sent: bool) -> bool {
        if self.draining.load(Ordering::Acquire) || !tx.keep_alive() {
            return false;
        }
        // the client may still be waiting to send a body nobody asked for
        if tx.expect_continue() && !continue_sent {
            return false;
        }
        // without a length the body is delimited by closing the connection
        if body_allowed && !head.headers().contains_key(CONTENT_LENGTH) {
            return false;
        }
        !head.headers().get(CONNECTION).is_some_and(|value| has_token(value, b"close"))
    }

    fn write_locked(
        &self,
        core: &mut ConnectionCore,
        tx_id: u64,
        data: Bytes,
        continuation: Continuation,
    ) -> Result<bool, SendError> {
        if !core.closed {
            if core.segments.is_active(tx_id) {
                return self.socket_write(data, continuation);
            }
            if let Some(segment) = core.segments.get_mut(tx_id) {
                segment.buffer(data, continuation);
                return Ok(true);
            }
        }
        self.drop_later(continuation);
        Err(SendError::ConnectionClosed)
    }

    /// Writes through the socket, which keeps `continuation` only when it returns `true`.
    fn socket_write(&self, data: Bytes, continuation: Continuation) -> Result<bool, SendError> {
        let slot = Arc::new(Mutex::new(Some(continuation)));
        let waiter = Arc::clone(&slot);
        let result = self.socket.write(data, move || {
            if let Some(continuation) = lock(&waiter).take() {
                continuation();
            }
        });

        if !matches!(result, Ok(true)) {
            if let Some(continuation) = lock(&slot).take() {
                self.drop_later(continuation);
            }
        }
        result.map_err(|e| {
            trace!(socket = self.socket.id(), cause = %e, "write on a finished socket");
            SendError::ConnectionClosed
        })
    }

    fn end_locked(&self, core: &mut ConnectionCore, tx_id: u64, close_after: bool) {
        if core.closed {
            return;
        }
        let Some(segment) = core.segments.get_mut(tx_id) else {
            return;
        };
        segment.finish(close_after);
        if close_after {
            core.closing = true;
            core.parser.halt();
        }
        if core.segments.is_active(tx_id) {
            self.advance(core);
        }
    }

    /// Retires finished segments from the front of the chain and hands the socket to
    /// the next one, flushing what it produced while waiting.
    fn advance(&self, core: &mut ConnectionCore) {
        while let Some(front) = core.segments.front_mut() {
            if front.is_sentinel() {
                let rest = core.segments.take();
                self.end_socket(core);
                self.drop_later(rest);
                return;
            }
            if !front.is_finished() {
                break;
            }

            let closes = front.closes_after();
            core.segments.pop_front();
            if closes {
                let rest = core.segments.take();
                self.end_socket(core);
                self.drop_later(rest);
                return;
            }

            if let Some(next) = core.segments.front_mut() {
                if !next.is_sentinel() {
                    self.flush_pending(next);
                }
            }
        }

        if core.awaiting_capacity && core.segments.responses() < self.max_pipelined {
            core.awaiting_capacity = false;
            self.post_drain();
        }
        if core.segments.is_empty() {
            if self.draining.load(Ordering::Acquire) && core.parser.is_idle() && !core.closing {
                self.end_socket(core);
            } else {
                self.maybe_add_sentinel(core);
            }
        }
    }

    /// Writes what a segment produced before it became active.
    fn flush_pending(&self, segment: &mut OutputSegment) {
        let (mut pending, waiters) = segment.take_pending();
        while let Some(range) = pending.pop_range() {
            if let Err(e) = self.socket.write(range, || {}) {
                trace!(socket = self.socket.id(), cause = %e, "dropping output of a closed connection");
                self.drop_later(waiters);
                return;
            }
        }
        if !waiters.is_empty() {
            self.socket.when_drained(move || {
                for waiter in waiters {
                    waiter();
                }
            });
        }
    }

    fn maybe_add_sentinel(&self, core: &mut ConnectionCore) {
        if !core.read_finished || core.sentinel_added || core.closing || core.closed || core.parser.has_events() {
            return;
        }
        core.sentinel_added = true;
        if core.segments.is_empty() {
            self.end_socket(core);
        } else {
            core.segments.push_sentinel();
        }
    }

    fn end_socket(&self, core: &mut ConnectionCore) {
        core.closing = true;
        core.parser.halt();
        if let Err(e) = self.socket.end() {
            trace!(socket = self.socket.id(), cause = %e, "socket already ended");
        }
    }

    /// Application continuations may own responses whose drop calls back into this
    /// connection, so they are never dropped under the core lock.
    fn drop_later<T: Send + 'static>(&self, value: T) {
        self.socket.reactor().post(move || drop(value));
    }
}

impl SocketHandler for ConnectionShared {
    fn on_data(&self, socket: &Socket, data: Bytes, resume: ReadResume) -> bool {
        let mut core = lock(&self.core);
        if core.closed {
            return true;
        }
        if let Err(e) = core.parser.feed(&data) {
            drop(core);
            warn!(socket = socket.id(), cause = %e, "malformed request, aborting connection");
            socket.abort(e.into());
            return true;
        }
        core.socket_resume = Some(resume);
        drop(core);

        self.drain();
        true
    }

    fn on_end(&self, socket: &Socket) {
        let mut core = lock(&self.core);
        core.read_finished = true;
        if let Err(e) = core.parser.finish() {
            if !core.closing {
                drop(core);
                warn!(socket = socket.id(), cause = %e, "connection closed mid-request");
                socket.abort(e.into());
                return;
            }

            // the responses already close the connection, only the body is cut short
            debug!(socket = socket.id(), cause = %e, "peer ended in the middle of a request body");
            core.parser.stop();
            let body = core.body.take();
            drop(core);
            if let Some(body) = body {
                body.fail();
                self.deliver(&body);
            }
        } else {
            drop(core);
        }

        self.drain();
    }

    fn on_error(&self, socket: &Socket, error: &SocketError) {
        debug!(socket = socket.id(), cause = %error, "http connection failed");
    }

    fn on_close(&self, socket: &Socket) {
        let mut core = lock(&self.core);
        core.closed = true;
        let segments = core.segments.take();
        let body = core.body.take();
        let resume = core.socket_resume.take();
        drop(core);

        debug!(socket = socket.id(), "http connection closed");
        drop(segments);
        drop(resume);
        if let Some(body) = body {
            body.fail();
            body.deliver();
        }
    }
}
