//! Incremental request parsing for one connection.
//!
//! [`RequestParser`] buffers the bytes read from a socket, runs them through
//! [`RequestDecoder`] and queues the outcome as [`RequestEvent`]s in arrival order. A
//! single read carrying several pipelined requests yields all of their events at once.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::codec::{DEFAULT_MAX_HEADER_BYTES, RequestDecoder};
use crate::protocol::{Message, ParseError, PayloadItem, PayloadSize, RequestHeader};

#[derive(Debug)]
pub enum RequestEvent {
    Headers { header: RequestHeader, payload_size: PayloadSize, keep_alive: bool },
    BodyChunk(Bytes),
    End,
}

#[derive(Debug)]
pub struct RequestParser {
    decoder: RequestDecoder,
    buffer: BytesMut,
    events: VecDeque<RequestEvent>,
    keep_alive: bool,
    /// Halt once the body in progress has been read.
    halt_pending: bool,
    halted: bool,
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HEADER_BYTES)
    }
}

impl RequestParser {
    pub fn new(max_header_bytes: usize) -> Self {
        Self {
            decoder: RequestDecoder::with_max_header_bytes(max_header_bytes),
            buffer: BytesMut::new(),
            events: VecDeque::new(),
            keep_alive: true,
            halt_pending: false,
            halted: false,
        }
    }

    /// Parses `data` and queues every event it completes.
    ///
    /// Once the connection is known to close after the current request, further bytes
    /// are discarded.
    pub fn feed(&mut self, data: &[u8]) -> Result<(), ParseError> {
        if self.halted {
            trace!(bytes = data.len(), "discarding bytes after the last request");
            return Ok(());
        }
        self.buffer.extend_from_slice(data);

        while !self.halted {
            let Some(message) = self.decoder.decode(&mut self.buffer)? else {
                break;
            };

            let event = match message {
                Message::Header((header, payload_size)) => {
                    let keep_alive = header.keep_alive();
                    self.keep_alive = keep_alive;
                    RequestEvent::Headers { header, payload_size, keep_alive }
                }
                Message::Payload(PayloadItem::Chunk(bytes)) => RequestEvent::BodyChunk(bytes),
                Message::Payload(PayloadItem::Eof) => {
                    if !self.keep_alive || self.halt_pending {
                        self.stop();
                    }
                    RequestEvent::End
                }
            };
            self.events.push_back(event);
        }
        Ok(())
    }

    pub fn next_event(&mut self) -> Option<RequestEvent> {
        self.events.pop_front()
    }

    /// Puts an event back at the front of the queue.
    pub fn push_front(&mut self, event: RequestEvent) {
        self.events.push_front(event);
    }

    pub fn has_events(&self) -> bool {
        !self.events.is_empty()
    }

    /// No queued event and no partially received request.
    pub fn is_idle(&self) -> bool {
        self.events.is_empty() && (self.halted || (self.buffer.is_empty() && !self.decoder.in_payload()))
    }

    /// Copies the queued body chunks into owned storage.
    ///
    /// Queued chunks are slices of the parse buffer; once a consumer stops acknowledging,
    /// they would otherwise pin the buffer's allocation until delivered.
    pub fn rebuffer(&mut self) {
        for event in &mut self.events {
            if let RequestEvent::BodyChunk(bytes) = event {
                let owned = Bytes::copy_from_slice(bytes);
                *bytes = owned;
            }
        }
        if self.buffer.is_empty() {
            self.buffer = BytesMut::new();
        }
    }

    /// Stops parsing after the request in progress: its body is still read to the end,
    /// no request after it will be produced.
    pub fn halt(&mut self) {
        if self.decoder.in_payload() {
            self.halt_pending = true;
        } else {
            self.stop();
        }
    }

    /// Stops parsing right away, dropping whatever was not decoded yet.
    pub fn stop(&mut self) {
        if !self.halted {
            self.halted = true;
            self.halt_pending = false;
            self.buffer.clear();
        }
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Checks that the peer's FIN did not cut a request short.
    pub fn finish(&mut self) -> Result<(), ParseError> {
        if self.halted {
            return Ok(());
        }
        if self.decoder.in_payload() {
            return Err(ParseError::IncompleteBody { remaining: self.decoder.remaining_payload() });
        }
        if !self.buffer.is_empty() {
            return Err(ParseError::invalid_header("connection closed in the middle of a request head"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    fn drain(parser: &mut RequestParser) -> Vec<RequestEvent> {
        std::iter::from_fn(|| parser.next_event()).collect()
    }

    #[test]
    fn pipelined_requests_in_one_read() {
        let mut parser = RequestParser::default();
        parser
            .feed(
                indoc! {"
                    GET / HTTP/1.1\r
                    Host: x\r
                    \r
                    POST /upload HTTP/1.1\r
                    Host: x\r
                    Content-Length: 5\r
                    \r
                    helloGET /3 HTTP/1.1\r
                    Host: x\r
                    \r
                    "}
                .as_bytes(),
            )
            .unwrap();

        let events = drain(&mut parser);
        assert_eq!(events.len(), 7);

        let paths: Vec<_> = events
            .iter()
            .filter_map(|event| match event {
                RequestEvent::Headers { header, .. } => Some(header.uri().path().to_owned()),
                _ => None,
            })
            .collect();
        assert_eq!(paths, ["/", "/upload", "/3"]);
        assert_eq!(events.iter().filter(|event| matches!(event, RequestEvent::End)).count(), 3);

        assert!(matches!(events[1], RequestEvent::End));
        assert!(matches!(&events[3], RequestEvent::BodyChunk(bytes) if &bytes[..] == b"hello"));
        assert!(matches!(events[4], RequestEvent::End));
        assert!(parser.is_idle());
    }

    #[test]
    fn head_split_across_reads() {
        let mut parser = RequestParser::default();
        parser.feed(b"GET /index.html HT").unwrap();
        assert!(parser.next_event().is_none());
        assert!(!parser.is_idle());

        parser.feed(b"TP/1.1\r\nHost: x\r\n\r\n").unwrap();
        match parser.next_event() {
            Some(RequestEvent::Headers { header, keep_alive, payload_size }) => {
                assert_eq!(header.uri().path(), "/index.html");
                assert!(keep_alive);
                assert!(payload_size.is_empty());
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(parser.next_event(), Some(RequestEvent::End)));
    }

    #[test]
    fn rebuffered_chunks_keep_order_and_content() {
        let mut parser = RequestParser::default();
        parser.feed(b"POST / HTTP/1.1\r\nContent-Length: 8\r\n\r\nabcd").unwrap();
        parser.feed(b"efgh").unwrap();

        assert!(matches!(parser.next_event(), Some(RequestEvent::Headers { .. })));
        assert!(matches!(parser.next_event(), Some(RequestEvent::BodyChunk(bytes)) if &bytes[..] == b"abcd"));

        parser.rebuffer();
        assert!(matches!(parser.next_event(), Some(RequestEvent::BodyChunk(bytes)) if &bytes[..] == b"efgh"));
        assert!(matches!(parser.next_event(), Some(RequestEvent::End)));
    }

    #[test]
    fn http10_request_halts_parsing() {
        let mut parser = RequestParser::default();
        parser.feed(b"GET /a HTTP/1.0\r\n\r\nGET /b HTTP/1.0\r\n\r\n").unwrap();

        let events = drain(&mut parser);
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], RequestEvent::Headers { keep_alive: false, .. }));
        assert!(parser.is_halted());

        parser.feed(b"GET /c HTTP/1.1\r\n\r\n").unwrap();
        assert!(parser.next_event().is_none());
        parser.finish().unwrap();
    }

    #[test]
    fn connection_close_halts_after_request() {
        let mut parser = RequestParser::default();
        parser
            .feed(b"GET / HTTP/1.1\r\nHost: x\r\n\r\nGET /2 HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\nGET /3 HTTP/1.1\r\n\r\n")
            .unwrap();

        let events = drain(&mut parser);
        assert_eq!(events.len(), 4);
        assert!(matches!(&events[2], RequestEvent::Headers { keep_alive: false, .. }));
        assert!(parser.is_halted());
    }

    #[test]
    fn halt_reads_the_body_in_progress_to_the_end() {
        let mut parser = RequestParser::default();
        parser.feed(b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nhello").unwrap();
        parser.halt();
        assert!(!parser.is_halted());
        assert!(!parser.is_idle());

        parser.feed(b"worldGET /next HTTP/1.1\r\n\r\n").unwrap();
        assert!(parser.is_halted());

        let events = drain(&mut parser);
        assert_eq!(events.len(), 4);
        assert!(matches!(&events[2], RequestEvent::BodyChunk(bytes) if &bytes[..] == b"world"));
        assert!(matches!(events[3], RequestEvent::End));
        parser.finish().unwrap();
    }

    #[test]
    fn halt_between_requests_drops_a_partial_head() {
        let mut parser = RequestParser::default();
        parser.feed(b"GET / HTTP/1.1\r\n\r\nGET /next HT").unwrap();
        parser.halt();
        assert!(parser.is_halted());
        assert!(parser.is_idle());
        assert_eq!(drain(&mut parser).len(), 2);
    }

    #[test]
    fn finish_in_the_middle_of_a_body() {
        let mut parser = RequestParser::default();
        parser.feed(b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\n1234").unwrap();
        assert!(matches!(parser.finish(), Err(ParseError::IncompleteBody { remaining: 6 })));
    }

    #[test]
    fn finish_in_the_middle_of_a_head() {
        let mut parser = RequestParser::default();
        parser.feed(b"GET / HTTP/1.1\r\nHost:").unwrap();
        assert!(matches!(parser.finish(), Err(ParseError::InvalidHeader { .. })));

        let mut parser = RequestParser::default();
        parser.feed(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        parser.finish().unwrap();
    }

    #[test]
    fn malformed_request_is_an_error() {
        let mut parser = RequestParser::default();
        assert!(parser.feed(b"GET / HTTP/1.1\r\nbad header\r\n\r\n").is_err());
    }
}
