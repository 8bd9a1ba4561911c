//! Request payload decoding.
//!
//! Request bodies are framed by `Content-Length` only, as defined in
//! [RFC 9112 Section 6.2](https://www.rfc-editor.org/rfc/rfc9112#section-6.2); chunked
//! transfer encoding is rejected by the header decoder before a payload decoder exists.

use bytes::BytesMut;
use tokio_util::codec::Decoder;

use crate::protocol::{ParseError, PayloadItem, PayloadSize};

/// Splits the body of one request off the receive buffer.
///
/// Every chunk is a zero-copy slice of the buffer; the body ends with
/// [`PayloadItem::Eof`], which a request without a body yields right away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadDecoder {
    remaining: u64,
}

impl PayloadDecoder {
    pub fn new(length: u64) -> Self {
        Self { remaining: length }
    }

    /// Number of body bytes still expected.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }
}

impl From<PayloadSize> for PayloadDecoder {
    fn from(payload_size: PayloadSize) -> Self {
        Self::new(payload_size.len())
    }
}

impl Decoder for PayloadDecoder {
    type Item = PayloadItem;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.remaining == 0 {
            return Ok(Some(PayloadItem::Eof));
        }
        if src.is_empty() {
            return Ok(None);
        }

        let available = src.len();
        let len = usize::try_from(self.remaining).map_or(available, |remaining| remaining.min(available));
        let bytes = src.split_to(len).freeze();

        self.remaining -= bytes.len() as u64;
        Ok(Some(PayloadItem::Chunk(bytes)))
    }
}
