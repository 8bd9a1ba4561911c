use crate::codec::header::{HeaderEncoder, encode_continue};
use crate::protocol::{ResponseHead, SendError};
use bytes::BytesMut;
use http::Version;
use tokio_util::codec::Encoder;

/// The pieces of a response the pipeline renders itself; body bytes are written verbatim.
#[derive(Debug)]
pub enum ResponseFrame<'a> {
    /// Interim `100 Continue` for a request carrying `Expect: 100-continue`
    Continue(Version),
    /// The final head and the keep-alive decision
    Head(&'a ResponseHead, bool),
}

#[derive(Debug, Default)]
pub struct ResponseEncoder {
    header_encoder: HeaderEncoder,
}

impl ResponseEncoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Encoder<ResponseFrame<'_>> for ResponseEncoder {
    type Error = SendError;

    fn encode(&mut self, item: ResponseFrame<'_>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            ResponseFrame::Continue(version) => encode_continue(version, dst),
            ResponseFrame::Head(head, keep_alive) => self.header_encoder.encode((head, keep_alive), dst),
        }
    }
}
