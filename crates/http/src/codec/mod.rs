//! HTTP codec module for decoding requests and encoding response heads
//!
//! # Architecture
//!
//! - Request handling:
//!   - [`RequestDecoder`]: Decodes incoming HTTP requests into heads and payload items
//!   - Header parsing via [`HeaderDecoder`]
//!   - `Content-Length` payload decoding via the `body` module
//!
//! - Response handling:
//!   - [`ResponseEncoder`]: Renders `100 Continue` and final response heads
//!
//! Both sides follow `tokio_util::codec`'s [`Decoder`](tokio_util::codec::Decoder) and
//! [`Encoder`](tokio_util::codec::Encoder) traits so they can be driven by a buffer owned
//! by the caller, which is how [`RequestParser`](crate::parser::RequestParser) uses them.

mod body;
mod header;
mod request_decoder;
mod response_encoder;

pub use header::{DEFAULT_MAX_HEADER_BYTES, HeaderDecoder, HeaderEncoder, MAX_HEADER_NUM};
pub use request_decoder::RequestDecoder;
pub use response_encoder::{ResponseEncoder, ResponseFrame};
