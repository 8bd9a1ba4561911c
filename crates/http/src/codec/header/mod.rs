//! HTTP header processing module for encoding and decoding heads
//!
//! - [`HeaderDecoder`]: Decodes request heads from raw bytes, enforcing size limits
//! - [`HeaderEncoder`]: Renders response heads, injecting the `Connection` header

mod header_decoder;
mod header_encoder;

pub use header_decoder::DEFAULT_MAX_HEADER_BYTES;
pub use header_decoder::HeaderDecoder;
pub use header_decoder::MAX_HEADER_NUM;
pub use header_encoder::HeaderEncoder;
pub use header_encoder::encode_continue;
