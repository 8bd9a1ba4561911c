//! Core HTTP protocol abstractions.
//!
//! This module provides the types shared by the codec, the request parser and the
//! transaction pipeline:
//!
//! - **Message Handling** ([`message`]): [`Message`], [`PayloadItem`] and [`PayloadSize`]
//!   produced by the request decoder
//! - **Request Processing** ([`request`]): [`RequestHeader`], the request head raised to
//!   application code together with its keep-alive hint
//! - **Response Processing** ([`response`]): [`ResponseHead`] and the [`ResponseState`]
//!   machine enforcing that a head is rendered exactly once
//! - **Error Handling** ([`error`]): [`HttpError`], [`ParseError`] and [`SendError`]

mod message;
pub use message::Message;
pub use message::PayloadItem;
pub use message::PayloadSize;

mod request;
pub use request::RequestHeader;

mod response;
pub use response::ResponseHead;
pub use response::ResponsePhase;
pub use response::ResponseState;

mod error;
pub use error::HttpError;
pub use error::ParseError;
pub use error::SendError;
