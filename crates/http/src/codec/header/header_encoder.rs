//! HTTP header encoder implementation for serializing HTTP response heads
//!
//! This module renders a [`ResponseHead`] into raw bytes: the status line
//! `HTTP/<major>.<minor> <status>\r\n`, every header field, the `Connection` header
//! carrying the keep-alive decision (unless the application already set one), and the
//! terminating empty line.

use crate::protocol::{ResponseHead, SendError};

use bytes::{BufMut, BytesMut};

use http::{Version, header};
use std::io;
use std::io::{ErrorKind, Write};
use tokio_util::codec::Encoder;
use tracing::error;

/// Initial buffer size allocated for header serialization
const INIT_HEADER_SIZE: usize = 1024;

/// Encoder for HTTP response heads implementing the [`Encoder`] trait.
///
/// The item is the head together with the keep-alive decision of the connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderEncoder;

impl Encoder<(&ResponseHead, bool)> for HeaderEncoder {
    type Error = SendError;

    /// Encodes an HTTP response head into the provided bytes buffer.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP version is neither HTTP/1.0 nor HTTP/1.1
    fn encode(&mut self, item: (&ResponseHead, bool), dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (head, keep_alive) = item;

        dst.reserve(INIT_HEADER_SIZE);
        write_status_line(head.version(), head.status().as_str(), head.status().canonical_reason(), dst)?;

        // Write all headers
        for (header_name, header_value) in head.headers() {
            dst.put_slice(header_name.as_ref());
            dst.put_slice(b": ");
            dst.put_slice(header_value.as_ref());
            dst.put_slice(b"\r\n");
        }

        if !head.headers().contains_key(header::CONNECTION) {
            if keep_alive {
                dst.put_slice(b"Connection: keep-alive\r\n");
            } else {
                dst.put_slice(b"Connection: close\r\n");
            }
        }
        dst.put_slice(b"\r\n");
        Ok(())
    }
}

/// Renders the interim `100 Continue` response for the given request version.
pub fn encode_continue(version: Version, dst: &mut BytesMut) -> Result<(), SendError> {
    write_status_line(version, "100", Some("Continue"), dst)?;
    dst.put_slice(b"\r\n");
    Ok(())
}

fn write_status_line(version: Version, status: &str, reason: Option<&str>, dst: &mut BytesMut) -> Result<(), SendError> {
    let version = match version {
        Version::HTTP_11 => "HTTP/1.1",
        Version::HTTP_10 => "HTTP/1.0",
        v => {
            error!(http_version = ?v, "unsupported http version");
            return Err(io::Error::from(ErrorKind::Unsupported).into());
        }
    };

    match reason {
        Some(reason) => write!(FastWrite(dst), "{version} {status} {reason}\r\n")?,
        None => write!(FastWrite(dst), "{version} {status}\r\n")?,
    }
    Ok(())
}

/// Fast writer implementation for writing to BytesMut.
struct FastWrite<'a>(&'a mut BytesMut);

impl Write for FastWrite<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.put_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
