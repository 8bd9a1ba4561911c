//! A byte queue made of shared byte ranges.
//!
//! [`ConnectionBuffer`] keeps appended [`Bytes`] as separate ranges, so appending never
//! copies and consuming a prefix only drops or trims the front ranges instead of
//! compacting the whole buffer. It backs a socket's unsent output and the output a
//! response produces while it waits for its turn on the connection.

use std::collections::VecDeque;
use std::io::IoSlice;

use bytes::{Buf, BufMut, Bytes, BytesMut};

#[derive(Debug, Default)]
pub struct ConnectionBuffer {
    chunks: VecDeque<Bytes>,
    remaining: usize,
}

impl ConnectionBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a byte range; empty ranges are ignored.
    pub fn push(&mut self, bytes: Bytes) {
        if bytes.is_empty() {
            return;
        }
        self.remaining += bytes.len();
        self.chunks.push_back(bytes);
    }

    /// Appends a copy of `data`.
    pub fn push_slice(&mut self, data: &[u8]) {
        self.push(Bytes::copy_from_slice(data));
    }

    pub fn len(&self) -> usize {
        self.remaining
    }

    pub fn is_empty(&self) -> bool {
        self.remaining == 0
    }

    /// Number of byte ranges currently queued.
    pub fn range_count(&self) -> usize {
        self.chunks.len()
    }

    /// Removes and returns the first byte range.
    pub fn pop_range(&mut self) -> Option<Bytes> {
        let bytes = self.chunks.pop_front()?;
        self.remaining -= bytes.len();
        Some(bytes)
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.remaining = 0;
    }
}

impl Buf for ConnectionBuffer {
    fn remaining(&self) -> usize {
        self.remaining
    }

    fn chunk(&self) -> &[u8] {
        match self.chunks.front() {
            Some(bytes) => bytes,
            None => &[],
        }
    }

    fn chunks_vectored<'a>(&'a self, dst: &mut [IoSlice<'a>]) -> usize {
        let mut count = 0;
        for (slot, bytes) in dst.iter_mut().zip(&self.chunks) {
            *slot = IoSlice::new(bytes);
            count += 1;
        }
        count
    }

    fn advance(&mut self, mut cnt: usize) {
        assert!(cnt <= self.remaining, "cannot advance past {} remaining bytes", self.remaining);
        self.remaining -= cnt;
        while cnt > 0 {
            let Some(front) = self.chunks.front_mut() else {
                break;
            };
            if cnt < front.len() {
                front.advance(cnt);
                break;
            }
            cnt -= front.len();
            self.chunks.pop_front();
        }
    }

    fn copy_to_bytes(&mut self, len: usize) -> Bytes {
        assert!(len <= self.remaining, "cannot take {len} bytes out of {}", self.remaining);
        if let Some(front) = self.chunks.front_mut() {
            if len <= front.len() {
                let bytes = front.split_to(len);
                if front.is_empty() {
                    self.chunks.pop_front();
                }
                self.remaining -= len;
                return bytes;
            }
        }

        let mut out = BytesMut::with_capacity(len);
        out.put((&mut *self).take(len));
        out.freeze()
    }
}
