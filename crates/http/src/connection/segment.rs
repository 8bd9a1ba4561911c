//! The output segment chain of a connection.
//!
//! Every transaction owns one segment; the front segment is the active one and is the
//! only one allowed to write to the socket. Bytes produced for a segment that is not
//! active yet are kept in the segment until it reaches the front.

use std::collections::VecDeque;
use std::mem;

use bytes::Bytes;

use crate::buffer::ConnectionBuffer;

pub(crate) type Continuation = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SegmentKind {
    Response(u64),
    /// Ends the socket when it becomes active; appended once no request can follow.
    Sentinel,
}

pub(crate) struct OutputSegment {
    kind: SegmentKind,
    pending: ConnectionBuffer,
    waiters: Vec<Continuation>,
    finished: bool,
    close_after: bool,
}

impl OutputSegment {
    fn new(kind: SegmentKind) -> Self {
        Self { kind, pending: ConnectionBuffer::new(), waiters: Vec::new(), finished: false, close_after: false }
    }

    pub(crate) fn is_sentinel(&self) -> bool {
        self.kind == SegmentKind::Sentinel
    }

    /// Keeps `data` until the segment becomes active; `waiter` fires once it was flushed.
    pub(crate) fn buffer(&mut self, data: Bytes, waiter: Continuation) {
        self.pending.push(data);
        self.waiters.push(waiter);
    }

    pub(crate) fn take_pending(&mut self) -> (ConnectionBuffer, Vec<Continuation>) {
        (mem::take(&mut self.pending), mem::take(&mut self.waiters))
    }

    /// The response signaled end; `close_after` asks for the socket to be ended once
    /// this segment drained.
    pub(crate) fn finish(&mut self, close_after: bool) {
        self.finished = true;
        self.close_after |= close_after;
    }

    pub(crate) fn mark_close_after(&mut self) {
        self.close_after = true;
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished
    }

    pub(crate) fn closes_after(&self) -> bool {
        self.close_after
    }
}

#[derive(Default)]
pub(crate) struct SegmentChain {
    segments: VecDeque<OutputSegment>,
}

impl SegmentChain {
    /// Appends the segment of transaction `tx_id`; returns whether it is active.
    pub(crate) fn push_response(&mut self, tx_id: u64) -> bool {
        self.segments.push_back(OutputSegment::new(SegmentKind::Response(tx_id)));
        self.segments.len() == 1
    }

    pub(crate) fn push_sentinel(&mut self) -> bool {
        self.segments.push_back(OutputSegment::new(SegmentKind::Sentinel));
        self.segments.len() == 1
    }

    pub(crate) fn is_active(&self, tx_id: u64) -> bool {
        self.segments.front().is_some_and(|segment| segment.kind == SegmentKind::Response(tx_id))
    }

    pub(crate) fn get_mut(&mut self, tx_id: u64) -> Option<&mut OutputSegment> {
        self.segments.iter_mut().find(|segment| segment.kind == SegmentKind::Response(tx_id))
    }

    pub(crate) fn front_mut(&mut self) -> Option<&mut OutputSegment> {
        self.segments.front_mut()
    }

    pub(crate) fn pop_front(&mut self) -> Option<OutputSegment> {
        self.segments.pop_front()
    }

    /// Number of response segments, the sentinel excluded.
    pub(crate) fn responses(&self) -> usize {
        self.segments.iter().filter(|segment| !segment.is_sentinel()).count()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub(crate) fn take(&mut self) -> SegmentChain {
        mem::take(self)
    }
}
