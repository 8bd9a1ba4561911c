//! HTTP response head and the state machine guarding how a response reaches the wire.

use http::Response;

use crate::protocol::SendError;

/// Type alias for HTTP response headers.
///
/// This type represents the header portion of an HTTP response, using
/// `http::Response<()>` with an empty body placeholder.
pub type ResponseHead = Response<()>;

/// Coarse progress of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponsePhase {
    /// Nothing but an optional `100 Continue` has been rendered; the head is still mutable.
    Pending,
    /// The head has been rendered; only body bytes may follow.
    HeadersSent,
    /// The body producer signaled end.
    Finished,
    /// The response was abandoned by an application error.
    Failed,
}

/// Tracks what a response has already put on the wire.
///
/// Every transition is guarded: the head is rendered exactly once, no body byte precedes it,
/// and `100 Continue` may only precede the head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseState {
    phase: ResponsePhase,
    continue_sent: bool,
    keep_alive: Option<bool>,
}

impl Default for ResponseState {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseState {
    pub fn new() -> Self {
        Self { phase: ResponsePhase::Pending, continue_sent: false, keep_alive: None }
    }

    pub fn phase(&self) -> ResponsePhase {
        self.phase
    }

    pub fn continue_sent(&self) -> bool {
        self.continue_sent
    }

    /// The keep-alive decision, known once the head has been rendered.
    pub fn keep_alive(&self) -> Option<bool> {
        self.keep_alive
    }

    /// Whether the head may still be mutated.
    pub fn ensure_mutable(&self) -> Result<(), SendError> {
        match self.phase {
            ResponsePhase::Pending => Ok(()),
            ResponsePhase::HeadersSent => Err(SendError::HeadersAlreadySent),
            ResponsePhase::Finished | ResponsePhase::Failed => Err(SendError::BodyFinished),
        }
    }

    /// Marks `100 Continue` as rendered; returns `false` when it must not be rendered
    /// (already sent, or the final head is already on its way).
    pub fn begin_continue(&mut self) -> bool {
        if self.phase != ResponsePhase::Pending || self.continue_sent {
            return false;
        }
        self.continue_sent = true;
        true
    }

    pub fn begin_headers(&mut self) -> Result<(), SendError> {
        self.ensure_mutable()?;
        self.phase = ResponsePhase::HeadersSent;
        Ok(())
    }

    pub fn record_keep_alive(&mut self, keep_alive: bool) {
        self.keep_alive = Some(keep_alive);
    }

    pub fn ensure_body(&self) -> Result<(), SendError> {
        match self.phase {
            ResponsePhase::HeadersSent => Ok(()),
            ResponsePhase::Pending => Err(SendError::invalid_body("body written before response head")),
            ResponsePhase::Finished | ResponsePhase::Failed => Err(SendError::BodyFinished),
        }
    }

    pub fn finish(&mut self) -> Result<(), SendError> {
        self.ensure_body()?;
        self.phase = ResponsePhase::Finished;
        Ok(())
    }

    /// Marks the response failed and returns the phase it failed from.
    pub fn fail(&mut self) -> ResponsePhase {
        let previous = self.phase;
        if !matches!(previous, ResponsePhase::Finished) {
            self.phase = ResponsePhase::Failed;
        }
        previous
    }

    /// Whether the response still expects calls from its producer.
    pub fn is_open(&self) -> bool {
        matches!(self.phase, ResponsePhase::Pending | ResponsePhase::HeadersSent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_are_rendered_once() {
        let mut state = ResponseState::new();
        assert!(state.ensure_mutable().is_ok());
        state.begin_headers().unwrap();
        assert!(matches!(state.begin_headers(), Err(SendError::HeadersAlreadySent)));
        assert!(matches!(state.ensure_mutable(), Err(SendError::HeadersAlreadySent)));
    }

    #[test]
    fn body_requires_head() {
        let mut state = ResponseState::new();
        assert!(state.ensure_body().is_err());
        state.begin_headers().unwrap();
        state.ensure_body().unwrap();
        state.finish().unwrap();
        assert!(matches!(state.ensure_body(), Err(SendError::BodyFinished)));
        assert!(!state.is_open());
    }

    #[test]
    fn continue_only_before_head() {
        let mut state = ResponseState::new();
        assert!(state.begin_continue());
        assert!(!state.begin_continue());
        assert!(state.continue_sent());

        let mut state = ResponseState::new();
        state.begin_headers().unwrap();
        assert!(!state.begin_continue());
    }

    #[test]
    fn fail_reports_previous_phase() {
        let mut state = ResponseState::new();
        assert_eq!(state.fail(), ResponsePhase::Pending);
        assert_eq!(state.phase(), ResponsePhase::Failed);

        let mut state = ResponseState::new();
        state.begin_headers().unwrap();
        assert_eq!(state.fail(), ResponsePhase::HeadersSent);

        let mut state = ResponseState::new();
        state.begin_headers().unwrap();
        state.finish().unwrap();
        assert_eq!(state.fail(), ResponsePhase::Finished);
        assert_eq!(state.phase(), ResponsePhase::Finished);
    }
}
