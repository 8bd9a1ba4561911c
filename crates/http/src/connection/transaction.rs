//! One request/response pair on a connection.

use std::sync::{Arc, Mutex, Weak};

use http::{Method, Version};
use tracing::debug;

use crate::connection::http_connection::ConnectionShared;
use crate::protocol::{RequestHeader, ResponseState, SendError};
use crate::reactor::Reactor;
use crate::utils::lock;

pub(crate) struct Transaction {
    id: u64,
    version: Version,
    keep_alive: bool,
    is_head: bool,
    expect_continue: bool,
    reactor: Reactor,
    connection: Weak<ConnectionShared>,
    state: Mutex<ResponseState>,
}

impl Transaction {
    pub(crate) fn new(
        id: u64,
        header: &RequestHeader,
        keep_alive: bool,
        reactor: Reactor,
        connection: Weak<ConnectionShared>,
    ) -> Self {
        Self {
            id,
            version: header.version(),
            keep_alive,
            is_head: *header.method() == Method::HEAD,
            expect_continue: header.expects_continue(),
            reactor,
            connection,
            state: Mutex::new(ResponseState::new()),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn version(&self) -> Version {
        self.version
    }

    /// The keep-alive hint of the request.
    pub(crate) fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub(crate) fn is_head(&self) -> bool {
        self.is_head
    }

    pub(crate) fn expect_continue(&self) -> bool {
        self.expect_continue
    }

    pub(crate) fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    pub(crate) fn connection(&self) -> Option<Arc<ConnectionShared>> {
        self.connection.upgrade()
    }

    pub(crate) fn state(&self) -> &Mutex<ResponseState> {
        &self.state
    }

    /// Renders `100 Continue` if the request asked for it and the final head has not
    /// been started; does nothing on later calls.
    pub(crate) fn send_continue(&self) -> Result<(), SendError> {
        let mut state = lock(&self.state);
        state.ensure_mutable()?;
        if !self.expect_continue || !state.begin_continue() {
            return Ok(());
        }

        let connection = self.connection().ok_or(SendError::ConnectionClosed)?;
        connection.write_continue(self)
    }

    /// The continue a subscribing body consumer implies; failures only get logged.
    pub(crate) fn request_continue(&self) {
        if !self.expect_continue {
            return;
        }
        if let Err(e) = self.send_continue() {
            debug!(tx = self.id, cause = %e, "skipped 100 continue");
        }
    }
}
