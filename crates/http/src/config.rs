//! Typed configuration for sockets and the HTTP server.

use std::time::Duration;

use crate::codec::DEFAULT_MAX_HEADER_BYTES;

pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

pub const DEFAULT_MAX_PIPELINED_REQUESTS: usize = 16;

/// Per-socket I/O settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketConfig {
    /// Capacity reserved for each OS read.
    pub read_buffer_size: usize,
    /// Fails the socket with `TimedOut` when a read sees no bytes for this long.
    pub read_timeout: Option<Duration>,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self { read_buffer_size: DEFAULT_READ_BUFFER_SIZE, read_timeout: None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerConfig {
    pub socket: SocketConfig,
    pub max_header_bytes: usize,
    /// Responses a connection keeps in flight before it stops raising further
    /// pipelined requests.
    pub max_pipelined_requests: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket: SocketConfig::default(),
            max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
            max_pipelined_requests: DEFAULT_MAX_PIPELINED_REQUESTS,
        }
    }
}

impl ServerConfig {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    fn new() -> Self {
        Self { config: ServerConfig::default() }
    }

    pub fn read_buffer_size(mut self, size: usize) -> Self {
        // a zero sized read would be indistinguishable from peer FIN
        self.config.socket.read_buffer_size = size.max(1);
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.socket.read_timeout = Some(timeout);
        self
    }

    pub fn max_header_bytes(mut self, max_header_bytes: usize) -> Self {
        self.config.max_header_bytes = max_header_bytes;
        self
    }

    pub fn max_pipelined_requests(mut self, max: usize) -> Self {
        self.config.max_pipelined_requests = max.max(1);
        self
    }

    pub fn build(self) -> ServerConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.socket.read_buffer_size, 8 * 1024);
        assert_eq!(config.socket.read_timeout, None);
        assert_eq!(config.max_header_bytes, DEFAULT_MAX_HEADER_BYTES);
        assert_eq!(config.max_pipelined_requests, 16);
    }

    #[test]
    fn builder_overrides() {
        let config = ServerConfig::builder()
            .read_buffer_size(0)
            .read_timeout(Duration::from_secs(5))
            .max_header_bytes(1024)
            .max_pipelined_requests(0)
            .build();

        assert_eq!(config.socket.read_buffer_size, 1);
        assert_eq!(config.socket.read_timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.max_header_bytes, 1024);
        assert_eq!(config.max_pipelined_requests, 1);
    }
}
