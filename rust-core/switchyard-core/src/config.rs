//! # Configuration
//!
//! Plain structs with safe defaults and `#[must_use]` builders.

use crate::decode::DecodeOptions;
use hyper::header::HeaderName;
use std::net::SocketAddr;
use std::time::Duration;

/// Default request id header
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Request pipeline configuration
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Include full error messages and details in default error responses
    pub development_mode: bool,
    /// Watchdog for every interceptor, handler and error handler step
    pub handler_timeout: Option<Duration>,
    /// Deadline for reading and decoding the request body
    pub body_timeout: Option<Duration>,
    /// Decode options used by routes without their own
    pub decode: DecodeOptions,
    /// Header carrying the request id, read from the request and echoed back
    pub request_id_header: HeaderName,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            development_mode: false,
            handler_timeout: Some(Duration::from_secs(30)),
            body_timeout: Some(Duration::from_secs(30)),
            decode: DecodeOptions::default(),
            request_id_header: HeaderName::from_static(REQUEST_ID_HEADER),
        }
    }
}

impl PipelineConfig {
    /// Create a configuration with defaults
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle development mode
    #[must_use]
    pub fn development_mode(mut self, enabled: bool) -> Self {
        self.development_mode = enabled;
        self
    }

    /// Set or clear the watchdog timeout
    #[must_use]
    pub fn handler_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handler_timeout = timeout;
        self
    }

    /// Set or clear the body read deadline
    #[must_use]
    pub fn body_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.body_timeout = timeout;
        self
    }

    /// Replace the pipeline-wide decode options
    #[must_use]
    pub fn decode(mut self, decode: DecodeOptions) -> Self {
        self.decode = decode;
        self
    }

    /// Use another request id header
    #[must_use]
    pub fn request_id_header(mut self, header: HeaderName) -> Self {
        self.request_id_header = header;
        self
    }
}

/// HTTP Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server to
    pub address: SocketAddr,
    /// Enable keep-alive connections
    pub keep_alive: bool,
    /// Shutdown timeout for graceful shutdown (default: 30 seconds)
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: ([127, 0, 0, 1], 8000).into(),
            keep_alive: true,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    /// Set the bind address
    #[must_use]
    pub const fn address(mut self, address: SocketAddr) -> Self {
        self.address = address;
        self
    }

    /// Toggle keep-alive
    #[must_use]
    pub const fn keep_alive(mut self, enabled: bool) -> Self {
        self.keep_alive = enabled;
        self
    }

    /// Set the drain timeout used on shutdown
    #[must_use]
    pub const fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.address.port(), 8000);
        assert!(config.keep_alive);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_pipeline_config_defaults_are_safe() {
        let config = PipelineConfig::default();
        assert!(!config.development_mode);
        assert!(config.handler_timeout.is_some());
        assert!(config.body_timeout.is_some());
        assert!(!config.decode.xml.allow_dtd);
        assert!(!config.decode.xml.allow_external_entities);
        assert_eq!(config.request_id_header.as_str(), REQUEST_ID_HEADER);
    }

    #[test]
    fn test_pipeline_config_builders() {
        let config = PipelineConfig::new()
            .development_mode(true)
            .handler_timeout(None)
            .decode(DecodeOptions::new().max_body_size(64));
        assert!(config.development_mode);
        assert!(config.handler_timeout.is_none());
        assert_eq!(config.decode.max_body_size, 64);
    }
}
