//! # Error Handling
//!
//! Centralized error types for Switchyard core.
//! Uses `thiserror` for ergonomic error definitions.
//!
//! Every error that reaches the error lane can be rendered through
//! [`Error::report`], which yields the categorised `{statusCode, message,
//! kind, details}` shape consumed by response formatters.

use crate::decode::Format;
use crate::router::Method;
use hyper::StatusCode;
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

/// Stage label of a timed-out body read
pub const BODY_STAGE: &str = "body";

/// Result type alias for Switchyard operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for the Switchyard runtime
#[derive(Error, Debug)]
pub enum Error {
    /// Server failed to bind to the specified address
    #[error("Failed to bind server to {address}: {source}")]
    BindError {
        /// The address we tried to bind to
        address: String,
        /// The underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// Invalid route pattern provided at registration time
    #[error("Invalid route pattern: {pattern}: {reason}")]
    InvalidPattern {
        /// The invalid pattern
        pattern: String,
        /// Reason for invalidity
        reason: String,
    },

    /// Registration attempted after the router was sealed
    #[error("Router is sealed, cannot register {what}")]
    RouterSealed {
        /// What the caller tried to register (route or interceptor)
        what: String,
    },

    /// No route pattern matches the requested path
    #[error("No route found for {method} {path}")]
    RouteNotFound {
        /// Request method as received
        method: String,
        /// The path that wasn't matched
        path: String,
    },

    /// The path matches a route registered for other methods
    #[error("Method {method} not allowed for {path}")]
    MethodNotAllowed {
        /// Request method as received
        method: String,
        /// The matched path
        path: String,
        /// Methods registered for this path, in registration order
        allowed: Vec<Method>,
    },

    /// Request body could not be decoded
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Error raised by a terminal handler or an interceptor
    #[error("{message}")]
    Handler {
        /// HTTP status to report
        status: u16,
        /// Human readable message
        message: String,
        /// Optional structured details
        details: Option<Value>,
    },

    /// A step did not finish in time
    ///
    /// 408 when the body read (stage [`BODY_STAGE`]) stalled, 504 otherwise.
    #[error("Timed out after {}ms in {stage}", .after.as_millis())]
    HandlerTimeout {
        /// Chain stage that was running
        stage: &'static str,
        /// Configured timeout
        after: Duration,
    },

    /// A response was emitted twice for the same request
    #[error("Response already sent for this request")]
    ResponseAlreadySent,

    /// The connection went away before a response was produced
    #[error("Request cancelled: connection closed")]
    Cancelled,

    /// Transport-level failure, terminates only the affected request
    #[error("Pipeline failure: {message}")]
    PipelineFatal {
        /// Description of the failure
        message: String,
    },

    /// HTTP protocol error
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Body decoding failures, normalised across every wire format
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The declared media type or charset cannot be decoded
    #[error("Unsupported format {media_type}: {reason}")]
    UnsupportedFormat {
        /// Declared media type
        media_type: String,
        /// Why it was refused
        reason: String,
    },

    /// The payload is not valid for its declared format
    #[error("Malformed {format} payload: {message}")]
    MalformedPayload {
        /// Detected format
        format: Format,
        /// Decoder message
        message: String,
    },

    /// A resource ceiling was exceeded
    #[error("Payload too large: {scope} limit={limit}, received={actual}")]
    PayloadTooLarge {
        /// Which ceiling tripped (body, file, field, total, files, fields, rows)
        scope: &'static str,
        /// Configured ceiling
        limit: usize,
        /// Observed amount when the ceiling tripped
        actual: usize,
    },

    /// A tabular row failed a field predicate
    #[error("Schema validation failed for field '{field}' at row {row}")]
    SchemaValidationFailed {
        /// Offending column
        field: String,
        /// Zero-based data row index
        row: usize,
    },
}

impl DecodeError {
    /// Shorthand for a malformed payload error
    pub fn malformed(format: Format, message: impl ToString) -> Self {
        Self::MalformedPayload {
            format,
            message: message.to_string(),
        }
    }

    /// HTTP status for this decode failure (400 or 413)
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::PayloadTooLarge { .. } => 413,
            _ => 400,
        }
    }

    /// Category of this failure
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::UnsupportedFormat { .. } => ErrorKind::UnsupportedFormat,
            Self::MalformedPayload { .. } => ErrorKind::MalformedPayload,
            Self::PayloadTooLarge { .. } => ErrorKind::PayloadTooLarge,
            Self::SchemaValidationFailed { .. } => ErrorKind::SchemaValidationFailed,
        }
    }

    fn details(&self) -> Option<Value> {
        match self {
            Self::UnsupportedFormat { media_type, .. } => Some(json!({ "mediaType": media_type })),
            Self::MalformedPayload { format, .. } => Some(json!({ "format": format })),
            Self::PayloadTooLarge {
                scope,
                limit,
                actual,
            } => Some(json!({ "scope": scope, "limit": limit, "actual": actual })),
            Self::SchemaValidationFailed { field, row } => {
                Some(json!({ "field": field, "row": row }))
            }
        }
    }
}

/// Machine-readable error category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    /// Malformed route pattern
    InvalidPattern,
    /// Registration after sealing
    RouterSealed,
    /// 404
    RouteNotFound,
    /// 405
    MethodNotAllowed,
    /// Media type refused
    UnsupportedFormat,
    /// Payload failed to parse
    MalformedPayload,
    /// Ceiling exceeded
    PayloadTooLarge,
    /// Tabular predicate failed
    SchemaValidationFailed,
    /// Raised by user code
    HandlerError,
    /// Watchdog fired
    HandlerTimeout,
    /// Double emission
    ResponseAlreadySent,
    /// Transport failure
    PipelineFatal,
}

/// Categorised error shape handed to response formatters
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    /// HTTP status code
    pub status_code: u16,
    /// Message, generic unless development mode is on
    pub message: String,
    /// Category
    pub kind: ErrorKind,
    /// Structured details (development mode only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl Error {
    /// Create a handler error with an explicit status
    pub fn handler(status: u16, message: impl Into<String>) -> Self {
        Self::Handler {
            status,
            message: message.into(),
            details: None,
        }
    }

    /// Create a 400 handler error
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::handler(400, message)
    }

    /// Create a 500 handler error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::handler(500, message)
    }

    /// Attach structured details to a handler error (no-op for other variants)
    #[must_use]
    pub fn with_details(mut self, value: Value) -> Self {
        if let Self::Handler { details, .. } = &mut self {
            *details = Some(value);
        }
        self
    }

    /// HTTP status code for this error
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::RouteNotFound { .. } => 404,
            Self::MethodNotAllowed { .. } => 405,
            Self::Decode(e) => e.status_code(),
            Self::Handler { status, .. } => *status,
            Self::HandlerTimeout { stage: BODY_STAGE, .. } => 408,
            Self::HandlerTimeout { .. } => 504,
            _ => 500,
        }
    }

    /// Category of this error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidPattern { .. } => ErrorKind::InvalidPattern,
            Self::RouterSealed { .. } => ErrorKind::RouterSealed,
            Self::RouteNotFound { .. } => ErrorKind::RouteNotFound,
            Self::MethodNotAllowed { .. } => ErrorKind::MethodNotAllowed,
            Self::Decode(e) => e.kind(),
            Self::Handler { .. } => ErrorKind::HandlerError,
            Self::HandlerTimeout { .. } => ErrorKind::HandlerTimeout,
            Self::ResponseAlreadySent => ErrorKind::ResponseAlreadySent,
            Self::BindError { .. }
            | Self::Cancelled
            | Self::PipelineFatal { .. }
            | Self::Http(_)
            | Self::Io(_) => ErrorKind::PipelineFatal,
        }
    }

    /// Structured details, if any
    #[must_use]
    pub fn details(&self) -> Option<Value> {
        match self {
            Self::Decode(e) => e.details(),
            Self::Handler { details, .. } => details.clone(),
            Self::MethodNotAllowed { allowed, .. } => {
                let allowed: Vec<String> = allowed.iter().map(ToString::to_string).collect();
                Some(json!({ "allowed": allowed }))
            }
            _ => None,
        }
    }

    /// Render the categorised shape
    ///
    /// Outside development mode the message is the canonical reason phrase
    /// of the status code and details are dropped.
    #[must_use]
    pub fn report(&self, development_mode: bool) -> ErrorReport {
        let status_code = self.status_code();
        if development_mode {
            ErrorReport {
                status_code,
                message: self.to_string(),
                kind: self.kind(),
                details: self.details(),
            }
        } else {
            let message = StatusCode::from_u16(status_code)
                .ok()
                .and_then(|s| s.canonical_reason())
                .unwrap_or("Error")
                .to_string();
            ErrorReport {
                status_code,
                message,
                kind: self.kind(),
                details: None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_not_found_error() {
        let err = Error::RouteNotFound {
            method: "GET".to_string(),
            path: "/unknown".to_string(),
        };
        assert!(err.to_string().contains("/unknown"));
        assert_eq!(err.status_code(), 404);
        assert_eq!(err.kind(), ErrorKind::RouteNotFound);
    }

    #[test]
    fn test_bind_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::AddrInUse, "address in use");
        let err = Error::BindError {
            address: "0.0.0.0:8000".to_string(),
            source: io_err,
        };
        assert!(err.to_string().contains("0.0.0.0:8000"));
        assert_eq!(err.kind(), ErrorKind::PipelineFatal);
    }

    #[test]
    fn test_decode_status_codes() {
        let too_large = Error::from(DecodeError::PayloadTooLarge {
            scope: "file",
            limit: 10,
            actual: 11,
        });
        assert_eq!(too_large.status_code(), 413);

        let schema = Error::from(DecodeError::SchemaValidationFailed {
            field: "age".to_string(),
            row: 2,
        });
        assert_eq!(schema.status_code(), 400);
        assert_eq!(schema.kind(), ErrorKind::SchemaValidationFailed);
    }

    #[test]
    fn test_timeout_status_by_stage() {
        let after = Duration::from_millis(5);
        let body = Error::HandlerTimeout {
            stage: BODY_STAGE,
            after,
        };
        let handler = Error::HandlerTimeout {
            stage: "handler",
            after,
        };
        assert_eq!(body.status_code(), 408);
        assert_eq!(handler.status_code(), 504);
        assert_eq!(body.kind(), ErrorKind::HandlerTimeout);
    }

    #[test]
    fn test_report_production_hides_message() {
        let err = Error::internal("database password is hunter2");
        let report = err.report(false);
        assert_eq!(report.status_code, 500);
        assert_eq!(report.message, "Internal Server Error");
        assert!(report.details.is_none());
    }

    #[test]
    fn test_report_development_includes_details() {
        let err = Error::from(DecodeError::SchemaValidationFailed {
            field: "age".to_string(),
            row: 3,
        });
        let report = err.report(true);
        assert!(report.message.contains("age"));
        assert_eq!(report.details, Some(json!({ "field": "age", "row": 3 })));

        let rendered = serde_json::to_value(&report).unwrap();
        assert_eq!(rendered["statusCode"], 400);
        assert_eq!(rendered["kind"], "SchemaValidationFailed");
    }

    #[test]
    fn test_with_details_only_affects_handler_errors() {
        let err = Error::bad_request("nope").with_details(json!({ "x": 1 }));
        assert_eq!(err.details(), Some(json!({ "x": 1 })));

        let err = Error::ResponseAlreadySent.with_details(json!({ "x": 1 }));
        assert!(err.details().is_none());
    }
}
