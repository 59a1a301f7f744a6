//! # Response
//!
//! Value-producing response: handlers and interceptors return a
//! `(status, headers, payload)` triple and the transport adapter encodes it.
//! Nothing here writes to a socket.

use crate::error::Error;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderName, HeaderValue, ALLOW, CONTENT_TYPE};
use hyper::{HeaderMap, StatusCode};
use serde_json::Value;
use tracing::warn;

/// Typed response payload
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Payload {
    /// No body
    #[default]
    Empty,
    /// UTF-8 text
    Text(String),
    /// JSON document
    Json(Value),
    /// Raw bytes
    Bytes(Bytes),
}

impl Payload {
    /// Content type used when none was set explicitly
    #[must_use]
    pub const fn default_content_type(&self) -> Option<&'static str> {
        match self {
            Self::Empty => None,
            Self::Text(_) => Some("text/plain; charset=utf-8"),
            Self::Json(_) => Some("application/json"),
            Self::Bytes(_) => Some("application/octet-stream"),
        }
    }

    /// Encode to bytes
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        match self {
            Self::Empty => Bytes::new(),
            Self::Text(text) => Bytes::from(text.clone()),
            Self::Json(value) => Bytes::from(serde_json::to_vec(value).unwrap_or_default()),
            Self::Bytes(bytes) => bytes.clone(),
        }
    }
}

/// HTTP response produced by the pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// HTTP status code
    pub status: u16,
    /// Response headers
    pub headers: HeaderMap,
    /// Response payload
    pub payload: Payload,
}

impl Default for Response {
    fn default() -> Self {
        Self::new(200, Payload::Empty)
    }
}

impl Response {
    /// Create a response from parts
    #[must_use]
    pub fn new(status: u16, payload: Payload) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            payload,
        }
    }

    /// Create a JSON response
    #[must_use]
    pub fn json(value: Value) -> Self {
        Self::new(200, Payload::Json(value))
    }

    /// Create a text response
    #[must_use]
    pub fn text(body: impl Into<String>) -> Self {
        Self::new(200, Payload::Text(body.into()))
    }

    /// Create a binary response
    #[must_use]
    pub fn bytes(body: impl Into<Bytes>) -> Self {
        Self::new(200, Payload::Bytes(body.into()))
    }

    /// Create a response without a body
    #[must_use]
    pub fn empty(status: u16) -> Self {
        Self::new(status, Payload::Empty)
    }

    /// Default categorised failure response for an error
    ///
    /// `405` responses carry an `Allow` header listing the accepted methods.
    #[must_use]
    pub fn from_error(error: &Error, development_mode: bool) -> Self {
        let report = error.report(development_mode);
        let body = serde_json::to_value(&report).unwrap_or(Value::Null);
        let mut response = Self::json(body).with_status(report.status_code);

        if let Error::MethodNotAllowed { allowed, .. } = error {
            let allow: Vec<&str> = allowed.iter().map(|m| m.as_str()).collect();
            if let Ok(value) = HeaderValue::from_str(&allow.join(", ")) {
                response.headers.insert(ALLOW, value);
            }
        }
        response
    }

    /// Set status code
    #[must_use]
    pub const fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    /// Set header
    #[must_use]
    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.set_header(key, value);
        self
    }

    /// Set or override a header
    ///
    /// Invalid names or values are dropped with a warning.
    pub fn set_header(&mut self, key: &str, value: &str) {
        match (
            HeaderName::from_bytes(key.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                self.headers.insert(name, value);
            }
            _ => warn!(header = %key, "Dropping invalid response header"),
        }
    }

    /// Get a header value by name (case-insensitive)
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Encoded body
    #[must_use]
    pub fn body_bytes(&self) -> Bytes {
        self.payload.to_bytes()
    }

    /// Convert to hyper Response
    #[must_use]
    pub fn into_hyper(self) -> hyper::Response<Full<Bytes>> {
        let body = self.payload.to_bytes();
        let mut headers = self.headers;
        if !headers.contains_key(CONTENT_TYPE) {
            if let Some(content_type) = self.payload.default_content_type() {
                headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
            }
        }

        let mut response = hyper::Response::new(Full::new(body));
        *response.status_mut() =
            StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        *response.headers_mut() = headers;
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::Method;
    use http_body_util::BodyExt;
    use serde_json::json;

    #[test]
    fn test_response_json() {
        let resp = Response::json(json!({ "status": "ok" }));
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body_bytes().as_ref(), br#"{"status":"ok"}"#);
    }

    #[test]
    fn test_response_with_status_and_header() {
        let resp = Response::text("Not Found")
            .with_status(404)
            .with_header("X-Trace", "abc");
        assert_eq!(resp.status, 404);
        assert_eq!(resp.header("x-trace"), Some("abc"));
    }

    #[test]
    fn test_invalid_header_is_dropped() {
        let resp = Response::empty(204).with_header("bad header", "x");
        assert!(resp.headers.is_empty());
    }

    #[test]
    fn test_method_not_allowed_sets_allow_header() {
        let err = Error::MethodNotAllowed {
            method: "DELETE".to_string(),
            path: "/users".to_string(),
            allowed: vec![Method::Get, Method::Post],
        };
        let resp = Response::from_error(&err, false);
        assert_eq!(resp.status, 405);
        assert_eq!(resp.header("allow"), Some("GET, POST"));
        assert_eq!(
            resp.payload,
            Payload::Json(json!({
                "statusCode": 405,
                "message": "Method Not Allowed",
                "kind": "MethodNotAllowed"
            }))
        );
    }

    #[test]
    fn test_into_hyper_sets_content_type() {
        let hyper_resp = Response::text("hi").with_status(201).into_hyper();
        assert_eq!(hyper_resp.status(), StatusCode::CREATED);
        assert_eq!(
            hyper_resp.headers().get(CONTENT_TYPE).unwrap(),
            "text/plain; charset=utf-8"
        );
        let body = tokio_test::block_on(hyper_resp.into_body().collect())
            .unwrap()
            .to_bytes();
        assert_eq!(body.as_ref(), b"hi");
    }

    #[test]
    fn test_explicit_content_type_is_kept() {
        let hyper_resp = Response::text("<p/>")
            .with_header("Content-Type", "text/html")
            .into_hyper();
        assert_eq!(hyper_resp.headers().get(CONTENT_TYPE).unwrap(), "text/html");
    }
}
