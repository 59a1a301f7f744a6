//! # Request Context
//!
//! Mutable per-request record threaded through every interceptor, the
//! handler and the error lane. Created at pipeline entry, owned by exactly
//! one in-flight request and dropped after the response is emitted.

use crate::decode::{DecodedBody, Format};
use crate::error::{Error, Result};
use crate::pattern::Params;
use crate::response::Response;
use hyper::HeaderMap;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::error;

/// Position of a request in the interceptor chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainState {
    /// Nothing has run yet
    Pending,
    /// Running global interceptors
    RunningGlobal,
    /// Running path-scoped interceptors
    RunningPathScoped,
    /// Running route-scoped interceptors
    RunningRoute,
    /// The terminal handler returned
    HandlerExecuted,
    /// A response has been emitted
    ResponseSent,
    /// Running the error lane
    Error,
}

impl ChainState {
    /// Stable label used in logs and timeout errors
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::RunningGlobal => "global",
            Self::RunningPathScoped => "path-scoped",
            Self::RunningRoute => "route",
            Self::HandlerExecuted => "handler",
            Self::ResponseSent => "response-sent",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ChainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed per-request values set by interceptors
///
/// Keyed by type, so each type holds at most one value.
#[derive(Default)]
pub struct Extensions {
    data: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    /// Store a value by its type, returning the previous one
    pub fn insert<T: Send + Sync + 'static>(&mut self, value: T) -> Option<T> {
        self.data
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    /// Borrow a value by type
    #[must_use]
    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.data
            .get(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast_ref::<T>())
    }

    /// Mutably borrow a value by type
    pub fn get_mut<T: Send + Sync + 'static>(&mut self) -> Option<&mut T> {
        self.data
            .get_mut(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast_mut::<T>())
    }

    /// Remove a value by type
    pub fn remove<T: Send + Sync + 'static>(&mut self) -> Option<T> {
        self.data
            .remove(&TypeId::of::<T>())
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    /// Number of stored values
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl fmt::Debug for Extensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extensions")
            .field("len", &self.data.len())
            .finish()
    }
}

/// Per-request state
#[derive(Debug)]
pub struct RequestContext {
    method: String,
    path: String,
    headers: HeaderMap,
    query: HashMap<String, String>,
    params: Params,
    body: DecodedBody,
    format: Format,
    request_id: String,
    remote_addr: Option<SocketAddr>,
    state: ChainState,
    error: Option<Error>,
    response: Option<Response>,
    extensions: Extensions,
    started_at: Instant,
    cancel: CancellationToken,
}

impl RequestContext {
    /// Create a context for a request that has not been routed or decoded yet
    #[must_use]
    pub fn new(
        method: impl Into<String>,
        path: impl Into<String>,
        headers: HeaderMap,
        query: HashMap<String, String>,
    ) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            headers,
            query,
            params: Params::new(),
            body: DecodedBody::None,
            format: Format::None,
            request_id: String::new(),
            remote_addr: None,
            state: ChainState::Pending,
            error: None,
            response: None,
            extensions: Extensions::default(),
            started_at: Instant::now(),
            cancel: CancellationToken::new(),
        }
    }

    /// Request method as received
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Request path, without the query string
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Raw request headers
    #[must_use]
    pub const fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Get a header value by name (case-insensitive)
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Decoded query parameters
    #[must_use]
    pub const fn query(&self) -> &HashMap<String, String> {
        &self.query
    }

    /// Single query parameter
    #[must_use]
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    /// Captured path parameters
    #[must_use]
    pub const fn params(&self) -> &Params {
        &self.params
    }

    /// Single path parameter
    #[must_use]
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name)
    }

    /// Decoded request body
    #[must_use]
    pub const fn body(&self) -> &DecodedBody {
        &self.body
    }

    /// Detected body format
    #[must_use]
    pub const fn format(&self) -> Format {
        self.format
    }

    /// Request id (propagated or generated)
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Peer address, when the transport knows it
    #[must_use]
    pub const fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Current chain position
    #[must_use]
    pub const fn state(&self) -> ChainState {
        self.state
    }

    /// Error attached by the error lane
    #[must_use]
    pub const fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// Typed values set by interceptors
    #[must_use]
    pub const fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    /// Mutable typed values
    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    /// When the pipeline picked the request up
    #[must_use]
    pub const fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Time since the pipeline picked the request up
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Cancelled when the client goes away
    ///
    /// Handlers that spawn work should hand a clone of this token to it.
    #[must_use]
    pub const fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// The response emitted so far, if any
    #[must_use]
    pub const fn response(&self) -> Option<&Response> {
        self.response.as_ref()
    }

    /// Whether a response has been emitted
    #[must_use]
    pub const fn is_sent(&self) -> bool {
        self.response.is_some()
    }

    /// Emit the response for this request
    ///
    /// Emission happens once; the chain stops after the current step.
    ///
    /// # Errors
    ///
    /// `Error::ResponseAlreadySent` if a response was already emitted. The
    /// first response is kept unchanged.
    pub fn send(&mut self, response: Response) -> Result<()> {
        if self.response.is_some() {
            return Err(Error::ResponseAlreadySent);
        }
        self.response = Some(response);
        self.state = ChainState::ResponseSent;
        Ok(())
    }

    /// Emit, logging instead of failing on a second emission
    pub(crate) fn emit(&mut self, response: Response) {
        if let Err(e) = self.send(response) {
            error!(
                request_id = %self.request_id,
                state = %self.state,
                error = %e,
                "Second response discarded"
            );
        }
    }

    pub(crate) fn take_response(&mut self) -> Option<Response> {
        self.response.take()
    }

    pub(crate) fn set_route(&mut self, params: Params) {
        self.params = params;
    }

    pub(crate) fn set_body(&mut self, body: DecodedBody, format: Format) {
        self.body = body;
        self.format = format;
    }

    pub(crate) fn set_request_id(&mut self, request_id: String) {
        self.request_id = request_id;
    }

    pub(crate) fn set_remote_addr(&mut self, addr: Option<SocketAddr>) {
        self.remote_addr = addr;
    }

    pub(crate) fn set_cancellation(&mut self, cancel: CancellationToken) {
        self.cancel = cancel;
    }

    pub(crate) fn set_state(&mut self, state: ChainState) {
        self.state = state;
    }

    pub(crate) fn set_error(&mut self, error: Error) {
        self.error = Some(error);
    }
}
