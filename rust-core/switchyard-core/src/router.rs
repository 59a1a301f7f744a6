//! # Ordered Router
//!
//! Routes are kept in registration order and resolved by a linear scan:
//! **the first registered route whose method and pattern both match wins**.
//! Registering a specific route before a wildcard route with the same
//! prefix is therefore the way to express precedence, and structural
//! duplicates (same shape after renaming parameters) are permitted.
//!
//! Resolution cost is linear in the number of routes. A dispatch table
//! partitioned by method and first static segment could be layered on top
//! without changing which route is returned.
//!
//! ## Lifecycle
//!
//! [`Router`] is a builder. [`Router::seal`] freezes it into an
//! `Arc<RouteTable>` that is shared by every in-flight request without
//! locking; registering after that fails with `Error::RouterSealed`.
//!
//! ## Design Principles (SOLID)
//!
//! - **S**: Router only resolves (method, path); matching lives in `pattern`
//! - **D**: Routes carry `dyn Middleware` and a boxed handler, never concrete types

use crate::context::RequestContext;
use crate::decode::DecodeOptions;
use crate::error::{Error, Result};
use crate::middleware::Middleware;
use crate::pattern::{compile, CompiledPattern, Params};
use crate::response::Response;
use futures_util::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

/// HTTP methods accepted at registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// HTTP GET
    Get,
    /// HTTP POST
    Post,
    /// HTTP PUT
    Put,
    /// HTTP DELETE
    Delete,
    /// HTTP PATCH
    Patch,
}

impl Method {
    /// Every registrable method
    pub const ALL: [Self; 5] = [Self::Get, Self::Post, Self::Put, Self::Delete, Self::Patch];

    /// Parse a request method token (case-sensitive, as on the wire)
    #[must_use]
    pub fn parse(method: &str) -> Option<Self> {
        match method {
            "GET" => Some(Self::Get),
            "POST" => Some(Self::Post),
            "PUT" => Some(Self::Put),
            "DELETE" => Some(Self::Delete),
            "PATCH" => Some(Self::Patch),
            _ => None,
        }
    }

    /// Wire token
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Patch => "PATCH",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal request handler (async)
///
/// The handler borrows the context only while building its future; the
/// future itself owns whatever it needs.
pub type Handler = Arc<dyn Fn(&RequestContext) -> BoxFuture<'static, Result<Response>> + Send + Sync>;

/// Wrap an async closure as a [`Handler`]
///
/// ```ignore
/// let h = handler(|ctx| {
///     let id = ctx.param("id").unwrap_or_default().to_string();
///     async move { Ok(Response::json(serde_json::json!({ "id": id }))) }
/// });
/// ```
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(&RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response>> + Send + 'static,
{
    Arc::new(move |ctx: &RequestContext| -> BoxFuture<'static, Result<Response>> {
        Box::pin(f(ctx))
    })
}

/// A route as supplied by the caller
pub struct RouteDef {
    method: Method,
    pattern: String,
    interceptors: Vec<Arc<dyn Middleware>>,
    handler: Handler,
    decode: Option<DecodeOptions>,
}

impl RouteDef {
    /// Create a route definition without interceptors
    pub fn new(method: Method, pattern: impl Into<String>, handler: Handler) -> Self {
        Self {
            method,
            pattern: pattern.into(),
            interceptors: Vec::new(),
            handler,
            decode: None,
        }
    }

    /// Append a route-scoped interceptor
    #[must_use]
    pub fn layer<M: Middleware + 'static>(self, middleware: M) -> Self {
        self.layer_arc(Arc::new(middleware))
    }

    /// Append a shared route-scoped interceptor
    #[must_use]
    pub fn layer_arc(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.interceptors.push(middleware);
        self
    }

    /// Decode options for this route, replacing the pipeline-wide ones
    #[must_use]
    pub fn decode_options(mut self, options: DecodeOptions) -> Self {
        self.decode = Some(options);
        self
    }
}

/// A registered route
pub struct Route {
    method: Method,
    matcher: CompiledPattern,
    interceptors: Vec<Arc<dyn Middleware>>,
    handler: Handler,
    decode: Option<DecodeOptions>,
    index: usize,
}

impl Route {
    /// Method this route answers
    #[must_use]
    pub const fn method(&self) -> Method {
        self.method
    }

    /// Pattern as registered
    #[must_use]
    pub fn pattern(&self) -> &str {
        self.matcher.as_str()
    }

    /// Compiled matcher
    #[must_use]
    pub const fn matcher(&self) -> &CompiledPattern {
        &self.matcher
    }

    /// Route-scoped interceptors in registration order
    #[must_use]
    pub fn interceptors(&self) -> &[Arc<dyn Middleware>] {
        &self.interceptors
    }

    /// Terminal handler
    #[must_use]
    pub const fn handler(&self) -> &Handler {
        &self.handler
    }

    /// Route-specific decode options, if any
    #[must_use]
    pub const fn decode_options(&self) -> Option<&DecodeOptions> {
        self.decode.as_ref()
    }

    /// Zero-based registration index
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.interceptors.iter().map(|m| m.name()).collect();
        f.debug_struct("Route")
            .field("method", &self.method)
            .field("pattern", &self.pattern())
            .field("interceptors", &names)
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

/// Successful resolution
#[derive(Debug)]
pub struct RouteMatch<'a> {
    /// The matched route
    pub route: &'a Route,
    /// Captured parameters in pattern order
    pub params: Params,
}

/// Outcome of resolving a request
#[derive(Debug)]
pub enum Resolution<'a> {
    /// A route matched both method and path
    Matched(RouteMatch<'a>),
    /// The path matches routes registered only for other methods
    MethodNotAllowed {
        /// Methods of those routes, in registration order, deduplicated
        allowed: Vec<Method>,
    },
    /// No pattern matches the path
    NotFound,
}

/// Route registration builder
#[derive(Default)]
pub struct Router {
    routes: Vec<Route>,
    sealed: Option<Arc<RouteTable>>,
}

impl Router {
    /// Create a new empty router
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a route
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidPattern` if the pattern is malformed and
    /// `Error::RouterSealed` after [`Router::seal`].
    pub fn register(
        &mut self,
        method: Method,
        pattern: &str,
        interceptors: Vec<Arc<dyn Middleware>>,
        handler: Handler,
    ) -> Result<()> {
        let mut def = RouteDef::new(method, pattern, handler);
        def.interceptors = interceptors;
        self.add(def)
    }

    /// Register a route from a definition
    ///
    /// # Errors
    ///
    /// Same as [`Router::register`].
    pub fn add(&mut self, def: RouteDef) -> Result<()> {
        if self.sealed.is_some() {
            return Err(Error::RouterSealed {
                what: format!("route {} {}", def.method, def.pattern),
            });
        }

        let matcher = compile(&def.pattern)?;
        let shape = matcher.shape();
        if let Some(earlier) = self
            .routes
            .iter()
            .find(|r| r.method == def.method && r.matcher.shape() == shape)
        {
            debug!(
                method = %def.method,
                pattern = %def.pattern,
                shadowed_by = %earlier.pattern(),
                "Duplicate route shape; the earlier registration wins"
            );
        }

        let index = self.routes.len();
        self.routes.push(Route {
            method: def.method,
            matcher,
            interceptors: def.interceptors,
            handler: def.handler,
            decode: def.decode,
            index,
        });
        Ok(())
    }

    /// Freeze the routes into a shareable table
    ///
    /// Calling this again returns the same table.
    pub fn seal(&mut self) -> Arc<RouteTable> {
        if let Some(table) = &self.sealed {
            return table.clone();
        }
        let table = Arc::new(RouteTable {
            routes: std::mem::take(&mut self.routes),
        });
        debug!(routes = table.len(), "Router sealed");
        self.sealed = Some(table.clone());
        table
    }

    /// Whether [`Router::seal`] has been called
    #[must_use]
    pub const fn is_sealed(&self) -> bool {
        self.sealed.is_some()
    }

    /// Number of routes registered so far
    #[must_use]
    pub fn len(&self) -> usize {
        self.sealed
            .as_ref()
            .map_or(self.routes.len(), |table| table.len())
    }

    /// Check if no routes are registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Immutable, shareable route list
#[derive(Debug)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    /// Resolve a request in registration order
    #[must_use]
    pub fn resolve(&self, method: Method, path: &str) -> Resolution<'_> {
        let mut allowed = Vec::new();
        for route in &self.routes {
            let Some(params) = route.matcher.matches(path) else {
                continue;
            };
            if route.method == method {
                return Resolution::Matched(RouteMatch { route, params });
            }
            if !allowed.contains(&route.method) {
                allowed.push(route.method);
            }
        }

        if allowed.is_empty() {
            Resolution::NotFound
        } else {
            Resolution::MethodNotAllowed { allowed }
        }
    }

    /// Resolve a request whose method is not registrable (HEAD, OPTIONS, ...)
    ///
    /// Never matches; reports the methods the path does accept.
    #[must_use]
    pub fn resolve_unknown_method(&self, path: &str) -> Resolution<'_> {
        let mut allowed = Vec::new();
        for route in &self.routes {
            if !allowed.contains(&route.method) && route.matcher.matches(path).is_some() {
                allowed.push(route.method);
            }
        }
        if allowed.is_empty() {
            Resolution::NotFound
        } else {
            Resolution::MethodNotAllowed { allowed }
        }
    }

    /// Routes in registration order
    #[must_use]
    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Number of routes
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Check if the table is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
