//! # Request Pipeline
//!
//! [`App`] collects routes, interceptors and error handlers. [`App::seal`]
//! freezes them into a [`Pipeline`], a cheap-to-clone snapshot that turns an
//! [`IncomingRequest`] into a [`Response`]:
//!
//! ```text
//! resolve route ─▶ decode body ─▶ global ─▶ path-scoped ─▶ route ─▶ handler
//!        │               │           │            │           │        │
//!        └───────────────┴───────────┴─── error ──┴───────────┴────────┘
//!                                          lane
//! ```
//!
//! Routing happens first so that per-route decode options can apply; a
//! missing route is reported only after global and path-scoped interceptors
//! have run. Unmatched requests are not decoded. Body reads run under
//! [`PipelineConfig::body_timeout`] (408), every later step under
//! [`PipelineConfig::handler_timeout`] (504).

use crate::config::PipelineConfig;
use crate::context::{ChainState, RequestContext};
use crate::decode::{dispatch, full_body, BoxError, RequestBody};
use crate::error::{Error, Result, BODY_STAGE};
use crate::middleware::{ChainRunner, ErrorMiddleware, Flow, Middleware, MiddlewareStack};
use crate::query::{parse_query_string, split_target};
use crate::response::Response;
use crate::router::{Handler, Method, Resolution, Route, RouteDef, RouteMatch, RouteTable, Router};
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes};
use hyper::header::{HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::HeaderMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, Instrument};

/// A request as handed over by the transport
pub struct IncomingRequest {
    /// Method token as received
    pub method: String,
    /// Request target (path and optional query)
    pub target: String,
    /// Raw headers
    pub headers: HeaderMap,
    /// Body source
    pub body: RequestBody,
    /// Peer address, if known
    pub remote_addr: Option<SocketAddr>,
}

impl IncomingRequest {
    /// Create a request without headers or body
    pub fn new(method: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            target: target.into(),
            headers: HeaderMap::new(),
            body: full_body(Bytes::new()),
            remote_addr: None,
        }
    }

    /// Add a header; invalid names or values are ignored
    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(n), Ok(v)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.append(n, v);
        }
        self
    }

    /// Replace the body with in-memory bytes
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = full_body(body);
        self
    }

    /// Convert a hyper request without reading its body
    pub fn from_hyper<B>(req: hyper::Request<B>, remote_addr: Option<SocketAddr>) -> Self
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let (parts, body) = req.into_parts();
        let target = parts
            .uri
            .path_and_query()
            .map_or_else(|| parts.uri.path().to_string(), |pq| pq.as_str().to_string());
        Self {
            method: parts.method.as_str().to_string(),
            target,
            headers: parts.headers,
            body: body.map_err(|e| -> BoxError { e.into() }).boxed_unsync(),
            remote_addr,
        }
    }
}

static REQUEST_COUNTER: AtomicUsize = AtomicUsize::new(1);

fn generate_request_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let counter = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{:x}-{:x}", now.as_nanos(), counter)
}

/// Registration surface
#[derive(Default)]
pub struct App {
    router: Router,
    middleware: MiddlewareStack,
    config: PipelineConfig,
    sealed: Option<Pipeline>,
}

impl App {
    /// Create an app with default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an app with the given configuration
    #[must_use]
    pub fn with_config(config: PipelineConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Pipeline configuration
    #[must_use]
    pub const fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn ensure_open(&self, what: impl FnOnce() -> String) -> Result<()> {
        if self.sealed.is_some() {
            return Err(Error::RouterSealed { what: what() });
        }
        Ok(())
    }

    /// Register a route with route-scoped interceptors
    ///
    /// # Errors
    ///
    /// `InvalidPattern` or `RouterSealed`.
    pub fn route(
        &mut self,
        method: Method,
        pattern: &str,
        interceptors: Vec<Arc<dyn Middleware>>,
        handler: Handler,
    ) -> Result<()> {
        self.router.register(method, pattern, interceptors, handler)
    }

    /// Register a route definition (interceptors, decode options)
    ///
    /// # Errors
    ///
    /// `InvalidPattern` or `RouterSealed`.
    pub fn add(&mut self, def: RouteDef) -> Result<()> {
        self.router.add(def)
    }

    /// Register a GET route
    ///
    /// # Errors
    ///
    /// `InvalidPattern` or `RouterSealed`.
    pub fn get(&mut self, pattern: &str, handler: Handler) -> Result<()> {
        self.route(Method::Get, pattern, Vec::new(), handler)
    }

    /// Register a POST route
    ///
    /// # Errors
    ///
    /// `InvalidPattern` or `RouterSealed`.
    pub fn post(&mut self, pattern: &str, handler: Handler) -> Result<()> {
        self.route(Method::Post, pattern, Vec::new(), handler)
    }

    /// Register a PUT route
    ///
    /// # Errors
    ///
    /// `InvalidPattern` or `RouterSealed`.
    pub fn put(&mut self, pattern: &str, handler: Handler) -> Result<()> {
        self.route(Method::Put, pattern, Vec::new(), handler)
    }

    /// Register a DELETE route
    ///
    /// # Errors
    ///
    /// `InvalidPattern` or `RouterSealed`.
    pub fn delete(&mut self, pattern: &str, handler: Handler) -> Result<()> {
        self.route(Method::Delete, pattern, Vec::new(), handler)
    }

    /// Register a PATCH route
    ///
    /// # Errors
    ///
    /// `InvalidPattern` or `RouterSealed`.
    pub fn patch(&mut self, pattern: &str, handler: Handler) -> Result<()> {
        self.route(Method::Patch, pattern, Vec::new(), handler)
    }

    /// Add a global interceptor
    ///
    /// # Errors
    ///
    /// `RouterSealed` after [`App::seal`].
    pub fn use_global<M: Middleware + 'static>(&mut self, middleware: M) -> Result<()> {
        self.ensure_open(|| format!("global interceptor {}", middleware.name()))?;
        self.middleware.push_global(Arc::new(middleware));
        Ok(())
    }

    /// Add an interceptor for every path under `prefix`
    ///
    /// # Errors
    ///
    /// `RouterSealed` after [`App::seal`], `InvalidPattern` for a prefix
    /// not starting with `/`.
    pub fn use_path_scoped<M: Middleware + 'static>(
        &mut self,
        prefix: &str,
        middleware: M,
    ) -> Result<()> {
        self.ensure_open(|| format!("interceptor {} for {prefix}", middleware.name()))?;
        self.middleware.push_path_scoped(prefix, Arc::new(middleware))
    }

    /// Add an error handler
    ///
    /// # Errors
    ///
    /// `RouterSealed` after [`App::seal`].
    pub fn use_error_handler<H: ErrorMiddleware + 'static>(&mut self, handler: H) -> Result<()> {
        self.ensure_open(|| format!("error handler {}", handler.name()))?;
        self.middleware.push_error_handler(Arc::new(handler));
        Ok(())
    }

    /// Freeze registrations into a pipeline
    ///
    /// Calling this again returns a handle to the same pipeline.
    pub fn seal(&mut self) -> Pipeline {
        if let Some(pipeline) = &self.sealed {
            return pipeline.clone();
        }
        let pipeline = Pipeline {
            routes: self.router.seal(),
            middleware: Arc::new(std::mem::take(&mut self.middleware)),
            config: Arc::new(self.config.clone()),
        };
        self.sealed = Some(pipeline.clone());
        pipeline
    }
}

/// Sealed, shareable request pipeline
#[derive(Clone)]
pub struct Pipeline {
    routes: Arc<RouteTable>,
    middleware: Arc<MiddlewareStack>,
    config: Arc<PipelineConfig>,
}

impl Pipeline {
    /// Route table
    #[must_use]
    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Pipeline configuration
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Process one request
    ///
    /// Every failure is turned into a response through the error lane; the
    /// request id is echoed in the configured header and `after_response`
    /// hooks run last.
    ///
    /// # Errors
    ///
    /// Only `Error::Cancelled`, when `cancel` fires before a response exists.
    pub async fn handle(
        &self,
        request: IncomingRequest,
        cancel: CancellationToken,
    ) -> Result<Response> {
        let IncomingRequest {
            method,
            target,
            headers,
            body,
            remote_addr,
        } = request;

        let (path, query) = split_target(&target);
        let request_id = headers
            .get(&self.config.request_id_header)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map_or_else(generate_request_id, ToString::to_string);

        let mut ctx = RequestContext::new(method, path, headers, parse_query_string(query));
        ctx.set_request_id(request_id);
        ctx.set_remote_addr(remote_addr);
        ctx.set_cancellation(cancel.clone());

        let span = info_span!(
            "request",
            method = %ctx.method(),
            path = %ctx.path(),
            request_id = %ctx.request_id()
        );
        async {
            let mut runner = ChainRunner::new(self.config.handler_timeout, &cancel);
            if let Err(error) = self.drive(&mut runner, &mut ctx, body).await {
                runner
                    .run_error_lane(
                        self.middleware.error_handlers(),
                        error,
                        &mut ctx,
                        self.config.development_mode,
                    )
                    .await
                    .inspect_err(|_| debug!("Client went away, request abandoned"))?;
            }

            let mut response = ctx.take_response().unwrap_or_else(|| {
                let error = Error::PipelineFatal {
                    message: "no response produced".to_string(),
                };
                Response::from_error(&error, self.config.development_mode)
            });
            if let Ok(value) = HeaderValue::from_str(ctx.request_id()) {
                response
                    .headers
                    .insert(self.config.request_id_header.clone(), value);
            }
            runner.finish(&ctx, &mut response);
            Ok(response)
        }
        .instrument(span)
        .await
    }

    async fn drive(
        &self,
        runner: &mut ChainRunner<'_>,
        ctx: &mut RequestContext,
        body: RequestBody,
    ) -> Result<()> {
        let resolution = match Method::parse(ctx.method()) {
            Some(method) => self.routes.resolve(method, ctx.path()),
            None => self.routes.resolve_unknown_method(ctx.path()),
        };
        let route: Result<&Route> = match resolution {
            Resolution::Matched(RouteMatch { route, params }) => {
                ctx.set_route(params);
                Ok(route)
            }
            Resolution::MethodNotAllowed { allowed } => Err(Error::MethodNotAllowed {
                method: ctx.method().to_string(),
                path: ctx.path().to_string(),
                allowed,
            }),
            Resolution::NotFound => Err(Error::RouteNotFound {
                method: ctx.method().to_string(),
                path: ctx.path().to_string(),
            }),
        };

        if let Ok(route) = route {
            let options = route.decode_options().unwrap_or(&self.config.decode);
            let content_type = ctx.header(CONTENT_TYPE.as_str()).map(str::to_string);
            let content_length = ctx
                .header(CONTENT_LENGTH.as_str())
                .and_then(|v| v.trim().parse::<usize>().ok());
            let decoding = dispatch(content_type.as_deref(), content_length, body, options);
            let (decoded, format) = runner
                .guard_with(BODY_STAGE, self.config.body_timeout, decoding)
                .await??;
            debug!(format = %format, "Body decoded");
            ctx.set_body(decoded, format);
        } else {
            drop(body);
        }

        if runner
            .run_stage(ChainState::RunningGlobal, self.middleware.global(), ctx)
            .await?
            == Flow::Stop
        {
            return Ok(());
        }

        let scoped = self.middleware.path_scoped_for(ctx.path());
        if runner
            .run_stage(ChainState::RunningPathScoped, &scoped, ctx)
            .await?
            == Flow::Stop
        {
            return Ok(());
        }

        let route = route?;
        if runner
            .run_stage(ChainState::RunningRoute, route.interceptors(), ctx)
            .await?
            == Flow::Stop
        {
            return Ok(());
        }

        let handling = (route.handler())(&*ctx);
        let response = runner
            .guard(ChainState::HandlerExecuted.as_str(), handling)
            .await??;
        ctx.set_state(ChainState::HandlerExecuted);
        ctx.emit(response);
        Ok(())
    }

    /// Execute a request directly without network stack
    pub async fn test_request(
        &self,
        method: &str,
        target: &str,
        headers: &[(&str, &str)],
        body: impl Into<Bytes>,
    ) -> Response {
        let request = headers
            .iter()
            .fold(IncomingRequest::new(method, target), |req, (k, v)| {
                req.with_header(k, v)
            })
            .with_body(body);

        match self.handle(request, CancellationToken::new()).await {
            Ok(response) => response,
            Err(e) => Response::from_error(&e, self.config.development_mode),
        }
    }
}
