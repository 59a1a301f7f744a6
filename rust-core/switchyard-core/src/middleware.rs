//! # Middleware System
//!
//! Interceptors in three groups plus a separate error lane:
//!
//! 1. **global**: every request, in registration order
//! 2. **path-scoped**: requests whose path starts with the prefix on a
//!    segment boundary (`/admin` covers `/admin/x`, not `/administrator`)
//! 3. **route-scoped**: supplied with a route
//!
//! then the terminal handler. Each interceptor returns a
//! [`MiddlewareResult`]: `Continue` advances, `Respond` emits and stops,
//! `Error` skips everything left and enters the error lane, where
//! [`ErrorMiddleware`]s run in registration order until one responds.
//!
//! Every step is awaited before the next one starts, optionally under a
//! watchdog timeout, raced against the request's cancellation token, and
//! with panics converted into a 500 handler error.
//!
//! ## Design Principles (SOLID)
//!
//! - **S**: Each middleware has a single responsibility
//! - **O**: Extensible via the `Middleware` and `ErrorMiddleware` traits
//! - **D**: The pipeline depends on the traits, not concrete implementations

use crate::context::{ChainState, RequestContext};
use crate::error::{Error, Result};
use crate::pattern::decode_segment;
use crate::response::Response;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::net::IpAddr;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Middleware trait for request interception
pub trait Middleware: Send + Sync {
    /// Called before the handler
    ///
    /// May read and modify the context, emit a response (via the return
    /// value or [`RequestContext::send`]) or fail into the error lane.
    fn handle<'a>(&'a self, ctx: &'a mut RequestContext) -> BoxFuture<'a, MiddlewareResult>;

    /// Called after the final response is produced, in reverse order
    ///
    /// Only interceptors whose `handle` ran are called.
    fn after_response(&self, _ctx: &RequestContext, _res: &mut Response) {}

    /// Middleware name for logging
    fn name(&self) -> &'static str {
        "Unknown"
    }
}

/// Result of middleware execution
#[derive(Debug)]
pub enum MiddlewareResult {
    /// Continue to next middleware/handler
    Continue,
    /// Short-circuit with this response (skip handler)
    Respond(Response),
    /// Abandon the chain and enter the error lane
    Error(Error),
}

/// Error-lane handler
pub trait ErrorMiddleware: Send + Sync {
    /// Handle an error or forward it to the next error handler
    fn handle_error<'a>(
        &'a self,
        error: &'a Error,
        ctx: &'a mut RequestContext,
    ) -> BoxFuture<'a, ErrorResult>;

    /// Name for logging
    fn name(&self) -> &'static str {
        "Unknown"
    }
}

/// Result of an error handler
#[derive(Debug)]
pub enum ErrorResult {
    /// Emit this response
    Respond(Response),
    /// Let the next error handler (or the default response) deal with it
    Forward,
}

/// Synchronous interceptor built from a closure
pub struct FnMiddleware<F> {
    name: &'static str,
    f: F,
}

/// Wrap a synchronous closure as a [`Middleware`]
pub fn from_fn<F>(name: &'static str, f: F) -> FnMiddleware<F>
where
    F: Fn(&mut RequestContext) -> MiddlewareResult + Send + Sync,
{
    FnMiddleware { name, f }
}

impl<F> Middleware for FnMiddleware<F>
where
    F: Fn(&mut RequestContext) -> MiddlewareResult + Send + Sync,
{
    fn handle<'a>(&'a self, ctx: &'a mut RequestContext) -> BoxFuture<'a, MiddlewareResult> {
        Box::pin(std::future::ready((self.f)(ctx)))
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// Synchronous error handler built from a closure
pub struct FnErrorMiddleware<F> {
    name: &'static str,
    f: F,
}

/// Wrap a synchronous closure as an [`ErrorMiddleware`]
pub fn error_fn<F>(name: &'static str, f: F) -> FnErrorMiddleware<F>
where
    F: Fn(&Error, &mut RequestContext) -> ErrorResult + Send + Sync,
{
    FnErrorMiddleware { name, f }
}

impl<F> ErrorMiddleware for FnErrorMiddleware<F>
where
    F: Fn(&Error, &mut RequestContext) -> ErrorResult + Send + Sync,
{
    fn handle_error<'a>(
        &'a self,
        error: &'a Error,
        ctx: &'a mut RequestContext,
    ) -> BoxFuture<'a, ErrorResult> {
        Box::pin(std::future::ready((self.f)(error, ctx)))
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// Whether `prefix` covers `path` on a segment boundary
///
/// Segments are compared percent-decoded, the same view the router matches
/// on, so `/%61dmin/x` is under `/admin`.
#[must_use]
pub fn prefix_matches(prefix: &str, path: &str) -> bool {
    let mut actual = path.trim_start_matches('/').split('/');
    for expected in prefix.split('/').filter(|s| !s.is_empty()) {
        let Some(segment) = actual.next() else {
            return false;
        };
        match (decode_segment(expected), decode_segment(segment)) {
            (Some(e), Some(a)) if e == a => {}
            _ => return false,
        }
    }
    true
}

/// Registered interceptors, shared read-only once sealed
#[derive(Default, Clone)]
pub struct MiddlewareStack {
    global: Vec<Arc<dyn Middleware>>,
    path_scoped: Vec<(String, Arc<dyn Middleware>)>,
    error_handlers: Vec<Arc<dyn ErrorMiddleware>>,
}

impl MiddlewareStack {
    /// Create an empty stack
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a global interceptor
    pub fn push_global(&mut self, middleware: Arc<dyn Middleware>) {
        self.global.push(middleware);
    }

    /// Append a path-scoped interceptor
    ///
    /// # Errors
    ///
    /// `Error::InvalidPattern` if the prefix does not start with `/`.
    pub fn push_path_scoped(
        &mut self,
        prefix: impl Into<String>,
        middleware: Arc<dyn Middleware>,
    ) -> Result<()> {
        let prefix = prefix.into();
        if !prefix.starts_with('/') {
            return Err(Error::InvalidPattern {
                pattern: prefix,
                reason: "path prefix must start with '/'".to_string(),
            });
        }
        self.path_scoped.push((prefix, middleware));
        Ok(())
    }

    /// Append an error handler
    pub fn push_error_handler(&mut self, handler: Arc<dyn ErrorMiddleware>) {
        self.error_handlers.push(handler);
    }

    /// Global interceptors in registration order
    #[must_use]
    pub fn global(&self) -> &[Arc<dyn Middleware>] {
        &self.global
    }

    /// Path-scoped interceptors covering `path`, in registration order
    #[must_use]
    pub fn path_scoped_for(&self, path: &str) -> Vec<Arc<dyn Middleware>> {
        self.path_scoped
            .iter()
            .filter(|(prefix, _)| prefix_matches(prefix, path))
            .map(|(_, mw)| mw.clone())
            .collect()
    }

    /// Error handlers in registration order
    #[must_use]
    pub fn error_handlers(&self) -> &[Arc<dyn ErrorMiddleware>] {
        &self.error_handlers
    }

    /// Total number of registered entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.global.len() + self.path_scoped.len() + self.error_handlers.len()
    }

    /// Check if nothing is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Whether the chain should keep going after a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Move on to the next stage
    Continue,
    /// A response was emitted
    Stop,
}

/// Sequential executor for one request
pub struct ChainRunner<'r> {
    timeout: Option<Duration>,
    cancel: &'r CancellationToken,
    entered: Vec<Arc<dyn Middleware>>,
}

impl<'r> ChainRunner<'r> {
    /// Create a runner with an optional per-step watchdog
    #[must_use]
    pub fn new(timeout: Option<Duration>, cancel: &'r CancellationToken) -> Self {
        Self {
            timeout,
            cancel,
            entered: Vec::new(),
        }
    }

    /// Run one step under the watchdog, the cancellation token and a panic guard
    ///
    /// # Errors
    ///
    /// `Cancelled`, `HandlerTimeout`, or a 500 `Handler` error for a panic.
    pub async fn guard<T>(&self, stage: &'static str, step: impl Future<Output = T>) -> Result<T> {
        self.guard_with(stage, self.timeout, step).await
    }

    /// [`ChainRunner::guard`] with an explicit timeout
    ///
    /// # Errors
    ///
    /// Same as [`ChainRunner::guard`].
    pub async fn guard_with<T>(
        &self,
        stage: &'static str,
        timeout: Option<Duration>,
        step: impl Future<Output = T>,
    ) -> Result<T> {
        let caught = AssertUnwindSafe(step).catch_unwind();
        let timed = async {
            match timeout {
                Some(after) => tokio::time::timeout(after, caught)
                    .await
                    .map_err(|_| Error::HandlerTimeout { stage, after }),
                None => Ok(caught.await),
            }
        };

        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(Error::Cancelled),
            outcome = timed => match outcome? {
                Ok(value) => Ok(value),
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!(stage, panic = %message, "Step panicked");
                    Err(Error::internal(format!("panic in {stage}: {message}")))
                }
            },
        }
    }

    /// Run a group of interceptors in order
    ///
    /// # Errors
    ///
    /// The first `MiddlewareResult::Error`, or a guard failure.
    pub async fn run_stage(
        &mut self,
        stage: ChainState,
        entries: &[Arc<dyn Middleware>],
        ctx: &mut RequestContext,
    ) -> Result<Flow> {
        ctx.set_state(stage);
        for mw in entries {
            debug!(middleware = mw.name(), stage = %stage, "Running interceptor");
            self.entered.push(mw.clone());

            match self.guard(stage.as_str(), mw.handle(ctx)).await? {
                MiddlewareResult::Continue => {}
                MiddlewareResult::Respond(response) => {
                    ctx.emit(response);
                    return Ok(Flow::Stop);
                }
                MiddlewareResult::Error(e) => return Err(e),
            }

            if ctx.is_sent() {
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Continue)
    }

    /// Run the error lane
    ///
    /// The error ends up attached to the context and a response is always
    /// emitted, falling back to the default categorised failure response.
    ///
    /// # Errors
    ///
    /// Only `Error::Cancelled`.
    pub async fn run_error_lane(
        &mut self,
        handlers: &[Arc<dyn ErrorMiddleware>],
        error: Error,
        ctx: &mut RequestContext,
        development_mode: bool,
    ) -> Result<()> {
        if matches!(error, Error::Cancelled) {
            return Err(error);
        }
        if matches!(error, Error::ResponseAlreadySent) {
            error!(request_id = %ctx.request_id(), "Response already sent");
            return Ok(());
        }

        let was_sent = ctx.is_sent();
        ctx.set_state(ChainState::Error);
        if error.status_code() >= 500 {
            warn!(error = %error, status = error.status_code(), "Request failed");
        } else {
            debug!(error = %error, status = error.status_code(), "Request rejected");
        }

        if !was_sent {
            for handler in handlers {
                let step = handler.handle_error(&error, ctx);
                match self.guard(ChainState::Error.as_str(), step).await {
                    Ok(ErrorResult::Respond(response)) => {
                        ctx.emit(response);
                        break;
                    }
                    Ok(ErrorResult::Forward) => {
                        if ctx.is_sent() {
                            break;
                        }
                    }
                    Err(Error::Cancelled) => return Err(Error::Cancelled),
                    Err(e) => {
                        error!(handler = handler.name(), error = %e, "Error handler failed");
                    }
                }
            }
        }

        if !ctx.is_sent() {
            ctx.emit(Response::from_error(&error, development_mode));
        }
        ctx.set_error(error);
        Ok(())
    }

    /// Call `after_response` on every entered interceptor, last first
    pub fn finish(&self, ctx: &RequestContext, response: &mut Response) {
        for mw in self.entered.iter().rev() {
            mw.after_response(ctx, response);
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Logging middleware - logs requests in structured JSON format
#[derive(Default)]
pub struct LoggingMiddleware {
    log_headers: bool,
}

impl LoggingMiddleware {
    /// Create a new logging middleware
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable header logging
    #[must_use]
    pub fn with_headers(mut self) -> Self {
        self.log_headers = true;
        self
    }
}

impl Middleware for LoggingMiddleware {
    fn handle<'a>(&'a self, ctx: &'a mut RequestContext) -> BoxFuture<'a, MiddlewareResult> {
        if self.log_headers {
            info!(
                method = %ctx.method(),
                path = %ctx.path(),
                request_id = %ctx.request_id(),
                headers = ?ctx.headers(),
                "Request received"
            );
        } else {
            info!(
                method = %ctx.method(),
                path = %ctx.path(),
                request_id = %ctx.request_id(),
                "Request received"
            );
        }
        Box::pin(std::future::ready(MiddlewareResult::Continue))
    }

    fn after_response(&self, ctx: &RequestContext, res: &mut Response) {
        info!(
            method = %ctx.method(),
            path = %ctx.path(),
            status = res.status,
            request_id = %ctx.request_id(),
            "Response sent"
        );
    }

    fn name(&self) -> &'static str {
        "LoggingMiddleware"
    }
}

/// Start instant recorded by [`TimingMiddleware`]
#[derive(Debug, Clone, Copy)]
pub struct RequestStart(pub Instant);

/// Timing middleware - measures request duration
///
/// Adds `x-response-time` (milliseconds) to the response.
#[derive(Debug, Default)]
pub struct TimingMiddleware;

impl TimingMiddleware {
    /// Create a new timing middleware
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Middleware for TimingMiddleware {
    fn handle<'a>(&'a self, ctx: &'a mut RequestContext) -> BoxFuture<'a, MiddlewareResult> {
        ctx.extensions_mut().insert(RequestStart(Instant::now()));
        Box::pin(std::future::ready(MiddlewareResult::Continue))
    }

    fn after_response(&self, ctx: &RequestContext, res: &mut Response) {
        if let Some(RequestStart(start)) = ctx.extensions().get::<RequestStart>() {
            let duration = start.elapsed();
            debug!(
                method = %ctx.method(),
                path = %ctx.path(),
                duration_ms = %duration.as_millis(),
                "Request timing"
            );
            res.set_header("x-response-time", &duration.as_millis().to_string());
        }
    }

    fn name(&self) -> &'static str {
        "TimingMiddleware"
    }
}

/// Default ceiling on tracked clients
pub const DEFAULT_RATE_LIMIT_KEYS: usize = 10_000;

/// Token bucket rate limiting middleware, keyed by peer IP
///
/// At most `max_keys` buckets are kept. When a new client arrives at the
/// ceiling, buckets that have refilled completely are dropped first, then
/// the least recently refilled one.
pub struct RateLimitMiddleware {
    capacity: u64,
    refill_per_sec: u64,
    max_keys: usize,
    state: Mutex<HashMap<Option<IpAddr>, Bucket>>,
}

struct Bucket {
    tokens: u64,
    last_refill: Instant,
}

impl RateLimitMiddleware {
    /// Create a new rate limiter
    #[must_use]
    pub fn new(capacity: u64, refill_per_sec: u64) -> Self {
        Self {
            capacity,
            refill_per_sec,
            max_keys: DEFAULT_RATE_LIMIT_KEYS,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Cap the number of tracked clients (at least one)
    #[must_use]
    pub fn max_keys(mut self, max_keys: usize) -> Self {
        self.max_keys = max_keys.max(1);
        self
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    fn refilled(&self, bucket: &Bucket, now: Instant) -> (u64, bool) {
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        // float to int casts saturate
        let refill = (elapsed.as_secs_f64() * self.refill_per_sec as f64) as u64;
        (bucket.tokens.saturating_add(refill).min(self.capacity), refill > 0)
    }

    fn make_room(&self, map: &mut HashMap<Option<IpAddr>, Bucket>, now: Instant) {
        map.retain(|_, bucket| self.refilled(bucket, now).0 < self.capacity);
        while map.len() >= self.max_keys {
            let oldest = map
                .iter()
                .min_by_key(|(_, bucket)| bucket.last_refill)
                .map(|(key, _)| *key);
            match oldest {
                Some(key) => {
                    map.remove(&key);
                }
                None => break,
            }
        }
    }

    fn allow(&self, key: Option<IpAddr>) -> bool {
        let mut map = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        if !map.contains_key(&key) && map.len() >= self.max_keys {
            self.make_room(&mut map, now);
        }

        let bucket = map.entry(key).or_insert(Bucket {
            tokens: self.capacity,
            last_refill: now,
        });
        let (tokens, refreshed) = self.refilled(bucket, now);
        if refreshed {
            bucket.tokens = tokens;
            bucket.last_refill = now;
        }
        if bucket.tokens == 0 {
            return false;
        }
        bucket.tokens -= 1;
        true
    }

    fn tracked(&self) -> usize {
        self.state.lock().map_or(0, |map| map.len())
    }
}

impl Middleware for RateLimitMiddleware {
    fn handle<'a>(&'a self, ctx: &'a mut RequestContext) -> BoxFuture<'a, MiddlewareResult> {
        let key = ctx.remote_addr().map(|addr| addr.ip());
        let result = if self.allow(key) {
            MiddlewareResult::Continue
        } else {
            warn!(client = ?key, tracked = self.tracked(), "Rate limit exceeded");
            MiddlewareResult::Error(Error::handler(429, "Rate limit exceeded"))
        };
        Box::pin(std::future::ready(result))
    }

    fn name(&self) -> &'static str {
        "RateLimitMiddleware"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::HeaderMap;

    fn context(path: &str) -> RequestContext {
        RequestContext::new("GET", path, HeaderMap::new(), HashMap::new())
    }

    struct Slow;

    impl Middleware for Slow {
        fn handle<'a>(&'a self, _ctx: &'a mut RequestContext) -> BoxFuture<'a, MiddlewareResult> {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                MiddlewareResult::Continue
            })
        }
    }

    struct Panics;

    impl Middleware for Panics {
        fn handle<'a>(&'a self, _ctx: &'a mut RequestContext) -> BoxFuture<'a, MiddlewareResult> {
            Box::pin(async { panic!("boom") })
        }
    }

    #[test]
    fn test_prefix_matching_is_segment_aligned() {
        assert!(prefix_matches("/admin", "/admin"));
        assert!(prefix_matches("/admin", "/admin/users"));
        assert!(prefix_matches("/admin/", "/admin/users"));
        assert!(!prefix_matches("/admin", "/administrator"));
        assert!(!prefix_matches("/admin", "/"));
        assert!(prefix_matches("/", "/anything/at/all"));
    }

    #[test]
    fn test_prefix_matching_decodes_segments() {
        assert!(prefix_matches("/admin", "/%61dmin/stats"));
        assert!(prefix_matches("/api/v1", "/api/%76%31"));
        assert!(prefix_matches("/admin", "//admin/stats"));
        assert!(!prefix_matches("/admin", "/%61dministrator"));
        assert!(!prefix_matches("/admin", "/admin%2Fstats"));
        assert!(!prefix_matches("/admin", "/%FF"));
    }

    #[test]
    fn test_stack_rejects_relative_prefix() {
        let mut stack = MiddlewareStack::new();
        let err = stack
            .push_path_scoped("admin", Arc::new(LoggingMiddleware::new()))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidPattern { .. }));
        assert!(stack.is_empty());
    }

    #[test]
    fn test_path_scoped_selection_keeps_order() {
        let mut stack = MiddlewareStack::new();
        stack
            .push_path_scoped("/api", Arc::new(from_fn("api", |_| MiddlewareResult::Continue)))
            .unwrap();
        stack
            .push_path_scoped("/web", Arc::new(from_fn("web", |_| MiddlewareResult::Continue)))
            .unwrap();
        stack
            .push_path_scoped("/", Arc::new(from_fn("all", |_| MiddlewareResult::Continue)))
            .unwrap();

        let names: Vec<&str> = stack
            .path_scoped_for("/api/v1")
            .iter()
            .map(|m| m.name())
            .collect();
        assert_eq!(names, vec!["api", "all"]);
    }

    #[tokio::test]
    async fn test_stage_stops_on_respond() {
        let cancel = CancellationToken::new();
        let mut runner = ChainRunner::new(None, &cancel);
        let entries: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(from_fn("gate", |_| {
                MiddlewareResult::Respond(Response::empty(403))
            })),
            Arc::new(from_fn("never", |_| panic!("must not run"))),
        ];
        let mut ctx = context("/");
        let flow = runner
            .run_stage(ChainState::RunningGlobal, &entries, &mut ctx)
            .await
            .unwrap();
        assert_eq!(flow, Flow::Stop);
        assert_eq!(ctx.response().map(|r| r.status), Some(403));
    }

    #[tokio::test]
    async fn test_stage_stops_after_direct_send() {
        let cancel = CancellationToken::new();
        let mut runner = ChainRunner::new(None, &cancel);
        let entries: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(from_fn("sender", |ctx| {
                ctx.send(Response::empty(202)).unwrap();
                MiddlewareResult::Continue
            })),
            Arc::new(from_fn("never", |_| panic!("must not run"))),
        ];
        let mut ctx = context("/");
        let flow = runner
            .run_stage(ChainState::RunningGlobal, &entries, &mut ctx)
            .await
            .unwrap();
        assert_eq!(flow, Flow::Stop);
        assert_eq!(ctx.response().map(|r| r.status), Some(202));
    }

    #[tokio::test]
    async fn test_watchdog_times_out() {
        let cancel = CancellationToken::new();
        let mut runner = ChainRunner::new(Some(Duration::from_millis(50)), &cancel);
        let entries: Vec<Arc<dyn Middleware>> = vec![Arc::new(Slow)];
        let mut ctx = context("/");
        let err = runner
            .run_stage(ChainState::RunningRoute, &entries, &mut ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::HandlerTimeout { stage: "route", .. }));
        assert_eq!(err.status_code(), 504);
    }

    #[tokio::test]
    async fn test_cancelled_token_stops_chain() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut runner = ChainRunner::new(None, &cancel);
        let entries: Vec<Arc<dyn Middleware>> = vec![Arc::new(Slow)];
        let mut ctx = context("/");
        let err = runner
            .run_stage(ChainState::RunningGlobal, &entries, &mut ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn test_panic_becomes_internal_error() {
        let cancel = CancellationToken::new();
        let mut runner = ChainRunner::new(None, &cancel);
        let entries: Vec<Arc<dyn Middleware>> = vec![Arc::new(Panics)];
        let mut ctx = context("/");
        let err = runner
            .run_stage(ChainState::RunningGlobal, &entries, &mut ctx)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 500);
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn test_error_lane_first_responder_wins() {
        let cancel = CancellationToken::new();
        let mut runner = ChainRunner::new(None, &cancel);
        let handlers: Vec<Arc<dyn ErrorMiddleware>> = vec![
            Arc::new(error_fn("forward", |_, _| ErrorResult::Forward)),
            Arc::new(error_fn("teapot", |_, _| {
                ErrorResult::Respond(Response::empty(418))
            })),
            Arc::new(error_fn("never", |_, _| panic!("must not run"))),
        ];
        let mut ctx = context("/");
        runner
            .run_error_lane(&handlers, Error::bad_request("bad"), &mut ctx, false)
            .await
            .unwrap();
        assert_eq!(ctx.response().map(|r| r.status), Some(418));
        assert_eq!(ctx.error().map(Error::status_code), Some(400));
    }

    #[tokio::test]
    async fn test_error_lane_default_response() {
        let cancel = CancellationToken::new();
        let mut runner = ChainRunner::new(None, &cancel);
        let mut ctx = context("/");
        runner
            .run_error_lane(&[], Error::handler(422, "nope"), &mut ctx, false)
            .await
            .unwrap();
        let response = ctx.response().unwrap();
        assert_eq!(response.status, 422);
        assert_eq!(ctx.state(), ChainState::ResponseSent);
    }

    fn ip(last: u8) -> Option<IpAddr> {
        Some(IpAddr::from([10, 0, 0, last]))
    }

    #[test]
    fn test_rate_limit_bucket() {
        let limiter = RateLimitMiddleware::new(2, 0);
        assert!(limiter.allow(ip(1)));
        assert!(limiter.allow(ip(1)));
        assert!(!limiter.allow(ip(1)));
        assert!(limiter.allow(ip(2)));
        assert!(limiter.allow(None));
    }

    #[test]
    fn test_rate_limit_refill_saturates() {
        let limiter = RateLimitMiddleware::new(u64::MAX, u64::MAX);
        assert!(limiter.allow(ip(1)));
        std::thread::sleep(Duration::from_millis(2));
        assert!(limiter.allow(ip(1)));
        assert!(limiter.allow(ip(1)));
    }

    #[test]
    fn test_rate_limit_tracks_bounded_clients() {
        let limiter = RateLimitMiddleware::new(5, 0).max_keys(3);
        for last in 0..=200 {
            assert!(limiter.allow(ip(last)));
            assert!(limiter.tracked() <= 3);
        }
        // the most recent client keeps its bucket
        for _ in 0..4 {
            assert!(limiter.allow(ip(200)));
        }
        assert!(!limiter.allow(ip(200)));
    }

    #[test]
    fn test_rate_limit_prunes_full_buckets_first() {
        let limiter = RateLimitMiddleware::new(1, 1_000_000).max_keys(2);
        assert!(limiter.allow(ip(1)));
        assert!(limiter.allow(ip(2)));
        std::thread::sleep(Duration::from_millis(5));
        assert!(limiter.allow(ip(3)));
        assert_eq!(limiter.tracked(), 1);
    }

    #[test]
    fn test_middleware_names() {
        assert_eq!(LoggingMiddleware::new().name(), "LoggingMiddleware");
        assert_eq!(TimingMiddleware::new().name(), "TimingMiddleware");
        assert_eq!(RateLimitMiddleware::new(1, 1).name(), "RateLimitMiddleware");
    }
}
