//! # Switchyard Core
//!
//! Request-processing core: ordered route matching, layered interceptor
//! chains with an error lane, and content-type driven body decoding.
//!
//! ## Architecture
//!
//! Registration happens on an [`App`]; sealing it produces an immutable
//! [`Pipeline`] that is shared by every connection task. The [`Server`]
//! is a thin hyper adapter; the pipeline itself never touches sockets.
//!
//! ## Modules
//!
//! - `pattern` - Route pattern compiler and matcher
//! - `router` - Ordered route table, first match wins
//! - `middleware` - Interceptor traits, stacks and the chain runner
//! - `context` - Per-request state
//! - `decode` - Body decoders (JSON, CSV, XML, YAML, multipart)
//! - `pipeline` - Registration surface and request execution
//! - `response` - Value-producing responses
//! - `server` - HTTP server built on Hyper
//! - `config` - Pipeline and server configuration
//! - `error` - Error types and categorised error reports

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod context;
pub mod decode;
pub mod error;
pub mod middleware;
pub mod pattern;
pub mod pipeline;
pub mod query;
pub mod response;
pub mod router;
pub mod server;

pub use config::{PipelineConfig, ServerConfig};
pub use context::{ChainState, Extensions, RequestContext};
pub use decode::{DecodeOptions, DecodedBody, Format};
pub use error::{DecodeError, Error, ErrorKind, ErrorReport, Result};
pub use middleware::{
    error_fn, from_fn, ErrorMiddleware, ErrorResult, LoggingMiddleware, Middleware,
    MiddlewareResult, RateLimitMiddleware, TimingMiddleware,
};
pub use pattern::Params;
pub use pipeline::{App, IncomingRequest, Pipeline};
pub use response::{Payload, Response};
pub use router::{handler, Handler, Method, RouteDef};
pub use server::Server;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
