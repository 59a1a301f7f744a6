//! Switchyard demo server
//!
//! Environment:
//! - `SWITCHYARD_ADDR`: bind address (default `127.0.0.1:8000`)
//! - `SWITCHYARD_DEV`: `1`/`true` enables development-mode error bodies
//! - `SWITCHYARD_LIMITS`: optional YAML file with decode limits
//! - `RUST_LOG`: tracing filter

use anyhow::Context;
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use switchyard_core::decode::{JsonOptions, MultipartOptions, XmlOptions};
use switchyard_core::{
    error_fn, from_fn, handler, App, DecodeOptions, DecodedBody, Error, ErrorResult,
    LoggingMiddleware, Method, MiddlewareResult, PipelineConfig, RateLimitMiddleware, Response,
    RouteDef, Server, ServerConfig, TimingMiddleware,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Decode limits loadable from YAML
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Limits {
    max_body_size: Option<usize>,
    json: JsonOptions,
    xml: XmlOptions,
    multipart: MultipartOptions,
}

impl Limits {
    fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    fn into_options(self) -> DecodeOptions {
        let options = DecodeOptions::new()
            .json(self.json)
            .xml(self.xml)
            .multipart(self.multipart);
        match self.max_body_size {
            Some(size) => options.max_body_size(size),
            None => options,
        }
    }
}

fn init_tracing() -> anyhow::Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("switchyard=info".parse()?);
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .try_init();
    Ok(())
}

fn flag(name: &str) -> bool {
    std::env::var(name).is_ok_and(|v| matches!(v.as_str(), "1" | "true" | "yes"))
}

fn body_summary(body: &DecodedBody) -> Value {
    match body {
        DecodedBody::None => Value::Null,
        DecodedBody::Json(value) => value.clone(),
        DecodedBody::Yaml(value) => serde_json::to_value(value).unwrap_or(Value::Null),
        DecodedBody::Csv(table) => json!({ "headers": table.headers, "rows": table.rows }),
        DecodedBody::Xml(root) => json!({ "root": root.name, "children": root.children.len() }),
        DecodedBody::FormData(form) => json!({
            "fields": form.fields.iter().map(|(k, _)| k).collect::<Vec<_>>(),
            "files": form
                .files
                .iter()
                .map(|f| json!({ "name": f.filename, "size": f.size() }))
                .collect::<Vec<_>>(),
        }),
        DecodedBody::Binary(bytes) => json!({ "bytes": bytes.len() }),
    }
}

fn build_app(config: PipelineConfig) -> switchyard_core::Result<App> {
    let mut app = App::with_config(config);

    app.use_global(LoggingMiddleware::new())?;
    app.use_global(TimingMiddleware::new())?;
    app.use_global(RateLimitMiddleware::new(100, 50))?;
    app.use_path_scoped(
        "/admin",
        from_fn("admin-token", |ctx| match ctx.header("x-admin-token") {
            Some(_) => MiddlewareResult::Continue,
            None => MiddlewareResult::Error(Error::handler(401, "missing admin token")),
        }),
    )?;
    app.use_error_handler(error_fn("not-found-page", |err, ctx| {
        if matches!(err, Error::RouteNotFound { .. }) && ctx.path().starts_with("/static/") {
            ErrorResult::Respond(Response::text("no such asset").with_status(404))
        } else {
            ErrorResult::Forward
        }
    }))?;

    app.get(
        "/health",
        handler(|_ctx| async { Ok(Response::json(json!({ "status": "ok" }))) }),
    )?;
    app.get(
        "/users/:id",
        handler(|ctx| {
            let id = ctx.param("id").unwrap_or_default().to_string();
            async move { Ok(Response::json(json!({ "id": id }))) }
        }),
    )?;
    app.post(
        "/echo",
        handler(|ctx| {
            let summary = json!({ "format": ctx.format(), "body": body_summary(ctx.body()) });
            async move { Ok(Response::json(summary)) }
        }),
    )?;
    app.add(
        RouteDef::new(
            Method::Post,
            "/avatar",
            handler(|ctx| {
                let summary = body_summary(ctx.body());
                async move { Ok(Response::json(summary).with_status(201)) }
            }),
        )
        .decode_options(
            DecodeOptions::new().multipart(MultipartOptions::new().max_file_size(512 * 1024)),
        ),
    )?;
    app.get(
        "/admin/stats",
        handler(|ctx| {
            let request_id = ctx.request_id().to_string();
            async move { Ok(Response::json(json!({ "requestId": request_id }))) }
        }),
    )?;
    app.get(
        "/static/*",
        handler(|ctx| {
            let file = ctx.param("*").unwrap_or_default().to_string();
            async move { Ok(Response::text(format!("asset: {file}"))) }
        }),
    )?;

    Ok(app)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing()?;

    let address: SocketAddr = match std::env::var("SWITCHYARD_ADDR") {
        Ok(raw) => raw.parse().with_context(|| format!("invalid SWITCHYARD_ADDR {raw}"))?,
        Err(_) => ServerConfig::default().address,
    };
    let development_mode = flag("SWITCHYARD_DEV");
    if development_mode {
        warn!("Development mode on, error responses include details");
    }

    let decode = match std::env::var_os("SWITCHYARD_LIMITS") {
        Some(path) => Limits::load(Path::new(&path))?.into_options(),
        None => Limits::default().into_options(),
    };

    let config = PipelineConfig::new()
        .development_mode(development_mode)
        .handler_timeout(Some(Duration::from_secs(30)))
        .decode(decode);
    let mut app = build_app(config)?;
    let pipeline = app.seal();
    info!(routes = pipeline.routes().len(), "Pipeline sealed");

    let server = Server::with_config(pipeline, ServerConfig::default().address(address));
    server.serve().await?;
    info!("Server stopped");
    Ok(())
}
