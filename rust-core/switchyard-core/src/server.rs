//! # HTTP Server
//!
//! Thin hyper/tokio transport around a sealed [`Pipeline`].
//!
//! ## Key Features
//!
//! - One task per connection, HTTP/1.1 with optional keep-alive
//! - Client disconnects cancel the in-flight request
//! - Graceful shutdown: stop accepting, ask every connection to finish its
//!   current request and close, then drain within the configured timeout

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::pipeline::{IncomingRequest, Pipeline};
use crate::response::Response;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// HTTP server driving a pipeline
pub struct Server {
    config: ServerConfig,
    pipeline: Pipeline,
}

impl Server {
    /// Create a server with default configuration
    #[must_use]
    pub fn new(pipeline: Pipeline) -> Self {
        Self::with_config(pipeline, ServerConfig::default())
    }

    /// Create a server with explicit configuration
    #[must_use]
    pub const fn with_config(pipeline: Pipeline, config: ServerConfig) -> Self {
        Self { config, pipeline }
    }

    /// Bind the server to an address
    #[must_use]
    pub const fn bind(mut self, addr: SocketAddr) -> Self {
        self.config.address = addr;
        self
    }

    /// Server configuration
    #[must_use]
    pub const fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Open the listening socket
    ///
    /// # Errors
    ///
    /// `Error::BindError` if the address cannot be bound.
    pub fn listen(&self) -> Result<TcpListener> {
        let addr = self.config.address;
        let bind_error = |source: std::io::Error| Error::BindError {
            address: addr.to_string(),
            source,
        };

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(bind_error)?;
        socket.set_reuseaddr(true).map_err(bind_error)?;
        socket.bind(addr).map_err(bind_error)?;
        socket.listen(1024).map_err(bind_error)
    }

    /// Serve until Ctrl+C
    ///
    /// # Errors
    ///
    /// `Error::BindError` on bind failure, `Error::Io` if accepting fails.
    pub async fn serve(&self) -> Result<()> {
        self.serve_with_shutdown(shutdown_signal()).await
    }

    /// Serve until `signal` resolves
    ///
    /// # Errors
    ///
    /// Same as [`Server::serve`].
    pub async fn serve_with_shutdown(&self, signal: impl Future<Output = ()>) -> Result<()> {
        let listener = self.listen()?;
        self.serve_on(listener, signal).await
    }

    /// Serve connections from an already bound listener until `signal` resolves
    ///
    /// # Errors
    ///
    /// `Error::Io` if accepting fails.
    pub async fn serve_on(
        &self,
        listener: TcpListener,
        signal: impl Future<Output = ()>,
    ) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!("Server listening on http://{}", addr);
        }

        let active = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();
        let keep_alive = self.config.keep_alive;
        tokio::pin!(signal);

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    let (stream, remote_addr) = accept_result?;
                    let io = TokioIo::new(stream);
                    let pipeline = self.pipeline.clone();
                    let active = active.clone();
                    let shutdown = shutdown.clone();

                    // Counted before spawning so the drain never misses a fresh connection
                    active.fetch_add(1, Ordering::Relaxed);
                    tokio::task::spawn(async move {
                        let service = service_fn(move |req| {
                            let pipeline = pipeline.clone();
                            async move {
                                Ok::<_, Infallible>(
                                    serve_request(&pipeline, req, remote_addr).await,
                                )
                            }
                        });
                        let conn = http1::Builder::new()
                            .keep_alive(keep_alive)
                            .serve_connection(io, service);
                        tokio::pin!(conn);

                        let served = tokio::select! {
                            served = conn.as_mut() => served,
                            () = shutdown.cancelled() => {
                                conn.as_mut().graceful_shutdown();
                                conn.await
                            }
                        };
                        if let Err(err) = served {
                            error!("Error serving connection: {:?}", err);
                        }
                        active.fetch_sub(1, Ordering::Relaxed);
                    });
                }
                () = &mut signal => {
                    info!("Shutdown signal received, stopping server...");
                    break;
                }
            }
        }

        shutdown.cancel();
        let timeout = self.config.shutdown_timeout;
        let drain = async {
            while active.load(Ordering::Relaxed) > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };
        if tokio::time::timeout(timeout, drain).await.is_err() {
            warn!(
                active = active.load(Ordering::Relaxed),
                "Shutdown timeout reached with connections still open"
            );
        }
        Ok(())
    }
}

/// Run one hyper request through the pipeline
///
/// Dropping the returned future (connection closed) cancels the request.
async fn serve_request(
    pipeline: &Pipeline,
    req: hyper::Request<hyper::body::Incoming>,
    remote_addr: SocketAddr,
) -> hyper::Response<http_body_util::Full<hyper::body::Bytes>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let version = format!("{:?}", req.version());

    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let incoming = IncomingRequest::from_hyper(req, Some(remote_addr));
    let response = match pipeline.handle(incoming, cancel).await {
        Ok(response) => response,
        Err(e) => {
            warn!(error = %e, "Request ended without a response");
            Response::from_error(&e, pipeline.config().development_mode)
        }
    };

    info!(
        "    {} - \"{} {} {}\" {}",
        remote_addr, method, path, version, response.status
    );
    response.into_hyper()
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::App;
    use crate::router::handler;
    use http_body_util::{BodyExt, Full};
    use hyper::body::Bytes;
    use serde_json::json;
    use tokio::net::TcpStream;

    fn pipeline() -> Pipeline {
        let mut app = App::new();
        app.get(
            "/hello/:name",
            handler(|ctx| {
                let name = ctx.param("name").unwrap_or_default().to_string();
                async move { Ok(Response::json(json!({ "hello": name }))) }
            }),
        )
        .unwrap();
        app.seal()
    }

    #[tokio::test]
    async fn test_bind_error() {
        // TEST-NET-3, never assigned to a local interface
        let server = Server::new(pipeline()).bind(([203, 0, 113, 1], 0).into());
        let err = server.listen().unwrap_err();
        assert!(matches!(err, Error::BindError { .. }));
    }

    #[tokio::test]
    async fn test_serves_and_shuts_down() {
        let config = ServerConfig::default()
            .address(([127, 0, 0, 1], 0).into())
            .shutdown_timeout(Duration::from_secs(1));
        let server = Server::with_config(pipeline(), config);
        let listener = server.listen().unwrap();
        let addr = listener.local_addr().unwrap();

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let serving = tokio::spawn(async move {
            server
                .serve_on(listener, async {
                    let _ = stop_rx.await;
                })
                .await
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .unwrap();
        tokio::spawn(conn);

        let req = hyper::Request::builder()
            .uri("/hello/world")
            .header("host", "localhost")
            .header("x-request-id", "it-1")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let res = sender.send_request(req).await.unwrap();
        assert_eq!(res.status(), 200);
        assert_eq!(res.headers().get("x-request-id").unwrap(), "it-1");
        assert_eq!(
            res.headers().get("content-type").unwrap(),
            "application/json"
        );
        let body = res.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body.as_ref(), br#"{"hello":"world"}"#);

        let req = hyper::Request::builder()
            .method("POST")
            .uri("/hello/world")
            .header("host", "localhost")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let res = sender.send_request(req).await.unwrap();
        assert_eq!(res.status(), 405);
        assert_eq!(res.headers().get("allow").unwrap(), "GET");
        drop(sender);

        stop_tx.send(()).unwrap();
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_idle_keep_alive_connection() {
        let config = ServerConfig::default()
            .address(([127, 0, 0, 1], 0).into())
            .shutdown_timeout(Duration::from_secs(30));
        let server = Server::with_config(pipeline(), config);
        let listener = server.listen().unwrap();
        let addr = listener.local_addr().unwrap();

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let serving = tokio::spawn(async move {
            server
                .serve_on(listener, async {
                    let _ = stop_rx.await;
                })
                .await
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .unwrap();
        let client = tokio::spawn(conn);

        let req = hyper::Request::builder()
            .uri("/hello/idle")
            .header("host", "localhost")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let res = sender.send_request(req).await.unwrap();
        assert_eq!(res.status(), 200);
        res.into_body().collect().await.unwrap();

        // The client keeps its sender, so the connection sits idle in keep-alive
        stop_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), serving)
            .await
            .expect("idle connection must not hold shutdown until the timeout")
            .unwrap()
            .unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(5), client)
            .await
            .expect("server closes the idle connection")
            .unwrap();
        drop(sender);
    }
}
