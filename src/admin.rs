//! Read-only debug endpoint
//!
//! Serves `GET /health`, `GET /version` and `GET /status` on a local address.
//! Nothing here changes gateway state.

use crate::container::ContainerController;
use crate::status::{build_listing, ListingProvider};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Version information for the gateway
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

#[derive(Clone)]
struct AdminState {
    controller: Arc<ContainerController>,
    listing: Arc<dyn ListingProvider>,
}

pub struct AdminServer {
    bind_addr: SocketAddr,
    state: AdminState,
    shutdown_rx: watch::Receiver<bool>,
}

impl AdminServer {
    pub fn new(
        bind_addr: SocketAddr,
        controller: Arc<ContainerController>,
        listing: Arc<dyn ListingProvider>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            state: AdminState { controller, listing },
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "Debug endpoint listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = self.state.clone();
                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, state).await {
                                    debug!(addr = %addr, error = %e, "Debug connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept debug connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Debug endpoint shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection(stream: TcpStream, state: AdminState) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<hyper::body::Incoming>| {
        let state = state.clone();
        async move { Ok::<_, hyper::Error>(route(req.method(), req.uri().path(), &state)) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Debug connection error: {}", e))?;

    Ok(())
}

fn route(method: &Method, path: &str, state: &AdminState) -> Response<Full<Bytes>> {
    debug!(%method, %path, "Debug request");

    match (method, path) {
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            json_response(StatusCode::OK, version_info.to_string())
        }

        (&Method::GET, "/status") => {
            let listing = match build_listing(state.listing.as_ref(), 0)
                .and_then(|json| serde_json::from_str::<serde_json::Value>(&json))
            {
                Ok(listing) => listing,
                Err(e) => {
                    error!(error = %e, "Failed to serialize server listing");
                    return response(StatusCode::INTERNAL_SERVER_ERROR, "listing unavailable");
                }
            };

            let body = serde_json::json!({
                "container": {
                    "name": state.controller.name(),
                    "id": state.controller.container_id(),
                    "state": state.controller.state(),
                },
                "listing": listing,
            });
            json_response(StatusCode::OK, body.to_string())
        }

        (_, "/health" | "/version" | "/status") => {
            response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
        }

        _ => response(StatusCode::NOT_FOUND, "not found"),
    }
}
