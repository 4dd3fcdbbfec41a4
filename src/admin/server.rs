//! HTTP server for the management endpoints and Prometheus metrics

use std::convert::Infallible;
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use super::Management;
use crate::metrics::Metrics;
use crate::protocol::ConnectionId;

/// HTTP server that exposes management operations and metrics
pub struct AdminServer {
    management: Management,
    metrics: Arc<Metrics>,
    listener: TcpListener,
}

impl AdminServer {
    pub fn new(management: Management, metrics: Arc<Metrics>, listener: TcpListener) -> Self {
        Self {
            management,
            metrics,
            listener,
        }
    }

    /// Serve requests until shutdown is signalled
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        if let Ok(addr) = self.listener.local_addr() {
            info!("Management server listening on http://{}", addr);
        }

        loop {
            tokio::select! {
                biased;

                result = shutdown.recv() => {
                    match result {
                        Ok(()) => break,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }

                accepted = self.listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!("Failed to accept management connection: {}", e);
                            continue;
                        }
                    };
                    debug!("Management request connection from {}", addr);

                    let io = TokioIo::new(stream);
                    let management = self.management.clone();
                    let metrics = self.metrics.clone();

                    tokio::spawn(async move {
                        let service = service_fn(move |req| {
                            let management = management.clone();
                            let metrics = metrics.clone();
                            async move { handle_request(req, management, metrics).await }
                        });

                        if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                            error!("Error serving management connection: {:?}", err);
                        }
                    });
                }
            }
        }
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    management: Management,
    metrics: Arc<Metrics>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let segments: Vec<&str> = req
        .uri()
        .path()
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();

    let response = match (&method, segments.as_slice()) {
        (&Method::GET, ["metrics"]) => render_metrics(&metrics),
        (&Method::GET, ["health" | "healthz" | "ready" | "readyz"]) => {
            text(StatusCode::OK, "OK")
        }
        (&Method::GET, ["status"]) => json_response(StatusCode::OK, &management.status()),
        (&Method::GET, ["connection", id, "health"]) => match id.parse::<ConnectionId>() {
            Err(_) => bad_id(id),
            Ok(id) => match management.connection_health(id) {
                Some(health) => json_response(StatusCode::OK, &health),
                None => not_found(id),
            },
        },
        (&Method::DELETE, ["connection", id]) => match id.parse::<ConnectionId>() {
            Err(_) => bad_id(id),
            Ok(id) => {
                if management.force_disconnect(id) {
                    json_response(
                        StatusCode::OK,
                        &json!({ "connection_id": id.as_u64(), "disconnected": true }),
                    )
                } else {
                    not_found(id)
                }
            }
        },
        (&Method::POST, ["user", user_id, "reconnect"]) => {
            let scheduled = management.reconnect_user(user_id);
            json_response(
                StatusCode::OK,
                &json!({ "user_id": user_id, "scheduled": scheduled }),
            )
        }
        _ => text(StatusCode::NOT_FOUND, "Not Found"),
    };

    Ok(response)
}

fn render_metrics(metrics: &Metrics) -> Response<Full<Bytes>> {
    let encoder = TextEncoder::new();
    let metric_families = metrics.registry.gather();
    let mut buffer = Vec::new();

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => {
            let mut response = Response::new(Full::new(Bytes::from(buffer)));
            if let Ok(value) = HeaderValue::from_str(encoder.format_type()) {
                response.headers_mut().insert(CONTENT_TYPE, value);
            }
            response
        }
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            text(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics")
        }
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(body) {
        Ok(body) => {
            let mut response = Response::new(Full::new(Bytes::from(body)));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => {
            error!("Failed to serialize management response: {}", e);
            text(StatusCode::INTERNAL_SERVER_ERROR, "Serialization failed")
        }
    }
}

fn not_found(id: ConnectionId) -> Response<Full<Bytes>> {
    json_response(
        StatusCode::NOT_FOUND,
        &json!({ "error": format!("connection {} not found", id) }),
    )
}

fn bad_id(raw: &str) -> Response<Full<Bytes>> {
    json_response(
        StatusCode::BAD_REQUEST,
        &json!({ "error": format!("invalid connection id '{}'", raw) }),
    )
}

fn text(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
}
