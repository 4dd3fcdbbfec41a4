//! WebSocket Transport
//!
//! Performs the server handshake and resolves the request path to the
//! [`Endpoint`] the connection is served on. Unknown paths are refused with
//! `404` before the upgrade completes.

use std::io;

use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::WebSocketStream;

use crate::topic::Endpoint;

/// Server-side WebSocket over TCP
pub type WsStream = WebSocketStream<TcpStream>;

/// Accept a WebSocket connection on one of the endpoints under `base_path`
pub async fn accept(stream: TcpStream, base_path: &str) -> Result<(WsStream, Endpoint), io::Error> {
    let mut endpoint = None;

    let ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, response: Response| {
        let request_path = req.uri().path();
        match Endpoint::from_path(request_path, base_path) {
            Some(resolved) => {
                endpoint = Some(resolved);
                Ok(response)
            }
            None => {
                let mut error = ErrorResponse::new(Some(format!(
                    "Unknown endpoint '{}'",
                    request_path
                )));
                *error.status_mut() = StatusCode::NOT_FOUND;
                Err(error)
            }
        }
    })
    .await
    .map_err(io::Error::other)?;

    let endpoint = endpoint.ok_or_else(|| io::Error::other("endpoint not resolved"))?;
    Ok((ws, endpoint))
}
