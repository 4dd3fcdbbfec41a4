//! Transport Layer
//!
//! TCP socket tuning and the WebSocket handshake.

mod websocket;

pub use websocket::{accept, WsStream};

use tokio::net::TcpStream;

/// Configure an accepted TCP stream
pub fn configure_stream(stream: &TcpStream) -> std::io::Result<()> {
    // Small JSON frames; latency matters more than batching
    stream.set_nodelay(true)?;
    Ok(())
}
