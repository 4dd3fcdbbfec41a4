//! WebSocket Connection Handler
//!
//! Each accepted socket gets a reader (this task) and a writer task. The
//! reader decodes frames and routes them through the dispatcher; the writer
//! drains the connection's outbox. Whichever side learns of a closure tells
//! the registry, and the registry closing the outbox stops both sides.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, trace};

use crate::codec::Decoder;
use crate::config::EngineConfig;
use crate::dispatch::{Dispatcher, Route};
use crate::protocol::{CloseReason, CodecError, ConnectionId, ConnectionState, ErrorCause};
use crate::registry::{Frame, Outbox, OutboxReceiver, Registry};
use crate::transport::{self, WsStream};

/// Connection error types
#[derive(Debug)]
pub enum ConnectionError {
    Io(std::io::Error),
    HandshakeTimeout,
    CapacityExceeded,
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Io(e) => write!(f, "IO error: {}", e),
            ConnectionError::HandshakeTimeout => write!(f, "WebSocket handshake timeout"),
            ConnectionError::CapacityExceeded => write!(f, "Connection capacity exceeded"),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

/// State shared by every connection task
pub(crate) struct ConnectionContext {
    pub config: Arc<EngineConfig>,
    pub registry: Arc<Registry>,
    pub dispatcher: Arc<Dispatcher>,
    pub decoder: Decoder,
}

/// Connection handler
pub(crate) struct Connection {
    ctx: Arc<ConnectionContext>,
    addr: SocketAddr,
}

impl Connection {
    pub fn new(ctx: Arc<ConnectionContext>, addr: SocketAddr) -> Self {
        Self { ctx, addr }
    }

    /// Run the connection to completion
    pub async fn run(self, stream: TcpStream) -> Result<(), ConnectionError> {
        transport::configure_stream(&stream)?;

        let handshake = transport::accept(stream, &self.ctx.config.ws_path);
        let (mut ws, endpoint) = match timeout(self.ctx.config.auth_timeout, handshake).await {
            Ok(result) => result?,
            Err(_) => return Err(ConnectionError::HandshakeTimeout),
        };

        let (outbox, outbox_rx) = Outbox::new(self.ctx.config.outbound_channel_capacity);
        let id = match self.ctx.registry.admit(endpoint, outbox.clone()) {
            Ok(id) => id,
            Err(_) => {
                let _ = ws.close(Some(close_frame(CloseReason::CapacityExceeded))).await;
                return Err(ConnectionError::CapacityExceeded);
            }
        };
        debug!("Connection {} from {} on {} endpoint", id, self.addr, endpoint);

        let (sink, stream) = ws.split();
        let writer = tokio::spawn(write_loop(self.ctx.registry.clone(), id, sink, outbox_rx));

        self.read_loop(id, stream, &outbox).await;

        // The writer exits once the registry closes the outbox
        let _ = writer.await;
        debug!(
            "Connection {} from {} finished: {}",
            id,
            self.addr,
            outbox
                .close_reason()
                .map(|r| r.as_str())
                .unwrap_or("transport_error")
        );
        Ok(())
    }

    async fn read_loop(&self, id: ConnectionId, mut stream: SplitStream<WsStream>, outbox: &Outbox) {
        let registry = &self.ctx.registry;
        let auth_deadline = Instant::now() + self.ctx.config.auth_timeout;
        let mut closed = outbox.closed();

        loop {
            if closed.borrow().is_some() {
                break;
            }

            // Subscribed connections never go idle
            let deadline = match registry.state(id) {
                None => break,
                Some(ConnectionState::Connected) => Some(auth_deadline),
                Some(_) => registry.idle_deadline(id),
            };

            tokio::select! {
                biased;

                _ = closed.changed() => break,

                message = stream.next() => {
                    let Some(message) = message else {
                        registry.remove(id, CloseReason::ClientClosed);
                        break;
                    };
                    match message {
                        Ok(message) => {
                            if !self.handle_message(id, message).await {
                                break;
                            }
                        }
                        Err(e) => {
                            self.handle_read_error(id, e);
                            break;
                        }
                    }
                }

                _ = sleep_until(deadline.unwrap_or(auth_deadline)), if deadline.is_some() => {
                    match registry.state(id) {
                        Some(ConnectionState::Connected) => {
                            debug!("Connection {} did not authenticate in time", id);
                            registry.remove(id, CloseReason::AuthTimeout);
                            break;
                        }
                        Some(_) if registry.is_idle(id, Instant::now()) => {
                            debug!("Connection {} idle", id);
                            registry.remove(id, CloseReason::IdleTimeout);
                            break;
                        }
                        // Subscribed or recently active; recompute the deadline
                        Some(_) => {}
                        None => break,
                    }
                }
            }
        }
    }

    /// Handle one inbound frame; returns false once the reader should stop
    async fn handle_message(&self, id: ConnectionId, message: Message) -> bool {
        let registry = &self.ctx.registry;
        match message {
            Message::Text(text) => {
                match self.ctx.decoder.decode(&text) {
                    Ok(envelope) => {
                        registry
                            .metrics()
                            .message_received(envelope.message.type_name(), text.len());
                        if let Route::Close(reason) = self.ctx.dispatcher.route(id, envelope).await {
                            registry.remove(id, reason);
                            return false;
                        }
                    }
                    Err(e) => {
                        registry.metrics().message_received("invalid", text.len());
                        registry.touch(id);
                        debug!("Connection {} sent an invalid envelope: {}", id, e);
                        self.ctx.dispatcher.reject(id, &e).await;
                    }
                }
                true
            }
            Message::Binary(data) => {
                registry.metrics().message_received("binary", data.len());
                registry.touch(id);
                self.ctx
                    .dispatcher
                    .reject(
                        id,
                        &CodecError::InvalidJson("binary frames are not supported".to_string()),
                    )
                    .await;
                true
            }
            Message::Ping(_) | Message::Pong(_) => {
                trace!("Connection {} heartbeat activity", id);
                registry.touch(id);
                true
            }
            Message::Close(_) => {
                debug!("Connection {} closed by client", id);
                registry.remove(id, CloseReason::ClientClosed);
                false
            }
            Message::Frame(_) => true,
        }
    }

    fn handle_read_error(&self, id: ConnectionId, error: WsError) {
        let registry = &self.ctx.registry;
        match error {
            WsError::ConnectionClosed
            | WsError::AlreadyClosed
            | WsError::Protocol(
                tokio_tungstenite::tungstenite::error::ProtocolError::ResetWithoutClosingHandshake,
            ) => {
                registry.remove(id, CloseReason::ClientClosed);
            }
            other => {
                debug!("Connection {} read error: {}", id, other);
                // Unauthenticated connections have nothing to recover
                if !registry.mark_error(id, ErrorCause::TransportError) {
                    registry.remove(id, CloseReason::ClientClosed);
                }
            }
        }
    }
}

/// Drain the outbox onto the socket until the connection is closed
async fn write_loop(
    registry: Arc<Registry>,
    id: ConnectionId,
    mut sink: SplitSink<WsStream, Message>,
    mut rx: OutboxReceiver,
) {
    loop {
        tokio::select! {
            biased;

            frame = rx.frames.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = sink.send(to_message(frame)).await {
                    debug!("Connection {} write failed: {}", id, e);
                    if !registry.mark_error(id, ErrorCause::SendFailure) {
                        registry.remove(id, CloseReason::ClientClosed);
                    }
                    return;
                }
            }
            _ = rx.closed.changed() => break,
        }
    }

    // Flush what was queued before the close, then say goodbye
    while let Ok(frame) = rx.frames.try_recv() {
        if sink.feed(to_message(frame)).await.is_err() {
            return;
        }
    }
    let reason = *rx.closed.borrow();
    if let Some(reason) = reason {
        let _ = sink.send(Message::Close(Some(close_frame(reason)))).await;
    }
    let _ = sink.close().await;
}

fn to_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text.to_string()),
        Frame::Ping => Message::Ping(Vec::new()),
    }
}

fn close_frame(reason: CloseReason) -> CloseFrame<'static> {
    CloseFrame {
        code: CloseCode::from(reason.code()),
        reason: reason.as_str().into(),
    }
}
