//! Per-connection outbound queue.
//!
//! The registry and dispatcher push frames into an [`Outbox`]; the
//! connection's writer task drains it onto the socket. Closing the outbox
//! signals both the reader and the writer of the connection, and the writer
//! sends a close frame carrying the reason.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Notify};

use crate::protocol::CloseReason;

/// Frame queued for the writer task
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Pre-serialized JSON envelope
    Text(Arc<str>),
    /// WebSocket ping probe
    Ping,
}

/// Error when queueing a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// Connection is closed or its writer has exited
    Closed,
    /// Queue is full (non-blocking sends only)
    Full,
    /// Queue stayed full for the whole send timeout
    Timeout,
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendError::Closed => write!(f, "connection closed"),
            SendError::Full => write!(f, "outbound queue full"),
            SendError::Timeout => write!(f, "send timed out"),
        }
    }
}

impl std::error::Error for SendError {}

/// Receiving half handed to the writer task
pub struct OutboxReceiver {
    pub frames: mpsc::Receiver<Frame>,
    pub closed: watch::Receiver<Option<CloseReason>>,
}

/// Shared sending half of a connection's outbound queue
pub struct Outbox {
    tx: mpsc::Sender<Frame>,
    closed: watch::Sender<Option<CloseReason>>,
    /// Woken on every inbound activity; recovery probes wait on it
    activity: Notify,
    alive: AtomicBool,
}

impl Outbox {
    /// Create an outbox with the given queue capacity
    pub fn new(capacity: usize) -> (Arc<Self>, OutboxReceiver) {
        let (tx, frames) = mpsc::channel(capacity.max(1));
        let (closed, closed_rx) = watch::channel(None);
        let outbox = Arc::new(Self {
            tx,
            closed,
            activity: Notify::new(),
            alive: AtomicBool::new(true),
        });
        (
            outbox,
            OutboxReceiver {
                frames,
                closed: closed_rx,
            },
        )
    }

    /// Check if the connection is still alive
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire) && !self.tx.is_closed()
    }

    /// Queue a frame, waiting at most `timeout` for queue space
    pub async fn send(&self, frame: Frame, timeout: Duration) -> Result<(), SendError> {
        if !self.alive.load(Ordering::Acquire) {
            return Err(SendError::Closed);
        }
        match tokio::time::timeout(timeout, self.tx.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SendError::Closed),
            Err(_) => Err(SendError::Timeout),
        }
    }

    /// Queue a frame without waiting
    pub fn try_send(&self, frame: Frame) -> Result<(), SendError> {
        if !self.alive.load(Ordering::Acquire) {
            return Err(SendError::Closed);
        }
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Close the connection with `reason`.
    ///
    /// Only the first close takes effect; returns whether this call closed it.
    pub fn close(&self, reason: CloseReason) -> bool {
        if !self.alive.swap(false, Ordering::AcqRel) {
            return false;
        }
        self.closed.send_replace(Some(reason));
        true
    }

    /// Reason the connection was closed with, if closed
    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.closed.borrow()
    }

    /// Watch for closure; used by the connection reader
    pub fn closed(&self) -> watch::Receiver<Option<CloseReason>> {
        self.closed.subscribe()
    }

    /// Signal inbound activity to a waiting recovery probe
    pub fn notify_activity(&self) {
        self.activity.notify_one();
    }

    /// Wait for the next inbound activity signal
    pub async fn activity(&self) {
        self.activity.notified().await;
    }
}
