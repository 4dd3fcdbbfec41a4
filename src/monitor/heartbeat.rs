//! Heartbeat monitor

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::protocol::ConnectionId;
use crate::registry::{Frame, Registry};

/// Result of one heartbeat sweep
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HeartbeatSweep {
    /// Connections moved to ERROR(HeartbeatTimeout)
    pub timed_out: Vec<ConnectionId>,
    /// Ping probes queued
    pub pinged: usize,
}

pub struct HeartbeatMonitor {
    registry: Arc<Registry>,
    interval: Duration,
    timeout: Duration,
}

impl HeartbeatMonitor {
    pub fn new(registry: Arc<Registry>) -> Self {
        let interval = registry.config().heartbeat_interval;
        let timeout = registry.config().heartbeat_timeout();
        Self {
            registry,
            interval,
            timeout,
        }
    }

    /// Mark silent connections ERROR, then ping the remaining AUTHENTICATED
    /// ones. Never removes connections and never blocks on a full queue.
    pub fn sweep(&self) -> HeartbeatSweep {
        let timed_out = self.registry.mark_silent(Instant::now(), self.timeout);
        for id in &timed_out {
            warn!(
                "Connection {} missed heartbeats for more than {:?}",
                id, self.timeout
            );
        }

        let mut pinged = 0;
        for target in self.registry.heartbeat_targets() {
            match target.outbox.try_send(Frame::Ping) {
                Ok(()) => pinged += 1,
                Err(e) => debug!("Heartbeat ping to {} skipped: {}", target.id, e),
            }
        }

        HeartbeatSweep { timed_out, pinged }
    }

    /// Sweep on every interval tick until shutdown
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = ticker.tick() => {
                    self.sweep();
                }
                result = shutdown.recv() => {
                    match result {
                        Ok(()) => break,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
        debug!("Heartbeat monitor stopped");
    }
}
