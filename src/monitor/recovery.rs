//! Recovery engine
//!
//! Each due ERROR connection gets a ping probe. Any inbound activity within
//! the probe timeout restores it; otherwise the attempt is counted and the
//! next one is scheduled with exponential backoff until attempts run out.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use futures_util::FutureExt;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::protocol::ConnectionId;
use crate::registry::{Frame, Recipient, RecoveryOutcome, Registry};

/// Commands accepted by a running recovery engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryCommand {
    /// Sweep immediately instead of waiting for the next tick
    RecoverNow,
}

/// Handle for waking the recovery engine
#[derive(Clone)]
pub struct RecoveryHandle {
    tx: mpsc::Sender<RecoveryCommand>,
}

impl RecoveryHandle {
    /// Request an immediate sweep; coalesces with pending requests
    pub fn recover_now(&self) {
        let _ = self.tx.try_send(RecoveryCommand::RecoverNow);
    }
}

/// Result of one recovery sweep
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoverySweep {
    pub recovered: Vec<ConnectionId>,
    pub retrying: Vec<ConnectionId>,
    pub exhausted: Vec<ConnectionId>,
}

pub struct RecoveryEngine {
    registry: Arc<Registry>,
    interval: Duration,
    probe_timeout: Duration,
    commands: mpsc::Receiver<RecoveryCommand>,
}

impl RecoveryEngine {
    pub fn new(registry: Arc<Registry>) -> (Self, RecoveryHandle) {
        let (tx, commands) = mpsc::channel(8);
        let interval = registry.config().recovery_interval;
        let probe_timeout = registry.config().recovery_probe_timeout;
        (
            Self {
                registry,
                interval,
                probe_timeout,
                commands,
            },
            RecoveryHandle { tx },
        )
    }

    /// Probe every due ERROR connection concurrently
    pub async fn sweep(&self) -> RecoverySweep {
        let candidates = self.registry.recovery_candidates(Instant::now());
        if candidates.is_empty() {
            return RecoverySweep::default();
        }
        debug!("Probing {} connections in ERROR", candidates.len());

        let probes = candidates.into_iter().map(|candidate| async move {
            let id = candidate.id;
            (id, self.probe(candidate).await)
        });

        let mut sweep = RecoverySweep::default();
        for (id, alive) in join_all(probes).await {
            if alive {
                if self.registry.recovery_succeeded(id) {
                    sweep.recovered.push(id);
                }
                continue;
            }
            match self.registry.recovery_failed(id) {
                RecoveryOutcome::Retry { attempts, next_at } => {
                    debug!(
                        "Connection {} unresponsive (attempt {}), retry in {:?}",
                        id,
                        attempts,
                        next_at.saturating_duration_since(Instant::now())
                    );
                    sweep.retrying.push(id);
                }
                RecoveryOutcome::Exhausted => sweep.exhausted.push(id),
                RecoveryOutcome::Skipped => {}
            }
        }

        if !sweep.recovered.is_empty() || !sweep.exhausted.is_empty() {
            info!(
                "Recovery sweep: {} recovered, {} retrying, {} exhausted",
                sweep.recovered.len(),
                sweep.retrying.len(),
                sweep.exhausted.len()
            );
        }
        sweep
    }

    /// Send a ping and wait for any inbound activity
    async fn probe(&self, candidate: Recipient) -> bool {
        self.registry.metrics().recovery_attempted();

        // Discard a signal left over from activity before the probe
        let _ = candidate.outbox.activity().now_or_never();

        if candidate.outbox.try_send(Frame::Ping).is_err() {
            return false;
        }
        tokio::time::timeout(self.probe_timeout, candidate.outbox.activity())
            .await
            .is_ok()
    }

    /// Sweep on every interval tick and on request until shutdown
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = ticker.tick() => {
                    self.sweep().await;
                }
                Some(command) = self.commands.recv() => {
                    match command {
                        RecoveryCommand::RecoverNow => {
                            self.sweep().await;
                        }
                    }
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
        debug!("Recovery engine stopped");
    }
}
