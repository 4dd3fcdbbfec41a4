//! Management Façade
//!
//! Status and health queries plus administrative actions over the registry.
//! [`AdminServer`] exposes the same operations over HTTP.

mod server;

pub use server::AdminServer;

use std::sync::Arc;

use tracing::info;

use crate::monitor::RecoveryHandle;
use crate::protocol::{CloseReason, ConnectionId};
use crate::registry::{ConnectionHealth, Registry, RegistrySnapshot};

#[cfg(test)]
mod tests;

/// Management operations
#[derive(Clone)]
pub struct Management {
    registry: Arc<Registry>,
    recovery: RecoveryHandle,
}

impl Management {
    pub fn new(registry: Arc<Registry>, recovery: RecoveryHandle) -> Self {
        Self { registry, recovery }
    }

    /// Connection counts by state, topic and user
    pub fn status(&self) -> RegistrySnapshot {
        self.registry.snapshot()
    }

    pub fn connection_health(&self, id: ConnectionId) -> Option<ConnectionHealth> {
        self.registry.connection_health(id)
    }

    /// Close a connection with the forced-disconnect code.
    ///
    /// Returns false if the connection does not exist.
    pub fn force_disconnect(&self, id: ConnectionId) -> bool {
        let removed = self.registry.remove(id, CloseReason::ForcedDisconnect);
        if removed {
            info!("Connection {} disconnected by administrator", id);
        }
        removed
    }

    /// Retry every ERROR connection of `user_id` now, ignoring backoff.
    ///
    /// Returns how many connections were scheduled.
    pub fn reconnect_user(&self, user_id: &str) -> usize {
        let scheduled = self.registry.expedite_recovery(user_id);
        if scheduled > 0 {
            self.recovery.recover_now();
            info!(
                "Expedited recovery of {} connection(s) for user {}",
                scheduled, user_id
            );
        }
        scheduled
    }
}
