//! Management server configuration

use serde::Deserialize;
use std::net::SocketAddr;

/// Management (admin REST + metrics) configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Whether the management server is started
    pub enabled: bool,
    /// HTTP bind address for the management endpoints
    pub bind: SocketAddr,
}

pub(super) fn default_admin_bind() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9090))
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_admin_bind(),
        }
    }
}
