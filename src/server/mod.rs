//! PulseHub Server
//!
//! Binds the WebSocket and management listeners, wires the registry,
//! dispatcher and background monitors together, and runs the accept loop
//! until shutdown.

mod connection;

pub use connection::ConnectionError;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info};

use connection::{Connection, ConnectionContext};

use crate::admin::{AdminServer, Management};
use crate::auth::IdentityVerifier;
use crate::codec::Decoder;
use crate::config::EngineConfig;
use crate::dispatch::{Dispatcher, EngineEvent};
use crate::metrics::Metrics;
use crate::monitor::{HeartbeatMonitor, RecoveryEngine};
use crate::protocol::CloseReason;
use crate::registry::Registry;

/// Signals a running [`Server`] to stop
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: broadcast::Sender<()>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.tx.send(());
    }
}

/// The real-time engine server
pub struct Server {
    config: Arc<EngineConfig>,
    listener: TcpListener,
    admin_listener: Option<TcpListener>,
    registry: Arc<Registry>,
    dispatcher: Arc<Dispatcher>,
    management: Management,
    metrics: Arc<Metrics>,
    recovery: RecoveryEngine,
    shutdown: broadcast::Sender<()>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl Server {
    /// Bind the listeners and build the engine components
    pub async fn bind(
        config: EngineConfig,
        verifier: Arc<dyn IdentityVerifier>,
    ) -> io::Result<Self> {
        let config = Arc::new(config);

        let listener = TcpListener::bind(config.bind_addr).await?;
        let admin_listener = match config.admin_bind_addr {
            Some(addr) => Some(TcpListener::bind(addr).await?),
            None => None,
        };

        let metrics = Arc::new(Metrics::new());

        let registry = Arc::new(Registry::new(config.clone(), verifier, metrics.clone()));
        let dispatcher = Arc::new(Dispatcher::new(registry.clone()));
        let (recovery, recovery_handle) = RecoveryEngine::new(registry.clone());
        let management = Management::new(registry.clone(), recovery_handle);
        let (shutdown, shutdown_rx) = broadcast::channel(1);

        Ok(Self {
            config,
            listener,
            admin_listener,
            registry,
            dispatcher,
            management,
            metrics,
            recovery,
            shutdown,
            shutdown_rx,
        })
    }

    /// Address the WebSocket listener is bound to
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Address of the management server, if enabled
    pub fn admin_addr(&self) -> Option<SocketAddr> {
        self.admin_listener
            .as_ref()
            .and_then(|listener| listener.local_addr().ok())
    }

    /// Handle used by producers to publish to topics and users
    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    pub fn management(&self) -> Management {
        self.management.clone()
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// Subscribe to authentication and client payload events
    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.dispatcher.subscribe_events()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown.clone(),
        }
    }

    /// Run until shutdown is signalled, then close every connection
    pub async fn run(self) -> io::Result<()> {
        let Server {
            config,
            listener,
            admin_listener,
            registry,
            dispatcher,
            management,
            metrics,
            recovery,
            shutdown,
            mut shutdown_rx,
        } = self;

        info!(
            "WebSocket listening on {} (path: {})",
            listener.local_addr()?,
            config.ws_path
        );

        let mut background = JoinSet::new();
        background.spawn(HeartbeatMonitor::new(registry.clone()).run(shutdown.subscribe()));
        background.spawn(recovery.run(shutdown.subscribe()));
        if let Some(admin_listener) = admin_listener {
            let admin = AdminServer::new(management, metrics, admin_listener);
            background.spawn(admin.run(shutdown.subscribe()));
        }

        let ctx = Arc::new(ConnectionContext {
            config: config.clone(),
            registry: registry.clone(),
            dispatcher,
            decoder: Decoder::new().with_max_message_size(config.max_message_size),
        });

        let mut connections = JoinSet::new();
        debug!("Starting WebSocket accept loop");
        loop {
            tokio::select! {
                biased;

                result = shutdown_rx.recv() => {
                    match result {
                        Ok(()) => break,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }

                Some(_) = connections.join_next(), if !connections.is_empty() => {}

                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            debug!("New TCP connection from {}", addr);
                            let conn = Connection::new(ctx.clone(), addr);
                            connections.spawn(async move {
                                if let Err(e) = conn.run(stream).await {
                                    debug!("Connection error from {}: {}", addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept TCP connection: {}", e);
                        }
                    }
                }
            }
        }

        info!("Shutting down");
        drop(listener);
        let closed = registry.close_all(CloseReason::Shutdown);
        debug!("Closed {} connection(s)", closed);

        // Give writers a bounded window to flush their close frames
        let drained = timeout(config.send_timeout, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            connections.abort_all();
        }
        while background.join_next().await.is_some() {}

        Ok(())
    }
}
