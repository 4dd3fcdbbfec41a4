//! PulseHub - real-time WebSocket connection and subscription engine
//!
//! Usage:
//!   pulsehub [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>              Configuration file path
//!   -b, --bind <ADDR>                WebSocket bind address (default: 0.0.0.0:8080)
//!   --admin-bind <ADDR>              Management bind address (default: 127.0.0.1:9090)
//!   --max-connections <N>            Maximum connections (default: 1000)
//!   --max-connections-per-user <N>   Maximum connections per user (default: 5)
//!   -l, --log-level                  Log level (error, warn, info, debug, trace)
//!   -h, --help                       Print help

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use pulsehub::auth::TokenVerifier;
use pulsehub::config::{Config, EngineConfig};
use pulsehub::Server;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }

    fn from_config(level: &str) -> Self {
        match level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::default(),
        }
    }
}

/// PulseHub - real-time WebSocket engine
#[derive(Parser, Debug)]
#[command(name = "pulsehub")]
#[command(author = "PulseHub Contributors")]
#[command(version)]
#[command(about = "Real-time WebSocket connection and subscription engine")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// WebSocket bind address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Management (REST + metrics) bind address
    #[arg(long)]
    admin_bind: Option<SocketAddr>,

    /// Maximum concurrent connections
    #[arg(long)]
    max_connections: Option<usize>,

    /// Maximum connections per user
    #[arg(long)]
    max_connections_per_user: Option<usize>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration file if specified, otherwise env overrides on defaults
    let loaded = match &args.config {
        Some(path) => Config::load(path),
        None => Config::from_env(),
    };
    let file_config = match loaded {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            std::process::exit(1);
        }
    };

    // CLI overrides config, config overrides default (info)
    let log_level = args
        .log_level
        .unwrap_or_else(|| LogLevel::from_config(&file_config.log.level));

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    let mut engine_config = EngineConfig::from(&file_config);
    if let Some(bind) = args.bind {
        engine_config.bind_addr = bind;
    }
    if let Some(admin_bind) = args.admin_bind {
        engine_config.admin_bind_addr = Some(admin_bind);
    }
    if let Some(max) = args.max_connections {
        engine_config.max_connections = max;
    }
    if let Some(max) = args.max_connections_per_user {
        engine_config.max_connections_per_user = max;
    }
    if engine_config.max_connections == 0 || engine_config.max_connections_per_user == 0 {
        eprintln!("Connection limits must be at least 1");
        std::process::exit(1);
    }

    info!("Starting PulseHub");
    info!(
        "  WebSocket address: {} (path: {})",
        engine_config.bind_addr, engine_config.ws_path
    );
    match engine_config.admin_bind_addr {
        Some(addr) => info!("  Management: enabled (http://{})", addr),
        None => info!("  Management: disabled"),
    }
    info!("  Max connections: {}", engine_config.max_connections);
    info!(
        "  Max connections per user: {}",
        engine_config.max_connections_per_user
    );
    info!(
        "  Heartbeat: every {:?}, timeout after {:?}",
        engine_config.heartbeat_interval,
        engine_config.heartbeat_timeout()
    );
    info!(
        "  Authentication: {} token(s) configured",
        file_config.auth.tokens.len()
    );

    let verifier = Arc::new(TokenVerifier::new(&file_config.auth));
    let server = Server::bind(engine_config, verifier).await?;

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C");
            shutdown.shutdown();
        }
    });

    server.run().await?;

    Ok(())
}
