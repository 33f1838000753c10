//! DataBox Daemon (databoxd)
//!
//! Hosts the DataBoxes declared in a configuration file over WebSocket.
//!
//! # Usage
//!
//! ```bash
//! # Start with a config file
//! databoxd --config /etc/databox/config.toml
//!
//! # Custom port and a shared token secret
//! DATABOX_SECRET=change-me databoxd --config databox.toml --ws-port 7001
//!
//! # With Prometheus metrics
//! databoxd --config databox.toml --metrics-port 9100
//! ```

mod config;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use databox_core::{AnyDataBox, DataBoxEnv, DataBoxRegistry, LocalExchange};
use databox_transport::{ConnectConfig, ConnectHandler, Metrics, MetricsServer, WebSocketServer};

use crate::config::DaemonConfig;

/// DataBox Daemon - reactive data synchronization host
#[derive(Parser, Debug)]
#[command(name = "databoxd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// WebSocket port to listen on
    #[arg(long, env = "DATABOX_WS_PORT", default_value = "7070")]
    ws_port: u16,

    /// Bind address
    #[arg(long, env = "DATABOX_BIND", default_value = "0.0.0.0")]
    bind: String,

    /// Configuration file declaring the DataBoxes to host
    #[arg(short, long, env = "DATABOX_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "DATABOX_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Session token secret; overrides the config file
    #[arg(long, env = "DATABOX_SECRET", hide_env_values = true)]
    secret: Option<String>,

    /// Identity of this worker; overrides the config file
    #[arg(long, env = "DATABOX_WORKER_ID")]
    worker_id: Option<String>,

    /// Api level assumed when a client names none
    #[arg(long, env = "DATABOX_DEFAULT_API_LEVEL")]
    default_api_level: Option<u32>,

    /// Maximum DataBoxes a single socket may attach to
    #[arg(long, env = "DATABOX_MAX_PER_SOCKET")]
    max_data_boxes: Option<usize>,

    /// Serve Prometheus metrics on this port
    #[arg(long, env = "DATABOX_METRICS_PORT")]
    metrics_port: Option<u16>,

    /// Seconds between statistics log lines (0 = disabled)
    #[arg(long, env = "DATABOX_STATS_INTERVAL", default_value = "60")]
    stats_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    let config = match &args.config {
        Some(path) => {
            info!(path = %path.display(), "Loading configuration");
            DaemonConfig::load(path)?
        }
        None => {
            warn!("No --config given, hosting no DataBoxes");
            DaemonConfig::default()
        }
    };

    let worker_id = args
        .worker_id
        .clone()
        .or_else(|| config.worker_id.clone())
        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());

    let secret = match args.secret.clone().or_else(|| config.secret.clone()) {
        Some(secret) => secret,
        None => {
            warn!("No token secret configured, session tokens will not survive a restart");
            uuid::Uuid::new_v4().to_string()
        }
    };

    let connect_config = ConnectConfig {
        default_api_level: args
            .default_api_level
            .or(config.default_api_level)
            .unwrap_or(ConnectConfig::default().default_api_level),
        max_data_boxes_per_socket: args
            .max_data_boxes
            .or(config.max_data_boxes_per_socket)
            .unwrap_or(ConnectConfig::default().max_data_boxes_per_socket),
    };

    // Prepare every declared DataBox
    let exchange = Arc::new(LocalExchange::new());
    let env = DataBoxEnv::new(worker_id.clone(), exchange.clone(), secret.into_bytes());
    let registry = Arc::new(DataBoxRegistry::prepare(config.definitions(), &env).await?);

    info!(
        worker = %worker_id,
        ws_port = args.ws_port,
        bind = %args.bind,
        databoxes = registry.len(),
        default_api_level = connect_config.default_api_level,
        max_data_boxes = connect_config.max_data_boxes_per_socket,
        "Starting DataBox daemon"
    );

    let mut handler = ConnectHandler::new(registry.clone(), connect_config);
    let mut handles = Vec::new();

    if let Some(port) = args.metrics_port {
        let metrics = Arc::new(Metrics::new()?);
        handler = handler.with_metrics(metrics.clone());

        let metrics_addr: SocketAddr = format!("{}:{}", args.bind, port).parse()?;
        let metrics_server = MetricsServer::new(metrics, metrics_addr);
        handles.push(tokio::spawn(async move {
            if let Err(e) = metrics_server.run().await {
                tracing::error!(error = %e, "Metrics server error");
            }
        }));
    }

    let ws_addr: SocketAddr = format!("{}:{}", args.bind, args.ws_port).parse()?;
    let ws_server = WebSocketServer::new(Arc::new(handler), ws_addr);
    handles.push(tokio::spawn(async move {
        if let Err(e) = ws_server.run().await {
            tracing::error!(error = %e, "WebSocket server error");
        }
    }));

    // Periodic statistics
    if args.stats_interval > 0 {
        let stats_registry = registry.clone();
        let stats_exchange = exchange.clone();
        let period = tokio::time::Duration::from_secs(args.stats_interval);
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                log_stats(&stats_registry, &stats_exchange);
            }
        }));
    }

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    for handle in handles {
        handle.abort();
    }

    Ok(())
}

fn log_stats(registry: &DataBoxRegistry, exchange: &LocalExchange) {
    for instance in registry.instances() {
        match instance {
            AnyDataBox::Single(data_box) => {
                tracing::debug!(
                    databox = %data_box.name(),
                    api_level = ?data_box.api_level(),
                    sockets = data_box.registered_sockets(),
                    "DataBox stats"
                );
            }
            AnyDataBox::Family(family) => {
                tracing::debug!(
                    databox = %family.name(),
                    api_level = ?family.api_level(),
                    members = family.member_count(),
                    "DataBox family stats"
                );
            }
        }
    }
    let stats = exchange.stats();
    info!(topics = stats.topic_count, published = stats.published, "Exchange stats");
}
