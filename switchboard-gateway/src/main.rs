//! # Switchboard Gateway Binary
//!
//! Starts the gateway: load the YAML configuration tree, build the engine,
//! bind the HTTP server, and on shutdown stop every backend the gateway
//! itself started.
//!
//! ```bash
//! # Default configuration directory (./config)
//! switchboard-gateway
//!
//! # Explicit directory and binding
//! switchboard-gateway --config-dir /etc/switchboard --host 0.0.0.0 --port 8090
//!
//! # Debug logging
//! switchboard-gateway --log-level debug
//! ```

use clap::Parser;
use std::net::SocketAddr;
use switchboard_gateway::config::GatewayConfig;
use switchboard_gateway::server::create_server;

/// Command line arguments.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration directory holding config.yaml, providers/, routes.yaml
    /// and models.yaml
    #[arg(short, long, default_value = "config")]
    config_dir: String,

    /// Override the configured host address
    #[arg(long)]
    host: Option<String>,

    /// Override the configured port
    #[arg(short, long)]
    port: Option<u16>,

    /// Logging filter (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(&args.log_level)
        .init();

    let mut config = GatewayConfig::load(&args.config_dir)?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    let addr = SocketAddr::new(config.server.host.parse()?, config.server.port);
    let (app, state) = create_server(config).await?;

    tracing::info!("starting switchboard gateway on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutting down, stopping owned backends");
    state.shutdown().await;
    Ok(())
}

/// Resolves on Ctrl-C or, on unix, SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
