//! Portgate gateway server
//!
//! Listens for control channels from tunnel clients, admits them by the
//! SHA-1 digest of their certificate's public key, and binds public TCP
//! endpoints on their behalf.
//!
//! Configured through the environment: `CONTROL_HOST`, `CONTROL_PORT`,
//! `SERVER_KEY_PATH`, `SERVER_CERT_PATH`, `AUTHORIZED_CLIENTS`.

use anyhow::{Context, Result};
use clap::Parser;
use portgate::config::ServerConfig;
use portgate::server::allowlist::Allowlist;
use portgate::server::Gateway;
use portgate::tls;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// Portgate Server - reverse-tunneling gateway
#[derive(Parser, Debug)]
#[command(name = "portgate-server")]
#[command(about = "Portgate Server - expose tunnel clients' services on public endpoints")]
#[command(version)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(&args.log_level)
        .init();

    let config = ServerConfig::from_env().context("Failed to load configuration")?;

    let allowlist = Allowlist::load(&config.authorized_clients)
        .context("Failed to load the allow-list")?;
    allowlist.spawn_watcher();

    let tls_config = tls::server_config(&config.cert_path, &config.key_path)
        .context("Failed to build the TLS config")?;
    let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(tls_config));

    let listener = TcpListener::bind(config.control_addr())
        .await
        .with_context(|| format!("Failed to bind {}", config.control_addr()))?;

    info!("Portgate Server v{}", portgate::VERSION);
    info!("Control endpoint on {}", config.control_addr());
    info!("Allow-list: {}", config.authorized_clients.display());

    let gateway = Gateway::new(allowlist);
    gateway.run(listener, acceptor).await?;

    Ok(())
}
