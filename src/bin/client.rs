//! Portgate tunnel client
//!
//! Connects to the gateway, binds one public endpoint, and relays every
//! connection accepted there to a local TCP destination. The client is
//! crash-only: on channel loss, a refused bind, or heartbeat starvation it
//! exits non-zero and expects a supervisor to restart it.

use anyhow::{bail, Context, Result};
use clap::Parser;
use portgate::client::{self, ClientOptions};
use portgate::config::ProxyRule;
use std::path::PathBuf;
use tracing::info;

/// Portgate Client - reverse tunnel to a portgate gateway
#[derive(Parser, Debug)]
#[command(name = "portgate-client")]
#[command(about = "Portgate Client - expose a local TCP service through the gateway")]
#[command(version, disable_help_flag = true)]
struct Args {
    /// Print help
    #[arg(long = "help", action = clap::ArgAction::HelpLong)]
    help: Option<bool>,

    /// PEM private key presented to the gateway
    #[arg(short = 'k', long = "ssl-key", env = "CLIENT_KEY_PATH")]
    ssl_key: PathBuf,

    /// PEM certificate presented to the gateway
    #[arg(short = 'c', long = "ssl-crt", env = "CLIENT_CERT_PATH")]
    ssl_crt: PathBuf,

    /// Gateway control host
    #[arg(short = 'h', long = "host", env = "REMOTE_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Gateway control port
    #[arg(short = 'p', long = "port", env = "REMOTE_PORT", default_value_t = 8000)]
    port: u16,

    /// Proxy rule: <bind_host>:<bind_port>:<local_host>:<local_port>
    rule: String,

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

    let rule: ProxyRule = args.rule.parse().context("Invalid proxy rule")?;

    info!("Portgate Client v{}", portgate::VERSION);
    info!("Gateway: {}:{}", args.host, args.port);
    info!(
        "Rule: {}:{} -> {}:{}",
        rule.bind_host, rule.bind_port, rule.local_host, rule.local_port
    );

    client::run(ClientOptions {
        remote_host: args.host,
        remote_port: args.port,
        cert_path: args.ssl_crt,
        key_path: args.ssl_key,
        rule,
    })
    .await?;

    // run() only returns by failing; never exit 0
    bail!("control channel ended");
}
