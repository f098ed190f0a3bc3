//! # Portgate
//!
//! A secure reverse-tunneling gateway. A client inside a private network
//! opens a single mutually-authenticated control channel to a publicly
//! reachable server and asks it to bind public TCP endpoints. External
//! connections arriving on a bound endpoint are multiplexed over the control
//! channel back to the client, which relays them to a local TCP destination.
//!
//! ## Architecture
//!
//! ```text
//!  external TCP ──▶ bound listener ──▶ link ──▶ frames over the control
//!     (server side)                             channel (WSS + mutual TLS)
//!                                                  │
//!                                                  ▼
//!                                            client link ──▶ local service
//! ```
//!
//! All control traffic (open, close, bind, bind-ack) and stream data travel
//! as binary frames on the same WebSocket-over-TLS connection. WebSocket
//! message boundaries carry whole frames, so the frame header needs no
//! length field.

pub mod channel;
pub mod client;
pub mod config;
pub mod link;
pub mod protocol;
pub mod server;
pub mod tls;

use std::time::Duration;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum bytes buffered for a link before its peer confirms it (1 MiB)
pub const EARLY_DATA_LIMIT: usize = 1024 * 1024;

/// Interval between server-originated pings
pub const PING_INTERVAL: Duration = Duration::from_secs(5);

/// A channel silent for this long is considered dead
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Bind refused: {0}")]
    BindRefused(String),

    #[error("Heartbeat timeout")]
    HeartbeatTimeout,

    #[error("Control channel closed")]
    ChannelClosed,
}
