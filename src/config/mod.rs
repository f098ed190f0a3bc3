//! Configuration for the server and client binaries
//!
//! The server is configured entirely through environment variables; the
//! client takes command-line options (with environment fallbacks) plus a
//! single positional proxy rule.

use crate::Error;
use std::path::PathBuf;
use std::str::FromStr;

/// Default control endpoint host
pub const DEFAULT_CONTROL_HOST: &str = "127.0.0.1";

/// Default control endpoint port
pub const DEFAULT_CONTROL_PORT: u16 = 8000;

/// Server configuration, read from the environment
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the control listener binds (`CONTROL_HOST`)
    pub control_host: String,
    /// Port the control listener binds (`CONTROL_PORT`)
    pub control_port: u16,
    /// PEM private key for the control endpoint (`SERVER_KEY_PATH`)
    pub key_path: PathBuf,
    /// PEM certificate chain for the control endpoint (`SERVER_CERT_PATH`)
    pub cert_path: PathBuf,
    /// Allow-list file of client key digests (`AUTHORIZED_CLIENTS`)
    pub authorized_clients: PathBuf,
}

impl ServerConfig {
    /// Load the configuration from environment variables
    pub fn from_env() -> Result<Self, Error> {
        let control_host =
            std::env::var("CONTROL_HOST").unwrap_or_else(|_| DEFAULT_CONTROL_HOST.to_string());

        let control_port = match std::env::var("CONTROL_PORT") {
            Ok(raw) => raw
                .parse()
                .map_err(|_| Error::Config(format!("CONTROL_PORT is not a port: {}", raw)))?,
            Err(_) => DEFAULT_CONTROL_PORT,
        };

        Ok(Self {
            control_host,
            control_port,
            key_path: require_env("SERVER_KEY_PATH")?.into(),
            cert_path: require_env("SERVER_CERT_PATH")?.into(),
            authorized_clients: require_env("AUTHORIZED_CLIENTS")?.into(),
        })
    }

    /// The socket address string the control listener binds
    pub fn control_addr(&self) -> String {
        format!("{}:{}", self.control_host, self.control_port)
    }
}

fn require_env(name: &str) -> Result<String, Error> {
    std::env::var(name).map_err(|_| Error::Config(format!("{} is not set", name)))
}

/// One proxy rule: which public endpoint to bind on the server and which
/// local destination to relay its connections to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRule {
    pub bind_host: String,
    pub bind_port: u16,
    pub local_host: String,
    pub local_port: u16,
}

impl FromStr for ProxyRule {
    type Err = Error;

    /// Parse `<bind_host>:<bind_port>:<local_host>:<local_port>`.
    ///
    /// IPv6 hosts may be bracketed (`[::1]:9000:[::1]:8080`); colons inside
    /// balanced brackets do not split fields.
    fn from_str(rule: &str) -> Result<Self, Error> {
        let parts = split_outside_brackets(rule)?;
        if parts.len() != 4 {
            return Err(Error::Config(format!(
                "proxy rule needs 4 colon-separated fields, got {}: {}",
                parts.len(),
                rule
            )));
        }

        Ok(Self {
            bind_host: strip_brackets(&parts[0])?,
            bind_port: parse_port(&parts[1])?,
            local_host: strip_brackets(&parts[2])?,
            local_port: parse_port(&parts[3])?,
        })
    }
}

impl ProxyRule {
    /// The local destination address to dial for each opened link
    pub fn local_addr(&self) -> String {
        addr_for_dial(&self.local_host, self.local_port)
    }
}

/// Format a host/port pair for `TcpStream::connect`, bracketing IPv6 hosts
pub fn addr_for_dial(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// The control endpoint URL used for the WebSocket handshake
pub fn control_url(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("wss://[{}]:{}", host, port)
    } else {
        format!("wss://{}:{}", host, port)
    }
}

/// Split on colons that are not inside `[...]`
fn split_outside_brackets(input: &str) -> Result<Vec<String>, Error> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth: u32 = 0;

    for ch in input.chars() {
        match ch {
            '[' => {
                depth += 1;
                current.push(ch);
            }
            ']' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| Error::Config(format!("unbalanced brackets in: {}", input)))?;
                current.push(ch);
            }
            ':' if depth == 0 => parts.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }
    parts.push(current);

    if depth != 0 {
        return Err(Error::Config(format!("unbalanced brackets in: {}", input)));
    }

    Ok(parts)
}

fn strip_brackets(host: &str) -> Result<String, Error> {
    if host.is_empty() {
        return Err(Error::Config("empty host in proxy rule".to_string()));
    }
    let stripped = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if stripped.is_empty() {
        return Err(Error::Config("empty host in proxy rule".to_string()));
    }
    Ok(stripped.to_string())
}

fn parse_port(raw: &str) -> Result<u16, Error> {
    raw.parse()
        .map_err(|_| Error::Config(format!("invalid port in proxy rule: {}", raw)))
}
