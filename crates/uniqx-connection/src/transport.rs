//! TCP transport to the relay

use socket2::{SockRef, TcpKeepalive};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Port used when the relay host carries none
pub const DEFAULT_RELAY_PORT: u16 = 4443;

/// Idle time before the kernel starts probing a silent relay connection
const KEEPALIVE_TIME: Duration = Duration::from_secs(30);

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Invalid relay address: {0}")]
    InvalidAddress(String),
}

/// Relay host and port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayAddr {
    pub host: String,
    pub port: u16,
}

impl RelayAddr {
    /// Parse a relay address
    ///
    /// Supports:
    /// - `relay.example.com` (defaults to port 4443)
    /// - `relay.example.com:5000`
    /// - `127.0.0.1:5000`
    /// - `[::1]:5000` and bare `::1`
    pub fn parse(input: &str) -> Result<Self, TransportError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(TransportError::InvalidAddress("empty host".to_string()));
        }

        // Bracketed IPv6, with or without a port
        if let Some(rest) = input.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| TransportError::InvalidAddress(input.to_string()))?;
            let port = match tail.strip_prefix(':') {
                Some(port) => parse_port(input, port)?,
                None if tail.is_empty() => DEFAULT_RELAY_PORT,
                None => return Err(TransportError::InvalidAddress(input.to_string())),
            };
            return Ok(Self {
                host: host.to_string(),
                port,
            });
        }

        match input.rsplit_once(':') {
            // More than one colon without brackets is a bare IPv6 address
            Some((host, _)) if host.contains(':') => Ok(Self {
                host: input.to_string(),
                port: DEFAULT_RELAY_PORT,
            }),
            Some((host, port)) => {
                if host.is_empty() {
                    return Err(TransportError::InvalidAddress(input.to_string()));
                }
                Ok(Self {
                    host: host.to_string(),
                    port: parse_port(input, port)?,
                })
            }
            None => Ok(Self {
                host: input.to_string(),
                port: DEFAULT_RELAY_PORT,
            }),
        }
    }
}

fn parse_port(input: &str, port: &str) -> Result<u16, TransportError> {
    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(TransportError::InvalidAddress(input.to_string())),
        Ok(port) => Ok(port),
    }
}

impl fmt::Display for RelayAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Open a TCP connection to the relay within `timeout`
pub async fn connect_relay(addr: &RelayAddr, timeout: Duration) -> Result<TcpStream, TransportError> {
    debug!("Connecting to relay at {}", addr);

    let stream = tokio::time::timeout(timeout, TcpStream::connect((addr.host.as_str(), addr.port)))
        .await
        .map_err(|_| TransportError::Timeout(timeout))??;

    stream.set_nodelay(true)?;

    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_TIME);
    if let Err(e) = SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
        // Not fatal; the session heartbeat still detects dead peers.
        warn!("Failed to enable TCP keepalive on relay connection: {}", e);
    }

    Ok(stream)
}
