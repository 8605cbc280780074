//! Dialing the local service

use crate::config::TunnelConfig;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::debug;

/// Failure to reach the local service
#[derive(Debug, Error)]
pub enum DialError {
    #[error("connection refused by {0}")]
    Refused(String),

    #[error("connecting to {addr} timed out after {timeout:?}")]
    Timeout { addr: String, timeout: Duration },

    #[error("{addr} is unreachable: {source}")]
    Unreachable { addr: String, source: io::Error },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Opens one fresh connection to the local service per stream
#[derive(Debug, Clone)]
pub struct LocalDialer {
    addr: String,
    timeout: Duration,
}

impl LocalDialer {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }

    pub fn from_config(config: &TunnelConfig) -> Self {
        Self::new(config.local_addr(), config.timeouts.local_dial)
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub async fn dial(&self) -> Result<TcpStream, DialError> {
        let stream = match tokio::time::timeout(self.timeout, TcpStream::connect(self.addr.as_str())).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(self.classify(e)),
            Err(_) => {
                return Err(DialError::Timeout {
                    addr: self.addr.clone(),
                    timeout: self.timeout,
                })
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY on local connection: {}", e);
        }

        Ok(stream)
    }

    fn classify(&self, e: io::Error) -> DialError {
        match e.kind() {
            io::ErrorKind::ConnectionRefused => DialError::Refused(self.addr.clone()),
            io::ErrorKind::HostUnreachable
            | io::ErrorKind::NetworkUnreachable
            | io::ErrorKind::AddrNotAvailable => DialError::Unreachable {
                addr: self.addr.clone(),
                source: e,
            },
            _ => DialError::Io(e),
        }
    }
}
