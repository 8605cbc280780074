//! Protocol message types

use crate::mux::StreamId;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Decoded view of a frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    // Control messages (Stream ID 0)
    Register {
        protocol: Protocol,
        /// Public port asked for on a TCP tunnel
        remote_port: Option<u16>,
        /// Empty lets the relay pick one
        subdomain: String,
    },
    Registered {
        subdomain: String,
        /// Public port the relay opened for a TCP tunnel
        remote_port: Option<u16>,
    },
    Ping {
        payload: Bytes,
    },
    Pong {
        payload: Bytes,
    },
    Error {
        code: RelayErrorCode,
        message: String,
    },

    // Stream messages
    Open {
        stream_id: StreamId,
    },
    Data {
        stream_id: StreamId,
        payload: Bytes,
    },
    Close {
        stream_id: StreamId,
        reason: CloseReason,
        detail: String,
    },
}

/// What the relay exposes publicly for this tunnel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// HTTPS on `<subdomain>.<relay host>`
    #[default]
    Http,
    /// Raw TCP on a dedicated relay port
    Tcp,
}

impl Protocol {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Protocol::Http),
            1 => Some(Protocol::Tcp),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            Protocol::Http => 0,
            Protocol::Tcp => 1,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Http => write!(f, "http"),
            Protocol::Tcp => write!(f, "tcp"),
        }
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" | "https" => Ok(Protocol::Http),
            "tcp" => Ok(Protocol::Tcp),
            other => Err(format!("unknown protocol '{}' (expected http or tcp)", other)),
        }
    }
}

/// Error codes the relay sends in an `error` frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayErrorCode {
    SubdomainTaken,
    QuotaExceeded,
    InvalidSubdomain,
    Unauthorized,
    Other(u16),
}

impl RelayErrorCode {
    pub fn from_u16(value: u16) -> Self {
        match value {
            1 => RelayErrorCode::SubdomainTaken,
            2 => RelayErrorCode::QuotaExceeded,
            3 => RelayErrorCode::InvalidSubdomain,
            4 => RelayErrorCode::Unauthorized,
            other => RelayErrorCode::Other(other),
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            RelayErrorCode::SubdomainTaken => 1,
            RelayErrorCode::QuotaExceeded => 2,
            RelayErrorCode::InvalidSubdomain => 3,
            RelayErrorCode::Unauthorized => 4,
            RelayErrorCode::Other(code) => *code,
        }
    }
}

impl fmt::Display for RelayErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayErrorCode::SubdomainTaken => write!(f, "subdomain taken"),
            RelayErrorCode::QuotaExceeded => write!(f, "quota exceeded"),
            RelayErrorCode::InvalidSubdomain => write!(f, "invalid subdomain"),
            RelayErrorCode::Unauthorized => write!(f, "unauthorized"),
            RelayErrorCode::Other(code) => write!(f, "relay error {}", code),
        }
    }
}

/// Why a stream was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// Sender has finished writing (half-close)
    Normal,
    /// The local service could not be dialed
    DialFailed,
    /// Reading from or writing to the local service failed
    LocalIo,
    /// The stream's buffer limit was exceeded
    Overflow,
    /// The tunnel is shutting down
    Shutdown,
    Other(u8),
}

impl CloseReason {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => CloseReason::Normal,
            1 => CloseReason::DialFailed,
            2 => CloseReason::LocalIo,
            3 => CloseReason::Overflow,
            4 => CloseReason::Shutdown,
            other => CloseReason::Other(other),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            CloseReason::Normal => 0,
            CloseReason::DialFailed => 1,
            CloseReason::LocalIo => 2,
            CloseReason::Overflow => 3,
            CloseReason::Shutdown => 4,
            CloseReason::Other(code) => *code,
        }
    }

    pub fn is_normal(&self) -> bool {
        matches!(self, CloseReason::Normal)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Normal => write!(f, "normal"),
            CloseReason::DialFailed => write!(f, "dial failed"),
            CloseReason::LocalIo => write!(f, "local i/o error"),
            CloseReason::Overflow => write!(f, "buffer overflow"),
            CloseReason::Shutdown => write!(f, "shutdown"),
            CloseReason::Other(code) => write!(f, "error {}", code),
        }
    }
}
