//! Error taxonomy for the tunnel client

use thiserror::Error;
use uniqx_connection::TransportError;
use uniqx_proto::{CodecError, RelayErrorCode};

/// Why the relay refused a registration
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    #[error("Subdomain '{0}' is already taken")]
    SubdomainTaken(String),

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Invalid subdomain: {0}")]
    InvalidSubdomain(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Registration rejected (code {code}): {message}")]
    Rejected { code: u16, message: String },
}

impl RegistrationError {
    /// Map an `error` frame received while registering
    pub fn from_relay(code: RelayErrorCode, message: String, requested: Option<&str>) -> Self {
        match code {
            RelayErrorCode::SubdomainTaken => {
                RegistrationError::SubdomainTaken(requested.map(str::to_string).unwrap_or(message))
            }
            RelayErrorCode::QuotaExceeded => RegistrationError::QuotaExceeded(message),
            RelayErrorCode::InvalidSubdomain => RegistrationError::InvalidSubdomain(message),
            RelayErrorCode::Unauthorized => RegistrationError::Unauthorized(message),
            RelayErrorCode::Other(code) => RegistrationError::Rejected { code, message },
        }
    }

    /// Rejections that no amount of retrying will fix
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RegistrationError::QuotaExceeded(_)
                | RegistrationError::InvalidSubdomain(_)
                | RegistrationError::Unauthorized(_)
        )
    }
}

/// Tunnel client errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Registration failed: {0}")]
    Registration(#[from] RegistrationError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Gave up after {0} reconnection attempts")]
    RetriesExhausted(usize),

    #[error("Tunnel already started")]
    AlreadyStarted,

    #[error("Tunnel cancelled")]
    Cancelled,
}

impl TunnelError {
    /// Returns true if this error is non-recoverable and retrying won't help
    pub fn is_non_recoverable(&self) -> bool {
        match self {
            TunnelError::Registration(e) => e.is_fatal(),
            TunnelError::Config(_)
            | TunnelError::RetriesExhausted(_)
            | TunnelError::AlreadyStarted => true,
            _ => false,
        }
    }

    /// Returns true if this error is recoverable and retrying might succeed
    pub fn is_recoverable(&self) -> bool {
        !self.is_non_recoverable()
    }
}

impl From<TransportError> for TunnelError {
    fn from(e: TransportError) -> Self {
        TunnelError::Transport(e.to_string())
    }
}

impl From<CodecError> for TunnelError {
    fn from(e: CodecError) -> Self {
        TunnelError::Protocol(e.to_string())
    }
}

impl From<std::io::Error> for TunnelError {
    fn from(e: std::io::Error) -> Self {
        TunnelError::Transport(e.to_string())
    }
}
