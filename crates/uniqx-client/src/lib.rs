//! Uniqx tunnel client - Public API
//!
//! Exposes a local TCP service through a public relay. The client keeps one
//! outbound connection to the relay, registers a subdomain on it and carries
//! every public connection as a multiplexed stream to a freshly dialed local
//! connection.
//!
//! ```no_run
//! use uniqx_client::{Tunnel, TunnelConfig};
//!
//! # async fn run() -> Result<(), uniqx_client::TunnelError> {
//! let config = TunnelConfig::builder()
//!     .local_port(8000)
//!     .subdomain("demo")
//!     .build()?;
//!
//! let tunnel = Tunnel::new(config);
//! let handle = tunnel.handle();
//! tokio::spawn(async move {
//!     tokio::signal::ctrl_c().await.ok();
//!     handle.stop();
//! });
//! tunnel.start().await
//! # }
//! ```

pub mod config;
pub mod dialer;
pub mod error;
pub mod multiplexer;
pub mod session;
pub mod status;
pub mod supervisor;
pub mod tunnel;

pub use config::{
    SessionTimeouts, TunnelConfig, TunnelConfigBuilder, DEFAULT_LOCAL_HOST, DEFAULT_RELAY_HOST,
};
pub use dialer::{DialError, LocalDialer};
pub use error::{RegistrationError, TunnelError};
pub use multiplexer::{MuxError, Multiplexer, StreamPhase, StreamStats};
pub use session::{ControlSession, SessionReport, SessionState};
pub use status::{TunnelSignals, TunnelStatus};
pub use supervisor::Supervisor;
pub use tunnel::{open_tunnel, PublicEndpoint, Tunnel, TunnelHandle};

pub use uniqx_connection::ReconnectConfig;
pub use uniqx_proto::Protocol;
