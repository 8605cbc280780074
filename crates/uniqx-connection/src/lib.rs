//! Relay connection support
//!
//! Dialing the relay over TCP and the backoff policy used between reconnection
//! attempts.

pub mod duration_millis;
pub mod reconnect;
pub mod transport;

pub use reconnect::{ReconnectConfig, ReconnectError, ReconnectManager, MAX_BACKOFF_MULTIPLIER};
pub use transport::{connect_relay, RelayAddr, TransportError, DEFAULT_RELAY_PORT};
