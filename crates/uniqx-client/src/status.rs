//! Observable tunnel state

use crate::session::SessionState;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Supervisor-level view of the tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelStatus {
    Connecting,
    Online { subdomain: String },
    Reconnecting { attempt: usize, delay: Duration },
    Stopped,
}

impl fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelStatus::Connecting => write!(f, "connecting"),
            TunnelStatus::Online { subdomain } => write!(f, "online as {}", subdomain),
            TunnelStatus::Reconnecting { attempt, delay } => {
                write!(f, "reconnecting in {:?} (attempt {})", delay, attempt)
            }
            TunnelStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// Watch channels shared by the facade, the supervisor and each session
pub struct TunnelSignals {
    pub(crate) status: watch::Sender<TunnelStatus>,
    pub(crate) subdomain: watch::Sender<Option<String>>,
    /// Public port of a registered TCP tunnel
    pub(crate) remote_port: watch::Sender<Option<u16>>,
    pub(crate) session: watch::Sender<SessionState>,
    pub(crate) streams: Arc<watch::Sender<usize>>,
}

impl TunnelSignals {
    pub fn new() -> Self {
        Self {
            status: watch::channel(TunnelStatus::Connecting).0,
            subdomain: watch::channel(None).0,
            remote_port: watch::channel(None).0,
            session: watch::channel(SessionState::Closed).0,
            streams: Arc::new(watch::channel(0).0),
        }
    }

    pub fn status(&self) -> watch::Receiver<TunnelStatus> {
        self.status.subscribe()
    }

    pub fn subdomain(&self) -> watch::Receiver<Option<String>> {
        self.subdomain.subscribe()
    }

    pub fn remote_port(&self) -> watch::Receiver<Option<u16>> {
        self.remote_port.subscribe()
    }

    pub fn session(&self) -> watch::Receiver<SessionState> {
        self.session.subscribe()
    }

    pub fn streams(&self) -> watch::Receiver<usize> {
        self.streams.subscribe()
    }

    pub(crate) fn set_status(&self, status: TunnelStatus) {
        self.status.send_replace(status);
    }
}

impl Default for TunnelSignals {
    fn default() -> Self {
        Self::new()
    }
}
