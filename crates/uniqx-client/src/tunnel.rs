//! Tunnel facade

use crate::config::TunnelConfig;
use crate::session::SessionState;
use crate::status::{TunnelSignals, TunnelStatus};
use crate::supervisor::Supervisor;
use crate::TunnelError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uniqx_proto::Protocol;

/// Port the relay serves subdomain tunnels on
const HTTPS_PORT: u16 = 443;

/// A reverse tunnel from the relay to one local port
pub struct Tunnel {
    config: Arc<TunnelConfig>,
    signals: Arc<TunnelSignals>,
    cancel: CancellationToken,
    started: AtomicBool,
    public_host: String,
}

/// Where the public side of a registered tunnel is reachable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicEndpoint {
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
}

impl PublicEndpoint {
    pub fn url(&self) -> String {
        match self.protocol {
            Protocol::Http => format!("https://{}", self.host),
            Protocol::Tcp => format!("tcp://{}:{}", self.host, self.port),
        }
    }
}

impl Tunnel {
    pub fn new(config: TunnelConfig) -> Self {
        let public_host = config
            .relay_addr()
            .map(|addr| addr.host)
            .unwrap_or_else(|_| config.relay_host.clone());

        Self {
            config: Arc::new(config),
            signals: Arc::new(TunnelSignals::new()),
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            public_host,
        }
    }

    /// Run the tunnel until [`Tunnel::stop`] or a fatal failure.
    ///
    /// Transient failures are retried with backoff and never surface here;
    /// an explicit stop returns `Ok(())`.
    pub async fn start(&self) -> Result<(), TunnelError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(TunnelError::AlreadyStarted);
        }
        if let Err(e) = self.config.validate() {
            self.signals.set_status(TunnelStatus::Stopped);
            return Err(e);
        }

        info!(
            "Starting tunnel to {} for {}",
            self.config.relay_host,
            self.config.local_addr()
        );
        Supervisor::new(self.config.clone(), self.signals.clone())
            .run(self.cancel.clone())
            .await
    }

    /// Drain in-flight streams and stop. Idempotent.
    pub fn stop(&self) {
        if !self.cancel.is_cancelled() {
            info!("Stopping tunnel");
        }
        self.cancel.cancel();
    }

    /// Cloneable stop handle usable from any task
    pub fn handle(&self) -> TunnelHandle {
        TunnelHandle {
            cancel: self.cancel.clone(),
            signals: self.signals.clone(),
            public_host: self.public_host.clone(),
            protocol: self.config.protocol,
        }
    }

    /// Current public subdomain; `None` while disconnected
    pub fn subdomain(&self) -> watch::Receiver<Option<String>> {
        self.signals.subdomain()
    }

    pub fn state(&self) -> watch::Receiver<TunnelStatus> {
        self.signals.status()
    }

    /// Public port of a TCP tunnel; `None` while disconnected or for HTTP
    pub fn remote_port(&self) -> watch::Receiver<Option<u16>> {
        self.signals.remote_port()
    }

    pub fn session_state(&self) -> watch::Receiver<SessionState> {
        self.signals.session()
    }

    /// Number of live streams in the current session
    pub fn active_streams(&self) -> watch::Receiver<usize> {
        self.signals.streams()
    }

    pub fn public_endpoint(&self) -> Option<PublicEndpoint> {
        public_endpoint(&self.signals, &self.public_host, self.config.protocol)
    }

    pub fn public_url(&self) -> Option<String> {
        self.public_endpoint().map(|endpoint| endpoint.url())
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }
}

/// Handle to a running [`Tunnel`]
#[derive(Clone)]
pub struct TunnelHandle {
    cancel: CancellationToken,
    signals: Arc<TunnelSignals>,
    public_host: String,
    protocol: Protocol,
}

impl TunnelHandle {
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn subdomain(&self) -> watch::Receiver<Option<String>> {
        self.signals.subdomain()
    }

    pub fn state(&self) -> watch::Receiver<TunnelStatus> {
        self.signals.status()
    }

    pub fn public_endpoint(&self) -> Option<PublicEndpoint> {
        public_endpoint(&self.signals, &self.public_host, self.protocol)
    }

    pub fn public_url(&self) -> Option<String> {
        self.public_endpoint().map(|endpoint| endpoint.url())
    }
}

fn public_endpoint(
    signals: &TunnelSignals,
    relay_host: &str,
    protocol: Protocol,
) -> Option<PublicEndpoint> {
    let subdomain = signals.subdomain.borrow().clone()?;
    match protocol {
        Protocol::Http => Some(PublicEndpoint {
            protocol,
            host: format!("{}.{}", subdomain, relay_host),
            port: HTTPS_PORT,
        }),
        Protocol::Tcp => {
            let port = (*signals.remote_port.borrow())?;
            Some(PublicEndpoint {
                protocol,
                host: relay_host.to_string(),
                port,
            })
        }
    }
}

/// Run a tunnel to completion
pub async fn open_tunnel(config: TunnelConfig) -> Result<(), TunnelError> {
    Tunnel::new(config).start().await
}
