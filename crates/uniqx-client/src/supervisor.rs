//! Reconnection supervisor
//!
//! Runs one control session at a time and decides what happens when it ends:
//! stop, retry at once with a relay-assigned subdomain, or back off and retry.
//! A reconnect asks again for whatever subdomain and TCP port the relay last
//! confirmed.

use crate::config::TunnelConfig;
use crate::error::{RegistrationError, TunnelError};
use crate::session::ControlSession;
use crate::status::{TunnelSignals, TunnelStatus};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uniqx_connection::{ReconnectError, ReconnectManager};

/// A subdomain this tunnel held may still look taken while the relay
/// notices the old connection is gone; retry it this many times first.
const HELD_SUBDOMAIN_RETRIES: usize = 3;

pub struct Supervisor {
    config: Arc<TunnelConfig>,
    signals: Arc<TunnelSignals>,
}

impl Supervisor {
    pub fn new(config: Arc<TunnelConfig>, signals: Arc<TunnelSignals>) -> Self {
        Self { config, signals }
    }

    /// Keep a session running until `cancel` fires or a failure is fatal
    pub async fn run(self, cancel: CancellationToken) -> Result<(), TunnelError> {
        let result = self.supervise(&cancel).await;
        self.signals.set_status(TunnelStatus::Stopped);
        match &result {
            Ok(()) => info!("Tunnel stopped"),
            Err(e) => error!("Tunnel stopped: {}", e),
        }
        result
    }

    async fn supervise(&self, cancel: &CancellationToken) -> Result<(), TunnelError> {
        let mut backoff = ReconnectManager::new(self.config.reconnect.clone());
        let mut requested = self.config.subdomain.clone();
        let mut requested_port = self.config.remote_port;
        // Whether `requested` was confirmed by the relay earlier
        let mut held = false;
        let mut held_retries = 0;

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            self.signals.set_status(TunnelStatus::Connecting);
            let session = ControlSession::new(
                self.config.clone(),
                requested.clone(),
                self.signals.clone(),
            )
            .with_remote_port(requested_port);
            let report = session.run(cancel.clone()).await;

            if let Some(subdomain) = report.subdomain {
                requested = Some(subdomain);
                held = true;
                held_retries = 0;
            }
            if report.remote_port.is_some() {
                requested_port = report.remote_port;
            }
            if let Some(active_for) = report.active_for {
                if backoff.record_session(active_for) {
                    debug!("Session lasted {:?}, backoff reset", active_for);
                }
            }

            let err = match report.outcome {
                Ok(()) | Err(TunnelError::Cancelled) => return Ok(()),
                Err(e) => e,
            };

            if let TunnelError::Registration(RegistrationError::SubdomainTaken(name)) = &err {
                if held && held_retries < HELD_SUBDOMAIN_RETRIES {
                    held_retries += 1;
                    debug!(
                        "Subdomain '{}' not released yet (retry {} of {})",
                        name, held_retries, HELD_SUBDOMAIN_RETRIES
                    );
                } else if self.config.allow_assigned_subdomain && requested.is_some() {
                    warn!(
                        "Subdomain '{}' is taken, asking the relay to assign one",
                        name
                    );
                    requested = None;
                    held = false;
                    continue;
                } else {
                    return Err(err);
                }
            } else if err.is_non_recoverable() {
                return Err(err);
            }

            let delay = match backoff.next_delay() {
                Ok(delay) => delay,
                Err(ReconnectError::MaxAttemptsReached) => {
                    return Err(TunnelError::RetriesExhausted(backoff.attempt() - 1));
                }
            };
            let attempt = backoff.attempt();
            warn!(
                "Tunnel session ended: {}. Reconnecting in {:?} (attempt {})",
                err, delay, attempt
            );
            self.signals
                .set_status(TunnelStatus::Reconnecting { attempt, delay });

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
