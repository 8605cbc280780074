//! Reconnection logic with exponential backoff

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Largest backoff multiplier a config may carry
pub const MAX_BACKOFF_MULTIPLIER: f64 = 10.0;

/// Reconnection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Initial backoff duration
    #[serde(with = "crate::duration_millis")]
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    #[serde(with = "crate::duration_millis")]
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f64,
    /// Random spread applied to each delay, as a fraction (0.2 = ±20%)
    pub jitter: f64,
    /// A session that stays up this long resets the backoff
    #[serde(with = "crate::duration_millis")]
    pub stability_window: Duration,
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<usize>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.2,
            stability_window: Duration::from_secs(10),
            max_attempts: None,
        }
    }
}

/// Reconnection errors
#[derive(Debug, Error)]
pub enum ReconnectError {
    #[error("Max reconnection attempts reached")]
    MaxAttemptsReached,
}

/// Reconnection manager with exponential backoff
#[derive(Debug)]
pub struct ReconnectManager {
    config: ReconnectConfig,
    current_backoff: Duration,
    attempt: usize,
}

impl ReconnectManager {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            current_backoff: config.initial_backoff,
            config,
            attempt: 0,
        }
    }

    /// Compute the delay before the next attempt and advance the backoff
    ///
    /// The un-jittered base never decreases and never exceeds `max_backoff`;
    /// the returned delay is the base with jitter applied, clamped to the cap.
    pub fn next_delay(&mut self) -> Result<Duration, ReconnectError> {
        self.attempt += 1;

        if let Some(max_attempts) = self.config.max_attempts {
            if self.attempt > max_attempts {
                return Err(ReconnectError::MaxAttemptsReached);
            }
        }

        let delay = self.jittered(self.current_backoff);
        debug!(
            "Backing off {:?} before reconnection attempt {}",
            delay, self.attempt
        );

        // Saturates at the cap instead of overflowing `Duration`
        let next_backoff = Duration::try_from_secs_f64(
            self.current_backoff.as_secs_f64() * self.config.multiplier,
        )
        .unwrap_or(self.config.max_backoff);
        self.current_backoff = next_backoff
            .max(self.current_backoff)
            .min(self.config.max_backoff);

        Ok(delay)
    }

    /// Account for a finished session; a stable one resets the backoff
    pub fn record_session(&mut self, active_for: Duration) -> bool {
        if active_for >= self.config.stability_window {
            self.reset();
            true
        } else {
            false
        }
    }

    /// Reset backoff (call after successful connection)
    pub fn reset(&mut self) {
        debug!("Resetting reconnection backoff");
        self.current_backoff = self.config.initial_backoff;
        self.attempt = 0;
    }

    /// Get current attempt number
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// Get current backoff duration (before jitter)
    pub fn current_backoff(&self) -> Duration {
        self.current_backoff
    }

    fn jittered(&self, base: Duration) -> Duration {
        let jitter = self.config.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return base;
        }
        let factor = rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter);
        Duration::try_from_secs_f64(base.as_secs_f64() * factor)
            .unwrap_or(self.config.max_backoff)
            .min(self.config.max_backoff)
    }
}
