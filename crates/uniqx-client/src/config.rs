//! Client configuration

use crate::TunnelError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uniqx_connection::{duration_millis, ReconnectConfig, RelayAddr, MAX_BACKOFF_MULTIPLIER};
use uniqx_proto::Protocol;

/// Relay used when none is configured
pub const DEFAULT_RELAY_HOST: &str = "open.yunik.com.np";

/// Host the local service is dialed on
pub const DEFAULT_LOCAL_HOST: &str = "127.0.0.1";

/// Bytes a single stream may hold queued for its local connection (4MiB)
pub const DEFAULT_STREAM_BUFFER_LIMIT: usize = 4 * 1024 * 1024;

const MAX_SUBDOMAIN_LEN: usize = 63;

/// Timing knobs of one relay session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTimeouts {
    /// TCP connect to the relay
    #[serde(with = "duration_millis")]
    pub connect: Duration,
    /// Waiting for `registered` after sending `register`
    #[serde(with = "duration_millis")]
    pub register: Duration,
    /// Silence from the relay after which the session is considered dead
    #[serde(with = "duration_millis")]
    pub read_idle: Duration,
    #[serde(with = "duration_millis")]
    pub ping_interval: Duration,
    #[serde(with = "duration_millis")]
    pub pong_timeout: Duration,
    /// How long a graceful stop waits for in-flight streams
    #[serde(with = "duration_millis")]
    pub drain: Duration,
    /// Dialing the local service for a new stream
    #[serde(with = "duration_millis")]
    pub local_dial: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            register: Duration::from_secs(10),
            read_idle: Duration::from_secs(60),
            ping_interval: Duration::from_secs(15),
            pong_timeout: Duration::from_secs(10),
            drain: Duration::from_secs(5),
            local_dial: Duration::from_secs(5),
        }
    }
}

/// Tunnel configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub local_host: String,
    pub local_port: u16,
    /// HTTP subdomain tunnel or raw TCP port tunnel
    #[serde(default)]
    pub protocol: Protocol,
    /// Public port to ask for on a TCP tunnel; `None` lets the relay pick
    #[serde(default)]
    pub remote_port: Option<u16>,
    /// Requested public subdomain; `None` lets the relay assign one
    pub subdomain: Option<String>,
    /// Relay as `host` or `host:port`
    pub relay_host: String,
    /// Fall back to a relay-assigned subdomain when the requested one is taken
    pub allow_assigned_subdomain: bool,
    pub stream_buffer_limit: usize,
    pub timeouts: SessionTimeouts,
    pub reconnect: ReconnectConfig,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            local_host: DEFAULT_LOCAL_HOST.to_string(),
            local_port: 0,
            protocol: Protocol::Http,
            remote_port: None,
            subdomain: None,
            relay_host: DEFAULT_RELAY_HOST.to_string(),
            allow_assigned_subdomain: true,
            stream_buffer_limit: DEFAULT_STREAM_BUFFER_LIMIT,
            timeouts: SessionTimeouts::default(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl TunnelConfig {
    pub fn builder() -> TunnelConfigBuilder {
        TunnelConfigBuilder::default()
    }

    /// Parsed relay address
    pub fn relay_addr(&self) -> Result<RelayAddr, TunnelError> {
        RelayAddr::parse(&self.relay_host).map_err(|e| TunnelError::Config(e.to_string()))
    }

    /// `host:port` of the local service
    pub fn local_addr(&self) -> String {
        if self.local_host.contains(':') {
            format!("[{}]:{}", self.local_host, self.local_port)
        } else {
            format!("{}:{}", self.local_host, self.local_port)
        }
    }

    /// Check a configuration that did not come through the builder
    /// (e.g. one deserialized from a file)
    pub fn validate(&self) -> Result<(), TunnelError> {
        if self.local_port == 0 {
            return Err(TunnelError::Config("local port is required".to_string()));
        }
        if self.local_host.trim().is_empty() {
            return Err(TunnelError::Config("local host must not be empty".to_string()));
        }
        match (self.protocol, self.remote_port) {
            (Protocol::Http, Some(_)) => {
                return Err(TunnelError::Config(
                    "a remote port only applies to tcp tunnels".to_string(),
                ))
            }
            (Protocol::Tcp, Some(0)) => {
                return Err(TunnelError::Config("remote port must be non-zero".to_string()))
            }
            _ => {}
        }
        if let Some(subdomain) = &self.subdomain {
            if normalize_subdomain(subdomain)?.as_deref() != Some(subdomain.as_str()) {
                return Err(TunnelError::Config(format!(
                    "subdomain '{}' is not in canonical form",
                    subdomain
                )));
            }
        }
        self.relay_addr()?;

        if self.stream_buffer_limit == 0 {
            return Err(TunnelError::Config(
                "stream buffer limit must be positive".to_string(),
            ));
        }

        let t = &self.timeouts;
        if t.ping_interval.is_zero() || t.pong_timeout.is_zero() {
            return Err(TunnelError::Config(
                "ping interval and pong timeout must be positive".to_string(),
            ));
        }
        if t.read_idle <= t.ping_interval {
            return Err(TunnelError::Config(format!(
                "read idle timeout ({:?}) must exceed the ping interval ({:?})",
                t.read_idle, t.ping_interval
            )));
        }

        let r = &self.reconnect;
        if !(1.0..=MAX_BACKOFF_MULTIPLIER).contains(&r.multiplier) {
            return Err(TunnelError::Config(format!(
                "backoff multiplier must be between 1 and {}",
                MAX_BACKOFF_MULTIPLIER
            )));
        }
        if !(0.0..=1.0).contains(&r.jitter) {
            return Err(TunnelError::Config(
                "backoff jitter must be between 0 and 1".to_string(),
            ));
        }
        if r.initial_backoff > r.max_backoff {
            return Err(TunnelError::Config(
                "initial backoff exceeds the backoff cap".to_string(),
            ));
        }

        Ok(())
    }
}

/// Trim and lowercase a requested subdomain; an empty name means "assign one"
pub fn normalize_subdomain(input: &str) -> Result<Option<String>, TunnelError> {
    let name = input.trim().to_ascii_lowercase();
    if name.is_empty() {
        return Ok(None);
    }
    if name.len() > MAX_SUBDOMAIN_LEN {
        return Err(TunnelError::Config(format!(
            "subdomain '{}' is longer than {} characters",
            name, MAX_SUBDOMAIN_LEN
        )));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        || name.starts_with('-')
        || name.ends_with('-')
    {
        return Err(TunnelError::Config(format!(
            "subdomain '{}' may only contain letters, digits and inner hyphens",
            name
        )));
    }
    Ok(Some(name))
}

/// Builder for TunnelConfig
#[derive(Default)]
pub struct TunnelConfigBuilder {
    config: TunnelConfig,
    subdomain: Option<String>,
}

impl TunnelConfigBuilder {
    pub fn local_port(mut self, port: u16) -> Self {
        self.config.local_port = port;
        self
    }

    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.config.protocol = protocol;
        self
    }

    pub fn remote_port(mut self, port: u16) -> Self {
        self.config.remote_port = Some(port);
        self
    }

    pub fn local_host(mut self, host: impl Into<String>) -> Self {
        self.config.local_host = host.into();
        self
    }

    pub fn subdomain(mut self, subdomain: impl Into<String>) -> Self {
        self.subdomain = Some(subdomain.into());
        self
    }

    pub fn relay_host(mut self, host: impl Into<String>) -> Self {
        self.config.relay_host = host.into();
        self
    }

    pub fn allow_assigned_subdomain(mut self, allow: bool) -> Self {
        self.config.allow_assigned_subdomain = allow;
        self
    }

    pub fn stream_buffer_limit(mut self, bytes: usize) -> Self {
        self.config.stream_buffer_limit = bytes;
        self
    }

    pub fn timeouts(mut self, timeouts: SessionTimeouts) -> Self {
        self.config.timeouts = timeouts;
        self
    }

    pub fn reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.config.reconnect = reconnect;
        self
    }

    pub fn build(mut self) -> Result<TunnelConfig, TunnelError> {
        self.config.subdomain = match self.subdomain.as_deref() {
            Some(name) => normalize_subdomain(name)?,
            None => None,
        };
        self.config.local_host = self.config.local_host.trim().to_string();
        self.config.relay_host = self.config.relay_host.trim().to_string();
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = TunnelConfig::builder()
            .local_port(8000)
            .subdomain("  Demo ")
            .build()
            .unwrap();

        assert_eq!(config.local_port, 8000);
        assert_eq!(config.subdomain.as_deref(), Some("demo"));
        assert_eq!(config.local_host, DEFAULT_LOCAL_HOST);
        assert_eq!(config.relay_host, DEFAULT_RELAY_HOST);
        assert_eq!(config.local_addr(), "127.0.0.1:8000");
        assert_eq!(config.relay_addr().unwrap().port, 4443);
        assert!(config.allow_assigned_subdomain);
    }

    #[test]
    fn test_config_builder_missing_port() {
        let result = TunnelConfig::builder().subdomain("demo").build();
        assert!(matches!(result, Err(TunnelError::Config(_))));
    }

    #[test]
    fn test_empty_subdomain_means_assigned() {
        let config = TunnelConfig::builder()
            .local_port(3000)
            .subdomain("   ")
            .build()
            .unwrap();
        assert_eq!(config.subdomain, None);
    }

    #[test]
    fn test_invalid_subdomains() {
        let long = "a".repeat(64);
        for name in ["my_app", "-lead", "trail-", "dot.ted", long.as_str()] {
            let result = TunnelConfig::builder()
                .local_port(3000)
                .subdomain(name)
                .build();
            assert!(result.is_err(), "{} should be rejected", name);
        }
    }

    #[test]
    fn test_invalid_relay_host() {
        let result = TunnelConfig::builder()
            .local_port(3000)
            .relay_host("relay:notaport")
            .build();
        assert!(matches!(result, Err(TunnelError::Config(_))));
    }

    #[test]
    fn test_read_idle_must_exceed_ping_interval() {
        let result = TunnelConfig::builder()
            .local_port(3000)
            .timeouts(SessionTimeouts {
                read_idle: Duration::from_secs(5),
                ping_interval: Duration::from_secs(5),
                ..SessionTimeouts::default()
            })
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_backoff_multiplier_bounds() {
        for multiplier in [0.5, 1e20, f64::NAN, f64::INFINITY] {
            let result = TunnelConfig::builder()
                .local_port(3000)
                .reconnect(ReconnectConfig {
                    multiplier,
                    ..ReconnectConfig::default()
                })
                .build();
            assert!(
                matches!(result, Err(TunnelError::Config(_))),
                "multiplier {} should be rejected",
                multiplier
            );
        }

        let config = TunnelConfig::builder()
            .local_port(3000)
            .reconnect(ReconnectConfig {
                multiplier: MAX_BACKOFF_MULTIPLIER,
                ..ReconnectConfig::default()
            })
            .build();
        assert!(config.is_ok());
    }

    #[test]
    fn test_tcp_tunnel_config() {
        let config = TunnelConfig::builder()
            .local_port(5432)
            .protocol(Protocol::Tcp)
            .remote_port(15432)
            .build()
            .unwrap();
        assert_eq!(config.protocol, Protocol::Tcp);
        assert_eq!(config.remote_port, Some(15432));

        let zero = TunnelConfig::builder()
            .local_port(5432)
            .protocol(Protocol::Tcp)
            .remote_port(0)
            .build();
        assert!(zero.is_err());

        // Subdomain tunnels are always served on the relay's HTTPS port
        let http = TunnelConfig::builder()
            .local_port(8000)
            .remote_port(8080)
            .build();
        assert!(matches!(http, Err(TunnelError::Config(_))));
    }

    #[test]
    fn test_ipv6_local_addr() {
        let config = TunnelConfig::builder()
            .local_port(8080)
            .local_host("::1")
            .build()
            .unwrap();
        assert_eq!(config.local_addr(), "[::1]:8080");
    }

    #[test]
    fn test_validate_rejects_uncanonical_subdomain() {
        let config = TunnelConfig {
            local_port: 3000,
            subdomain: Some("Demo".to_string()),
            ..TunnelConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_json() {
        let config = TunnelConfig::builder()
            .local_port(8000)
            .subdomain("demo")
            .build()
            .unwrap();

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["timeouts"]["ping_interval"], 15000);
        assert_eq!(json["stream_buffer_limit"], 4 * 1024 * 1024);
        assert_eq!(json["protocol"], "http");

        let parsed: TunnelConfig = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(parsed, config);

        // Files written before tcp tunnels existed still load
        let mut legacy = json;
        legacy.as_object_mut().unwrap().remove("protocol");
        legacy.as_object_mut().unwrap().remove("remote_port");
        let parsed: TunnelConfig = serde_json::from_value(legacy).unwrap();
        assert_eq!(parsed.protocol, Protocol::Http);
        assert_eq!(parsed.remote_port, None);
    }
}
