//! Uniqx CLI - expose a local port through a public relay
//!
//! Registers a subdomain on the relay and forwards every public connection to
//! the local service, reconnecting automatically until Ctrl+C.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uniqx_client::{
    Protocol, PublicEndpoint, Tunnel, TunnelConfig, DEFAULT_LOCAL_HOST, DEFAULT_RELAY_HOST,
};

/// Uniqx - Share a local port on a public URL
#[derive(Parser, Debug)]
#[command(name = "uniqx")]
#[command(about = "Uniqx - Share a local port on a public URL")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
#[command(long_about = r#"
Share a local TCP service through the relay under a public subdomain.
The tunnel reconnects on its own if the relay connection drops.

EXAMPLES:
  # Expose a local web server on a chosen subdomain
  uniqx --port 8000 --subdomain demo

  # Use a self-hosted relay and let it pick the subdomain
  uniqx --port 3000 --host relay.example.com:7000

  # Expose a local database as a raw TCP port on the relay
  uniqx --port 5432 --protocol tcp --remote-port 15432

ENVIRONMENT VARIABLES:
  UNIQX_PORT         Local port to expose
  UNIQX_SUBDOMAIN    Requested subdomain
  UNIQX_HOST         Relay host[:port]
  UNIQX_PROTOCOL     Public protocol (http or tcp)
  UNIQX_REMOTE_PORT  Public port to request for tcp tunnels
"#)]
struct Cli {
    /// Local port to expose
    #[arg(short, long, env = "UNIQX_PORT")]
    port: u16,

    /// Subdomain to request (assigned by the relay if omitted or taken)
    #[arg(short, long, env = "UNIQX_SUBDOMAIN")]
    subdomain: Option<String>,

    /// Relay host, optionally with a port (default port 4443)
    #[arg(long, env = "UNIQX_HOST", default_value = DEFAULT_RELAY_HOST)]
    host: String,

    /// Protocol the relay serves publicly (http or tcp)
    #[arg(long, env = "UNIQX_PROTOCOL", default_value = "http")]
    protocol: Protocol,

    /// Public port to request on the relay (tcp only)
    #[arg(long, env = "UNIQX_REMOTE_PORT")]
    remote_port: Option<u16>,

    /// Host the local service listens on
    #[arg(long, default_value = DEFAULT_LOCAL_HOST)]
    local_host: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Setup logging with the specified log level
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(verbose).with_thread_ids(false))
        .with(filter)
        .init();
}

fn build_config(cli: &Cli) -> Result<TunnelConfig> {
    let mut builder = TunnelConfig::builder()
        .local_port(cli.port)
        .local_host(cli.local_host.clone())
        .relay_host(cli.host.clone())
        .protocol(cli.protocol);
    if let Some(subdomain) = &cli.subdomain {
        builder = builder.subdomain(subdomain.clone());
    }
    if let Some(port) = cli.remote_port {
        builder = builder.remote_port(port);
    }
    builder.build().context("Invalid tunnel configuration")
}

fn status_lines(endpoint: &PublicEndpoint, local_addr: &str) -> Vec<String> {
    vec![
        "Status: \t Online".to_string(),
        format!("Protocol: \t {}", endpoint.protocol),
        format!("Public URL: \t {}", endpoint.url()),
        format!(
            "Forwarded: \t {}:{} -> {}",
            endpoint.host, endpoint.port, local_addr
        ),
    ]
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let config = build_config(&cli)?;
    info!(
        "Forwarding {} through {}",
        config.local_addr(),
        config.relay_host
    );

    let tunnel = Tunnel::new(config);
    let handle = tunnel.handle();
    let local_addr = tunnel.config().local_addr();

    // Print where the tunnel is reachable every time the relay confirms it
    let mut subdomain = tunnel.subdomain();
    let status_handle = handle.clone();
    tokio::spawn(async move {
        while subdomain.changed().await.is_ok() {
            if let Some(endpoint) = status_handle.public_endpoint() {
                for line in status_lines(&endpoint, &local_addr) {
                    println!("{}", line);
                }
            }
        }
    });

    let stop_handle = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, draining open connections...");
            stop_handle.stop();
        }
    });

    match tunnel.start().await {
        Ok(()) => {
            println!("Tunnel closed");
            Ok(())
        }
        Err(e) => {
            error!("Tunnel failed: {}", e);
            Err(e).context("Tunnel terminated")
        }
    }
}
