//! Ingress agent CLI
//!
//! Loads ingress rules from a YAML file and serves the rule selected by
//! `--hostname` on a local listener, one origin connection per accepted
//! connection.

use anyhow::{Context, Result};
use clap::Parser;
use ingress::{load_config_file, select_rule, EdgeServer};
use ingress_origin::CancellationToken;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Origin-side ingress agent - bridges tunnel streams to origin services
#[derive(Parser, Debug)]
#[command(name = "ingress-agent")]
#[command(about = "Origin-side ingress agent - bridges tunnel streams to origin services")]
#[command(version)]
#[command(long_about = r#"
Ingress agent accepts connections on a local listener and bridges each one
to the origin service of an ingress rule: raw TCP, TCP over WebSocket,
WebSocket, or a SOCKS5 proxy restricted by IP rules.

EXAMPLES:
  # Serve the catch-all rule of a config file
  ingress-agent --config ingress.yaml

  # Serve the rule for a specific hostname on another port
  ingress-agent -c ingress.yaml --hostname ssh.internal.example.com \
    --listen 127.0.0.1:2222 --log-level debug

ENVIRONMENT VARIABLES:
  INGRESS_CONFIG    Configuration file
  INGRESS_LISTEN    Local listen address
  INGRESS_HOSTNAME  Hostname used to select the ingress rule
"#)]
struct Args {
    /// Configuration file (YAML)
    #[arg(long, short = 'c', env = "INGRESS_CONFIG")]
    config: PathBuf,

    /// Local address accepting tunnel connections
    #[arg(long, env = "INGRESS_LISTEN", default_value = "127.0.0.1:7000")]
    listen: SocketAddr,

    /// Hostname used to select the ingress rule (catch-all rule if not set)
    #[arg(long, env = "INGRESS_HOSTNAME")]
    hostname: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logging first
    setup_logging(&args.log_level)?;

    info!("Ingress agent starting...");
    info!("Loading configuration from: {}", args.config.display());

    let config = load_config_file(&args.config)?;
    let ingress = config.build_ingress()?;
    let rule = select_rule(&ingress, args.hostname.as_deref())?;

    info!(
        rules = ingress.rules().len(),
        hostname = ?rule.hostname(),
        service = rule.service.kind(),
        "Ingress rule selected"
    );

    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("Failed to bind {}", args.listen))?;

    let shutdown = CancellationToken::new();
    let mut server_task = tokio::spawn(EdgeServer::new(rule).run(listener, shutdown.clone()));

    // Setup Ctrl+C handler
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    tokio::select! {
        _ = &mut ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
            shutdown.cancel();
            match server_task.await {
                Ok(result) => result?,
                Err(e) => {
                    error!("Edge listener task panicked: {}", e);
                    return Err(e.into());
                }
            }
        }
        result = &mut server_task => {
            match result {
                Ok(Ok(())) => info!("Edge listener stopped"),
                Ok(Err(e)) => {
                    error!("Edge listener error: {:#}", e);
                    return Err(e);
                }
                Err(e) => {
                    error!("Edge listener task panicked: {}", e);
                    return Err(e.into());
                }
            }
        }
    }

    info!("Ingress agent stopped");
    Ok(())
}
