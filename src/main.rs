//! Nodegate CLI - Reverse tunnels for blockchain nodes behind NAT
//!
//! Run `nodegate server` on the load balancer and `nodegate client` next to
//! each node.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nodegate_client::{Client, ClientConfig, TlsMaterial};
use nodegate_server::{Server, ServerConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{load_server_tls, TunnelsFile};

/// Nodegate - Reverse tunnels for blockchain nodes
#[derive(Parser, Debug)]
#[command(name = "nodegate")]
#[command(about = "Nodegate - Reverse tunnels for blockchain nodes")]
#[command(version = version())]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Accept tunnel clients and expose their tunnels
    #[command(long_about = r#"
Accept control connections from tunnel clients, bind public ports for their
TCP tunnels and route public HTTP and TLS traffic to them by host name.

EXAMPLES:
  nodegate server --listen 0.0.0.0:4443 --port-range 20000:21000 \
    --token $NODEGATE_TOKEN --tls-cert cert.pem --tls-key key.pem \
    --http-listen 0.0.0.0:80 --sni-listen 0.0.0.0:443

ENVIRONMENT VARIABLES:
  NODEGATE_LISTEN      Control listen address
  NODEGATE_PORT_RANGE  Public port range, first:last
  NODEGATE_TOKEN       Shared client token
    "#)]
    Server {
        /// Control connection listen address
        #[arg(long, env = "NODEGATE_LISTEN", default_value = "0.0.0.0:4443")]
        listen: String,

        /// Public HTTP listen address (optional)
        #[arg(long, env = "NODEGATE_HTTP_LISTEN")]
        http_listen: Option<String>,

        /// Public TLS passthrough listen address (optional)
        #[arg(long, env = "NODEGATE_SNI_LISTEN")]
        sni_listen: Option<String>,

        /// Port range for AUTO allocations, first:last (last excluded)
        #[arg(long, env = "NODEGATE_PORT_RANGE", default_value = "20000:21000")]
        port_range: String,

        /// Token clients must present
        #[arg(long, env = "NODEGATE_TOKEN")]
        token: String,

        /// PEM certificate chain for the control listener
        #[arg(long, requires = "tls_key")]
        tls_cert: Option<PathBuf>,

        /// PEM private key for the control listener
        #[arg(long, requires = "tls_cert")]
        tls_key: Option<PathBuf>,
    },

    /// Connect to a server and forward its traffic to local services
    #[command(long_about = r#"
Connect to a nodegate server, announce the tunnels from a YAML file and
forward every public request or connection to the matching local service.
Reconnects with exponential backoff when the connection drops.

EXAMPLES:
  nodegate client --server lb.example:4443 --token $NODEGATE_TOKEN \
    --id node-1 --tunnels tunnels.yml

ENVIRONMENT VARIABLES:
  NODEGATE_SERVER  Server control address
  NODEGATE_TOKEN   Shared client token
  NODEGATE_ID      Client identity
    "#)]
    Client {
        /// Server control address (host:port)
        #[arg(long, env = "NODEGATE_SERVER")]
        server: String,

        /// Token presented to the server
        #[arg(long, env = "NODEGATE_TOKEN")]
        token: String,

        /// Client identity, unique per server
        #[arg(long, env = "NODEGATE_ID")]
        id: String,

        /// YAML file with the tunnel declarations
        #[arg(long)]
        tunnels: PathBuf,

        /// Plaintext control connection (development only)
        #[arg(long, conflicts_with = "ca_cert")]
        insecure: bool,

        /// PEM bundle of CAs trusted for the server certificate
        #[arg(long)]
        ca_cert: Option<PathBuf>,

        /// Name the server certificate must match (defaults to the server host)
        #[arg(long)]
        server_name: Option<String>,
    },
}

fn version() -> &'static str {
    concat!(
        env!("GIT_TAG"),
        " (",
        env!("GIT_HASH"),
        ", built ",
        env!("BUILD_TIME"),
        ")"
    )
}

/// Setup logging with the specified log level
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

async fn run_server(
    listen: String,
    http_listen: Option<String>,
    sni_listen: Option<String>,
    port_range: String,
    token: String,
    tls: Option<(PathBuf, PathBuf)>,
) -> Result<()> {
    let mut config = ServerConfig::new(listen, port_range).with_token(token);
    match tls {
        Some((cert, key)) => config = config.with_tls(load_server_tls(&cert, &key)?),
        None => warn!("Control listener runs without TLS"),
    }

    let server = Arc::new(Server::bind(config).await.context("Failed to start server")?);

    if let Some(addr) = http_listen {
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind HTTP listener {}", addr))?;
        info!("Public HTTP on {}", addr);
        let server = server.clone();
        tokio::spawn(async move {
            if let Err(e) = server.serve_http(listener).await {
                error!("HTTP entrypoint failed: {}", e);
            }
        });
    }

    if let Some(addr) = sni_listen {
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind SNI listener {}", addr))?;
        info!("Public TLS passthrough on {}", addr);
        let server = server.clone();
        tokio::spawn(async move {
            if let Err(e) = server.serve_sni(listener).await {
                error!("SNI entrypoint failed: {}", e);
            }
        });
    }

    tokio::select! {
        result = server.start() => result.context("Server stopped with an error")?,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            server.stop();
        }
    }

    Ok(())
}

async fn run_client(
    server: String,
    token: String,
    id: String,
    tunnels: PathBuf,
    insecure: bool,
    ca_cert: Option<PathBuf>,
    server_name: Option<String>,
) -> Result<()> {
    let file = TunnelsFile::load(&tunnels)?;

    let tls = if insecure {
        warn!("⚠️  Control connection is not encrypted (insecure mode)");
        TlsMaterial::Insecure
    } else {
        let name = server_name.unwrap_or_else(|| server_host(&server).to_string());
        match ca_cert {
            Some(path) => TlsMaterial::from_ca_file(&path, name)
                .with_context(|| format!("Failed to load CA bundle {}", path.display()))?,
            None => TlsMaterial::webpki(name),
        }
    };

    let mut config = ClientConfig::new(server, token, id)
        .with_tls(tls)
        .with_backoff(file.backoff.to_backoff());
    for (name, tunnel) in file.tunnels {
        info!(tunnel = %name, protocol = %tunnel.protocol, "Declared tunnel");
        config = config.with_tunnel(name, tunnel);
    }

    let client = Client::new(config).context("Invalid client configuration")?;

    tokio::select! {
        result = client.start() => result.context("Tunnel client stopped")?,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            client.stop();
        }
    }

    Ok(())
}

/// Host part of `host:port`, without IPv6 brackets
fn server_host(addr: &str) -> &str {
    let host = match addr.rsplit_once(':') {
        Some((host, port)) if port.bytes().all(|b| b.is_ascii_digit()) => host,
        _ => addr,
    };
    host.trim_start_matches('[').trim_end_matches(']')
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);
    info!("nodegate {}", version());

    match cli.command {
        Commands::Server {
            listen,
            http_listen,
            sni_listen,
            port_range,
            token,
            tls_cert,
            tls_key,
        } => {
            let tls = tls_cert.zip(tls_key);
            run_server(listen, http_listen, sni_listen, port_range, token, tls).await
        }
        Commands::Client {
            server,
            token,
            id,
            tunnels,
            insecure,
            ca_cert,
            server_name,
        } => run_client(server, token, id, tunnels, insecure, ca_cert, server_name).await,
    }
}
