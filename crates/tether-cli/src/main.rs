//! tether CLI
//!
//! Runs a controller endpoint or connects to one as a control client.

mod config;

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tether_core::{AddressType, CLOSE_NORMAL, PROTOCOL_VERSION, RegisterControl, Registration};
use tether_link::messages::{self, Empty};
use tether_link::{
    Accepted, ClientConnector, Connector, ConnectorEvent, Link, LinkPair, MessageRegistry,
    PermissionSet, ServerEndpoint, TokenAuthenticator,
};
use tether_transport::{WebSocketDialer, websocket};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use config::Config;

/// tether - resumable typed message links
#[derive(Parser)]
#[command(name = "tether")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long, default_value = "tether.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a controller endpoint
    Controller {
        /// Listen address
        #[arg(short, long, default_value = "127.0.0.1:8080")]
        bind: String,

        /// Token clients must present
        #[arg(long)]
        token: String,
    },

    /// Connect as a control client and measure round trips
    Ping {
        /// Controller base URL
        #[arg(short, long, default_value = "http://127.0.0.1:8080/")]
        url: String,

        /// Authentication token
        #[arg(long)]
        token: String,

        /// Number of pings to send
        #[arg(short = 'n', long, default_value_t = 4)]
        count: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load_or_default(&cli.config)?;
    config.validate()?;

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Controller { bind, token } => {
            run_controller(&bind, token, &config).await?;
        }
        Commands::Ping { url, token, count } => {
            run_ping(&url, token, count, &config).await?;
        }
    }

    Ok(())
}

/// Accept control clients and hosts until Ctrl+C
async fn run_controller(bind: &str, token: String, config: &Config) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    let endpoint = Arc::new(ServerEndpoint::new(
        config.server.clone(),
        TokenAuthenticator::new(token),
    )?);
    let registry = Arc::new(messages::builtin_registry()?);

    println!("tether controller");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("Listen: {}", listener.local_addr()?);
    println!(
        "Heartbeat: {}s, session timeout: {}s",
        config.server.heartbeat_interval_secs, config.server.session_timeout_secs
    );
    println!("Press Ctrl+C to stop");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let endpoint = Arc::clone(&endpoint);
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    if let Err(e) = serve_peer(stream, peer, &endpoint, &registry).await {
                        tracing::warn!(%peer, "Connection failed: {:#}", e);
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    println!("\nShutting down...");
    Ok(())
}

async fn serve_peer(
    stream: TcpStream,
    peer: SocketAddr,
    endpoint: &ServerEndpoint,
    registry: &MessageRegistry,
) -> anyhow::Result<()> {
    let connection = websocket::accept(stream).await?;
    let connector = match endpoint.accept(connection).await? {
        Accepted::New { connector, .. } => connector,
        Accepted::Resumed(connector) => {
            tracing::info!(%peer, "{} resumed its session", connector.dst());
            return Ok(());
        }
    };

    let dst = connector.dst();
    let mut events = connector.subscribe();
    let link = Link::new(
        LinkPair::new(AddressType::Controller, dst.kind()),
        Arc::new(connector),
    )?;
    link.set_permission_check(Arc::new(PermissionSet::all()))?;
    registry.attach_all(&link)?;
    tracing::info!(%peer, "{} connected", dst);

    // The link lives as long as its session
    loop {
        match events.recv().await {
            Ok(ConnectorEvent::Close) | Err(RecvError::Closed) => break,
            Ok(ConnectorEvent::Drop) => tracing::info!("{} dropped, awaiting resume", dst),
            Ok(_) | Err(RecvError::Lagged(_)) => {}
        }
    }
    tracing::info!("{} session ended", dst);
    Ok(())
}

/// Connect as a control client and send `count` pings
async fn run_ping(url: &str, token: String, count: u32, config: &Config) -> anyhow::Result<()> {
    let dialer = WebSocketDialer::new(url)?;
    println!("Connecting to {}", dialer.url());

    let registration = Registration::Control(RegisterControl {
        token,
        agent: "tether-cli".to_string(),
        version: PROTOCOL_VERSION.to_string(),
    });
    let connector = ClientConnector::new(dialer, registration, config.connector.clone())?;
    connector.connect().await?;
    println!("Connected as {}", connector.src());

    let link = Link::new(
        LinkPair::new(AddressType::Control, AddressType::Controller),
        Arc::new(connector),
    )?;
    let ping = messages::ping()?;

    let mut rtts = Vec::with_capacity(count as usize);
    for n in 1..=count {
        let start = Instant::now();
        ping.send(&link, &Empty {}).await?;
        let rtt = start.elapsed();
        println!("ping {}: {:.2} ms", n, millis(rtt));
        rtts.push(rtt);
    }

    if let (Some(min), Some(max)) = (rtts.iter().min(), rtts.iter().max()) {
        let total: Duration = rtts.iter().sum();
        let avg = total / u32::try_from(rtts.len()).unwrap_or(u32::MAX);
        println!(
            "\n{} pings: min {:.2} ms, avg {:.2} ms, max {:.2} ms",
            rtts.len(),
            millis(*min),
            millis(avg),
            millis(*max)
        );
    }

    link.close(CLOSE_NORMAL, "Done").await;
    Ok(())
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_ping_defaults() {
        let cli = Cli::parse_from(["tether", "ping", "--token", "secret"]);
        match cli.command {
            Commands::Ping { url, count, .. } => {
                assert_eq!(url, "http://127.0.0.1:8080/");
                assert_eq!(count, 4);
            }
            Commands::Controller { .. } => panic!("parsed the wrong subcommand"),
        }
    }
}
