//! Duet Signal Server
//!
//! WebRTC signaling relay for two-party rooms.
//!
//! # Usage
//!
//! ```bash
//! # Defaults (or ~/.config/duet/config.toml if present)
//! duet-signal --port 8080
//!
//! # Explicit config file, browser origin restricted
//! duet-signal --config /etc/duet/config.toml --allowed-origin https://app.example.com
//! ```

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use duet_core::Config;
use duet_signal::{Datastore, SignalServer};

#[derive(Parser, Debug)]
#[command(name = "duet-signal")]
#[command(about = "Duet WebRTC signaling relay")]
#[command(version)]
struct Args {
    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "DUET_PORT")]
    port: Option<u16>,

    /// Bind address
    #[arg(short, long, env = "DUET_BIND")]
    bind: Option<IpAddr>,

    /// Only browser origin allowed to use the server
    #[arg(long, env = "DUET_ALLOWED_ORIGIN")]
    allowed_origin: Option<String>,

    /// Print a sample configuration file and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let args = Args::parse();

    if args.print_config {
        println!("{}", Config::sample());
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    };
    if let Some(port) = args.port {
        config.signal.port = port;
    }
    if let Some(bind) = args.bind {
        config.signal.bind = bind;
    }
    if let Some(origin) = args.allowed_origin {
        config.signal.allowed_origin = Some(origin);
    }

    let addr = SocketAddr::new(config.signal.bind, config.signal.port);

    info!("Starting Duet Signal Server");
    match &config.signal.allowed_origin {
        Some(origin) => info!("Accepting browser requests from {}", origin),
        None => info!("Accepting browser requests from any origin"),
    }

    let store = Arc::new(Datastore::new());
    let server = Arc::new(SignalServer::new(store, config.signal));
    server.serve(addr).await?;

    Ok(())
}
