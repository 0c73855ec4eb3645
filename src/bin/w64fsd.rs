//! Server entry point: loads the TOML config, binds the listener, and
//! serves the RPC endpoint forever (`spec.md` §5, §9).

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use w64fsd::config::{Config, ConfigHandle};
use w64fsd::AppState;

#[derive(Parser, Debug)]
#[command(name = "w64fsd", about = "Remote storage backend for 8-bit home computers")]
struct Args {
    /// Path to the TOML config file.
    #[arg(short, long, default_value = "w64fsd.toml")]
    config: PathBuf,

    /// Overrides the config's `listen_addr`.
    #[arg(short, long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let config = Config::load(&args.config).unwrap_or_else(|e| {
        tracing::error!(path = %args.config.display(), error = %e, "failed to load config");
        std::process::exit(1);
    });

    let listen_addr = args.listen.clone().unwrap_or_else(|| config.listen_addr.clone());
    let listen_addr = if listen_addr.is_empty() { "0.0.0.0:6464".to_string() } else { listen_addr };

    let server_name = config.server_name.clone();
    let state = Arc::new(AppState::new(ConfigHandle::new(config)));

    let listener = TcpListener::bind(&listen_addr).await?;
    tracing::info!(addr = %listen_addr, name = %server_name, "w64fsd listening");

    w64fsd::handle_forever(listener, state).await
}
