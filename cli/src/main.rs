//! `tunnel` — the outer shell over `tunnel-core`. Parses arguments,
//! loads the TOML config for the requested role, initializes logging,
//! and hands off to `tunnel_core::run_client`/`run_server`.

use clap::{Parser, Subcommand};
use tracing::error;

#[derive(Parser)]
#[command(name = "tunnel", version, about = "Multiplexed SOCKS5-over-WebSocket tunnel")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the local SOCKS5 endpoint and dial out to a tunnel server.
    Client {
        /// Path to a client TOML config file.
        config: String,
    },
    /// Run the tunnel server: upgrades authenticated connections,
    /// masquerades everything else.
    Server {
        /// Path to a server TOML config file.
        config: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "tunnel=info".into()),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Command::Client { config } => {
            let config = tunnel_core::config::load_client(&config)?;
            tunnel_core::run_client(config).await
        }
        Command::Server { config } => {
            let config = tunnel_core::config::load_server(&config)?;
            tunnel_core::run_server(config).await
        }
    };

    if let Err(e) = result {
        error!(error = %e, "tunnel exited with an error");
        std::process::exit(1);
    }
    Ok(())
}
