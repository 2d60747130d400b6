//! Standalone session server with a logging game sink.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use blocknet::config::NetworkConfig;
use blocknet::core::schema::PacketRegistry;
use blocknet::server::{LoggingSink, Server};
use blocknet::utils::logging::init_logging;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// TOML configuration file; environment overrides apply on top
    #[clap(short, long)]
    config: Option<PathBuf>,
    /// Address to bind, overriding the configuration
    #[clap(short, long)]
    address: Option<String>,
    /// Emit logs as JSON
    #[clap(long)]
    json: bool,
    /// Print an example configuration and exit
    #[clap(long)]
    example_config: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.example_config {
        println!("{}", NetworkConfig::example_config());
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => {
            let mut config = NetworkConfig::from_file(path)?;
            config.apply_env_overrides();
            config
        }
        None => NetworkConfig::from_env()?,
    };
    if let Some(address) = args.address {
        config.server.address = address;
    }
    if args.json {
        config.logging.json_format = true;
    }
    config.validate_strict()?;
    init_logging(&config.logging)?;

    let server = Arc::new(Server::bind(config, PacketRegistry::new(), Arc::new(LoggingSink)).await?);
    info!(address = %server.local_addr()?, "blocknet server listening");

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        if let Ok(()) = tokio::signal::ctrl_c().await {
            info!("Received CTRL+C signal, shutting down");
            shutdown.cancel();
        }
    });

    if let Err(e) = server.run().await {
        error!(error = %e, "Server stopped with error");
        return Err(e.into());
    }
    Ok(())
}
