use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use sandboxd::config::{ProxyConfig, ScalerConfig};
use sandboxd::{proxy, scaler};

#[derive(Parser)]
#[command(name = "sandboxd")]
#[command(about = "Sandbox platform core services")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the runner fleet autoscaler control loop
    Scaler,
    /// Run the sandbox preview proxy
    Proxy,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Scaler => {
            let config = ScalerConfig::from_env().context("invalid scaler configuration")?;
            scaler::run(config).await
        }
        Commands::Proxy => {
            let config = ProxyConfig::from_env().context("invalid proxy configuration")?;
            proxy::run(config).await
        }
    }
}
