//! Canvas abuse guard CLI.

use anyhow::Result;
use canvas_abuse_guard::{Config, Guard, Origin};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "canvas-abuse-guard")]
#[command(about = "Abuse detection for a shared canvas - IP risk scoring, Tor detection, adaptive rate limits")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "canvas-guard.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: String,

    /// Print example configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Score one address and print the verdict as JSON
    Check {
        /// Address to score
        ip: String,

        /// Include network ownership
        #[arg(long)]
        network: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        println!("{}", Config::example());
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    info!(config = %args.config.display(), "Loading configuration");
    let config = Config::load(&args.config)?;

    if args.validate {
        info!("Configuration is valid");
        return Ok(());
    }

    let guard = Guard::from_config(&config)?;

    match args.command {
        Some(Command::Check { ip, network }) => {
            let origin = Origin::parse(&ip)?;
            if config.tor.enabled {
                if let Err(e) = guard.tor().refresh().await {
                    warn!(error = %e, "Tor exit list unavailable, continuing without it");
                }
            }

            let reputation = guard.get_reputation(&origin, network, true).await;
            let output = serde_json::json!({
                "origin": origin.to_string(),
                "verdict": reputation.verdict,
                "network": reputation.network,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        None => {
            let _tasks = guard.spawn_background();
            info!(stats = ?guard.stats(), "Guard running, press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            info!("Shutting down");
        }
    }

    Ok(())
}
