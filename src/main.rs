//! Revtun CLI - expose local services through a gateway and reach remote ones
//!
//! Keeps one control session alive with automatic reconnection.

mod config_file;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config_file::ConfigFile;
use revtun_client::{Service, SessionEnd};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("REVTUN_GIT_HASH"),
    ", built ",
    env!("REVTUN_BUILD_TIME"),
    ")"
);

/// Revtun - reverse tunnel client
#[derive(Parser, Debug)]
#[command(name = "revtun")]
#[command(about = "Revtun - expose local services through a gateway")]
#[command(version = VERSION)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "REVTUN_CONFIG", default_value = "revtun.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Seconds to wait after withdrawing proxies before closing on Ctrl+C
    #[arg(long, default_value = "0")]
    drain_secs: u64,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check the configuration file and exit
    Verify,
}

fn setup_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli.log_level);

    let config = ConfigFile::load(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;

    if let Some(Commands::Verify) = cli.command {
        println!(
            "{}: ok ({} proxies, {} visitors)",
            cli.config.display(),
            config.proxies.len(),
            config.visitors.len()
        );
        return Ok(());
    }

    info!("Revtun {} starting", VERSION);
    info!(
        proxies = config.proxies.len(),
        visitors = config.visitors.len(),
        "Connecting to {}",
        config.common.server_addr
    );

    let proxies = config.proxy_map();
    let visitors = config.visitor_map();
    let service = Arc::new(Service::with_tcp(config.common, proxies, visitors));

    let mut runner = {
        let service = service.clone();
        tokio::spawn(async move { service.run().await })
    };

    let result = tokio::select! {
        result = &mut runner => result.context("Session task panicked")?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
            service
                .graceful_close(Duration::from_secs(cli.drain_secs))
                .await;
            runner.await.context("Session task panicked")?
        }
    };

    match result {
        Ok(SessionEnd::ForcedOffline) => {
            info!("Disconnected by the gateway");
            Ok(())
        }
        Ok(end) => {
            info!("Session ended: {}", end);
            Ok(())
        }
        Err(e) => {
            error!("Revtun stopped: {}", e);
            Err(e.into())
        }
    }
}
