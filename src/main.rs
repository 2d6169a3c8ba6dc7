use anyhow::Result;
use clap::Parser;
use ggproxy::config::DEFAULT_CONFIG_PATH;
use ggproxy::{Config, ProxyServer, logging};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "A lightweight HTTP and SOCKS5 forwarding proxy", long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse args
    let args = Args::parse();

    // Load configuration, then start logging as configured
    let config = Config::load(&args.config)?;
    // Flushes queued lines when main returns
    let _log_guard = logging::init(&config)?;
    info!("Loaded configuration from {}", args.config.display());

    let mut server = ProxyServer::new(config);
    server.bind().await?;

    tokio::select! {
        result = server.run() => result,
        () = shutdown_signal() => {
            info!("Shutting down");
            Ok(())
        }
    }
}

/// shutdown_signal resolves on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
