//! shipyard - Entry Point
//!
//! Deploys containerized services on a single host with health-gated
//! cutover behind Traefik.

use clap::Parser;
use colored::Colorize;
use tracing::{info, warn};

use shipyard::cli::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let code = match cli.run(await_shutdown_signal()).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {}", "error:".red(), e);
            e.exit_code()
        }
    };

    std::process::exit(code);
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                _ => {
                    warn!("Unable to install signal handlers, falling back to Ctrl+C");
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
        }
        info!("Ctrl+C received, shutting down...");
    }
}
