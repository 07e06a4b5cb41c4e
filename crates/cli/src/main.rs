mod cli;
mod config;
mod error;
mod logging;

use clap::Parser;
use cli::Cli;
use config::Config;
use forward::{SessionManager, SshConnector};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use crate::error::{Error, Result};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init_logging(&cli);

    if let Err(e) = run(cli).await {
        error!("Error: {}", e);
        std::process::exit(1);
    }
}

#[instrument(name = "run", skip(cli), fields(config = %cli.config.display()))]
async fn run(cli: Cli) -> Result<()> {
    info!("ssh-relay v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load(&cli.config)?;
    let plans = config.plans()?;
    let rules: usize = plans.iter().map(|plan| plan.rules.len()).sum();
    info!(clients = plans.len(), rules, "configuration loaded");

    let manager = SessionManager::start(&SshConnector, plans, CancellationToken::new()).await?;
    info!("all forwarders running");

    let outcome = tokio::select! {
        signal = shutdown_signal() => {
            signal.map(|name| info!("received {name}, shutting down"))
        }
        _ = manager.wait() => Err(Error::AllForwardersStopped),
    };

    manager.shutdown().await;
    outcome
}

/// Resolves with the signal name on SIGINT or SIGTERM.
#[cfg(unix)]
async fn shutdown_signal() -> Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    Ok(tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    })
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("Ctrl+C")
}
