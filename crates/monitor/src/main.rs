//! `chain-notify` binary: one pipeline per invocation.

use std::io;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use chain_notify_domain::services::telemetry::{init_telemetry, TelemetryConfig};
use chain_notify_domain::summary::ConfigSummary;
use chain_notify_domain::{LedgerOverrides, MonitorConfig, PendingConfig, TransferConfig};
use chain_notify_monitor::{run_monitor, run_pending, run_transfer, PipelineError};

/// Publishes ledger transfers to an MQTT broker.
#[derive(Parser, Debug)]
#[command(name = "chain-notify")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Ledger JSON-RPC endpoint (overrides NOTIFY_RPC_URL)
    #[arg(long, global = true)]
    rpc_url: Option<String>,

    /// Confirmation delay in blocks (overrides NOTIFY_DELAY_BLOCK)
    #[arg(long, global = true)]
    delay: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Decode raw signed transactions and announce them before they are mined
    Pending,
    /// Re-announce pending transactions once they are confirmed
    Transfer,
    /// Announce every transaction of each confirmed block
    Monitor,
}

#[tokio::main]
async fn main() -> io::Result<()> {
    let cli = Cli::parse();
    if let Err(err) = bootstrap(cli).await {
        eprintln!("[chain-notify] bootstrap failed: {err}");
        return Err(io::Error::other(err.to_string()));
    }

    Ok(())
}

async fn bootstrap(cli: Cli) -> Result<(), PipelineError> {
    let telemetry_config = TelemetryConfig::from_env("NOTIFY");
    init_telemetry(&telemetry_config)?;
    let overrides = LedgerOverrides {
        rpc_url: cli.rpc_url,
        delay: cli.delay,
    };

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    match cli.command {
        Command::Pending => {
            let config = PendingConfig::load_from_env()?;
            log_summary(&config.summary());
            run_pending(&config, cancel).await
        }
        Command::Transfer => {
            let config = TransferConfig::load_from_env(&overrides)?;
            log_summary(&config.summary());
            run_transfer(&config, cancel).await
        }
        Command::Monitor => {
            let config = MonitorConfig::load_from_env(&overrides)?;
            log_summary(&config.summary());
            run_monitor(&config, cancel).await
        }
    }
}

fn log_summary(summary: &ConfigSummary) {
    match summary.to_pretty_json() {
        Ok(json) => info!("starting with configuration\n{json}"),
        Err(err) => warn!(%err, "failed to render configuration summary"),
    }
}

async fn cancel_on_signal(cancel: CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => return,
        received = shutdown_signal() => {
            if let Err(err) = received {
                warn!(%err, "signal handler failed, shutting down");
            }
        }
    }
    info!("shutdown requested");
    cancel.cancel();
}

#[cfg(unix)]
async fn shutdown_signal() -> io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        received = tokio::signal::ctrl_c() => received,
        _ = sigterm.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> io::Result<()> {
    tokio::signal::ctrl_c().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_flags_follow_subcommand() {
        let cli = Cli::try_parse_from(["chain-notify", "monitor", "--rpc-url", "http://node:8545", "--delay", "3"])
            .expect("parses");
        assert_eq!(cli.command, Command::Monitor);
        assert_eq!(cli.rpc_url.as_deref(), Some("http://node:8545"));
        assert_eq!(cli.delay, Some(3));
    }

    #[test]
    fn subcommand_is_required() {
        assert!(Cli::try_parse_from(["chain-notify"]).is_err());
    }
}
