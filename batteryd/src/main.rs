use std::{process, sync::Arc};

use anyhow::{Context, Result};
use batteryd::config::{Cli, EffectiveConfig};
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Telemetry goes to stdout, logs to stderr.
    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match EffectiveConfig::from_cli(&cli) {
        Ok(config) => Arc::new(config),
        Err(err) => {
            eprintln!("invalid configuration: {err}");
            process::exit(1);
        },
    };

    if let Some(max_lines) = cli.log_max_lines {
        tracing::debug!(max_lines, "log rotation is owned by the external logger");
    }

    run(cli, config).await
}

#[cfg(target_os = "linux")]
async fn run(cli: Cli, config: Arc<EffectiveConfig>) -> Result<()> {
    use batteryd::{coordinator::Coordinator, telemetry::JsonLineSink};

    let (short, long) = batteryd::hidraw::open_endpoints(&cli.device)
        .with_context(|| format!("could not open {}", cli.device.display()))?;

    let sink = Arc::new(JsonLineSink);
    let coordinator = Coordinator::new(short, long, config, sink);
    coordinator.run().await;

    tokio::signal::ctrl_c()
        .await
        .context("could not listen for ctrl-c")?;
    coordinator.shutdown().await;

    Ok(())
}

#[cfg(not(target_os = "linux"))]
async fn run(_cli: Cli, _config: Arc<EffectiveConfig>) -> Result<()> {
    anyhow::bail!("only Linux hidraw hosts are currently supported")
}
