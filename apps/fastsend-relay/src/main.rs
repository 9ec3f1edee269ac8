use anyhow::Result;
use clap::Parser;
use tracing::info;

use fastsend_relay::cli::{Cli, Command};
use fastsend_relay::config::ServerConfig;
use fastsend_relay::probe::run_probe;
use fastsend_relay::server;
use fastsend_relay::telemetry::{init_tracing, Telemetry};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Probe { url, role }) = cli.command {
        init_tracing()?;
        return run_probe(url, role).await;
    }

    let telemetry = Telemetry::init()?;
    let config = ServerConfig::try_from(cli.serve)?;
    info!(
        listen_addr = %config.listen_addr,
        count_file = %config.count_file.display(),
        sweep_ms = config.sweep_interval.as_millis() as u64,
        "starting fastsend-relay"
    );

    server::run(config, Some(telemetry.metrics_handle())).await
}
