use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal;
use tracing::{info, warn};

use beach_rendezvous::{
    cli::{self, Cli, Commands},
    config::RelayConfig,
    state::RelayState,
    telemetry::Telemetry,
};

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;
    let cli = Cli::parse();

    if let Some(Commands::Probe(args)) = cli.command {
        return cli::run_probe(args).await;
    }

    let config = RelayConfig::try_from(cli.serve)?;
    info!(
        listen_addr = %config.listen_addr,
        ws_path = %config.ws_path,
        max_message_bytes = config.max_message_bytes,
        "starting beach-rendezvous relay"
    );

    run(config, telemetry.metrics_handle()).await
}

async fn run(config: RelayConfig, metrics: PrometheusHandle) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    let grace = config.shutdown_grace;
    let state = RelayState::new(config, metrics);

    info!(
        "beach-rendezvous listening on {}",
        listener.local_addr().context("listener has no local address")?
    );

    let signal_state = state.clone();
    beach_rendezvous::serve(listener, state.clone(), async move {
        let _ = signal::ctrl_c().await;
        signal_state.begin_shutdown();
    })
    .await?;

    info!(
        grace_seconds = grace.as_secs(),
        open_connections = state.active_connections(),
        "shutdown signal received; waiting for connections to close"
    );
    if state.wait_for_drain(grace).await {
        info!("shutdown complete");
    } else {
        warn!(
            open_connections = state.active_connections(),
            "grace period elapsed with connections still open"
        );
    }

    Ok(())
}
