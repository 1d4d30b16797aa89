use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use flare_diceware::{Diceware, Wordlist};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal;
use tracing::info;

use flare_server::config::{Cli, ServerConfig};
use flare_server::registry::SessionRegistry;
use flare_server::telemetry::Telemetry;
use flare_server::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;

    let config = ServerConfig::try_from(Cli::parse())?;
    info!(
        listen_addr = %config.listen_addr,
        wordlist = %config.wordlist.display(),
        passphrase_words = config.passphrase_words,
        offer_ttl_secs = config.offer_ttl.map(|ttl| ttl.as_secs()),
        "starting flare server"
    );

    run(config, telemetry.metrics_handle()).await
}

async fn run(config: ServerConfig, metrics: PrometheusHandle) -> Result<()> {
    let wordlist = Wordlist::from_path(&config.wordlist)
        .with_context(|| format!("failed to load word list {}", config.wordlist.display()))?;
    let diceware = Diceware::new(wordlist, config.passphrase_words)
        .context("invalid passphrase configuration")?;
    info!(words = diceware.wordlist().len(), "diceware word list loaded");

    let registry = SessionRegistry::new(Arc::new(diceware));
    let reaper = config
        .offer_ttl
        .map(|ttl| registry.spawn_reaper(ttl, config.reap_interval));

    let app = flare_server::app(AppState::new(registry).with_metrics(metrics));

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("flare listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;

    if let Some(reaper) = reaper {
        reaper.abort();
    }
    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; waiting out grace period"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    info!("shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install ctrl+c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
