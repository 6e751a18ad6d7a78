use std::error::Error;

use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use simplebank::{
    api::{self, AppState},
    config::{CliArgs, Config},
    storage,
};
use simplebank_core::Ledger;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let cli = CliArgs::parse();
    let config = Config::load(&cli)?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    if config.logging.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let metrics = PrometheusBuilder::new().install_recorder()?;

    let store = storage::open(&config.database)?;
    let state = AppState {
        ledger: Ledger::new(store),
        transfer_timeout: config.transfer_timeout(),
        metrics: Some(metrics),
    };
    let app = api::router(state, config.auth.clone());

    let addr = config.listen_addr()?;
    tracing::info!(%addr, auth = config.auth.enabled, "SimpleBank API listening");

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for shutdown signal");
    }
}
