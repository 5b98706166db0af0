//! Contribution payments service entry point.
//!
//! Serves payment initiation, status checks and the provider callback
//! endpoints over Axum, backed by SQLite. Providers without credentials are
//! simulated and settle on a timer.

use std::sync::Arc;

use payments::api;
use payments::config::Config;
use payments::context::AppContext;
use payments::db::{self, SqliteContributionStore};
use payments::providers::{ProviderRegistry, SettlementScheduler};
use payments::store::SharedStore;
use reqwest::Client;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;

    // Set up the SQLite connection pool and run migrations.
    let pool = db::init_pool(&config.database_url).await?;
    let store: SharedStore = Arc::new(SqliteContributionStore::new(pool));

    // Shared by every provider adapter; carries the outbound deadline.
    let client = Client::builder()
        .timeout(config.provider_timeout())
        .build()?;

    // ─── Providers ────────────────────────────────────────
    let settlements = SettlementScheduler::new(store.clone(), config.simulated_settle_delay());
    let providers = ProviderRegistry::from_config(&config, client, settlements.clone());

    // ─── REST API ─────────────────────────────────────────
    let ctx = Arc::new(AppContext::new(
        store,
        providers,
        settlements.clone(),
        config.phone_country_code.clone(),
    ));
    let app = api::router(ctx.clone());

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");
    info!("Provider callbacks expected under {}", config.callback_base_url);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Initiations may still schedule settlements, so they drain first.
    ctx.drain_initiations().await;
    settlements.shutdown().await;
    info!("Shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
