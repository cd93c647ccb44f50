// =============================================================================
// Tick Relay — Main Entry Point
// =============================================================================
//
// Subscribes to one instrument's live ticks, keeps the most recent window,
// derives candles, and mirrors both into the configured store. A small status
// API runs alongside for the dashboard page.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod error;
mod market_data;
mod publisher;
mod runtime_config;
mod store;
mod types;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::IngestionService;
use crate::runtime_config::RuntimeConfig;
use crate::store::{FirebaseStore, MemoryStore, StoreAdapter};

const CONFIG_PATH: &str = "tick_relay.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Tick Relay starting up");

    let mut config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });
    config.apply_env(|key| std::env::var(key).ok());

    info!(
        symbol = %config.symbol,
        max_ticks = config.max_ticks,
        intervals = ?config.candle_intervals.iter().map(|iv| iv.interval_secs).collect::<Vec<_>>(),
        "Configured instrument"
    );

    // ── 2. Store adapter ─────────────────────────────────────────────────
    let store: Arc<dyn StoreAdapter> = if config.store_url.trim().is_empty() {
        warn!("No store URL configured, publishing to in-memory store only");
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(FirebaseStore::new(
            config.store_url.clone(),
            config.symbol.clone(),
            config.store_auth_token.clone(),
            Duration::from_secs(config.store_timeout_secs),
        )?)
    };

    // ── 3. Shared service ────────────────────────────────────────────────
    let bind_addr = config.bind_addr.clone();
    let service = Arc::new(IngestionService::new(config, store)?);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── 4. Feed supervisor ───────────────────────────────────────────────
    let mut feed = tokio::spawn(market_data::tick_stream::run_feed_supervisor(
        service.clone(),
        shutdown_rx.clone(),
    ));

    // ── 5. Status API ────────────────────────────────────────────────────
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind status API on {bind_addr}"))?;
    info!(addr = %bind_addr, "Status API listening");

    let app = api::rest::router(service.clone());
    let mut api_shutdown = shutdown_rx;
    let api = tokio::spawn(async move {
        let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = api_shutdown.changed().await;
        });
        if let Err(e) = serve.await {
            error!(error = %e, "Status API failed");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 6. Shutdown ──────────────────────────────────────────────────────
    let finished_early = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for shutdown signal")?;
            warn!("Shutdown signal received, stopping gracefully");
            None
        }
        joined = &mut feed => Some(joined),
    };

    let _ = shutdown_tx.send(true);
    let feed_result = match finished_early {
        Some(joined) => joined,
        None => feed.await,
    };
    let _ = api.await;

    feed_result.context("feed task panicked")??;
    info!("Tick Relay shut down complete.");
    Ok(())
}
