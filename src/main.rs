// =============================================================================
// Aurora Scanner — Main Entry Point
// =============================================================================
//
// Ingests the exchange's all-market ticker stream and the combined
// aggregate-trade stream, maintains per-symbol rolling analytics, and serves
// them to WebSocket and HTTP clients. A short-horizon disk cache warms the
// analytics on restart.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod binance;
mod bus;
mod cache;
mod config;
mod payload;
mod runner;
mod tracker;
mod types;
mod version;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::binance::rest::RestClient;
use crate::binance::ticker::TickerStream;
use crate::binance::trade::TradeStream;
use crate::cache::GenericCache;
use crate::config::Config;
use crate::runner::Runner;
use crate::tracker::registry::TrackerRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!(build = version::build_number(), "Aurora Scanner starting up");

    let mut config = Config::load("scanner_config.json").unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        Config::default()
    });
    config.apply_env();

    info!(
        port = config.port,
        cache = %config.cache_name,
        ttl_secs = config.cache_ttl_secs,
        "Configured"
    );

    // ── 2. Disk cache ────────────────────────────────────────────────────
    let cache = GenericCache::open(&config.cache_name, config.cache_ttl_secs)?;

    // ── 3. Feeds, registry, runner ───────────────────────────────────────
    let trade_stream = Arc::new(TradeStream::new(
        cache.clone(),
        RestClient::default(),
        config.trade_restore_secs,
    ));
    let ticker_stream = Arc::new(TickerStream::new(cache.clone(), config.ticker_restore_secs));

    let runner = Arc::new(Runner::new(
        Arc::new(TrackerRegistry::new()),
        trade_stream,
        ticker_stream,
    ));
    tokio::spawn(runner.clone().run());

    // ── 4. Shared state & snapshot feeds ─────────────────────────────────
    let state = Arc::new(AppState::new(runner));
    state.spawn_feeds();

    // ── 5. HTTP / WebSocket server ───────────────────────────────────────
    let bind_addr = format!("0.0.0.0:{}", config.port);
    let api_state = state.clone();
    let server_addr = bind_addr.clone();

    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        let listener = match tokio::net::TcpListener::bind(&server_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(addr = %server_addr, error = %e, "Failed to bind server");
                std::process::exit(1);
            }
        };
        info!(addr = %server_addr, "Server listening");
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "Server failed");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping");

    // Commit any pending cache batch before exit.
    cache.flush();

    if let Err(e) = config.save("scanner_config.json") {
        error!(error = %e, "Failed to save config on shutdown");
    }

    info!("Aurora Scanner shut down complete.");
    Ok(())
}
