// =============================================================================
// HTTP endpoints — Axum 0.7
// =============================================================================
//
// All JSON endpoints live under `/api/1/`; the WebSocket endpoints under
// `/ws/binance/`. CORS is permissive: the scanner serves public market data.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, RawQuery, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use crate::app_state::AppState;
use crate::version;

// =============================================================================
// Router construction
// =============================================================================

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/1/ping", get(ping))
        .route("/api/1/status/websockets", get(websockets_status))
        .route("/api/1/binance/volume", get(volume))
        .route("/api/1/binance/proxy/*path", get(proxy))
        .route("/ws/binance/live", get(crate::api::ws::ws_live))
        .route("/ws/binance/monitor", get(crate::api::ws::ws_monitor))
        .route("/ws/binance/symbol", get(crate::api::ws::ws_symbol))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Ping
// =============================================================================

#[derive(Serialize)]
struct PingResponse {
    version: u64,
    #[serde(rename = "buildNumber")]
    build_number: u64,
}

async fn ping() -> impl IntoResponse {
    Json(PingResponse {
        version: version::build_number(),
        build_number: version::build_number(),
    })
}

// =============================================================================
// WebSocket status
// =============================================================================

#[derive(Serialize)]
struct WsStatusResponse {
    paths: HashMap<String, usize>,
    clients: HashMap<String, Vec<String>>,
}

async fn websockets_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (paths, clients) = state.conn_tracker.status(&state.salt);
    Json(WsStatusResponse { paths, clients })
}

// =============================================================================
// Volume histogram
// =============================================================================

#[derive(Serialize)]
struct VolumeEntry {
    nvh: Vec<f64>,
    bvh: Vec<f64>,
    vh: Vec<f64>,
    vol: f64,
    #[serde(rename = "priceChange1h")]
    price_change_1h: f64,
    nv60: f64,
    v60: f64,
    v24h: Vec<f64>,
    t60pb: f64,
    t60: u64,
}

#[derive(Serialize)]
struct VolumeResponse {
    data: HashMap<String, VolumeEntry>,
}

async fn volume(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let registry = state.runner.registry();
    let mut data = HashMap::new();

    for symbol in registry.symbols() {
        let Some(tracker) = registry.peek(&symbol) else {
            continue;
        };
        let tracker = tracker.lock();
        let Some(last) = tracker.last_tick() else {
            continue;
        };

        let m60 = tracker.metrics.get(&60).cloned().unwrap_or_default();
        let t60pb = if m60.total_trades > 0 {
            m60.buy_trades as f64 / m60.total_trades as f64
        } else {
            0.0
        };

        data.insert(
            symbol.clone(),
            VolumeEntry {
                nvh: tracker.histogram.net_volume.clone(),
                bvh: tracker.histogram.buy_volume.clone(),
                vh: tracker.histogram.volume.clone(),
                vol: last.total_quote_volume,
                price_change_1h: m60.price_change_percent,
                nv60: m60.net_volume,
                v60: m60.total_volume,
                v24h: tracker.histogram.volume24.clone(),
                t60pb,
                t60: m60.total_trades,
            },
        );
    }

    Json(VolumeResponse { data })
}

// =============================================================================
// Upstream proxy
// =============================================================================

async fn proxy(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    RawQuery(query): RawQuery,
) -> impl IntoResponse {
    state.proxy.handle(&path, query.as_deref()).await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
