// =============================================================================
// WebSocket boundary — snapshot and per-symbol push clients
// =============================================================================
//
// Three endpoints share one connection shape:
//   /ws/binance/live     — full snapshot frames, throttled by ?updateInterval
//   /ws/binance/monitor  — reduced snapshot frames, same throttle
//   /ws/binance/symbol   — complete entries for one symbol on every recompute
//
// The client's receive side is used purely as a liveness probe: any read
// error or close frame tears the connection down. Writes carry a six second
// deadline; exceeding it is fatal for the connection.
//
// Snapshot frames are serialized once per publish cycle and shared by
// reference between every subscriber.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::payload::{CompleteEntry, MonitorEntry};
use crate::runner::Runner;
use crate::tracker::registry::TrackerRegistry;

/// Outbound writes must complete within this deadline.
const WRITE_DEADLINE: Duration = Duration::from_secs(6);

// =============================================================================
// Connection tracker
// =============================================================================

/// Global view of connected WebSocket clients, keyed both ways: which clients
/// sit on a path, and which paths a client holds.
#[derive(Default)]
pub struct WsConnectionTracker {
    paths: RwLock<HashMap<String, HashSet<u64>>>,
    clients: RwLock<HashMap<u64, ClientInfo>>,
    next_id: AtomicU64,
}

struct ClientInfo {
    remote_host: String,
    paths: HashSet<String>,
}

impl WsConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, path: &str, remote_host: &str) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.paths
            .write()
            .entry(path.to_string())
            .or_default()
            .insert(id);
        self.clients.write().insert(
            id,
            ClientInfo {
                remote_host: remote_host.to_string(),
                paths: HashSet::from([path.to_string()]),
            },
        );
        id
    }

    pub fn del(&self, path: &str, id: u64) {
        if let Some(set) = self.paths.write().get_mut(path) {
            set.remove(&id);
        }
        self.clients.write().remove(&id);
    }

    /// Build the status payload. Remote hosts are hashed with the process
    /// salt so client addresses are never exposed.
    pub fn status(&self, salt: &[u8]) -> (HashMap<String, usize>, HashMap<String, Vec<String>>) {
        let mut paths = HashMap::new();
        for (path, set) in self.paths.read().iter() {
            if !set.is_empty() {
                paths.insert(path.clone(), set.len());
            }
        }

        let mut clients: HashMap<String, Vec<String>> = HashMap::new();
        for info in self.clients.read().values() {
            let mut hasher = Sha256::new();
            hasher.update(info.remote_host.as_bytes());
            hasher.update(salt);
            let digest = hex::encode(hasher.finalize());
            let key = digest[..8].to_string();
            for path in &info.paths {
                clients.entry(key.clone()).or_default().push(path.clone());
            }
        }

        (paths, clients)
    }
}

// =============================================================================
// Snapshot feed — one prepared frame per publish cycle, fan-out by reference
// =============================================================================

pub type SnapshotBuilder = fn(&TrackerRegistry) -> String;

pub struct SnapshotFeed {
    subscribers: Mutex<HashMap<u64, mpsc::Sender<Arc<String>>>>,
    next_id: AtomicU64,
    builder: SnapshotBuilder,
}

impl SnapshotFeed {
    pub fn new(builder: SnapshotBuilder) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            builder,
        }
    }

    /// Subscribe with a single-frame buffer; a new frame is dropped when the
    /// previous one has not been consumed yet.
    pub fn subscribe(&self) -> (u64, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(1);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().insert(id, tx);
        (id, rx)
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().remove(&id);
    }

    /// Consume the runner's snapshot signal forever, building and fanning
    /// out one prepared frame per cycle.
    pub async fn run(self: Arc<Self>, runner: Arc<Runner>) {
        let (_sub, mut signals) = runner.subscribe();
        while signals.recv().await.is_some() {
            if self.subscribers.lock().is_empty() {
                continue;
            }
            let frame = Arc::new((self.builder)(runner.registry()));
            self.fanout(frame);
        }
    }

    fn fanout(&self, frame: Arc<String>) {
        for tx in self.subscribers.lock().values() {
            let _ = tx.try_send(frame.clone());
        }
    }
}

// =============================================================================
// Snapshot frame builders
// =============================================================================

#[derive(serde::Serialize)]
struct TickerFrame<T: serde::Serialize> {
    tickers: Vec<T>,
}

pub fn build_complete_message(registry: &TrackerRegistry) -> String {
    let tickers: Vec<CompleteEntry> = registry
        .symbols()
        .iter()
        .filter_map(|symbol| registry.peek(symbol))
        .filter_map(|tracker| CompleteEntry::from_tracker(&tracker.lock()))
        .collect();
    serde_json::to_string(&TickerFrame { tickers })
        .unwrap_or_else(|_| r#"{"tickers":[]}"#.to_string())
}

pub fn build_monitor_message(registry: &TrackerRegistry) -> String {
    let tickers: Vec<MonitorEntry> = registry
        .symbols()
        .iter()
        .filter_map(|symbol| registry.peek(symbol))
        .filter_map(|tracker| MonitorEntry::from_tracker(&tracker.lock()))
        .collect();
    serde_json::to_string(&TickerFrame { tickers })
        .unwrap_or_else(|_| r#"{"tickers":[]}"#.to_string())
}

// =============================================================================
// Handlers
// =============================================================================

#[derive(Deserialize)]
pub struct WsQuery {
    symbol: Option<String>,
    #[serde(rename = "updateInterval")]
    update_interval: Option<u64>,
}

/// Best-effort client address: proxy headers first, since the scanner is
/// expected to sit behind a reverse proxy.
fn remote_host(headers: &HeaderMap) -> String {
    for header in ["x-forwarded-for", "x-real-ip"] {
        if let Some(value) = headers.get(header).and_then(|v| v.to_str().ok()) {
            if !value.is_empty() {
                return value.split(',').next().unwrap_or(value).trim().to_string();
            }
        }
    }
    "unknown".to_string()
}

pub async fn ws_live(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let remote = remote_host(&headers);
    let feed = state.live_feed.clone();
    ws.on_upgrade(move |socket| {
        run_snapshot_client(socket, state, feed, "/ws/binance/live", remote, query)
    })
}

pub async fn ws_monitor(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let remote = remote_host(&headers);
    let feed = state.monitor_feed.clone();
    ws.on_upgrade(move |socket| {
        run_snapshot_client(socket, state, feed, "/ws/binance/monitor", remote, query)
    })
}

pub async fn ws_symbol(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> axum::response::Response {
    let Some(symbol) = query.symbol.clone().filter(|s| !s.is_empty()) else {
        return (
            axum::http::StatusCode::BAD_REQUEST,
            "missing symbol parameter",
        )
            .into_response();
    };
    let remote = remote_host(&headers);
    ws.on_upgrade(move |socket| run_symbol_client(socket, state, symbol, remote))
        .into_response()
}

// =============================================================================
// Connection loops
// =============================================================================

async fn run_snapshot_client(
    socket: WebSocket,
    state: Arc<AppState>,
    feed: Arc<SnapshotFeed>,
    path: &'static str,
    remote: String,
    query: WsQuery,
) {
    info!(path, remote = %remote, "websocket connected");
    let client_id = state.conn_tracker.add(path, &remote);
    let (feed_id, mut frames) = feed.subscribe();

    let update_interval = Duration::from_secs(query.update_interval.unwrap_or(0));
    let mut last_write: Option<Instant> = None;

    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            frame = frames.recv() => {
                let Some(frame) = frame else { break };
                if let Some(at) = last_write {
                    if at.elapsed() < update_interval {
                        continue;
                    }
                }
                match tokio::time::timeout(
                    WRITE_DEADLINE,
                    sender.send(Message::Text((*frame).clone())),
                )
                .await
                {
                    Ok(Ok(())) => {
                        last_write = Some(Instant::now());
                    }
                    Ok(Err(e)) => {
                        debug!(path, error = %e, "websocket write error");
                        break;
                    }
                    Err(_) => {
                        warn!(path, "websocket write deadline exceeded");
                        break;
                    }
                }
            }

            // Liveness probe: discard inbound messages until an error.
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(path, error = %e, "websocket read error");
                        break;
                    }
                }
            }
        }
    }

    feed.unsubscribe(feed_id);
    state.conn_tracker.del(path, client_id);
    info!(path, remote = %remote, "websocket closed");
}

async fn run_symbol_client(
    socket: WebSocket,
    state: Arc<AppState>,
    symbol: String,
    remote: String,
) {
    let path = "/ws/binance/symbol";
    info!(path, symbol = %symbol, remote = %remote, "websocket connected");
    let client_id = state.conn_tracker.add(path, &remote);
    let (sub_id, mut entries) = state.runner.subscribe_symbol(&symbol);

    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            entry = entries.recv() => {
                let Some(entry) = entry else { break };
                let text = match serde_json::to_string(&*entry) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(symbol = %symbol, error = %e, "failed to marshal entry");
                        continue;
                    }
                };
                match tokio::time::timeout(WRITE_DEADLINE, sender.send(Message::Text(text))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!(symbol = %symbol, error = %e, "websocket write error");
                        break;
                    }
                    Err(_) => {
                        warn!(symbol = %symbol, "websocket write deadline exceeded");
                        break;
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(symbol = %symbol, error = %e, "websocket read error");
                        break;
                    }
                }
            }
        }
    }

    state.runner.unsubscribe_symbol(&symbol, sub_id);
    state.conn_tracker.del(path, client_id);
    info!(path, symbol = %symbol, "websocket closed");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TickerSummary;

    #[test]
    fn connection_tracker_counts_by_path() {
        let tracker = WsConnectionTracker::new();
        let a = tracker.add("/ws/binance/live", "10.0.0.1");
        let _b = tracker.add("/ws/binance/live", "10.0.0.2");
        let _c = tracker.add("/ws/binance/monitor", "10.0.0.1");

        let (paths, clients) = tracker.status(b"salt");
        assert_eq!(paths["/ws/binance/live"], 2);
        assert_eq!(paths["/ws/binance/monitor"], 1);
        assert_eq!(clients.len(), 3);

        tracker.del("/ws/binance/live", a);
        let (paths, _clients) = tracker.status(b"salt");
        assert_eq!(paths["/ws/binance/live"], 1);
    }

    #[test]
    fn status_hashes_remote_hosts() {
        let tracker = WsConnectionTracker::new();
        tracker.add("/ws/binance/live", "192.168.1.50");

        let (_paths, clients) = tracker.status(b"salt");
        let key = clients.keys().next().unwrap().clone();
        assert_eq!(key.len(), 8);
        assert!(!key.contains("192"));

        // A different salt yields a different hash.
        let (_paths, clients2) = tracker.status(b"other-salt");
        assert_ne!(Some(&key), clients2.keys().next());
    }

    #[test]
    fn snapshot_builders_emit_ticker_frames() {
        let registry = TrackerRegistry::new();
        let tracker = registry.get("BTCUSDT").unwrap();
        tracker.lock().update(TickerSummary {
            symbol: "BTCUSDT".into(),
            event_time: 1_700_000_000_000,
            current_day_close: 100.0,
            bid: 99.0,
            ask: 101.0,
            high_price: 110.0,
            low_price: 90.0,
            total_quote_volume: 1000.0,
            price_change_percent: 0.0,
        });

        let complete: serde_json::Value =
            serde_json::from_str(&build_complete_message(&registry)).unwrap();
        assert_eq!(complete["tickers"][0]["symbol"], "BTCUSDT");
        assert!(complete["tickers"][0].get("l_1").is_some());

        let monitor: serde_json::Value =
            serde_json::from_str(&build_monitor_message(&registry)).unwrap();
        assert_eq!(monitor["tickers"][0]["symbol"], "BTCUSDT");
        assert!(monitor["tickers"][0].get("l_1").is_none());
    }

    #[tokio::test]
    async fn snapshot_feed_drops_frames_for_slow_subscribers() {
        let feed = SnapshotFeed::new(build_monitor_message);
        let (_id, mut rx) = feed.subscribe();

        // Fan three frames at a subscriber that never drains: only the first
        // is buffered, the rest are dropped, and nothing blocks.
        for i in 0..3 {
            feed.fanout(Arc::new(format!("frame-{i}")));
        }

        assert_eq!(rx.try_recv().unwrap().as_str(), "frame-0");
        assert!(rx.try_recv().is_err());
    }
}
