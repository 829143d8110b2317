// =============================================================================
// Shared server state
// =============================================================================
//
// Everything the HTTP/WS layer needs, tied together in one value whose
// lifetime matches the process: the runner (and through it the registry),
// the snapshot feeds, the connection tracker, the API proxy, and the
// process-lifetime salt used to hash client addresses.
// =============================================================================

use std::sync::Arc;

use crate::api::proxy::ApiProxy;
use crate::api::ws::{
    build_complete_message, build_monitor_message, SnapshotFeed, WsConnectionTracker,
};
use crate::runner::Runner;

pub struct AppState {
    pub runner: Arc<Runner>,
    pub conn_tracker: Arc<WsConnectionTracker>,
    pub live_feed: Arc<SnapshotFeed>,
    pub monitor_feed: Arc<SnapshotFeed>,
    pub proxy: Arc<ApiProxy>,

    /// Random salt generated once per process; mixed into client address
    /// hashes so the status endpoint never exposes raw IPs.
    pub salt: Vec<u8>,
}

impl AppState {
    pub fn new(runner: Arc<Runner>) -> Self {
        let mut salt = Vec::with_capacity(32);
        salt.extend_from_slice(uuid::Uuid::new_v4().as_bytes());
        salt.extend_from_slice(uuid::Uuid::new_v4().as_bytes());

        Self {
            runner,
            conn_tracker: Arc::new(WsConnectionTracker::new()),
            live_feed: Arc::new(SnapshotFeed::new(build_complete_message)),
            monitor_feed: Arc::new(SnapshotFeed::new(build_monitor_message)),
            proxy: Arc::new(ApiProxy::default()),
            salt,
        }
    }

    /// Spawn the snapshot feed pumps. Called once at startup.
    pub fn spawn_feeds(&self) {
        tokio::spawn(self.live_feed.clone().run(self.runner.clone()));
        tokio::spawn(self.monitor_feed.clone().run(self.runner.clone()));
    }
}
