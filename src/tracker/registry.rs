// =============================================================================
// Tracker registry — process-wide symbol → tracker map
// =============================================================================
//
// Trackers are created lazily on first reference and live for the process
// lifetime; the map never shrinks. Each tracker is wrapped in its own mutex
// so the runner's worker pool can update different symbols in parallel while
// snapshot builders read concurrently.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::warn;

use super::TickerTracker;

pub type SharedTracker = Arc<Mutex<TickerTracker>>;

#[derive(Default)]
pub struct TrackerRegistry {
    trackers: RwLock<HashMap<String, SharedTracker>>,
}

impl TrackerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the tracker for `symbol`, creating it on first reference.
    /// An empty symbol is rejected.
    pub fn get(&self, symbol: &str) -> Option<SharedTracker> {
        if symbol.is_empty() {
            warn!("tracker requested for empty symbol");
            return None;
        }

        if let Some(tracker) = self.trackers.read().get(symbol) {
            return Some(tracker.clone());
        }

        let mut trackers = self.trackers.write();
        // Double-check: another writer may have created it meanwhile.
        Some(
            trackers
                .entry(symbol.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(TickerTracker::new(symbol))))
                .clone(),
        )
    }

    /// Tracker for `symbol` if one already exists; never creates.
    pub fn peek(&self, symbol: &str) -> Option<SharedTracker> {
        self.trackers.read().get(symbol).cloned()
    }

    pub fn symbols(&self) -> Vec<String> {
        self.trackers.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.trackers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.trackers.read().is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lazily_creates_and_reuses_trackers() {
        let registry = TrackerRegistry::new();
        assert!(registry.is_empty());

        let a = registry.get("BTCUSDT").unwrap();
        let b = registry.get("BTCUSDT").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);

        registry.get("ETHUSDT").unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn empty_symbol_is_rejected() {
        let registry = TrackerRegistry::new();
        assert!(registry.get("").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn peek_never_creates() {
        let registry = TrackerRegistry::new();
        assert!(registry.peek("BTCUSDT").is_none());
        registry.get("BTCUSDT").unwrap();
        assert!(registry.peek("BTCUSDT").is_some());
    }
}
