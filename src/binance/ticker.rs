// =============================================================================
// Ticker dispatcher — all-market 24h ticker stream
// =============================================================================
//
// Owns the upstream client task for the `!ticker@arr` stream: connect, read,
// decode, append the raw frame to the disk cache, publish the decoded batch
// to subscribers. Subscriber channels hold a single batch; overflow goes to
// the per-subscriber backlog queue.
// =============================================================================

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::bus::FanoutBus;
use crate::cache::GenericCache;
use crate::types::{decode_ticker_frame, TickerSummary};

use super::stream::StreamClient;

pub type TickerBatch = Arc<Vec<TickerSummary>>;

pub struct TickerStream {
    bus: FanoutBus<TickerBatch>,
    cache: Arc<GenericCache>,
    /// How far back `load_cache` reaches, in seconds.
    restore_secs: i64,
}

impl TickerStream {
    pub fn new(cache: Arc<GenericCache>, restore_secs: i64) -> Self {
        Self {
            bus: FanoutBus::new("binance.ticker", 1),
            cache,
            restore_secs,
        }
    }

    pub fn subscribe(&self) -> (u64, mpsc::Receiver<TickerBatch>) {
        self.bus.subscribe()
    }

    pub fn unsubscribe(&self, id: u64) {
        self.bus.unsubscribe(id);
    }

    /// Run the upstream read loop forever: connect, read until error,
    /// reconnect after one second.
    pub async fn run(self: Arc<Self>) {
        loop {
            let mut client = StreamClient::new("binance.ticker", vec!["!ticker@arr".to_string()]);
            info!("connecting to ticker stream");
            client.connect().await;

            loop {
                let body = match client.next().await {
                    Ok(body) => body,
                    Err(e) => {
                        error!(error = %e, "ticker stream read error");
                        break;
                    }
                };

                let tickers = match decode_ticker_frame(&body) {
                    Ok(tickers) => tickers,
                    Err(e) => {
                        warn!(error = %e, "failed to decode ticker frame");
                        continue;
                    }
                };

                self.cache
                    .add_item(chrono::Utc::now().timestamp(), "ticker", &body);
                self.bus.publish(Arc::new(tickers));
            }

            tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
        }
    }

    /// Decode cached ticker frames from the restore window, oldest first.
    /// Frames that fail to decode, or decode to zero entries, are skipped.
    pub fn load_cache(&self) -> Vec<Vec<TickerSummary>> {
        let rows = match self.cache.query_age_less_than("ticker", self.restore_secs) {
            Ok(rows) => rows,
            Err(e) => {
                error!(error = %e, "failed to query ticker cache");
                return Vec::new();
            }
        };

        let mut batches = Vec::new();
        for row in rows {
            match decode_ticker_frame(&row) {
                Ok(tickers) if tickers.is_empty() => {
                    warn!("cached ticker frame contains 0 items");
                }
                Ok(tickers) => batches.push(tickers),
                Err(e) => {
                    error!(error = %e, "failed to decode cached ticker frame");
                }
            }
        }
        batches
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::GenericCache;

    fn temp_stream() -> (tempfile::TempDir, TickerStream) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ticker-test.sqlite");
        let cache = Arc::new(
            GenericCache::open_path("ticker-test", path.to_str().unwrap(), 7200).unwrap(),
        );
        let stream = TickerStream::new(cache, 3600);
        (dir, stream)
    }

    #[test]
    fn load_cache_decodes_and_skips_bad_rows() {
        let (_dir, stream) = temp_stream();
        let now = chrono::Utc::now().timestamp();

        let good = r#"[{ "E": 1, "s": "BTCUSDT", "c": "100", "b": "99", "a": "101",
                         "h": "110", "l": "90", "q": "5000", "P": "1.0" }]"#;
        stream.cache.add_item(now - 30, "ticker", good.as_bytes());
        stream.cache.add_item(now - 20, "ticker", b"broken frame");
        stream.cache.add_item(now - 10, "ticker", b"[]");
        stream.cache.flush();

        let batches = stream.load_cache();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0][0].symbol, "BTCUSDT");
    }

    #[test]
    fn load_cache_respects_restore_window() {
        let (_dir, stream) = temp_stream();
        let now = chrono::Utc::now().timestamp();

        let frame = r#"[{ "E": 1, "s": "OLDUSDT", "c": "1", "b": "1", "a": "1",
                          "h": "1", "l": "1", "q": "1", "P": "0" }]"#;
        stream.cache.add_item(now - 4000, "ticker", frame.as_bytes());
        stream.cache.flush();

        assert!(stream.load_cache().is_empty());
    }
}
