// =============================================================================
// Trade dispatcher — combined per-symbol aggregate-trade stream
// =============================================================================
//
// The symbol list comes from the REST price-ticker endpoint and is refreshed
// on every reconnect. Raw frames are cached under the trade's own event time
// so warm-up replay preserves event order. Subscriber channels are buffered
// by 1024 before overflowing into the backlog queue.
// =============================================================================

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::bus::FanoutBus;
use crate::cache::GenericCache;
use crate::types::{decode_trade_frame, AggTrade};

use super::rest::RestClient;
use super::stream::StreamClient;

pub struct TradeStream {
    bus: FanoutBus<AggTrade>,
    cache: Arc<GenericCache>,
    rest: RestClient,
    /// How far back `restore_cache` reaches, in seconds.
    restore_secs: i64,
}

impl TradeStream {
    pub fn new(cache: Arc<GenericCache>, rest: RestClient, restore_secs: i64) -> Self {
        Self {
            bus: FanoutBus::new("binance.trade", 1024),
            cache,
            rest,
            restore_secs,
        }
    }

    pub fn subscribe(&self) -> (u64, mpsc::Receiver<AggTrade>) {
        self.bus.subscribe()
    }

    pub fn unsubscribe(&self, id: u64) {
        self.bus.unsubscribe(id);
    }

    /// Run the upstream read loop forever. Each pass re-fetches the symbol
    /// list, connects the combined stream, then reads until error.
    pub async fn run(self: Arc<Self>) {
        loop {
            // Symbol list must be non-empty before a connection is attempted.
            let symbols = loop {
                match self.rest.price_ticker_symbols().await {
                    Ok(symbols) if symbols.is_empty() => {
                        warn!("got 0 trade streams, trying again");
                    }
                    Ok(symbols) => {
                        info!(count = symbols.len(), "got trade streams");
                        break symbols;
                    }
                    Err(e) => {
                        info!(error = %e, "failed to get trade streams");
                    }
                }
                tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
            };

            let streams: Vec<String> = symbols
                .iter()
                .map(|symbol| format!("{symbol}@aggTrade"))
                .collect();

            let mut client = StreamClient::new("binance.trade", streams);
            info!("connecting to trade stream");
            client.connect().await;

            loop {
                let body = match client.next().await {
                    Ok(body) => body,
                    Err(e) => {
                        error!(error = %e, "trade stream read error");
                        break;
                    }
                };

                let trade = match decode_trade_frame(&body) {
                    Ok(trade) => trade,
                    Err(e) => {
                        warn!(error = %e, "failed to decode trade frame");
                        continue;
                    }
                };

                self.cache
                    .add_item(trade.timestamp_ms() / 1000, "trade", &body);
                self.bus.publish(trade);
            }

            tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
        }
    }

    /// Stream cached trades from the restore window through `cb`, oldest
    /// first. Callback-driven because the window can hold millions of rows.
    pub fn restore_cache(&self, mut cb: impl FnMut(AggTrade)) {
        let rows = match self.cache.query_age_less_than("trade", self.restore_secs) {
            Ok(rows) => rows,
            Err(e) => {
                error!(error = %e, "failed to restore trades from cache");
                return;
            }
        };

        for row in rows {
            match decode_trade_frame(&row) {
                Ok(trade) => cb(trade),
                Err(e) => {
                    error!(error = %e, "failed to decode cached trade");
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::GenericCache;

    fn temp_stream() -> (tempfile::TempDir, TradeStream) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("trade-test.sqlite");
        let cache = Arc::new(
            GenericCache::open_path("trade-test", path.to_str().unwrap(), 7200).unwrap(),
        );
        let stream = TradeStream::new(cache, RestClient::default(), 7200);
        (dir, stream)
    }

    fn trade_frame(symbol: &str, trade_time_ms: i64, price: &str) -> String {
        format!(
            r#"{{ "stream": "{}@aggTrade",
                  "data": {{ "e": "aggTrade", "E": {}, "s": "{}",
                             "p": "{}", "q": "1.0", "T": {}, "m": false }} }}"#,
            symbol.to_lowercase(),
            trade_time_ms,
            symbol,
            price,
            trade_time_ms,
        )
    }

    #[test]
    fn restore_cache_streams_in_event_order() {
        let (_dir, stream) = temp_stream();
        let now_ms = chrono::Utc::now().timestamp_millis();

        for (age_secs, price) in [(30, "101"), (20, "102"), (10, "103")] {
            let frame = trade_frame("BTCUSDT", now_ms - age_secs * 1000, price);
            stream
                .cache
                .add_item((now_ms - age_secs * 1000) / 1000, "trade", frame.as_bytes());
        }
        stream.cache.add_item(now_ms / 1000, "trade", b"corrupt");
        stream.cache.flush();

        let mut prices = Vec::new();
        stream.restore_cache(|trade| prices.push(trade.price));
        assert_eq!(prices, vec![101.0, 102.0, 103.0]);
    }
}
