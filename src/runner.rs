// =============================================================================
// Runner — wires feeds, cache warm-up, trackers, and publication
// =============================================================================
//
// Startup ordering matters: the trade subscription is taken before the cache
// replay starts, so live trades queue in the dispatcher's channel + backlog
// while warm-up runs, and every cached trade is applied before the first live
// one. Ticker warm-up replays cached batches through the same parallel
// worker pool used in steady state (without recalculation).
//
// Steady state is a single select loop: whichever feed fires first is folded
// into the trackers. Ticker batches additionally trigger a recompute, the
// per-symbol pushes, and the all-symbols snapshot signal.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::binance::ticker::{TickerBatch, TickerStream};
use crate::binance::trade::TradeStream;
use crate::bus::FanoutBus;
use crate::payload::CompleteEntry;
use crate::tracker::registry::TrackerRegistry;
use crate::types::TickerSummary;

/// Per-symbol push channels hold this many entries before the backlog queue
/// takes over.
const SYMBOL_CHANNEL_CAPACITY: usize = 16;

/// Cap on a symbol subscriber's backlog; beyond this the oldest entry drops.
const SYMBOL_MAX_BACKLOG: usize = 256;

pub struct Runner {
    registry: Arc<TrackerRegistry>,
    trade_stream: Arc<TradeStream>,
    ticker_stream: Arc<TickerStream>,

    symbol_buses: RwLock<HashMap<String, Arc<FanoutBus<Arc<CompleteEntry>>>>>,

    /// All-symbols snapshot subscribers: 1-buffered signal channels, new
    /// signals dropped on contention.
    snapshot_subs: Mutex<HashMap<u64, mpsc::Sender<()>>>,
    next_snapshot_id: AtomicU64,
}

impl Runner {
    pub fn new(
        registry: Arc<TrackerRegistry>,
        trade_stream: Arc<TradeStream>,
        ticker_stream: Arc<TickerStream>,
    ) -> Self {
        Self {
            registry,
            trade_stream,
            ticker_stream,
            symbol_buses: RwLock::new(HashMap::new()),
            snapshot_subs: Mutex::new(HashMap::new()),
            next_snapshot_id: AtomicU64::new(1),
        }
    }

    pub fn registry(&self) -> &Arc<TrackerRegistry> {
        &self.registry
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    /// Subscribe to the all-symbols snapshot signal. The channel holds one
    /// pending signal; further signals are dropped until it is drained.
    pub fn subscribe(&self) -> (u64, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(1);
        let id = self.next_snapshot_id.fetch_add(1, Ordering::Relaxed);
        self.snapshot_subs.lock().insert(id, tx);
        (id, rx)
    }

    pub fn unsubscribe(&self, id: u64) {
        self.snapshot_subs.lock().remove(&id);
    }

    /// Subscribe to complete entries for a single symbol.
    pub fn subscribe_symbol(&self, symbol: &str) -> (u64, mpsc::Receiver<Arc<CompleteEntry>>) {
        let bus = {
            let mut buses = self.symbol_buses.write();
            buses
                .entry(symbol.to_string())
                .or_insert_with(|| {
                    Arc::new(
                        FanoutBus::new(format!("symbol.{symbol}"), SYMBOL_CHANNEL_CAPACITY)
                            .with_max_backlog(SYMBOL_MAX_BACKLOG),
                    )
                })
                .clone()
        };
        bus.subscribe()
    }

    pub fn unsubscribe_symbol(&self, symbol: &str, id: u64) {
        if let Some(bus) = self.symbol_buses.read().get(symbol) {
            bus.unsubscribe(id);
        }
    }

    fn publish_snapshot_signal(&self) {
        for tx in self.snapshot_subs.lock().values() {
            // A full channel means the subscriber still has a pending
            // signal; dropping this one is fine.
            let _ = tx.try_send(());
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Run the coordinator forever: spawn the feeds, replay the disk cache,
    /// then enter the steady-state select loop.
    pub async fn run(self: Arc<Self>) {
        // Trade feed first; subscribing before the replay starts lets live
        // trades queue while warm-up runs.
        tokio::spawn(self.trade_stream.clone().run());
        let (_trade_sub, mut trade_rx) = self.trade_stream.subscribe();

        let trade_warmup = {
            let this = self.clone();
            tokio::task::spawn_blocking(move || {
                info!("restoring trades from cache");
                let mut count: u64 = 0;
                this.trade_stream.restore_cache(|trade| {
                    if let Some(tracker) = this.registry.get(&trade.symbol) {
                        tracker.lock().add_trade(trade);
                        count += 1;
                    }
                });
                info!(count, "restored trades from cache");
            })
        };

        tokio::spawn(self.ticker_stream.clone().run());
        let (_ticker_sub, mut ticker_rx) = self.ticker_stream.subscribe();

        let ticker_warmup = {
            let this = self.clone();
            tokio::spawn(async move {
                info!("restoring ticks from cache");
                let loader = this.clone();
                let batches = tokio::task::spawn_blocking(move || loader.ticker_stream.load_cache())
                    .await
                    .unwrap_or_default();
                let mut count: u64 = 0;
                for batch in batches {
                    this.update_trackers(Arc::new(batch), false).await;
                    count += 1;
                }
                info!(count, "restored tick batches from cache");
            })
        };

        // Warm-up must be fully applied before any live message.
        if let Err(e) = trade_warmup.await {
            warn!(error = %e, "trade warm-up task failed");
        }
        if let Err(e) = ticker_warmup.await {
            warn!(error = %e, "ticker warm-up task failed");
        }

        info!("warm-up complete, entering steady state");

        let mut trade_count: u64 = 0;
        let mut last_trade_time: i64 = 0;
        let mut last_publish: i64 = 0;

        loop {
            let loop_start = Instant::now();
            tokio::select! {
                trade = trade_rx.recv() => {
                    let Some(trade) = trade else { break };
                    let ts = trade.timestamp_ms();
                    if let Some(tracker) = self.registry.get(&trade.symbol) {
                        tracker.lock().add_trade(trade);
                        if ts > last_trade_time {
                            last_trade_time = ts;
                        }
                        trade_count += 1;
                    }
                }

                batch = ticker_rx.recv() => {
                    let Some(batch) = batch else { break };
                    if batch.is_empty() {
                        continue;
                    }
                    let wait = loop_start.elapsed();

                    let last_server_ts = batch
                        .iter()
                        .map(|t| t.timestamp_ms())
                        .max()
                        .unwrap_or_default();

                    self.update_trackers(batch, true).await;

                    let published = self.publish_symbol_entries(last_publish);
                    last_publish = chrono::Utc::now().timestamp_millis();
                    self.publish_snapshot_signal();

                    let now_ms = last_publish;
                    let processing = loop_start.elapsed().saturating_sub(wait);
                    info!(
                        wait_ms = wait.as_millis() as u64,
                        processing_ms = processing.as_millis() as u64,
                        lag_ms = now_ms - last_server_ts,
                        trades = trade_count,
                        trade_lag_ms = now_ms - last_trade_time,
                        published,
                        "ticker batch processed"
                    );
                    trade_count = 0;
                }
            }
        }
    }

    /// Push a complete entry to every symbol subscriber whose tracker was
    /// updated since the last publish. Returns the number of entries pushed.
    fn publish_symbol_entries(&self, last_publish: i64) -> usize {
        let buses: Vec<(String, Arc<FanoutBus<Arc<CompleteEntry>>>)> = self
            .symbol_buses
            .read()
            .iter()
            .map(|(symbol, bus)| (symbol.clone(), bus.clone()))
            .collect();

        let mut published = 0;
        for (symbol, bus) in buses {
            if bus.subscriber_count() == 0 {
                continue;
            }
            let Some(tracker) = self.registry.peek(&symbol) else {
                continue;
            };
            let entry = {
                let tracker = tracker.lock();
                if tracker.last_update <= last_publish {
                    continue;
                }
                CompleteEntry::from_tracker(&tracker)
            };
            if let Some(entry) = entry {
                bus.publish(Arc::new(entry));
                published += 1;
            }
        }
        published
    }

    // -----------------------------------------------------------------------
    // Parallel ticker worker
    // -----------------------------------------------------------------------

    /// Fan a ticker batch out over one worker per CPU. Workers drain a shared
    /// channel and serialise per-symbol updates through the tracker mutex; a
    /// default (event_time == 0) sentinel per worker ends the batch.
    pub async fn update_trackers(&self, batch: TickerBatch, recalculate: bool) {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        let (tx, rx) = async_channel::bounded::<TickerSummary>(workers * 2);

        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let rx = rx.clone();
            let registry = self.registry.clone();
            handles.push(tokio::spawn(async move {
                while let Ok(ticker) = rx.recv().await {
                    if ticker.event_time == 0 {
                        break;
                    }
                    let Some(tracker) = registry.get(&ticker.symbol) else {
                        continue;
                    };
                    let mut tracker = tracker.lock();
                    tracker.update(ticker);
                    if recalculate {
                        tracker.recalculate();
                    }
                }
            }));
        }

        for ticker in batch.iter() {
            if tx.send(ticker.clone()).await.is_err() {
                break;
            }
        }
        for _ in 0..workers {
            let _ = tx.send(TickerSummary::default()).await;
        }

        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "ticker worker panicked");
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
    use crate::binance::rest::RestClient;
    use crate::cache::GenericCache;

    fn test_runner() -> (tempfile::TempDir, Arc<Runner>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("runner-test.sqlite");
        let cache = Arc::new(
            GenericCache::open_path("runner-test", path.to_str().unwrap(), 7200).unwrap(),
        );
        let runner = Arc::new(Runner::new(
            Arc::new(TrackerRegistry::new()),
            Arc::new(TradeStream::new(cache.clone(), RestClient::default(), 7200)),
            Arc::new(TickerStream::new(cache, 3600)),
        ));
        (dir, runner)
    }

    fn ticker(symbol: &str, event_time: i64, close: f64) -> TickerSummary {
        TickerSummary {
            symbol: symbol.into(),
            event_time,
            current_day_close: close,
            bid: close,
            ask: close,
            high_price: close,
            low_price: close,
            total_quote_volume: 1000.0,
            price_change_percent: 0.0,
        }
    }

    #[tokio::test]
    async fn worker_pool_applies_whole_batch() {
        let (_dir, runner) = test_runner();
        let now = chrono::Utc::now().timestamp_millis();

        let batch: Vec<TickerSummary> = (0..50)
            .map(|i| ticker(&format!("SYM{i}USDT"), now, 100.0 + i as f64))
            .collect();
        runner.update_trackers(Arc::new(batch), true).await;

        assert_eq!(runner.registry().len(), 50);
        let tracker = runner.registry().peek("SYM7USDT").unwrap();
        let tracker = tracker.lock();
        assert_eq!(tracker.ticks.len(), 1);
        assert_eq!(tracker.ticks[0].current_day_close, 107.0);
    }

    #[tokio::test]
    async fn sentinel_tickers_are_not_applied() {
        let (_dir, runner) = test_runner();
        let batch = vec![TickerSummary::default()];
        runner.update_trackers(Arc::new(batch), false).await;
        assert_eq!(runner.registry().len(), 0);
    }

    #[tokio::test]
    async fn symbol_subscribers_receive_fresh_entries() {
        let (_dir, runner) = test_runner();
        let now = chrono::Utc::now().timestamp_millis();

        let (_id, mut rx) = runner.subscribe_symbol("BTCUSDT");

        let batch = vec![ticker("BTCUSDT", now, 100.0), ticker("ETHUSDT", now, 50.0)];
        runner.update_trackers(Arc::new(batch), true).await;

        let published = runner.publish_symbol_entries(0);
        assert_eq!(published, 1);

        let entry = rx.recv().await.expect("entry");
        assert_eq!(entry.symbol, "BTCUSDT");
        assert_eq!(entry.close, 100.0);
    }

    #[tokio::test]
    async fn stale_trackers_are_not_republished() {
        let (_dir, runner) = test_runner();
        let now = chrono::Utc::now().timestamp_millis();

        let (_id, _rx) = runner.subscribe_symbol("BTCUSDT");
        let batch = vec![ticker("BTCUSDT", now, 100.0)];
        runner.update_trackers(Arc::new(batch), true).await;

        assert_eq!(runner.publish_symbol_entries(0), 1);
        // A publish floor in the future filters the unchanged tracker out.
        let future = chrono::Utc::now().timestamp_millis() + 1000;
        assert_eq!(runner.publish_symbol_entries(future), 0);
    }

    #[tokio::test]
    async fn snapshot_signal_drops_on_contention() {
        let (_dir, runner) = test_runner();
        let (_id, mut rx) = runner.subscribe();

        runner.publish_snapshot_signal();
        runner.publish_snapshot_signal();
        runner.publish_snapshot_signal();

        // Exactly one signal is pending.
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
