// =============================================================================
// Ticker tracker — per-symbol rolling-window analytics
// =============================================================================
//
// A tracker holds the raw tick and trade windows for one symbol and derives
// per-bucket metrics (price/volume change, high/low/range, VWAP, volume
// breakdowns, trade counts, RSI), minute-aligned OHLC rollups at several
// intervals, and a 60-minute volume histogram.
//
// Windows: ticks are kept for 60 minutes + 1 second, trades for 210 minutes.
// Aggs[1] is the authority; higher intervals are pure rollups of its bars,
// with gap-fill bars carrying the previous close so every interval's series
// is contiguous in k-minute steps.
//
// Trackers are not internally locked; the registry wraps each one in a mutex
// so the runner's worker pool can update different symbols in parallel.
// =============================================================================

pub mod histogram;
pub mod registry;

use std::collections::{HashMap, VecDeque};

use tracing::warn;

use crate::types::{AggTrade, TickerSummary};

use histogram::VolumeHistogram;

/// Rolling-window sizes in minutes. Bucket 1 also drives the base OHLC bars.
pub const BUCKETS: [i64; 7] = [1, 2, 3, 5, 10, 15, 60];

const MINUTE_MS: i64 = 60_000;

/// Ticks are evicted once the window spans more than 60 minutes + 1 second.
const TICK_WINDOW_MS: i64 = 60 * MINUTE_MS + 1000;

/// Trades are pruned once strictly older than 210 minutes.
const TRADE_WINDOW_MS: i64 = 210 * MINUTE_MS;

const RSI_PERIOD: usize = 14;

// ---------------------------------------------------------------------------
// Rounding helpers
// ---------------------------------------------------------------------------

/// Round to 8 decimal places; non-finite results collapse to 0.
pub fn round8(val: f64) -> f64 {
    let out = (val * 1e8).round() / 1e8;
    if out.is_finite() {
        out
    } else {
        0.0
    }
}

/// Round to 3 decimal places; non-finite results collapse to 0.
pub fn round3(val: f64) -> f64 {
    let out = (val * 1e3).round() / 1e3;
    if out.is_finite() {
        out
    } else {
        0.0
    }
}

// ---------------------------------------------------------------------------
// Aggregate bar and per-bucket metrics
// ---------------------------------------------------------------------------

/// Minute-aligned OHLC bar. `open_time` is the first moment of the period,
/// floored to the owning interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aggregate {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

#[derive(Debug, Clone, Default)]
pub struct TickerMetrics {
    pub price_change_percent: f64,
    pub volume_change_percent: f64,
    pub high: f64,
    pub low: f64,
    pub range: f64,
    pub range_percent: f64,

    // Require trades.
    pub vwap: f64,
    pub total_volume: f64,
    pub net_volume: f64,
    pub buy_volume: f64,
    pub sell_volume: f64,
    pub rsi: f64,
    pub total_trades: u64,
    pub sell_trades: u64,
    pub buy_trades: u64,
}

// ---------------------------------------------------------------------------
// TickerTracker
// ---------------------------------------------------------------------------

pub struct TickerTracker {
    pub symbol: String,
    pub ticks: VecDeque<TickerSummary>,
    pub trades: VecDeque<AggTrade>,
    pub metrics: HashMap<i64, TickerMetrics>,
    pub h24_metrics: TickerMetrics,
    pub aggs: HashMap<i64, Vec<Aggregate>>,
    pub histogram: VolumeHistogram,

    /// Wall-clock time of the last tick update, in milliseconds.
    pub last_update: i64,

    pub have_vwap: bool,
    pub have_total_volume: bool,
    pub have_net_volume: bool,
}

impl TickerTracker {
    pub fn new(symbol: impl Into<String>) -> Self {
        let mut metrics = HashMap::new();
        for bucket in BUCKETS {
            metrics.insert(bucket, TickerMetrics::default());
        }

        Self {
            symbol: symbol.into(),
            ticks: VecDeque::new(),
            trades: VecDeque::new(),
            metrics,
            h24_metrics: TickerMetrics::default(),
            aggs: HashMap::new(),
            histogram: VolumeHistogram::default(),
            last_update: 0,
            have_vwap: false,
            have_total_volume: false,
            have_net_volume: false,
        }
    }

    pub fn last_tick(&self) -> Option<&TickerSummary> {
        self.ticks.back()
    }

    // -----------------------------------------------------------------------
    // Ingest
    // -----------------------------------------------------------------------

    /// Append a tick and evict the head while the window exceeds
    /// 60 minutes + 1 second, measured in event time.
    pub fn update(&mut self, ticker: TickerSummary) {
        self.last_update = chrono::Utc::now().timestamp_millis();
        let now = ticker.timestamp_ms();
        self.ticks.push_back(ticker);

        while let Some(first) = self.ticks.front() {
            if now - first.timestamp_ms() > TICK_WINDOW_MS {
                self.ticks.pop_front();
            } else {
                break;
            }
        }
    }

    /// Append a trade and fold it into the OHLC series at every interval.
    pub fn add_trade(&mut self, trade: AggTrade) {
        if trade.symbol.is_empty() {
            warn!("not adding trade with empty symbol");
            return;
        }

        if let Some(last) = self.trades.back() {
            if trade.timestamp_ms() < last.timestamp_ms() {
                warn!(symbol = %self.symbol, "received trade older than previous trade");
            }
        }

        let price = trade.price;
        let open_time = floor_time(trade.timestamp_ms(), MINUTE_MS);
        self.trades.push_back(trade);

        // Base 1-minute series.
        let aggs1 = self.aggs.entry(1).or_default();
        match aggs1.last().copied() {
            None => {
                aggs1.push(Aggregate {
                    open_time,
                    open: price,
                    high: price,
                    low: price,
                    close: price,
                });
            }
            Some(tail) if tail.open_time == open_time => {
                let tail = aggs1.last_mut().expect("aggs[1] is non-empty");
                tail.close = price;
                if price > tail.high {
                    tail.high = price;
                }
                if price < tail.low {
                    tail.low = price;
                }
            }
            Some(tail) => {
                let carry = tail.close;
                let mut next_time = tail.open_time + MINUTE_MS;
                while next_time < open_time {
                    aggs1.push(Aggregate {
                        open_time: next_time,
                        open: carry,
                        high: carry,
                        low: carry,
                        close: carry,
                    });
                    next_time += MINUTE_MS;
                }
                aggs1.push(Aggregate {
                    open_time,
                    open: carry,
                    high: price,
                    low: price,
                    close: price,
                });
            }
        }

        let m1 = *aggs1.last().expect("aggs[1] is non-empty after append");

        // Roll the fresh 1-minute bar up into every higher interval.
        for &interval in &BUCKETS[1..] {
            let step = interval * MINUTE_MS;
            let open_time_k = floor_time(m1.open_time, step);
            let aggs = self.aggs.entry(interval).or_default();

            match aggs.last().copied() {
                None => {
                    aggs.push(Aggregate {
                        open_time: open_time_k,
                        open: m1.open,
                        high: m1.high,
                        low: m1.low,
                        close: m1.close,
                    });
                }
                Some(tail) if tail.open_time == open_time_k => {
                    let tail = aggs.last_mut().expect("aggs is non-empty");
                    tail.close = m1.close;
                    if m1.close > tail.high {
                        tail.high = m1.close;
                    }
                    if m1.close < tail.low {
                        tail.low = m1.close;
                    }
                }
                Some(tail) => {
                    let carry = tail.close;
                    let mut next_time = tail.open_time + step;
                    while next_time < open_time_k {
                        aggs.push(Aggregate {
                            open_time: next_time,
                            open: carry,
                            high: carry,
                            low: carry,
                            close: carry,
                        });
                        next_time += step;
                    }
                    aggs.push(Aggregate {
                        open_time: open_time_k,
                        open: carry,
                        high: m1.high,
                        low: m1.low,
                        close: m1.close,
                    });
                }
            }
        }
    }

    /// Drop the leading trades strictly older than 210 minutes. A trade aged
    /// exactly 210 minutes stays in the window.
    pub fn prune_trades(&mut self, now_ms: i64) {
        while let Some(trade) = self.trades.front() {
            if now_ms - trade.timestamp_ms() > TRADE_WINDOW_MS {
                self.trades.pop_front();
            } else {
                break;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Derived metrics
    // -----------------------------------------------------------------------

    /// Recompute every derived metric against the wall clock.
    pub fn recalculate(&mut self) {
        self.recalculate_at(chrono::Utc::now().timestamp_millis());
    }

    /// Deterministic recompute used by tests.
    pub fn recalculate_at(&mut self, now_ms: i64) {
        // Buckets whose source window produced no samples must read as zero.
        for bucket in BUCKETS {
            self.metrics.insert(bucket, TickerMetrics::default());
        }

        self.calculate_trades(now_ms);
        self.calculate_ticks(now_ms);

        for bucket in BUCKETS {
            let rsi = rsi14(self.aggs.get(&bucket).map_or(&[][..], |a| &a[..]));
            if let Some(metrics) = self.metrics.get_mut(&bucket) {
                metrics.rsi = rsi;
            }
        }
    }

    /// Walk the tick window backward from the newest tick, filling each
    /// bucket's price/volume change and the running high/low of the window
    /// that starts at that tick and ends now.
    fn calculate_ticks(&mut self, now_ms: i64) {
        let count = self.ticks.len();
        if count < 2 {
            return;
        }
        let last = self.ticks[count - 1].clone();

        let mut low = last.current_day_close;
        let mut high = last.current_day_close;

        for i in (0..count - 1).rev() {
            let tick = &self.ticks[i];
            let age_secs = (now_ms - tick.timestamp_ms()) / 1000;
            let bucket = age_secs / 60 + 1;

            if tick.current_day_close < low {
                low = tick.current_day_close;
            }
            if tick.current_day_close > high {
                high = tick.current_day_close;
            }

            let Some(metrics) = self.metrics.get_mut(&bucket) else {
                continue;
            };

            if tick.current_day_close > 0.0 {
                let price_change = last.current_day_close - tick.current_day_close;
                metrics.price_change_percent =
                    round3(price_change / tick.current_day_close * 100.0);
            } else {
                metrics.price_change_percent = 0.0;
            }

            // Volume rate of change.
            if tick.total_quote_volume > 0.0 {
                let volume_change = last.total_quote_volume - tick.total_quote_volume;
                metrics.volume_change_percent =
                    round3(volume_change / tick.total_quote_volume * 100.0);
            } else {
                metrics.volume_change_percent = 0.0;
            }

            metrics.high = high;
            metrics.low = low;
            metrics.range = round8(high - low);
            if low > 0.0 {
                metrics.range_percent = round3(metrics.range / low * 100.0);
            } else if high > 0.0 {
                metrics.range_percent = 100.0;
            } else {
                metrics.range_percent = 0.0;
            }
        }

        // 24-hour band comes straight off the newest tick.
        self.h24_metrics.high = last.high_price;
        self.h24_metrics.low = last.low_price;
        self.h24_metrics.range = round8(last.high_price - last.low_price);
        self.h24_metrics.range_percent = round3(self.h24_metrics.range / last.low_price * 100.0);

        // 24h-volume series: one slot per minute of age, carrying the
        // youngest tick's rolling quote volume for that minute.
        let mut volume24: Vec<f64> = Vec::new();
        for i in (0..count).rev() {
            let tick = &self.ticks[i];
            let age = (now_ms - tick.timestamp_ms()) / MINUTE_MS;
            if age > 59 {
                break;
            }
            if age < 0 {
                continue;
            }
            let age = age as usize;
            while age > volume24.len() {
                volume24.push(0.0);
            }
            if age == volume24.len() {
                volume24.push(tick.total_quote_volume);
            }
        }
        self.histogram.volume24 = volume24;
    }

    /// Walk the trade window backward from the newest trade, accumulating
    /// VWAP and volume totals. Each trade overwrites its bucket with the
    /// running totals, so a bucket ends up holding the accumulation from now
    /// back to the oldest trade that maps into it.
    fn calculate_trades(&mut self, now_ms: i64) {
        self.prune_trades(now_ms);

        let mut hist = VolumeHistogram::default();
        hist.volume24 = std::mem::take(&mut self.histogram.volume24);

        if self.trades.is_empty() {
            self.histogram = hist;
            return;
        }

        self.have_net_volume = true;
        self.have_total_volume = true;
        self.have_vwap = true;

        let mut vwap_price = 0.0;
        let mut vwap_volume = 0.0;
        let mut buy_volume = 0.0;
        let mut sell_volume = 0.0;
        let mut total_trades: u64 = 0;
        let mut sell_trades: u64 = 0;
        let mut buy_trades: u64 = 0;

        for i in (0..self.trades.len()).rev() {
            let trade = &self.trades[i];
            let age_secs = (now_ms - trade.timestamp_ms()) / 1000;

            if trade.buyer_maker {
                sell_volume += trade.quote_quantity();
                sell_trades += 1;
            } else {
                buy_volume += trade.quote_quantity();
                buy_trades += 1;
            }
            total_trades += 1;

            vwap_volume += trade.quantity;
            vwap_price += trade.quantity * trade.price;
            let vwap = vwap_price / vwap_volume;

            hist.add_trade(trade, now_ms);

            let bucket = age_secs / 60 + 1;
            let Some(metrics) = self.metrics.get_mut(&bucket) else {
                continue;
            };

            metrics.net_volume = buy_volume - sell_volume;
            metrics.total_volume = buy_volume + sell_volume;
            metrics.buy_volume = buy_volume;
            metrics.sell_volume = sell_volume;
            metrics.vwap = vwap;
            metrics.total_trades = total_trades;
            metrics.buy_trades = buy_trades;
            metrics.sell_trades = sell_trades;
        }

        self.histogram = hist;
    }
}

/// Floor a millisecond timestamp to a multiple of `step_ms`.
fn floor_time(ts_ms: i64, step_ms: i64) -> i64 {
    ts_ms - ts_ms.rem_euclid(step_ms)
}

// ---------------------------------------------------------------------------
// RSI
// ---------------------------------------------------------------------------

/// Wilder RSI(14) over a bar series' closes.
///
/// The average gain/loss is seeded with the simple mean over the first 14
/// elements, then smoothed with `avg = (prev * 13 + new) / 14`. An empty
/// series yields 0. A series with no losses yields 100; one with neither
/// gains nor losses yields NaN, which payload emission filters out.
pub fn rsi14(aggs: &[Aggregate]) -> f64 {
    if aggs.is_empty() {
        return 0.0;
    }

    let mut gains = 0.0_f64;
    let mut losses = 0.0_f64;
    let mut prev = aggs[0];

    for (i, bar) in aggs.iter().enumerate() {
        if i < RSI_PERIOD {
            if bar.close < prev.close {
                losses += prev.close - bar.close;
            } else if bar.close > prev.close {
                gains += bar.close - prev.close;
            }
            if i == RSI_PERIOD - 1 {
                gains /= RSI_PERIOD as f64;
                losses /= RSI_PERIOD as f64;
            }
        } else {
            let mut gain = 0.0;
            let mut loss = 0.0;
            if bar.close < prev.close {
                loss = prev.close - bar.close;
            } else if bar.close > prev.close {
                gain = bar.close - prev.close;
            }
            losses = (losses * 13.0 + loss) / 14.0;
            gains = (gains * 13.0 + gain) / 14.0;
        }
        prev = *bar;
    }

    let rs = gains / losses;
    100.0 - (100.0 / (1.0 + rs))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
