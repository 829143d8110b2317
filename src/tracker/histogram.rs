// =============================================================================
// Per-minute volume histogram — 60 buckets keyed by trade age
// =============================================================================

use serde::Serialize;

use crate::types::AggTrade;

/// Number of minute buckets tracked.
pub const HISTOGRAM_BUCKETS: usize = 60;

const MINUTE_MS: i64 = 60_000;

/// Trade-derived minute histogram for one symbol. Bucket 0 is the current
/// minute; trades older than 60 minutes are ignored. `volume24` is built
/// from the tick series instead and may hold fewer than 60 entries.
#[derive(Debug, Clone, Serialize)]
pub struct VolumeHistogram {
    pub trade_count: Vec<u64>,
    pub sell_trade_count: Vec<u64>,
    pub buy_trade_count: Vec<u64>,
    pub volume: Vec<f64>,
    pub sell_volume: Vec<f64>,
    pub buy_volume: Vec<f64>,
    pub net_volume: Vec<f64>,
    pub volume24: Vec<f64>,
}

impl Default for VolumeHistogram {
    fn default() -> Self {
        Self {
            trade_count: vec![0; HISTOGRAM_BUCKETS],
            sell_trade_count: vec![0; HISTOGRAM_BUCKETS],
            buy_trade_count: vec![0; HISTOGRAM_BUCKETS],
            volume: vec![0.0; HISTOGRAM_BUCKETS],
            sell_volume: vec![0.0; HISTOGRAM_BUCKETS],
            buy_volume: vec![0.0; HISTOGRAM_BUCKETS],
            net_volume: vec![0.0; HISTOGRAM_BUCKETS],
            volume24: Vec::new(),
        }
    }
}

impl VolumeHistogram {
    /// Account one trade by its integer minute age relative to `now_ms`.
    /// Trades outside the 60-minute horizon (or from the future) are skipped.
    pub fn add_trade(&mut self, trade: &AggTrade, now_ms: i64) {
        let age_minutes = (now_ms - trade.timestamp_ms()) / MINUTE_MS;
        if !(0..HISTOGRAM_BUCKETS as i64).contains(&age_minutes) {
            return;
        }
        let bucket = age_minutes as usize;
        let quote = trade.quote_quantity();

        self.trade_count[bucket] += 1;
        self.volume[bucket] += quote;

        if trade.buyer_maker {
            self.sell_volume[bucket] += quote;
            self.sell_trade_count[bucket] += 1;
        } else {
            self.buy_volume[bucket] += quote;
            self.buy_trade_count[bucket] += 1;
        }
        self.net_volume[bucket] = self.buy_volume[bucket] - self.sell_volume[bucket];
    }

    /// Zero every trade-derived series, leaving `volume24` alone.
    pub fn reset_trade_series(&mut self) {
        self.trade_count = vec![0; HISTOGRAM_BUCKETS];
        self.sell_trade_count = vec![0; HISTOGRAM_BUCKETS];
        self.buy_trade_count = vec![0; HISTOGRAM_BUCKETS];
        self.volume = vec![0.0; HISTOGRAM_BUCKETS];
        self.sell_volume = vec![0.0; HISTOGRAM_BUCKETS];
        self.buy_volume = vec![0.0; HISTOGRAM_BUCKETS];
        self.net_volume = vec![0.0; HISTOGRAM_BUCKETS];
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn trade(age_ms: i64, now_ms: i64, quote: f64, buyer_maker: bool) -> AggTrade {
        AggTrade {
            symbol: "BTCUSDT".into(),
            event_time: now_ms - age_ms,
            trade_time: now_ms - age_ms,
            price: quote,
            quantity: 1.0,
            buyer_maker,
        }
    }

    #[test]
    fn buckets_by_minute_age() {
        let now = 10_000_000_000;
        let mut hist = VolumeHistogram::default();

        hist.add_trade(&trade(0, now, 10.0, false), now);
        hist.add_trade(&trade(59_999, now, 20.0, true), now);
        hist.add_trade(&trade(60_000, now, 30.0, false), now);

        assert_eq!(hist.trade_count[0], 2);
        assert_eq!(hist.trade_count[1], 1);
        assert!((hist.volume[0] - 30.0).abs() < 1e-9);
        assert!((hist.buy_volume[0] - 10.0).abs() < 1e-9);
        assert!((hist.sell_volume[0] - 20.0).abs() < 1e-9);
        assert!((hist.net_volume[0] + 10.0).abs() < 1e-9);
        assert!((hist.buy_volume[1] - 30.0).abs() < 1e-9);
    }

    #[test]
    fn trades_past_horizon_are_skipped() {
        let now = 10_000_000_000;
        let mut hist = VolumeHistogram::default();

        hist.add_trade(&trade(60 * 60_000, now, 10.0, false), now);
        hist.add_trade(&trade(-5_000, now, 10.0, false), now); // future

        assert!(hist.trade_count.iter().all(|&c| c == 0));
    }

    #[test]
    fn reset_leaves_volume24_alone() {
        let now = 10_000_000_000;
        let mut hist = VolumeHistogram::default();
        hist.add_trade(&trade(0, now, 10.0, false), now);
        hist.volume24 = vec![1.0, 2.0];

        hist.reset_trade_series();
        assert_eq!(hist.trade_count[0], 0);
        assert_eq!(hist.volume24, vec![1.0, 2.0]);
    }
}
