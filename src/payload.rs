// =============================================================================
// Outbound snapshot payloads
// =============================================================================
//
// The wire format is flat: per-bucket values are spread into keys like
// `l_5`, `vwap_5m`, `nv_60`, `rsi_900`. Rather than assembling a loose map,
// the entry is a typed struct with an explicit bucket enumeration and a
// single manual Serialize impl that emits the flat keys.
//
// Trade-derived values are only exported once the tracker has seen at least
// one trade; NaN RSI values are omitted entirely.
// =============================================================================

use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::tracker::{round8, TickerTracker, BUCKETS};

// ---------------------------------------------------------------------------
// Nested percent blocks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PriceChangePct {
    #[serde(rename = "1m")]
    pub m1: f64,
    #[serde(rename = "5m")]
    pub m5: f64,
    #[serde(rename = "10m")]
    pub m10: f64,
    #[serde(rename = "15m")]
    pub m15: f64,
    #[serde(rename = "1h")]
    pub h1: f64,
    #[serde(rename = "24h")]
    pub h24: f64,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct VolumeChangePct {
    #[serde(rename = "1m")]
    pub m1: f64,
    #[serde(rename = "2m")]
    pub m2: f64,
    #[serde(rename = "3m")]
    pub m3: f64,
    /// Legacy key: no 4-minute bucket exists, the value is always zero.
    #[serde(rename = "4m")]
    pub m4: f64,
    #[serde(rename = "5m")]
    pub m5: f64,
    #[serde(rename = "10m")]
    pub m10: f64,
    #[serde(rename = "15m")]
    pub m15: f64,
    #[serde(rename = "1h")]
    pub h1: f64,
}

// ---------------------------------------------------------------------------
// Complete entry
// ---------------------------------------------------------------------------

/// Per-bucket values carried by a complete entry, in `BUCKETS` order.
#[derive(Debug, Clone, Default)]
pub struct BucketValues {
    pub bucket: i64,
    pub low: f64,
    pub high: f64,
    pub range: f64,
    pub range_percent: f64,
    pub vwap: f64,
    pub total_volume: f64,
    pub net_volume: f64,
    pub buy_volume: f64,
    pub sell_volume: f64,
    pub rsi: f64,
}

/// The full per-symbol snapshot entry sent to `/ws/binance/live` and
/// `/ws/binance/symbol` clients.
#[derive(Debug, Clone)]
pub struct CompleteEntry {
    pub symbol: String,
    pub close: f64,
    pub bid: f64,
    pub ask: f64,
    pub high: f64,
    pub low: f64,
    pub volume: f64,
    pub price_change_pct: PriceChangePct,
    pub volume_change_pct: VolumeChangePct,
    pub timestamp: String,
    pub buckets: Vec<BucketValues>,
    pub r_24: f64,
    pub rp_24: f64,
    pub have_vwap: bool,
    pub have_total_volume: bool,
    pub have_net_volume: bool,
}

impl CompleteEntry {
    /// Build an entry from a tracker. Returns `None` until the tracker has
    /// seen its first tick.
    pub fn from_tracker(tracker: &TickerTracker) -> Option<Self> {
        let last = tracker.last_tick()?;

        let metric = |bucket: i64| tracker.metrics.get(&bucket).cloned().unwrap_or_default();

        let buckets = BUCKETS
            .iter()
            .map(|&bucket| {
                let m = metric(bucket);
                BucketValues {
                    bucket,
                    low: m.low,
                    high: m.high,
                    range: m.range,
                    range_percent: m.range_percent,
                    vwap: m.vwap,
                    total_volume: m.total_volume,
                    net_volume: m.net_volume,
                    buy_volume: m.buy_volume,
                    sell_volume: m.sell_volume,
                    rsi: m.rsi,
                }
            })
            .collect();

        Some(Self {
            symbol: tracker.symbol.clone(),
            close: last.current_day_close,
            bid: last.bid,
            ask: last.ask,
            high: last.high_price,
            low: last.low_price,
            volume: last.total_quote_volume,
            price_change_pct: PriceChangePct {
                m1: metric(1).price_change_percent,
                m5: metric(5).price_change_percent,
                m10: metric(10).price_change_percent,
                m15: metric(15).price_change_percent,
                h1: metric(60).price_change_percent,
                h24: last.price_change_percent,
            },
            volume_change_pct: VolumeChangePct {
                m1: metric(1).volume_change_percent,
                m2: metric(2).volume_change_percent,
                m3: metric(3).volume_change_percent,
                m4: 0.0,
                m5: metric(5).volume_change_percent,
                m10: metric(10).volume_change_percent,
                m15: metric(15).volume_change_percent,
                h1: metric(60).volume_change_percent,
            },
            timestamp: timestamp_rfc3339(last.timestamp_ms()),
            buckets,
            r_24: tracker.h24_metrics.range,
            rp_24: tracker.h24_metrics.range_percent,
            have_vwap: tracker.have_vwap,
            have_total_volume: tracker.have_total_volume,
            have_net_volume: tracker.have_net_volume,
        })
    }
}

impl Serialize for CompleteEntry {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(None)?;

        map.serialize_entry("symbol", &self.symbol)?;
        map.serialize_entry("close", &self.close)?;
        map.serialize_entry("bid", &self.bid)?;
        map.serialize_entry("ask", &self.ask)?;
        map.serialize_entry("high", &self.high)?;
        map.serialize_entry("low", &self.low)?;
        map.serialize_entry("volume", &self.volume)?;
        map.serialize_entry("price_change_pct", &self.price_change_pct)?;
        map.serialize_entry("volume_change_pct", &self.volume_change_pct)?;
        map.serialize_entry("timestamp", &self.timestamp)?;

        for values in &self.buckets {
            let k = values.bucket;
            map.serialize_entry(&format!("l_{k}"), &values.low)?;
            map.serialize_entry(&format!("h_{k}"), &values.high)?;
            map.serialize_entry(&format!("r_{k}"), &values.range)?;
            map.serialize_entry(&format!("rp_{k}"), &values.range_percent)?;
        }

        map.serialize_entry("r_24", &self.r_24)?;
        map.serialize_entry("rp_24", &self.rp_24)?;

        if self.have_vwap {
            for values in &self.buckets {
                map.serialize_entry(
                    &format!("vwap_{}m", values.bucket),
                    &round8(values.vwap),
                )?;
            }
        }

        if self.have_total_volume {
            for values in &self.buckets {
                map.serialize_entry(
                    &format!("total_volume_{}", values.bucket),
                    &round8(values.total_volume),
                )?;
            }
        }

        if self.have_net_volume {
            for values in &self.buckets {
                let k = values.bucket;
                map.serialize_entry(&format!("nv_{k}"), &round8(values.net_volume))?;
                map.serialize_entry(&format!("bv_{k}"), &round8(values.buy_volume))?;
                map.serialize_entry(&format!("sv_{k}"), &round8(values.sell_volume))?;
            }
        }

        for values in &self.buckets {
            if !values.rsi.is_nan() {
                map.serialize_entry(&format!("rsi_{}", values.bucket * 60), &round8(values.rsi))?;
            }
        }

        map.end()
    }
}

// ---------------------------------------------------------------------------
// Monitor entry
// ---------------------------------------------------------------------------

/// Reduced snapshot entry for `/ws/binance/monitor` clients: no bucket
/// arrays, no VWAP or volume breakdowns, no RSI.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MonitorEntry {
    pub symbol: String,
    pub close: f64,
    pub bid: f64,
    pub ask: f64,
    pub high: f64,
    pub low: f64,
    pub volume: f64,
    pub price_change_pct: PriceChangePct,
    pub volume_change_pct: VolumeChangePct,
    pub timestamp: String,
}

impl MonitorEntry {
    pub fn from_tracker(tracker: &TickerTracker) -> Option<Self> {
        let last = tracker.last_tick()?;
        let metric = |bucket: i64| tracker.metrics.get(&bucket).cloned().unwrap_or_default();

        Some(Self {
            symbol: tracker.symbol.clone(),
            close: last.current_day_close,
            bid: last.bid,
            ask: last.ask,
            high: last.high_price,
            low: last.low_price,
            volume: last.total_quote_volume,
            price_change_pct: PriceChangePct {
                m1: metric(1).price_change_percent,
                m5: metric(5).price_change_percent,
                m10: metric(10).price_change_percent,
                m15: metric(15).price_change_percent,
                h1: metric(60).price_change_percent,
                h24: last.price_change_percent,
            },
            volume_change_pct: VolumeChangePct {
                m1: metric(1).volume_change_percent,
                m2: metric(2).volume_change_percent,
                m3: metric(3).volume_change_percent,
                m4: 0.0,
                m5: metric(5).volume_change_percent,
                m10: metric(10).volume_change_percent,
                m15: metric(15).volume_change_percent,
                h1: metric(60).volume_change_percent,
            },
            timestamp: timestamp_rfc3339(last.timestamp_ms()),
        })
    }
}

fn timestamp_rfc3339(ts_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ts_ms)
        .unwrap_or_default()
        .to_rfc3339()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AggTrade, TickerSummary};

    fn tracker_with_data(with_trades: bool) -> TickerTracker {
        let mut tracker = TickerTracker::new("BTCUSDT");
        let now = 1_700_000_040_000;

        if with_trades {
            tracker.add_trade(AggTrade {
                symbol: "BTCUSDT".into(),
                event_time: now - 10_000,
                trade_time: now - 10_000,
                price: 100.0,
                quantity: 2.0,
                buyer_maker: false,
            });
        }

        for (offset, close) in [(-70_000_i64, 99.0), (0, 100.0)] {
            tracker.update(TickerSummary {
                symbol: "BTCUSDT".into(),
                event_time: now + offset,
                current_day_close: close,
                bid: close - 0.5,
                ask: close + 0.5,
                high_price: 110.0,
                low_price: 90.0,
                total_quote_volume: 5000.0,
                price_change_percent: 2.5,
            });
        }

        tracker.recalculate_at(now);
        tracker
    }

    #[test]
    fn complete_entry_emits_flat_bucket_keys() {
        let tracker = tracker_with_data(true);
        let entry = CompleteEntry::from_tracker(&tracker).expect("entry");
        let json = serde_json::to_value(&entry).unwrap();

        assert_eq!(json["symbol"], "BTCUSDT");
        assert_eq!(json["close"], 100.0);
        for bucket in BUCKETS {
            assert!(json.get(format!("l_{bucket}")).is_some());
            assert!(json.get(format!("h_{bucket}")).is_some());
            assert!(json.get(format!("r_{bucket}")).is_some());
            assert!(json.get(format!("rp_{bucket}")).is_some());
            assert!(json.get(format!("vwap_{bucket}m")).is_some());
            assert!(json.get(format!("total_volume_{bucket}")).is_some());
            assert!(json.get(format!("nv_{bucket}")).is_some());
        }
        assert!(json.get("r_24").is_some());
        assert!(json.get("rp_24").is_some());
        assert_eq!(json["price_change_pct"]["24h"], 2.5);
        assert_eq!(json["volume_change_pct"]["4m"], 0.0);
    }

    #[test]
    fn trade_derived_keys_absent_without_trades() {
        let tracker = tracker_with_data(false);
        let entry = CompleteEntry::from_tracker(&tracker).expect("entry");
        let json = serde_json::to_value(&entry).unwrap();

        assert!(json.get("vwap_1m").is_none());
        assert!(json.get("total_volume_1").is_none());
        assert!(json.get("nv_1").is_none());
        // Tick-derived keys remain.
        assert!(json.get("l_1").is_some());
    }

    #[test]
    fn nan_rsi_is_filtered() {
        let tracker = tracker_with_data(true);
        // A single trade yields a flat close series: RSI is NaN everywhere.
        let entry = CompleteEntry::from_tracker(&tracker).expect("entry");
        assert!(entry.buckets.iter().all(|b| b.rsi.is_nan()));
        let json = serde_json::to_string(&entry).unwrap();
        assert!(!json.contains("rsi_"));
        assert!(!json.contains("NaN"));
    }

    #[test]
    fn empty_tracker_yields_no_entry() {
        let tracker = TickerTracker::new("BTCUSDT");
        assert!(CompleteEntry::from_tracker(&tracker).is_none());
        assert!(MonitorEntry::from_tracker(&tracker).is_none());
    }

    #[test]
    fn monitor_entry_is_plain() {
        let tracker = tracker_with_data(true);
        let entry = MonitorEntry::from_tracker(&tracker).expect("entry");
        let json = serde_json::to_value(&entry).unwrap();

        assert_eq!(json["symbol"], "BTCUSDT");
        assert!(json.get("l_1").is_none());
        assert!(json.get("vwap_1m").is_none());
        assert!(json["price_change_pct"].get("24h").is_some());
    }
}
